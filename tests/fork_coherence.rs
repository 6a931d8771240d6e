//! Resource forks under the three-file strategy: cache
//! reconciliation against the sidecar's clean record, write-back on
//! close, and the empty-fork rule.

mod common;

use common::Fixture;
use ninebridge::volume::{Fork, SeekMode, DOTDIR_NAME};

/// `data 'ABCD' (128, "hi") { ... }` compiled puts the body at 260.
const SIDECAR: &[u8] = b"data 'ABCD' (128, \"hi\") {\n\t$\"00 01 02 03\"\n};\n";

fn rezstat_path(fx: &Fixture, cnid: i32) -> String {
    let cache_dirs = fx
        .tree
        .lock()
        .unwrap()
        .list(&format!("{}/resforks", DOTDIR_NAME))
        .expect("cache parent");
    assert_eq!(cache_dirs.len(), 1);
    format!("{}/resforks/{}/{:08x}-rezstat", DOTDIR_NAME, cache_dirs[0], cnid as u32)
}

#[tokio::test]
async fn sidecar_text_reads_back_as_binary_fork() {
    let mut fx = Fixture::new(|fs| {
        fs.put_file("F", b"data fork");
        fs.put_file("F.rdump", SIDECAR);
    })
    .await;

    let refnum = fx.vol.open(2, b"F", Fork::Resource, false).await.expect("open rf");

    // The compiled image: header at 0, resource body at 260
    let mut head = [0u8; 16];
    let got = fx.vol.read(refnum, SeekMode::FromStart, 0, &mut head).await.unwrap();
    assert_eq!(got.actual, 16);
    assert_eq!(&head[0..4], &256u32.to_be_bytes());
    assert_eq!(&head[4..8], &264u32.to_be_bytes());
    assert_eq!(&head[8..12], &8u32.to_be_bytes());
    assert_eq!(&head[12..16], &53u32.to_be_bytes());

    let mut body = [0u8; 4];
    fx.vol.read(refnum, SeekMode::FromStart, 260, &mut body).await.unwrap();
    assert_eq!(body, [0, 1, 2, 3]);

    // The map begins at 264 with the zeroed header copy
    let mut map_head = [0u8; 30];
    fx.vol.read(refnum, SeekMode::FromStart, 264, &mut map_head).await.unwrap();
    assert_eq!(&map_head[24..26], &28u16.to_be_bytes());

    fx.vol.close(refnum).await.unwrap();
}

/// A complete one-resource fork image (`'ABCD' (128, "hi")`) whose
/// body is the caller's four bytes.
fn valid_image(body: [u8; 4]) -> Vec<u8> {
    let mut image = vec![0u8; 256];
    image[0..4].copy_from_slice(&256u32.to_be_bytes());
    image[4..8].copy_from_slice(&264u32.to_be_bytes());
    image[8..12].copy_from_slice(&8u32.to_be_bytes());
    image[12..16].copy_from_slice(&53u32.to_be_bytes());
    image.extend_from_slice(&4u32.to_be_bytes());
    image.extend_from_slice(&body);
    let mut map = vec![0u8; 24];
    map.extend_from_slice(&28u16.to_be_bytes());
    map.extend_from_slice(&50u16.to_be_bytes());
    map.extend_from_slice(&0u16.to_be_bytes());
    map.extend_from_slice(b"ABCD");
    map.extend_from_slice(&0u16.to_be_bytes());
    map.extend_from_slice(&10u16.to_be_bytes());
    map.extend_from_slice(&128i16.to_be_bytes());
    map.extend_from_slice(&0u16.to_be_bytes());
    map.extend_from_slice(&[0; 8]);
    map.extend_from_slice(b"\x02hi");
    image.extend_from_slice(&map);
    image
}

#[tokio::test]
async fn write_close_reopen_returns_written_bytes() {
    let mut fx = Fixture::new(|fs| {
        fs.put_file("F", b"");
        fs.put_file("F.rdump", SIDECAR);
    })
    .await;

    // Rewrite the whole fork with a new body, the way a resource
    // editor saves: a complete, valid image
    let refnum = fx.vol.open(2, b"F", Fork::Resource, true).await.unwrap();
    let image = valid_image(*b"XXXX");
    fx.vol.write(refnum, SeekMode::FromStart, 0, &image).await.unwrap();
    fx.vol.set_eof(refnum, image.len() as u32).await.unwrap();
    let cnid = {
        // remember the file's id for cache inspection
        let info = fx
            .vol
            .get_info(2, ninebridge::volume::InfoTarget::Named(b"F"), true)
            .await
            .unwrap();
        info.cnid
    };
    fx.vol.close(refnum).await.unwrap();

    // The dirtied fork was decompiled over the sidecar...
    let sidecar = fx.file("F.rdump").expect("sidecar rewritten");
    assert_ne!(sidecar, SIDECAR);
    assert!(
        String::from_utf8_lossy(&sidecar).contains("5858"),
        "new body bytes reach the text"
    );

    // ...and the clean record matches the sidecar's current stat
    let rec = fx.file(&rezstat_path(&fx, cnid)).expect("clean record");
    assert_eq!(rec.len(), 24);
    let (size, mtime) = {
        let tree = fx.tree.lock().unwrap();
        let ino = tree.resolve("F.rdump").unwrap();
        let node = tree.node(ino).unwrap();
        (node.size(), node.mtime_sec)
    };
    assert_eq!(&rec[0..8], &size.to_le_bytes());
    assert_eq!(&rec[8..16], &(mtime as u64).to_le_bytes());

    // Reopening reads our body back (and a coherent header)
    let refnum = fx.vol.open(2, b"F", Fork::Resource, false).await.unwrap();
    let mut buf = [0u8; 4];
    fx.vol.read(refnum, SeekMode::FromStart, 260, &mut buf).await.unwrap();
    assert_eq!(&buf, b"XXXX");
    fx.vol.read(refnum, SeekMode::FromStart, 0, &mut buf).await.unwrap();
    assert_eq!(buf, 256u32.to_be_bytes());
    fx.vol.close(refnum).await.unwrap();
}

#[tokio::test]
async fn sidecar_edits_invalidate_the_cached_fork() {
    let mut fx = Fixture::new(|fs| {
        fs.put_file("F", b"");
        fs.put_file("F.rdump", SIDECAR);
    })
    .await;

    // Prime the cache
    let refnum = fx.vol.open(2, b"F", Fork::Resource, false).await.unwrap();
    fx.vol.close(refnum).await.unwrap();

    // Edit the sidecar behind the bridge's back: new body byte FF
    fx.tree.lock().unwrap().put_file(
        "F.rdump",
        b"data 'ABCD' (128, \"hi\") {\n\t$\"FF\"\n};\n",
    );

    let refnum = fx.vol.open(2, b"F", Fork::Resource, false).await.unwrap();
    let mut body = [0u8; 1];
    fx.vol.read(refnum, SeekMode::FromStart, 260, &mut body).await.unwrap();
    assert_eq!(body, [0xFF], "stale cache must be recompiled");
    fx.vol.close(refnum).await.unwrap();
}

#[tokio::test]
async fn truncating_to_zero_deletes_the_sidecar() {
    let mut fx = Fixture::new(|fs| {
        fs.put_file("F", b"");
        fs.put_file("F.rdump", SIDECAR);
    })
    .await;

    let refnum = fx.vol.open(2, b"F", Fork::Resource, true).await.unwrap();
    fx.vol.set_eof(refnum, 0).await.unwrap();
    fx.vol.close(refnum).await.unwrap();

    assert!(fx.file("F.rdump").is_none(), "zero fork removes the sidecar");
}

#[tokio::test]
async fn no_sidecar_means_an_empty_fork() {
    let mut fx = Fixture::new(|fs| {
        fs.put_file("Plain", b"data bytes only");
    })
    .await;

    let refnum = fx.vol.open(2, b"Plain", Fork::Resource, false).await.unwrap();
    assert_eq!(fx.vol.get_eof(refnum).await.unwrap(), 0);
    fx.vol.close(refnum).await.unwrap();

    // Meanwhile the data fork is untouched
    let refnum = fx.vol.open(2, b"Plain", Fork::Data, false).await.unwrap();
    let mut buf = [0u8; 15];
    let got = fx.vol.read(refnum, SeekMode::FromStart, 0, &mut buf).await.unwrap();
    assert_eq!(&buf[..got.actual as usize], b"data bytes only");
    fx.vol.close(refnum).await.unwrap();
}

#[tokio::test]
async fn fork_sizes_reported_through_file_info() {
    let mut fx = Fixture::new(|fs| {
        fs.put_file("F", b"12345");
        fs.put_file("F.rdump", SIDECAR);
    })
    .await;

    let info = fx
        .vol
        .get_info(2, ninebridge::volume::InfoTarget::Named(b"F"), true)
        .await
        .unwrap();
    assert_eq!(info.data_len, 5);
    assert_eq!(info.rsrc_len, 264 + 53); // the compiled image size
    assert!(!info.is_dir);
}
