//! The one-file strategy: forks and Finder info as the extended
//! attributes a Darwin host exposes.

mod common;

use common::{Fixture, Wire};
use ninebridge::errors::Errno;
use ninebridge::fcb::FcbTable;
use ninebridge::multifork::{Ctx, Multifork, OneFile};
use ninebridge::nine::fid;
use ninebridge::volume::{Fork, InfoTarget, SeekMode};

const XATTR_FORK: &str = "com.apple.ResourceFork";
const XATTR_FINDER: &str = "com.apple.FinderInfo";

#[tokio::test]
async fn resource_fork_commits_to_the_xattr_on_close() {
    let mut fx = Fixture::with_tag("Darwin_1", |fs| {
        fs.put_file("f", b"data fork");
    })
    .await;

    let r = fx.vol.open(2, b"f", Fork::Resource, true).await.unwrap();
    fx.vol.write(r, SeekMode::FromStart, 0, b"fork bytes").await.unwrap();
    assert_eq!(fx.vol.get_eof(r).await.unwrap(), 10);

    // Nothing reaches the host until the buffered fork is flushed
    {
        let tree = fx.tree.lock().unwrap();
        let node = tree.node(tree.resolve("f").unwrap()).unwrap().clone();
        assert!(node.xattrs.get(XATTR_FORK).is_none());
    }

    fx.vol.close(r).await.unwrap();
    {
        let tree = fx.tree.lock().unwrap();
        let node = tree.node(tree.resolve("f").unwrap()).unwrap().clone();
        assert_eq!(node.xattrs.get(XATTR_FORK).unwrap(), b"fork bytes");
    }

    // And reads back through a fresh open
    let r = fx.vol.open(2, b"f", Fork::Resource, false).await.unwrap();
    let mut buf = [0u8; 10];
    fx.vol.read(r, SeekMode::FromStart, 0, &mut buf).await.unwrap();
    assert_eq!(&buf, b"fork bytes");
    fx.vol.close(r).await.unwrap();

    // The data fork was never disturbed
    assert_eq!(fx.file("f").unwrap(), b"data fork");
}

#[tokio::test]
async fn finder_info_is_the_32_byte_xattr() {
    let mut fx = Fixture::with_tag("Darwin_1", |fs| {
        fs.put_file("app", b"");
    })
    .await;

    let mut finfo = [0u8; 16];
    finfo[0..8].copy_from_slice(b"APPLdemo");
    let mut fxinfo = [0u8; 16];
    fxinfo[0] = 0x77;
    fx.vol.set_info(2, b"app", finfo, fxinfo).await.unwrap();

    {
        let tree = fx.tree.lock().unwrap();
        let node = tree.node(tree.resolve("app").unwrap()).unwrap().clone();
        let blob = node.xattrs.get(XATTR_FINDER).unwrap();
        assert_eq!(blob.len(), 32);
        assert_eq!(&blob[0..8], b"APPLdemo");
        assert_eq!(blob[16], 0x77);
    }

    let info = fx.vol.get_info(2, InfoTarget::Named(b"app"), true).await.unwrap();
    assert_eq!(info.finfo, finfo);
    assert_eq!(info.fxinfo, fxinfo);
}

#[tokio::test]
async fn nothing_is_a_sidecar_in_this_format() {
    let mut fx = Fixture::with_tag("Darwin_1", |fs| {
        fs.put_file("plain", b"");
        fs.put_file("plain.rdump", b"");
    })
    .await;

    // .rdump is an ordinary file here and enumerates like one
    let (_, name) = fx.vol.read_dir_sorted(2, 1, true).await.unwrap();
    assert_eq!(name, "plain");
    let (_, name) = fx.vol.read_dir_sorted(2, 2, true).await.unwrap();
    assert_eq!(name, "plain.rdump");
}

#[tokio::test]
async fn the_scratch_ceiling_is_a_hard_stop() {
    let mut wire = Wire::new(|fs| {
        fs.put_file("f", b"");
    })
    .await;
    let mut catalog = wire.catalog().await;
    let mut fcbs = FcbTable::new(8);
    let mut mf = OneFile::new(16); // tiny ceiling for the test

    let refnum = fcbs.allocate().unwrap();
    {
        let fcb = fcbs.claim_mut(refnum);
        fcb.cnid = 0x4000_0123;
        fcb.resource = true;
        fcb.writable = true;
    }
    fcbs.enlist(refnum);

    wire.nine.walk_path(fid::ROOT, fid::VOL_A, "f").await.unwrap();
    let ctx = Ctx { nine: &mut wire.nine, catalog: &mut catalog, fcbs: &mut fcbs };
    mf.open(ctx, refnum, 0x4000_0123, fid::VOL_A, "f").await.unwrap();

    let ctx = Ctx { nine: &mut wire.nine, catalog: &mut catalog, fcbs: &mut fcbs };
    let n = mf.write(ctx, refnum, b"0123456789", 0).await.unwrap();
    assert_eq!(n, 10);

    // Crossing the ceiling fails loudly instead of buffering onward
    let ctx = Ctx { nine: &mut wire.nine, catalog: &mut catalog, fcbs: &mut fcbs };
    assert_eq!(mf.write(ctx, refnum, b"0123456789", 10).await.unwrap_err(), Errno::E2BIG);

    let ctx = Ctx { nine: &mut wire.nine, catalog: &mut catalog, fcbs: &mut fcbs };
    mf.close(ctx, refnum).await.unwrap();
}
