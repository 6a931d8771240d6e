//! End-to-end operations through the volume façade: open files,
//! positioning modes, namespace changes, metadata, working
//! directories, and volume info.

mod common;

use common::Fixture;
use ninebridge::errors::FsError;
use ninebridge::volume::{Fork, InfoTarget, SeekMode, WDHI};

#[tokio::test]
async fn create_write_read_delete() {
    let mut fx = Fixture::new(|_| {}).await;

    fx.vol.create(2, b"New File").await.unwrap();
    assert!(fx.exists("New File"));
    assert_eq!(fx.vol.create(2, b"New File").await.unwrap_err(), FsError::DuplicateName);

    let refnum = fx.vol.open(2, b"New File", Fork::Data, true).await.unwrap();
    fx.vol.write(refnum, SeekMode::FromStart, 0, b"0123456789").await.unwrap();

    // at-mark read continues where the write left off
    fx.vol.set_pos(refnum, SeekMode::FromStart, 2).await.unwrap();
    let mut buf = [0u8; 3];
    let got = fx.vol.read(refnum, SeekMode::AtMark, 0, &mut buf).await.unwrap();
    assert_eq!((&buf[..], got.pos), (&b"234"[..], 5));

    // from-leof positioning
    let got = fx.vol.read(refnum, SeekMode::FromLeof, -4, &mut buf).await.unwrap();
    assert_eq!(&buf[..], b"678");
    assert!(!got.hit_eof);

    // reading past the end is a short read flagged as eof
    let mut big = [0u8; 8];
    let got = fx.vol.read(refnum, SeekMode::FromStart, 6, &mut big).await.unwrap();
    assert_eq!(got.actual, 4);
    assert!(got.hit_eof);

    fx.vol.close(refnum).await.unwrap();

    fx.vol.delete(2, b"New File").await.unwrap();
    assert!(!fx.exists("New File"));
    assert_eq!(fx.vol.delete(2, b"New File").await.unwrap_err(), FsError::NotFound);
}

#[tokio::test]
async fn open_files_cannot_be_deleted() {
    let mut fx = Fixture::new(|fs| {
        fs.put_file("busy", b"x");
    })
    .await;

    let refnum = fx.vol.open(2, b"busy", Fork::Data, false).await.unwrap();
    assert_eq!(fx.vol.delete(2, b"busy").await.unwrap_err(), FsError::FileBusy);
    fx.vol.close(refnum).await.unwrap();
    fx.vol.delete(2, b"busy").await.unwrap();
}

#[tokio::test]
async fn duplicate_opens_share_length_updates() {
    let mut fx = Fixture::new(|fs| {
        fs.put_file("shared", b"");
    })
    .await;

    let a = fx.vol.open(2, b"shared", Fork::Data, true).await.unwrap();
    let b = fx.vol.open(2, b"shared", Fork::Data, false).await.unwrap();
    assert_ne!(a, b);

    fx.vol.write(a, SeekMode::FromStart, 0, b"grown").await.unwrap();
    // The sibling open learned the new length without its own call
    let mut buf = [0u8; 5];
    let got = fx.vol.read(b, SeekMode::FromLeof, -5, &mut buf).await.unwrap();
    assert_eq!(&buf[..got.actual as usize], b"grown");

    fx.vol.close(a).await.unwrap();
    fx.vol.close(b).await.unwrap();
}

#[tokio::test]
async fn set_eof_truncates_and_extends() {
    let mut fx = Fixture::new(|fs| {
        fs.put_file("sized", b"0123456789");
    })
    .await;

    let refnum = fx.vol.open(2, b"sized", Fork::Data, true).await.unwrap();
    fx.vol.set_eof(refnum, 4).await.unwrap();
    assert_eq!(fx.vol.get_eof(refnum).await.unwrap(), 4);
    assert_eq!(fx.file("sized").unwrap(), b"0123");

    fx.vol.set_eof(refnum, 8).await.unwrap();
    assert_eq!(fx.file("sized").unwrap(), b"0123\0\0\0\0");
    fx.vol.close(refnum).await.unwrap();
}

#[tokio::test]
async fn rename_refuses_to_replace() {
    let mut fx = Fixture::new(|fs| {
        fs.put_file("a", b"1");
        fs.put_file("b", b"2");
    })
    .await;

    assert_eq!(fx.vol.rename(2, b"a", b"b").await.unwrap_err(), FsError::DuplicateName);
    fx.vol.rename(2, b"a", b"c").await.unwrap();
    assert_eq!(fx.file("c").unwrap(), b"1");
    assert!(!fx.exists("a"));
}

#[tokio::test]
async fn rename_carries_sidecars_along() {
    let mut fx = Fixture::new(|fs| {
        fs.put_file("doc", b"data");
        fs.put_file("doc.idump", b"TEXTttxt\n");
        fs.put_file("doc.rdump", b"data 'STR ' (0) {\n};\n");
    })
    .await;

    fx.vol.rename(2, b"doc", b"letter").await.unwrap();
    assert!(fx.exists("letter") && fx.exists("letter.idump") && fx.exists("letter.rdump"));
    assert!(!fx.exists("doc") && !fx.exists("doc.idump") && !fx.exists("doc.rdump"));
}

#[tokio::test]
async fn renaming_the_volume_itself() {
    let mut fx = Fixture::new(|_| {}).await;
    // An absolute path to the root names the volume
    fx.vol.rename(2, b"Test:", b"Fancy").await.unwrap();
    assert_eq!(fx.vol.name, "Fancy");
}

#[tokio::test]
async fn cat_move_relocates_without_replacing() {
    let mut fx = Fixture::new(|fs| {
        fs.put_file("doc", b"payload");
        fs.put_file("doc.idump", b"TEXTttxt\n");
        fs.mkdir_p("Dest");
        fs.mkdir_p("Occupied");
        fs.put_file("Occupied/doc", b"already here");
    })
    .await;

    assert_eq!(
        fx.vol.cat_move(2, b"doc", 2, b"Occupied").await.unwrap_err(),
        FsError::DuplicateName
    );

    fx.vol.cat_move(2, b"doc", 2, b"Dest").await.unwrap();
    assert_eq!(fx.file("Dest/doc").unwrap(), b"payload");
    assert!(fx.exists("Dest/doc.idump"));
    assert!(!fx.exists("doc"));
}

#[tokio::test]
async fn dir_create_registers_the_new_id() {
    let mut fx = Fixture::new(|_| {}).await;

    let cnid = fx.vol.dir_create(2, b"Fresh Folder").await.unwrap();
    assert!(fx.exists("Fresh Folder"));

    // The id resolves straight back through the catalog
    let (parent, name) = fx.vol.resolve_file_id_ref(cnid).await.unwrap();
    assert_eq!((parent, name.as_str()), (2, "Fresh Folder"));

    // And is usable as a base directory immediately
    fx.vol.create(cnid, b"inside").await.unwrap();
    assert!(fx.exists("Fresh Folder/inside"));
}

#[tokio::test]
async fn finder_info_round_trips_through_the_sidecar() {
    let mut fx = Fixture::new(|fs| {
        fs.put_file("app", b"");
    })
    .await;

    let mut finfo = [0u8; 16];
    finfo[0..8].copy_from_slice(b"APPLdemo");
    finfo[8] = 0x40; // kIsInvisible
    fx.vol.set_info(2, b"app", finfo, [0; 16]).await.unwrap();

    let text = fx.file("app.idump").expect("idump written");
    assert!(text.starts_with(b"APPLdemo\n"));

    let info = fx.vol.get_info(2, InfoTarget::Named(b"app"), true).await.unwrap();
    assert_eq!(&info.finfo[0..8], b"APPLdemo");
    assert_eq!(info.finfo[8], 0x40);
}

#[tokio::test]
async fn indexed_info_enumerates_in_order() {
    let mut fx = Fixture::new(|fs| {
        fs.put_file("bravo", b"22");
        fs.put_file("alpha", b"1");
        fs.mkdir_p("charlie");
    })
    .await;

    // Catalog flavour sees directories
    let first = fx.vol.get_info(2, InfoTarget::Indexed(1), true).await.unwrap();
    assert_eq!(first.name, "alpha");
    assert_eq!(first.data_len, 1);
    let third = fx.vol.get_info(2, InfoTarget::Indexed(3), true).await.unwrap();
    assert!(third.is_dir);
    assert_eq!(third.name, "charlie");

    // Files-only flavour refuses directories entirely
    let second = fx.vol.get_info(2, InfoTarget::Indexed(2), false).await.unwrap();
    assert_eq!(second.name, "bravo");
    assert!(fx.vol.get_info(2, InfoTarget::Indexed(3), false).await.is_err());
}

#[tokio::test]
async fn dir_only_info_reports_valence_and_parent() {
    let mut fx = Fixture::new(|fs| {
        fs.put_file("Sub/one", b"");
        fs.put_file("Sub/two", b"");
        fs.put_file("Sub/.hidden", b"");
    })
    .await;

    let sub = fx.vol.get_info(2, InfoTarget::Named(b"Sub"), true).await.unwrap();
    assert!(sub.is_dir);
    assert_eq!(sub.valence, 2); // dotfiles stay invisible
    assert_eq!(sub.parent, 2);

    let by_id = fx.vol.get_info(sub.cnid, InfoTarget::DirOnly, true).await.unwrap();
    assert_eq!(by_id.cnid, sub.cnid);
    assert_eq!(by_id.name, "Sub");
}

#[tokio::test]
async fn working_directories_alias_real_directories() {
    let mut fx = Fixture::new(|fs| {
        fs.put_file("Deep/Down/file", b"found me");
    })
    .await;

    let deep = fx.vol.get_info(2, InfoTarget::Named(b":Deep:Down"), true).await.unwrap();
    let wd = fx.vol.open_wd(2, b":Deep:Down", 0x4242).await.unwrap();
    assert!(wd <= WDHI);

    // The alias resolves like a volume refnum with no dirID
    let base = fx.vol.resolve_dir(wd, 0);
    assert_eq!(base, deep.cnid);

    let refnum = fx.vol.open(base, b"file", Fork::Data, false).await.unwrap();
    let mut buf = [0u8; 8];
    fx.vol.read(refnum, SeekMode::FromStart, 0, &mut buf).await.unwrap();
    assert_eq!(&buf, b"found me");
    fx.vol.close(refnum).await.unwrap();

    // The root never gets an alias
    assert_eq!(fx.vol.open_wd(2, b"", 0).await.unwrap(), fx.vol.vref);

    fx.vol.close_wd(wd).unwrap();
    assert_eq!(fx.vol.resolve_dir(wd, 0), 2); // stale alias falls back to root
}

#[tokio::test]
async fn vol_params_advertise_file_ids() {
    let fx = Fixture::new(|_| {}).await;
    let params = fx.vol.vol_params();
    assert_eq!(params.version, 1);
    assert!(params.attributes & (1 << 6) != 0); // file-ID calls supported
}

#[tokio::test]
async fn vol_info_counts_visible_root_files() {
    let mut fx = Fixture::new(|fs| {
        fs.put_file("one", b"");
        fs.put_file("two", b"");
        fs.put_file("two.idump", b"????????\n");
        fs.mkdir_p("folder");
    })
    .await;

    let info = fx.vol.vol_info(2).await.unwrap();
    assert_eq!(info.name, "Test");
    assert_eq!(info.num_files, 2); // sidecar and folder excluded
    assert!(info.total_bytes > 0);
    assert_eq!(info.alloc_block_size, 32 * 1024);
}

#[tokio::test]
async fn make_fs_spec_for_present_and_absent_names() {
    let mut fx = Fixture::new(|fs| {
        fs.put_file("Here/file", b"");
    })
    .await;

    let spec = fx.vol.make_fs_spec(2, b":Here:file").await.unwrap();
    assert!(spec.exists);
    assert_eq!(spec.name, b"file");

    let spec = fx.vol.make_fs_spec(2, b":Here:missing").await.unwrap();
    assert!(!spec.exists);
    assert_eq!(spec.name, b"missing");
    let here = fx.vol.get_info(2, InfoTarget::Named(b"Here"), true).await.unwrap();
    assert_eq!(spec.parent, here.cnid);

    assert_eq!(
        fx.vol.make_fs_spec(2, b":Nowhere:missing").await.unwrap_err(),
        FsError::DirNotFound
    );
}

#[tokio::test]
async fn file_id_refs_follow_the_file() {
    let mut fx = Fixture::new(|fs| {
        fs.put_file("tracked", b"");
    })
    .await;

    let (id, is_file) = fx.vol.create_file_id_ref(2, b"tracked").await.unwrap();
    assert!(is_file);

    fx.vol.rename(2, b"tracked", b"renamed").await.unwrap();
    let (parent, name) = fx.vol.resolve_file_id_ref(id).await.unwrap();
    assert_eq!((parent, name.as_str()), (2, "renamed"));
}
