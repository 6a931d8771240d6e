//! Sorted directory enumeration: stable order across replay-buffer
//! refills and leaderboard overflow, hidden-name policy, and cache
//! invalidation rules.

mod common;

use common::Fixture;
use ninebridge::errors::FsError;

#[tokio::test]
async fn three_hundred_entries_come_back_in_strict_order() {
    let mut fx = Fixture::new(|fs| {
        // More entries than the leaderboard can hold at once
        for i in 1..=300 {
            fs.put_file(&format!("aaa{:03}", i), b"x");
        }
    })
    .await;

    let mut last = String::new();
    for index in 1..=300 {
        let (cnid, name) = fx
            .vol
            .read_dir_sorted(2, index, true)
            .await
            .unwrap_or_else(|e| panic!("index {}: {:?}", index, e));
        assert!(name > last, "index {}: {} !> {}", index, name, last);
        assert!(cnid > 0);
        last = name;
    }
    assert_eq!(last, "aaa300");

    // One past the end: no more entries
    assert_eq!(
        fx.vol.read_dir_sorted(2, 301, true).await.unwrap_err(),
        FsError::NotFound
    );
}

#[tokio::test]
async fn collation_folds_case() {
    let mut fx = Fixture::new(|fs| {
        for name in ["banana", "Apple", "cherry", "APRICOT"] {
            fs.put_file(name, b"");
        }
    })
    .await;

    let mut names = Vec::new();
    for index in 1..=4 {
        names.push(fx.vol.read_dir_sorted(2, index, true).await.unwrap().1);
    }
    assert_eq!(names, ["Apple", "APRICOT", "banana", "cherry"]);
}

#[tokio::test]
async fn sidecars_dotfiles_and_unrepresentable_names_are_hidden() {
    let mut fx = Fixture::new(|fs| {
        fs.put_file("visible", b"");
        fs.put_file("visible.rdump", b"");
        fs.put_file("visible.idump", b"");
        fs.put_file("visible.rdump.tmp", b"");
        fs.put_file(".hidden", b"");
        fs.put_file("日本語の名前", b"");
    })
    .await;

    let (_, name) = fx.vol.read_dir_sorted(2, 1, true).await.unwrap();
    assert_eq!(name, "visible");
    assert!(fx.vol.read_dir_sorted(2, 2, true).await.is_err());
}

#[tokio::test]
async fn files_only_enumeration_skips_directories() {
    let mut fx = Fixture::new(|fs| {
        fs.mkdir_p("aardvark-dir");
        fs.put_file("zebra-file", b"");
    })
    .await;

    let (_, name) = fx.vol.read_dir_sorted(2, 1, false).await.unwrap();
    assert_eq!(name, "zebra-file");
    assert!(fx.vol.read_dir_sorted(2, 2, false).await.is_err());

    // The policy change invalidates and relists
    let (_, name) = fx.vol.read_dir_sorted(2, 1, true).await.unwrap();
    assert_eq!(name, "aardvark-dir");
}

#[tokio::test]
async fn backwards_index_restarts_cleanly() {
    let mut fx = Fixture::new(|fs| {
        for i in 1..=20 {
            fs.put_file(&format!("n{:02}", i), b"");
        }
    })
    .await;

    for index in 1..=10 {
        fx.vol.read_dir_sorted(2, index, true).await.unwrap();
    }
    let (_, again) = fx.vol.read_dir_sorted(2, 3, true).await.unwrap();
    assert_eq!(again, "n03");
}

#[tokio::test]
async fn entries_deleted_between_calls_are_skipped() {
    let mut fx = Fixture::new(|fs| {
        for name in ["alpha", "beta", "gamma"] {
            fs.put_file(name, b"");
        }
    })
    .await;

    let (_, first) = fx.vol.read_dir_sorted(2, 1, true).await.unwrap();
    assert_eq!(first, "alpha");

    // beta vanishes on the host while we are between calls
    {
        let mut tree = fx.tree.lock().unwrap();
        tree.unlink(ninebridge::loopback::ROOT_INO, "beta", false).unwrap();
    }

    let (_, second) = fx.vol.read_dir_sorted(2, 2, true).await.unwrap();
    assert_eq!(second, "gamma");
}

#[tokio::test]
async fn subdirectories_enumerate_independently() {
    let mut fx = Fixture::new(|fs| {
        fs.put_file("Sub/inner1", b"");
        fs.put_file("Sub/inner2", b"");
        fs.put_file("toplevel", b"");
    })
    .await;

    let sub = fx.vol.get_info(2, ninebridge::volume::InfoTarget::Named(b"Sub"), true).await.unwrap();
    let (_, name) = fx.vol.read_dir_sorted(sub.cnid, 1, true).await.unwrap();
    assert_eq!(name, "inner1");
    let (_, name) = fx.vol.read_dir_sorted(sub.cnid, 2, true).await.unwrap();
    assert_eq!(name, "inner2");
    assert!(fx.vol.read_dir_sorted(sub.cnid, 3, true).await.is_err());
}
