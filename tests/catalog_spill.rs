//! The catalog's RAM/disk boundary: eviction, spill files, unspill,
//! and the case-preservation rule.

mod common;

use common::Wire;
use ninebridge::volume::DOTDIR_NAME;

fn spill_path(cnid: i32) -> String {
    format!("{}/catalog/{:08x}", DOTDIR_NAME, cnid as u32)
}

#[tokio::test]
async fn overfilling_a_bucket_evicts_exactly_one_entry() {
    let mut wire = Wire::new(|_| {}).await;
    let mut cat = wire.catalog().await;

    // 33 entries, CNIDs 32, 64, ... all landing in bucket 0; names
    // short enough that the 32-slot limit binds before the name arena
    for i in 1..=33 {
        let cnid = 32 * i;
        cat.set(&mut wire.nine, cnid, 2, "XXXXXXX", true).await;
    }

    // The 33rd insertion spilled exactly one entry: the last slot at
    // the time, which was the 32nd insertion
    let evicted = 32 * 32;
    let tree = wire.tree.lock().unwrap();
    let spilled = tree.file_bytes(&spill_path(evicted)).expect("spill file exists");
    assert_eq!(&spilled[0..4], &2i32.to_le_bytes());
    assert_eq!(&spilled[4..], b"XXXXXXX");

    // And only that one
    let names = tree.list(&format!("{}/catalog", DOTDIR_NAME)).unwrap();
    assert_eq!(names.len(), 1);
}

#[tokio::test]
async fn spilled_entries_come_back_on_demand() {
    let mut wire = Wire::new(|_| {}).await;
    let mut cat = wire.catalog().await;

    for i in 1..=33 {
        cat.set(&mut wire.nine, 32 * i, 2, &format!("entry{}", i), true).await;
    }

    // Entry 32 fell out of RAM; a get pulls it back from its file
    let (parent, name) = cat.get(&mut wire.nine, 32 * 32).await.expect("unspill");
    assert_eq!(parent, 2);
    assert_eq!(name, "entry32");
}

#[tokio::test]
async fn long_names_evict_by_arena_bytes() {
    let mut wire = Wire::new(|_| {}).await;
    let mut cat = wire.catalog().await;

    // 31-byte names: ten of them cannot share a 300-byte arena
    let name = "X".repeat(30);
    for i in 1..=10 {
        cat.set(&mut wire.nine, 32 * i, 2, &name, true).await;
    }

    let spilled = wire
        .tree
        .lock()
        .unwrap()
        .list(&format!("{}/catalog", DOTDIR_NAME))
        .unwrap();
    assert!(!spilled.is_empty(), "byte pressure must spill something");

    // Everything is still reachable, RAM or disk
    for i in 1..=10 {
        let (_, got) = cat.get(&mut wire.nine, 32 * i).await.expect("reachable");
        assert_eq!(got, name);
    }
}

#[tokio::test]
async fn get_after_set_returns_the_exact_name() {
    let mut wire = Wire::new(|_| {}).await;
    let mut cat = wire.catalog().await;

    cat.set(&mut wire.nine, 0x500, 2, "Precise Name", true).await;
    let (_, name) = cat.get(&mut wire.nine, 0x500).await.unwrap();
    assert_eq!(name, "Precise Name");
}

#[tokio::test]
async fn case_changes_stick_only_when_definitive() {
    let mut wire = Wire::new(|_| {}).await;
    let mut cat = wire.catalog().await;

    cat.set(&mut wire.nine, 0x600, 2, "abc", true).await;

    // A non-definitive respelling that differs only in case keeps the
    // host's original capitalisation
    cat.set(&mut wire.nine, 0x600, 2, "ABC", false).await;
    let (_, name) = cat.get(&mut wire.nine, 0x600).await.unwrap();
    assert_eq!(name, "abc");

    // A definitive one wins
    cat.set(&mut wire.nine, 0x600, 2, "ABC", true).await;
    let (_, name) = cat.get(&mut wire.nine, 0x600).await.unwrap();
    assert_eq!(name, "ABC");

    // A genuinely different name always wins
    cat.set(&mut wire.nine, 0x600, 2, "xyz", false).await;
    let (_, name) = cat.get(&mut wire.nine, 0x600).await.unwrap();
    assert_eq!(name, "xyz");
}

#[tokio::test]
async fn renames_to_longer_names_repack_the_bucket() {
    let mut wire = Wire::new(|_| {}).await;
    let mut cat = wire.catalog().await;

    // Fill bucket 1 with a handful of entries
    for i in 0..8 {
        cat.set(&mut wire.nine, 1 + 32 * i, 2, &format!("n{}", i), true).await;
    }
    // Grow one entry's name well past its old slot
    cat.set(&mut wire.nine, 1 + 32 * 3, 2, "a-considerably-longer-name", true).await;

    for i in 0..8 {
        let (_, name) = cat.get(&mut wire.nine, 1 + 32 * i).await.unwrap();
        if i == 3 {
            assert_eq!(name, "a-considerably-longer-name");
        } else {
            assert_eq!(name, format!("n{}", i));
        }
    }
}

#[tokio::test]
async fn unknown_cnid_is_not_found() {
    let mut wire = Wire::new(|_| {}).await;
    let mut cat = wire.catalog().await;
    assert!(cat.get(&mut wire.nine, 0x7fff_0000).await.is_err());
}
