//! Persistent cursors across mini-transaction commits.

mod common;

use common::*;
use granite::btree::BtrLatch;
use granite::mtr::Mtr;
use granite::page::SearchMode;
use granite::pcur::PersistentCursor;
use granite::transaction::IsolationLevel;
use serial_test::serial;

#[test]
#[serial]
fn restore_is_exact_while_the_record_exists() {
    let (_dir, engine, clustered) = setup();

    let t = engine.begin(IsolationLevel::RepeatableRead);
    engine.insert_row(&t, TABLE_K, &row(20, 1)).unwrap();
    engine.insert_row(&t, TABLE_K, &row(30, 1)).unwrap();
    engine.commit(&t).unwrap();

    // Position on key 20 and store across an mtr commit.
    let mut pcur = PersistentCursor::new(clustered, BtrLatch::SearchLeaf);
    let mut mtr = Mtr::new();
    pcur.search(&key(20), SearchMode::GE, &engine.pool, &mut mtr)
        .unwrap();
    assert!(pcur.is_on_user_rec(&mtr));
    pcur.store_position(&mtr);
    mtr.commit(&engine.pool).unwrap();

    // Another session inserts key 25.
    let t2 = engine.begin(IsolationLevel::RepeatableRead);
    engine.insert_row(&t2, TABLE_K, &row(25, 1)).unwrap();
    engine.commit(&t2).unwrap();

    // The stored key still exists: restore reports the exact record, and
    // the next step lands on the new neighbor 25.
    let mut mtr = Mtr::new();
    let same = pcur.restore_position(&engine.pool, &mut mtr).unwrap();
    assert!(same, "key 20 was not touched");
    let on = pcur.current_tuple(&mtr).unwrap();
    assert_eq!(on.fields[0], 20u64.to_be_bytes().to_vec());

    assert!(pcur.move_to_next(&engine.pool, &mut mtr).unwrap());
    let next = pcur.current_tuple(&mtr).unwrap();
    assert_eq!(next.fields[0], 25u64.to_be_bytes().to_vec());
    pcur.store_position(&mtr);
    mtr.commit(&engine.pool).unwrap();
    engine.shutdown().unwrap();
}

#[test]
#[serial]
fn restore_repositions_to_neighbor_after_the_record_is_gone() {
    let (_dir, engine, clustered) = setup();

    let t = engine.begin(IsolationLevel::RepeatableRead);
    engine.insert_row(&t, TABLE_K, &row(20, 1)).unwrap();
    engine.insert_row(&t, TABLE_K, &row(25, 1)).unwrap();
    engine.commit(&t).unwrap();

    let mut pcur = PersistentCursor::new(clustered, BtrLatch::SearchLeaf);
    let mut mtr = Mtr::new();
    pcur.search(&key(20), SearchMode::GE, &engine.pool, &mut mtr)
        .unwrap();
    pcur.store_position(&mtr);
    mtr.commit(&engine.pool).unwrap();

    // Delete key 20 and purge it physically.
    let t2 = engine.begin(IsolationLevel::RepeatableRead);
    assert!(engine.delete_row(&t2, TABLE_K, &key(20)).unwrap());
    engine.commit(&t2).unwrap();
    assert!(engine.run_purge(16).unwrap() >= 1);

    // The stored record no longer exists: restore returns false and the
    // cursor rests so the next step yields the closest neighbor.
    let mut mtr = Mtr::new();
    let same = pcur.restore_position(&engine.pool, &mut mtr).unwrap();
    assert!(!same, "key 20 was purged");
    assert!(pcur.move_to_next(&engine.pool, &mut mtr).unwrap());
    let next = pcur.current_tuple(&mtr).unwrap();
    assert_eq!(next.fields[0], 25u64.to_be_bytes().to_vec());
    pcur.store_position(&mtr);
    mtr.commit(&engine.pool).unwrap();
    engine.shutdown().unwrap();
}

#[test]
#[serial]
fn whole_tree_sentinels_reopen_at_the_index_sides() {
    let (_dir, engine, clustered) = setup();

    // An empty tree stores a before-first sentinel.
    let mut pcur = PersistentCursor::new(clustered, BtrLatch::SearchLeaf);
    let mut mtr = Mtr::new();
    pcur.open_at_side(true, &engine.pool, &mut mtr).unwrap();
    pcur.store_position(&mtr);
    mtr.commit(&engine.pool).unwrap();

    let t = engine.begin(IsolationLevel::RepeatableRead);
    engine.insert_row(&t, TABLE_K, &row(5, 1)).unwrap();
    engine.commit(&t).unwrap();

    let mut mtr = Mtr::new();
    let same = pcur.restore_position(&engine.pool, &mut mtr).unwrap();
    assert!(!same, "sentinel restore always repositions");
    assert!(pcur.move_to_next(&engine.pool, &mut mtr).unwrap());
    let first = pcur.current_tuple(&mtr).unwrap();
    assert_eq!(first.fields[0], 5u64.to_be_bytes().to_vec());
    mtr.commit(&engine.pool).unwrap();
    engine.shutdown().unwrap();
}

#[test]
#[serial]
fn backward_walk_crosses_page_edges() {
    let (_dir, engine, clustered) = setup();

    let t = engine.begin(IsolationLevel::RepeatableRead);
    let n = 1500u64;
    for a in 0..n {
        engine.insert_row(&t, TABLE_K, &row(a, a)).unwrap();
    }
    engine.commit(&t).unwrap();

    let mut pcur = PersistentCursor::new(clustered, BtrLatch::SearchLeaf);
    let mut mtr = Mtr::new();
    pcur.open_at_side(false, &engine.pool, &mut mtr).unwrap();

    let mut seen = 0u64;
    while pcur.move_to_prev(&engine.pool, &mut mtr).unwrap() {
        let t = pcur.current_tuple(&mtr).unwrap();
        let a = u64::from_be_bytes(t.fields[0].as_slice().try_into().unwrap());
        seen += 1;
        assert_eq!(a, n - seen);
    }
    assert_eq!(seen, n);
    mtr.commit(&engine.pool).unwrap();
    engine.shutdown().unwrap();
}
