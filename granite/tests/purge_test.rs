//! Purge reclaims delete-marked rows and undo history.

mod common;

use common::*;
use granite::btree::{btr_cursor_search, BtrLatch};
use granite::mtr::Mtr;
use granite::page::{self, SearchMode};
use granite::transaction::IsolationLevel;
use serial_test::serial;

/// Is there a physical record (marked or not) for the key?
fn physical_record_exists(engine: &granite::engine::Engine, clustered: &granite::btree::IndexDef, k: u64) -> bool {
    let mut mtr = Mtr::new();
    let cur = btr_cursor_search(
        clustered,
        &key(k),
        SearchMode::GE,
        BtrLatch::SearchLeaf,
        &engine.pool,
        &mut mtr,
    )
    .unwrap();
    let frame = mtr.frame(cur.slot);
    let found = cur.rec != page::SUPREMUM_OFFSET
        && page::rec_is_user_rec(frame, cur.rec)
        && page::rec_cmp_with_tuple(frame, cur.rec, &key(k), clustered.compare, 1)
            == std::cmp::Ordering::Equal;
    mtr.commit(&engine.pool).unwrap();
    found
}

#[test]
#[serial]
fn purge_removes_deleted_row_and_frees_history() {
    let (_dir, engine, clustered) = setup();

    let t1 = engine.begin(IsolationLevel::RepeatableRead);
    engine.insert_row(&t1, TABLE_K, &row(7, 70)).unwrap();
    engine.commit(&t1).unwrap();

    let t2 = engine.begin(IsolationLevel::RepeatableRead);
    assert!(engine.delete_row(&t2, TABLE_K, &key(7)).unwrap());
    engine.commit(&t2).unwrap();

    // The delete-marked record is still physically present; its undo log
    // sits on the history list.
    assert!(physical_record_exists(&engine, &clustered, 7));
    let history_before = engine.history_list_length().unwrap();
    assert_eq!(history_before, 1);

    // No older read view exists: purge reclaims everything.
    let purged = engine.run_purge(16).unwrap();
    assert_eq!(purged, 1);
    assert!(!physical_record_exists(&engine, &clustered, 7));
    assert_eq!(engine.history_list_length().unwrap(), history_before - 1);
    engine.shutdown().unwrap();
}

#[test]
#[serial]
fn purge_respects_the_oldest_read_view() {
    let (_dir, engine, clustered) = setup();

    let t1 = engine.begin(IsolationLevel::RepeatableRead);
    engine.insert_row(&t1, TABLE_K, &row(8, 80)).unwrap();
    engine.commit(&t1).unwrap();

    // An old reader opens its view before the delete commits.
    let reader = engine.begin(IsolationLevel::RepeatableRead);
    assert_eq!(
        engine.read_row(&reader, TABLE_K, &key(8), None).unwrap(),
        Some(row(8, 80))
    );

    let t2 = engine.begin(IsolationLevel::RepeatableRead);
    assert!(engine.delete_row(&t2, TABLE_K, &key(8)).unwrap());
    engine.commit(&t2).unwrap();

    // The reader still needs the version: purge must keep it.
    assert_eq!(engine.run_purge(16).unwrap(), 0);
    assert!(physical_record_exists(&engine, &clustered, 8));
    assert_eq!(
        engine.read_row(&reader, TABLE_K, &key(8), None).unwrap(),
        Some(row(8, 80))
    );

    // Once the reader is gone the history is reclaimable.
    engine.commit(&reader).unwrap();
    assert_eq!(engine.run_purge(16).unwrap(), 1);
    assert!(!physical_record_exists(&engine, &clustered, 8));
    engine.shutdown().unwrap();
}

#[test]
#[serial]
fn purge_handles_a_backlog_of_logs() {
    let (_dir, engine, _clustered) = setup();

    let t = engine.begin(IsolationLevel::RepeatableRead);
    for a in 0..20u64 {
        engine.insert_row(&t, TABLE_K, &row(a, a)).unwrap();
    }
    engine.commit(&t).unwrap();

    for a in 0..20u64 {
        let d = engine.begin(IsolationLevel::RepeatableRead);
        assert!(engine.delete_row(&d, TABLE_K, &key(a)).unwrap());
        engine.commit(&d).unwrap();
    }
    assert_eq!(engine.history_list_length().unwrap(), 20);

    // Batch limit caps one run; repeated runs drain the backlog.
    let first = engine.run_purge(5).unwrap();
    assert_eq!(first, 5);
    let mut total = first;
    while total < 20 {
        let n = engine.run_purge(5).unwrap();
        assert!(n > 0);
        total += n;
    }
    assert_eq!(engine.history_list_length().unwrap(), 0);

    let t2 = engine.begin(IsolationLevel::RepeatableRead);
    assert!(scan_all(&engine, &t2).is_empty());
    engine.commit(&t2).unwrap();
    engine.shutdown().unwrap();
}
