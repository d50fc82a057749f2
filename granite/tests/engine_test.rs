//! End-to-end transaction scenarios on the engine API.

mod common;

use common::*;
use granite::errors::DbError;
use granite::transaction::IsolationLevel;
use serial_test::serial;

#[test]
#[serial]
fn insert_read_commit() {
    let (_dir, engine, _) = setup();

    let t1 = engine.begin(IsolationLevel::RepeatableRead);
    engine.insert_row(&t1, TABLE_K, &row(1, 10)).unwrap();
    engine.insert_row(&t1, TABLE_K, &row(2, 20)).unwrap();
    engine.insert_row(&t1, TABLE_K, &row(3, 30)).unwrap();
    engine.commit(&t1).unwrap();

    let t2 = engine.begin(IsolationLevel::RepeatableRead);
    assert_eq!(scan_all(&engine, &t2), vec![(1, 10), (2, 20), (3, 30)]);
    engine.commit(&t2).unwrap();
    engine.shutdown().unwrap();
}

#[test]
#[serial]
fn snapshot_isolation_reconstructs_pre_image() {
    let (_dir, engine, _) = setup();

    let writer = engine.begin(IsolationLevel::RepeatableRead);
    for (a, b) in [(1, 10), (2, 20), (3, 30)] {
        engine.insert_row(&writer, TABLE_K, &row(a, b)).unwrap();
    }
    engine.commit(&writer).unwrap();

    // T1 establishes its snapshot.
    let t1 = engine.begin(IsolationLevel::RepeatableRead);
    assert_eq!(scan_all(&engine, &t1), vec![(1, 10), (2, 20), (3, 30)]);

    // T2 updates (2,20) -> (2,99) and commits.
    let t2 = engine.begin(IsolationLevel::RepeatableRead);
    assert!(engine
        .update_row(&t2, TABLE_K, &key(2), &[(1, 99u64.to_be_bytes().to_vec())])
        .unwrap());
    engine.commit(&t2).unwrap();

    // T1 still sees the old version, rebuilt through undo.
    assert_eq!(scan_all(&engine, &t1), vec![(1, 10), (2, 20), (3, 30)]);
    assert_eq!(
        engine.read_row(&t1, TABLE_K, &key(2), None).unwrap(),
        Some(row(2, 20))
    );
    engine.commit(&t1).unwrap();

    // A fresh view sees the committed update.
    let t3 = engine.begin(IsolationLevel::RepeatableRead);
    assert_eq!(scan_all(&engine, &t3), vec![(1, 10), (2, 99), (3, 30)]);
    engine.commit(&t3).unwrap();
    engine.shutdown().unwrap();
}

#[test]
#[serial]
fn duplicate_key_is_rejected() {
    let (_dir, engine, _) = setup();
    let t1 = engine.begin(IsolationLevel::RepeatableRead);
    engine.insert_row(&t1, TABLE_K, &row(5, 50)).unwrap();
    engine.commit(&t1).unwrap();

    let t2 = engine.begin(IsolationLevel::RepeatableRead);
    let err = engine.insert_row(&t2, TABLE_K, &row(5, 51)).unwrap_err();
    assert!(matches!(err, DbError::DuplicateKey));
    engine.commit(&t2).unwrap();
    engine.shutdown().unwrap();
}

#[test]
#[serial]
fn insert_rollback_leaves_tree_unchanged() {
    let (_dir, engine, _) = setup();
    let t1 = engine.begin(IsolationLevel::RepeatableRead);
    engine.insert_row(&t1, TABLE_K, &row(1, 10)).unwrap();
    engine.commit(&t1).unwrap();

    let t2 = engine.begin(IsolationLevel::RepeatableRead);
    engine.insert_row(&t2, TABLE_K, &row(2, 20)).unwrap();
    engine.insert_row(&t2, TABLE_K, &row(3, 30)).unwrap();
    engine.rollback(&t2).unwrap();

    let t3 = engine.begin(IsolationLevel::RepeatableRead);
    assert_eq!(scan_all(&engine, &t3), vec![(1, 10)]);
    engine.commit(&t3).unwrap();
    engine.shutdown().unwrap();
}

#[test]
#[serial]
fn update_rollback_restores_identical_bytes() {
    let (_dir, engine, _) = setup();
    let t1 = engine.begin(IsolationLevel::RepeatableRead);
    engine.insert_row(&t1, TABLE_K, &row(7, 70)).unwrap();
    engine.commit(&t1).unwrap();

    let t2 = engine.begin(IsolationLevel::RepeatableRead);
    assert!(engine
        .update_row(&t2, TABLE_K, &key(7), &[(1, 71u64.to_be_bytes().to_vec())])
        .unwrap());
    assert_eq!(
        engine.read_row(&t2, TABLE_K, &key(7), None).unwrap(),
        Some(row(7, 71))
    );
    engine.rollback(&t2).unwrap();

    let t3 = engine.begin(IsolationLevel::RepeatableRead);
    assert_eq!(
        engine.read_row(&t3, TABLE_K, &key(7), None).unwrap(),
        Some(row(7, 70))
    );
    engine.commit(&t3).unwrap();
    engine.shutdown().unwrap();
}

#[test]
#[serial]
fn rollback_to_savepoint_is_partial() {
    let (_dir, engine, _) = setup();
    let t1 = engine.begin(IsolationLevel::RepeatableRead);
    engine.insert_row(&t1, TABLE_K, &row(1, 10)).unwrap();
    engine.savepoint(&t1, "sp1");
    engine.insert_row(&t1, TABLE_K, &row(2, 20)).unwrap();
    engine.insert_row(&t1, TABLE_K, &row(3, 30)).unwrap();

    assert!(engine.rollback_to_savepoint(&t1, "sp1").unwrap());
    engine.commit(&t1).unwrap();

    let t2 = engine.begin(IsolationLevel::RepeatableRead);
    assert_eq!(scan_all(&engine, &t2), vec![(1, 10)]);
    engine.commit(&t2).unwrap();

    // An unknown savepoint is reported, not fatal.
    let t3 = engine.begin(IsolationLevel::RepeatableRead);
    assert!(!engine.rollback_to_savepoint(&t3, "nope").unwrap());
    engine.commit(&t3).unwrap();
    engine.shutdown().unwrap();
}

#[test]
#[serial]
fn delete_hides_row_and_read_committed_sees_fresh_state() {
    let (_dir, engine, _) = setup();
    let t1 = engine.begin(IsolationLevel::RepeatableRead);
    engine.insert_row(&t1, TABLE_K, &row(4, 40)).unwrap();
    engine.commit(&t1).unwrap();

    let rc = engine.begin(IsolationLevel::ReadCommitted);
    assert_eq!(
        engine.read_row(&rc, TABLE_K, &key(4), None).unwrap(),
        Some(row(4, 40))
    );

    let t2 = engine.begin(IsolationLevel::RepeatableRead);
    assert!(engine.delete_row(&t2, TABLE_K, &key(4)).unwrap());
    engine.commit(&t2).unwrap();

    // READ COMMITTED refreshes its view per statement.
    engine.trx_sys.end_statement(&rc);
    assert_eq!(engine.read_row(&rc, TABLE_K, &key(4), None).unwrap(), None);
    engine.commit(&rc).unwrap();
    engine.shutdown().unwrap();
}

#[test]
#[serial]
fn many_rows_split_pages_and_scan_in_order() {
    let (_dir, engine, _) = setup();
    let t1 = engine.begin(IsolationLevel::RepeatableRead);
    // Enough rows to force leaf splits and a root raise.
    let n = 2000u64;
    for a in (0..n).rev() {
        engine.insert_row(&t1, TABLE_K, &row(a, a * 2)).unwrap();
    }
    engine.commit(&t1).unwrap();

    let t2 = engine.begin(IsolationLevel::RepeatableRead);
    let all = scan_all(&engine, &t2);
    assert_eq!(all.len(), n as usize);
    for (i, (a, b)) in all.iter().enumerate() {
        assert_eq!(*a, i as u64);
        assert_eq!(*b, i as u64 * 2);
    }
    engine.commit(&t2).unwrap();
    engine.shutdown().unwrap();
}
