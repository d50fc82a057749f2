//! Deadlock detection across two writers locking in opposite order.

mod common;

use std::thread;
use std::time::Duration;

use common::*;
use granite::errors::DbError;
use granite::transaction::IsolationLevel;
use serial_test::serial;

#[test]
#[serial]
fn exactly_one_victim_and_survivor_wins() {
    let (_dir, engine, _) = setup();

    let setup_trx = engine.begin(IsolationLevel::RepeatableRead);
    engine.insert_row(&setup_trx, TABLE_K, &row(1, 100)).unwrap();
    engine.insert_row(&setup_trx, TABLE_K, &row(2, 200)).unwrap();
    engine.commit(&setup_trx).unwrap();

    let e1 = engine.clone();
    let h1 = thread::spawn(move || {
        let t1 = e1.begin(IsolationLevel::RepeatableRead);
        // Lock row 1, then go for row 2.
        e1.update_row(&t1, TABLE_K, &key(1), &[(1, 111u64.to_be_bytes().to_vec())])
            .unwrap();
        thread::sleep(Duration::from_millis(150));
        let second = e1.update_row(&t1, TABLE_K, &key(2), &[(1, 112u64.to_be_bytes().to_vec())]);
        match second {
            Ok(true) => {
                e1.commit(&t1).unwrap();
                Ok(())
            }
            Err(DbError::Deadlock) => {
                e1.rollback(&t1).unwrap();
                Err(())
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    });

    let e2 = engine.clone();
    let h2 = thread::spawn(move || {
        let t2 = e2.begin(IsolationLevel::RepeatableRead);
        thread::sleep(Duration::from_millis(50));
        // Lock row 2, then go for row 1.
        e2.update_row(&t2, TABLE_K, &key(2), &[(1, 222u64.to_be_bytes().to_vec())])
            .unwrap();
        thread::sleep(Duration::from_millis(150));
        let second = e2.update_row(&t2, TABLE_K, &key(1), &[(1, 221u64.to_be_bytes().to_vec())]);
        match second {
            Ok(true) => {
                e2.commit(&t2).unwrap();
                Ok(())
            }
            Err(DbError::Deadlock) => {
                e2.rollback(&t2).unwrap();
                Err(())
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    });

    let r1 = h1.join().unwrap();
    let r2 = h2.join().unwrap();

    // Exactly one transaction was chosen as the victim.
    assert_ne!(r1.is_ok(), r2.is_ok(), "exactly one trx must survive");

    let reader = engine.begin(IsolationLevel::RepeatableRead);
    let rows = scan_all(&engine, &reader);
    if r1.is_ok() {
        assert_eq!(rows, vec![(1, 111), (2, 112)]);
    } else {
        assert_eq!(rows, vec![(1, 221), (2, 222)]);
    }
    engine.commit(&reader).unwrap();
    engine.shutdown().unwrap();
}

#[test]
#[serial]
fn lock_wait_timeout_fires_without_deadlock() {
    let (_dir, engine, _) = setup();
    // The monitor thread is off (background: false); start it for this test.
    engine
        .lock_sys
        .spawn_timeout_monitor(Duration::from_millis(50));

    let holder = engine.begin(IsolationLevel::RepeatableRead);
    engine.insert_row(&holder, TABLE_K, &row(9, 90)).unwrap();
    engine.commit(&holder).unwrap();

    let t1 = engine.begin(IsolationLevel::RepeatableRead);
    engine
        .update_row(&t1, TABLE_K, &key(9), &[(1, 91u64.to_be_bytes().to_vec())])
        .unwrap();

    // The second writer waits on t1's record lock until the timeout.
    let e2 = engine.clone();
    let h = thread::spawn(move || {
        let t2 = e2.begin(IsolationLevel::RepeatableRead);
        let res = e2.update_row(&t2, TABLE_K, &key(9), &[(1, 92u64.to_be_bytes().to_vec())]);
        let _ = e2.rollback(&t2);
        res
    });
    let res = h.join().unwrap();
    assert!(matches!(res, Err(DbError::LockWaitTimeout)));

    engine.commit(&t1).unwrap();
    engine.shutdown().unwrap();
}
