//! Crash recovery: committed work survives an unclean stop, and a torn
//! data-page write is repaired from the doublewrite buffer before redo.

mod common;

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use common::*;
use granite::buffer_pool::FlushKind;
use granite::transaction::IsolationLevel;
use granite::PAGE_SIZE;
use serial_test::serial;

#[test]
#[serial]
fn committed_rows_survive_unclean_stop() {
    let (dir, engine, clustered) = setup();

    let t1 = engine.begin(IsolationLevel::RepeatableRead);
    engine.insert_row(&t1, TABLE_K, &row(1, 10)).unwrap();
    engine.insert_row(&t1, TABLE_K, &row(2, 20)).unwrap();
    engine.commit(&t1).unwrap();

    // Crash: no shutdown, no page flush. The redo is durable (policy 1).
    drop(engine);

    let engine = restart(&dir, clustered);
    let t2 = engine.begin(IsolationLevel::RepeatableRead);
    assert_eq!(scan_all(&engine, &t2), vec![(1, 10), (2, 20)]);
    engine.commit(&t2).unwrap();
    engine.shutdown().unwrap();
}

#[test]
#[serial]
fn torn_page_is_restored_from_doublewrite_then_rolled_forward() {
    let (dir, engine, clustered) = setup();

    let t1 = engine.begin(IsolationLevel::RepeatableRead);
    engine.insert_row(&t1, TABLE_K, &row(1, 10)).unwrap();
    engine.insert_row(&t1, TABLE_K, &row(2, 20)).unwrap();
    engine.commit(&t1).unwrap();

    // Push the pages to disk through the doublewrite buffer.
    engine
        .pool
        .flush_batch(FlushKind::List, usize::MAX, 0)
        .unwrap();

    // Redo past the flush: the update only exists in the log.
    let t2 = engine.begin(IsolationLevel::RepeatableRead);
    assert!(engine
        .update_row(&t2, TABLE_K, &key(2), &[(1, 25u64.to_be_bytes().to_vec())])
        .unwrap());
    engine.commit(&t2).unwrap();

    let root_page_no = clustered.root;
    drop(engine);

    // Tear the leaf: only the first half of the page "hit disk".
    let space_path = dir.path().join("db").join("space_00000000.gdb");
    let mut f = OpenOptions::new().write(true).open(&space_path).unwrap();
    let offset = root_page_no as u64 * PAGE_SIZE as u64 + (PAGE_SIZE / 2) as u64;
    f.seek(SeekFrom::Start(offset)).unwrap();
    f.write_all(&vec![0xAAu8; PAGE_SIZE / 2]).unwrap();
    f.sync_all().unwrap();
    drop(f);

    // Restart: the doublewrite copy repairs the tear, then redo replays the
    // update on top of it.
    let engine = restart(&dir, clustered);
    let stats = engine.recovery_stats().unwrap();
    assert!(stats.torn_repaired >= 1, "the torn leaf must be repaired");

    let t3 = engine.begin(IsolationLevel::RepeatableRead);
    assert_eq!(scan_all(&engine, &t3), vec![(1, 10), (2, 25)]);
    engine.commit(&t3).unwrap();
    engine.shutdown().unwrap();
}

#[test]
#[serial]
fn active_transaction_is_rolled_back_on_restart() {
    let (dir, engine, clustered) = setup();

    let t1 = engine.begin(IsolationLevel::RepeatableRead);
    engine.insert_row(&t1, TABLE_K, &row(1, 10)).unwrap();
    engine.commit(&t1).unwrap();

    // An uncommitted writer dies with the crash. Force its dirty pages and
    // redo out so the recovery has something to undo.
    let t2 = engine.begin(IsolationLevel::RepeatableRead);
    engine.insert_row(&t2, TABLE_K, &row(2, 20)).unwrap();
    engine
        .pool
        .log
        .flush_to_lsn(engine.pool.log.current_lsn(), true)
        .unwrap();
    engine
        .pool
        .flush_batch(FlushKind::List, usize::MAX, 0)
        .unwrap();
    drop(engine);

    let engine = restart(&dir, clustered);
    let stats = engine.recovery_stats().unwrap();
    assert_eq!(stats.resurrected_active, 1);

    let t3 = engine.begin(IsolationLevel::RepeatableRead);
    assert_eq!(scan_all(&engine, &t3), vec![(1, 10)]);
    engine.commit(&t3).unwrap();
    engine.shutdown().unwrap();
}
