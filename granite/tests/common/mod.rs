//! Shared setup for the engine integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use granite::btree::IndexDef;
use granite::engine::{Engine, EngineConfig};
use granite::page::{default_tuple_compare, Tuple};
use granite::tablespace::SYSTEM_SPACE_ID;
use tempfile::TempDir;

pub const TABLE_K: u64 = 100;

pub fn config_for(dir: &TempDir) -> EngineConfig {
    EngineConfig {
        data_dir: dir.path().join("db"),
        buffer_pool_frames: 128,
        log_capacity: 16 << 20,
        flush_at_commit: 1,
        lock_wait_timeout: Duration::from_secs(3),
        n_rsegs: 2,
        purge_batch: 64,
        background: false,
    }
}

/// Starts a fresh engine and creates table `K(a INT PK, b INT)`.
pub fn setup() -> (TempDir, Arc<Engine>, IndexDef) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::start(config_for(&dir), Vec::new()).unwrap();
    let clustered = engine
        .create_index(SYSTEM_SPACE_ID, TABLE_K, 1, 2, true, default_tuple_compare)
        .unwrap();
    engine.register_table(clustered, Vec::new());
    (dir, engine, clustered)
}

/// Restarts the engine over the same files, re-registering the table.
pub fn restart(dir: &TempDir, clustered: IndexDef) -> Arc<Engine> {
    Engine::start(config_for(dir), vec![(clustered, Vec::new())]).unwrap()
}

pub fn row(a: u64, b: u64) -> Tuple {
    Tuple::new(vec![a.to_be_bytes().to_vec(), b.to_be_bytes().to_vec()])
}

pub fn key(a: u64) -> Tuple {
    Tuple::new(vec![a.to_be_bytes().to_vec()])
}

pub fn row_values(t: &Tuple) -> (u64, u64) {
    let a = u64::from_be_bytes(t.fields[0].as_slice().try_into().unwrap());
    let b = u64::from_be_bytes(t.fields[1].as_slice().try_into().unwrap());
    (a, b)
}

/// Reads the whole table in key order under the given transaction.
pub fn scan_all(engine: &Engine, trx: &Arc<granite::transaction::Trx>) -> Vec<(u64, u64)> {
    let mut cursor = engine.open_cursor(TABLE_K, None).unwrap();
    let mut out = Vec::new();
    let mut next = cursor.first(engine, trx).unwrap();
    while let Some(t) = next {
        out.push(row_values(&t));
        next = cursor.next(engine, trx).unwrap();
    }
    out
}
