//! The engine: an explicit runtime context owning the tablespace registry,
//! buffer pool, redo log, transaction system, lock system and purge. Every
//! public operation takes the context; background threads hold a weak
//! reference and stop when the engine is shut down or dropped.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use log::{info, warn};
use parking_lot::{Mutex, RwLock};

use crate::btree::{btr_create, btr_free, IndexDef, TreeLatches};
use crate::buffer_pool::{BufferPool, FlushKind};
use crate::errors::{DbError, DbResult};
use crate::lock_manager::{LockMode, LockReply, LockSys, TableLockMode};
use crate::page::{SearchMode, Tuple, TupleCompare};
use crate::purge::{purge_run, PurgeSys};
use crate::recovery::{self, RecoveryStats};
use crate::row::{self, RowCursor, SecIndex};
use crate::tablespace::SpaceRegistry;
use crate::transaction::{IsolationLevel, Trx, TrxSys};
use crate::undo;
use crate::wal::{FlushAtCommit, LogSys, LOG_START_LSN};
use crate::{IndexId, SpaceId};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub buffer_pool_frames: usize,
    pub log_capacity: u64,
    /// 0 = no flush at commit, 1 = write + fsync, 2 = write only.
    pub flush_at_commit: u8,
    pub lock_wait_timeout: Duration,
    pub n_rsegs: usize,
    pub purge_batch: usize,
    /// Spawn the log writer, flusher, purge and lock-timeout threads.
    pub background: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./granite_data"),
            buffer_pool_frames: 256,
            log_capacity: 64 << 20,
            flush_at_commit: 1,
            lock_wait_timeout: Duration::from_secs(10),
            n_rsegs: 4,
            purge_batch: 64,
            background: true,
        }
    }
}

/// A registered table: one clustered index plus its secondaries.
#[derive(Clone)]
struct TableEntry {
    clustered: IndexDef,
    secondaries: Vec<SecIndex>,
}

pub struct Engine {
    pub config: EngineConfig,
    pub spaces: Arc<SpaceRegistry>,
    pub pool: Arc<BufferPool>,
    pub trx_sys: Arc<TrxSys>,
    pub lock_sys: Arc<LockSys>,
    pub tree_latches: TreeLatches,
    pub purge: PurgeSys,
    recovery_stats: Mutex<Option<RecoveryStats>>,
    tables: RwLock<HashMap<IndexId, TableEntry>>,
    bg_stop: Arc<AtomicBool>,
    bg_handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Engine {
    /// Starts the engine: opens (or bootstraps) the system tablespace, runs
    /// crash recovery, registers the caller's indexes and rolls back the
    /// transactions that died ACTIVE.
    pub fn start(
        config: EngineConfig,
        tables: Vec<(IndexDef, Vec<SecIndex>)>,
    ) -> DbResult<Arc<Engine>> {
        let spaces = Arc::new(SpaceRegistry::new(&config.data_dir)?);
        let created = spaces.open_or_create_system_space()?;
        let log_path = config.data_dir.join("redo.log");

        let (resume_lsn, recovery_stats) = if created {
            (LOG_START_LSN, None)
        } else {
            let stats = recovery::recover(&spaces, &log_path)?;
            (stats.end_lsn, Some(stats))
        };

        let log = LogSys::open(&log_path, config.log_capacity, resume_lsn)?;
        let pool = Arc::new(BufferPool::new(
            config.buffer_pool_frames,
            spaces.clone(),
            log.clone(),
        ));
        let lock_sys = Arc::new(LockSys::new(100_000));
        let flush_policy = FlushAtCommit::from_u8(config.flush_at_commit);
        let trx_sys = if created {
            TrxSys::create(pool.clone(), lock_sys.clone(), config.n_rsegs, flush_policy)?
        } else {
            TrxSys::open(pool.clone(), lock_sys.clone(), flush_policy)?
        };

        let engine = Arc::new(Engine {
            config,
            spaces,
            pool,
            trx_sys,
            lock_sys,
            tree_latches: TreeLatches::new(),
            purge: PurgeSys::new(),
            recovery_stats: Mutex::new(recovery_stats),
            tables: RwLock::new(HashMap::new()),
            bg_stop: Arc::new(AtomicBool::new(false)),
            bg_handles: Mutex::new(Vec::new()),
        });

        for (clustered, secondaries) in tables {
            engine.register_table(clustered, secondaries);
        }

        if !created {
            let (active, prepared) = recovery::resurrect_and_rollback(&engine)?;
            if let Some(stats) = engine.recovery_stats.lock().as_mut() {
                stats.resurrected_active = active;
                stats.resurrected_prepared = prepared;
            }
        }

        if engine.config.background {
            engine.pool.log.spawn_writer();
            engine
                .lock_sys
                .spawn_timeout_monitor(Duration::from_millis(100));
            engine.spawn_flusher();
            engine.spawn_purger();
        }
        info!(
            "engine started (fresh: {}, frames: {})",
            created, engine.config.buffer_pool_frames
        );
        Ok(engine)
    }

    fn spawn_flusher(self: &Arc<Self>) {
        let weak: Weak<Engine> = Arc::downgrade(self);
        let stop = self.bg_stop.clone();
        let handle = thread::Builder::new()
            .name("granite-flusher".into())
            .spawn(move || {
                let mut tick = 0u64;
                while !stop.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1000));
                    let Some(engine) = weak.upgrade() else { break };
                    let n = engine.pool.pace().max(8);
                    if engine.pool.n_dirty() > 0 {
                        if let Err(e) = engine.pool.flush_batch(FlushKind::List, n, 0) {
                            warn!("background flush failed: {e}");
                        }
                    }
                    tick += 1;
                    if tick % 10 == 0 {
                        if let Err(e) = engine.checkpoint() {
                            warn!("background checkpoint failed: {e}");
                        }
                    }
                }
            })
            .expect("spawn flusher");
        self.bg_handles.lock().push(handle);
    }

    fn spawn_purger(self: &Arc<Self>) {
        let weak: Weak<Engine> = Arc::downgrade(self);
        let stop = self.bg_stop.clone();
        let handle = thread::Builder::new()
            .name("granite-purge".into())
            .spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(500));
                    let Some(engine) = weak.upgrade() else { break };
                    if let Err(e) = purge_run(&engine, engine.config.purge_batch) {
                        warn!("purge failed: {e}");
                    }
                }
            })
            .expect("spawn purger");
        self.bg_handles.lock().push(handle);
    }

    /// Flushes everything, takes a final checkpoint and stops the
    /// background threads.
    pub fn shutdown(&self) -> DbResult<()> {
        self.bg_stop.store(true, Ordering::SeqCst);
        for handle in self.bg_handles.lock().drain(..) {
            let _ = handle.join();
        }
        self.pool.flush_all()?;
        self.checkpoint()?;
        self.pool.log.shutdown();
        self.lock_sys.shutdown();
        self.spaces.sync_all()?;
        info!("engine shut down");
        Ok(())
    }

    /// Writes a checkpoint at the minimum oldest-modification LSN (or the
    /// current LSN when every page is clean).
    pub fn checkpoint(&self) -> DbResult<()> {
        let lsn = self
            .pool
            .min_oldest_modification()
            .unwrap_or_else(|| self.pool.log.current_lsn());
        self.pool.log.write_checkpoint(lsn)
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        self.config.lock_wait_timeout
    }

    // Transactions.

    pub fn begin(&self, isolation: IsolationLevel) -> Arc<Trx> {
        self.trx_sys.begin(isolation)
    }

    /// Changes the isolation level of an idle transaction handle.
    pub fn set_isolation_level(&self, trx: &Arc<Trx>, isolation: IsolationLevel) -> DbResult<()> {
        let mut inner = trx.inner.lock();
        if inner.state != crate::transaction::TrxState::NotStarted {
            return Err(DbError::Panic(
                "isolation level change on a started transaction".into(),
            ));
        }
        inner.isolation = isolation;
        inner.read_view = None;
        Ok(())
    }

    pub fn commit(&self, trx: &Arc<Trx>) -> DbResult<()> {
        self.trx_sys.commit(trx)
    }

    pub fn rollback(&self, trx: &Arc<Trx>) -> DbResult<()> {
        self.trx_sys
            .rollback_low(trx, None, |rec| row::apply_undo(self, rec))
    }

    pub fn prepare(&self, trx: &Arc<Trx>) -> DbResult<()> {
        self.trx_sys.prepare(trx)
    }

    pub fn savepoint(&self, trx: &Arc<Trx>, name: &str) {
        self.trx_sys.savepoint(trx, name);
    }

    /// Rolls back to a named savepoint. `false` when the name is unknown.
    pub fn rollback_to_savepoint(&self, trx: &Arc<Trx>, name: &str) -> DbResult<bool> {
        let Some(undo_no) = self.trx_sys.savepoint_undo_no(trx, name) else {
            return Ok(false);
        };
        self.trx_sys
            .rollback_low(trx, Some(undo_no), |rec| row::apply_undo(self, rec))?;
        Ok(true)
    }

    pub fn release_savepoint(&self, trx: &Arc<Trx>, name: &str) -> bool {
        self.trx_sys.release_savepoint(trx, name)
    }

    // Index management. The dictionary proper is the caller's business; the
    // engine just creates trees and keeps descriptors by id.

    pub fn create_tablespace(&self, space: SpaceId) -> DbResult<()> {
        self.spaces.create_space(space)
    }

    pub fn drop_tablespace(&self, space: SpaceId) -> DbResult<()> {
        self.pool.evict_space(space);
        self.spaces.drop_space(space)
    }

    pub fn create_index(
        &self,
        space: SpaceId,
        id: IndexId,
        n_key_fields: usize,
        n_fields: usize,
        clustered: bool,
        compare: TupleCompare,
    ) -> DbResult<IndexDef> {
        let root = btr_create(id, space, &self.pool)?;
        Ok(IndexDef {
            id,
            space,
            root,
            n_key_fields,
            n_fields,
            clustered,
            compare,
        })
    }

    pub fn register_table(&self, clustered: IndexDef, secondaries: Vec<SecIndex>) {
        debug_assert!(clustered.clustered);
        self.tables.write().insert(
            clustered.id,
            TableEntry {
                clustered,
                secondaries,
            },
        );
    }

    pub fn drop_index(&self, def: &IndexDef) -> DbResult<()> {
        self.tables.write().remove(&def.id);
        btr_free(def, &self.pool)
    }

    /// Renames are a dictionary affair; the engine only re-keys its entry.
    pub fn rename_index(&self, old_id: IndexId, new_id: IndexId) -> bool {
        let mut tables = self.tables.write();
        if let Some(mut entry) = tables.remove(&old_id) {
            entry.clustered.id = new_id;
            tables.insert(new_id, entry);
            true
        } else {
            false
        }
    }

    /// The clustered index and its secondaries, by clustered index id.
    pub fn index_set(&self, id: IndexId) -> Option<(IndexDef, Vec<SecIndex>)> {
        self.tables
            .read()
            .get(&id)
            .map(|e| (e.clustered, e.secondaries.clone()))
    }

    /// Visits every registered clustered index descriptor.
    pub fn visit_indexes(&self, mut f: impl FnMut(&IndexDef)) {
        for entry in self.tables.read().values() {
            f(&entry.clustered);
        }
    }

    // Row operations on a registered table.

    fn table(&self, id: IndexId) -> DbResult<(IndexDef, Vec<SecIndex>)> {
        self.index_set(id)
            .ok_or_else(|| DbError::Panic(format!("unknown index {id}")))
    }

    pub fn insert_row(&self, trx: &Arc<Trx>, table: IndexId, row: &Tuple) -> DbResult<()> {
        let (clustered, secondaries) = self.table(table)?;
        row::insert_row(self, trx, &clustered, &secondaries, row)
    }

    pub fn update_row(
        &self,
        trx: &Arc<Trx>,
        table: IndexId,
        key: &Tuple,
        updates: &[(usize, Vec<u8>)],
    ) -> DbResult<bool> {
        let (clustered, secondaries) = self.table(table)?;
        row::update_row(self, trx, &clustered, &secondaries, key, updates)
    }

    pub fn delete_row(&self, trx: &Arc<Trx>, table: IndexId, key: &Tuple) -> DbResult<bool> {
        let (clustered, secondaries) = self.table(table)?;
        row::delete_row(self, trx, &clustered, &secondaries, key)
    }

    pub fn read_row(
        &self,
        trx: &Arc<Trx>,
        table: IndexId,
        key: &Tuple,
        lock: Option<LockMode>,
    ) -> DbResult<Option<Tuple>> {
        let (clustered, _) = self.table(table)?;
        row::read_row(self, trx, &clustered, key, lock)
    }

    pub fn open_cursor(&self, table: IndexId, lock: Option<LockMode>) -> DbResult<RowCursor> {
        let (clustered, _) = self.table(table)?;
        Ok(RowCursor::new(clustered, lock))
    }

    /// Cursor step with lock-wait handling: a locking cursor that hits a
    /// conflict suspends and retries.
    pub fn cursor_next(
        &self,
        cursor: &mut RowCursor,
        trx: &Arc<Trx>,
    ) -> DbResult<Option<Tuple>> {
        loop {
            match cursor.next(self, trx) {
                Err(DbError::LockWait) => {
                    self.lock_sys.wait_for_lock(trx.id())?;
                    continue;
                }
                other => return other,
            }
        }
    }

    pub fn cursor_seek(
        &self,
        cursor: &mut RowCursor,
        trx: &Arc<Trx>,
        key: &Tuple,
        mode: SearchMode,
    ) -> DbResult<Option<Tuple>> {
        loop {
            match cursor.seek(self, trx, key, mode) {
                Err(DbError::LockWait) => {
                    self.lock_sys.wait_for_lock(trx.id())?;
                    continue;
                }
                other => return other,
            }
        }
    }

    pub fn lock_table(
        &self,
        trx: &Arc<Trx>,
        table: IndexId,
        mode: TableLockMode,
    ) -> DbResult<()> {
        self.trx_sys.assign_for_write(trx)?;
        match self
            .lock_sys
            .lock_table(trx.id(), table, mode, self.lock_wait_timeout())?
        {
            LockReply::Granted => Ok(()),
            LockReply::Waiting => self.lock_sys.wait_for_lock(trx.id()),
        }
    }

    // Maintenance.

    pub fn run_purge(&self, n_max: usize) -> DbResult<usize> {
        purge_run(self, n_max)
    }

    pub fn history_list_length(&self) -> DbResult<u32> {
        let mut total = 0;
        for rseg in self.trx_sys.rsegs.iter() {
            total += undo::rseg_history_len(&self.pool, rseg)?;
        }
        Ok(total)
    }
}

impl Engine {
    pub fn recovery_stats(&self) -> Option<RecoveryStats> {
        self.recovery_stats.lock().clone()
    }
}
