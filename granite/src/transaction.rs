//! Transactions and MVCC read views.
//!
//! A transaction acquires its id and rollback segment on first write. The
//! trx-sys page persists the id counter ahead of use so recovery never
//! reassigns one. Commit assigns the serialization number under the kernel
//! mutex, moves update-undo into the rseg history, releases locks and
//! flushes redo per the `flush_at_commit` policy. Read views snapshot the
//! active writer set; row versions older than the view are rebuilt by
//! walking roll-pointer chains through undo.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, info};
use parking_lot::Mutex;

use crate::btree::IndexDef;
use crate::buffer_pool::{BufferPool, LatchMode};
use crate::errors::{DbError, DbResult};
use crate::lock_manager::LockSys;
use crate::mtr::Mtr;
use crate::page::{self, Tuple};
use crate::sync::{LatchRank, RankGuard};
use crate::tablespace::{SYSTEM_SPACE_ID, TRX_SYS_PAGE_NO};
use crate::undo::{
    self, undo_read, roll_ptr_is_insert, Rseg, UndoHandle, UndoKind, UndoRec,
};
use crate::wal::{FlushAtCommit, RedoRecord};
use crate::{PageId, TrxId, FIL_NULL};

// Trx-sys page (page 5 of the system tablespace).
pub const TRX_SYS_TRX_ID: usize = 38; // u64 high-water mark
pub const TRX_SYS_N_RSEGS: usize = 46; // u32
pub const TRX_SYS_RSEG_DIR: usize = 64; // 256 * u32 header page numbers

/// Ids are persisted this far ahead of use.
const TRX_ID_WRITE_MARGIN: u64 = 256;

const FIRST_TRX_ID: TrxId = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrxState {
    NotStarted,
    Active,
    Prepared,
    CommittedInMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
}

/// An MVCC snapshot. A transaction is visible when it committed before the
/// view was opened.
#[derive(Debug, Clone)]
pub struct ReadView {
    /// No trx with id >= this is visible (the next id at snapshot time).
    pub low_limit: TrxId,
    /// Every trx with id < this is visible (the oldest active writer).
    pub up_limit: TrxId,
    /// Write transactions active at snapshot time.
    pub active: Vec<TrxId>,
    pub creator: TrxId,
}

impl ReadView {
    pub fn sees(&self, trx_id: TrxId) -> bool {
        if trx_id == self.creator && trx_id != 0 {
            return true;
        }
        if trx_id < self.up_limit {
            return true;
        }
        if trx_id >= self.low_limit {
            return false;
        }
        !self.active.contains(&trx_id)
    }
}

/// Already-rolled-back undo number ranges (rollback to savepoint).
#[derive(Debug, Default, Clone)]
pub struct RolledRanges(Vec<(u64, u64)>);

impl RolledRanges {
    fn contains(&self, undo_no: u64) -> bool {
        self.0.iter().any(|&(lo, hi)| undo_no >= lo && undo_no < hi)
    }

    fn add(&mut self, lo: u64, hi: u64) {
        self.0.push((lo, hi));
    }

    fn clear(&mut self) {
        self.0.clear();
    }
}

#[derive(Debug)]
pub struct TrxInner {
    pub state: TrxState,
    pub isolation: IsolationLevel,
    /// 0 until the first write assigns one.
    pub id: TrxId,
    pub trx_no: u64,
    pub rseg_id: Option<usize>,
    pub insert_undo: Option<UndoHandle>,
    pub update_undo: Option<UndoHandle>,
    pub undo_no: u64,
    pub read_view: Option<Arc<ReadView>>,
    pub savepoints: Vec<(String, u64)>,
    pub rolled: RolledRanges,
}

/// A transaction handle.
pub struct Trx {
    pub inner: Mutex<TrxInner>,
}

impl Trx {
    fn new(isolation: IsolationLevel) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(TrxInner {
                state: TrxState::NotStarted,
                isolation,
                id: 0,
                trx_no: 0,
                rseg_id: None,
                insert_undo: None,
                update_undo: None,
                undo_no: 0,
                read_view: None,
                savepoints: Vec::new(),
                rolled: RolledRanges::default(),
            }),
        })
    }

    pub fn id(&self) -> TrxId {
        self.inner.lock().id
    }

    pub fn state(&self) -> TrxState {
        self.inner.lock().state
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.inner.lock().isolation
    }
}

struct KernelState {
    next_id: TrxId,
    persisted_up_to: TrxId,
    active_writers: BTreeSet<TrxId>,
    views: Vec<Weak<ReadView>>,
}

/// The transaction system.
pub struct TrxSys {
    kernel: Mutex<KernelState>,
    pub rsegs: Vec<Arc<Rseg>>,
    rr_counter: AtomicUsize,
    pub pool: Arc<BufferPool>,
    pub lock_sys: Arc<LockSys>,
    pub flush_at_commit: FlushAtCommit,
    pub max_trxs: usize,
}

impl TrxSys {
    /// Formats the trx-sys page and the rollback segments of a fresh system
    /// tablespace.
    pub fn create(
        pool: Arc<BufferPool>,
        lock_sys: Arc<LockSys>,
        n_rsegs: usize,
        flush_at_commit: FlushAtCommit,
    ) -> DbResult<Arc<Self>> {
        debug_assert!(n_rsegs >= 1 && n_rsegs <= undo::RSEG_N_SLOTS);
        let mut rsegs = Vec::with_capacity(n_rsegs);
        for id in 0..n_rsegs {
            rsegs.push(Arc::new(undo::rseg_create(&pool, id)?));
        }

        let mut mtr = Mtr::new();
        let page_id = PageId::new(SYSTEM_SPACE_ID, TRX_SYS_PAGE_NO);
        let slot = mtr.get_new_page(&pool, page_id)?;
        {
            let mut pg = mtr.page_mut(slot);
            if let Some(redo) = pg.redo.as_deref_mut() {
                redo.push(RedoRecord::PageInit {
                    space: SYSTEM_SPACE_ID,
                    page_no: TRX_SYS_PAGE_NO,
                    page_type: page::PAGE_TYPE_TRX_SYS,
                });
            }
            page::fil_page_init(&mut pg, page::PAGE_TYPE_TRX_SYS);
            pg.write_u64(TRX_SYS_TRX_ID, FIRST_TRX_ID + TRX_ID_WRITE_MARGIN);
            pg.write_u32(TRX_SYS_N_RSEGS, n_rsegs as u32);
            for (i, rseg) in rsegs.iter().enumerate() {
                pg.write_u32(TRX_SYS_RSEG_DIR + 4 * i, rseg.header_page);
            }
            for i in n_rsegs..undo::RSEG_N_SLOTS {
                pg.write_u32(TRX_SYS_RSEG_DIR + 4 * i, FIL_NULL);
            }
        }
        mtr.commit(&pool)?;
        info!("trx system bootstrapped with {} rsegs", n_rsegs);

        Ok(Arc::new(Self {
            kernel: Mutex::new(KernelState {
                next_id: FIRST_TRX_ID,
                persisted_up_to: FIRST_TRX_ID + TRX_ID_WRITE_MARGIN,
                active_writers: BTreeSet::new(),
                views: Vec::new(),
            }),
            rsegs,
            rr_counter: AtomicUsize::new(0),
            pool,
            lock_sys,
            flush_at_commit,
            max_trxs: 1024,
        }))
    }

    /// Opens an existing trx system: the persisted id high-water mark is
    /// taken as the next id, and the rseg directory is reloaded.
    pub fn open(
        pool: Arc<BufferPool>,
        lock_sys: Arc<LockSys>,
        flush_at_commit: FlushAtCommit,
    ) -> DbResult<Arc<Self>> {
        let mut mtr = Mtr::new();
        let page_id = PageId::new(SYSTEM_SPACE_ID, TRX_SYS_PAGE_NO);
        let slot = mtr.get_page(&pool, page_id, LatchMode::S)?;
        let frame = mtr.frame(slot);
        let stored_id = page::get_u64(frame, TRX_SYS_TRX_ID);
        let n_rsegs = page::get_u32(frame, TRX_SYS_N_RSEGS) as usize;
        let mut rsegs = Vec::with_capacity(n_rsegs);
        for i in 0..n_rsegs {
            let hdr = page::get_u32(frame, TRX_SYS_RSEG_DIR + 4 * i);
            debug_assert_ne!(hdr, FIL_NULL);
            rsegs.push(Arc::new(undo::rseg_open(i, hdr)));
        }
        mtr.commit(&pool)?;
        debug!("trx system opened: next id {}, {} rsegs", stored_id, n_rsegs);

        Ok(Arc::new(Self {
            kernel: Mutex::new(KernelState {
                next_id: stored_id,
                persisted_up_to: stored_id,
                active_writers: BTreeSet::new(),
                views: Vec::new(),
            }),
            rsegs,
            rr_counter: AtomicUsize::new(0),
            pool,
            lock_sys,
            flush_at_commit,
            max_trxs: 1024,
        }))
    }

    pub fn begin(&self, isolation: IsolationLevel) -> Arc<Trx> {
        Trx::new(isolation)
    }

    fn persist_id_high_water(&self, up_to: TrxId) -> DbResult<()> {
        let mut mtr = Mtr::new();
        let page_id = PageId::new(SYSTEM_SPACE_ID, TRX_SYS_PAGE_NO);
        let slot = mtr.get_page(&self.pool, page_id, LatchMode::X)?;
        {
            let mut pg = mtr.page_mut(slot);
            pg.write_u64(TRX_SYS_TRX_ID, up_to);
        }
        mtr.commit(&self.pool)?;
        Ok(())
    }

    /// Assigns a trx id and a rollback segment on the first write.
    pub fn assign_for_write(&self, trx: &Arc<Trx>) -> DbResult<()> {
        {
            let inner = trx.inner.lock();
            if inner.id != 0 {
                return Ok(());
            }
            if matches!(inner.state, TrxState::CommittedInMemory) {
                return Err(DbError::Panic("write on a committed transaction".into()));
            }
        }
        let (id, persist) = {
            let _rank = RankGuard::new(LatchRank::Kernel);
            let mut kernel = self.kernel.lock();
            if kernel.active_writers.len() >= self.max_trxs {
                return Err(DbError::TooManyConcurrentTrxs);
            }
            let id = kernel.next_id;
            kernel.next_id += 1;
            kernel.active_writers.insert(id);
            let persist = if kernel.next_id + TRX_ID_WRITE_MARGIN / 2 > kernel.persisted_up_to {
                kernel.persisted_up_to = kernel.next_id + TRX_ID_WRITE_MARGIN;
                Some(kernel.persisted_up_to)
            } else {
                None
            };
            (id, persist)
        };
        if let Some(up_to) = persist {
            self.persist_id_high_water(up_to)?;
        }

        let rseg_id = self.rr_counter.fetch_add(1, Ordering::Relaxed) % self.rsegs.len();
        let mut inner = trx.inner.lock();
        inner.id = id;
        inner.rseg_id = Some(rseg_id);
        inner.state = TrxState::Active;
        debug!("trx {} active on rseg {}", id, rseg_id);
        Ok(())
    }

    pub fn rseg_of(&self, trx: &Trx) -> Arc<Rseg> {
        let rseg_id = trx.inner.lock().rseg_id.expect("trx has an rseg");
        self.rsegs[rseg_id].clone()
    }

    /// The undo log handle for `kind`, allocating it on first use.
    pub fn ensure_undo(&self, trx: &Arc<Trx>, kind: UndoKind) -> DbResult<UndoHandle> {
        self.assign_for_write(trx)?;
        let (id, rseg_id, existing) = {
            let inner = trx.inner.lock();
            let existing = if kind.is_insert() {
                inner.insert_undo
            } else {
                inner.update_undo
            };
            (inner.id, inner.rseg_id.expect("assigned"), existing)
        };
        if let Some(handle) = existing {
            return Ok(handle);
        }
        let assign_kind = if kind.is_insert() {
            UndoKind::Insert
        } else {
            UndoKind::UpdateExists
        };
        let handle = undo::undo_assign(&self.pool, &self.rsegs[rseg_id], id, assign_kind)?;
        let mut inner = trx.inner.lock();
        if kind.is_insert() {
            inner.insert_undo = Some(handle);
        } else {
            inner.update_undo = Some(handle);
        }
        Ok(handle)
    }

    /// Appends an undo record for the transaction's next operation and
    /// returns its roll pointer.
    pub fn write_undo(&self, trx: &Arc<Trx>, mut rec: UndoRec) -> DbResult<u64> {
        let handle = self.ensure_undo(trx, rec.kind)?;
        let (id, undo_no) = {
            let mut inner = trx.inner.lock();
            let undo_no = inner.undo_no;
            inner.undo_no += 1;
            (inner.id, undo_no)
        };
        rec.trx_id = id;
        rec.undo_no = undo_no;
        let rseg = &self.rsegs[handle.rseg_id];
        let roll_ptr = undo::undo_append(&self.pool, rseg, &handle, &rec)?;
        self.lock_sys.set_trx_weight(id, undo_no + 1);
        Ok(roll_ptr)
    }

    /// Opens (or reuses, under REPEATABLE READ) the transaction's read view.
    pub fn read_view(&self, trx: &Arc<Trx>) -> Arc<ReadView> {
        {
            let inner = trx.inner.lock();
            if inner.isolation == IsolationLevel::RepeatableRead {
                if let Some(view) = &inner.read_view {
                    return view.clone();
                }
            }
        }
        let creator = trx.inner.lock().id;
        let view = {
            let _rank = RankGuard::new(LatchRank::Kernel);
            let mut kernel = self.kernel.lock();
            let view = Arc::new(ReadView {
                low_limit: kernel.next_id,
                up_limit: kernel
                    .active_writers
                    .iter()
                    .next()
                    .copied()
                    .unwrap_or(kernel.next_id),
                active: kernel.active_writers.iter().copied().collect(),
                creator,
            });
            kernel.views.push(Arc::downgrade(&view));
            kernel.views.retain(|w| w.strong_count() > 0);
            view
        };
        trx.inner.lock().read_view = Some(view.clone());
        view
    }

    /// The purge horizon: the oldest limit any open read view needs, or the
    /// current next id when no view is open.
    pub fn purge_horizon(&self) -> TrxId {
        let _rank = RankGuard::new(LatchRank::Kernel);
        let mut kernel = self.kernel.lock();
        kernel.views.retain(|w| w.strong_count() > 0);
        kernel
            .views
            .iter()
            .filter_map(|w| w.upgrade())
            .map(|v| v.up_limit)
            .min()
            .unwrap_or(kernel.next_id)
    }

    pub fn n_active_writers(&self) -> usize {
        self.kernel.lock().active_writers.len()
    }

    /// Transitions ACTIVE -> PREPARED, marking the undo logs so recovery
    /// leaves the transaction for client resolution.
    pub fn prepare(&self, trx: &Arc<Trx>) -> DbResult<()> {
        let (insert_undo, update_undo) = {
            let mut inner = trx.inner.lock();
            if inner.state != TrxState::Active {
                return Err(DbError::Panic(format!(
                    "prepare in state {:?}",
                    inner.state
                )));
            }
            inner.state = TrxState::Prepared;
            (inner.insert_undo, inner.update_undo)
        };
        for handle in [insert_undo, update_undo].into_iter().flatten() {
            undo::undo_set_prepared(&self.pool, &handle)?;
        }
        Ok(())
    }

    /// Commits the transaction.
    pub fn commit(&self, trx: &Arc<Trx>) -> DbResult<()> {
        crate::failpoint::maybe_fail("trx.commit.start")?;
        let (id, insert_undo, update_undo) = {
            let mut inner = trx.inner.lock();
            match inner.state {
                TrxState::NotStarted => {
                    // Read-only: drop the view and reuse the handle.
                    inner.read_view = None;
                    inner.savepoints.clear();
                    return Ok(());
                }
                TrxState::Active | TrxState::Prepared => {}
                TrxState::CommittedInMemory => {
                    return Err(DbError::Panic("double commit".into()));
                }
            }
            (inner.id, inner.insert_undo.take(), inner.update_undo.take())
        };

        // Serialization number and visibility switch, under the kernel.
        let trx_no = {
            let _rank = RankGuard::new(LatchRank::Kernel);
            let mut kernel = self.kernel.lock();
            let trx_no = kernel.next_id;
            kernel.next_id += 1;
            kernel.active_writers.remove(&id);
            trx_no
        };
        {
            let mut inner = trx.inner.lock();
            inner.trx_no = trx_no;
            inner.state = TrxState::CommittedInMemory;
        }

        // Undo state changes; the kernel mutex is not held across the page
        // writes, the per-rseg mutex orders history insertion.
        if let Some(handle) = update_undo {
            undo::undo_finish_update_at_commit(
                &self.pool,
                &self.rsegs[handle.rseg_id],
                &handle,
                trx_no,
            )?;
        }
        crate::failpoint::maybe_fail("trx.commit.before_insert_undo_free")?;
        if let Some(handle) = insert_undo {
            undo::undo_finish_insert_at_commit(&self.pool, &self.rsegs[handle.rseg_id], &handle)?;
        }

        // Wake waiters.
        self.lock_sys.release_all(id);

        // Make the commit durable per policy.
        match self.flush_at_commit {
            FlushAtCommit::Fsync => {
                let lsn = self.pool.log.current_lsn();
                self.pool.log.flush_to_lsn(lsn, true)?;
            }
            FlushAtCommit::WriteOnly => {
                let lsn = self.pool.log.current_lsn();
                self.pool.log.flush_to_lsn(lsn, false)?;
            }
            FlushAtCommit::None => {}
        }

        let mut inner = trx.inner.lock();
        inner.state = TrxState::NotStarted;
        inner.id = 0;
        inner.trx_no = 0;
        inner.rseg_id = None;
        inner.undo_no = 0;
        inner.read_view = None;
        inner.savepoints.clear();
        inner.rolled.clear();
        debug!("trx {} committed as no {}", id, trx_no);
        Ok(())
    }

    /// Rolls the transaction back (fully, or to `target_undo_no`), applying
    /// each undo record through `apply` from the newest backward.
    pub fn rollback_low(
        &self,
        trx: &Arc<Trx>,
        target_undo_no: Option<u64>,
        mut apply: impl FnMut(&UndoRec) -> DbResult<()>,
    ) -> DbResult<()> {
        let (id, insert_undo, update_undo, rolled) = {
            let inner = trx.inner.lock();
            if inner.state == TrxState::NotStarted {
                return Ok(());
            }
            (
                inner.id,
                inner.insert_undo,
                inner.update_undo,
                inner.rolled.clone(),
            )
        };
        let target = target_undo_no.unwrap_or(0);

        // Collect records from both logs, newest first.
        let mut recs: Vec<UndoRec> = Vec::new();
        for handle in [update_undo, insert_undo].into_iter().flatten() {
            let rseg_id = handle.rseg_id;
            for (_, rec) in undo::undo_log_records(&self.pool, rseg_id, handle.hdr_page)? {
                if rec.undo_no >= target && !rolled.contains(rec.undo_no) {
                    recs.push(rec);
                }
            }
        }
        recs.sort_by(|a, b| b.undo_no.cmp(&a.undo_no));
        let n = recs.len();
        for rec in &recs {
            apply(rec)?;
        }
        debug!("trx {} rolled back {} undo records to {}", id, n, target);

        let full = target_undo_no.is_none();
        if full {
            // Nothing committed: both undo logs can be thrown away.
            if let Some(handle) = update_undo {
                undo::undo_finish_update_at_commit(
                    &self.pool,
                    &self.rsegs[handle.rseg_id],
                    &handle,
                    0,
                )?;
                // An all-rolled-back log is immediately purgeable; leave it
                // on the history list for the purge thread.
            }
            if let Some(handle) = insert_undo {
                undo::undo_finish_insert_at_commit(
                    &self.pool,
                    &self.rsegs[handle.rseg_id],
                    &handle,
                )?;
            }
            self.lock_sys.release_all(id);
            {
                let _rank = RankGuard::new(LatchRank::Kernel);
                let mut kernel = self.kernel.lock();
                kernel.active_writers.remove(&id);
            }
            let mut inner = trx.inner.lock();
            inner.state = TrxState::NotStarted;
            inner.id = 0;
            inner.rseg_id = None;
            inner.insert_undo = None;
            inner.update_undo = None;
            inner.undo_no = 0;
            inner.read_view = None;
            inner.savepoints.clear();
            inner.rolled.clear();
        } else {
            let mut inner = trx.inner.lock();
            let hi = inner.undo_no;
            inner.rolled.add(target, hi);
            inner.savepoints.retain(|(_, no)| *no < target);
        }
        Ok(())
    }

    pub fn savepoint(&self, trx: &Arc<Trx>, name: &str) {
        let mut inner = trx.inner.lock();
        let undo_no = inner.undo_no;
        inner.savepoints.retain(|(n, _)| n != name);
        inner.savepoints.push((name.to_string(), undo_no));
    }

    pub fn savepoint_undo_no(&self, trx: &Arc<Trx>, name: &str) -> Option<u64> {
        trx.inner
            .lock()
            .savepoints
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, no)| *no)
    }

    pub fn release_savepoint(&self, trx: &Arc<Trx>, name: &str) -> bool {
        let mut inner = trx.inner.lock();
        let before = inner.savepoints.len();
        inner.savepoints.retain(|(n, _)| n != name);
        inner.savepoints.len() != before
    }

    /// Closes the statement-scoped view under READ COMMITTED.
    pub fn end_statement(&self, trx: &Arc<Trx>) {
        let mut inner = trx.inner.lock();
        if inner.isolation == IsolationLevel::ReadCommitted {
            inner.read_view = None;
        }
    }

    /// Default lock wait budget for this system.
    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_secs(50)
    }
}

/// Reconstructs the version of a clustered row visible in `view`.
/// Returns the visible `(fields, delete_marked)`, or `None` when the row
/// did not exist for this view.
pub fn visible_version(
    pool: &Arc<BufferPool>,
    index: &IndexDef,
    stored: &Tuple,
    delete_marked: bool,
    view: &ReadView,
) -> DbResult<Option<(Tuple, bool)>> {
    debug_assert!(index.clustered);
    let mut cur = stored.clone();
    let mut marked = delete_marked;
    loop {
        let trx_id = field_u64(&cur, index.trx_id_pos());
        if view.sees(trx_id) {
            return Ok(Some((cur, marked)));
        }
        let roll_ptr = field_u64(&cur, index.roll_ptr_pos());
        if roll_ptr_is_insert(roll_ptr) {
            // The invisible version is the row's birth: it does not exist
            // for this view.
            return Ok(None);
        }
        let urec = undo_read(pool, roll_ptr)?;
        if urec.trx_id != trx_id {
            return Err(DbError::MissingHistory);
        }
        // Substitute the pre-image.
        cur.fields[index.trx_id_pos()] = urec.old_trx_id.to_be_bytes().to_vec();
        cur.fields[index.roll_ptr_pos()] = urec.old_roll_ptr.to_be_bytes().to_vec();
        for (field_no, old) in &urec.updated {
            cur.fields[index.stored_pos(*field_no as usize)] = old.clone();
        }
        marked = urec.old_delete_mark;
    }
}

pub fn field_u64(tuple: &Tuple, pos: usize) -> u64 {
    let f = &tuple.fields[pos];
    debug_assert_eq!(f.len(), 8);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(f);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tablespace::SpaceRegistry;
    use crate::wal::{LogSys, LOG_START_LSN};
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Arc<TrxSys>) {
        let dir = tempdir().unwrap();
        let spaces = Arc::new(SpaceRegistry::new(dir.path()).unwrap());
        spaces.open_or_create_system_space().unwrap();
        let log = LogSys::open(dir.path().join("redo.log"), 1 << 24, LOG_START_LSN).unwrap();
        let pool = Arc::new(BufferPool::new(64, spaces, log));
        let lock_sys = Arc::new(LockSys::new(10_000));
        let trx_sys =
            TrxSys::create(pool, lock_sys, 2, FlushAtCommit::None).unwrap();
        (dir, trx_sys)
    }

    #[test]
    fn ids_are_assigned_on_first_write_only() {
        let (_dir, sys) = setup();
        let trx = sys.begin(IsolationLevel::RepeatableRead);
        assert_eq!(trx.id(), 0);
        assert_eq!(trx.state(), TrxState::NotStarted);

        sys.assign_for_write(&trx).unwrap();
        let id = trx.id();
        assert!(id >= FIRST_TRX_ID);
        assert_eq!(trx.state(), TrxState::Active);

        // Idempotent.
        sys.assign_for_write(&trx).unwrap();
        assert_eq!(trx.id(), id);
    }

    #[test]
    fn read_view_excludes_active_writers() {
        let (_dir, sys) = setup();
        let writer = sys.begin(IsolationLevel::RepeatableRead);
        sys.assign_for_write(&writer).unwrap();
        let writer_id = writer.id();

        let reader = sys.begin(IsolationLevel::RepeatableRead);
        let view = sys.read_view(&reader);
        assert!(!view.sees(writer_id));
        assert!(view.sees(writer_id - 1));

        sys.commit(&writer).unwrap();
        // The repeatable-read view is stable.
        let view2 = sys.read_view(&reader);
        assert!(!view2.sees(writer_id));
    }

    #[test]
    fn read_committed_refreshes_per_statement() {
        let (_dir, sys) = setup();
        let writer = sys.begin(IsolationLevel::RepeatableRead);
        sys.assign_for_write(&writer).unwrap();
        let writer_id = writer.id();

        let reader = sys.begin(IsolationLevel::ReadCommitted);
        let view = sys.read_view(&reader);
        assert!(!view.sees(writer_id));

        sys.commit(&writer).unwrap();
        sys.end_statement(&reader);
        let view2 = sys.read_view(&reader);
        assert!(view2.sees(writer_id));
    }

    #[test]
    fn commit_resets_the_handle_for_reuse() {
        let (_dir, sys) = setup();
        let trx = sys.begin(IsolationLevel::RepeatableRead);
        sys.assign_for_write(&trx).unwrap();
        sys.commit(&trx).unwrap();
        assert_eq!(trx.state(), TrxState::NotStarted);
        assert_eq!(trx.id(), 0);
        assert_eq!(sys.n_active_writers(), 0);

        sys.assign_for_write(&trx).unwrap();
        assert_eq!(trx.state(), TrxState::Active);
    }

    #[test]
    fn purge_horizon_tracks_oldest_view() {
        let (_dir, sys) = setup();
        let t1 = sys.begin(IsolationLevel::RepeatableRead);
        let v1 = sys.read_view(&t1);
        let horizon = sys.purge_horizon();
        assert!(horizon <= v1.low_limit);

        drop(v1);
        sys.commit(&t1).unwrap();
        let after = sys.purge_horizon();
        assert!(after >= horizon);
    }

    #[test]
    fn version_chain_walks_to_visible_version() {
        let (_dir, sys) = setup();
        let index = IndexDef {
            id: 9,
            space: SYSTEM_SPACE_ID,
            root: 0,
            n_key_fields: 1,
            n_fields: 2,
            clustered: true,
            compare: page::default_tuple_compare,
        };

        // Writer updates a row; its undo holds the pre-image.
        let writer = sys.begin(IsolationLevel::RepeatableRead);
        sys.assign_for_write(&writer).unwrap();
        let writer_id = writer.id();
        let roll_ptr = sys
            .write_undo(
                &writer,
                UndoRec {
                    kind: UndoKind::UpdateExists,
                    trx_id: 0,
                    undo_no: 0,
                    index_id: index.id,
                    key: vec![1u64.to_be_bytes().to_vec()],
                    updated: vec![(1, 10u64.to_be_bytes().to_vec())],
                    old_trx_id: 5,
                    old_roll_ptr: crate::undo::roll_ptr_pack(true, 0, 0, 0),
                    old_delete_mark: false,
                    ordering_old: Vec::new(),
                },
            )
            .unwrap();

        let row = Tuple::new(vec![
            1u64.to_be_bytes().to_vec(),
            writer_id.to_be_bytes().to_vec(),
            roll_ptr.to_be_bytes().to_vec(),
            99u64.to_be_bytes().to_vec(),
        ]);

        // A view that does not see the writer reconstructs b = 10.
        let old_view = ReadView {
            low_limit: writer_id,
            up_limit: writer_id,
            active: vec![],
            creator: 0,
        };
        let (version, marked) =
            visible_version(&sys.pool, &index, &row, false, &old_view)
                .unwrap()
                .expect("pre-image exists");
        assert!(!marked);
        assert_eq!(version.fields[3], 10u64.to_be_bytes().to_vec());

        // A fresh view sees the current row.
        let new_view = ReadView {
            low_limit: writer_id + 1,
            up_limit: writer_id + 1,
            active: vec![],
            creator: 0,
        };
        let (version, _) = visible_version(&sys.pool, &index, &row, false, &new_view)
            .unwrap()
            .expect("current row visible");
        assert_eq!(version.fields[3], 99u64.to_be_bytes().to_vec());
    }
}
