//! Record and table locks.
//!
//! Record locks cover heap-numbered slots of a page through a bitmap plus a
//! mode and range flags (gap / record-not-gap / insert-intention / next-key
//! when neither gap flag is set). Requests never block inside the lock
//! mutex: a conflicting request enqueues a waiting lock and the caller,
//! after releasing its page latches, suspends in [`LockSys::wait_for_lock`].
//! Deadlocks are found by a bounded DFS over the waits-for edges; the
//! lighter transaction loses. A monitor thread flags expired waiters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};
use parking_lot::{Condvar, Mutex};

use crate::errors::{DbError, DbResult};
use crate::sync::{LatchRank, RankGuard};
use crate::{HeapNo, PageId, TrxId};

pub const LOCK_GAP: u8 = 0x01;
pub const LOCK_REC_NOT_GAP: u8 = 0x02;
pub const LOCK_INSERT_INTENTION: u8 = 0x04;

/// Record lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    S,
    X,
}

impl LockMode {
    fn compatible(self, other: LockMode) -> bool {
        matches!((self, other), (LockMode::S, LockMode::S))
    }

    fn covers(self, other: LockMode) -> bool {
        self == LockMode::X || other == LockMode::S
    }
}

/// Table lock mode with the standard intention-lock compatibility matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableLockMode {
    IS,
    IX,
    S,
    X,
}

impl TableLockMode {
    fn compatible(self, other: TableLockMode) -> bool {
        use TableLockMode::*;
        match (self, other) {
            (IS, X) | (X, IS) => false,
            (IX, S) | (S, IX) => false,
            (IX, X) | (X, IX) => false,
            (S, X) | (X, S) => false,
            (X, X) => false,
            _ => true,
        }
    }

    fn covers(self, other: TableLockMode) -> bool {
        use TableLockMode::*;
        self == other
            || match (self, other) {
                (X, _) => true,
                (S, IS) => true,
                (IX, IS) => true,
                _ => false,
            }
    }
}

/// Outcome of a lock request. `Waiting` obliges the caller to release its
/// page latches and call [`LockSys::wait_for_lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockReply {
    Granted,
    Waiting,
}

#[derive(Debug)]
struct RecLock {
    trx_id: TrxId,
    mode: LockMode,
    flags: u8,
    waiting: bool,
    bitmap: Vec<u8>,
}

impl RecLock {
    fn new(trx_id: TrxId, mode: LockMode, flags: u8, heap_no: HeapNo) -> Self {
        let mut lock = Self {
            trx_id,
            mode,
            flags,
            waiting: false,
            bitmap: Vec::new(),
        };
        lock.set_bit(heap_no);
        lock
    }

    fn set_bit(&mut self, heap_no: HeapNo) {
        let byte = heap_no as usize / 8;
        if byte >= self.bitmap.len() {
            self.bitmap.resize(byte + 1, 0);
        }
        self.bitmap[byte] |= 1 << (heap_no % 8);
    }

    fn clear_bit(&mut self, heap_no: HeapNo) {
        let byte = heap_no as usize / 8;
        if byte < self.bitmap.len() {
            self.bitmap[byte] &= !(1 << (heap_no % 8));
        }
    }

    fn has_bit(&self, heap_no: HeapNo) -> bool {
        let byte = heap_no as usize / 8;
        byte < self.bitmap.len() && self.bitmap[byte] & (1 << (heap_no % 8)) != 0
    }

    fn bits(&self) -> Vec<HeapNo> {
        let mut out = Vec::new();
        for (byte, b) in self.bitmap.iter().enumerate() {
            for bit in 0..8 {
                if b & (1 << bit) != 0 {
                    out.push((byte * 8 + bit) as HeapNo);
                }
            }
        }
        out
    }

    fn is_empty(&self) -> bool {
        self.bitmap.iter().all(|b| *b == 0)
    }

    fn is_insert_intention(&self) -> bool {
        self.flags & LOCK_INSERT_INTENTION != 0
    }

    /// Whether this lock's range semantics include the gap before the record.
    fn covers_gap(&self) -> bool {
        self.flags & LOCK_REC_NOT_GAP == 0
    }

    /// Whether this lock's range semantics include the record itself.
    fn covers_rec(&self) -> bool {
        self.flags & (LOCK_GAP | LOCK_INSERT_INTENTION) == 0
    }
}

/// Does a request `(mode, flags)` conflict with a queued lock on the same
/// heap slot held or requested by another transaction?
fn rec_conflicts(req_mode: LockMode, req_flags: u8, other: &RecLock) -> bool {
    // Granted or waiting insert-intention locks block nobody.
    if other.is_insert_intention() {
        return false;
    }
    if req_flags & LOCK_INSERT_INTENTION != 0 {
        // An inserter queues behind anything covering the gap.
        return other.covers_gap();
    }
    if req_mode.compatible(other.mode) {
        return false;
    }
    // Gap regions never conflict with each other; only record coverage does.
    let req_covers_rec = req_flags & LOCK_GAP == 0;
    req_covers_rec && other.covers_rec()
}

#[derive(Debug)]
struct TableLock {
    trx_id: TrxId,
    mode: TableLockMode,
    waiting: bool,
}

#[derive(Debug, Clone)]
enum WaitTarget {
    Rec {
        page: PageId,
        heap_no: HeapNo,
        mode: LockMode,
        flags: u8,
    },
    Table {
        table: u64,
        mode: TableLockMode,
    },
}

#[derive(Debug, Default)]
struct TrxLockState {
    n_locks: usize,
    undo_len: u64,
    waiting: Option<WaitTarget>,
    victim: bool,
    timed_out: bool,
    deadline: Option<Instant>,
}

#[derive(Default)]
struct LockState {
    rec: HashMap<PageId, Vec<RecLock>>,
    tables: HashMap<u64, Vec<TableLock>>,
    trxs: HashMap<TrxId, TrxLockState>,
    n_lock_objects: usize,
}

impl LockState {
    fn trx(&mut self, trx_id: TrxId) -> &mut TrxLockState {
        self.trxs.entry(trx_id).or_default()
    }

    fn weight(&self, trx_id: TrxId) -> u64 {
        self.trxs
            .get(&trx_id)
            .map(|t| t.undo_len + t.n_locks as u64)
            .unwrap_or(0)
    }
}

const DEADLOCK_MAX_DEPTH: usize = 200;
const DEADLOCK_MAX_VISITS: usize = 2000;

/// The lock system.
pub struct LockSys {
    state: Mutex<LockState>,
    cvar: Condvar,
    max_locks: usize,
    monitor_stop: Arc<AtomicBool>,
    monitor_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl LockSys {
    pub fn new(max_locks: usize) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            cvar: Condvar::new(),
            max_locks,
            monitor_stop: Arc::new(AtomicBool::new(false)),
            monitor_handle: Mutex::new(None),
        }
    }

    /// Starts the lock-timeout monitor, which periodically flags expired
    /// waiters so they observe `LOCK_WAIT_TIMEOUT` on wakeup.
    pub fn spawn_timeout_monitor(self: &Arc<Self>, interval: Duration) {
        let sys = self.clone();
        let stop = self.monitor_stop.clone();
        let handle = thread::Builder::new()
            .name("granite-lock-timeout".into())
            .spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    thread::sleep(interval);
                    let _rank = RankGuard::new(LatchRank::LockSys);
                    let mut state = sys.state.lock();
                    let now = Instant::now();
                    let mut expired = false;
                    for trx in state.trxs.values_mut() {
                        if trx.waiting.is_some()
                            && trx.deadline.map_or(false, |d| now >= d)
                        {
                            trx.timed_out = true;
                            expired = true;
                        }
                    }
                    if expired {
                        sys.cvar.notify_all();
                    }
                }
            })
            .expect("spawn lock timeout monitor");
        *self.monitor_handle.lock() = Some(handle);
    }

    pub fn shutdown(&self) {
        self.monitor_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.monitor_handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// Updates the undo weight used by deadlock victim selection.
    pub fn set_trx_weight(&self, trx_id: TrxId, undo_len: u64) {
        let _rank = RankGuard::new(LatchRank::LockSys);
        self.state.lock().trx(trx_id).undo_len = undo_len;
    }

    /// Requests a record lock on `(page, heap_no)`.
    pub fn lock_record(
        &self,
        trx_id: TrxId,
        page: PageId,
        heap_no: HeapNo,
        mode: LockMode,
        flags: u8,
        timeout: Duration,
    ) -> DbResult<LockReply> {
        let _rank = RankGuard::new(LatchRank::LockSys);
        let mut state = self.state.lock();

        // Fast path: an existing granted lock already covers the request.
        let queue = state.rec.entry(page).or_default();
        let req_covers_gap = flags & (LOCK_REC_NOT_GAP) == 0;
        let req_covers_rec = flags & (LOCK_GAP | LOCK_INSERT_INTENTION) == 0;
        for lock in queue.iter() {
            if lock.trx_id == trx_id
                && !lock.waiting
                && lock.has_bit(heap_no)
                && lock.mode.covers(mode)
                && !lock.is_insert_intention()
                && (!req_covers_gap || lock.covers_gap())
                && (!req_covers_rec || lock.covers_rec())
            {
                return Ok(LockReply::Granted);
            }
        }

        // Conflict scan, in queue order.
        let conflict = queue
            .iter()
            .any(|l| l.trx_id != trx_id && l.has_bit(heap_no) && rec_conflicts(mode, flags, l));

        if state.n_lock_objects >= self.max_locks {
            return Err(DbError::LockTableFull);
        }

        if !conflict {
            let queue = state.rec.entry(page).or_default();
            // Merge into an existing granted lock of the same shape.
            if let Some(lock) = queue.iter_mut().find(|l| {
                l.trx_id == trx_id && !l.waiting && l.mode == mode && l.flags == flags
            }) {
                lock.set_bit(heap_no);
            } else {
                queue.push(RecLock::new(trx_id, mode, flags, heap_no));
                state.n_lock_objects += 1;
            }
            state.trx(trx_id).n_locks += 1;
            return Ok(LockReply::Granted);
        }

        // Enqueue a waiting lock and run deadlock detection.
        let mut lock = RecLock::new(trx_id, mode, flags, heap_no);
        lock.waiting = true;
        state.rec.entry(page).or_default().push(lock);
        state.n_lock_objects += 1;
        let trx = state.trx(trx_id);
        trx.waiting = Some(WaitTarget::Rec {
            page,
            heap_no,
            mode,
            flags,
        });
        trx.victim = false;
        trx.timed_out = false;
        trx.deadline = Some(Instant::now() + timeout);

        if let Some(victim) = self.pick_deadlock_victim(&mut state, trx_id) {
            if victim == trx_id {
                self.cancel_wait(&mut state, trx_id);
                debug!("trx {} chosen as deadlock victim (requester)", trx_id);
                return Err(DbError::Deadlock);
            }
            state.trx(victim).victim = true;
            info!("trx {} chosen as deadlock victim", victim);
            self.cvar.notify_all();
        }
        Ok(LockReply::Waiting)
    }

    /// Requests a table lock.
    pub fn lock_table(
        &self,
        trx_id: TrxId,
        table: u64,
        mode: TableLockMode,
        timeout: Duration,
    ) -> DbResult<LockReply> {
        let _rank = RankGuard::new(LatchRank::LockSys);
        let mut state = self.state.lock();

        let queue = state.tables.entry(table).or_default();
        if queue
            .iter()
            .any(|l| l.trx_id == trx_id && !l.waiting && l.mode.covers(mode))
        {
            return Ok(LockReply::Granted);
        }
        let conflict = queue
            .iter()
            .any(|l| l.trx_id != trx_id && !l.mode.compatible(mode));

        if state.n_lock_objects >= self.max_locks {
            return Err(DbError::LockTableFull);
        }

        let queue = state.tables.entry(table).or_default();
        if !conflict {
            queue.push(TableLock {
                trx_id,
                mode,
                waiting: false,
            });
            state.n_lock_objects += 1;
            state.trx(trx_id).n_locks += 1;
            return Ok(LockReply::Granted);
        }

        queue.push(TableLock {
            trx_id,
            mode,
            waiting: true,
        });
        state.n_lock_objects += 1;
        let trx = state.trx(trx_id);
        trx.waiting = Some(WaitTarget::Table { table, mode });
        trx.victim = false;
        trx.timed_out = false;
        trx.deadline = Some(Instant::now() + timeout);

        if let Some(victim) = self.pick_deadlock_victim(&mut state, trx_id) {
            if victim == trx_id {
                self.cancel_wait(&mut state, trx_id);
                return Err(DbError::Deadlock);
            }
            state.trx(victim).victim = true;
            self.cvar.notify_all();
        }
        Ok(LockReply::Waiting)
    }

    /// Suspends until the pending request is granted, the transaction is
    /// chosen as a deadlock victim, or the wait times out. The caller must
    /// hold no page latches.
    pub fn wait_for_lock(&self, trx_id: TrxId) -> DbResult<()> {
        let _rank = RankGuard::new(LatchRank::LockSys);
        let mut state = self.state.lock();
        loop {
            let trx = state.trx(trx_id);
            if trx.victim {
                self.cancel_wait(&mut state, trx_id);
                return Err(DbError::Deadlock);
            }
            if trx.timed_out {
                self.cancel_wait(&mut state, trx_id);
                return Err(DbError::LockWaitTimeout);
            }
            if trx.waiting.is_none() {
                return Ok(()); // granted
            }
            self.cvar.wait_for(&mut state, Duration::from_millis(50));
        }
    }

    /// Removes a waiting request after a deadlock or timeout.
    fn cancel_wait(&self, state: &mut LockState, trx_id: TrxId) {
        let target = state.trx(trx_id).waiting.take();
        state.trx(trx_id).victim = false;
        state.trx(trx_id).timed_out = false;
        match target {
            Some(WaitTarget::Rec { page, .. }) => {
                if let Some(queue) = state.rec.get_mut(&page) {
                    let before = queue.len();
                    queue.retain(|l| !(l.trx_id == trx_id && l.waiting));
                    state.n_lock_objects -= before - state.rec[&page].len();
                    self.grant_waiters_on_page(state, page);
                }
            }
            Some(WaitTarget::Table { table, .. }) => {
                if let Some(queue) = state.tables.get_mut(&table) {
                    let before = queue.len();
                    queue.retain(|l| !(l.trx_id == trx_id && l.waiting));
                    state.n_lock_objects -= before - state.tables[&table].len();
                    self.grant_waiters_on_table(state, table);
                }
            }
            None => {}
        }
        self.cvar.notify_all();
    }

    /// Releases every lock of a transaction and wakes newly grantable
    /// waiters. Called at commit and rollback.
    pub fn release_all(&self, trx_id: TrxId) {
        let _rank = RankGuard::new(LatchRank::LockSys);
        let mut state = self.state.lock();

        let pages: Vec<PageId> = state
            .rec
            .iter()
            .filter(|(_, q)| q.iter().any(|l| l.trx_id == trx_id))
            .map(|(p, _)| *p)
            .collect();
        for page in pages {
            let queue = state.rec.get_mut(&page).expect("page queue exists");
            let before = queue.len();
            queue.retain(|l| l.trx_id != trx_id);
            let removed = before - queue.len();
            state.n_lock_objects -= removed;
            if state.rec[&page].is_empty() {
                state.rec.remove(&page);
            } else {
                self.grant_waiters_on_page(&mut state, page);
            }
        }

        let tables: Vec<u64> = state
            .tables
            .iter()
            .filter(|(_, q)| q.iter().any(|l| l.trx_id == trx_id))
            .map(|(t, _)| *t)
            .collect();
        for table in tables {
            let queue = state.tables.get_mut(&table).expect("table queue exists");
            let before = queue.len();
            queue.retain(|l| l.trx_id != trx_id);
            let removed = before - queue.len();
            state.n_lock_objects -= removed;
            if state.tables[&table].is_empty() {
                state.tables.remove(&table);
            } else {
                self.grant_waiters_on_table(&mut state, table);
            }
        }

        state.trxs.remove(&trx_id);
        self.cvar.notify_all();
    }

    /// Grants waiting locks on a page that no longer conflict, FIFO.
    fn grant_waiters_on_page(&self, state: &mut LockState, page: PageId) {
        let Some(queue) = state.rec.get_mut(&page) else {
            return;
        };
        let mut granted_trxs = Vec::new();
        for i in 0..queue.len() {
            if !queue[i].waiting {
                continue;
            }
            let heap_no = queue[i].bits().first().copied().unwrap_or(0);
            let (mode, flags, trx_id) = (queue[i].mode, queue[i].flags, queue[i].trx_id);
            let conflict = queue[..i]
                .iter()
                .any(|l| l.trx_id != trx_id && l.has_bit(heap_no) && rec_conflicts(mode, flags, l));
            if !conflict {
                queue[i].waiting = false;
                granted_trxs.push(trx_id);
            }
        }
        for trx_id in granted_trxs {
            let trx = state.trx(trx_id);
            trx.waiting = None;
            trx.deadline = None;
            trx.n_locks += 1;
        }
    }

    fn grant_waiters_on_table(&self, state: &mut LockState, table: u64) {
        let Some(queue) = state.tables.get_mut(&table) else {
            return;
        };
        let mut granted_trxs = Vec::new();
        for i in 0..queue.len() {
            if !queue[i].waiting {
                continue;
            }
            let (mode, trx_id) = (queue[i].mode, queue[i].trx_id);
            let conflict = queue[..i]
                .iter()
                .any(|l| l.trx_id != trx_id && !l.mode.compatible(mode));
            if !conflict {
                queue[i].waiting = false;
                granted_trxs.push(trx_id);
            }
        }
        for trx_id in granted_trxs {
            let trx = state.trx(trx_id);
            trx.waiting = None;
            trx.deadline = None;
            trx.n_locks += 1;
        }
    }

    /// Transactions blocking `trx_id`'s pending request.
    fn blockers_of(&self, state: &LockState, trx_id: TrxId) -> Vec<TrxId> {
        let Some(trx) = state.trxs.get(&trx_id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        match &trx.waiting {
            Some(WaitTarget::Rec {
                page,
                heap_no,
                mode,
                flags,
            }) => {
                if let Some(queue) = state.rec.get(page) {
                    // Everything queued ahead of our waiting lock counts.
                    for l in queue {
                        if l.trx_id == trx_id && l.waiting {
                            break;
                        }
                        if l.trx_id != trx_id
                            && l.has_bit(*heap_no)
                            && rec_conflicts(*mode, *flags, l)
                        {
                            out.push(l.trx_id);
                        }
                    }
                }
            }
            Some(WaitTarget::Table { table, mode }) => {
                if let Some(queue) = state.tables.get(table) {
                    for l in queue {
                        if l.trx_id == trx_id && l.waiting {
                            break;
                        }
                        if l.trx_id != trx_id && !l.mode.compatible(*mode) {
                            out.push(l.trx_id);
                        }
                    }
                }
            }
            None => {}
        }
        out
    }

    /// Bounded DFS through waits-for edges from the requester. Returns the
    /// chosen victim when a cycle back to the requester is found.
    fn pick_deadlock_victim(&self, state: &mut LockState, start: TrxId) -> Option<TrxId> {
        let mut visits = 0usize;
        let mut stack: Vec<(TrxId, usize)> = vec![(start, 0)];
        let mut path: Vec<TrxId> = vec![start];
        let mut edges: Vec<Vec<TrxId>> = vec![self.blockers_of(state, start)];

        while !stack.is_empty() {
            let depth = stack.len() - 1;
            let edge_idx = stack[depth].1;
            if edge_idx >= edges[depth].len() || depth >= DEADLOCK_MAX_DEPTH {
                stack.pop();
                path.pop();
                edges.pop();
                continue;
            }
            let next = edges[depth][edge_idx];
            stack[depth].1 += 1;
            visits += 1;
            if visits > DEADLOCK_MAX_VISITS {
                // Too expensive: treat the requester as the victim, like a
                // search-depth overflow.
                return Some(start);
            }
            if next == start {
                // Cycle: pick the lighter of the requester and the heaviest
                // waiter on the cycle path.
                let victim = path
                    .iter()
                    .copied()
                    .filter(|t| state.trxs.get(t).map_or(false, |s| s.waiting.is_some()))
                    .min_by_key(|t| state.weight(*t))
                    .unwrap_or(start);
                return Some(victim);
            }
            if path.contains(&next) {
                continue; // a cycle not involving the requester
            }
            path.push(next);
            edges.push(self.blockers_of(state, next));
            stack.push((next, 0));
        }
        None
    }

    // Structure-change migration hooks, called by the B-tree with the pages
    // x-latched.

    /// Moves lock bits between pages after records moved (split, merge,
    /// root raise), preserving mode, flags and wait state.
    pub fn move_locks(&self, from: PageId, to: PageId, mapping: &[(HeapNo, HeapNo)]) {
        let _rank = RankGuard::new(LatchRank::LockSys);
        let mut state = self.state.lock();
        let mut additions: Vec<RecLock> = Vec::new();
        if let Some(queue) = state.rec.get_mut(&from) {
            for lock in queue.iter_mut() {
                let mut moved_bits = Vec::new();
                for &(old, new) in mapping {
                    if lock.has_bit(old) {
                        lock.clear_bit(old);
                        moved_bits.push(new);
                    }
                }
                if moved_bits.is_empty() {
                    continue;
                }
                if let Some(existing) = additions.iter_mut().find(|l| {
                    l.trx_id == lock.trx_id
                        && l.mode == lock.mode
                        && l.flags == lock.flags
                        && l.waiting == lock.waiting
                }) {
                    for b in &moved_bits {
                        existing.set_bit(*b);
                    }
                } else {
                    let mut fresh = RecLock {
                        trx_id: lock.trx_id,
                        mode: lock.mode,
                        flags: lock.flags,
                        waiting: lock.waiting,
                        bitmap: Vec::new(),
                    };
                    for b in &moved_bits {
                        fresh.set_bit(*b);
                    }
                    additions.push(fresh);
                }
            }
            let before = queue.len();
            queue.retain(|l| !l.is_empty());
            let removed = before - queue.len();
            state.n_lock_objects -= removed;
        }
        if !additions.is_empty() {
            // Re-point waiting transactions at the new page.
            for lock in &additions {
                if lock.waiting {
                    if let Some(trx) = state.trxs.get_mut(&lock.trx_id) {
                        if let Some(WaitTarget::Rec { page, heap_no, .. }) = &mut trx.waiting {
                            if *page == from {
                                *page = to;
                                if let Some(&b) = lock.bits().first() {
                                    *heap_no = b;
                                }
                            }
                        }
                    }
                }
            }
            let n = additions.len();
            state.rec.entry(to).or_default().extend(additions);
            state.n_lock_objects += n;
        }
    }

    /// Remaps lock bits after an in-place page reorganization.
    pub fn move_locks_same_page(&self, page: PageId, mapping: &[(HeapNo, HeapNo)]) {
        let identical = mapping.iter().all(|(old, new)| old == new);
        if identical {
            return;
        }
        let _rank = RankGuard::new(LatchRank::LockSys);
        let mut state = self.state.lock();
        if let Some(queue) = state.rec.get_mut(&page) {
            for lock in queue.iter_mut() {
                let old_bits = lock.bits();
                let mut new_bits = Vec::new();
                for b in old_bits {
                    if b <= crate::page::HEAP_NO_SUPREMUM {
                        new_bits.push(b); // pseudo-records keep their slots
                        continue;
                    }
                    match mapping.iter().find(|(old, _)| *old == b) {
                        Some(&(_, new)) => new_bits.push(new),
                        None => new_bits.push(b),
                    }
                }
                lock.bitmap.clear();
                for b in new_bits {
                    lock.set_bit(b);
                }
            }
        }
    }

    /// After a right split: the old supremum gap belongs to the right page,
    /// and locks on the first right record also guard the gap that now ends
    /// at the left page's supremum.
    pub fn update_split_right(&self, left: PageId, right: PageId, first_right_heap: HeapNo) {
        let _rank = RankGuard::new(LatchRank::LockSys);
        let mut state = self.state.lock();
        self.transfer_supremum(&mut state, left, right);

        // Inherit gap locks onto the left supremum.
        let inheritors: Vec<(TrxId, LockMode)> = state
            .rec
            .get(&right)
            .map(|q| {
                q.iter()
                    .filter(|l| {
                        !l.waiting && l.has_bit(first_right_heap) && l.covers_gap()
                            && !l.is_insert_intention()
                    })
                    .map(|l| (l.trx_id, l.mode))
                    .collect()
            })
            .unwrap_or_default();
        for (trx_id, mode) in inheritors {
            self.grant_gap_lock(&mut state, trx_id, left, crate::page::HEAP_NO_SUPREMUM, mode);
        }
    }

    /// After a record's physical removal its locks pass to the successor as
    /// gap locks, preserving next-key semantics.
    pub fn update_delete(
        &self,
        page: PageId,
        deleted_heap: HeapNo,
        succ_page: PageId,
        succ_heap: HeapNo,
    ) {
        let _rank = RankGuard::new(LatchRank::LockSys);
        let mut state = self.state.lock();
        let holders: Vec<(TrxId, LockMode)> = state
            .rec
            .get(&page)
            .map(|q| {
                q.iter()
                    .filter(|l| !l.waiting && l.has_bit(deleted_heap) && !l.is_insert_intention())
                    .map(|l| (l.trx_id, l.mode))
                    .collect()
            })
            .unwrap_or_default();
        if let Some(queue) = state.rec.get_mut(&page) {
            for lock in queue.iter_mut() {
                lock.clear_bit(deleted_heap);
            }
            let before = queue.len();
            queue.retain(|l| !l.is_empty() || l.waiting);
            let removed = before - queue.len();
            state.n_lock_objects -= removed;
        }
        for (trx_id, mode) in holders {
            self.grant_gap_lock(&mut state, trx_id, succ_page, succ_heap, mode);
        }
        self.grant_waiters_on_page(&mut state, page);
        self.cvar.notify_all();
    }

    /// After merging a page leftward (or into the root), its supremum gap
    /// locks continue on the target's supremum.
    pub fn update_merge_left(&self, from: PageId, to: Option<PageId>) {
        let _rank = RankGuard::new(LatchRank::LockSys);
        let mut state = self.state.lock();
        if let Some(to) = to {
            self.transfer_supremum(&mut state, from, to);
        }
        if let Some(queue) = state.rec.get_mut(&from) {
            let before = queue.len();
            queue.retain(|l| l.waiting);
            state.n_lock_objects -= before - state.rec[&from].len();
        }
        self.cvar.notify_all();
    }

    /// After a root raise the root's record and gap locks belong to the new
    /// child (record bits were moved separately).
    pub fn update_root_raise(&self, root: PageId, child: PageId) {
        let _rank = RankGuard::new(LatchRank::LockSys);
        let mut state = self.state.lock();
        self.transfer_supremum(&mut state, root, child);
    }

    fn transfer_supremum(&self, state: &mut LockState, from: PageId, to: PageId) {
        let sup = crate::page::HEAP_NO_SUPREMUM;
        let movers: Vec<(TrxId, LockMode)> = state
            .rec
            .get(&from)
            .map(|q| {
                q.iter()
                    .filter(|l| !l.waiting && l.has_bit(sup) && !l.is_insert_intention())
                    .map(|l| (l.trx_id, l.mode))
                    .collect()
            })
            .unwrap_or_default();
        if let Some(queue) = state.rec.get_mut(&from) {
            for lock in queue.iter_mut() {
                lock.clear_bit(sup);
            }
            let before = queue.len();
            queue.retain(|l| !l.is_empty() || l.waiting);
            let removed = before - queue.len();
            state.n_lock_objects -= removed;
        }
        for (trx_id, mode) in movers {
            self.grant_gap_lock(state, trx_id, to, sup, mode);
        }
    }

    /// Installs an inherited (granted) gap lock, merging where possible.
    fn grant_gap_lock(
        &self,
        state: &mut LockState,
        trx_id: TrxId,
        page: PageId,
        heap_no: HeapNo,
        mode: LockMode,
    ) {
        let queue = state.rec.entry(page).or_default();
        if let Some(lock) = queue
            .iter_mut()
            .find(|l| l.trx_id == trx_id && !l.waiting && l.mode == mode && l.flags == LOCK_GAP)
        {
            lock.set_bit(heap_no);
        } else {
            let mut lock = RecLock::new(trx_id, mode, LOCK_GAP, heap_no);
            lock.waiting = false;
            queue.push(lock);
            state.n_lock_objects += 1;
        }
        state.trx(trx_id).n_locks += 1;
    }

    /// Test/diagnostic helper: does the transaction hold a granted lock on
    /// the given heap slot?
    pub fn holds_record_lock(&self, trx_id: TrxId, page: PageId, heap_no: HeapNo) -> bool {
        let state = self.state.lock();
        state.rec.get(&page).map_or(false, |q| {
            q.iter()
                .any(|l| l.trx_id == trx_id && !l.waiting && l.has_bit(heap_no))
        })
    }

    pub fn n_lock_objects(&self) -> usize {
        self.state.lock().n_lock_objects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T1: TrxId = 1;
    const T2: TrxId = 2;
    const T3: TrxId = 3;
    const PAGE: PageId = PageId::new(1, 4);
    const TIMEOUT: Duration = Duration::from_secs(5);

    fn sys() -> LockSys {
        LockSys::new(10_000)
    }

    #[test]
    fn shared_locks_coexist_and_exclusive_conflicts() {
        let locks = sys();
        assert_eq!(
            locks.lock_record(T1, PAGE, 2, LockMode::S, 0, TIMEOUT).unwrap(),
            LockReply::Granted
        );
        assert_eq!(
            locks.lock_record(T2, PAGE, 2, LockMode::S, 0, TIMEOUT).unwrap(),
            LockReply::Granted
        );
        assert_eq!(
            locks.lock_record(T3, PAGE, 2, LockMode::X, 0, TIMEOUT).unwrap(),
            LockReply::Waiting
        );
    }

    #[test]
    fn release_grants_fifo_waiter() {
        let locks = sys();
        locks.lock_record(T1, PAGE, 2, LockMode::X, 0, TIMEOUT).unwrap();
        assert_eq!(
            locks.lock_record(T2, PAGE, 2, LockMode::X, 0, TIMEOUT).unwrap(),
            LockReply::Waiting
        );
        locks.release_all(T1);
        locks.wait_for_lock(T2).unwrap();
        assert!(locks.holds_record_lock(T2, PAGE, 2));
    }

    #[test]
    fn gap_locks_do_not_conflict_with_each_other() {
        let locks = sys();
        assert_eq!(
            locks
                .lock_record(T1, PAGE, 2, LockMode::X, LOCK_GAP, TIMEOUT)
                .unwrap(),
            LockReply::Granted
        );
        assert_eq!(
            locks
                .lock_record(T2, PAGE, 2, LockMode::X, LOCK_GAP, TIMEOUT)
                .unwrap(),
            LockReply::Granted
        );
    }

    #[test]
    fn record_only_lock_ignores_gap_lock() {
        let locks = sys();
        locks
            .lock_record(T1, PAGE, 2, LockMode::X, LOCK_GAP, TIMEOUT)
            .unwrap();
        assert_eq!(
            locks
                .lock_record(T2, PAGE, 2, LockMode::X, LOCK_REC_NOT_GAP, TIMEOUT)
                .unwrap(),
            LockReply::Granted
        );
    }

    #[test]
    fn insert_intention_waits_behind_gap_lock() {
        let locks = sys();
        locks
            .lock_record(T1, PAGE, 2, LockMode::S, LOCK_GAP, TIMEOUT)
            .unwrap();
        assert_eq!(
            locks
                .lock_record(
                    T2,
                    PAGE,
                    2,
                    LockMode::X,
                    LOCK_GAP | LOCK_INSERT_INTENTION,
                    TIMEOUT
                )
                .unwrap(),
            LockReply::Waiting
        );
        // But a granted insert-intention blocks nobody.
        locks.release_all(T1);
        locks.wait_for_lock(T2).unwrap();
        assert_eq!(
            locks
                .lock_record(T3, PAGE, 2, LockMode::S, LOCK_GAP, TIMEOUT)
                .unwrap(),
            LockReply::Granted
        );
    }

    #[test]
    fn deadlock_picks_the_lighter_victim() {
        let locks = sys();
        let page2 = PageId::new(1, 5);
        locks.set_trx_weight(T1, 100);
        locks.set_trx_weight(T2, 1);

        locks.lock_record(T1, PAGE, 2, LockMode::X, 0, TIMEOUT).unwrap();
        locks.lock_record(T2, page2, 2, LockMode::X, 0, TIMEOUT).unwrap();

        assert_eq!(
            locks.lock_record(T1, page2, 2, LockMode::X, 0, TIMEOUT).unwrap(),
            LockReply::Waiting
        );
        // T2 -> T1 -> T2 closes the cycle; T2 is lighter and loses.
        let reply = locks.lock_record(T2, PAGE, 2, LockMode::X, 0, TIMEOUT);
        match reply {
            Err(DbError::Deadlock) => {}
            Ok(LockReply::Waiting) => {
                let err = locks.wait_for_lock(T2).unwrap_err();
                assert!(matches!(err, DbError::Deadlock));
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn timeout_flagged_by_monitor() {
        let locks = Arc::new(sys());
        locks.spawn_timeout_monitor(Duration::from_millis(10));
        locks.lock_record(T1, PAGE, 2, LockMode::X, 0, TIMEOUT).unwrap();
        assert_eq!(
            locks
                .lock_record(T2, PAGE, 2, LockMode::X, 0, Duration::from_millis(30))
                .unwrap(),
            LockReply::Waiting
        );
        let err = locks.wait_for_lock(T2).unwrap_err();
        assert!(matches!(err, DbError::LockWaitTimeout));
        locks.shutdown();
    }

    #[test]
    fn lock_pool_exhaustion_reports_table_full() {
        let locks = LockSys::new(2);
        locks.lock_record(T1, PAGE, 2, LockMode::S, 0, TIMEOUT).unwrap();
        locks
            .lock_record(T1, PAGE, 3, LockMode::X, LOCK_REC_NOT_GAP, TIMEOUT)
            .unwrap();
        let err = locks
            .lock_record(T2, PAGE, 4, LockMode::S, LOCK_GAP, TIMEOUT)
            .unwrap_err();
        assert!(matches!(err, DbError::LockTableFull));
    }

    #[test]
    fn table_lock_matrix() {
        let locks = sys();
        assert_eq!(
            locks.lock_table(T1, 7, TableLockMode::IX, TIMEOUT).unwrap(),
            LockReply::Granted
        );
        assert_eq!(
            locks.lock_table(T2, 7, TableLockMode::IS, TIMEOUT).unwrap(),
            LockReply::Granted
        );
        assert_eq!(
            locks.lock_table(T3, 7, TableLockMode::S, TIMEOUT).unwrap(),
            LockReply::Waiting
        );
    }

    #[test]
    fn inherited_gap_lock_on_delete() {
        let locks = sys();
        locks
            .lock_record(T1, PAGE, 5, LockMode::X, 0, TIMEOUT)
            .unwrap();
        locks.update_delete(PAGE, 5, PAGE, 6);
        assert!(locks.holds_record_lock(T1, PAGE, 6));
        // The inherited lock is a gap lock: a record-only lock coexists.
        assert_eq!(
            locks
                .lock_record(T2, PAGE, 6, LockMode::X, LOCK_REC_NOT_GAP, TIMEOUT)
                .unwrap(),
            LockReply::Granted
        );
    }

    #[test]
    fn split_migrates_bits_and_inherits_supremum_gap() {
        let locks = sys();
        locks.lock_record(T1, PAGE, 7, LockMode::X, 0, TIMEOUT).unwrap();
        let right = PageId::new(1, 9);
        locks.move_locks(PAGE, right, &[(7, 2)]);
        assert!(!locks.holds_record_lock(T1, PAGE, 7));
        assert!(locks.holds_record_lock(T1, right, 2));

        locks.update_split_right(PAGE, right, 2);
        // The next-key lock on the first right record spawned a gap lock on
        // the left supremum.
        assert!(locks.holds_record_lock(T1, PAGE, crate::page::HEAP_NO_SUPREMUM));
    }
}
