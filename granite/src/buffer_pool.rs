//! The buffer pool: a fixed slab of page frames with an LRU (young/old
//! sublists), a free list, a page hash and a flush list ordered by oldest
//! modification LSN.
//!
//! Block latches are `parking_lot` reader-writer locks handed out as owned
//! guards, so a mini-transaction memo can hold them across calls and release
//! them in reverse acquisition order at commit.

use std::collections::{HashMap, VecDeque};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};

use crate::doublewrite::Doublewrite;
use crate::errors::{DbError, DbResult};
use crate::page::{self, PageCheck};
use crate::sync::{LatchRank, RankGuard};
use crate::tablespace::SpaceRegistry;
use crate::wal::LogSys;
use crate::{Lsn, PageId, SpaceId, PAGE_SIZE};

pub type FrameData = [u8; PAGE_SIZE];
type FrameLock = Arc<RwLock<Box<FrameData>>>;
type ReadGuard = ArcRwLockReadGuard<RawRwLock, Box<FrameData>>;
type WriteGuard = ArcRwLockWriteGuard<RawRwLock, Box<FrameData>>;

/// Latch mode requested from [`BufferPool::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    S,
    X,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IoFix {
    None,
    Read,
    Write,
}

#[derive(Debug)]
struct BlockMeta {
    page_id: Option<PageId>,
    io_fix: IoFix,
    oldest_modification: Lsn,
    newest_modification: Lsn,
    /// Set on second access; controls young-list promotion.
    accessed: bool,
}

/// A pool frame and its control data.
pub struct Block {
    pub index: usize,
    frame: FrameLock,
    meta: Mutex<BlockMeta>,
    pub buf_fix: AtomicU64,
    /// Bumped on every modification and on frame reuse; persistent cursors
    /// use it to validate optimistic restoration.
    pub modify_clock: AtomicU64,
}

impl Block {
    fn new(index: usize) -> Arc<Self> {
        Arc::new(Self {
            index,
            frame: Arc::new(RwLock::new(Box::new([0u8; PAGE_SIZE]))),
            meta: Mutex::new(BlockMeta {
                page_id: None,
                io_fix: IoFix::None,
                oldest_modification: 0,
                newest_modification: 0,
                accessed: false,
            }),
            buf_fix: AtomicU64::new(0),
            modify_clock: AtomicU64::new(0),
        })
    }

    pub fn page_id(&self) -> Option<PageId> {
        self.meta.lock().page_id
    }

    pub fn oldest_modification(&self) -> Lsn {
        self.meta.lock().oldest_modification
    }

    pub fn newest_modification(&self) -> Lsn {
        self.meta.lock().newest_modification
    }

    fn is_replaceable(&self, meta: &BlockMeta) -> bool {
        meta.oldest_modification == 0
            && meta.io_fix == IoFix::None
            && self.buf_fix.load(Ordering::SeqCst) == 0
    }
}

enum PageLatch {
    S(ReadGuard),
    X(WriteGuard),
}

/// An RAII latched reference to a pooled page. Dropping it unfixes the
/// block; the latch itself is released first (field order).
pub struct PageRef {
    latch: PageLatch,
    pub block: Arc<Block>,
    pub page_id: PageId,
}

impl std::fmt::Debug for PageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageRef").field("page_id", &self.page_id).finish()
    }
}

impl PageRef {
    pub fn frame(&self) -> &FrameData {
        match &self.latch {
            PageLatch::S(g) => g,
            PageLatch::X(g) => g,
        }
    }

    pub fn frame_mut(&mut self) -> &mut FrameData {
        match &mut self.latch {
            PageLatch::X(g) => g,
            PageLatch::S(_) => panic!("frame_mut on an S-latched page"),
        }
    }

    pub fn is_x(&self) -> bool {
        matches!(self.latch, PageLatch::X(_))
    }

    pub fn block_index(&self) -> usize {
        self.block.index
    }

    pub fn modify_clock(&self) -> u64 {
        self.block.modify_clock.load(Ordering::SeqCst)
    }
}

impl Drop for PageRef {
    fn drop(&mut self) {
        crate::sync::latch_exit(LatchRank::BlockLatch);
        self.block.buf_fix.fetch_sub(1, Ordering::SeqCst);
    }
}

struct PoolState {
    page_hash: HashMap<PageId, usize>,
    young: VecDeque<usize>,
    old: VecDeque<usize>,
    free: Vec<usize>,
}

struct FlushState {
    /// Ordered by `(oldest_modification, block)`. The ordered structure also
    /// serves recovery, which inserts dirty pages out of LSN order.
    list: BTreeSet<(Lsn, usize)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushKind {
    Lru = 0,
    List = 1,
}

/// Rolling 20-second window relating redo generation to LRU flushing; the
/// recommendation keeps flush-list writes ahead of log-capacity pressure.
pub struct FlushPacer {
    samples: VecDeque<(Instant, Lsn, u64)>,
}

impl FlushPacer {
    const WINDOW: Duration = Duration::from_secs(20);

    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
        }
    }

    pub fn sample(&mut self, redo_lsn: Lsn, lru_flushed_total: u64) {
        let now = Instant::now();
        self.samples.push_back((now, redo_lsn, lru_flushed_total));
        while let Some(&(t, _, _)) = self.samples.front() {
            if now.duration_since(t) > Self::WINDOW && self.samples.len() > 2 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Target pages per second for the next flush-list batch:
    /// `dirty × redo_rate / log_capacity − lru_rate`, floored at zero.
    pub fn recommend(&self, n_dirty: usize, log_capacity: u64) -> usize {
        let (Some(&(t0, lsn0, lru0)), Some(&(t1, lsn1, lru1))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0;
        };
        let secs = t1.duration_since(t0).as_secs_f64();
        if secs < 1.0 || log_capacity == 0 {
            return 0;
        }
        let redo_rate = (lsn1 - lsn0) as f64 / secs;
        let lru_rate = (lru1 - lru0) as f64 / secs;
        let target = n_dirty as f64 * redo_rate / log_capacity as f64 - lru_rate;
        target.max(0.0) as usize
    }
}

/// The buffer pool manager.
pub struct BufferPool {
    blocks: Vec<Arc<Block>>,
    state: Mutex<PoolState>,
    flush_state: Mutex<FlushState>,
    batch_running: [AtomicBool; 2],
    pub spaces: Arc<SpaceRegistry>,
    pub log: Arc<LogSys>,
    pub doublewrite: Doublewrite,
    pacer: Mutex<FlushPacer>,
    pub lru_flushed_total: AtomicU64,
    pub n_reads: AtomicU64,
    pub n_read_misses: AtomicU64,
}

impl BufferPool {
    pub fn new(n_frames: usize, spaces: Arc<SpaceRegistry>, log: Arc<LogSys>) -> Self {
        let blocks: Vec<_> = (0..n_frames).map(Block::new).collect();
        let free = (0..n_frames).rev().collect();
        Self {
            blocks,
            state: Mutex::new(PoolState {
                page_hash: HashMap::new(),
                young: VecDeque::new(),
                old: VecDeque::new(),
                free,
            }),
            flush_state: Mutex::new(FlushState {
                list: BTreeSet::new(),
            }),
            batch_running: [AtomicBool::new(false), AtomicBool::new(false)],
            spaces,
            log,
            doublewrite: Doublewrite::new(),
            pacer: Mutex::new(FlushPacer::new()),
            lru_flushed_total: AtomicU64::new(0),
            n_reads: AtomicU64::new(0),
            n_read_misses: AtomicU64::new(0),
        }
    }

    pub fn n_frames(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, index: usize) -> Option<&Arc<Block>> {
        self.blocks.get(index)
    }

    /// Returns a latched block for `page_id`, reading it from disk on a
    /// miss. Fails with `TablespaceDeleted` when the space is gone and
    /// `Corruption` when neither the page nor its doublewrite copy verifies.
    pub fn get(self: &Arc<Self>, page_id: PageId, mode: LatchMode) -> DbResult<PageRef> {
        self.n_reads.fetch_add(1, Ordering::Relaxed);
        enum Hit {
            Fixed(Arc<Block>),
            IoBusy,
            Miss,
        }
        loop {
            // Fast path: page hash hit. The block is fixed inside the pool
            // mutex; the latch is taken only after the mutex (and its rank)
            // are released.
            let hit = {
                let _rank = RankGuard::new(LatchRank::BufPool);
                let mut state = self.state.lock();
                match state.page_hash.get(&page_id).copied() {
                    Some(idx) => {
                        let block = self.blocks[idx].clone();
                        if block.meta.lock().io_fix == IoFix::Read {
                            Hit::IoBusy
                        } else {
                            block.buf_fix.fetch_add(1, Ordering::SeqCst);
                            self.touch(&mut state, idx);
                            Hit::Fixed(block)
                        }
                    }
                    None => Hit::Miss,
                }
            };
            match hit {
                Hit::Fixed(block) => return Ok(self.latch_block(block, page_id, mode)),
                Hit::IoBusy => {
                    thread::yield_now();
                    continue;
                }
                Hit::Miss => {}
            }

            // Miss: bring the page in.
            self.n_read_misses.fetch_add(1, Ordering::Relaxed);
            match self.read_page_in(page_id)? {
                Some(page_ref) => {
                    let keep_x = matches!(mode, LatchMode::X);
                    if keep_x {
                        return Ok(page_ref);
                    }
                    // Drop the read-side X latch and relatch as requested.
                    let block = page_ref.block.clone();
                    block.buf_fix.fetch_add(1, Ordering::SeqCst);
                    drop(page_ref);
                    return Ok(self.latch_block(block, page_id, mode));
                }
                None => continue, // lost a race with another reader
            }
        }
    }

    /// Returns a new, zeroed, X-latched frame for a freshly allocated page.
    /// No disk read is performed; the caller formats the page in an mtr.
    pub fn get_new(self: &Arc<Self>, page_id: PageId) -> DbResult<PageRef> {
        if !self.spaces.space_exists(page_id.space) {
            return Err(DbError::TablespaceDeleted {
                space: page_id.space,
            });
        }
        loop {
            let (idx, mut guard) = self.alloc_frame()?;
            {
                let _rank = RankGuard::new(LatchRank::BufPool);
                let mut state = self.state.lock();
                if state.page_hash.contains_key(&page_id) {
                    // Someone else brought it in; give the frame back.
                    state.free.push(idx);
                    drop(state);
                    drop(guard);
                    return self.get(page_id, LatchMode::X);
                }
                state.page_hash.insert(page_id, idx);
                state.old.push_front(idx);
                let block = &self.blocks[idx];
                block.buf_fix.fetch_add(1, Ordering::SeqCst);
                let mut meta = block.meta.lock();
                meta.page_id = Some(page_id);
                meta.io_fix = IoFix::None;
                meta.accessed = false;
            }
            guard.fill(0);
            crate::sync::latch_enter(LatchRank::BlockLatch);
            return Ok(PageRef {
                latch: PageLatch::X(guard),
                block: self.blocks[idx].clone(),
                page_id,
            });
        }
    }

    /// Like [`BufferPool::get`], but never blocks on a held block latch:
    /// returns `Ok(None)` when the page is cached and latched incompatibly.
    /// Structure operations use this to latch a left sibling without risking
    /// a latch-order inversion.
    pub fn get_nowait(
        self: &Arc<Self>,
        page_id: PageId,
        mode: LatchMode,
    ) -> DbResult<Option<PageRef>> {
        let hit = {
            let _rank = RankGuard::new(LatchRank::BufPool);
            let mut state = self.state.lock();
            match state.page_hash.get(&page_id).copied() {
                Some(idx) => {
                    let block = self.blocks[idx].clone();
                    if block.meta.lock().io_fix != IoFix::None {
                        return Ok(None);
                    }
                    let latch = match mode {
                        LatchMode::S => RwLock::try_read_arc(&block.frame).map(PageLatch::S),
                        LatchMode::X => RwLock::try_write_arc(&block.frame).map(PageLatch::X),
                    };
                    let Some(latch) = latch else {
                        return Ok(None);
                    };
                    block.buf_fix.fetch_add(1, Ordering::SeqCst);
                    self.touch(&mut state, idx);
                    Some(PageRef {
                        latch,
                        block,
                        page_id,
                    })
                }
                None => None,
            }
        };
        if let Some(page_ref) = hit {
            crate::sync::latch_enter(LatchRank::BlockLatch);
            return Ok(Some(page_ref));
        }
        // Not cached: a plain get cannot invert latch order on a page
        // nobody has latched yet.
        self.get(page_id, mode).map(Some)
    }

    /// Optimistic fast path for persistent cursors: succeeds only when the
    /// guessed block still holds the page and its modify clock is unchanged.
    pub fn try_get(
        self: &Arc<Self>,
        page_id: PageId,
        guess_index: usize,
        expected_clock: u64,
        mode: LatchMode,
    ) -> Option<PageRef> {
        let block = self.blocks.get(guess_index)?.clone();
        block.buf_fix.fetch_add(1, Ordering::SeqCst);
        if block.modify_clock.load(Ordering::SeqCst) != expected_clock {
            block.buf_fix.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        let page_ref = self.latch_block(block, page_id, mode);
        let still_valid = {
            let meta = page_ref.block.meta.lock();
            meta.page_id == Some(page_id)
                && page_ref.block.modify_clock.load(Ordering::SeqCst) == expected_clock
        };
        if still_valid {
            Some(page_ref)
        } else {
            None
        }
    }

    fn latch_block(&self, block: Arc<Block>, page_id: PageId, mode: LatchMode) -> PageRef {
        crate::sync::latch_enter(LatchRank::BlockLatch);
        let latch = match mode {
            LatchMode::S => PageLatch::S(RwLock::read_arc(&block.frame)),
            LatchMode::X => PageLatch::X(RwLock::write_arc(&block.frame)),
        };
        PageRef {
            latch,
            block,
            page_id,
        }
    }

    /// Second access promotes a block from the old sublist to the young
    /// sublist head; first access only marks it.
    fn touch(&self, state: &mut PoolState, idx: usize) {
        let block = &self.blocks[idx];
        let mut meta = block.meta.lock();
        if !meta.accessed {
            meta.accessed = true;
            return;
        }
        drop(meta);
        if let Some(pos) = state.old.iter().position(|&i| i == idx) {
            state.old.remove(pos);
            state.young.push_front(idx);
        } else if let Some(pos) = state.young.iter().position(|&i| i == idx) {
            if pos > 0 {
                state.young.remove(pos);
                state.young.push_front(idx);
            }
        }
    }

    /// Brings a page in from disk. Returns `None` when another thread won
    /// the race and the caller should retry the hash.
    fn read_page_in(self: &Arc<Self>, page_id: PageId) -> DbResult<Option<PageRef>> {
        let (idx, mut guard) = self.alloc_frame()?;
        {
            let _rank = RankGuard::new(LatchRank::BufPool);
            let mut state = self.state.lock();
            if state.page_hash.contains_key(&page_id) {
                state.free.push(idx);
                return Ok(None);
            }
            if !self.spaces.space_exists(page_id.space) {
                state.free.push(idx);
                return Err(DbError::TablespaceDeleted {
                    space: page_id.space,
                });
            }
            state.page_hash.insert(page_id, idx);
            state.old.push_front(idx);
            let block = &self.blocks[idx];
            block.buf_fix.fetch_add(1, Ordering::SeqCst);
            let mut meta = block.meta.lock();
            meta.page_id = Some(page_id);
            meta.io_fix = IoFix::Read;
            meta.accessed = false;
        }

        crate::sync::latch_enter(LatchRank::BlockLatch);
        let read_result = self.read_and_verify(page_id, &mut guard);
        let block = self.blocks[idx].clone();
        match read_result {
            Ok(()) => {
                block.meta.lock().io_fix = IoFix::None;
                Ok(Some(PageRef {
                    latch: PageLatch::X(guard),
                    block,
                    page_id,
                }))
            }
            Err(e) => {
                crate::sync::latch_exit(LatchRank::BlockLatch);
                drop(guard);
                let _rank = RankGuard::new(LatchRank::BufPool);
                let mut state = self.state.lock();
                state.page_hash.remove(&page_id);
                if let Some(pos) = state.old.iter().position(|&i| i == idx) {
                    state.old.remove(pos);
                }
                state.free.push(idx);
                let mut meta = block.meta.lock();
                meta.page_id = None;
                meta.io_fix = IoFix::None;
                block.buf_fix.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn read_and_verify(&self, page_id: PageId, guard: &mut WriteGuard) -> DbResult<()> {
        self.spaces.read_page(page_id, &mut ***guard)?;
        match page::page_verify(&***guard) {
            PageCheck::Ok | PageCheck::Fresh => Ok(()),
            status => {
                warn!("page {} failed verification ({:?})", page_id, status);
                // Doublewrite recovery: a valid copy with a matching
                // self-reference supersedes the torn page.
                let copies = Doublewrite::recover_scan(&self.spaces)?;
                for (copy_id, image) in copies {
                    if copy_id == page_id {
                        guard.copy_from_slice(&image);
                        self.spaces.write_page(page_id, &image)?;
                        return Ok(());
                    }
                }
                Err(DbError::Corruption { page_id })
            }
        }
    }

    /// Finds a free frame, or evicts a replaceable block from the LRU tail.
    /// Runs a synchronous LRU flush batch when everything is dirty.
    fn alloc_frame(self: &Arc<Self>) -> DbResult<(usize, WriteGuard)> {
        for attempt in 0..100 {
            {
                let _rank = RankGuard::new(LatchRank::BufPool);
                let mut state = self.state.lock();
                if let Some(idx) = state.free.pop() {
                    let guard = RwLock::write_arc(&self.blocks[idx].frame);
                    return Ok((idx, guard));
                }
                // Scan the old tail first, then the young tail.
                let candidates: Vec<usize> = state
                    .old
                    .iter()
                    .rev()
                    .chain(state.young.iter().rev())
                    .copied()
                    .collect();
                for idx in candidates {
                    let block = &self.blocks[idx];
                    let replaceable = {
                        let meta = block.meta.lock();
                        block.is_replaceable(&meta)
                    };
                    if !replaceable {
                        continue;
                    }
                    let Some(guard) = RwLock::try_write_arc(&block.frame) else {
                        continue;
                    };
                    let mut meta = block.meta.lock();
                    if !block.is_replaceable(&meta) {
                        continue;
                    }
                    if let Some(old_id) = meta.page_id.take() {
                        state.page_hash.remove(&old_id);
                    }
                    meta.accessed = false;
                    if let Some(pos) = state.old.iter().position(|&i| i == idx) {
                        state.old.remove(pos);
                    } else if let Some(pos) = state.young.iter().position(|&i| i == idx) {
                        state.young.remove(pos);
                    }
                    // Invalidate optimistic guesses against the old page.
                    block.modify_clock.fetch_add(1, Ordering::SeqCst);
                    return Ok((idx, guard));
                }
            }
            // Everything is fixed or dirty: push dirty LRU-tail pages out.
            debug!("no replaceable frame, running LRU flush (attempt {attempt})");
            self.flush_batch(FlushKind::Lru, 16, 0)?;
            thread::sleep(Duration::from_millis(1));
        }
        Err(DbError::OutOfMemory)
    }

    /// Marks a block dirty at mtr commit: sets the oldest modification when
    /// the page first enters the flush list and always advances the newest.
    pub(crate) fn set_dirty(&self, block: &Arc<Block>, start_lsn: Lsn, end_lsn: Lsn) {
        let _rank = RankGuard::new(LatchRank::FlushList);
        let mut flush = self.flush_state.lock();
        let mut meta = block.meta.lock();
        debug_assert!(meta.page_id.is_some());
        if meta.oldest_modification == 0 {
            meta.oldest_modification = start_lsn;
            flush.list.insert((start_lsn, block.index));
        }
        if end_lsn > meta.newest_modification {
            meta.newest_modification = end_lsn;
        }
    }

    /// Re-registers a dirty page during recovery, where redo application
    /// dirties pages out of LSN order; the ordered set keeps the flush list
    /// sorted regardless.
    pub fn set_dirty_for_recovery(&self, block: &Arc<Block>, start_lsn: Lsn, end_lsn: Lsn) {
        self.set_dirty(block, start_lsn, end_lsn);
    }

    /// The checkpoint LSN candidate: the minimum oldest modification over
    /// the flush list, if any page is dirty.
    pub fn min_oldest_modification(&self) -> Option<Lsn> {
        let flush = self.flush_state.lock();
        flush.list.iter().next().map(|&(lsn, _)| lsn)
    }

    pub fn n_dirty(&self) -> usize {
        self.flush_state.lock().list.len()
    }

    /// Writes up to `min_n` dirty pages. LRU batches take them from the LRU
    /// tail; LIST batches take pages with `oldest_modification < lsn_limit`
    /// (0 means no limit). Returns `None` when a batch of the same kind is
    /// already running, otherwise the page count written.
    pub fn flush_batch(
        self: &Arc<Self>,
        kind: FlushKind,
        min_n: usize,
        lsn_limit: Lsn,
    ) -> DbResult<Option<usize>> {
        if self.batch_running[kind as usize].swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        let result = self.run_flush_batch(kind, min_n, lsn_limit);
        self.batch_running[kind as usize].store(false, Ordering::SeqCst);
        result.map(Some)
    }

    fn run_flush_batch(
        self: &Arc<Self>,
        kind: FlushKind,
        min_n: usize,
        lsn_limit: Lsn,
    ) -> DbResult<usize> {
        // Select candidate blocks.
        let candidates: Vec<usize> = match kind {
            FlushKind::Lru => {
                let _rank = RankGuard::new(LatchRank::BufPool);
                let state = self.state.lock();
                state
                    .old
                    .iter()
                    .rev()
                    .chain(state.young.iter().rev())
                    .copied()
                    .filter(|&idx| self.blocks[idx].oldest_modification() > 0)
                    .take(min_n)
                    .collect()
            }
            FlushKind::List => {
                let _rank = RankGuard::new(LatchRank::FlushList);
                let flush = self.flush_state.lock();
                flush
                    .list
                    .iter()
                    .take_while(|&&(lsn, _)| lsn_limit == 0 || lsn < lsn_limit)
                    .map(|&(_, idx)| idx)
                    .take(min_n)
                    .collect()
            }
        };
        if candidates.is_empty() {
            return Ok(0);
        }

        // Pin each candidate for write: S latch held through the whole I/O
        // so no mtr can slip a modification between copy and completion.
        // The latch attempt must not block: the flush may have been kicked
        // off by the very thread holding an X latch on a candidate.
        let mut batch: Vec<(usize, PageId, ReadGuard)> = Vec::new();
        let mut max_newest: Lsn = 0;
        for idx in candidates {
            let block = &self.blocks[idx];
            {
                let mut meta = block.meta.lock();
                if meta.oldest_modification == 0 || meta.io_fix != IoFix::None {
                    continue;
                }
                meta.io_fix = IoFix::Write;
                max_newest = max_newest.max(meta.newest_modification);
            }
            let Some(guard) = RwLock::try_read_arc(&block.frame) else {
                block.meta.lock().io_fix = IoFix::None;
                continue;
            };
            let page_id = block
                .meta
                .lock()
                .page_id
                .expect("dirty block has an identity");
            batch.push((idx, page_id, guard));
        }
        if batch.is_empty() {
            return Ok(0);
        }

        // WAL rule: redo covering these modifications must be durable first.
        self.log.flush_to_lsn(max_newest, true)?;

        // Stage through the doublewrite buffer.
        for (_, page_id, guard) in &batch {
            let mut image = guard.to_vec();
            page::page_stamp_for_write(&mut image);
            self.doublewrite.stage(*page_id, &image);
        }
        let images = self.doublewrite.flush_staged(&self.spaces)?;

        // Home-location writes, then a data fsync.
        let mut spaces_touched: Vec<SpaceId> = Vec::new();
        for (page_id, image) in &images {
            self.spaces.write_page(*page_id, image)?;
            if !spaces_touched.contains(&page_id.space) {
                spaces_touched.push(page_id.space);
            }
        }
        for space in spaces_touched {
            self.spaces.sync_space(space)?;
        }

        // Clear dirty state and release.
        let count = batch.len();
        for (idx, _, guard) in batch {
            let block = &self.blocks[idx];
            let _rank = RankGuard::new(LatchRank::FlushList);
            let mut flush = self.flush_state.lock();
            let mut meta = block.meta.lock();
            flush.list.remove(&(meta.oldest_modification, idx));
            meta.oldest_modification = 0;
            meta.io_fix = IoFix::None;
            drop(meta);
            drop(flush);
            drop(guard);
        }
        if kind == FlushKind::Lru {
            self.lru_flushed_total
                .fetch_add(count as u64, Ordering::Relaxed);
        }
        debug!("{:?} flush batch wrote {} pages", kind, count);
        Ok(count)
    }

    /// Flushes every dirty page (used at shutdown and checkpoints).
    pub fn flush_all(self: &Arc<Self>) -> DbResult<usize> {
        let mut total = 0;
        loop {
            match self.flush_batch(FlushKind::List, usize::MAX, 0)? {
                Some(0) => break,
                Some(n) => total += n,
                None => thread::sleep(Duration::from_millis(1)),
            }
        }
        Ok(total)
    }

    /// Samples the pacing window and returns the recommended flush-list page
    /// count for the next second.
    pub fn pace(&self) -> usize {
        let mut pacer = self.pacer.lock();
        pacer.sample(
            self.log.current_lsn(),
            self.lru_flushed_total.load(Ordering::Relaxed),
        );
        pacer.recommend(self.n_dirty(), self.log.capacity)
    }

    /// Throws away every block of a dropped tablespace without flushing.
    pub fn evict_space(&self, space: SpaceId) {
        let _rank = RankGuard::new(LatchRank::BufPool);
        let mut state = self.state.lock();
        let victims: Vec<(PageId, usize)> = state
            .page_hash
            .iter()
            .filter(|(id, _)| id.space == space)
            .map(|(id, &idx)| (*id, idx))
            .collect();
        for (page_id, idx) in victims {
            let block = &self.blocks[idx];
            if block.buf_fix.load(Ordering::SeqCst) != 0 {
                continue;
            }
            let mut flush = self.flush_state.lock();
            let mut meta = block.meta.lock();
            if meta.oldest_modification != 0 {
                flush.list.remove(&(meta.oldest_modification, idx));
                meta.oldest_modification = 0;
            }
            meta.page_id = None;
            meta.newest_modification = 0;
            drop(meta);
            drop(flush);
            block.modify_clock.fetch_add(1, Ordering::SeqCst);
            state.page_hash.remove(&page_id);
            if let Some(pos) = state.old.iter().position(|&i| i == idx) {
                state.old.remove(pos);
            } else if let Some(pos) = state.young.iter().position(|&i| i == idx) {
                state.young.remove(pos);
            }
            state.free.push(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tablespace::SYSTEM_SPACE_ID;
    use crate::wal::{LogSys, LOG_START_LSN};
    use tempfile::tempdir;

    fn setup(n_frames: usize) -> (tempfile::TempDir, Arc<BufferPool>) {
        let dir = tempdir().unwrap();
        let spaces = Arc::new(SpaceRegistry::new(dir.path()).unwrap());
        spaces.open_or_create_system_space().unwrap();
        let log = LogSys::open(dir.path().join("redo.log"), 1 << 24, LOG_START_LSN).unwrap();
        let pool = Arc::new(BufferPool::new(n_frames, spaces, log));
        (dir, pool)
    }

    #[test]
    fn get_returns_same_frame_on_hit() {
        let (_dir, pool) = setup(8);
        let page_id = PageId::new(SYSTEM_SPACE_ID, 200);
        let idx;
        {
            let p = pool.get(page_id, LatchMode::S).unwrap();
            idx = p.block_index();
        }
        let p2 = pool.get(page_id, LatchMode::S).unwrap();
        assert_eq!(p2.block_index(), idx);
        assert_eq!(pool.n_read_misses.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn dirty_page_enters_flush_list_once() {
        let (_dir, pool) = setup(8);
        let page_id = PageId::new(SYSTEM_SPACE_ID, 201);
        let p = pool.get(page_id, LatchMode::X).unwrap();
        pool.set_dirty(&p.block, 100, 120);
        pool.set_dirty(&p.block, 130, 150);
        assert_eq!(p.block.oldest_modification(), 100);
        assert_eq!(p.block.newest_modification(), 150);
        assert_eq!(pool.n_dirty(), 1);
        assert_eq!(pool.min_oldest_modification(), Some(100));
    }

    #[test]
    fn flush_batch_clears_dirty_state_and_persists() {
        let (_dir, pool) = setup(8);
        let page_id = PageId::new(SYSTEM_SPACE_ID, 202);
        {
            let mut p = pool.get(page_id, LatchMode::X).unwrap();
            let frame = p.frame_mut();
            page::put_u32(frame, page::FIL_PAGE_NO, page_id.page_no);
            page::put_u32(frame, page::FIL_PAGE_SPACE_ID, page_id.space);
            frame[page::PAGE_DATA] = 0x55;
            page::page_set_lsn(frame, 500);
            pool.set_dirty(&p.block, 500, 500);
        }
        let n = pool.flush_batch(FlushKind::List, 10, 0).unwrap().unwrap();
        assert_eq!(n, 1);
        assert_eq!(pool.n_dirty(), 0);

        let mut buf = vec![0u8; PAGE_SIZE];
        pool.spaces.read_page(page_id, &mut buf).unwrap();
        assert_eq!(page::page_verify(&buf), PageCheck::Ok);
        assert_eq!(buf[page::PAGE_DATA], 0x55);
    }

    #[test]
    fn try_get_fails_after_modify_clock_bump() {
        let (_dir, pool) = setup(8);
        let page_id = PageId::new(SYSTEM_SPACE_ID, 203);
        let (idx, clock) = {
            let p = pool.get(page_id, LatchMode::S).unwrap();
            (p.block_index(), p.modify_clock())
        };
        assert!(pool.try_get(page_id, idx, clock, LatchMode::S).is_some());
        pool.blocks[idx].modify_clock.fetch_add(1, Ordering::SeqCst);
        assert!(pool.try_get(page_id, idx, clock, LatchMode::S).is_none());
    }

    #[test]
    fn eviction_reuses_clean_frames() {
        let (_dir, pool) = setup(4);
        for i in 0..16u32 {
            let page_id = PageId::new(SYSTEM_SPACE_ID, 210 + i);
            let p = pool.get(page_id, LatchMode::S).unwrap();
            drop(p);
        }
        // All 16 pages went through 4 frames.
        assert_eq!(pool.n_read_misses.load(Ordering::Relaxed), 16);
    }

    #[test]
    fn dropped_space_access_fails() {
        let (_dir, pool) = setup(4);
        pool.spaces.create_space(5).unwrap();
        {
            let _p = pool.get(PageId::new(5, 1), LatchMode::S).unwrap();
        }
        pool.evict_space(5);
        pool.spaces.drop_space(5).unwrap();
        let err = pool.get(PageId::new(5, 1), LatchMode::S).unwrap_err();
        assert!(matches!(err, DbError::TablespaceDeleted { space: 5 }));
    }
}
