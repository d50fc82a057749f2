//! Mini-transactions.
//!
//! An mtr groups page mutations into one atomic, redo-logged unit. It keeps
//! a memo of the block latches it holds (in acquisition order) and a buffer
//! of redo records produced through [`PageMut`]. Commit appends the redo as
//! one frame, consuming a contiguous LSN range, stamps and registers every
//! modified page with the flush list, and releases the latches in reverse
//! acquisition order. A read-only mtr just releases.

use std::sync::Arc;

use crate::buffer_pool::{BufferPool, LatchMode, PageRef};
use crate::errors::DbResult;
use crate::page::{page_set_lsn, PageMut};
use crate::wal::RedoRecord;
use crate::{Lsn, PageId};

struct MemoSlot {
    page: PageRef,
    dirtied: bool,
}

/// Handle to a page latched in an mtr's memo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSlot(usize);

/// A mini-transaction.
pub struct Mtr {
    memo: Vec<Option<MemoSlot>>,
    redo: Vec<RedoRecord>,
}

impl Mtr {
    pub fn new() -> Self {
        Self {
            memo: Vec::new(),
            redo: Vec::new(),
        }
    }

    /// Latches a page and records it in the memo.
    pub fn get_page(
        &mut self,
        pool: &Arc<BufferPool>,
        page_id: PageId,
        mode: LatchMode,
    ) -> DbResult<PageSlot> {
        let page = pool.get(page_id, mode)?;
        Ok(self.push(page))
    }

    /// Latches a freshly allocated page (no disk read) exclusively.
    pub fn get_new_page(&mut self, pool: &Arc<BufferPool>, page_id: PageId) -> DbResult<PageSlot> {
        let page = pool.get_new(page_id)?;
        Ok(self.push(page))
    }

    /// Non-blocking latch; `None` when the page is latched incompatibly.
    pub fn get_page_nowait(
        &mut self,
        pool: &Arc<BufferPool>,
        page_id: PageId,
        mode: LatchMode,
    ) -> DbResult<Option<PageSlot>> {
        match pool.get_nowait(page_id, mode)? {
            Some(page) => Ok(Some(self.push(page))),
            None => Ok(None),
        }
    }

    /// Optimistic latch via a block guess; see [`BufferPool::try_get`].
    pub fn try_get_page(
        &mut self,
        pool: &Arc<BufferPool>,
        page_id: PageId,
        guess_index: usize,
        expected_clock: u64,
        mode: LatchMode,
    ) -> Option<PageSlot> {
        let page = pool.try_get(page_id, guess_index, expected_clock, mode)?;
        Some(self.push(page))
    }

    fn push(&mut self, page: PageRef) -> PageSlot {
        self.memo.push(Some(MemoSlot {
            page,
            dirtied: false,
        }));
        PageSlot(self.memo.len() - 1)
    }

    /// The memo slot currently holding `page_id`, if any. Callers reuse it
    /// rather than latching the same block twice.
    pub fn find_page(&self, page_id: PageId) -> Option<PageSlot> {
        self.memo.iter().enumerate().find_map(|(i, s)| {
            s.as_ref()
                .filter(|s| s.page.page_id == page_id)
                .map(|_| PageSlot(i))
        })
    }

    pub fn page_id(&self, slot: PageSlot) -> PageId {
        self.slot_ref(slot).page.page_id
    }

    pub fn frame(&self, slot: PageSlot) -> &[u8] {
        self.slot_ref(slot).page.frame()
    }

    pub fn block_index(&self, slot: PageSlot) -> usize {
        self.slot_ref(slot).page.block_index()
    }

    pub fn modify_clock(&self, slot: PageSlot) -> u64 {
        self.slot_ref(slot).page.modify_clock()
    }

    pub fn block(&self, slot: PageSlot) -> &Arc<crate::buffer_pool::Block> {
        &self.slot_ref(slot).page.block
    }

    fn slot_ref(&self, slot: PageSlot) -> &MemoSlot {
        self.memo[slot.0].as_ref().expect("page slot was released")
    }

    /// A logged mutable view of an x-latched page. Marks the slot dirty.
    pub fn page_mut(&mut self, slot: PageSlot) -> PageMut<'_> {
        let Mtr { memo, redo } = self;
        let s = memo[slot.0].as_mut().expect("page slot was released");
        debug_assert!(s.page.is_x(), "page_mut requires an X latch");
        s.dirtied = true;
        let page_id = s.page.page_id;
        PageMut::new(s.page.frame_mut(), page_id, Some(redo))
    }

    /// Releases one latch early (latch coupling during a descent). Only
    /// legal for slots that were not modified.
    pub fn release(&mut self, slot: PageSlot) {
        if let Some(s) = self.memo[slot.0].take() {
            debug_assert!(!s.dirtied, "cannot release a modified page before commit");
        }
    }

    /// True when this mtr has produced redo.
    pub fn is_modifying(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn n_latched(&self) -> usize {
        self.memo.iter().flatten().count()
    }

    /// Commits the mtr. Returns the consumed LSN range, or `None` for a
    /// read-only mtr.
    pub fn commit(mut self, pool: &Arc<BufferPool>) -> DbResult<Option<(Lsn, Lsn)>> {
        if self.redo.is_empty() {
            debug_assert!(self.memo.iter().flatten().all(|s| !s.dirtied));
            self.release_all();
            return Ok(None);
        }

        let redo = std::mem::take(&mut self.redo);
        let (start_lsn, end_lsn) = pool.log.append_mtr(&redo)?;

        for slot in self.memo.iter_mut().flatten() {
            if !slot.dirtied {
                continue;
            }
            page_set_lsn(slot.page.frame_mut(), end_lsn);
            slot.page
                .block
                .modify_clock
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            pool.set_dirty(&slot.page.block, start_lsn, end_lsn);
        }

        self.release_all();
        Ok(Some((start_lsn, end_lsn)))
    }

    fn release_all(&mut self) {
        // Reverse acquisition order.
        while let Some(slot) = self.memo.pop() {
            drop(slot);
        }
    }
}

impl Default for Mtr {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Mtr {
    fn drop(&mut self) {
        // A discarded mtr must not have pending redo; latches are released
        // in reverse order either way.
        debug_assert!(
            self.redo.is_empty(),
            "mtr dropped with unflushed redo records"
        );
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page;
    use crate::tablespace::{SpaceRegistry, SYSTEM_SPACE_ID};
    use crate::wal::{scan_frames, LogSys, LOG_START_LSN};
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Arc<BufferPool>) {
        let dir = tempdir().unwrap();
        let spaces = Arc::new(SpaceRegistry::new(dir.path()).unwrap());
        spaces.open_or_create_system_space().unwrap();
        let log = LogSys::open(dir.path().join("redo.log"), 1 << 24, LOG_START_LSN).unwrap();
        let pool = Arc::new(BufferPool::new(16, spaces, log));
        (dir, pool)
    }

    #[test]
    fn read_only_mtr_commits_without_lsn() {
        let (_dir, pool) = setup();
        let mut mtr = Mtr::new();
        let slot = mtr
            .get_page(&pool, PageId::new(SYSTEM_SPACE_ID, 30), LatchMode::S)
            .unwrap();
        assert_eq!(mtr.frame(slot).len(), crate::PAGE_SIZE);
        let range = mtr.commit(&pool).unwrap();
        assert!(range.is_none());
        assert_eq!(pool.n_dirty(), 0);
    }

    #[test]
    fn modifying_mtr_stamps_lsn_and_dirties_page() {
        let (_dir, pool) = setup();
        let page_id = PageId::new(SYSTEM_SPACE_ID, 31);
        let mut mtr = Mtr::new();
        let slot = mtr.get_page(&pool, page_id, LatchMode::X).unwrap();
        {
            let mut pg = mtr.page_mut(slot);
            pg.write_u32(page::PAGE_DATA, 0xDEAD_BEEF);
        }
        let (start, end) = mtr.commit(&pool).unwrap().unwrap();
        assert!(end > start);
        assert_eq!(pool.n_dirty(), 1);
        assert_eq!(pool.min_oldest_modification(), Some(start));

        let p = pool.get(page_id, LatchMode::S).unwrap();
        assert_eq!(page::page_lsn(p.frame()), end);
        assert_eq!(page::get_u32(p.frame(), page::PAGE_DATA), 0xDEAD_BEEF);
    }

    #[test]
    fn redo_frame_reaches_log_on_flush() {
        let (dir, pool) = setup();
        let page_id = PageId::new(SYSTEM_SPACE_ID, 32);
        let mut mtr = Mtr::new();
        let slot = mtr.get_page(&pool, page_id, LatchMode::X).unwrap();
        {
            let mut pg = mtr.page_mut(slot);
            pg.write_u64(page::PAGE_DATA + 8, 42);
        }
        mtr.commit(&pool).unwrap().unwrap();
        pool.log.flush_to_lsn(pool.log.current_lsn(), true).unwrap();

        let (frames, _) = scan_frames(dir.path().join("redo.log"), LOG_START_LSN).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            frames[0].2[0],
            crate::wal::RedoRecord::Write8 { value: 42, .. }
        ));
    }

    #[test]
    fn latch_coupling_release_keeps_later_slots() {
        let (_dir, pool) = setup();
        let mut mtr = Mtr::new();
        let a = mtr
            .get_page(&pool, PageId::new(SYSTEM_SPACE_ID, 33), LatchMode::S)
            .unwrap();
        let b = mtr
            .get_page(&pool, PageId::new(SYSTEM_SPACE_ID, 34), LatchMode::S)
            .unwrap();
        mtr.release(a);
        assert_eq!(mtr.n_latched(), 1);
        assert_eq!(mtr.page_id(b), PageId::new(SYSTEM_SPACE_ID, 34));
        mtr.commit(&pool).unwrap();
    }
}
