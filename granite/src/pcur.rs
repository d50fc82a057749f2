//! Persistent B-tree cursors.
//!
//! A pcur survives mini-transaction commits: `store_position` remembers the
//! record key, the relative position, the block and its modify clock;
//! `restore_position` first tries the optimistic path through the buffer
//! pool's block guess and falls back to a fresh search. Restore returns
//! `true` only when the cursor sits on the same logical record again.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::btree::{btr_cursor_open_at_side, btr_cursor_search, BtrCursor, BtrLatch, IndexDef};
use crate::buffer_pool::{BufferPool, LatchMode};
use crate::errors::DbResult;
use crate::mtr::Mtr;
use crate::page::{
    self, page_next, rec_next, SearchMode, Tuple, INFIMUM_OFFSET, SUPREMUM_OFFSET,
};
use crate::{PageId, FIL_NULL};

/// Where the cursor stood relative to its stored key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelPos {
    On,
    Before,
    After,
    BeforeFirstInTree,
    AfterLastInTree,
}

#[derive(Debug, Clone)]
struct StoredPos {
    rel_pos: RelPos,
    /// Key prefix of the anchoring record (empty for tree sentinels).
    key: Tuple,
    page_id: PageId,
    rec: u16,
    block_index: usize,
    modify_clock: u64,
}

/// A persistent cursor over one index. The live position (`pos`) is only
/// valid within the mtr that produced it.
pub struct PersistentCursor {
    pub index: IndexDef,
    pub latch: BtrLatch,
    pub pos: Option<BtrCursor>,
    stored: Option<StoredPos>,
}

impl PersistentCursor {
    pub fn new(index: IndexDef, latch: BtrLatch) -> Self {
        Self {
            index,
            latch,
            pos: None,
            stored: None,
        }
    }

    fn latch_mode(&self) -> LatchMode {
        match self.latch {
            BtrLatch::SearchLeaf => LatchMode::S,
            BtrLatch::ModifyLeaf => LatchMode::X,
        }
    }

    /// Positions by key search.
    pub fn search(
        &mut self,
        key: &Tuple,
        mode: SearchMode,
        pool: &Arc<BufferPool>,
        mtr: &mut Mtr,
    ) -> DbResult<()> {
        let cur = btr_cursor_search(&self.index, key, mode, self.latch, pool, mtr)?;
        self.pos = Some(cur);
        Ok(())
    }

    /// Opens at the index start or end (on the infimum/supremum edge).
    pub fn open_at_side(
        &mut self,
        first: bool,
        pool: &Arc<BufferPool>,
        mtr: &mut Mtr,
    ) -> DbResult<()> {
        let cur = btr_cursor_open_at_side(first, &self.index, self.latch, pool, mtr)?;
        self.pos = Some(cur);
        Ok(())
    }

    /// Serializes the current position so the mtr can commit. The relative
    /// position anchors on a user record where possible; an empty page
    /// stores a whole-tree sentinel.
    pub fn store_position(&mut self, mtr: &Mtr) {
        let cur = self.pos.expect("cursor is positioned");
        let frame = mtr.frame(cur.slot);
        let page_id = mtr.page_id(cur.slot);
        let n_key = self.index.n_key_fields;

        let (rel_pos, anchor) = if page::rec_is_user_rec(frame, cur.rec) {
            (RelPos::On, cur.rec)
        } else if cur.rec == INFIMUM_OFFSET {
            let next = rec_next(frame, INFIMUM_OFFSET);
            if next == SUPREMUM_OFFSET {
                (RelPos::BeforeFirstInTree, 0)
            } else {
                (RelPos::Before, next)
            }
        } else {
            debug_assert_eq!(cur.rec, SUPREMUM_OFFSET);
            let prev = page::page_rec_prev(frame, SUPREMUM_OFFSET);
            if prev == INFIMUM_OFFSET {
                (RelPos::AfterLastInTree, 0)
            } else {
                (RelPos::After, prev)
            }
        };

        let key = if anchor == 0 {
            Tuple::default()
        } else {
            page::rec_to_tuple(frame, anchor).prefix(n_key)
        };

        self.stored = Some(StoredPos {
            rel_pos,
            key,
            page_id,
            rec: cur.rec,
            block_index: mtr.block_index(cur.slot),
            modify_clock: mtr.modify_clock(cur.slot),
        });
        self.pos = None;
    }

    /// Restores the stored position in a new mtr. Returns `true` when the
    /// cursor is on the exact same logical record; `false` when it had to
    /// be repositioned (the closest neighbor per the stored rel_pos).
    pub fn restore_position(&mut self, pool: &Arc<BufferPool>, mtr: &mut Mtr) -> DbResult<bool> {
        let stored = self.stored.clone().expect("position was stored");

        match stored.rel_pos {
            RelPos::BeforeFirstInTree => {
                self.open_at_side(true, pool, mtr)?;
                return Ok(false);
            }
            RelPos::AfterLastInTree => {
                self.open_at_side(false, pool, mtr)?;
                return Ok(false);
            }
            _ => {}
        }

        // Optimistic restoration: the guessed block with an unchanged
        // modify clock still holds the record where we left it.
        if let Some(slot) = mtr.try_get_page(
            pool,
            stored.page_id,
            stored.block_index,
            stored.modify_clock,
            self.latch_mode(),
        ) {
            let cur = BtrCursor {
                slot,
                rec: stored.rec,
            };
            if stored.rel_pos == RelPos::On {
                debug_assert_eq!(
                    page::rec_cmp_with_tuple(
                        mtr.frame(slot),
                        stored.rec,
                        &stored.key,
                        self.index.compare,
                        self.index.n_key_fields,
                    ),
                    Ordering::Equal,
                    "unchanged modify clock implies an unchanged record"
                );
            }
            self.pos = Some(cur);
            // Exactness only holds when the cursor rested on the record
            // itself; BEFORE/AFTER positions are neighbors by definition.
            return Ok(stored.rel_pos == RelPos::On);
        }

        // Pessimistic: re-search from the stored key.
        let mode = match stored.rel_pos {
            RelPos::On => SearchMode::LE,
            RelPos::Before => SearchMode::L,
            RelPos::After => SearchMode::G,
            _ => unreachable!("tree sentinels handled above"),
        };
        let cur = btr_cursor_search(&self.index, &stored.key, mode, self.latch, pool, mtr)?;
        self.pos = Some(cur);

        let same = stored.rel_pos == RelPos::On
            && cur.rec != INFIMUM_OFFSET
            && cur.rec != SUPREMUM_OFFSET
            && page::rec_cmp_with_tuple(
                mtr.frame(cur.slot),
                cur.rec,
                &stored.key,
                self.index.compare,
                self.index.n_key_fields,
            ) == Ordering::Equal;

        // The record may have moved to another page; remember the new spot.
        self.store_position(mtr);
        self.restore_from_store(pool, mtr)?;
        Ok(same)
    }

    /// Re-opens `pos` right after an internal store (same mtr); cheap since
    /// the block was just touched.
    fn restore_from_store(&mut self, pool: &Arc<BufferPool>, mtr: &mut Mtr) -> DbResult<()> {
        let stored = self.stored.clone().expect("just stored");
        match stored.rel_pos {
            RelPos::BeforeFirstInTree => self.open_at_side(true, pool, mtr),
            RelPos::AfterLastInTree => self.open_at_side(false, pool, mtr),
            _ => {
                if let Some(slot) = mtr.find_page(stored.page_id) {
                    self.pos = Some(BtrCursor {
                        slot,
                        rec: stored.rec,
                    });
                    Ok(())
                } else {
                    let mode = match stored.rel_pos {
                        RelPos::On => SearchMode::LE,
                        RelPos::Before => SearchMode::L,
                        RelPos::After => SearchMode::G,
                        _ => unreachable!(),
                    };
                    let cur =
                        btr_cursor_search(&self.index, &stored.key, mode, self.latch, pool, mtr)?;
                    self.pos = Some(cur);
                    Ok(())
                }
            }
        }
    }

    /// Steps to the next record, following the right sibling when the page
    /// is exhausted (the current leaf's latch is released after the next
    /// leaf is latched). Returns `false` at the end of the index.
    pub fn move_to_next(&mut self, pool: &Arc<BufferPool>, mtr: &mut Mtr) -> DbResult<bool> {
        let cur = self.pos.expect("cursor is positioned");
        let frame = mtr.frame(cur.slot);
        let next = if cur.rec == SUPREMUM_OFFSET {
            SUPREMUM_OFFSET
        } else {
            rec_next(frame, cur.rec)
        };
        if next != SUPREMUM_OFFSET && next != 0 {
            self.pos = Some(BtrCursor {
                slot: cur.slot,
                rec: next,
            });
            return Ok(true);
        }
        // Cross to the right sibling.
        let next_page = page_next(frame);
        if next_page == FIL_NULL {
            self.pos = Some(BtrCursor {
                slot: cur.slot,
                rec: SUPREMUM_OFFSET,
            });
            return Ok(false);
        }
        let next_slot = mtr.get_page(
            pool,
            PageId::new(self.index.space, next_page),
            self.latch_mode(),
        )?;
        mtr.release(cur.slot);
        let first = rec_next(mtr.frame(next_slot), INFIMUM_OFFSET);
        self.pos = Some(BtrCursor {
            slot: next_slot,
            rec: first,
        });
        if first == SUPREMUM_OFFSET {
            // An empty sibling: keep walking.
            return self.move_to_next(pool, mtr);
        }
        Ok(true)
    }

    /// Steps backward. Moving off the left edge of a page commits the mtr
    /// and re-searches with a strictly-less probe, avoiding the latch-order
    /// inversion of walking left while holding the right page.
    pub fn move_to_prev(&mut self, pool: &Arc<BufferPool>, mtr: &mut Mtr) -> DbResult<bool> {
        let cur = self.pos.expect("cursor is positioned");
        let frame = mtr.frame(cur.slot);
        if cur.rec != INFIMUM_OFFSET {
            let prev = page::page_rec_prev(frame, cur.rec);
            if prev != INFIMUM_OFFSET {
                self.pos = Some(BtrCursor {
                    slot: cur.slot,
                    rec: prev,
                });
                return Ok(true);
            }
        }
        self.move_backward_from_page(pool, mtr)
    }

    fn move_backward_from_page(&mut self, pool: &Arc<BufferPool>, mtr: &mut Mtr) -> DbResult<bool> {
        let cur = self.pos.expect("cursor is positioned");
        let frame = mtr.frame(cur.slot);
        if page::page_prev(frame) == FIL_NULL {
            self.pos = Some(BtrCursor {
                slot: cur.slot,
                rec: INFIMUM_OFFSET,
            });
            return Ok(false);
        }

        // Anchor on the first user record (or the page edge), then restart
        // the mtr and probe strictly below the anchor.
        let anchor = {
            let first = rec_next(frame, INFIMUM_OFFSET);
            if first != SUPREMUM_OFFSET {
                page::rec_to_tuple(frame, first).prefix(self.index.n_key_fields)
            } else if self.stored.is_some() {
                self.stored.as_ref().map(|s| s.key.clone()).unwrap_or_default()
            } else {
                Tuple::default()
            }
        };
        let old_mtr = std::mem::take(mtr);
        old_mtr.commit(pool)?;

        if anchor.fields.is_empty() {
            self.open_at_side(false, pool, mtr)?;
            let cur = self.pos.expect("opened at side");
            return self.move_to_prev_in_page_or_stop(cur, mtr);
        }

        let cur = btr_cursor_search(&self.index, &anchor, SearchMode::L, self.latch, pool, mtr)?;
        self.pos = Some(cur);
        Ok(cur.rec != INFIMUM_OFFSET && page::rec_is_user_rec(mtr.frame(cur.slot), cur.rec))
    }

    fn move_to_prev_in_page_or_stop(&mut self, cur: BtrCursor, mtr: &Mtr) -> DbResult<bool> {
        let frame = mtr.frame(cur.slot);
        if cur.rec == SUPREMUM_OFFSET {
            let prev = page::page_rec_prev(frame, SUPREMUM_OFFSET);
            if prev != INFIMUM_OFFSET {
                self.pos = Some(BtrCursor {
                    slot: cur.slot,
                    rec: prev,
                });
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Copies out the current record as a tuple.
    pub fn current_tuple(&self, mtr: &Mtr) -> Option<Tuple> {
        let cur = self.pos?;
        let frame = mtr.frame(cur.slot);
        if page::rec_is_user_rec(frame, cur.rec) {
            Some(page::rec_to_tuple(frame, cur.rec))
        } else {
            None
        }
    }

    pub fn is_on_user_rec(&self, mtr: &Mtr) -> bool {
        self.pos
            .map(|cur| page::rec_is_user_rec(mtr.frame(cur.slot), cur.rec))
            .unwrap_or(false)
    }

    pub fn has_stored_position(&self) -> bool {
        self.stored.is_some()
    }
}
