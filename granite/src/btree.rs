//! B-tree index operations.
//!
//! Descent couples latches: each level is S-latched, the child latched, the
//! parent released. Modify paths x-latch the leaf; structure changes
//! (splits, merges, root raise) x-latch the whole path inside a single mtr
//! and serialize per index on a tree latch. Sibling pages form a doubly
//! linked list per level; every non-root page is named by exactly one node
//! pointer in its parent.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::buffer_pool::{BufferPool, LatchMode};
use crate::errors::DbResult;
use crate::lock_manager::LockSys;
use crate::mtr::{Mtr, PageSlot};
use crate::page::{
    self, page_cur_delete, page_cur_insert, page_cur_search, page_level, page_next, page_prev,
    page_reorganize, rec_next, rec_to_tuple, PageMut, SearchMode, Tuple, TupleCompare,
    INFIMUM_OFFSET, REC_TYPE_NODE_PTR, REC_TYPE_ORDINARY, SUPREMUM_OFFSET,
};
use crate::{HeapNo, IndexId, PageId, PageNo, SpaceId, FIL_NULL};

/// Hidden system fields carried by clustered-index leaf records, stored
/// right after the key fields.
pub const REC_SYS_FIELDS: usize = 2;

/// An index descriptor. The caller owns index metadata (the dictionary is
/// out of scope); the engine keeps a registry of these by id.
#[derive(Clone, Copy)]
pub struct IndexDef {
    pub id: IndexId,
    pub space: SpaceId,
    pub root: PageNo,
    /// Number of key fields (the ordering prefix).
    pub n_key_fields: usize,
    /// Number of user fields, keys included, hidden system fields excluded.
    pub n_fields: usize,
    pub clustered: bool,
    pub compare: TupleCompare,
}

impl IndexDef {
    /// Fields physically stored in a leaf record of this index.
    pub fn n_stored_fields(&self) -> usize {
        if self.clustered {
            self.n_fields + REC_SYS_FIELDS
        } else {
            self.n_fields
        }
    }

    /// Stored position of the hidden `trx_id` field.
    pub fn trx_id_pos(&self) -> usize {
        debug_assert!(self.clustered);
        self.n_key_fields
    }

    /// Stored position of the hidden `roll_ptr` field.
    pub fn roll_ptr_pos(&self) -> usize {
        debug_assert!(self.clustered);
        self.n_key_fields + 1
    }

    /// Maps a user field number to its stored position.
    pub fn stored_pos(&self, user_field_no: usize) -> usize {
        if self.clustered && user_field_no >= self.n_key_fields {
            user_field_no + REC_SYS_FIELDS
        } else {
            user_field_no
        }
    }

    pub fn page_id(&self, page_no: PageNo) -> PageId {
        PageId::new(self.space, page_no)
    }
}

impl std::fmt::Debug for IndexDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexDef")
            .field("id", &self.id)
            .field("space", &self.space)
            .field("root", &self.root)
            .field("n_key_fields", &self.n_key_fields)
            .field("n_fields", &self.n_fields)
            .field("clustered", &self.clustered)
            .finish()
    }
}

/// Per-index tree latches serializing structure changes (splits, merges,
/// page discards). Plain descents do not take them.
#[derive(Default)]
pub struct TreeLatches {
    map: Mutex<HashMap<IndexId, Arc<Mutex<()>>>>,
}

impl TreeLatches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_index(&self, index_id: IndexId) -> Arc<Mutex<()>> {
        self.map.lock().entry(index_id).or_default().clone()
    }
}

/// Requested latching for a leaf-bound descent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BtrLatch {
    SearchLeaf,
    ModifyLeaf,
}

/// A cursor on a record within an mtr-latched leaf page. `rec` may be the
/// infimum or supremum offset after a search miss at the page edge.
#[derive(Debug, Clone, Copy)]
pub struct BtrCursor {
    pub slot: PageSlot,
    pub rec: u16,
}

/// Creates a new index tree: a single empty leaf root. Runs its own mtr.
pub fn btr_create(
    index_id: IndexId,
    space: SpaceId,
    pool: &Arc<BufferPool>,
) -> DbResult<PageNo> {
    let root_no = pool.spaces.allocate_page(space)?;
    let mut mtr = Mtr::new();
    let slot = mtr.get_new_page(pool, PageId::new(space, root_no))?;
    {
        let mut pg = mtr.page_mut(slot);
        page::page_create(&mut pg, index_id, 0);
    }
    mtr.commit(pool)?;
    debug!("created index {} root at {}:{}", index_id, space, root_no);
    Ok(root_no)
}

/// Frees every page of an index tree back to its space. Runs its own mtrs.
pub fn btr_free(index: &IndexDef, pool: &Arc<BufferPool>) -> DbResult<()> {
    // Walk leftmost descent collecting per-level first pages, then follow
    // the sibling chains.
    let mut level_firsts = Vec::new();
    {
        let mut mtr = Mtr::new();
        let mut page_no = index.root;
        loop {
            let slot = mtr.get_page(pool, index.page_id(page_no), LatchMode::S)?;
            let frame = mtr.frame(slot);
            level_firsts.push(page_no);
            if page_level(frame) == 0 {
                break;
            }
            let first = rec_next(frame, INFIMUM_OFFSET);
            if first == SUPREMUM_OFFSET {
                break;
            }
            page_no = node_ptr_child_no(frame, first);
            mtr.release(slot);
        }
        mtr.commit(pool)?;
    }
    for first in level_firsts {
        let mut page_no = first;
        while page_no != FIL_NULL {
            let next;
            {
                let mut mtr = Mtr::new();
                let slot = mtr.get_page(pool, index.page_id(page_no), LatchMode::S)?;
                next = page_next(mtr.frame(slot));
                mtr.commit(pool)?;
            }
            if page_no != index.root {
                pool.spaces.free_page(index.page_id(page_no))?;
            }
            page_no = next;
        }
    }
    pool.spaces.free_page(index.page_id(index.root))?;
    Ok(())
}

/// Child page number stored as the last field of a node-pointer record.
pub fn node_ptr_child_no(frame: &[u8], rec: u16) -> PageNo {
    let n = page::rec_n_fields(frame, rec) as usize;
    let f = page::rec_field(frame, rec, n - 1);
    u32::from_be_bytes(f.try_into().expect("node pointer child field is 4 bytes"))
}

/// Builds the node-pointer tuple `(min_key_of_child, child_page_no)`.
fn node_ptr_tuple(index: &IndexDef, child_frame: &[u8], child_no: PageNo) -> Tuple {
    let first = rec_next(child_frame, INFIMUM_OFFSET);
    debug_assert_ne!(first, SUPREMUM_OFFSET, "node pointer for an empty page");
    let mut fields = Vec::with_capacity(index.n_key_fields + 1);
    for i in 0..index.n_key_fields {
        fields.push(page::rec_field(child_frame, first, i).to_vec());
    }
    fields.push(child_no.to_be_bytes().to_vec());
    Tuple::new(fields)
}

/// Picks the child to descend into for `key`: the LE node pointer, falling
/// back to the leftmost child when the key sorts below every pointer.
fn search_child(frame: &[u8], index: &IndexDef, key: &Tuple) -> PageNo {
    let mut rec = page_cur_search(frame, key, index.compare, index.n_key_fields, SearchMode::LE);
    if rec == INFIMUM_OFFSET {
        rec = rec_next(frame, INFIMUM_OFFSET);
        debug_assert_ne!(rec, SUPREMUM_OFFSET, "internal page has no children");
    }
    node_ptr_child_no(frame, rec)
}

/// Descends to the leaf that may contain `key` and positions a page cursor
/// per `mode`. Latch coupling: the parent is released once the child is
/// latched.
pub fn btr_cursor_search(
    index: &IndexDef,
    key: &Tuple,
    mode: SearchMode,
    latch: BtrLatch,
    pool: &Arc<BufferPool>,
    mtr: &mut Mtr,
) -> DbResult<BtrCursor> {
    let root_id = index.page_id(index.root);
    loop {
        let mut slot = mtr.get_page(pool, root_id, LatchMode::S)?;
        if page_level(mtr.frame(slot)) == 0 && latch == BtrLatch::ModifyLeaf {
            // The root is the leaf; retake it exclusively.
            mtr.release(slot);
            slot = mtr.get_page(pool, root_id, LatchMode::X)?;
            if page_level(mtr.frame(slot)) != 0 {
                // The tree grew a level in between; start over.
                mtr.release(slot);
                continue;
            }
        }
        loop {
            let level = page_level(mtr.frame(slot));
            if level == 0 {
                let rec =
                    page_cur_search(mtr.frame(slot), key, index.compare, index.n_key_fields, mode);
                return Ok(BtrCursor { slot, rec });
            }
            let child_no = search_child(mtr.frame(slot), index, key);
            let child_mode = if level == 1 && latch == BtrLatch::ModifyLeaf {
                LatchMode::X
            } else {
                LatchMode::S
            };
            let child = mtr.get_page(pool, index.page_id(child_no), child_mode)?;
            mtr.release(slot);
            slot = child;
        }
    }
}

/// Opens a cursor at the first or last user record of the index. The cursor
/// rests on the infimum (first) or supremum (last); callers step from there.
pub fn btr_cursor_open_at_side(
    first: bool,
    index: &IndexDef,
    latch: BtrLatch,
    pool: &Arc<BufferPool>,
    mtr: &mut Mtr,
) -> DbResult<BtrCursor> {
    let root_id = index.page_id(index.root);
    loop {
        let mut slot = mtr.get_page(pool, root_id, LatchMode::S)?;
        if page_level(mtr.frame(slot)) == 0 && latch == BtrLatch::ModifyLeaf {
            mtr.release(slot);
            slot = mtr.get_page(pool, root_id, LatchMode::X)?;
            if page_level(mtr.frame(slot)) != 0 {
                mtr.release(slot);
                continue;
            }
        }
        loop {
            let frame = mtr.frame(slot);
            let level = page_level(frame);
            if level == 0 {
                let rec = if first {
                    INFIMUM_OFFSET
                } else {
                    SUPREMUM_OFFSET
                };
                return Ok(BtrCursor { slot, rec });
            }
            let edge_rec = if first {
                rec_next(frame, INFIMUM_OFFSET)
            } else {
                // Walk to the last node pointer.
                let mut rec = rec_next(frame, INFIMUM_OFFSET);
                let mut last = rec;
                while rec != SUPREMUM_OFFSET {
                    last = rec;
                    rec = rec_next(frame, rec);
                }
                last
            };
            let child_no = node_ptr_child_no(frame, edge_rec);
            let child_mode = if level == 1 && latch == BtrLatch::ModifyLeaf {
                LatchMode::X
            } else {
                LatchMode::S
            };
            let child = mtr.get_page(pool, index.page_id(child_no), child_mode)?;
            mtr.release(slot);
            slot = child;
        }
    }
}

/// Optimistic insert at an x-latched cursor position. `Ok(None)` means the
/// page is full even after compaction and the caller must go pessimistic.
pub fn btr_cursor_insert_optimistic(
    index: &IndexDef,
    cur: &BtrCursor,
    tuple: &Tuple,
    locks: &LockSys,
    mtr: &mut Mtr,
) -> DbResult<Option<u16>> {
    let page_id = mtr.page_id(cur.slot);
    {
        let mut pg = mtr.page_mut(cur.slot);
        if let Some(rec) = page_cur_insert(&mut pg, cur.rec, tuple, REC_TYPE_ORDINARY, 0)? {
            return Ok(Some(rec));
        }
    }
    // Compact and retry when the page carries garbage.
    if page::get_u16(mtr.frame(cur.slot), page::PAGE_GARBAGE) as usize >= tuple.rec_size() {
        let mapping = {
            let mut pg = mtr.page_mut(cur.slot);
            page_reorganize(&mut pg)
        };
        locks.move_locks_same_page(page_id, &mapping);
        let rec = page_cur_search(
            mtr.frame(cur.slot),
            &tuple.prefix(index.n_key_fields),
            index.compare,
            index.n_key_fields,
            SearchMode::LE,
        );
        let mut pg = mtr.page_mut(cur.slot);
        if let Some(new_rec) = page_cur_insert(&mut pg, rec, tuple, REC_TYPE_ORDINARY, 0)? {
            return Ok(Some(new_rec));
        }
    }
    Ok(None)
}

/// Collected image of records to move between pages during a split/merge.
struct MovedRec {
    tuple: Tuple,
    rec_type: u8,
    info_bits: u8,
    old_heap: HeapNo,
}

fn collect_recs_from(frame: &[u8], from_rec: u16) -> Vec<MovedRec> {
    let mut out = Vec::new();
    let mut rec = from_rec;
    while rec != SUPREMUM_OFFSET {
        out.push(MovedRec {
            tuple: rec_to_tuple(frame, rec),
            rec_type: page::rec_type(frame, rec),
            info_bits: page::rec_info_bits(frame, rec),
            old_heap: page::rec_heap_no(frame, rec),
        });
        rec = rec_next(frame, rec);
    }
    out
}

/// Appends collected records to `pg` after `after_rec`, returning the heap
/// number mapping for lock migration.
fn append_recs(pg: &mut PageMut<'_>, after_rec: u16, recs: &[MovedRec]) -> Vec<(HeapNo, HeapNo)> {
    let mut mapping = Vec::with_capacity(recs.len());
    let mut cursor = after_rec;
    for r in recs {
        let new_rec = page_cur_insert(pg, cursor, &r.tuple, r.rec_type, r.info_bits)
            .expect("moved record cannot be oversize")
            .expect("target page has room for the moved records");
        mapping.push((r.old_heap, page::rec_heap_no(pg.frame, new_rec)));
        cursor = new_rec;
    }
    mapping
}

fn last_user_rec(frame: &[u8]) -> u16 {
    let mut rec = rec_next(frame, INFIMUM_OFFSET);
    let mut last = INFIMUM_OFFSET;
    while rec != SUPREMUM_OFFSET {
        last = rec;
        rec = rec_next(frame, rec);
    }
    last
}

/// X-latches the whole path from the root to the leaf bounding `key`.
fn descend_x_path(
    index: &IndexDef,
    key: &Tuple,
    pool: &Arc<BufferPool>,
    mtr: &mut Mtr,
) -> DbResult<Vec<PageSlot>> {
    let mut path: Vec<PageSlot> = Vec::new();
    let mut slot = mtr.get_page(pool, index.page_id(index.root), LatchMode::X)?;
    path.push(slot);
    while page_level(mtr.frame(slot)) > 0 {
        let child_no = search_child(mtr.frame(slot), index, key);
        let child = mtr.get_page(pool, index.page_id(child_no), LatchMode::X)?;
        path.push(child);
        slot = child;
    }
    Ok(path)
}

/// The split-propagation insert loop over an x-latched path. Splits pages
/// (raising the root when it is the one splitting) until the pending record
/// fits, then bubbles node pointers upward.
fn insert_with_path(
    index: &IndexDef,
    pool: &Arc<BufferPool>,
    locks: &LockSys,
    mtr: &mut Mtr,
    path: &mut Vec<PageSlot>,
    tuple: &Tuple,
) -> DbResult<(PageId, u16)> {
    let mut pending = tuple.clone();
    let mut pending_type = REC_TYPE_ORDINARY;
    let mut level_idx = path.len() - 1;
    let mut leaf_result: Option<(PageId, u16)> = None;

    loop {
        let target = path[level_idx];
        if let Some(rec) =
            try_insert_in_page(index, pool, locks, mtr, target, &pending, pending_type)?
        {
            if pending_type == REC_TYPE_ORDINARY {
                leaf_result = Some((mtr.page_id(target), rec));
            }
            break;
        }

        if level_idx == 0 {
            // The root is full: raise it, then split its new child instead.
            let child = root_raise(index, pool, locks, mtr, path[0])?;
            path.insert(1, child);
            level_idx = 1;
        }

        let (node_ptr, inserted) =
            split_and_insert(index, pool, locks, mtr, path[level_idx], &pending, pending_type)?;
        if pending_type == REC_TYPE_ORDINARY {
            leaf_result = Some(inserted);
        }
        pending = node_ptr;
        pending_type = REC_TYPE_NODE_PTR;
        level_idx -= 1;
    }

    Ok(leaf_result.expect("the insert loop places the user record"))
}

/// Pessimistic insert: x-latches the whole path under the index tree latch,
/// splitting pages (and raising the root) as needed. Returns the offset of
/// the inserted leaf record together with its page.
pub fn btr_insert_pessimistic(
    index: &IndexDef,
    tuple: &Tuple,
    pool: &Arc<BufferPool>,
    locks: &LockSys,
    tree_latches: &TreeLatches,
    mtr: &mut Mtr,
) -> DbResult<(PageId, u16)> {
    let tree_latch = tree_latches.for_index(index.id);
    let _tree_guard = tree_latch.lock();

    let key = tuple.prefix(index.n_key_fields);
    let mut path = descend_x_path(index, &key, pool, mtr)?;
    insert_with_path(index, pool, locks, mtr, &mut path, tuple)
}

/// Pessimistic record replacement for size-changing updates: removes the
/// record matching `key` and inserts `new_tuple` (same key) in one mtr,
/// splitting if needed. The old record's locks follow to the new location.
/// Returns `false` when no matching record exists.
pub fn btr_replace_pessimistic(
    index: &IndexDef,
    key: &Tuple,
    new_tuple: &Tuple,
    pool: &Arc<BufferPool>,
    locks: &LockSys,
    tree_latches: &TreeLatches,
) -> DbResult<bool> {
    let tree_latch = tree_latches.for_index(index.id);
    let _tree_guard = tree_latch.lock();

    let mut mtr = Mtr::new();
    let mut path = descend_x_path(index, key, pool, &mut mtr)?;
    let leaf = *path.last().expect("descent reaches a leaf");
    let rec = page_cur_search(
        mtr.frame(leaf),
        key,
        index.compare,
        index.n_key_fields,
        SearchMode::GE,
    );
    let found = rec != SUPREMUM_OFFSET
        && page::rec_cmp_with_tuple(mtr.frame(leaf), rec, key, index.compare, index.n_key_fields)
            == Ordering::Equal;
    if !found {
        mtr.commit(pool)?;
        return Ok(false);
    }
    let old_page = mtr.page_id(leaf);
    let old_heap = page::rec_heap_no(mtr.frame(leaf), rec);
    {
        let mut pg = mtr.page_mut(leaf);
        page_cur_delete(&mut pg, rec);
    }
    let (new_page, new_rec) = insert_with_path(index, pool, locks, &mut mtr, &mut path, new_tuple)?;
    let new_heap = page::rec_heap_no(mtr.frame(mtr.find_page(new_page).expect("latched")), new_rec);
    if new_page == old_page {
        locks.move_locks_same_page(old_page, &[(old_heap, new_heap)]);
    } else {
        locks.move_locks(old_page, new_page, &[(old_heap, new_heap)]);
    }
    mtr.commit(pool)?;
    Ok(true)
}

fn try_insert_in_page(
    index: &IndexDef,
    _pool: &Arc<BufferPool>,
    locks: &LockSys,
    mtr: &mut Mtr,
    slot: PageSlot,
    tuple: &Tuple,
    rec_type: u8,
) -> DbResult<Option<u16>> {
    let key = tuple.prefix(index.n_key_fields);
    let page_id = mtr.page_id(slot);
    let pos = page_cur_search(
        mtr.frame(slot),
        &key,
        index.compare,
        index.n_key_fields,
        SearchMode::LE,
    );
    {
        let mut pg = mtr.page_mut(slot);
        if let Some(rec) = page_cur_insert(&mut pg, pos, tuple, rec_type, 0)? {
            return Ok(Some(rec));
        }
    }
    if page::get_u16(mtr.frame(slot), page::PAGE_GARBAGE) as usize >= tuple.rec_size() {
        let mapping = {
            let mut pg = mtr.page_mut(slot);
            page_reorganize(&mut pg)
        };
        locks.move_locks_same_page(page_id, &mapping);
        let pos = page_cur_search(
            mtr.frame(slot),
            &key,
            index.compare,
            index.n_key_fields,
            SearchMode::LE,
        );
        let mut pg = mtr.page_mut(slot);
        if let Some(rec) = page_cur_insert(&mut pg, pos, tuple, rec_type, 0)? {
            return Ok(Some(rec));
        }
    }
    Ok(None)
}

/// Splits the x-latched page, inserting `tuple` into the proper half.
/// Returns the node pointer for the new right page and the inserted record.
fn split_and_insert(
    index: &IndexDef,
    pool: &Arc<BufferPool>,
    locks: &LockSys,
    mtr: &mut Mtr,
    slot: PageSlot,
    tuple: &Tuple,
    rec_type: u8,
) -> DbResult<(Tuple, (PageId, u16))> {
    let page_id = mtr.page_id(slot);
    let level = page_level(mtr.frame(slot));
    let key = tuple.prefix(index.n_key_fields);

    // Split point: the record after the midpoint, or the insert point when
    // the workload is appending to the right end.
    let frame = mtr.frame(slot);
    let n_recs = page::page_n_recs(frame) as usize;
    debug_assert!(n_recs >= 1);
    let insert_pos = page_cur_search(frame, &key, index.compare, index.n_key_fields, SearchMode::LE);
    let appending = page::get_u16(frame, page::PAGE_DIRECTION) == 2
        && insert_pos == last_user_rec(frame)
        && insert_pos != INFIMUM_OFFSET;
    let split_rec = if appending {
        // New page starts empty; only the new tuple goes right.
        SUPREMUM_OFFSET
    } else {
        let mut rec = rec_next(frame, INFIMUM_OFFSET);
        for _ in 0..n_recs / 2 {
            rec = rec_next(frame, rec);
        }
        rec
    };

    // Allocate and format the new right page.
    let new_page_no = pool.spaces.allocate_page(index.space)?;
    let new_page_id = index.page_id(new_page_no);
    let new_slot = mtr.get_new_page(pool, new_page_id)?;
    {
        let mut pg = mtr.page_mut(new_slot);
        page::page_create(&mut pg, index.id, level);
    }

    // Move the upper records across and migrate their locks.
    let moved = if split_rec == SUPREMUM_OFFSET {
        Vec::new()
    } else {
        collect_recs_from(mtr.frame(slot), split_rec)
    };
    let moved_offsets: Vec<u16> = {
        let frame = mtr.frame(slot);
        let mut offs = Vec::new();
        let mut rec = split_rec;
        while rec != SUPREMUM_OFFSET {
            offs.push(rec);
            rec = rec_next(frame, rec);
        }
        offs
    };
    let mapping = {
        let mut pg = mtr.page_mut(new_slot);
        append_recs(&mut pg, INFIMUM_OFFSET, &moved)
    };
    {
        let mut pg = mtr.page_mut(slot);
        for off in moved_offsets {
            page_cur_delete(&mut pg, off);
        }
    }
    if !mapping.is_empty() {
        locks.move_locks(page_id, new_page_id, &mapping);
    }

    // Sibling links: old <-> new <-> old_next.
    let old_next = page_next(mtr.frame(slot));
    {
        let mut pg = mtr.page_mut(new_slot);
        pg.write_u32(page::FIL_PAGE_PREV, page_id.page_no);
        pg.write_u32(page::FIL_PAGE_NEXT, old_next);
    }
    {
        let mut pg = mtr.page_mut(slot);
        pg.write_u32(page::FIL_PAGE_NEXT, new_page_no);
    }
    if old_next != FIL_NULL {
        let next_slot = match mtr.find_page(index.page_id(old_next)) {
            Some(s) => s,
            None => mtr.get_page(pool, index.page_id(old_next), LatchMode::X)?,
        };
        let mut pg = mtr.page_mut(next_slot);
        pg.write_u32(page::FIL_PAGE_PREV, new_page_no);
    }

    // Insert the pending tuple into the half it sorts into.
    let goes_right = if moved.is_empty() {
        true
    } else {
        let first_right = &moved[0].tuple;
        (index.compare)(
            &key.fields,
            &first_right.fields[..index.n_key_fields.min(first_right.fields.len())],
        ) != Ordering::Less
    };
    let target = if goes_right { new_slot } else { slot };
    let target_id = mtr.page_id(target);
    let pos = page_cur_search(
        mtr.frame(target),
        &key,
        index.compare,
        index.n_key_fields,
        SearchMode::LE,
    );
    let rec = {
        let mut pg = mtr.page_mut(target);
        page_cur_insert(&mut pg, pos, tuple, rec_type, 0)?
            .expect("a freshly split page has room")
    };

    // Next-key semantics across the split: locks on the first right record
    // also guard the gap now ending at the left page's supremum.
    let first_right = rec_next(mtr.frame(new_slot), INFIMUM_OFFSET);
    let first_right_heap = page::rec_heap_no(mtr.frame(new_slot), first_right);
    locks.update_split_right(page_id, new_page_id, first_right_heap);

    let node_ptr = node_ptr_tuple(index, mtr.frame(new_slot), new_page_no);
    debug!(
        "split {} level {}: new page {} ({} records moved)",
        page_id,
        level,
        new_page_id,
        moved.len()
    );
    Ok((node_ptr, (target_id, rec)))
}

/// Root raise: the old root's records move to a fresh child and the root is
/// reinitialized one level up with a single node pointer. The root page
/// number never changes.
fn root_raise(
    index: &IndexDef,
    pool: &Arc<BufferPool>,
    locks: &LockSys,
    mtr: &mut Mtr,
    root_slot: PageSlot,
) -> DbResult<PageSlot> {
    let root_id = index.page_id(index.root);
    let old_level = page_level(mtr.frame(root_slot));

    let child_no = pool.spaces.allocate_page(index.space)?;
    let child_id = index.page_id(child_no);
    let child_slot = mtr.get_new_page(pool, child_id)?;
    {
        let mut pg = mtr.page_mut(child_slot);
        page::page_create(&mut pg, index.id, old_level);
    }

    let moved = collect_recs_from(mtr.frame(root_slot), rec_next(mtr.frame(root_slot), INFIMUM_OFFSET));
    let mapping = {
        let mut pg = mtr.page_mut(child_slot);
        append_recs(&mut pg, INFIMUM_OFFSET, &moved)
    };
    locks.move_locks(root_id, child_id, &mapping);
    locks.update_root_raise(root_id, child_id);

    // Rebuild the root one level higher with one node pointer.
    {
        let mut pg = mtr.page_mut(root_slot);
        page::page_create(&mut pg, index.id, old_level + 1);
    }
    let node_ptr = node_ptr_tuple(index, mtr.frame(child_slot), child_no);
    {
        let mut pg = mtr.page_mut(root_slot);
        page_cur_insert(&mut pg, INFIMUM_OFFSET, &node_ptr, REC_TYPE_NODE_PTR, 0)?
            .expect("empty root holds one node pointer");
    }
    debug!(
        "root raise: index {} now level {}, child {}",
        index.id,
        old_level + 1,
        child_id
    );
    Ok(child_slot)
}

/// Sets or clears the delete mark on the cursor record.
pub fn btr_delete_mark(cur: &BtrCursor, mark: bool, mtr: &mut Mtr) {
    let mut pg = mtr.page_mut(cur.slot);
    page::rec_set_delete_mark(&mut pg, cur.rec, mark);
}

/// Merge threshold: a page under half full tries to merge into its left
/// sibling.
fn should_merge(frame: &[u8]) -> bool {
    let used = page::get_u16(frame, page::PAGE_HEAP_TOP) as usize
        - page::get_u16(frame, page::PAGE_GARBAGE) as usize;
    used < crate::PAGE_SIZE / 2 && page_prev(frame) != FIL_NULL
}

/// Physically removes the record matching `key` when `should_delete`
/// approves of it. Used by purge and rollback; runs its own mtr under the
/// tree latch. Returns whether a record was removed.
pub fn btr_delete_physical(
    index: &IndexDef,
    key: &Tuple,
    pool: &Arc<BufferPool>,
    locks: &LockSys,
    tree_latches: &TreeLatches,
    should_delete: impl Fn(&[u8], u16) -> bool,
) -> DbResult<bool> {
    let tree_latch = tree_latches.for_index(index.id);
    let _tree_guard = tree_latch.lock();

    let mut mtr = Mtr::new();

    // X-latch the path so underflow can be fixed in the same mtr.
    let mut path: Vec<PageSlot> = Vec::new();
    let mut slot = mtr.get_page(pool, index.page_id(index.root), LatchMode::X)?;
    path.push(slot);
    while page_level(mtr.frame(slot)) > 0 {
        let child_no = search_child(mtr.frame(slot), index, key);
        let child = mtr.get_page(pool, index.page_id(child_no), LatchMode::X)?;
        path.push(child);
        slot = child;
    }

    let leaf = *path.last().expect("descent reaches a leaf");
    let rec = page_cur_search(
        mtr.frame(leaf),
        key,
        index.compare,
        index.n_key_fields,
        SearchMode::GE,
    );
    let found = rec != SUPREMUM_OFFSET
        && page::rec_cmp_with_tuple(mtr.frame(leaf), rec, key, index.compare, index.n_key_fields)
            == Ordering::Equal;
    if !found || !should_delete(mtr.frame(leaf), rec) {
        mtr.commit(pool)?;
        return Ok(false);
    }

    // Next-key semantics: the successor inherits the deleted record's locks
    // as gap locks.
    let leaf_id = mtr.page_id(leaf);
    let heap_no = page::rec_heap_no(mtr.frame(leaf), rec);
    let succ = rec_next(mtr.frame(leaf), rec);
    let succ_heap = page::rec_heap_no(mtr.frame(leaf), succ);
    locks.update_delete(leaf_id, heap_no, leaf_id, succ_heap);

    {
        let mut pg = mtr.page_mut(leaf);
        page_cur_delete(&mut pg, rec);
    }

    if page::page_n_recs(mtr.frame(leaf)) == 0 && path.len() > 1 {
        discard_empty_page(index, pool, locks, &mut mtr, &path)?;
    } else if should_merge(mtr.frame(leaf)) && path.len() > 1 {
        try_merge_left(index, pool, locks, &mut mtr, &path)?;
    }

    mtr.commit(pool)?;
    Ok(true)
}

/// Finds the node-pointer record in `parent_frame` naming `child_no`.
fn find_node_ptr(parent_frame: &[u8], child_no: PageNo) -> Option<u16> {
    let mut rec = rec_next(parent_frame, INFIMUM_OFFSET);
    while rec != SUPREMUM_OFFSET {
        if node_ptr_child_no(parent_frame, rec) == child_no {
            return Some(rec);
        }
        rec = rec_next(parent_frame, rec);
    }
    None
}

/// Unlinks and frees an emptied leaf: removes its node pointer and bridges
/// the sibling list around it.
fn discard_empty_page(
    index: &IndexDef,
    pool: &Arc<BufferPool>,
    locks: &LockSys,
    mtr: &mut Mtr,
    path: &[PageSlot],
) -> DbResult<()> {
    let leaf = *path.last().expect("path has a leaf");
    let parent = path[path.len() - 2];
    let leaf_id = mtr.page_id(leaf);

    // The parent must still name this child; if the parent would be emptied
    // the page is its level's last one and stays.
    let Some(node_rec) = find_node_ptr(mtr.frame(parent), leaf_id.page_no) else {
        return Ok(());
    };
    if page::page_n_recs(mtr.frame(parent)) <= 1 {
        return Ok(());
    }

    let prev_no = page_prev(mtr.frame(leaf));
    let next_no = page_next(mtr.frame(leaf));

    // Left sibling first, without blocking: bail out rather than invert the
    // latch order.
    let prev_slot = if prev_no != FIL_NULL {
        match mtr.get_page_nowait(pool, index.page_id(prev_no), LatchMode::X)? {
            Some(s) => Some(s),
            None => return Ok(()),
        }
    } else {
        None
    };
    let next_slot = if next_no != FIL_NULL {
        match mtr.find_page(index.page_id(next_no)) {
            Some(s) => Some(s),
            None => Some(mtr.get_page(pool, index.page_id(next_no), LatchMode::X)?),
        }
    } else {
        None
    };

    // Supremum gap of the removed page merges into the left sibling's.
    locks.update_merge_left(leaf_id, prev_no.ne(&FIL_NULL).then(|| index.page_id(prev_no)));

    {
        let mut pg = mtr.page_mut(parent);
        page_cur_delete(&mut pg, node_rec);
    }
    if let Some(ps) = prev_slot {
        let mut pg = mtr.page_mut(ps);
        pg.write_u32(page::FIL_PAGE_NEXT, next_no);
    }
    if let Some(ns) = next_slot {
        let mut pg = mtr.page_mut(ns);
        pg.write_u32(page::FIL_PAGE_PREV, prev_no);
    }
    {
        let mut pg = mtr.page_mut(leaf);
        pg.write_u16(page::FIL_PAGE_TYPE, page::PAGE_TYPE_ALLOCATED);
    }
    pool.spaces.free_page(leaf_id)?;
    debug!("discarded empty page {}", leaf_id);

    maybe_lift_root(index, pool, locks, mtr, path)?;
    Ok(())
}

/// Merges the leaf into its left sibling when both share a parent and the
/// records fit, then discards the emptied page.
fn try_merge_left(
    index: &IndexDef,
    pool: &Arc<BufferPool>,
    locks: &LockSys,
    mtr: &mut Mtr,
    path: &[PageSlot],
) -> DbResult<()> {
    let leaf = *path.last().expect("path has a leaf");
    let parent = path[path.len() - 2];
    let leaf_id = mtr.page_id(leaf);
    let prev_no = page_prev(mtr.frame(leaf));
    if prev_no == FIL_NULL {
        return Ok(());
    }
    // Same-parent constraint keeps node-pointer maintenance local. The
    // offset stays valid: nothing below touches the parent until the
    // unlink.
    if find_node_ptr(mtr.frame(parent), prev_no).is_none() {
        return Ok(());
    }
    let Some(node_rec) = find_node_ptr(mtr.frame(parent), leaf_id.page_no) else {
        return Ok(());
    };
    let Some(left_slot) = mtr.get_page_nowait(pool, index.page_id(prev_no), LatchMode::X)? else {
        return Ok(());
    };
    let left_id = mtr.page_id(left_slot);

    // Fit check: every record must land on the left page.
    let moved = collect_recs_from(mtr.frame(leaf), rec_next(mtr.frame(leaf), INFIMUM_OFFSET));
    let needed: usize = moved.iter().map(|m| m.tuple.rec_size()).sum();
    let left_frame = mtr.frame(left_slot);
    let left_free = crate::page::FIL_TRAILER
        - page::dir_n_slots(left_frame) * page::PAGE_DIR_SLOT_SIZE
        - page::get_u16(left_frame, page::PAGE_HEAP_TOP) as usize;
    if needed + moved.len() * page::PAGE_DIR_SLOT_SIZE > left_free {
        return Ok(());
    }

    let mapping = {
        let after = last_user_rec(mtr.frame(left_slot));
        let mut pg = mtr.page_mut(left_slot);
        append_recs(&mut pg, after, &moved)
    };
    locks.move_locks(leaf_id, left_id, &mapping);
    locks.update_merge_left(leaf_id, Some(left_id));
    {
        let offsets: Vec<u16> = page::page_user_recs(mtr.frame(leaf));
        let mut pg = mtr.page_mut(leaf);
        for off in offsets {
            page_cur_delete(&mut pg, off);
        }
    }

    // Unlink the emptied page.
    let next_no = page_next(mtr.frame(leaf));
    {
        let mut pg = mtr.page_mut(parent);
        page_cur_delete(&mut pg, node_rec);
    }
    {
        let mut pg = mtr.page_mut(left_slot);
        pg.write_u32(page::FIL_PAGE_NEXT, next_no);
    }
    if next_no != FIL_NULL {
        let next_slot = match mtr.find_page(index.page_id(next_no)) {
            Some(s) => s,
            None => mtr.get_page(pool, index.page_id(next_no), LatchMode::X)?,
        };
        let mut pg = mtr.page_mut(next_slot);
        pg.write_u32(page::FIL_PAGE_PREV, prev_no);
    }
    {
        let mut pg = mtr.page_mut(leaf);
        pg.write_u16(page::FIL_PAGE_TYPE, page::PAGE_TYPE_ALLOCATED);
    }
    pool.spaces.free_page(leaf_id)?;
    debug!("merged {} into {}", leaf_id, left_id);

    maybe_lift_root(index, pool, locks, mtr, path)?;
    Ok(())
}

/// When the root is left with a single node pointer, the tree shrinks: the
/// lone child's records lift into the root and the child is freed.
fn maybe_lift_root(
    index: &IndexDef,
    pool: &Arc<BufferPool>,
    locks: &LockSys,
    mtr: &mut Mtr,
    path: &[PageSlot],
) -> DbResult<()> {
    let root_slot = path[0];
    let root_id = index.page_id(index.root);
    if page_level(mtr.frame(root_slot)) == 0 || page::page_n_recs(mtr.frame(root_slot)) != 1 {
        return Ok(());
    }
    let only_ptr = rec_next(mtr.frame(root_slot), INFIMUM_OFFSET);
    let child_no = node_ptr_child_no(mtr.frame(root_slot), only_ptr);
    let child_id = index.page_id(child_no);
    let child_slot = match mtr.find_page(child_id) {
        Some(s) => s,
        None => match mtr.get_page_nowait(pool, child_id, LatchMode::X)? {
            Some(s) => s,
            None => return Ok(()),
        },
    };
    // Only a childless level collapses into the root.
    if page_prev(mtr.frame(child_slot)) != FIL_NULL || page_next(mtr.frame(child_slot)) != FIL_NULL
    {
        return Ok(());
    }

    let child_level = page_level(mtr.frame(child_slot));
    let moved = collect_recs_from(
        mtr.frame(child_slot),
        rec_next(mtr.frame(child_slot), INFIMUM_OFFSET),
    );
    {
        let mut pg = mtr.page_mut(root_slot);
        page::page_create(&mut pg, index.id, child_level);
    }
    let mapping = {
        let mut pg = mtr.page_mut(root_slot);
        append_recs(&mut pg, INFIMUM_OFFSET, &moved)
    };
    locks.move_locks(child_id, root_id, &mapping);
    locks.update_merge_left(child_id, Some(root_id));
    {
        let mut pg = mtr.page_mut(child_slot);
        pg.write_u16(page::FIL_PAGE_TYPE, page::PAGE_TYPE_ALLOCATED);
    }
    pool.spaces.free_page(child_id)?;
    debug!("lifted page {} into root of index {}", child_id, index.id);
    Ok(())
}
