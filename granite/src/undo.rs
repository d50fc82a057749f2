//! Undo logs and rollback segments.
//!
//! A rollback segment is a header page with a slot array of active undo
//! logs, a doubly linked history list of committed update-undo logs ordered
//! by commit number, and one cached page per undo kind for reuse. An undo
//! log is a chain of undo pages; records are appended as `[len][bincode]`
//! entries. A roll pointer packs `(is_insert, rseg_id, page_no, offset)`
//! and locates the newest undo record of a row.

use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::buffer_pool::{BufferPool, LatchMode};
use crate::errors::{DbError, DbResult};
use crate::mtr::Mtr;
use crate::page::{self, PageMut};
use crate::sync::{LatchRank, RankGuard};
use crate::tablespace::SYSTEM_SPACE_ID;
use crate::wal::RedoRecord;
use crate::{IndexId, PageId, PageNo, TrxId, FIL_NULL, PAGE_SIZE};

// Undo page header, on every undo page.
pub const UNDO_PAGE_FREE: usize = 38; // u16: first free byte of the record area

// Undo log header, on the first page of a log.
pub const UNDO_TRX_ID: usize = 42; // u64
pub const UNDO_TRX_NO: usize = 50; // u64
pub const UNDO_STATE: usize = 58; // u16
pub const UNDO_KIND: usize = 60; // u16
pub const UNDO_HIST_OLDER: usize = 62; // u32, next-older history entry
pub const UNDO_HIST_NEWER: usize = 66; // u32, next-newer history entry
pub const UNDO_LAST_PAGE: usize = 70; // u32, tail of the page chain
pub const UNDO_HDR_END: usize = 76;

/// Record area start on a non-header undo page.
pub const UNDO_PAGE_START: usize = 42;

/// Usable end of the record area.
const UNDO_PAGE_LIMIT: usize = PAGE_SIZE - page::FIL_TRAILER_SIZE;

// Undo log states.
pub const UNDO_STATE_ACTIVE: u16 = 1;
pub const UNDO_STATE_TO_PURGE: u16 = 2;
pub const UNDO_STATE_TO_FREE: u16 = 3;
pub const UNDO_STATE_CACHED: u16 = 4;
pub const UNDO_STATE_PREPARED: u16 = 5;

// Rollback segment header page.
pub const RSEG_HISTORY_LEN: usize = 38; // u32
pub const RSEG_HIST_HEAD: usize = 42; // u32, newest
pub const RSEG_HIST_TAIL: usize = 46; // u32, oldest
pub const RSEG_CACHED_INSERT: usize = 50; // u32
pub const RSEG_CACHED_UPDATE: usize = 54; // u32
pub const RSEG_SLOT_DIR: usize = 64;
pub const RSEG_N_SLOTS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UndoKind {
    Insert,
    UpdateExists,
    DeleteMark,
}

impl UndoKind {
    pub fn is_insert(self) -> bool {
        matches!(self, UndoKind::Insert)
    }
}

/// A single undo record: the pre-image needed to reverse the operation or
/// reconstruct the previous row version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndoRec {
    pub kind: UndoKind,
    pub trx_id: TrxId,
    /// Monotonically increasing within the transaction.
    pub undo_no: u64,
    pub index_id: IndexId,
    /// Full primary-key field values of the affected row.
    pub key: Vec<Vec<u8>>,
    /// `(user_field_no, old_value)` for changed fields (UPDATE).
    pub updated: Vec<(u16, Vec<u8>)>,
    /// The row's previous writer and its roll pointer (the version chain).
    pub old_trx_id: TrxId,
    pub old_roll_ptr: u64,
    pub old_delete_mark: bool,
    /// Old values of changed ordering fields of secondary indexes, for
    /// locating obsolete entries during purge.
    pub ordering_old: Vec<(u16, Vec<u8>)>,
}

// Roll pointer packing: [insert:1][rseg:8][page_no:32][offset:16].

pub fn roll_ptr_pack(is_insert: bool, rseg_id: usize, page_no: PageNo, offset: u16) -> u64 {
    debug_assert!(rseg_id < RSEG_N_SLOTS);
    ((is_insert as u64) << 56) | ((rseg_id as u64) << 48) | ((page_no as u64) << 16) | offset as u64
}

pub fn roll_ptr_is_insert(roll_ptr: u64) -> bool {
    roll_ptr >> 56 & 1 != 0
}

pub fn roll_ptr_rseg(roll_ptr: u64) -> usize {
    (roll_ptr >> 48 & 0xFF) as usize
}

pub fn roll_ptr_page(roll_ptr: u64) -> PageNo {
    (roll_ptr >> 16 & 0xFFFF_FFFF) as PageNo
}

pub fn roll_ptr_offset(roll_ptr: u64) -> u16 {
    (roll_ptr & 0xFFFF) as u16
}

/// A transaction's handle on one of its undo logs.
#[derive(Debug, Clone, Copy)]
pub struct UndoHandle {
    pub rseg_id: usize,
    pub hdr_page: PageNo,
    pub slot: usize,
}

/// A rollback segment. All rollback segments live in the system tablespace.
pub struct Rseg {
    pub id: usize,
    pub header_page: PageNo,
    /// Serializes slot assignment and history-list surgery.
    pub mutex: Mutex<()>,
}

impl Rseg {
    pub fn page_id(&self) -> PageId {
        PageId::new(SYSTEM_SPACE_ID, self.header_page)
    }
}

/// Creates and formats a rollback segment header page.
pub fn rseg_create(pool: &Arc<BufferPool>, id: usize) -> DbResult<Rseg> {
    let page_no = pool.spaces.allocate_page(SYSTEM_SPACE_ID)?;
    let page_id = PageId::new(SYSTEM_SPACE_ID, page_no);
    let mut mtr = Mtr::new();
    let slot = mtr.get_new_page(pool, page_id)?;
    {
        let mut pg = mtr.page_mut(slot);
        if let Some(redo) = pg.redo.as_deref_mut() {
            redo.push(RedoRecord::PageInit {
                space: SYSTEM_SPACE_ID,
                page_no,
                page_type: page::PAGE_TYPE_RSEG,
            });
        }
        page::fil_page_init(&mut pg, page::PAGE_TYPE_RSEG);
        pg.write_u32(RSEG_HISTORY_LEN, 0);
        pg.write_u32(RSEG_HIST_HEAD, FIL_NULL);
        pg.write_u32(RSEG_HIST_TAIL, FIL_NULL);
        pg.write_u32(RSEG_CACHED_INSERT, FIL_NULL);
        pg.write_u32(RSEG_CACHED_UPDATE, FIL_NULL);
        for i in 0..RSEG_N_SLOTS {
            pg.write_u32(RSEG_SLOT_DIR + 4 * i, FIL_NULL);
        }
    }
    mtr.commit(pool)?;
    debug!("created rseg {} at page {}", id, page_no);
    Ok(Rseg {
        id,
        header_page: page_no,
        mutex: Mutex::new(()),
    })
}

pub fn rseg_open(id: usize, header_page: PageNo) -> Rseg {
    Rseg {
        id,
        header_page,
        mutex: Mutex::new(()),
    }
}

fn format_undo_page(pg: &mut PageMut<'_>, first_of_log: bool) {
    if let Some(redo) = pg.redo.as_deref_mut() {
        redo.push(RedoRecord::PageInit {
            space: pg.page_id.space,
            page_no: pg.page_id.page_no,
            page_type: page::PAGE_TYPE_UNDO,
        });
    }
    page::fil_page_init(pg, page::PAGE_TYPE_UNDO);
    let start = if first_of_log {
        UNDO_HDR_END
    } else {
        UNDO_PAGE_START
    };
    pg.write_u16(UNDO_PAGE_FREE, start as u16);
}

/// Assigns a new undo log in the rseg for a transaction's first write of
/// the given kind. Reuses the cached page when one is available.
pub fn undo_assign(
    pool: &Arc<BufferPool>,
    rseg: &Rseg,
    trx_id: TrxId,
    kind: UndoKind,
) -> DbResult<UndoHandle> {
    let _rank = RankGuard::new(LatchRank::TrxUndo);
    let _rseg_guard = rseg.mutex.lock();
    let mut mtr = Mtr::new();
    let rseg_slot = mtr.get_page(pool, rseg.page_id(), LatchMode::X)?;

    let cached_off = if kind.is_insert() {
        RSEG_CACHED_INSERT
    } else {
        RSEG_CACHED_UPDATE
    };
    let cached = page::get_u32(mtr.frame(rseg_slot), cached_off);
    let hdr_page = if cached != FIL_NULL {
        {
            let mut pg = mtr.page_mut(rseg_slot);
            pg.write_u32(cached_off, FIL_NULL);
        }
        cached
    } else {
        pool.spaces.allocate_page(SYSTEM_SPACE_ID)?
    };

    // Find a free slot for recovery to discover this log.
    let frame = mtr.frame(rseg_slot);
    let slot = (0..RSEG_N_SLOTS)
        .find(|i| page::get_u32(frame, RSEG_SLOT_DIR + 4 * i) == FIL_NULL)
        .ok_or(DbError::TooManyConcurrentTrxs)?;
    {
        let mut pg = mtr.page_mut(rseg_slot);
        pg.write_u32(RSEG_SLOT_DIR + 4 * slot, hdr_page);
    }

    let hdr_id = PageId::new(SYSTEM_SPACE_ID, hdr_page);
    let hdr_slot = if cached != FIL_NULL {
        mtr.get_page(pool, hdr_id, LatchMode::X)?
    } else {
        mtr.get_new_page(pool, hdr_id)?
    };
    {
        let mut pg = mtr.page_mut(hdr_slot);
        format_undo_page(&mut pg, true);
        pg.write_u64(UNDO_TRX_ID, trx_id);
        pg.write_u64(UNDO_TRX_NO, 0);
        pg.write_u16(UNDO_STATE, UNDO_STATE_ACTIVE);
        pg.write_u16(UNDO_KIND, if kind.is_insert() { 1 } else { 2 });
        pg.write_u32(UNDO_HIST_OLDER, FIL_NULL);
        pg.write_u32(UNDO_HIST_NEWER, FIL_NULL);
        pg.write_u32(UNDO_LAST_PAGE, hdr_page);
    }
    mtr.commit(pool)?;
    Ok(UndoHandle {
        rseg_id: rseg.id,
        hdr_page,
        slot,
    })
}

/// Appends an undo record to the transaction's undo log, growing the page
/// chain when the current page is full. Returns the record's roll pointer.
pub fn undo_append(
    pool: &Arc<BufferPool>,
    rseg: &Rseg,
    handle: &UndoHandle,
    rec: &UndoRec,
) -> DbResult<u64> {
    let payload = bincode::serialize(rec).expect("undo record serializes");
    let need = payload.len() + 2;
    if need > UNDO_PAGE_LIMIT - UNDO_HDR_END {
        return Err(DbError::RecordTooBig {
            size: need,
            max: UNDO_PAGE_LIMIT - UNDO_HDR_END,
        });
    }

    let mut mtr = Mtr::new();
    let hdr_id = PageId::new(SYSTEM_SPACE_ID, handle.hdr_page);
    let hdr_slot = mtr.get_page(pool, hdr_id, LatchMode::X)?;
    let last_page = page::get_u32(mtr.frame(hdr_slot), UNDO_LAST_PAGE);

    let (target_slot, target_page) = if last_page == handle.hdr_page {
        (hdr_slot, last_page)
    } else {
        let s = mtr.get_page(pool, PageId::new(SYSTEM_SPACE_ID, last_page), LatchMode::X)?;
        (s, last_page)
    };

    let free = page::get_u16(mtr.frame(target_slot), UNDO_PAGE_FREE) as usize;
    let (write_slot, write_page, write_off) = if free + need <= UNDO_PAGE_LIMIT {
        (target_slot, target_page, free)
    } else {
        // Chain a fresh page.
        let new_no = pool.spaces.allocate_page(SYSTEM_SPACE_ID)?;
        let new_id = PageId::new(SYSTEM_SPACE_ID, new_no);
        let new_slot = mtr.get_new_page(pool, new_id)?;
        {
            let mut pg = mtr.page_mut(new_slot);
            format_undo_page(&mut pg, false);
            pg.write_u32(page::FIL_PAGE_PREV, target_page);
        }
        {
            let mut pg = mtr.page_mut(target_slot);
            pg.write_u32(page::FIL_PAGE_NEXT, new_no);
        }
        {
            let mut pg = mtr.page_mut(hdr_slot);
            pg.write_u32(UNDO_LAST_PAGE, new_no);
        }
        (new_slot, new_no, UNDO_PAGE_START)
    };

    {
        let mut pg = mtr.page_mut(write_slot);
        let mut buf = Vec::with_capacity(need);
        buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&payload);
        pg.write_bytes(write_off, &buf);
        pg.write_u16(UNDO_PAGE_FREE, (write_off + need) as u16);
    }
    mtr.commit(pool)?;

    Ok(roll_ptr_pack(
        rec.kind.is_insert(),
        rseg.id,
        write_page,
        write_off as u16,
    ))
}

/// Reads the undo record a roll pointer names. `MissingHistory` when the
/// page no longer holds it (purged and reused).
pub fn undo_read(pool: &Arc<BufferPool>, roll_ptr: u64) -> DbResult<UndoRec> {
    let page_no = roll_ptr_page(roll_ptr);
    let offset = roll_ptr_offset(roll_ptr) as usize;
    let mut mtr = Mtr::new();
    let slot = mtr.get_page(pool, PageId::new(SYSTEM_SPACE_ID, page_no), LatchMode::S)?;
    let frame = mtr.frame(slot);
    if page::page_type(frame) != page::PAGE_TYPE_UNDO {
        mtr.commit(pool)?;
        return Err(DbError::MissingHistory);
    }
    let free = page::get_u16(frame, UNDO_PAGE_FREE) as usize;
    if offset + 2 > free {
        mtr.commit(pool)?;
        return Err(DbError::MissingHistory);
    }
    let len = page::get_u16(frame, offset) as usize;
    if offset + 2 + len > free {
        mtr.commit(pool)?;
        return Err(DbError::MissingHistory);
    }
    let rec = bincode::deserialize(&frame[offset + 2..offset + 2 + len])
        .map_err(|_| DbError::MissingHistory);
    mtr.commit(pool)?;
    rec
}

/// Commit processing for an update-undo log: stamp the commit number, mark
/// it purgeable and link it at the head (newest end) of the rseg history.
pub fn undo_finish_update_at_commit(
    pool: &Arc<BufferPool>,
    rseg: &Rseg,
    handle: &UndoHandle,
    trx_no: u64,
) -> DbResult<()> {
    let _rank = RankGuard::new(LatchRank::TrxUndo);
    let _rseg_guard = rseg.mutex.lock();
    let mut mtr = Mtr::new();
    let rseg_slot = mtr.get_page(pool, rseg.page_id(), LatchMode::X)?;
    let hdr_id = PageId::new(SYSTEM_SPACE_ID, handle.hdr_page);
    let hdr_slot = mtr.get_page(pool, hdr_id, LatchMode::X)?;

    let old_head = page::get_u32(mtr.frame(rseg_slot), RSEG_HIST_HEAD);
    {
        let mut pg = mtr.page_mut(hdr_slot);
        pg.write_u64(UNDO_TRX_NO, trx_no);
        pg.write_u16(UNDO_STATE, UNDO_STATE_TO_PURGE);
        pg.write_u32(UNDO_HIST_OLDER, old_head);
        pg.write_u32(UNDO_HIST_NEWER, FIL_NULL);
    }
    if old_head != FIL_NULL {
        let head_slot = mtr.get_page(pool, PageId::new(SYSTEM_SPACE_ID, old_head), LatchMode::X)?;
        let mut pg = mtr.page_mut(head_slot);
        pg.write_u32(UNDO_HIST_NEWER, handle.hdr_page);
    }
    {
        let hist_len = page::get_u32(mtr.frame(rseg_slot), RSEG_HISTORY_LEN);
        let tail = page::get_u32(mtr.frame(rseg_slot), RSEG_HIST_TAIL);
        let mut pg = mtr.page_mut(rseg_slot);
        pg.write_u32(RSEG_HIST_HEAD, handle.hdr_page);
        if tail == FIL_NULL {
            pg.write_u32(RSEG_HIST_TAIL, handle.hdr_page);
        }
        pg.write_u32(RSEG_HISTORY_LEN, hist_len + 1);
        pg.write_u32(RSEG_SLOT_DIR + 4 * handle.slot, FIL_NULL);
    }
    mtr.commit(pool)?;
    Ok(())
}

/// Commit processing for an insert-undo log: never needed again for MVCC,
/// so the single-page log is cached for reuse (or its chain freed).
pub fn undo_finish_insert_at_commit(
    pool: &Arc<BufferPool>,
    rseg: &Rseg,
    handle: &UndoHandle,
) -> DbResult<()> {
    let _rank = RankGuard::new(LatchRank::TrxUndo);
    let _rseg_guard = rseg.mutex.lock();
    let mut mtr = Mtr::new();
    let rseg_slot = mtr.get_page(pool, rseg.page_id(), LatchMode::X)?;
    let hdr_id = PageId::new(SYSTEM_SPACE_ID, handle.hdr_page);
    let hdr_slot = mtr.get_page(pool, hdr_id, LatchMode::X)?;

    let single_page = page::get_u32(mtr.frame(hdr_slot), UNDO_LAST_PAGE) == handle.hdr_page;
    let cache_empty = page::get_u32(mtr.frame(rseg_slot), RSEG_CACHED_INSERT) == FIL_NULL;

    {
        let mut pg = mtr.page_mut(rseg_slot);
        pg.write_u32(RSEG_SLOT_DIR + 4 * handle.slot, FIL_NULL);
    }

    if single_page && cache_empty {
        {
            let mut pg = mtr.page_mut(hdr_slot);
            pg.write_u16(UNDO_STATE, UNDO_STATE_CACHED);
            pg.write_u16(UNDO_PAGE_FREE, UNDO_HDR_END as u16);
        }
        let mut pg = mtr.page_mut(rseg_slot);
        pg.write_u32(RSEG_CACHED_INSERT, handle.hdr_page);
        mtr.commit(pool)?;
        return Ok(());
    }

    {
        let mut pg = mtr.page_mut(hdr_slot);
        pg.write_u16(UNDO_STATE, UNDO_STATE_TO_FREE);
    }
    // Collect the chain before dropping the latches.
    let mut pages = vec![handle.hdr_page];
    let mut next = page::get_u32(mtr.frame(hdr_slot), page::FIL_PAGE_NEXT);
    mtr.commit(pool)?;
    while next != FIL_NULL {
        let mut walk = Mtr::new();
        let s = walk.get_page(pool, PageId::new(SYSTEM_SPACE_ID, next), LatchMode::S)?;
        pages.push(next);
        next = page::get_u32(walk.frame(s), page::FIL_PAGE_NEXT);
        walk.commit(pool)?;
    }
    for p in pages {
        pool.spaces.free_page(PageId::new(SYSTEM_SPACE_ID, p))?;
    }
    Ok(())
}

/// Marks an undo log prepared (XA) so recovery leaves it for resolution.
pub fn undo_set_prepared(pool: &Arc<BufferPool>, handle: &UndoHandle) -> DbResult<()> {
    let mut mtr = Mtr::new();
    let hdr_id = PageId::new(SYSTEM_SPACE_ID, handle.hdr_page);
    let hdr_slot = mtr.get_page(pool, hdr_id, LatchMode::X)?;
    {
        let mut pg = mtr.page_mut(hdr_slot);
        pg.write_u16(UNDO_STATE, UNDO_STATE_PREPARED);
    }
    mtr.commit(pool)?;
    Ok(())
}

/// All records of an undo log in append order, with their roll pointers.
pub fn undo_log_records(
    pool: &Arc<BufferPool>,
    rseg_id: usize,
    hdr_page: PageNo,
) -> DbResult<Vec<(u64, UndoRec)>> {
    let mut out = Vec::new();
    let mut page_no = hdr_page;
    let mut first = true;
    while page_no != FIL_NULL {
        let mut mtr = Mtr::new();
        let slot = mtr.get_page(pool, PageId::new(SYSTEM_SPACE_ID, page_no), LatchMode::S)?;
        let frame = mtr.frame(slot);
        let mut off = if first { UNDO_HDR_END } else { UNDO_PAGE_START };
        let free = page::get_u16(frame, UNDO_PAGE_FREE) as usize;
        while off + 2 <= free {
            let len = page::get_u16(frame, off) as usize;
            if len == 0 || off + 2 + len > free {
                break;
            }
            if let Ok(rec) = bincode::deserialize::<UndoRec>(&frame[off + 2..off + 2 + len]) {
                let is_insert = rec.kind.is_insert();
                out.push((
                    roll_ptr_pack(is_insert, rseg_id, page_no, off as u16),
                    rec,
                ));
            }
            off += 2 + len;
        }
        let next = page::get_u32(frame, page::FIL_PAGE_NEXT);
        mtr.commit(pool)?;
        page_no = next;
        first = false;
    }
    Ok(out)
}

/// Header summary of an undo log.
pub struct UndoLogInfo {
    pub trx_id: TrxId,
    pub trx_no: u64,
    pub state: u16,
    pub kind: UndoKind,
    pub older: PageNo,
    pub newer: PageNo,
}

pub fn undo_log_info(pool: &Arc<BufferPool>, hdr_page: PageNo) -> DbResult<UndoLogInfo> {
    let mut mtr = Mtr::new();
    let slot = mtr.get_page(pool, PageId::new(SYSTEM_SPACE_ID, hdr_page), LatchMode::S)?;
    let frame = mtr.frame(slot);
    let info = UndoLogInfo {
        trx_id: page::get_u64(frame, UNDO_TRX_ID),
        trx_no: page::get_u64(frame, UNDO_TRX_NO),
        state: page::get_u16(frame, UNDO_STATE),
        kind: if page::get_u16(frame, UNDO_KIND) == 1 {
            UndoKind::Insert
        } else {
            UndoKind::UpdateExists
        },
        older: page::get_u32(frame, UNDO_HIST_OLDER),
        newer: page::get_u32(frame, UNDO_HIST_NEWER),
    };
    mtr.commit(pool)?;
    Ok(info)
}

/// Active or prepared undo logs registered in the rseg slots; recovery
/// rebuilds the transaction table from these.
pub fn rseg_scan_slots(pool: &Arc<BufferPool>, rseg: &Rseg) -> DbResult<Vec<(usize, PageNo)>> {
    let mut mtr = Mtr::new();
    let slot = mtr.get_page(pool, rseg.page_id(), LatchMode::S)?;
    let frame = mtr.frame(slot);
    let mut out = Vec::new();
    for i in 0..RSEG_N_SLOTS {
        let p = page::get_u32(frame, RSEG_SLOT_DIR + 4 * i);
        if p != FIL_NULL {
            out.push((i, p));
        }
    }
    mtr.commit(pool)?;
    Ok(out)
}

/// Oldest history entry of the rseg: `(hdr_page, trx_no)`.
pub fn rseg_history_tail(pool: &Arc<BufferPool>, rseg: &Rseg) -> DbResult<Option<(PageNo, u64)>> {
    let mut mtr = Mtr::new();
    let slot = mtr.get_page(pool, rseg.page_id(), LatchMode::S)?;
    let tail = page::get_u32(mtr.frame(slot), RSEG_HIST_TAIL);
    mtr.commit(pool)?;
    if tail == FIL_NULL {
        return Ok(None);
    }
    let info = undo_log_info(pool, tail)?;
    Ok(Some((tail, info.trx_no)))
}

pub fn rseg_history_len(pool: &Arc<BufferPool>, rseg: &Rseg) -> DbResult<u32> {
    let mut mtr = Mtr::new();
    let slot = mtr.get_page(pool, rseg.page_id(), LatchMode::S)?;
    let len = page::get_u32(mtr.frame(slot), RSEG_HISTORY_LEN);
    mtr.commit(pool)?;
    Ok(len)
}

/// Unlinks the oldest history entry and frees its page chain. Called by
/// purge once no read view needs the log.
pub fn undo_purge_oldest(pool: &Arc<BufferPool>, rseg: &Rseg, hdr_page: PageNo) -> DbResult<()> {
    let _rank = RankGuard::new(LatchRank::TrxUndo);
    let _rseg_guard = rseg.mutex.lock();
    let mut pages = Vec::new();
    {
        let mut mtr = Mtr::new();
        let rseg_slot = mtr.get_page(pool, rseg.page_id(), LatchMode::X)?;
        let hdr_id = PageId::new(SYSTEM_SPACE_ID, hdr_page);
        let hdr_slot = mtr.get_page(pool, hdr_id, LatchMode::X)?;

        debug_assert_eq!(
            page::get_u32(mtr.frame(rseg_slot), RSEG_HIST_TAIL),
            hdr_page,
            "purge removes the oldest history entry"
        );
        let newer = page::get_u32(mtr.frame(hdr_slot), UNDO_HIST_NEWER);
        {
            let hist_len = page::get_u32(mtr.frame(rseg_slot), RSEG_HISTORY_LEN);
            let mut pg = mtr.page_mut(rseg_slot);
            pg.write_u32(RSEG_HIST_TAIL, newer);
            if newer == FIL_NULL {
                pg.write_u32(RSEG_HIST_HEAD, FIL_NULL);
            }
            pg.write_u32(RSEG_HISTORY_LEN, hist_len.saturating_sub(1));
        }
        if newer != FIL_NULL {
            let newer_slot =
                mtr.get_page(pool, PageId::new(SYSTEM_SPACE_ID, newer), LatchMode::X)?;
            let mut pg = mtr.page_mut(newer_slot);
            pg.write_u32(UNDO_HIST_OLDER, FIL_NULL);
        }

        // Collect and detach the page chain.
        pages.push(hdr_page);
        let mut next = page::get_u32(mtr.frame(hdr_slot), page::FIL_PAGE_NEXT);
        {
            let mut pg = mtr.page_mut(hdr_slot);
            pg.write_u16(UNDO_STATE, UNDO_STATE_TO_FREE);
            pg.write_u16(page::FIL_PAGE_TYPE, page::PAGE_TYPE_ALLOCATED);
        }
        mtr.commit(pool)?;
        while next != FIL_NULL {
            let mut walk = Mtr::new();
            let s = walk.get_page(pool, PageId::new(SYSTEM_SPACE_ID, next), LatchMode::X)?;
            pages.push(next);
            let following = page::get_u32(walk.frame(s), page::FIL_PAGE_NEXT);
            {
                let mut pg = walk.page_mut(s);
                pg.write_u16(page::FIL_PAGE_TYPE, page::PAGE_TYPE_ALLOCATED);
            }
            walk.commit(pool)?;
            next = following;
        }
    }
    for p in pages {
        pool.spaces.free_page(PageId::new(SYSTEM_SPACE_ID, p))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tablespace::SpaceRegistry;
    use crate::wal::{LogSys, LOG_START_LSN};
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Arc<BufferPool>, Rseg) {
        let dir = tempdir().unwrap();
        let spaces = Arc::new(SpaceRegistry::new(dir.path()).unwrap());
        spaces.open_or_create_system_space().unwrap();
        let log = LogSys::open(dir.path().join("redo.log"), 1 << 24, LOG_START_LSN).unwrap();
        let pool = Arc::new(BufferPool::new(64, spaces, log));
        let rseg = rseg_create(&pool, 0).unwrap();
        (dir, pool, rseg)
    }

    fn sample_rec(trx_id: TrxId, undo_no: u64, kind: UndoKind) -> UndoRec {
        UndoRec {
            kind,
            trx_id,
            undo_no,
            index_id: 7,
            key: vec![undo_no.to_be_bytes().to_vec()],
            updated: vec![(1, b"old".to_vec())],
            old_trx_id: 0,
            old_roll_ptr: 0,
            old_delete_mark: false,
            ordering_old: Vec::new(),
        }
    }

    #[test]
    fn roll_ptr_round_trip() {
        let rp = roll_ptr_pack(true, 3, 0x0102_0304, 0xBEEF);
        assert!(roll_ptr_is_insert(rp));
        assert_eq!(roll_ptr_rseg(rp), 3);
        assert_eq!(roll_ptr_page(rp), 0x0102_0304);
        assert_eq!(roll_ptr_offset(rp), 0xBEEF);

        let rp2 = roll_ptr_pack(false, 0, 9, 100);
        assert!(!roll_ptr_is_insert(rp2));
    }

    #[test]
    fn append_and_read_back() {
        let (_dir, pool, rseg) = setup();
        let handle = undo_assign(&pool, &rseg, 10, UndoKind::UpdateExists).unwrap();
        let rec = sample_rec(10, 0, UndoKind::UpdateExists);
        let rp = undo_append(&pool, &rseg, &handle, &rec).unwrap();

        let back = undo_read(&pool, rp).unwrap();
        assert_eq!(back.trx_id, 10);
        assert_eq!(back.updated, vec![(1, b"old".to_vec())]);
    }

    #[test]
    fn log_grows_across_pages() {
        let (_dir, pool, rseg) = setup();
        let handle = undo_assign(&pool, &rseg, 11, UndoKind::UpdateExists).unwrap();
        let mut rps = Vec::new();
        for i in 0..200u64 {
            let mut rec = sample_rec(11, i, UndoKind::UpdateExists);
            rec.updated = vec![(1, vec![0u8; 300])];
            rps.push(undo_append(&pool, &rseg, &handle, &rec).unwrap());
        }
        // Records span more than one page.
        let first_page = roll_ptr_page(rps[0]);
        let last_page = roll_ptr_page(*rps.last().unwrap());
        assert_ne!(first_page, last_page);

        let all = undo_log_records(&pool, rseg.id, handle.hdr_page).unwrap();
        assert_eq!(all.len(), 200);
        assert_eq!(all[57].1.undo_no, 57);
    }

    #[test]
    fn commit_links_update_undo_into_history_in_trx_no_order() {
        let (_dir, pool, rseg) = setup();
        let h1 = undo_assign(&pool, &rseg, 20, UndoKind::UpdateExists).unwrap();
        undo_append(&pool, &rseg, &h1, &sample_rec(20, 0, UndoKind::UpdateExists)).unwrap();
        undo_finish_update_at_commit(&pool, &rseg, &h1, 100).unwrap();

        let h2 = undo_assign(&pool, &rseg, 21, UndoKind::UpdateExists).unwrap();
        undo_append(&pool, &rseg, &h2, &sample_rec(21, 0, UndoKind::UpdateExists)).unwrap();
        undo_finish_update_at_commit(&pool, &rseg, &h2, 101).unwrap();

        assert_eq!(rseg_history_len(&pool, &rseg).unwrap(), 2);
        let (tail, tail_no) = rseg_history_tail(&pool, &rseg).unwrap().unwrap();
        assert_eq!(tail, h1.hdr_page);
        assert_eq!(tail_no, 100);

        // Slots were released at commit.
        assert!(rseg_scan_slots(&pool, &rseg).unwrap().is_empty());
    }

    #[test]
    fn insert_undo_is_cached_and_reused() {
        let (_dir, pool, rseg) = setup();
        let h1 = undo_assign(&pool, &rseg, 30, UndoKind::Insert).unwrap();
        undo_append(&pool, &rseg, &h1, &sample_rec(30, 0, UndoKind::Insert)).unwrap();
        undo_finish_insert_at_commit(&pool, &rseg, &h1).unwrap();

        let h2 = undo_assign(&pool, &rseg, 31, UndoKind::Insert).unwrap();
        assert_eq!(h2.hdr_page, h1.hdr_page);
    }

    #[test]
    fn purge_unlinks_oldest_and_shrinks_history() {
        let (_dir, pool, rseg) = setup();
        for (trx, no) in [(40u64, 200u64), (41, 201)] {
            let h = undo_assign(&pool, &rseg, trx, UndoKind::UpdateExists).unwrap();
            undo_append(&pool, &rseg, &h, &sample_rec(trx, 0, UndoKind::UpdateExists)).unwrap();
            undo_finish_update_at_commit(&pool, &rseg, &h, no).unwrap();
        }
        let (tail, _) = rseg_history_tail(&pool, &rseg).unwrap().unwrap();
        undo_purge_oldest(&pool, &rseg, tail).unwrap();
        assert_eq!(rseg_history_len(&pool, &rseg).unwrap(), 1);
        let (tail2, no2) = rseg_history_tail(&pool, &rseg).unwrap().unwrap();
        assert_ne!(tail, tail2);
        assert_eq!(no2, 201);
    }
}
