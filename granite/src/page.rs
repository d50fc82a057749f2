//! Page layout and record manager.
//!
//! Every page carries a 38-byte file header, an 8-byte trailer and, for
//! index pages, a page header followed by the record heap and a directory of
//! owner slots growing backward from the trailer. Records are linked in key
//! order from the infimum pseudo-record to the supremum pseudo-record.
//!
//! Mutations that must be crash-safe go through [`PageMut`], which writes the
//! frame bytes and appends the matching redo record in one step.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::errors::{DbError, DbResult};
use crate::wal::RedoRecord;
use crate::{PageId, PAGE_SIZE};

// File header, at offset 0 of every page.
pub const FIL_PAGE_CHECKSUM: usize = 0;
pub const FIL_PAGE_NO: usize = 4;
pub const FIL_PAGE_PREV: usize = 8;
pub const FIL_PAGE_NEXT: usize = 12;
pub const FIL_PAGE_LSN: usize = 16;
pub const FIL_PAGE_TYPE: usize = 24;
pub const FIL_PAGE_FLUSH_LSN: usize = 26;
pub const FIL_PAGE_SPACE_ID: usize = 34;
pub const FIL_HDR_SIZE: usize = 38;

// Trailer: low 32 bits of the LSN mirrored from the header, plus a checksum
// copy. A mismatch between header LSN and trailer LSN marks a torn write.
pub const FIL_TRAILER_SIZE: usize = 8;
pub const FIL_TRAILER: usize = PAGE_SIZE - FIL_TRAILER_SIZE;

// Page types.
pub const PAGE_TYPE_ALLOCATED: u16 = 0;
pub const PAGE_TYPE_INDEX: u16 = 1;
pub const PAGE_TYPE_UNDO: u16 = 2;
pub const PAGE_TYPE_TRX_SYS: u16 = 3;
pub const PAGE_TYPE_FSP_HDR: u16 = 4;
pub const PAGE_TYPE_RSEG: u16 = 5;

// Index page header, after the file header.
pub const PAGE_N_DIR_SLOTS: usize = 38;
pub const PAGE_HEAP_TOP: usize = 40;
pub const PAGE_N_HEAP: usize = 42;
pub const PAGE_FREE: usize = 44;
pub const PAGE_GARBAGE: usize = 46;
pub const PAGE_N_RECS: usize = 48;
pub const PAGE_LAST_INSERT: usize = 50;
pub const PAGE_DIRECTION: usize = 52;
pub const PAGE_N_DIRECTION: usize = 54;
pub const PAGE_LEVEL: usize = 56;
pub const PAGE_INDEX_ID: usize = 58;
pub const PAGE_MAX_TRX_ID: usize = 66;
pub const PAGE_DATA: usize = 74;

// Record header: six bytes immediately preceding the record origin.
pub const REC_HDR_SIZE: usize = 6;
const REC_OFF_NEXT: usize = 6; // origin - 6, u16 absolute offset of next origin
const REC_OFF_HEAP_NO: usize = 4; // origin - 4, u16: heap_no << 3 | rec_type
const REC_OFF_N_OWNED: usize = 2; // origin - 2, u8
const REC_OFF_INFO: usize = 1; // origin - 1, u8

pub const REC_TYPE_ORDINARY: u8 = 0;
pub const REC_TYPE_NODE_PTR: u8 = 1;
pub const REC_TYPE_INFIMUM: u8 = 2;
pub const REC_TYPE_SUPREMUM: u8 = 3;

pub const REC_INFO_DELETE_MARK: u8 = 0x20;
pub const REC_INFO_MIN_REC: u8 = 0x10;

pub const HEAP_NO_INFIMUM: u16 = 0;
pub const HEAP_NO_SUPREMUM: u16 = 1;
pub const HEAP_NO_FIRST_USER: u16 = 2;

// Fixed pseudo-records.
pub const INFIMUM_OFFSET: u16 = (PAGE_DATA + REC_HDR_SIZE) as u16; // 80
const INFIMUM_BODY: &[u8; 8] = b"infimum\0";
pub const SUPREMUM_OFFSET: u16 = INFIMUM_OFFSET + 12 + REC_HDR_SIZE as u16; // 98
const SUPREMUM_BODY: &[u8; 8] = b"supremum";
pub const PAGE_EMPTY_HEAP_TOP: u16 = SUPREMUM_OFFSET + 12; // 110

// Directory slots: two bytes each, growing backward from the trailer.
pub const PAGE_DIR_SLOT_SIZE: usize = 2;
pub const PAGE_DIR_SLOT_MIN_N_OWNED: u8 = 4;
pub const PAGE_DIR_SLOT_MAX_N_OWNED: u8 = 8;

/// The 20-byte reference left in-page for an externally stored field:
/// `(space, page_no, offset, length, prev_page)`.
pub const EXTERN_FIELD_REF_SIZE: usize = 20;

/// A tuple of raw field values. Clustered-index leaf tuples carry the hidden
/// `trx_id` and `roll_ptr` fields right after the key fields.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tuple {
    pub fields: Vec<Vec<u8>>,
}

impl Tuple {
    pub fn new(fields: Vec<Vec<u8>>) -> Self {
        Self { fields }
    }

    pub fn from_slices(fields: &[&[u8]]) -> Self {
        Self {
            fields: fields.iter().map(|f| f.to_vec()).collect(),
        }
    }

    pub fn prefix(&self, n: usize) -> Tuple {
        Tuple {
            fields: self.fields[..n.min(self.fields.len())].to_vec(),
        }
    }

    /// Encoded record body size for this tuple.
    pub fn rec_body_size(&self) -> usize {
        2 + 2 * self.fields.len() + self.fields.iter().map(|f| f.len()).sum::<usize>()
    }

    pub fn rec_size(&self) -> usize {
        REC_HDR_SIZE + self.rec_body_size()
    }
}

/// Comparator over tuples. Compares up to `min(a.len, b.len)` fields; equal
/// prefixes compare equal, so a shorter search tuple acts as a prefix probe.
/// Supplied by the client on the index descriptor; the engine never inspects
/// column types.
pub type TupleCompare = fn(a: &[Vec<u8>], b: &[Vec<u8>]) -> Ordering;

/// Bytewise field comparison; fits any key encoded to sort bytewise
/// (e.g. big-endian integers).
pub fn default_tuple_compare(a: &[Vec<u8>], b: &[Vec<u8>]) -> Ordering {
    let n = a.len().min(b.len());
    for i in 0..n {
        match a[i].as_slice().cmp(b[i].as_slice()) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

// Raw big-endian accessors.

#[inline]
pub fn get_u8(frame: &[u8], off: usize) -> u8 {
    frame[off]
}

#[inline]
pub fn get_u16(frame: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([frame[off], frame[off + 1]])
}

#[inline]
pub fn get_u32(frame: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([frame[off], frame[off + 1], frame[off + 2], frame[off + 3]])
}

#[inline]
pub fn get_u64(frame: &[u8], off: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&frame[off..off + 8]);
    u64::from_be_bytes(buf)
}

#[inline]
pub fn put_u8(frame: &mut [u8], off: usize, v: u8) {
    frame[off] = v;
}

#[inline]
pub fn put_u16(frame: &mut [u8], off: usize, v: u16) {
    frame[off..off + 2].copy_from_slice(&v.to_be_bytes());
}

#[inline]
pub fn put_u32(frame: &mut [u8], off: usize, v: u32) {
    frame[off..off + 4].copy_from_slice(&v.to_be_bytes());
}

#[inline]
pub fn put_u64(frame: &mut [u8], off: usize, v: u64) {
    frame[off..off + 8].copy_from_slice(&v.to_be_bytes());
}

/// A mutable view of a page frame that mirrors every write into a redo sink.
/// Recovery and page bootstrap use `redo: None` and mutate silently.
pub struct PageMut<'a> {
    pub frame: &'a mut [u8],
    pub page_id: PageId,
    pub redo: Option<&'a mut Vec<RedoRecord>>,
}

impl<'a> PageMut<'a> {
    pub fn new(
        frame: &'a mut [u8],
        page_id: PageId,
        redo: Option<&'a mut Vec<RedoRecord>>,
    ) -> Self {
        debug_assert_eq!(frame.len(), PAGE_SIZE);
        Self { frame, page_id, redo }
    }

    pub fn write_u8(&mut self, off: usize, v: u8) {
        put_u8(self.frame, off, v);
        if let Some(redo) = self.redo.as_deref_mut() {
            redo.push(RedoRecord::Write1 {
                space: self.page_id.space,
                page_no: self.page_id.page_no,
                offset: off as u16,
                value: v,
            });
        }
    }

    pub fn write_u16(&mut self, off: usize, v: u16) {
        put_u16(self.frame, off, v);
        if let Some(redo) = self.redo.as_deref_mut() {
            redo.push(RedoRecord::Write2 {
                space: self.page_id.space,
                page_no: self.page_id.page_no,
                offset: off as u16,
                value: v,
            });
        }
    }

    pub fn write_u32(&mut self, off: usize, v: u32) {
        put_u32(self.frame, off, v);
        if let Some(redo) = self.redo.as_deref_mut() {
            redo.push(RedoRecord::Write4 {
                space: self.page_id.space,
                page_no: self.page_id.page_no,
                offset: off as u16,
                value: v,
            });
        }
    }

    pub fn write_u64(&mut self, off: usize, v: u64) {
        put_u64(self.frame, off, v);
        if let Some(redo) = self.redo.as_deref_mut() {
            redo.push(RedoRecord::Write8 {
                space: self.page_id.space,
                page_no: self.page_id.page_no,
                offset: off as u16,
                value: v,
            });
        }
    }

    pub fn write_bytes(&mut self, off: usize, bytes: &[u8]) {
        self.frame[off..off + bytes.len()].copy_from_slice(bytes);
        if let Some(redo) = self.redo.as_deref_mut() {
            redo.push(RedoRecord::WriteString {
                space: self.page_id.space,
                page_no: self.page_id.page_no,
                offset: off as u16,
                bytes: bytes.to_vec(),
            });
        }
    }
}

// Checksum and torn-write detection.

/// CRC32 over the page with the checksum fields and the mutable LSN mirror
/// zeroed out of the calculation.
pub fn page_checksum_compute(frame: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&frame[FIL_PAGE_NO..FIL_TRAILER]);
    hasher.finalize()
}

/// Stamps checksum and trailer mirror. Called just before a page goes to
/// disk; the frame must already carry its final LSN.
pub fn page_stamp_for_write(frame: &mut [u8]) {
    let lsn = get_u64(frame, FIL_PAGE_LSN);
    put_u32(frame, FIL_TRAILER, (lsn & 0xFFFF_FFFF) as u32);
    let checksum = page_checksum_compute(frame);
    put_u32(frame, FIL_PAGE_CHECKSUM, checksum);
    put_u32(frame, FIL_TRAILER + 4, checksum);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageCheck {
    Ok,
    /// Header LSN and trailer LSN disagree: the write tore.
    Torn,
    BadChecksum,
    /// All-zero page, never written.
    Fresh,
}

pub fn page_verify(frame: &[u8]) -> PageCheck {
    if frame.iter().all(|b| *b == 0) {
        return PageCheck::Fresh;
    }
    let hdr_lsn = get_u64(frame, FIL_PAGE_LSN);
    let trailer_lsn_low = get_u32(frame, FIL_TRAILER);
    if (hdr_lsn & 0xFFFF_FFFF) as u32 != trailer_lsn_low {
        return PageCheck::Torn;
    }
    let stored = get_u32(frame, FIL_PAGE_CHECKSUM);
    if stored != page_checksum_compute(frame) {
        return PageCheck::BadChecksum;
    }
    PageCheck::Ok
}

/// Stamps the modification LSN into the header and the trailer mirror.
/// Not redo-logged: recovery stamps the LSN itself when applying.
pub fn page_set_lsn(frame: &mut [u8], lsn: u64) {
    put_u64(frame, FIL_PAGE_LSN, lsn);
    put_u32(frame, FIL_TRAILER, (lsn & 0xFFFF_FFFF) as u32);
}

pub fn page_lsn(frame: &[u8]) -> u64 {
    get_u64(frame, FIL_PAGE_LSN)
}

pub fn page_type(frame: &[u8]) -> u16 {
    get_u16(frame, FIL_PAGE_TYPE)
}

pub fn page_prev(frame: &[u8]) -> u32 {
    get_u32(frame, FIL_PAGE_PREV)
}

pub fn page_next(frame: &[u8]) -> u32 {
    get_u32(frame, FIL_PAGE_NEXT)
}

pub fn page_level(frame: &[u8]) -> u16 {
    get_u16(frame, PAGE_LEVEL)
}

pub fn page_index_id(frame: &[u8]) -> u64 {
    get_u64(frame, PAGE_INDEX_ID)
}

pub fn page_n_recs(frame: &[u8]) -> u16 {
    get_u16(frame, PAGE_N_RECS)
}

pub fn page_n_heap(frame: &[u8]) -> u16 {
    get_u16(frame, PAGE_N_HEAP)
}

/// Initializes the bare file header of a freshly allocated page.
pub fn fil_page_init(pg: &mut PageMut<'_>, page_type: u16) {
    let page_id = pg.page_id;
    pg.write_u32(FIL_PAGE_NO, page_id.page_no);
    pg.write_u32(FIL_PAGE_PREV, crate::FIL_NULL);
    pg.write_u32(FIL_PAGE_NEXT, crate::FIL_NULL);
    pg.write_u16(FIL_PAGE_TYPE, page_type);
    pg.write_u32(FIL_PAGE_SPACE_ID, page_id.space);
}

/// Creates an empty index page: header, infimum/supremum, two directory
/// slots. Logged as a single typed redo record plus the header writes.
pub fn page_create(pg: &mut PageMut<'_>, index_id: u64, level: u16) {
    if let Some(redo) = pg.redo.as_deref_mut() {
        redo.push(RedoRecord::PageCreate {
            space: pg.page_id.space,
            page_no: pg.page_id.page_no,
            index_id,
            level,
        });
    }
    // The creation record replays this whole routine, so the byte writes
    // below are intentionally unlogged.
    let page_id = pg.page_id;
    page_create_raw(pg.frame, page_id, index_id, level);
}

/// Raw (unlogged) form of [`page_create`]; also used by redo apply.
pub fn page_create_raw(frame: &mut [u8], page_id: PageId, index_id: u64, level: u16) {
    frame[..FIL_TRAILER].fill(0);
    put_u32(frame, FIL_PAGE_NO, page_id.page_no);
    put_u32(frame, FIL_PAGE_PREV, crate::FIL_NULL);
    put_u32(frame, FIL_PAGE_NEXT, crate::FIL_NULL);
    put_u16(frame, FIL_PAGE_TYPE, PAGE_TYPE_INDEX);
    put_u32(frame, FIL_PAGE_SPACE_ID, page_id.space);

    put_u16(frame, PAGE_N_DIR_SLOTS, 2);
    put_u16(frame, PAGE_HEAP_TOP, PAGE_EMPTY_HEAP_TOP);
    put_u16(frame, PAGE_N_HEAP, HEAP_NO_FIRST_USER);
    put_u16(frame, PAGE_FREE, 0);
    put_u16(frame, PAGE_GARBAGE, 0);
    put_u16(frame, PAGE_N_RECS, 0);
    put_u16(frame, PAGE_LAST_INSERT, 0);
    put_u16(frame, PAGE_DIRECTION, 0);
    put_u16(frame, PAGE_N_DIRECTION, 0);
    put_u16(frame, PAGE_LEVEL, level);
    put_u64(frame, PAGE_INDEX_ID, index_id);
    put_u64(frame, PAGE_MAX_TRX_ID, 0);

    // Infimum.
    let inf = INFIMUM_OFFSET as usize;
    put_u16(frame, inf - REC_OFF_NEXT, SUPREMUM_OFFSET);
    put_u16(
        frame,
        inf - REC_OFF_HEAP_NO,
        (HEAP_NO_INFIMUM << 3) | REC_TYPE_INFIMUM as u16,
    );
    put_u8(frame, inf - REC_OFF_N_OWNED, 1);
    put_u8(frame, inf - REC_OFF_INFO, 0);
    put_u16(frame, inf, 1); // n_fields
    put_u16(frame, inf + 2, 8);
    frame[inf + 4..inf + 12].copy_from_slice(INFIMUM_BODY);

    // Supremum.
    let sup = SUPREMUM_OFFSET as usize;
    put_u16(frame, sup - REC_OFF_NEXT, 0);
    put_u16(
        frame,
        sup - REC_OFF_HEAP_NO,
        (HEAP_NO_SUPREMUM << 3) | REC_TYPE_SUPREMUM as u16,
    );
    put_u8(frame, sup - REC_OFF_N_OWNED, 1);
    put_u8(frame, sup - REC_OFF_INFO, 0);
    put_u16(frame, sup, 1);
    put_u16(frame, sup + 2, 8);
    frame[sup + 4..sup + 12].copy_from_slice(SUPREMUM_BODY);

    // Directory: slot 0 owns the infimum, slot 1 the supremum.
    dir_set_slot(frame, 0, INFIMUM_OFFSET);
    dir_set_slot(frame, 1, SUPREMUM_OFFSET);
}

// Record accessors. `rec` is the record origin offset within the frame.

pub fn rec_next(frame: &[u8], rec: u16) -> u16 {
    get_u16(frame, rec as usize - REC_OFF_NEXT)
}

fn rec_set_next_raw(frame: &mut [u8], rec: u16, next: u16) {
    put_u16(frame, rec as usize - REC_OFF_NEXT, next);
}

pub fn rec_heap_no(frame: &[u8], rec: u16) -> u16 {
    get_u16(frame, rec as usize - REC_OFF_HEAP_NO) >> 3
}

pub fn rec_type(frame: &[u8], rec: u16) -> u8 {
    (get_u16(frame, rec as usize - REC_OFF_HEAP_NO) & 0x7) as u8
}

pub fn rec_n_owned(frame: &[u8], rec: u16) -> u8 {
    get_u8(frame, rec as usize - REC_OFF_N_OWNED)
}

pub fn rec_info_bits(frame: &[u8], rec: u16) -> u8 {
    get_u8(frame, rec as usize - REC_OFF_INFO)
}

pub fn rec_is_delete_marked(frame: &[u8], rec: u16) -> bool {
    rec_info_bits(frame, rec) & REC_INFO_DELETE_MARK != 0
}

pub fn rec_is_user_rec(frame: &[u8], rec: u16) -> bool {
    matches!(rec_type(frame, rec), REC_TYPE_ORDINARY | REC_TYPE_NODE_PTR)
}

pub fn rec_n_fields(frame: &[u8], rec: u16) -> u16 {
    get_u16(frame, rec as usize)
}

pub fn rec_field(frame: &[u8], rec: u16, i: usize) -> &[u8] {
    let origin = rec as usize;
    let n_fields = get_u16(frame, origin) as usize;
    debug_assert!(i < n_fields);
    let mut data_off = origin + 2 + 2 * n_fields;
    for f in 0..i {
        data_off += get_u16(frame, origin + 2 + 2 * f) as usize;
    }
    let len = get_u16(frame, origin + 2 + 2 * i) as usize;
    &frame[data_off..data_off + len]
}

/// Copies a record's fields out as a tuple.
pub fn rec_to_tuple(frame: &[u8], rec: u16) -> Tuple {
    let n = rec_n_fields(frame, rec) as usize;
    let mut fields = Vec::with_capacity(n);
    for i in 0..n {
        fields.push(rec_field(frame, rec, i).to_vec());
    }
    Tuple { fields }
}

/// Total record size: header plus encoded body.
pub fn rec_size(frame: &[u8], rec: u16) -> usize {
    let origin = rec as usize;
    let n_fields = get_u16(frame, origin) as usize;
    let mut size = REC_HDR_SIZE + 2 + 2 * n_fields;
    for f in 0..n_fields {
        size += get_u16(frame, origin + 2 + 2 * f) as usize;
    }
    size
}

fn rec_set_info_bits(pg: &mut PageMut<'_>, rec: u16, bits: u8) {
    pg.write_u8(rec as usize - REC_OFF_INFO, bits);
}

pub fn rec_set_delete_mark(pg: &mut PageMut<'_>, rec: u16, mark: bool) {
    let bits = rec_info_bits(pg.frame, rec);
    let bits = if mark {
        bits | REC_INFO_DELETE_MARK
    } else {
        bits & !REC_INFO_DELETE_MARK
    };
    rec_set_info_bits(pg, rec, bits);
}

/// Overwrites field `i` in place. The new value must have the stored length.
pub fn rec_set_field_in_place(pg: &mut PageMut<'_>, rec: u16, i: usize, value: &[u8]) {
    let origin = rec as usize;
    let n_fields = get_u16(pg.frame, origin) as usize;
    debug_assert!(i < n_fields);
    let mut data_off = origin + 2 + 2 * n_fields;
    for f in 0..i {
        data_off += get_u16(pg.frame, origin + 2 + 2 * f) as usize;
    }
    let len = get_u16(pg.frame, origin + 2 + 2 * i) as usize;
    assert_eq!(len, value.len(), "in-place update requires equal length");
    pg.write_bytes(data_off, value);
}

/// Compares a record's leading fields against a search tuple.
/// Infimum sorts below and supremum above every key.
pub fn rec_cmp_with_tuple(
    frame: &[u8],
    rec: u16,
    key: &Tuple,
    cmp: TupleCompare,
    n_compare: usize,
) -> Ordering {
    match rec_type(frame, rec) {
        REC_TYPE_INFIMUM => Ordering::Less,
        REC_TYPE_SUPREMUM => Ordering::Greater,
        _ => {
            let n = n_compare
                .min(rec_n_fields(frame, rec) as usize)
                .min(key.fields.len());
            let mut rec_fields = Vec::with_capacity(n);
            for i in 0..n {
                rec_fields.push(rec_field(frame, rec, i).to_vec());
            }
            cmp(&rec_fields, &key.fields[..n])
        }
    }
}

// Directory management.

fn dir_slot_addr(i: usize) -> usize {
    FIL_TRAILER - PAGE_DIR_SLOT_SIZE * (i + 1)
}

pub fn dir_n_slots(frame: &[u8]) -> usize {
    get_u16(frame, PAGE_N_DIR_SLOTS) as usize
}

pub fn dir_slot(frame: &[u8], i: usize) -> u16 {
    get_u16(frame, dir_slot_addr(i))
}

fn dir_set_slot(frame: &mut [u8], i: usize, rec: u16) {
    put_u16(frame, dir_slot_addr(i), rec);
}

fn dir_set_slot_logged(pg: &mut PageMut<'_>, i: usize, rec: u16) {
    pg.write_u16(dir_slot_addr(i), rec);
}

/// Offset of the low end of the directory area; the heap may not grow past
/// this point (keeping room for one more slot).
fn dir_low_water(frame: &[u8]) -> usize {
    dir_slot_addr(dir_n_slots(frame)) // address one slot below the last
}

/// Finds the directory slot index owning `rec` (the slot whose owner record
/// is at or after `rec` in list order).
fn dir_slot_of_rec(frame: &[u8], rec: u16) -> usize {
    let n_slots = dir_n_slots(frame);
    // Walk forward from `rec` to its owner, then match the owner to a slot.
    let mut owner = rec;
    while rec_n_owned(frame, owner) == 0 {
        owner = rec_next(frame, owner);
    }
    for i in 0..n_slots {
        if dir_slot(frame, i) == owner {
            return i;
        }
    }
    unreachable!("record owner not present in the page directory");
}

/// The record preceding `rec` in list order.
pub fn page_rec_prev(frame: &[u8], rec: u16) -> u16 {
    debug_assert_ne!(rec, INFIMUM_OFFSET);
    let slot = dir_slot_of_rec(frame, rec);
    // Start from the owner of the previous group (or the infimum) and walk.
    let start = if slot == 0 {
        INFIMUM_OFFSET
    } else {
        dir_slot(frame, slot - 1)
    };
    let mut prev = start;
    let mut cur = rec_next(frame, start);
    while cur != rec {
        debug_assert_ne!(cur, 0, "record not reachable in list order");
        prev = cur;
        cur = rec_next(frame, cur);
    }
    prev
}

// Page cursor search.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Greatest record strictly less than the key.
    L,
    /// Greatest record less than or equal to the key.
    LE,
    /// Smallest record strictly greater than the key.
    G,
    /// Smallest record greater than or equal to the key.
    GE,
}

/// Binary search over the directory, then a linear walk within the owned
/// group. For L/LE the result may be the infimum; for G/GE the supremum.
pub fn page_cur_search(
    frame: &[u8],
    key: &Tuple,
    cmp: TupleCompare,
    n_compare: usize,
    mode: SearchMode,
) -> u16 {
    let n_slots = dir_n_slots(frame);
    debug_assert!(n_slots >= 2);

    // Greatest slot whose owner sorts strictly below the key.
    let mut low = 0usize;
    let mut up = n_slots - 1;
    while up - low > 1 {
        let mid = (low + up) / 2;
        let owner = dir_slot(frame, mid);
        if rec_cmp_with_tuple(frame, owner, key, cmp, n_compare) == Ordering::Less {
            low = mid;
        } else {
            up = mid;
        }
    }

    let mut rec = dir_slot(frame, low);
    loop {
        let next = rec_next(frame, rec);
        if next == 0 {
            break; // rec is the supremum
        }
        let next_cmp = rec_cmp_with_tuple(frame, next, key, cmp, n_compare);
        let advance = match mode {
            SearchMode::L => next_cmp == Ordering::Less,
            SearchMode::LE => next_cmp != Ordering::Greater,
            SearchMode::G => next_cmp != Ordering::Greater,
            SearchMode::GE => next_cmp == Ordering::Less,
        };
        if !advance {
            break;
        }
        rec = next;
    }

    match mode {
        SearchMode::L | SearchMode::LE => rec,
        SearchMode::G | SearchMode::GE => rec_next(frame, rec),
    }
}

// Insertion.

fn encode_rec_body(out: &mut Vec<u8>, tuple: &Tuple) {
    out.extend_from_slice(&(tuple.fields.len() as u16).to_be_bytes());
    for f in &tuple.fields {
        out.extend_from_slice(&(f.len() as u16).to_be_bytes());
    }
    for f in &tuple.fields {
        out.extend_from_slice(f);
    }
}

/// Free space available on an empty page.
pub fn page_free_space_of_empty() -> usize {
    FIL_TRAILER - 2 * PAGE_DIR_SLOT_SIZE - PAGE_EMPTY_HEAP_TOP as usize
}

/// Records larger than this must store their oversize fields externally,
/// leaving a 20-byte reference in-page.
pub fn page_max_rec_size() -> usize {
    page_free_space_of_empty() / 2
}

/// Space currently available for one more record of `size` bytes, counting
/// a potential new directory slot.
fn page_has_room(frame: &[u8], size: usize) -> bool {
    let heap_top = get_u16(frame, PAGE_HEAP_TOP) as usize;
    heap_top + size + PAGE_DIR_SLOT_SIZE <= dir_low_water(frame)
}

/// Tries to take a record of at least `size` bytes off the free list.
/// Returns the reusable origin, its heap number and the freed size.
fn free_list_take(frame: &[u8], size: usize) -> Option<(u16, u16, usize)> {
    let mut cur = get_u16(frame, PAGE_FREE);
    while cur != 0 {
        let cur_size = rec_size(frame, cur);
        if cur_size >= size {
            return Some((cur, rec_heap_no(frame, cur), cur_size));
        }
        cur = rec_next(frame, cur);
    }
    None
}

fn free_list_unlink(pg: &mut PageMut<'_>, rec: u16) {
    let mut prev: Option<u16> = None;
    let mut cur = get_u16(pg.frame, PAGE_FREE);
    while cur != 0 {
        if cur == rec {
            let next = rec_next(pg.frame, cur);
            match prev {
                None => pg.write_u16(PAGE_FREE, next),
                Some(p) => pg.write_u16(p as usize - REC_OFF_NEXT, next),
            }
            return;
        }
        prev = Some(cur);
        cur = rec_next(pg.frame, cur);
    }
    unreachable!("record not on the free list");
}

/// Inserts a record after the cursor record. Returns the new record's origin
/// offset, or `None` if the page is full (the caller reorganizes or splits).
pub fn page_cur_insert(
    pg: &mut PageMut<'_>,
    cursor_rec: u16,
    tuple: &Tuple,
    rec_type: u8,
    info_bits: u8,
) -> DbResult<Option<u16>> {
    let body_size = tuple.rec_body_size();
    let rec_total = REC_HDR_SIZE + body_size;
    if rec_total > page_max_rec_size() {
        return Err(DbError::RecordTooBig {
            size: rec_total,
            max: page_max_rec_size(),
        });
    }

    // Allocate from the free list or the heap top.
    let (origin, heap_no) = if let Some((reuse, old_heap_no, freed_size)) =
        free_list_take(pg.frame, rec_total)
    {
        free_list_unlink(pg, reuse);
        let garbage = get_u16(pg.frame, PAGE_GARBAGE);
        pg.write_u16(PAGE_GARBAGE, garbage - freed_size as u16);
        (reuse, old_heap_no)
    } else {
        if !page_has_room(pg.frame, rec_total) {
            return Ok(None);
        }
        let heap_top = get_u16(pg.frame, PAGE_HEAP_TOP);
        let origin = heap_top + REC_HDR_SIZE as u16;
        pg.write_u16(PAGE_HEAP_TOP, heap_top + rec_total as u16);
        let n_heap = get_u16(pg.frame, PAGE_N_HEAP);
        pg.write_u16(PAGE_N_HEAP, n_heap + 1);
        (origin, n_heap)
    };

    // Body.
    let mut body = Vec::with_capacity(body_size);
    encode_rec_body(&mut body, tuple);
    pg.write_bytes(origin as usize, &body);

    // Header: link after the cursor.
    let next = rec_next(pg.frame, cursor_rec);
    let mut hdr = [0u8; REC_HDR_SIZE];
    hdr[0..2].copy_from_slice(&next.to_be_bytes());
    hdr[2..4].copy_from_slice(&((heap_no << 3) | rec_type as u16).to_be_bytes());
    hdr[4] = 0; // n_owned
    hdr[5] = info_bits;
    pg.write_bytes(origin as usize - REC_HDR_SIZE, &hdr);
    pg.write_u16(cursor_rec as usize - REC_OFF_NEXT, origin);

    // Bookkeeping.
    let n_recs = get_u16(pg.frame, PAGE_N_RECS);
    pg.write_u16(PAGE_N_RECS, n_recs + 1);
    let last_insert = get_u16(pg.frame, PAGE_LAST_INSERT);
    if last_insert == cursor_rec && cursor_rec != INFIMUM_OFFSET {
        let n_dir = get_u16(pg.frame, PAGE_N_DIRECTION);
        pg.write_u16(PAGE_DIRECTION, 2); // right
        pg.write_u16(PAGE_N_DIRECTION, n_dir + 1);
    } else {
        pg.write_u16(PAGE_DIRECTION, 0);
        pg.write_u16(PAGE_N_DIRECTION, 0);
    }
    pg.write_u16(PAGE_LAST_INSERT, origin);

    // Ownership: the new record joins the group of the next owner.
    let mut owner = origin;
    while rec_n_owned(pg.frame, owner) == 0 {
        owner = rec_next(pg.frame, owner);
    }
    let owned = rec_n_owned(pg.frame, owner) + 1;
    pg.write_u8(owner as usize - REC_OFF_N_OWNED, owned);
    if owned > PAGE_DIR_SLOT_MAX_N_OWNED {
        dir_split_slot(pg, dir_slot_of_rec(pg.frame, owner));
    }

    Ok(Some(origin))
}

/// Splits an over-full owner group in two, inserting a new directory slot.
fn dir_split_slot(pg: &mut PageMut<'_>, slot_idx: usize) {
    let owner = dir_slot(pg.frame, slot_idx);
    let owned = rec_n_owned(pg.frame, owner);
    let first_half = owned / 2;

    // Find the start of the group, then its middle record.
    let start = if slot_idx == 0 {
        unreachable!("infimum group never splits")
    } else {
        rec_next(pg.frame, dir_slot(pg.frame, slot_idx - 1))
    };
    let mut mid = start;
    for _ in 1..first_half {
        mid = rec_next(pg.frame, mid);
    }

    pg.write_u8(mid as usize - REC_OFF_N_OWNED, first_half);
    pg.write_u8(owner as usize - REC_OFF_N_OWNED, owned - first_half);

    // Shift slots >= slot_idx one position outward and insert the new slot.
    let n_slots = dir_n_slots(pg.frame);
    let mut slots: Vec<u16> = (0..n_slots).map(|i| dir_slot(pg.frame, i)).collect();
    slots.insert(slot_idx, mid);
    pg.write_u16(PAGE_N_DIR_SLOTS, (n_slots + 1) as u16);
    write_dir_slots(pg, &slots);
}

fn write_dir_slots(pg: &mut PageMut<'_>, slots: &[u16]) {
    let mut area = Vec::with_capacity(slots.len() * PAGE_DIR_SLOT_SIZE);
    // Slot i lives at FIL_TRAILER - 2*(i+1): the byte image runs from the
    // highest slot index upward in memory.
    for i in (0..slots.len()).rev() {
        area.extend_from_slice(&slots[i].to_be_bytes());
    }
    let base = FIL_TRAILER - PAGE_DIR_SLOT_SIZE * slots.len();
    pg.write_bytes(base, &area);
}

/// Deletes the record at `rec`: unlinks it, returns its space to the free
/// list and rebalances the directory.
pub fn page_cur_delete(pg: &mut PageMut<'_>, rec: u16) {
    debug_assert!(rec_is_user_rec(pg.frame, rec));
    let prev = page_rec_prev(pg.frame, rec);
    let next = rec_next(pg.frame, rec);
    let slot_idx = dir_slot_of_rec(pg.frame, rec);
    let owner = dir_slot(pg.frame, slot_idx);

    // Ownership bookkeeping before the unlink.
    let mut balance_rec = owner;
    let mut removed_slot = false;
    if owner == rec {
        let owned = rec_n_owned(pg.frame, rec);
        pg.write_u8(rec as usize - REC_OFF_N_OWNED, 0);
        if owned == 1 {
            // Sole member of its group: the slot disappears with it.
            dir_remove_slot(pg, slot_idx);
            removed_slot = true;
        } else {
            // The group owner moves to the preceding record; owned >= 2
            // guarantees it is inside the same group.
            pg.write_u8(prev as usize - REC_OFF_N_OWNED, owned - 1);
            dir_set_slot_logged(pg, slot_idx, prev);
            balance_rec = prev;
        }
    } else {
        let owned = rec_n_owned(pg.frame, owner);
        pg.write_u8(owner as usize - REC_OFF_N_OWNED, owned - 1);
    }

    // Unlink and push onto the free list.
    pg.write_u16(prev as usize - REC_OFF_NEXT, next);
    let free_head = get_u16(pg.frame, PAGE_FREE);
    pg.write_u16(rec as usize - REC_OFF_NEXT, free_head);
    pg.write_u16(PAGE_FREE, rec);

    let freed = rec_size(pg.frame, rec) as u16;
    let garbage = get_u16(pg.frame, PAGE_GARBAGE);
    pg.write_u16(PAGE_GARBAGE, garbage + freed);
    let n_recs = get_u16(pg.frame, PAGE_N_RECS);
    pg.write_u16(PAGE_N_RECS, n_recs - 1);
    pg.write_u16(PAGE_LAST_INSERT, 0);

    if !removed_slot {
        dir_balance_slot(pg, dir_slot_of_rec(pg.frame, balance_rec));
    }
}

/// Rebalances a group that dropped below the minimum owned count.
fn dir_balance_slot(pg: &mut PageMut<'_>, slot_idx: usize) {
    if slot_idx == 0 {
        return; // the infimum always owns exactly itself
    }
    let owner = dir_slot(pg.frame, slot_idx);
    let owned = rec_n_owned(pg.frame, owner);
    if owned >= PAGE_DIR_SLOT_MIN_N_OWNED {
        return;
    }
    let n_slots = dir_n_slots(pg.frame);

    // Merge with the previous group when it is a user group and fits.
    if slot_idx > 1 {
        let prev_owner = dir_slot(pg.frame, slot_idx - 1);
        let prev_owned = rec_n_owned(pg.frame, prev_owner);
        if prev_owned + owned <= PAGE_DIR_SLOT_MAX_N_OWNED {
            pg.write_u8(prev_owner as usize - REC_OFF_N_OWNED, 0);
            pg.write_u8(owner as usize - REC_OFF_N_OWNED, prev_owned + owned);
            dir_remove_slot(pg, slot_idx - 1);
            return;
        }
        // Borrow the previous group's owner record into this group.
        let before_prev_owner = page_rec_prev(pg.frame, prev_owner);
        pg.write_u8(prev_owner as usize - REC_OFF_N_OWNED, 0);
        pg.write_u8(
            before_prev_owner as usize - REC_OFF_N_OWNED,
            prev_owned - 1,
        );
        pg.write_u8(owner as usize - REC_OFF_N_OWNED, owned + 1);
        dir_set_slot_logged(pg, slot_idx - 1, before_prev_owner);
        return;
    }

    // First user group: merge into the following group when possible.
    if slot_idx + 1 < n_slots {
        let next_owner = dir_slot(pg.frame, slot_idx + 1);
        let next_owned = rec_n_owned(pg.frame, next_owner);
        if next_owned + owned <= PAGE_DIR_SLOT_MAX_N_OWNED {
            pg.write_u8(owner as usize - REC_OFF_N_OWNED, 0);
            pg.write_u8(next_owner as usize - REC_OFF_N_OWNED, next_owned + owned);
            dir_remove_slot(pg, slot_idx);
        }
        // Otherwise leave the small leading group; it refills on insert.
    }
}

fn dir_remove_slot(pg: &mut PageMut<'_>, slot_idx: usize) {
    let n_slots = dir_n_slots(pg.frame);
    let mut slots: Vec<u16> = (0..n_slots).map(|i| dir_slot(pg.frame, i)).collect();
    slots.remove(slot_idx);
    pg.write_u16(PAGE_N_DIR_SLOTS, (n_slots - 1) as u16);
    write_dir_slots(pg, &slots);
}

/// Rebuilds the page without garbage, preserving record order. Returns the
/// mapping from old to new heap numbers so record locks can migrate.
/// Logged as a full page image.
pub fn page_reorganize(pg: &mut PageMut<'_>) -> Vec<(u16, u16)> {
    let page_id = pg.page_id;
    let index_id = page_index_id(pg.frame);
    let level = page_level(pg.frame);
    let prev = page_prev(pg.frame);
    let next = page_next(pg.frame);
    let lsn = page_lsn(pg.frame);
    let max_trx_id = get_u64(pg.frame, PAGE_MAX_TRX_ID);

    // Collect records in list order.
    let mut recs = Vec::new();
    let mut rec = rec_next(pg.frame, INFIMUM_OFFSET);
    while rec != SUPREMUM_OFFSET {
        recs.push((
            rec_heap_no(pg.frame, rec),
            rec_to_tuple(pg.frame, rec),
            rec_type(pg.frame, rec),
            rec_info_bits(pg.frame, rec),
        ));
        rec = rec_next(pg.frame, rec);
    }

    let mut fresh = vec![0u8; PAGE_SIZE];
    page_create_raw(&mut fresh, page_id, index_id, level);
    put_u32(&mut fresh, FIL_PAGE_PREV, prev);
    put_u32(&mut fresh, FIL_PAGE_NEXT, next);
    put_u64(&mut fresh, FIL_PAGE_LSN, lsn);
    put_u64(&mut fresh, PAGE_MAX_TRX_ID, max_trx_id);

    let mut mapping = Vec::with_capacity(recs.len());
    {
        let mut fresh_pg = PageMut::new(&mut fresh, page_id, None);
        let mut cursor = INFIMUM_OFFSET;
        for (old_heap, tuple, rtype, info) in &recs {
            let new_rec = page_cur_insert(&mut fresh_pg, cursor, tuple, *rtype, *info)
                .expect("tuple fit before reorganize")
                .expect("rebuilt page cannot be fuller than the original");
            mapping.push((*old_heap, rec_heap_no(fresh_pg.frame, new_rec)));
            cursor = new_rec;
        }
    }

    pg.write_bytes(0, &fresh[..FIL_TRAILER]);
    mapping
}

/// Iterates user records in key order.
pub fn page_user_recs(frame: &[u8]) -> Vec<u16> {
    let mut out = Vec::new();
    let mut rec = rec_next(frame, INFIMUM_OFFSET);
    while rec != SUPREMUM_OFFSET && rec != 0 {
        out.push(rec);
        rec = rec_next(frame, rec);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tuple(key: u64, val: &[u8]) -> Tuple {
        Tuple::new(vec![key.to_be_bytes().to_vec(), val.to_vec()])
    }

    fn fresh_page() -> Vec<u8> {
        let mut frame = vec![0u8; PAGE_SIZE];
        page_create_raw(&mut frame, PageId::new(1, 3), 42, 0);
        frame
    }

    fn insert_key(frame: &mut [u8], key: u64) -> u16 {
        let tuple = make_tuple(key, b"v");
        let cursor = page_cur_search(
            frame,
            &tuple.prefix(1),
            default_tuple_compare,
            1,
            SearchMode::LE,
        );
        let mut pg = PageMut::new(frame, PageId::new(1, 3), None);
        page_cur_insert(&mut pg, cursor, &tuple, REC_TYPE_ORDINARY, 0)
            .unwrap()
            .expect("page has room")
    }

    #[test]
    fn create_leaves_empty_page_with_two_slots() {
        let frame = fresh_page();
        assert_eq!(dir_n_slots(&frame), 2);
        assert_eq!(dir_slot(&frame, 0), INFIMUM_OFFSET);
        assert_eq!(dir_slot(&frame, 1), SUPREMUM_OFFSET);
        assert_eq!(rec_next(&frame, INFIMUM_OFFSET), SUPREMUM_OFFSET);
        assert_eq!(page_n_recs(&frame), 0);
        assert_eq!(page_index_id(&frame), 42);
    }

    #[test]
    fn inserts_stay_in_key_order_regardless_of_arrival_order() {
        let mut frame = fresh_page();
        for key in [50u64, 10, 30, 20, 40, 25] {
            insert_key(&mut frame, key);
        }
        let keys: Vec<u64> = page_user_recs(&frame)
            .into_iter()
            .map(|rec| {
                let f = rec_field(&frame, rec, 0);
                u64::from_be_bytes(f.try_into().unwrap())
            })
            .collect();
        assert_eq!(keys, vec![10, 20, 25, 30, 40, 50]);
        assert_eq!(page_n_recs(&frame), 6);
    }

    #[test]
    fn search_modes_resolve_ties_correctly() {
        let mut frame = fresh_page();
        for key in [10u64, 20, 30] {
            insert_key(&mut frame, key);
        }
        let key20 = Tuple::new(vec![20u64.to_be_bytes().to_vec()]);

        let le = page_cur_search(&frame, &key20, default_tuple_compare, 1, SearchMode::LE);
        assert_eq!(rec_field(&frame, le, 0), 20u64.to_be_bytes());

        let l = page_cur_search(&frame, &key20, default_tuple_compare, 1, SearchMode::L);
        assert_eq!(rec_field(&frame, l, 0), 10u64.to_be_bytes());

        let ge = page_cur_search(&frame, &key20, default_tuple_compare, 1, SearchMode::GE);
        assert_eq!(rec_field(&frame, ge, 0), 20u64.to_be_bytes());

        let g = page_cur_search(&frame, &key20, default_tuple_compare, 1, SearchMode::G);
        assert_eq!(rec_field(&frame, g, 0), 30u64.to_be_bytes());
    }

    #[test]
    fn search_misses_land_on_pseudo_records() {
        let mut frame = fresh_page();
        insert_key(&mut frame, 10);
        let low = Tuple::new(vec![5u64.to_be_bytes().to_vec()]);
        let high = Tuple::new(vec![99u64.to_be_bytes().to_vec()]);

        let le = page_cur_search(&frame, &low, default_tuple_compare, 1, SearchMode::LE);
        assert_eq!(le, INFIMUM_OFFSET);
        let ge = page_cur_search(&frame, &high, default_tuple_compare, 1, SearchMode::GE);
        assert_eq!(ge, SUPREMUM_OFFSET);
    }

    #[test]
    fn delete_unlinks_and_reuses_space() {
        let mut frame = fresh_page();
        for key in 1u64..=8 {
            insert_key(&mut frame, key);
        }
        let target = Tuple::new(vec![4u64.to_be_bytes().to_vec()]);
        let rec = page_cur_search(&frame, &target, default_tuple_compare, 1, SearchMode::GE);
        let heap_before = page_n_heap(&frame);
        {
            let mut pg = PageMut::new(&mut frame, PageId::new(1, 3), None);
            page_cur_delete(&mut pg, rec);
        }
        assert_eq!(page_n_recs(&frame), 7);
        assert!(get_u16(&frame, PAGE_GARBAGE) > 0);

        // The freed slot is reused by the next insert of equal size.
        insert_key(&mut frame, 100);
        assert_eq!(get_u16(&frame, PAGE_GARBAGE), 0);
        assert_eq!(page_n_heap(&frame), heap_before);
    }

    #[test]
    fn directory_invariants_hold_across_many_inserts() {
        let mut frame = fresh_page();
        for key in 0u64..200 {
            insert_key(&mut frame, key * 7919 % 200);
        }
        let n_slots = dir_n_slots(&frame);
        assert_eq!(rec_n_owned(&frame, dir_slot(&frame, 0)), 1);
        assert_eq!(dir_slot(&frame, 0), INFIMUM_OFFSET);
        assert_eq!(dir_slot(&frame, n_slots - 1), SUPREMUM_OFFSET);
        for i in 1..n_slots {
            let owned = rec_n_owned(&frame, dir_slot(&frame, i));
            assert!(owned >= 1 && owned <= PAGE_DIR_SLOT_MAX_N_OWNED);
        }
        // Every record is owned by exactly one slot group.
        let owned_total: u16 = (0..n_slots)
            .map(|i| rec_n_owned(&frame, dir_slot(&frame, i)) as u16)
            .sum();
        assert_eq!(owned_total, page_n_recs(&frame) + 2);
    }

    #[test]
    fn reorganize_compacts_garbage_and_preserves_order() {
        let mut frame = fresh_page();
        for key in 0u64..50 {
            insert_key(&mut frame, key);
        }
        for key in (0u64..50).step_by(2) {
            let t = Tuple::new(vec![key.to_be_bytes().to_vec()]);
            let rec = page_cur_search(&frame, &t, default_tuple_compare, 1, SearchMode::GE);
            let mut pg = PageMut::new(&mut frame, PageId::new(1, 3), None);
            page_cur_delete(&mut pg, rec);
        }
        assert!(get_u16(&frame, PAGE_GARBAGE) > 0);

        let mut redo = Vec::new();
        {
            let mut pg = PageMut::new(&mut frame, PageId::new(1, 3), Some(&mut redo));
            page_reorganize(&mut pg);
        }
        assert_eq!(get_u16(&frame, PAGE_GARBAGE), 0);
        assert!(!redo.is_empty());
        let keys: Vec<u64> = page_user_recs(&frame)
            .into_iter()
            .map(|rec| u64::from_be_bytes(rec_field(&frame, rec, 0).try_into().unwrap()))
            .collect();
        let expected: Vec<u64> = (0u64..50).filter(|k| k % 2 == 1).collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn torn_write_detection_via_lsn_mirror() {
        let mut frame = fresh_page();
        page_set_lsn(&mut frame, 0xAABBCCDD);
        page_stamp_for_write(&mut frame);
        assert_eq!(page_verify(&frame), PageCheck::Ok);

        // Tear: the trailer keeps an older LSN mirror.
        put_u32(&mut frame, FIL_TRAILER, 0x11111111);
        assert_eq!(page_verify(&frame), PageCheck::Torn);
    }

    #[test]
    fn checksum_detects_payload_corruption() {
        let mut frame = fresh_page();
        page_set_lsn(&mut frame, 77);
        page_stamp_for_write(&mut frame);
        frame[PAGE_DATA + 100] ^= 0xFF;
        assert_eq!(page_verify(&frame), PageCheck::BadChecksum);
    }

    #[test]
    fn delete_mark_round_trip() {
        let mut frame = fresh_page();
        let rec = insert_key(&mut frame, 9);
        assert!(!rec_is_delete_marked(&frame, rec));
        {
            let mut pg = PageMut::new(&mut frame, PageId::new(1, 3), None);
            rec_set_delete_mark(&mut pg, rec, true);
        }
        assert!(rec_is_delete_marked(&frame, rec));
    }

    #[test]
    fn oversize_record_is_rejected() {
        let mut frame = fresh_page();
        let huge = Tuple::new(vec![vec![0u8; page_max_rec_size()]]);
        let mut pg = PageMut::new(&mut frame, PageId::new(1, 3), None);
        let err = page_cur_insert(&mut pg, INFIMUM_OFFSET, &huge, REC_TYPE_ORDINARY, 0)
            .unwrap_err();
        assert!(matches!(err, DbError::RecordTooBig { .. }));
    }
}
