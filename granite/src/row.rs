//! Row-level operations on clustered and secondary indexes.
//!
//! Writes follow the engine's protocol: the undo log is assigned before any
//! page is latched, the undo record is written inside the row operation
//! while the leaf is x-latched, and the record carries the writer's trx id
//! and roll pointer. Lock waits never happen under page latches: a waiting
//! reply commits the mtr, suspends in the lock system and retries.
//!
//! Secondary-index records carry the secondary ordering fields followed by
//! the full clustering key and no system fields; visibility is resolved by
//! re-reading the clustered row.

use std::cmp::Ordering;
use std::sync::Arc;

use log::warn;

use crate::btree::{
    btr_cursor_search, btr_delete_mark, btr_insert_pessimistic, btr_replace_pessimistic,
    btr_cursor_insert_optimistic, BtrCursor, BtrLatch, IndexDef,
};
use crate::engine::Engine;
use crate::errors::{DbError, DbResult};
use crate::lock_manager::{
    LockMode, LockReply, LOCK_GAP, LOCK_INSERT_INTENTION, LOCK_REC_NOT_GAP,
};
use crate::mtr::Mtr;
use crate::page::{
    self, rec_next, SearchMode, Tuple, INFIMUM_OFFSET, SUPREMUM_OFFSET,
};
use crate::pcur::PersistentCursor;
use crate::transaction::{field_u64, visible_version, ReadView, Trx};
use crate::undo::{UndoKind, UndoRec};

/// A secondary index and the user-row columns forming its ordering prefix.
#[derive(Debug, Clone)]
pub struct SecIndex {
    pub def: IndexDef,
    pub cols: Vec<usize>,
}

impl SecIndex {
    /// Builds the secondary entry for a user row: ordering fields, then the
    /// full clustering key.
    pub fn entry_from_row(&self, clustered: &IndexDef, row: &Tuple) -> Tuple {
        let mut fields = Vec::with_capacity(self.cols.len() + clustered.n_key_fields);
        for &c in &self.cols {
            fields.push(row.fields[c].clone());
        }
        for i in 0..clustered.n_key_fields {
            fields.push(row.fields[i].clone());
        }
        Tuple::new(fields)
    }
}

/// Interleaves the hidden system fields into a stored clustered tuple.
pub fn stored_from_row(index: &IndexDef, row: &Tuple, trx_id: u64, roll_ptr: u64) -> Tuple {
    debug_assert!(index.clustered);
    debug_assert_eq!(row.fields.len(), index.n_fields);
    let mut fields = Vec::with_capacity(index.n_stored_fields());
    fields.extend(row.fields[..index.n_key_fields].iter().cloned());
    fields.push(trx_id.to_be_bytes().to_vec());
    fields.push(roll_ptr.to_be_bytes().to_vec());
    fields.extend(row.fields[index.n_key_fields..].iter().cloned());
    Tuple::new(fields)
}

/// Strips the hidden system fields from a stored clustered tuple.
pub fn row_from_stored(index: &IndexDef, stored: &Tuple) -> Tuple {
    debug_assert!(index.clustered);
    let mut fields = Vec::with_capacity(index.n_fields);
    fields.extend(stored.fields[..index.n_key_fields].iter().cloned());
    fields.extend(stored.fields[index.n_key_fields + 2..].iter().cloned());
    Tuple::new(fields)
}

fn cursor_is_on_key(mtr: &Mtr, cur: &BtrCursor, index: &IndexDef, key: &Tuple) -> bool {
    let frame = mtr.frame(cur.slot);
    cur.rec != INFIMUM_OFFSET
        && cur.rec != SUPREMUM_OFFSET
        && page::rec_is_user_rec(frame, cur.rec)
        && page::rec_cmp_with_tuple(frame, cur.rec, key, index.compare, index.n_key_fields)
            == Ordering::Equal
}

/// The union of secondary ordering columns, with the row's current values.
fn ordering_values(secondaries: &[SecIndex], row: &Tuple) -> Vec<(u16, Vec<u8>)> {
    let mut cols: Vec<usize> = secondaries.iter().flat_map(|s| s.cols.clone()).collect();
    cols.sort_unstable();
    cols.dedup();
    cols.into_iter()
        .map(|c| (c as u16, row.fields[c].clone()))
        .collect()
}

/// Inserts a user row into the clustered index and every secondary.
/// `DUPLICATE_KEY` when a live record with the same key exists; a
/// delete-marked match is resurrected in place.
pub fn insert_row(
    engine: &Engine,
    trx: &Arc<Trx>,
    clustered: &IndexDef,
    secondaries: &[SecIndex],
    row: &Tuple,
) -> DbResult<()> {
    debug_assert_eq!(row.fields.len(), clustered.n_fields);
    engine.trx_sys.assign_for_write(trx)?;
    engine.trx_sys.ensure_undo(trx, UndoKind::Insert)?;
    let key = row.prefix(clustered.n_key_fields);
    let timeout = engine.lock_wait_timeout();

    loop {
        let mut mtr = Mtr::new();
        let cur = btr_cursor_search(
            clustered,
            &key,
            SearchMode::LE,
            BtrLatch::ModifyLeaf,
            &engine.pool,
            &mut mtr,
        )?;
        if cursor_is_on_key(&mtr, &cur, clustered, &key) {
            let frame = mtr.frame(cur.slot);
            if !page::rec_is_delete_marked(frame, cur.rec) {
                mtr.commit(&engine.pool)?;
                return Err(DbError::DuplicateKey);
            }
            // Resurrect the delete-marked record as an update.
            mtr.commit(&engine.pool)?;
            engine.trx_sys.ensure_undo(trx, UndoKind::UpdateExists)?;
            match resurrect_row(engine, trx, clustered, secondaries, row, &key)? {
                true => return Ok(()),
                false => continue, // raced with purge or another writer
            }
        }

        // Queue behind any gap lock covering the insert point.
        let page_id = mtr.page_id(cur.slot);
        let frame = mtr.frame(cur.slot);
        let succ = if cur.rec == INFIMUM_OFFSET {
            rec_next(frame, INFIMUM_OFFSET)
        } else {
            rec_next(frame, cur.rec)
        };
        let succ_heap = page::rec_heap_no(frame, succ);
        match engine.lock_sys.lock_record(
            trx.id(),
            page_id,
            succ_heap,
            LockMode::X,
            LOCK_GAP | LOCK_INSERT_INTENTION,
            timeout,
        )? {
            LockReply::Granted => {}
            LockReply::Waiting => {
                mtr.commit(&engine.pool)?;
                engine.lock_sys.wait_for_lock(trx.id())?;
                continue;
            }
        }

        let roll_ptr = engine.trx_sys.write_undo(
            trx,
            UndoRec {
                kind: UndoKind::Insert,
                trx_id: 0,
                undo_no: 0,
                index_id: clustered.id,
                key: key.fields.clone(),
                updated: Vec::new(),
                old_trx_id: 0,
                old_roll_ptr: 0,
                old_delete_mark: false,
                ordering_old: Vec::new(),
            },
        )?;
        let stored = stored_from_row(clustered, row, trx.id(), roll_ptr);

        let inserted =
            btr_cursor_insert_optimistic(clustered, &cur, &stored, &engine.lock_sys, &mut mtr)?;
        let (rec_page, rec_heap) = match inserted {
            Some(rec) => {
                let heap = page::rec_heap_no(mtr.frame(cur.slot), rec);
                let page = mtr.page_id(cur.slot);
                mtr.commit(&engine.pool)?;
                (page, heap)
            }
            None => {
                mtr.commit(&engine.pool)?;
                let mut big_mtr = Mtr::new();
                let (page, rec) = btr_insert_pessimistic(
                    clustered,
                    &stored,
                    &engine.pool,
                    &engine.lock_sys,
                    &engine.tree_latches,
                    &mut big_mtr,
                )?;
                let slot = big_mtr.find_page(page).expect("leaf is latched");
                let heap = page::rec_heap_no(big_mtr.frame(slot), rec);
                big_mtr.commit(&engine.pool)?;
                (page, heap)
            }
        };

        // Explicit record lock standing in for the implicit lock of the
        // row's creator.
        if let LockReply::Waiting = engine.lock_sys.lock_record(
            trx.id(),
            rec_page,
            rec_heap,
            LockMode::X,
            LOCK_REC_NOT_GAP,
            timeout,
        )? {
            engine.lock_sys.wait_for_lock(trx.id())?;
        }

        for sec in secondaries {
            let entry = sec.entry_from_row(clustered, row);
            sec_insert_entry(engine, sec, &entry)?;
        }
        return Ok(());
    }
}

/// Replaces the field values of a delete-marked record with a fresh row.
fn resurrect_row(
    engine: &Engine,
    trx: &Arc<Trx>,
    clustered: &IndexDef,
    secondaries: &[SecIndex],
    row: &Tuple,
    key: &Tuple,
) -> DbResult<bool> {
    let timeout = engine.lock_wait_timeout();
    loop {
        let mut mtr = Mtr::new();
        let cur = btr_cursor_search(
            clustered,
            key,
            SearchMode::GE,
            BtrLatch::ModifyLeaf,
            &engine.pool,
            &mut mtr,
        )?;
        if !cursor_is_on_key(&mtr, &cur, clustered, key) {
            mtr.commit(&engine.pool)?;
            return Ok(false);
        }
        let frame = mtr.frame(cur.slot);
        if !page::rec_is_delete_marked(frame, cur.rec) {
            mtr.commit(&engine.pool)?;
            return Ok(false);
        }
        let page_id = mtr.page_id(cur.slot);
        let heap = page::rec_heap_no(frame, cur.rec);
        match engine.lock_sys.lock_record(
            trx.id(),
            page_id,
            heap,
            LockMode::X,
            LOCK_REC_NOT_GAP,
            timeout,
        )? {
            LockReply::Granted => {}
            LockReply::Waiting => {
                mtr.commit(&engine.pool)?;
                engine.lock_sys.wait_for_lock(trx.id())?;
                continue;
            }
        }

        let old_stored = page::rec_to_tuple(mtr.frame(cur.slot), cur.rec);
        let old_row = row_from_stored(clustered, &old_stored);
        let old_trx_id = field_u64(&old_stored, clustered.trx_id_pos());
        let old_roll_ptr = field_u64(&old_stored, clustered.roll_ptr_pos());

        let updated: Vec<(u16, Vec<u8>)> = (clustered.n_key_fields..clustered.n_fields)
            .filter(|&f| old_row.fields[f] != row.fields[f])
            .map(|f| (f as u16, old_row.fields[f].clone()))
            .collect();
        let roll_ptr = engine.trx_sys.write_undo(
            trx,
            UndoRec {
                kind: UndoKind::UpdateExists,
                trx_id: 0,
                undo_no: 0,
                index_id: clustered.id,
                key: key.fields.clone(),
                updated,
                old_trx_id,
                old_roll_ptr,
                old_delete_mark: true,
                ordering_old: ordering_values(secondaries, &old_row),
            },
        )?;

        let new_stored = stored_from_row(clustered, row, trx.id(), roll_ptr);
        let same_shape = old_stored
            .fields
            .iter()
            .zip(new_stored.fields.iter())
            .all(|(a, b)| a.len() == b.len());
        if same_shape {
            let mut pg = mtr.page_mut(cur.slot);
            for (i, f) in new_stored.fields.iter().enumerate() {
                page::rec_set_field_in_place(&mut pg, cur.rec, i, f);
            }
            page::rec_set_delete_mark(&mut pg, cur.rec, false);
            mtr.commit(&engine.pool)?;
        } else {
            mtr.commit(&engine.pool)?;
            btr_replace_pessimistic(
                clustered,
                key,
                &new_stored,
                &engine.pool,
                &engine.lock_sys,
                &engine.tree_latches,
            )?;
        }

        // Revive or recreate the secondary entries.
        for sec in secondaries {
            let old_entry = sec.entry_from_row(clustered, &old_row);
            let new_entry = sec.entry_from_row(clustered, row);
            if old_entry == new_entry {
                sec_set_delete_mark(engine, sec, &old_entry, false)?;
            } else {
                sec_insert_entry(engine, sec, &new_entry)?;
            }
        }
        return Ok(true);
    }
}

/// Updates non-key fields of the row with the given key. Returns whether a
/// live row was found and updated.
pub fn update_row(
    engine: &Engine,
    trx: &Arc<Trx>,
    clustered: &IndexDef,
    secondaries: &[SecIndex],
    key: &Tuple,
    updates: &[(usize, Vec<u8>)],
) -> DbResult<bool> {
    debug_assert!(updates
        .iter()
        .all(|(f, _)| *f >= clustered.n_key_fields && *f < clustered.n_fields));
    engine.trx_sys.assign_for_write(trx)?;
    engine.trx_sys.ensure_undo(trx, UndoKind::UpdateExists)?;
    let timeout = engine.lock_wait_timeout();

    loop {
        let mut mtr = Mtr::new();
        let cur = btr_cursor_search(
            clustered,
            key,
            SearchMode::GE,
            BtrLatch::ModifyLeaf,
            &engine.pool,
            &mut mtr,
        )?;
        if !cursor_is_on_key(&mtr, &cur, clustered, key) {
            mtr.commit(&engine.pool)?;
            return Ok(false);
        }
        let page_id = mtr.page_id(cur.slot);
        let heap = page::rec_heap_no(mtr.frame(cur.slot), cur.rec);
        match engine.lock_sys.lock_record(
            trx.id(),
            page_id,
            heap,
            LockMode::X,
            LOCK_REC_NOT_GAP,
            timeout,
        )? {
            LockReply::Granted => {}
            LockReply::Waiting => {
                mtr.commit(&engine.pool)?;
                engine.lock_sys.wait_for_lock(trx.id())?;
                continue;
            }
        }
        if page::rec_is_delete_marked(mtr.frame(cur.slot), cur.rec) {
            mtr.commit(&engine.pool)?;
            return Ok(false);
        }

        let old_stored = page::rec_to_tuple(mtr.frame(cur.slot), cur.rec);
        let old_row = row_from_stored(clustered, &old_stored);
        let old_trx_id = field_u64(&old_stored, clustered.trx_id_pos());
        let old_roll_ptr = field_u64(&old_stored, clustered.roll_ptr_pos());

        let mut new_row = old_row.clone();
        for (f, v) in updates {
            new_row.fields[*f] = v.clone();
        }

        let sec_changed: Vec<&SecIndex> = secondaries
            .iter()
            .filter(|s| s.cols.iter().any(|&c| old_row.fields[c] != new_row.fields[c]))
            .collect();
        let ordering_old = if sec_changed.is_empty() {
            Vec::new()
        } else {
            ordering_values(secondaries, &old_row)
        };

        let undo_updated: Vec<(u16, Vec<u8>)> = updates
            .iter()
            .filter(|(f, v)| old_row.fields[*f] != *v)
            .map(|(f, _)| (*f as u16, old_row.fields[*f].clone()))
            .collect();
        if undo_updated.is_empty() {
            mtr.commit(&engine.pool)?;
            return Ok(true); // nothing actually changes
        }

        let roll_ptr = engine.trx_sys.write_undo(
            trx,
            UndoRec {
                kind: UndoKind::UpdateExists,
                trx_id: 0,
                undo_no: 0,
                index_id: clustered.id,
                key: key.fields.clone(),
                updated: undo_updated,
                old_trx_id,
                old_roll_ptr,
                old_delete_mark: false,
                ordering_old,
            },
        )?;

        let new_stored = stored_from_row(clustered, &new_row, trx.id(), roll_ptr);
        let same_shape = old_stored
            .fields
            .iter()
            .zip(new_stored.fields.iter())
            .all(|(a, b)| a.len() == b.len());
        if same_shape {
            let mut pg = mtr.page_mut(cur.slot);
            for (i, f) in new_stored.fields.iter().enumerate() {
                if old_stored.fields[i] != *f {
                    page::rec_set_field_in_place(&mut pg, cur.rec, i, f);
                }
            }
            mtr.commit(&engine.pool)?;
        } else {
            mtr.commit(&engine.pool)?;
            btr_replace_pessimistic(
                clustered,
                key,
                &new_stored,
                &engine.pool,
                &engine.lock_sys,
                &engine.tree_latches,
            )?;
        }

        // Changed secondaries: mark the obsolete entry, insert the new one.
        for sec in sec_changed {
            let old_entry = sec.entry_from_row(clustered, &old_row);
            let new_entry = sec.entry_from_row(clustered, &new_row);
            sec_set_delete_mark(engine, sec, &old_entry, true)?;
            sec_insert_entry(engine, sec, &new_entry)?;
        }
        return Ok(true);
    }
}

/// Delete-marks the row with the given key (and its secondary entries).
/// Physical removal is purge's job once no read view needs the version.
pub fn delete_row(
    engine: &Engine,
    trx: &Arc<Trx>,
    clustered: &IndexDef,
    secondaries: &[SecIndex],
    key: &Tuple,
) -> DbResult<bool> {
    engine.trx_sys.assign_for_write(trx)?;
    engine.trx_sys.ensure_undo(trx, UndoKind::DeleteMark)?;
    let timeout = engine.lock_wait_timeout();

    loop {
        let mut mtr = Mtr::new();
        let cur = btr_cursor_search(
            clustered,
            key,
            SearchMode::GE,
            BtrLatch::ModifyLeaf,
            &engine.pool,
            &mut mtr,
        )?;
        if !cursor_is_on_key(&mtr, &cur, clustered, key) {
            mtr.commit(&engine.pool)?;
            return Ok(false);
        }
        let page_id = mtr.page_id(cur.slot);
        let heap = page::rec_heap_no(mtr.frame(cur.slot), cur.rec);
        match engine.lock_sys.lock_record(
            trx.id(),
            page_id,
            heap,
            LockMode::X,
            LOCK_REC_NOT_GAP,
            timeout,
        )? {
            LockReply::Granted => {}
            LockReply::Waiting => {
                mtr.commit(&engine.pool)?;
                engine.lock_sys.wait_for_lock(trx.id())?;
                continue;
            }
        }
        if page::rec_is_delete_marked(mtr.frame(cur.slot), cur.rec) {
            mtr.commit(&engine.pool)?;
            return Ok(false);
        }

        let old_stored = page::rec_to_tuple(mtr.frame(cur.slot), cur.rec);
        let old_row = row_from_stored(clustered, &old_stored);
        let old_trx_id = field_u64(&old_stored, clustered.trx_id_pos());
        let old_roll_ptr = field_u64(&old_stored, clustered.roll_ptr_pos());

        let roll_ptr = engine.trx_sys.write_undo(
            trx,
            UndoRec {
                kind: UndoKind::DeleteMark,
                trx_id: 0,
                undo_no: 0,
                index_id: clustered.id,
                key: key.fields.clone(),
                updated: Vec::new(),
                old_trx_id,
                old_roll_ptr,
                old_delete_mark: false,
                ordering_old: Vec::new(),
            },
        )?;

        {
            let mut pg = mtr.page_mut(cur.slot);
            page::rec_set_field_in_place(
                &mut pg,
                cur.rec,
                clustered.trx_id_pos(),
                &trx.id().to_be_bytes(),
            );
            page::rec_set_field_in_place(
                &mut pg,
                cur.rec,
                clustered.roll_ptr_pos(),
                &roll_ptr.to_be_bytes(),
            );
            page::rec_set_delete_mark(&mut pg, cur.rec, true);
        }
        mtr.commit(&engine.pool)?;

        for sec in secondaries {
            let entry = sec.entry_from_row(clustered, &old_row);
            sec_set_delete_mark(engine, sec, &entry, true)?;
        }
        return Ok(true);
    }
}

/// Point read by key. With `lock` set this is a locking read (next-key on
/// the found record); otherwise a consistent read against the transaction's
/// read view, reconstructing old versions through undo.
pub fn read_row(
    engine: &Engine,
    trx: &Arc<Trx>,
    clustered: &IndexDef,
    key: &Tuple,
    lock: Option<LockMode>,
) -> DbResult<Option<Tuple>> {
    match lock {
        None => {
            let view = engine.trx_sys.read_view(trx);
            let mut mtr = Mtr::new();
            let cur = btr_cursor_search(
                clustered,
                key,
                SearchMode::GE,
                BtrLatch::SearchLeaf,
                &engine.pool,
                &mut mtr,
            )?;
            let result = if cursor_is_on_key(&mtr, &cur, clustered, key) {
                let frame = mtr.frame(cur.slot);
                let stored = page::rec_to_tuple(frame, cur.rec);
                let marked = page::rec_is_delete_marked(frame, cur.rec);
                match visible_version(&engine.pool, clustered, &stored, marked, &view)? {
                    Some((version, false)) => Some(row_from_stored(clustered, &version)),
                    _ => None,
                }
            } else {
                None
            };
            mtr.commit(&engine.pool)?;
            Ok(result)
        }
        Some(mode) => {
            engine.trx_sys.assign_for_write(trx)?;
            let timeout = engine.lock_wait_timeout();
            loop {
                let mut mtr = Mtr::new();
                let cur = btr_cursor_search(
                    clustered,
                    key,
                    SearchMode::GE,
                    BtrLatch::SearchLeaf,
                    &engine.pool,
                    &mut mtr,
                )?;
                let on_key = cursor_is_on_key(&mtr, &cur, clustered, key);
                let frame = mtr.frame(cur.slot);
                let (page_id, heap, flags) = if on_key {
                    (
                        mtr.page_id(cur.slot),
                        page::rec_heap_no(frame, cur.rec),
                        0, // next-key
                    )
                } else {
                    // Phantom protection: lock the gap at the would-be spot.
                    let heap = if cur.rec == SUPREMUM_OFFSET {
                        page::HEAP_NO_SUPREMUM
                    } else {
                        page::rec_heap_no(frame, cur.rec)
                    };
                    (mtr.page_id(cur.slot), heap, LOCK_GAP)
                };
                match engine
                    .lock_sys
                    .lock_record(trx.id(), page_id, heap, mode, flags, timeout)?
                {
                    LockReply::Granted => {}
                    LockReply::Waiting => {
                        mtr.commit(&engine.pool)?;
                        engine.lock_sys.wait_for_lock(trx.id())?;
                        continue;
                    }
                }
                let result = if on_key && !page::rec_is_delete_marked(mtr.frame(cur.slot), cur.rec)
                {
                    let stored = page::rec_to_tuple(mtr.frame(cur.slot), cur.rec);
                    Some(row_from_stored(clustered, &stored))
                } else {
                    None
                };
                mtr.commit(&engine.pool)?;
                return Ok(result);
            }
        }
    }
}

// Secondary-index entry maintenance. Secondary entries have no system
// fields; their whole field list is the ordering.

fn sec_insert_entry(engine: &Engine, sec: &SecIndex, entry: &Tuple) -> DbResult<()> {
    let index = &sec.def;
    let mut mtr = Mtr::new();
    let cur = btr_cursor_search(
        index,
        entry,
        SearchMode::LE,
        BtrLatch::ModifyLeaf,
        &engine.pool,
        &mut mtr,
    )?;
    if cursor_is_on_key(&mtr, &cur, index, entry) {
        // The identical entry exists (e.g. revived); just unmark it.
        let mut pg = mtr.page_mut(cur.slot);
        page::rec_set_delete_mark(&mut pg, cur.rec, false);
        mtr.commit(&engine.pool)?;
        return Ok(());
    }
    match btr_cursor_insert_optimistic(index, &cur, entry, &engine.lock_sys, &mut mtr)? {
        Some(_) => {
            mtr.commit(&engine.pool)?;
        }
        None => {
            mtr.commit(&engine.pool)?;
            let mut big_mtr = Mtr::new();
            btr_insert_pessimistic(
                index,
                entry,
                &engine.pool,
                &engine.lock_sys,
                &engine.tree_latches,
                &mut big_mtr,
            )?;
            big_mtr.commit(&engine.pool)?;
        }
    }
    Ok(())
}

fn sec_set_delete_mark(
    engine: &Engine,
    sec: &SecIndex,
    entry: &Tuple,
    mark: bool,
) -> DbResult<()> {
    let index = &sec.def;
    let mut mtr = Mtr::new();
    let cur = btr_cursor_search(
        index,
        entry,
        SearchMode::GE,
        BtrLatch::ModifyLeaf,
        &engine.pool,
        &mut mtr,
    )?;
    if cursor_is_on_key(&mtr, &cur, index, entry) {
        btr_delete_mark(&cur, mark, &mut mtr);
    }
    mtr.commit(&engine.pool)?;
    Ok(())
}

// Rollback application: reverse one undo record through the B-tree.

/// Applies an undo record during rollback. Tolerates records whose page
/// change never happened (crash between undo write and page write).
pub fn apply_undo(engine: &Engine, rec: &UndoRec) -> DbResult<()> {
    let Some((clustered, secondaries)) = engine.index_set(rec.index_id) else {
        warn!("undo for unknown index {}; skipped", rec.index_id);
        return Ok(());
    };
    let key = Tuple::new(rec.key.clone());

    match rec.kind {
        UndoKind::Insert => {
            // Remove the inserted row and its secondary entries.
            let current = read_stored_by_key(engine, &clustered, &key)?;
            if let Some((stored, _)) = current {
                if field_u64(&stored, clustered.trx_id_pos()) != rec.trx_id {
                    return Ok(()); // someone else owns the row now
                }
                let row = row_from_stored(&clustered, &stored);
                for sec in &secondaries {
                    let entry = sec.entry_from_row(&clustered, &row);
                    crate::btree::btr_delete_physical(
                        &sec.def,
                        &entry,
                        &engine.pool,
                        &engine.lock_sys,
                        &engine.tree_latches,
                        |_, _| true,
                    )?;
                }
                let trx_id = rec.trx_id;
                let trx_pos = clustered.trx_id_pos();
                crate::btree::btr_delete_physical(
                    &clustered,
                    &key,
                    &engine.pool,
                    &engine.lock_sys,
                    &engine.tree_latches,
                    move |frame, r| {
                        let stored = page::rec_to_tuple(frame, r);
                        field_u64(&stored, trx_pos) == trx_id
                    },
                )?;
            }
            Ok(())
        }
        UndoKind::UpdateExists | UndoKind::DeleteMark => {
            restore_pre_image(engine, &clustered, &secondaries, rec, &key)
        }
    }
}

fn read_stored_by_key(
    engine: &Engine,
    index: &IndexDef,
    key: &Tuple,
) -> DbResult<Option<(Tuple, bool)>> {
    let mut mtr = Mtr::new();
    let cur = btr_cursor_search(
        index,
        key,
        SearchMode::GE,
        BtrLatch::SearchLeaf,
        &engine.pool,
        &mut mtr,
    )?;
    let result = if cursor_is_on_key(&mtr, &cur, index, key) {
        let frame = mtr.frame(cur.slot);
        Some((
            page::rec_to_tuple(frame, cur.rec),
            page::rec_is_delete_marked(frame, cur.rec),
        ))
    } else {
        None
    };
    mtr.commit(&engine.pool)?;
    Ok(result)
}

fn restore_pre_image(
    engine: &Engine,
    clustered: &IndexDef,
    secondaries: &[SecIndex],
    rec: &UndoRec,
    key: &Tuple,
) -> DbResult<()> {
    let mut mtr = Mtr::new();
    let cur = btr_cursor_search(
        clustered,
        key,
        SearchMode::GE,
        BtrLatch::ModifyLeaf,
        &engine.pool,
        &mut mtr,
    )?;
    if !cursor_is_on_key(&mtr, &cur, clustered, key) {
        mtr.commit(&engine.pool)?;
        return Ok(());
    }
    let cur_stored = page::rec_to_tuple(mtr.frame(cur.slot), cur.rec);
    if field_u64(&cur_stored, clustered.trx_id_pos()) != rec.trx_id {
        mtr.commit(&engine.pool)?;
        return Ok(()); // the page change never happened
    }
    let cur_row = row_from_stored(clustered, &cur_stored);

    let mut old_stored = cur_stored.clone();
    old_stored.fields[clustered.trx_id_pos()] = rec.old_trx_id.to_be_bytes().to_vec();
    old_stored.fields[clustered.roll_ptr_pos()] = rec.old_roll_ptr.to_be_bytes().to_vec();
    for (f, v) in &rec.updated {
        old_stored.fields[clustered.stored_pos(*f as usize)] = v.clone();
    }

    let same_shape = cur_stored
        .fields
        .iter()
        .zip(old_stored.fields.iter())
        .all(|(a, b)| a.len() == b.len());
    if same_shape {
        {
            let mut pg = mtr.page_mut(cur.slot);
            for (i, f) in old_stored.fields.iter().enumerate() {
                if cur_stored.fields[i] != *f {
                    page::rec_set_field_in_place(&mut pg, cur.rec, i, f);
                }
            }
            page::rec_set_delete_mark(&mut pg, cur.rec, rec.old_delete_mark);
        }
        mtr.commit(&engine.pool)?;
    } else {
        mtr.commit(&engine.pool)?;
        btr_replace_pessimistic(
            clustered,
            key,
            &old_stored,
            &engine.pool,
            &engine.lock_sys,
            &engine.tree_latches,
        )?;
        if rec.old_delete_mark {
            let mut mark_mtr = Mtr::new();
            let cur = btr_cursor_search(
                clustered,
                key,
                SearchMode::GE,
                BtrLatch::ModifyLeaf,
                &engine.pool,
                &mut mark_mtr,
            )?;
            if cursor_is_on_key(&mark_mtr, &cur, clustered, key) {
                btr_delete_mark(&cur, true, &mut mark_mtr);
            }
            mark_mtr.commit(&engine.pool)?;
        }
    }

    // Reverse the secondary-entry churn.
    let old_row = row_from_stored(clustered, &old_stored);
    match rec.kind {
        UndoKind::DeleteMark => {
            for sec in secondaries {
                let entry = sec.entry_from_row(clustered, &old_row);
                sec_set_delete_mark(engine, sec, &entry, false)?;
            }
        }
        UndoKind::UpdateExists => {
            for sec in secondaries {
                let old_entry = sec.entry_from_row(clustered, &old_row);
                let new_entry = sec.entry_from_row(clustered, &cur_row);
                if old_entry != new_entry {
                    crate::btree::btr_delete_physical(
                        &sec.def,
                        &new_entry,
                        &engine.pool,
                        &engine.lock_sys,
                        &engine.tree_latches,
                        |_, _| true,
                    )?;
                    sec_set_delete_mark(engine, sec, &old_entry, rec.old_delete_mark)?;
                }
            }
        }
        UndoKind::Insert => unreachable!("handled by the caller"),
    }
    Ok(())
}

/// A row cursor over a clustered index: consistent or locking scans with a
/// persistent cursor surviving mtr commits between steps.
pub struct RowCursor {
    clustered: IndexDef,
    pcur: PersistentCursor,
    lock: Option<LockMode>,
}

impl RowCursor {
    pub fn new(clustered: IndexDef, lock: Option<LockMode>) -> Self {
        Self {
            clustered,
            pcur: PersistentCursor::new(clustered, BtrLatch::SearchLeaf),
            lock,
        }
    }

    pub fn set_lock_mode(&mut self, lock: Option<LockMode>) {
        self.lock = lock;
    }

    /// Positions at the first row of the index and returns it.
    pub fn first(&mut self, engine: &Engine, trx: &Arc<Trx>) -> DbResult<Option<Tuple>> {
        let view = self.view_for(engine, trx)?;
        let mut mtr = Mtr::new();
        self.pcur.open_at_side(true, &engine.pool, &mut mtr)?;
        let got = self.scan_forward(engine, trx, &view, &mut mtr)?;
        self.pcur.store_position(&mtr);
        mtr.commit(&engine.pool)?;
        Ok(got)
    }

    /// Positions at the last row of the index and returns it.
    pub fn last(&mut self, engine: &Engine, trx: &Arc<Trx>) -> DbResult<Option<Tuple>> {
        let view = self.view_for(engine, trx)?;
        let mut mtr = Mtr::new();
        self.pcur.open_at_side(false, &engine.pool, &mut mtr)?;
        let got = self.scan_backward(engine, trx, &view, &mut mtr)?;
        self.pcur.store_position(&mtr);
        mtr.commit(&engine.pool)?;
        Ok(got)
    }

    /// Positions by `seek(key, mode)` and returns the row found there.
    pub fn seek(
        &mut self,
        engine: &Engine,
        trx: &Arc<Trx>,
        key: &Tuple,
        mode: SearchMode,
    ) -> DbResult<Option<Tuple>> {
        let view = self.view_for(engine, trx)?;
        let mut mtr = Mtr::new();
        self.pcur.search(key, mode, &engine.pool, &mut mtr)?;
        let got = match mode {
            SearchMode::GE | SearchMode::G => self.scan_forward(engine, trx, &view, &mut mtr)?,
            SearchMode::LE | SearchMode::L => self.scan_backward(engine, trx, &view, &mut mtr)?,
        };
        self.pcur.store_position(&mtr);
        mtr.commit(&engine.pool)?;
        Ok(got)
    }

    /// Advances to the next visible row.
    pub fn next(&mut self, engine: &Engine, trx: &Arc<Trx>) -> DbResult<Option<Tuple>> {
        let view = self.view_for(engine, trx)?;
        let mut mtr = Mtr::new();
        self.pcur.restore_position(&engine.pool, &mut mtr)?;
        if !self.pcur.move_to_next(&engine.pool, &mut mtr)? {
            self.pcur.store_position(&mtr);
            mtr.commit(&engine.pool)?;
            return Ok(None);
        }
        let got = self.scan_forward(engine, trx, &view, &mut mtr)?;
        self.pcur.store_position(&mtr);
        mtr.commit(&engine.pool)?;
        Ok(got)
    }

    /// Steps back to the previous visible row.
    pub fn prev(&mut self, engine: &Engine, trx: &Arc<Trx>) -> DbResult<Option<Tuple>> {
        let view = self.view_for(engine, trx)?;
        let mut mtr = Mtr::new();
        self.pcur.restore_position(&engine.pool, &mut mtr)?;
        if !self.pcur.move_to_prev(&engine.pool, &mut mtr)? {
            self.pcur.store_position(&mtr);
            mtr.commit(&engine.pool)?;
            return Ok(None);
        }
        let got = self.scan_backward(engine, trx, &view, &mut mtr)?;
        self.pcur.store_position(&mtr);
        mtr.commit(&engine.pool)?;
        Ok(got)
    }

    /// Restores the stored position; exposed for the pcur contract tests.
    pub fn restore(&mut self, engine: &Engine, mtr: &mut Mtr) -> DbResult<bool> {
        self.pcur.restore_position(&engine.pool, mtr)
    }

    pub fn pcur(&mut self) -> &mut PersistentCursor {
        &mut self.pcur
    }

    fn view_for(&self, engine: &Engine, trx: &Arc<Trx>) -> DbResult<ReadView> {
        if self.lock.is_some() {
            engine.trx_sys.assign_for_write(trx)?;
        }
        Ok((*engine.trx_sys.read_view(trx)).clone())
    }

    /// Walks forward from the current position to the first row visible in
    /// `view`, locking each visited record in locking mode.
    fn scan_forward(
        &mut self,
        engine: &Engine,
        trx: &Arc<Trx>,
        view: &ReadView,
        mtr: &mut Mtr,
    ) -> DbResult<Option<Tuple>> {
        loop {
            if self.pcur.is_on_user_rec(mtr) {
                if let Some(row) = self.read_current(engine, trx, view, mtr)? {
                    return Ok(Some(row));
                }
            }
            if !self.pcur.move_to_next(&engine.pool, mtr)? {
                return Ok(None);
            }
        }
    }

    fn scan_backward(
        &mut self,
        engine: &Engine,
        trx: &Arc<Trx>,
        view: &ReadView,
        mtr: &mut Mtr,
    ) -> DbResult<Option<Tuple>> {
        loop {
            if self.pcur.is_on_user_rec(mtr) {
                if let Some(row) = self.read_current(engine, trx, view, mtr)? {
                    return Ok(Some(row));
                }
            }
            if !self.pcur.move_to_prev(&engine.pool, mtr)? {
                return Ok(None);
            }
        }
    }

    /// Reads the record under the cursor per the cursor's mode: a locking
    /// read takes a next-key lock (waits are surfaced as `LockWait`; the
    /// caller retries), a consistent read reconstructs the visible version.
    fn read_current(
        &mut self,
        engine: &Engine,
        trx: &Arc<Trx>,
        view: &ReadView,
        mtr: &mut Mtr,
    ) -> DbResult<Option<Tuple>> {
        let cur = self.pcur.pos.expect("on a user record");
        let frame = mtr.frame(cur.slot);
        let stored = page::rec_to_tuple(frame, cur.rec);
        let marked = page::rec_is_delete_marked(frame, cur.rec);

        match self.lock {
            Some(mode) => {
                let page_id = mtr.page_id(cur.slot);
                let heap = page::rec_heap_no(frame, cur.rec);
                match engine.lock_sys.lock_record(
                    trx.id(),
                    page_id,
                    heap,
                    mode,
                    0,
                    engine.lock_wait_timeout(),
                )? {
                    LockReply::Granted => {}
                    LockReply::Waiting => return Err(DbError::LockWait),
                }
                if marked {
                    return Ok(None);
                }
                Ok(Some(row_from_stored(&self.clustered, &stored)))
            }
            None => match visible_version(&engine.pool, &self.clustered, &stored, marked, view)? {
                Some((version, false)) => Ok(Some(row_from_stored(&self.clustered, &version))),
                _ => Ok(None),
            },
        }
    }
}
