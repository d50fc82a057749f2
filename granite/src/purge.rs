//! Purge: reclaims undo history no read view needs.
//!
//! The purge view is the oldest limit among open read views. Each rseg's
//! history list is walked from its oldest end; for every committed
//! transaction below the horizon, delete-marked clustered rows and their
//! stale secondary entries are physically removed, then the undo log pages
//! are freed and the history length drops by one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, trace};

use crate::btree::btr_delete_physical;
use crate::engine::Engine;
use crate::errors::DbResult;
use crate::page;
use crate::row;
use crate::transaction::field_u64;
use crate::undo::{self, UndoKind, UndoRec, UNDO_STATE_TO_PURGE};

#[derive(Default)]
pub struct PurgeSys {
    running: AtomicBool,
    pub logs_handled: AtomicU64,
    pub pages_handled: AtomicU64,
}

impl PurgeSys {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Runs one purge batch over every rseg, handling at most `n_max` undo
/// logs. Returns the number of logs reclaimed (history length decrease).
pub fn purge_run(engine: &Engine, n_max: usize) -> DbResult<usize> {
    if engine.purge.running.swap(true, Ordering::SeqCst) {
        return Ok(0); // a batch is already running
    }
    let result = purge_batch(engine, n_max);
    engine.purge.running.store(false, Ordering::SeqCst);
    result
}

fn purge_batch(engine: &Engine, n_max: usize) -> DbResult<usize> {
    let horizon = engine.trx_sys.purge_horizon();
    let mut handled = 0usize;

    for rseg in engine.trx_sys.rsegs.iter() {
        while handled < n_max {
            let Some((hdr_page, trx_no)) = undo::rseg_history_tail(&engine.pool, rseg)? else {
                break;
            };
            if trx_no >= horizon {
                trace!(
                    "rseg {}: history tail no {} not yet purgeable (horizon {})",
                    rseg.id,
                    trx_no,
                    horizon
                );
                break;
            }
            let info = undo::undo_log_info(&engine.pool, hdr_page)?;
            if info.state != UNDO_STATE_TO_PURGE {
                break;
            }

            let records = undo::undo_log_records(&engine.pool, rseg.id, hdr_page)?;
            for (_, rec) in &records {
                purge_record(engine, rec)?;
            }
            undo::undo_purge_oldest(&engine.pool, rseg, hdr_page)?;
            engine
                .purge
                .logs_handled
                .fetch_add(1, Ordering::Relaxed);
            handled += 1;
            debug!(
                "purged undo log of trx no {} from rseg {} ({} records)",
                trx_no,
                rseg.id,
                records.len()
            );
        }
    }
    Ok(handled)
}

/// Physically removes whatever a single committed undo record left behind
/// for purge: the delete-marked clustered row (DELETE_MARK) or obsolete
/// delete-marked secondary entries (ordering-field UPDATE).
fn purge_record(engine: &Engine, rec: &UndoRec) -> DbResult<usize> {
    let Some((clustered, secondaries)) = engine.index_set(rec.index_id) else {
        return Ok(0); // index dropped since
    };
    let key = page::Tuple::new(rec.key.clone());
    let mut removed = 0usize;

    match rec.kind {
        UndoKind::Insert => {} // insert-undo never reaches the history list
        UndoKind::DeleteMark => {
            // The row is removable only while it still carries this
            // transaction's delete mark; a later reinsert rewrote it.
            let current = row_current(engine, &clustered, &key)?;
            if let Some((stored, true)) = current {
                if field_u64(&stored, clustered.trx_id_pos()) == rec.trx_id {
                    let user_row = row::row_from_stored(&clustered, &stored);
                    for sec in &secondaries {
                        let entry = sec.entry_from_row(&clustered, &user_row);
                        if btr_delete_physical(
                            &sec.def,
                            &entry,
                            &engine.pool,
                            &engine.lock_sys,
                            &engine.tree_latches,
                            |frame, r| page::rec_is_delete_marked(frame, r),
                        )? {
                            removed += 1;
                        }
                    }
                    let trx_id = rec.trx_id;
                    let trx_pos = clustered.trx_id_pos();
                    if btr_delete_physical(
                        &clustered,
                        &key,
                        &engine.pool,
                        &engine.lock_sys,
                        &engine.tree_latches,
                        move |frame, r| {
                            page::rec_is_delete_marked(frame, r) && {
                                let stored = page::rec_to_tuple(frame, r);
                                field_u64(&stored, trx_pos) == trx_id
                            }
                        },
                    )? {
                        removed += 1;
                    }
                }
            }
        }
        UndoKind::UpdateExists => {
            if rec.ordering_old.is_empty() {
                return Ok(0); // no secondary churn to clean up
            }
            // Rebuild each secondary's old entry from the recorded ordering
            // pre-images plus the primary key, and drop it if still marked.
            for sec in &secondaries {
                let mut fields = Vec::with_capacity(sec.cols.len() + clustered.n_key_fields);
                let mut complete = true;
                for &c in &sec.cols {
                    match rec.ordering_old.iter().find(|(f, _)| *f as usize == c) {
                        Some((_, v)) => fields.push(v.clone()),
                        None => {
                            complete = false;
                            break;
                        }
                    }
                }
                if !complete {
                    continue;
                }
                fields.extend(rec.key.iter().cloned());
                let entry = page::Tuple::new(fields);
                if btr_delete_physical(
                    &sec.def,
                    &entry,
                    &engine.pool,
                    &engine.lock_sys,
                    &engine.tree_latches,
                    |frame, r| page::rec_is_delete_marked(frame, r),
                )? {
                    removed += 1;
                }
            }
        }
    }
    if removed > 0 {
        engine
            .purge
            .pages_handled
            .fetch_add(removed as u64, Ordering::Relaxed);
    }
    Ok(removed)
}

fn row_current(
    engine: &Engine,
    clustered: &crate::btree::IndexDef,
    key: &page::Tuple,
) -> DbResult<Option<(page::Tuple, bool)>> {
    use crate::btree::{btr_cursor_search, BtrLatch};
    let mut mtr = crate::mtr::Mtr::new();
    let cur = btr_cursor_search(
        clustered,
        key,
        page::SearchMode::GE,
        BtrLatch::SearchLeaf,
        &engine.pool,
        &mut mtr,
    )?;
    let frame = mtr.frame(cur.slot);
    let result = if cur.rec != page::INFIMUM_OFFSET
        && cur.rec != page::SUPREMUM_OFFSET
        && page::rec_is_user_rec(frame, cur.rec)
        && page::rec_cmp_with_tuple(frame, cur.rec, key, clustered.compare, clustered.n_key_fields)
            == std::cmp::Ordering::Equal
    {
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
