//! Crash recovery.
//!
//! Runs before the engine opens for business, directly against the data
//! files: torn pages are restored from the doublewrite area, redo frames
//! are scanned from the latest checkpoint and applied to every page whose
//! stored LSN is older, and the transaction table is rebuilt from the undo
//! logs left registered in the rseg slots. ACTIVE transactions are rolled
//! back; PREPARED ones are left for client resolution.

use std::collections::HashMap;
use std::path::Path;

use log::{debug, info, warn};

use crate::doublewrite::Doublewrite;
use crate::errors::DbResult;
use crate::page::{self, PageCheck};
use crate::tablespace::SpaceRegistry;
use crate::wal::{self, RedoRecord, LOG_START_LSN};
use crate::{Lsn, PageId, PAGE_SIZE};

#[derive(Debug, Default, Clone)]
pub struct RecoveryStats {
    pub torn_repaired: usize,
    pub frames_scanned: usize,
    pub pages_applied: usize,
    pub end_lsn: Lsn,
    pub resurrected_active: usize,
    pub resurrected_prepared: usize,
}

/// Applies one redo record to a raw page frame.
pub fn apply_redo(frame: &mut [u8], rec: &RedoRecord) {
    match rec {
        RedoRecord::Write1 { offset, value, .. } => {
            page::put_u8(frame, *offset as usize, *value);
        }
        RedoRecord::Write2 { offset, value, .. } => {
            page::put_u16(frame, *offset as usize, *value);
        }
        RedoRecord::Write4 { offset, value, .. } => {
            page::put_u32(frame, *offset as usize, *value);
        }
        RedoRecord::Write8 { offset, value, .. } => {
            page::put_u64(frame, *offset as usize, *value);
        }
        RedoRecord::WriteString { offset, bytes, .. } => {
            frame[*offset as usize..*offset as usize + bytes.len()].copy_from_slice(bytes);
        }
        RedoRecord::PageCreate {
            space,
            page_no,
            index_id,
            level,
        } => {
            page::page_create_raw(frame, PageId::new(*space, *page_no), *index_id, *level);
        }
        RedoRecord::PageInit {
            space,
            page_no,
            page_type,
        } => {
            frame.fill(0);
            page::put_u32(frame, page::FIL_PAGE_NO, *page_no);
            page::put_u32(frame, page::FIL_PAGE_PREV, crate::FIL_NULL);
            page::put_u32(frame, page::FIL_PAGE_NEXT, crate::FIL_NULL);
            page::put_u16(frame, page::FIL_PAGE_TYPE, *page_type);
            page::put_u32(frame, page::FIL_PAGE_SPACE_ID, *space);
        }
    }
}

/// Redo phase of recovery: doublewrite repair, checkpoint location, scan,
/// idempotent apply ordered by LSN per page. Returns the end of the valid
/// redo (the LSN the log resumes at) and statistics.
pub fn recover<P: AsRef<Path>>(
    spaces: &SpaceRegistry,
    log_path: P,
) -> DbResult<RecoveryStats> {
    let mut stats = RecoveryStats::default();

    // 1. Torn home pages are restored from the doublewrite area first, so
    //    redo applies onto consistent page images.
    stats.torn_repaired = Doublewrite::repair_torn_pages(spaces)?;

    // 2. Locate the most recent valid checkpoint.
    let checkpoint_lsn = match std::fs::File::open(log_path.as_ref()) {
        Ok(mut f) => wal::read_last_checkpoint(&mut f)?
            .map(|(lsn, _)| lsn)
            .unwrap_or(LOG_START_LSN),
        Err(_) => {
            stats.end_lsn = LOG_START_LSN;
            return Ok(stats);
        }
    };

    // 3. Scan forward, grouping parsed records by target page. Scan order
    //    is LSN order, so per-page vectors stay sorted.
    let (frames, end_lsn) = wal::scan_frames(log_path.as_ref(), checkpoint_lsn)?;
    stats.frames_scanned = frames.len();
    stats.end_lsn = end_lsn;
    let mut by_page: HashMap<PageId, Vec<(Lsn, RedoRecord)>> = HashMap::new();
    for (_, frame_end, records) in frames {
        for rec in records {
            by_page.entry(rec.page_id()).or_default().push((frame_end, rec));
        }
    }
    if by_page.is_empty() {
        return Ok(stats);
    }
    info!(
        "recovery: applying redo from checkpoint {} over {} pages",
        checkpoint_lsn,
        by_page.len()
    );

    // 4. Apply each record newer than the page's stored LSN.
    let mut frame = vec![0u8; PAGE_SIZE];
    for (page_id, records) in by_page {
        if !spaces.space_exists(page_id.space) {
            continue;
        }
        spaces.read_page(page_id, &mut frame)?;
        match page::page_verify(&frame) {
            PageCheck::Ok | PageCheck::Fresh => {}
            status => {
                // No doublewrite copy existed either; redo must rebuild the
                // page from its initialization record, or it is lost.
                warn!("recovery: page {} is {:?} before redo", page_id, status);
                frame.fill(0);
            }
        }
        let page_lsn = page::page_lsn(&frame);
        let mut applied = false;
        let mut last_lsn = page_lsn;
        for (rec_end_lsn, rec) in records {
            if rec_end_lsn > page_lsn {
                apply_redo(&mut frame, &rec);
                applied = true;
                last_lsn = rec_end_lsn;
            }
        }
        if applied {
            page::page_set_lsn(&mut frame, last_lsn);
            page::page_stamp_for_write(&mut frame);
            spaces.write_page(page_id, &frame)?;
            stats.pages_applied += 1;
        }
    }
    spaces.sync_all()?;
    info!(
        "recovery: {} pages brought forward, redo ends at {}",
        stats.pages_applied, stats.end_lsn
    );
    Ok(stats)
}

/// Undo phase: rebuilds the transaction table from the rseg slots and rolls
/// back transactions that were ACTIVE at the crash. PREPARED transactions
/// stay, waiting for the client to resolve them. Must run after the engine's
/// subsystems are up (the rollback goes through the B-tree).
pub fn resurrect_and_rollback(engine: &crate::engine::Engine) -> DbResult<(usize, usize)> {
    let mut active = 0usize;
    let mut prepared = 0usize;

    for rseg in engine.trx_sys.rsegs.iter() {
        for (slot, hdr_page) in crate::undo::rseg_scan_slots(&engine.pool, rseg)? {
            let info = crate::undo::undo_log_info(&engine.pool, hdr_page)?;
            match info.state {
                crate::undo::UNDO_STATE_PREPARED => {
                    info!(
                        "recovery: trx {} was PREPARED; left for resolution",
                        info.trx_id
                    );
                    prepared += 1;
                }
                crate::undo::UNDO_STATE_ACTIVE => {
                    debug!("recovery: rolling back trx {}", info.trx_id);
                    let mut records =
                        crate::undo::undo_log_records(&engine.pool, rseg.id, hdr_page)?;
                    records.sort_by(|a, b| b.1.undo_no.cmp(&a.1.undo_no));
                    for (_, rec) in &records {
                        crate::row::apply_undo(engine, rec)?;
                    }
                    let handle = crate::undo::UndoHandle {
                        rseg_id: rseg.id,
                        hdr_page,
                        slot,
                    };
                    if info.kind.is_insert() {
                        crate::undo::undo_finish_insert_at_commit(&engine.pool, rseg, &handle)?;
                    } else {
                        // Fully rolled back: immediately purgeable history.
                        crate::undo::undo_finish_update_at_commit(
                            &engine.pool,
                            rseg,
                            &handle,
                            0,
                        )?;
                    }
                    active += 1;
                }
                other => {
                    warn!(
                        "recovery: undo log at page {} in unexpected state {}; skipped",
                        hdr_page, other
                    );
                }
            }
        }
    }
    if active + prepared > 0 {
        info!(
            "recovery: {} transactions rolled back, {} left prepared",
            active, prepared
        );
    }
    Ok((active, prepared))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tablespace::SYSTEM_SPACE_ID;
    use crate::wal::LogSys;
    use tempfile::tempdir;

    #[test]
    fn redo_apply_respects_page_lsn_high_water() {
        let dir = tempdir().unwrap();
        let spaces = SpaceRegistry::new(dir.path()).unwrap();
        spaces.open_or_create_system_space().unwrap();
        let log_path = dir.path().join("redo.log");

        let page_id = PageId::new(SYSTEM_SPACE_ID, 40);
        let (first_end, second_end);
        {
            let log = LogSys::open(&log_path, 1 << 20, LOG_START_LSN).unwrap();
            let (_, e1) = log
                .append_mtr(&[RedoRecord::Write4 {
                    space: SYSTEM_SPACE_ID,
                    page_no: 40,
                    offset: page::PAGE_DATA as u16,
                    value: 0x1111,
                }])
                .unwrap();
            first_end = e1;
            let (_, e2) = log
                .append_mtr(&[RedoRecord::Write4 {
                    space: SYSTEM_SPACE_ID,
                    page_no: 40,
                    offset: page::PAGE_DATA as u16 + 4,
                    value: 0x2222,
                }])
                .unwrap();
            second_end = e2;
            log.flush_to_lsn(e2, true).unwrap();
        }

        // The page on disk already carries the first mtr's effect.
        let mut frame = vec![0u8; PAGE_SIZE];
        page::put_u32(&mut frame, page::FIL_PAGE_NO, 40);
        page::put_u32(&mut frame, page::FIL_PAGE_SPACE_ID, SYSTEM_SPACE_ID);
        page::put_u32(&mut frame, page::PAGE_DATA, 0x1111);
        page::page_set_lsn(&mut frame, first_end);
        page::page_stamp_for_write(&mut frame);
        spaces.write_page(page_id, &frame).unwrap();

        let stats = recover(&spaces, &log_path).unwrap();
        assert_eq!(stats.pages_applied, 1);
        assert_eq!(stats.end_lsn, second_end);

        let mut out = vec![0u8; PAGE_SIZE];
        spaces.read_page(page_id, &mut out).unwrap();
        assert_eq!(page::get_u32(&out, page::PAGE_DATA), 0x1111);
        assert_eq!(page::get_u32(&out, page::PAGE_DATA + 4), 0x2222);
        assert_eq!(page::page_lsn(&out), second_end);
        assert_eq!(page::page_verify(&out), PageCheck::Ok);
    }

    #[test]
    fn recovery_is_idempotent() {
        let dir = tempdir().unwrap();
        let spaces = SpaceRegistry::new(dir.path()).unwrap();
        spaces.open_or_create_system_space().unwrap();
        let log_path = dir.path().join("redo.log");
        {
            let log = LogSys::open(&log_path, 1 << 20, LOG_START_LSN).unwrap();
            log.append_mtr(&[RedoRecord::Write8 {
                space: SYSTEM_SPACE_ID,
                page_no: 41,
                offset: page::PAGE_DATA as u16,
                value: 77,
            }])
            .unwrap();
            log.flush_to_lsn(log.current_lsn(), true).unwrap();
        }

        let s1 = recover(&spaces, &log_path).unwrap();
        assert_eq!(s1.pages_applied, 1);
        // A second run finds nothing newer than the page LSN.
        let s2 = recover(&spaces, &log_path).unwrap();
        assert_eq!(s2.pages_applied, 0);

        let mut out = vec![0u8; PAGE_SIZE];
        spaces
            .read_page(PageId::new(SYSTEM_SPACE_ID, 41), &mut out)
            .unwrap();
        assert_eq!(page::get_u64(&out, page::PAGE_DATA), 77);
    }
}
