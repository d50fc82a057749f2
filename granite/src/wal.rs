//! The redo log.
//!
//! Mini-transactions append their redo records as one atomic frame to the
//! global log buffer, consuming a contiguous LSN range. A background writer
//! drains the buffer to the log file; commits wait on the writer according to
//! the `flush_at_commit` policy. The file begins with a 512-byte header
//! holding two alternating checkpoint slots; recovery starts from the most
//! recent valid one.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crc32fast::Hasher;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::errors::DbResult;
use crate::sync::{LatchRank, RankGuard};
use crate::{Lsn, PageId, PageNo, SpaceId};

/// Size of the log file header holding the checkpoint slots.
pub const LOG_HEADER_SIZE: u64 = 512;

/// The first LSN ever issued.
pub const LOG_START_LSN: Lsn = LOG_HEADER_SIZE;

const LOG_MAGIC: u64 = 0x4752_414e_4c4f_4731; // "GRANLOG1"
const CHECKPOINT_SLOT_1: u64 = 128;
const CHECKPOINT_SLOT_2: u64 = 256;

/// Per-frame header: total length (including this header) and a CRC32 of the
/// payload. A frame is the atomic unit of recovery: a mini-transaction's
/// record group applies fully or not at all.
const FRAME_HDR_SIZE: usize = 8;

/// A typed, self-describing page mutation. Every record addresses its target
/// by `(space, page_no)`; recovery replays records idempotently using the
/// page's stored LSN as a high-water mark.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RedoRecord {
    Write1 {
        space: SpaceId,
        page_no: PageNo,
        offset: u16,
        value: u8,
    },
    Write2 {
        space: SpaceId,
        page_no: PageNo,
        offset: u16,
        value: u16,
    },
    Write4 {
        space: SpaceId,
        page_no: PageNo,
        offset: u16,
        value: u32,
    },
    Write8 {
        space: SpaceId,
        page_no: PageNo,
        offset: u16,
        value: u64,
    },
    WriteString {
        space: SpaceId,
        page_no: PageNo,
        offset: u16,
        bytes: Vec<u8>,
    },
    /// Reinitialize an index page (header, infimum/supremum, directory).
    PageCreate {
        space: SpaceId,
        page_no: PageNo,
        index_id: u64,
        level: u16,
    },
    /// Initialize the bare file header of a non-index page.
    PageInit {
        space: SpaceId,
        page_no: PageNo,
        page_type: u16,
    },
}

impl RedoRecord {
    pub fn page_id(&self) -> PageId {
        match *self {
            RedoRecord::Write1 { space, page_no, .. }
            | RedoRecord::Write2 { space, page_no, .. }
            | RedoRecord::Write4 { space, page_no, .. }
            | RedoRecord::Write8 { space, page_no, .. }
            | RedoRecord::WriteString { space, page_no, .. }
            | RedoRecord::PageCreate { space, page_no, .. }
            | RedoRecord::PageInit { space, page_no, .. } => PageId::new(space, page_no),
        }
    }
}

/// `flush_at_commit` policy: 0 = no wait, 1 = write and fsync, 2 = write
/// without fsync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushAtCommit {
    None,
    Fsync,
    WriteOnly,
}

impl FlushAtCommit {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => FlushAtCommit::None,
            2 => FlushAtCommit::WriteOnly,
            _ => FlushAtCommit::Fsync,
        }
    }
}

struct LogInner {
    file: File,
    /// Bytes appended but not yet written to the file.
    buf: Vec<u8>,
    /// LSN of `buf[0]`.
    buf_start_lsn: Lsn,
    /// Next LSN to be issued.
    lsn: Lsn,
    /// Highest LSN durably written (and fsynced).
    synced_lsn: Lsn,
    /// Highest LSN written to the file, fsynced or not.
    written_lsn: Lsn,
    next_checkpoint_no: u64,
    last_checkpoint_lsn: Lsn,
}

/// The global log system.
pub struct LogSys {
    path: PathBuf,
    inner: Mutex<LogInner>,
    /// Mirror of the current LSN for lock-free rate sampling.
    lsn_hint: AtomicU64,
    pub capacity: u64,
    writer_stop: Arc<AtomicBool>,
    writer_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl LogSys {
    /// Opens the log for appending at `resume_lsn` (the end of the valid
    /// redo as determined by recovery). Stale bytes past that point are
    /// truncated. Creates and formats the file when absent.
    pub fn open<P: AsRef<Path>>(path: P, capacity: u64, resume_lsn: Lsn) -> DbResult<Arc<Self>> {
        let path_buf = path.as_ref().to_path_buf();
        let fresh = !path_buf.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path_buf)?;

        let (lsn, checkpoint_no, checkpoint_lsn) = if fresh {
            let mut header = vec![0u8; LOG_HEADER_SIZE as usize];
            header[..8].copy_from_slice(&LOG_MAGIC.to_be_bytes());
            file.write_all(&header)?;
            file.sync_all()?;
            info!("created redo log at {:?}", path_buf);
            (LOG_START_LSN, 1, LOG_START_LSN)
        } else {
            let (cp_lsn, cp_no) =
                read_last_checkpoint(&mut file)?.unwrap_or((LOG_START_LSN, 0));
            file.set_len(resume_lsn)?;
            file.sync_all()?;
            (resume_lsn, cp_no + 1, cp_lsn)
        };

        let log = Arc::new(Self {
            path: path_buf,
            inner: Mutex::new(LogInner {
                file,
                buf: Vec::new(),
                buf_start_lsn: lsn,
                lsn,
                synced_lsn: lsn,
                written_lsn: lsn,
                next_checkpoint_no: checkpoint_no,
                last_checkpoint_lsn: checkpoint_lsn,
            }),
            lsn_hint: AtomicU64::new(lsn),
            capacity,
            writer_stop: Arc::new(AtomicBool::new(false)),
            writer_handle: Mutex::new(None),
        });
        Ok(log)
    }

    /// Spawns the background writer that drains and fsyncs the log buffer.
    pub fn spawn_writer(self: &Arc<Self>) {
        let log = self.clone();
        let stop = self.writer_stop.clone();
        let handle = thread::Builder::new()
            .name("granite-log-writer".into())
            .spawn(move || {
                debug!("log writer started");
                while !stop.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(10));
                    if let Err(e) = log.flush_to_lsn(log.current_lsn(), true) {
                        warn!("log writer flush failed: {e}");
                    }
                }
                debug!("log writer stopped");
            })
            .expect("spawn log writer");
        *self.writer_handle.lock() = Some(handle);
    }

    /// Appends a committed mini-transaction's records as one frame.
    /// Returns the consumed `[start_lsn, end_lsn)` range.
    pub fn append_mtr(&self, records: &[RedoRecord]) -> DbResult<(Lsn, Lsn)> {
        debug_assert!(!records.is_empty());
        let payload = bincode::serialize(records).expect("redo records serialize");
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();
        let total_len = (FRAME_HDR_SIZE + payload.len()) as u32;

        let _rank = RankGuard::new(LatchRank::LogSys);
        let mut inner = self.inner.lock();
        let start_lsn = inner.lsn;
        inner.buf.extend_from_slice(&total_len.to_be_bytes());
        inner.buf.extend_from_slice(&crc.to_be_bytes());
        inner.buf.extend_from_slice(&payload);
        inner.lsn = start_lsn + total_len as u64;
        let end_lsn = inner.lsn;
        self.lsn_hint.store(end_lsn, Ordering::Relaxed);
        Ok((start_lsn, end_lsn))
    }

    pub fn current_lsn(&self) -> Lsn {
        self.lsn_hint.load(Ordering::Relaxed)
    }

    pub fn synced_lsn(&self) -> Lsn {
        self.inner.lock().synced_lsn
    }

    pub fn last_checkpoint_lsn(&self) -> Lsn {
        self.inner.lock().last_checkpoint_lsn
    }

    /// Writes buffered redo through `target` to the file; fsyncs if `sync`.
    pub fn flush_to_lsn(&self, target: Lsn, sync: bool) -> DbResult<()> {
        let _rank = RankGuard::new(LatchRank::LogSys);
        let mut inner = self.inner.lock();
        if !inner.buf.is_empty() && inner.written_lsn < target {
            let buf = std::mem::take(&mut inner.buf);
            let at = inner.buf_start_lsn;
            inner.file.seek(SeekFrom::Start(at))?;
            inner.file.write_all(&buf)?;
            inner.buf_start_lsn = at + buf.len() as u64;
            inner.written_lsn = inner.buf_start_lsn;
        }
        if sync && inner.synced_lsn < inner.written_lsn {
            inner.file.sync_all()?;
            inner.synced_lsn = inner.written_lsn;
        }
        Ok(())
    }

    /// Writes a checkpoint at `checkpoint_lsn` into the alternating slot
    /// pair and makes it durable. Recovery begins from the newest valid one.
    pub fn write_checkpoint(&self, checkpoint_lsn: Lsn) -> DbResult<()> {
        // All redo below the checkpoint must be durable first.
        self.flush_to_lsn(checkpoint_lsn, true)?;

        let _rank = RankGuard::new(LatchRank::LogSys);
        let mut inner = self.inner.lock();
        let no = inner.next_checkpoint_no;
        inner.next_checkpoint_no += 1;

        let mut slot = [0u8; 20];
        slot[..8].copy_from_slice(&no.to_be_bytes());
        slot[8..16].copy_from_slice(&checkpoint_lsn.to_be_bytes());
        let mut hasher = Hasher::new();
        hasher.update(&slot[..16]);
        slot[16..20].copy_from_slice(&hasher.finalize().to_be_bytes());

        let offset = if no % 2 == 0 {
            CHECKPOINT_SLOT_1
        } else {
            CHECKPOINT_SLOT_2
        };
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(&slot)?;
        inner.file.sync_all()?;
        inner.last_checkpoint_lsn = checkpoint_lsn;
        debug!("checkpoint {} written at lsn {}", no, checkpoint_lsn);
        Ok(())
    }

    pub fn shutdown(&self) {
        self.writer_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.writer_handle.lock().take() {
            let _ = handle.join();
        }
        let _ = self.flush_to_lsn(self.current_lsn(), true);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LogSys {
    fn drop(&mut self) {
        self.writer_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.writer_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Reads the newest valid checkpoint slot: `(checkpoint_lsn, checkpoint_no)`.
pub fn read_last_checkpoint(file: &mut File) -> DbResult<Option<(Lsn, u64)>> {
    let len = file.metadata()?.len();
    if len < LOG_HEADER_SIZE {
        return Ok(None);
    }
    let mut header = vec![0u8; LOG_HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header)?;

    let mut best: Option<(Lsn, u64)> = None;
    for offset in [CHECKPOINT_SLOT_1 as usize, CHECKPOINT_SLOT_2 as usize] {
        let slot = &header[offset..offset + 20];
        let no = u64::from_be_bytes(slot[..8].try_into().unwrap());
        let lsn = u64::from_be_bytes(slot[8..16].try_into().unwrap());
        let stored_crc = u32::from_be_bytes(slot[16..20].try_into().unwrap());
        let mut hasher = Hasher::new();
        hasher.update(&slot[..16]);
        if no == 0 || hasher.finalize() != stored_crc {
            continue;
        }
        if best.map_or(true, |(_, best_no)| no > best_no) {
            best = Some((lsn, no));
        }
    }
    Ok(best)
}

/// Scans frames from `from_lsn` until the end of valid redo. Returns the
/// parsed frames as `(start_lsn, end_lsn, records)` plus the end LSN.
/// An incomplete or corrupt tail frame terminates the scan: a group is
/// applied only when it was fully written.
pub fn scan_frames<P: AsRef<Path>>(
    path: P,
    from_lsn: Lsn,
) -> DbResult<(Vec<(Lsn, Lsn, Vec<RedoRecord>)>, Lsn)> {
    let mut file = match File::open(path.as_ref()) {
        Ok(f) => f,
        Err(_) => return Ok((Vec::new(), LOG_START_LSN)),
    };
    let file_len = file.metadata()?.len();
    let mut frames = Vec::new();
    let mut lsn = from_lsn.max(LOG_START_LSN);

    while lsn + FRAME_HDR_SIZE as u64 <= file_len {
        file.seek(SeekFrom::Start(lsn))?;
        let mut hdr = [0u8; FRAME_HDR_SIZE];
        if file.read_exact(&mut hdr).is_err() {
            break;
        }
        let total_len = u32::from_be_bytes(hdr[..4].try_into().unwrap()) as u64;
        let crc = u32::from_be_bytes(hdr[4..8].try_into().unwrap());
        if total_len <= FRAME_HDR_SIZE as u64 || lsn + total_len > file_len {
            break;
        }
        let mut payload = vec![0u8; total_len as usize - FRAME_HDR_SIZE];
        if file.read_exact(&mut payload).is_err() {
            break;
        }
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != crc {
            break;
        }
        let records: Vec<RedoRecord> = match bincode::deserialize(&payload) {
            Ok(r) => r,
            Err(_) => break,
        };
        let end_lsn = lsn + total_len;
        frames.push((lsn, end_lsn, records));
        lsn = end_lsn;
    }
    Ok((frames, lsn))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rec(offset: u16, value: u32) -> RedoRecord {
        RedoRecord::Write4 {
            space: 0,
            page_no: 9,
            offset,
            value,
        }
    }

    #[test]
    fn append_assigns_contiguous_lsn_ranges() {
        let dir = tempdir().unwrap();
        let log = LogSys::open(dir.path().join("redo.log"), 1 << 20, LOG_START_LSN).unwrap();

        let (s1, e1) = log.append_mtr(&[rec(10, 1)]).unwrap();
        let (s2, e2) = log.append_mtr(&[rec(20, 2), rec(30, 3)]).unwrap();
        assert_eq!(s1, LOG_START_LSN);
        assert_eq!(e1, s2);
        assert!(e2 > s2);
        assert_eq!(log.current_lsn(), e2);
    }

    #[test]
    fn frames_survive_flush_and_rescan() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redo.log");
        let end;
        {
            let log = LogSys::open(&path, 1 << 20, LOG_START_LSN).unwrap();
            log.append_mtr(&[rec(10, 1)]).unwrap();
            log.append_mtr(&[rec(20, 2)]).unwrap();
            end = log.current_lsn();
            log.flush_to_lsn(end, true).unwrap();
        }
        let (frames, scanned_end) = scan_frames(&path, LOG_START_LSN).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(scanned_end, end);
        assert_eq!(frames[0].2.len(), 1);
        assert_eq!(frames[1].2.len(), 1);
    }

    #[test]
    fn torn_tail_frame_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redo.log");
        let good_end;
        {
            let log = LogSys::open(&path, 1 << 20, LOG_START_LSN).unwrap();
            log.append_mtr(&[rec(10, 1)]).unwrap();
            good_end = log.current_lsn();
            log.append_mtr(&[rec(20, 2)]).unwrap();
            log.flush_to_lsn(log.current_lsn(), true).unwrap();
        }
        // Chop the second frame in half: the group terminator is missing.
        let full_len = std::fs::metadata(&path).unwrap().len();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len((good_end + (full_len - good_end) / 2).max(good_end))
            .unwrap();

        let (frames, scanned_end) = scan_frames(&path, LOG_START_LSN).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(scanned_end, good_end);
    }

    #[test]
    fn checkpoint_slots_alternate_and_newest_wins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redo.log");
        {
            let log = LogSys::open(&path, 1 << 20, LOG_START_LSN).unwrap();
            log.append_mtr(&[rec(10, 1)]).unwrap();
            let mid = log.current_lsn();
            log.write_checkpoint(mid).unwrap();
            log.append_mtr(&[rec(20, 2)]).unwrap();
            let end = log.current_lsn();
            log.write_checkpoint(end).unwrap();
        }
        let mut file = File::open(&path).unwrap();
        let (lsn, no) = read_last_checkpoint(&mut file).unwrap().unwrap();
        assert_eq!(no, 2);
        assert!(lsn > LOG_START_LSN);
    }
}
