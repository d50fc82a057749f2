//! Tablespace files: maps `(space_id, page_no)` to bytes on disk.
//!
//! Each tablespace is a single file of fixed-size pages. The registry routes
//! page I/O by space id and reports `TablespaceDeleted` once a space has been
//! dropped. Page 0 of every space is the file-space header; the system
//! tablespace additionally reserves the trx-sys page and the doublewrite
//! area.

use std::collections::{HashMap, HashSet};
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::{Mutex, RwLock};

use crate::errors::{DbError, DbResult};
use crate::sync::{LatchRank, RankGuard};
use crate::{PageId, PageNo, SpaceId, PAGE_SIZE};

/// The system tablespace.
pub const SYSTEM_SPACE_ID: SpaceId = 0;

/// Page 0 of every tablespace: the file-space header.
pub const FSP_HDR_PAGE_NO: PageNo = 0;

/// Page 5 of the system tablespace: the trx-sys page.
pub const TRX_SYS_PAGE_NO: PageNo = 5;

/// First page of the doublewrite area in the system tablespace.
pub const DOUBLEWRITE_FIRST_PAGE: PageNo = 64;

/// The doublewrite area spans two extents of 64 pages.
pub const DOUBLEWRITE_N_PAGES: usize = 128;

/// Initial size of the system tablespace: headers, trx-sys, doublewrite and
/// room for the first rollback segments.
pub const SYSTEM_SPACE_INITIAL_PAGES: PageNo =
    DOUBLEWRITE_FIRST_PAGE + DOUBLEWRITE_N_PAGES as PageNo + 64;

/// Initial size of a user tablespace.
pub const USER_SPACE_INITIAL_PAGES: PageNo = 4;

/// A single open tablespace file.
pub struct SpaceFile {
    pub space_id: SpaceId,
    file: File,
    pub size_in_pages: PageNo,
    /// Pages returned by deallocation, reused before extending the file.
    free_pages: Vec<PageNo>,
}

impl SpaceFile {
    fn create<P: AsRef<Path>>(path: P, space_id: SpaceId, initial_pages: PageNo) -> DbResult<Self> {
        let path_ref = path.as_ref();
        debug!("creating tablespace {} at {:?}", space_id, path_ref);
        if let Some(parent) = path_ref.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path_ref)?;
        file.set_len(initial_pages as u64 * PAGE_SIZE as u64)?;
        Ok(Self {
            space_id,
            file,
            size_in_pages: initial_pages,
            free_pages: Vec::new(),
        })
    }

    fn open<P: AsRef<Path>>(path: P, space_id: SpaceId) -> DbResult<Self> {
        let path_ref = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path_ref)?;
        let file_size = file.metadata()?.len();
        let size_in_pages = (file_size / PAGE_SIZE as u64) as PageNo;
        debug!(
            "opened tablespace {} at {:?}: {} pages",
            space_id, path_ref, size_in_pages
        );
        Ok(Self {
            space_id,
            file,
            size_in_pages,
            free_pages: Vec::new(),
        })
    }

    pub fn read_page(&mut self, page_no: PageNo, buf: &mut [u8]) -> DbResult<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        if page_no >= self.size_in_pages {
            // Reads past the high-water mark return a zeroed frame, the
            // state of a never-written extension page.
            buf.fill(0);
            return Ok(());
        }
        let offset = page_no as u64 * PAGE_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    pub fn write_page(&mut self, page_no: PageNo, buf: &[u8]) -> DbResult<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let offset = page_no as u64 * PAGE_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        if page_no >= self.size_in_pages {
            self.size_in_pages = page_no + 1;
        }
        Ok(())
    }

    /// Allocates a page: a previously freed page if available, otherwise the
    /// file is extended by one zero-filled page.
    pub fn allocate_page(&mut self) -> DbResult<PageNo> {
        if let Some(page_no) = self.free_pages.pop() {
            return Ok(page_no);
        }
        let page_no = self.size_in_pages;
        self.size_in_pages += 1;
        self.file
            .set_len(self.size_in_pages as u64 * PAGE_SIZE as u64)?;
        Ok(page_no)
    }

    /// Returns a page to the space free list for reuse.
    pub fn free_page(&mut self, page_no: PageNo) {
        debug_assert!(page_no < self.size_in_pages);
        self.free_pages.push(page_no);
    }

    pub fn sync(&mut self) -> DbResult<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// The registry of open tablespaces.
pub struct SpaceRegistry {
    base_dir: PathBuf,
    spaces: RwLock<HashMap<SpaceId, Arc<Mutex<SpaceFile>>>>,
    dropped: Mutex<HashSet<SpaceId>>,
}

impl SpaceRegistry {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> DbResult<Self> {
        create_dir_all(base_dir.as_ref())?;
        Ok(Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            spaces: RwLock::new(HashMap::new()),
            dropped: Mutex::new(HashSet::new()),
        })
    }

    fn space_path(&self, space_id: SpaceId) -> PathBuf {
        self.base_dir.join(format!("space_{space_id:08}.gdb"))
    }

    /// Opens the system tablespace, creating and formatting it on first use.
    /// Returns `true` if the space was newly created.
    pub fn open_or_create_system_space(&self) -> DbResult<bool> {
        let path = self.space_path(SYSTEM_SPACE_ID);
        let created = !path.exists();
        let space = if created {
            info!("bootstrapping system tablespace at {:?}", path);
            SpaceFile::create(&path, SYSTEM_SPACE_ID, SYSTEM_SPACE_INITIAL_PAGES)?
        } else {
            SpaceFile::open(&path, SYSTEM_SPACE_ID)?
        };
        self.spaces
            .write()
            .insert(SYSTEM_SPACE_ID, Arc::new(Mutex::new(space)));
        Ok(created)
    }

    pub fn create_space(&self, space_id: SpaceId) -> DbResult<()> {
        let _rank = RankGuard::new(LatchRank::Fsp);
        let path = self.space_path(space_id);
        let space = SpaceFile::create(&path, space_id, USER_SPACE_INITIAL_PAGES)?;
        self.dropped.lock().remove(&space_id);
        self.spaces
            .write()
            .insert(space_id, Arc::new(Mutex::new(space)));
        Ok(())
    }

    pub fn open_space(&self, space_id: SpaceId) -> DbResult<()> {
        let _rank = RankGuard::new(LatchRank::Fsp);
        if self.spaces.read().contains_key(&space_id) {
            return Ok(());
        }
        let path = self.space_path(space_id);
        let space = SpaceFile::open(&path, space_id)?;
        self.spaces
            .write()
            .insert(space_id, Arc::new(Mutex::new(space)));
        Ok(())
    }

    /// Drops a tablespace. Subsequent page access fails with
    /// `TablespaceDeleted`; the file is removed from disk.
    pub fn drop_space(&self, space_id: SpaceId) -> DbResult<()> {
        let _rank = RankGuard::new(LatchRank::Fsp);
        let removed = self.spaces.write().remove(&space_id);
        if removed.is_some() {
            self.dropped.lock().insert(space_id);
            std::fs::remove_file(self.space_path(space_id))?;
            info!("dropped tablespace {}", space_id);
        }
        Ok(())
    }

    fn space(&self, space_id: SpaceId) -> DbResult<Arc<Mutex<SpaceFile>>> {
        match self.spaces.read().get(&space_id) {
            Some(space) => Ok(space.clone()),
            None => Err(DbError::TablespaceDeleted { space: space_id }),
        }
    }

    pub fn space_exists(&self, space_id: SpaceId) -> bool {
        self.spaces.read().contains_key(&space_id)
    }

    pub fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> DbResult<()> {
        let _rank = RankGuard::new(LatchRank::Fsp);
        let space = self.space(page_id.space)?;
        let mut space = space.lock();
        space.read_page(page_id.page_no, buf)
    }

    pub fn write_page(&self, page_id: PageId, buf: &[u8]) -> DbResult<()> {
        let _rank = RankGuard::new(LatchRank::Fsp);
        let space = self.space(page_id.space)?;
        let mut space = space.lock();
        space.write_page(page_id.page_no, buf)
    }

    pub fn allocate_page(&self, space_id: SpaceId) -> DbResult<PageNo> {
        let _rank = RankGuard::new(LatchRank::Fsp);
        let space = self.space(space_id)?;
        let mut space = space.lock();
        space.allocate_page()
    }

    pub fn free_page(&self, page_id: PageId) -> DbResult<()> {
        let _rank = RankGuard::new(LatchRank::Fsp);
        let space = self.space(page_id.space)?;
        space.lock().free_page(page_id.page_no);
        Ok(())
    }

    pub fn size_of(&self, space_id: SpaceId) -> DbResult<PageNo> {
        let space = self.space(space_id)?;
        let size = space.lock().size_in_pages;
        Ok(size)
    }

    pub fn sync_space(&self, space_id: SpaceId) -> DbResult<()> {
        let _rank = RankGuard::new(LatchRank::Fsp);
        let space = self.space(space_id)?;
        let mut space = space.lock();
        space.sync()
    }

    pub fn sync_all(&self) -> DbResult<()> {
        let _rank = RankGuard::new(LatchRank::Fsp);
        let spaces: Vec<_> = self.spaces.read().values().cloned().collect();
        for space in spaces {
            space.lock().sync()?;
        }
        Ok(())
    }

    pub fn space_ids(&self) -> Vec<SpaceId> {
        let mut ids: Vec<_> = self.spaces.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn page_io_roundtrip() {
        let dir = tempdir().unwrap();
        let registry = SpaceRegistry::new(dir.path()).unwrap();
        registry.open_or_create_system_space().unwrap();

        let page_id = PageId::new(SYSTEM_SPACE_ID, 3);
        let mut buf = vec![0u8; PAGE_SIZE];
        buf[0] = 0xAB;
        buf[PAGE_SIZE - 1] = 0xCD;
        registry.write_page(page_id, &buf).unwrap();

        let mut read_buf = vec![0u8; PAGE_SIZE];
        registry.read_page(page_id, &mut read_buf).unwrap();
        assert_eq!(buf, read_buf);
    }

    #[test]
    fn read_past_end_yields_zeroed_frame() {
        let dir = tempdir().unwrap();
        let registry = SpaceRegistry::new(dir.path()).unwrap();
        registry.create_space(7).unwrap();

        let mut buf = vec![0xFFu8; PAGE_SIZE];
        registry
            .read_page(PageId::new(7, USER_SPACE_INITIAL_PAGES + 10), &mut buf)
            .unwrap();
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn dropped_space_reports_deleted() {
        let dir = tempdir().unwrap();
        let registry = SpaceRegistry::new(dir.path()).unwrap();
        registry.create_space(9).unwrap();
        registry.drop_space(9).unwrap();

        let mut buf = vec![0u8; PAGE_SIZE];
        let err = registry.read_page(PageId::new(9, 0), &mut buf).unwrap_err();
        assert!(matches!(err, DbError::TablespaceDeleted { space: 9 }));
    }

    #[test]
    fn freed_pages_are_reused() {
        let dir = tempdir().unwrap();
        let registry = SpaceRegistry::new(dir.path()).unwrap();
        registry.create_space(3).unwrap();

        let a = registry.allocate_page(3).unwrap();
        let b = registry.allocate_page(3).unwrap();
        assert_ne!(a, b);
        registry.free_page(PageId::new(3, a)).unwrap();
        let c = registry.allocate_page(3).unwrap();
        assert_eq!(a, c);
    }
}
