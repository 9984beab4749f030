use std::{
    fs::{File, OpenOptions},
    io::ErrorKind,
    os::unix::fs::FileExt,
    path::Path,
    sync::RwLock,
};

use log::debug;

use crate::{
    error::KvError,
    storage::page::{Page, PageId, INVALID_PAGE_ID, PAGE_SIZE},
    types::KvResult,
    utils::HandyRwLock,
};

struct DiskInner {
    file: File,
    /// The next page id to hand out. Initialized from the file size, so a
    /// reopened file continues where the last process stopped.
    next_page_id: PageId,
}

/// Whole-page reads and writes against the single data file. Reads share
/// the lock; writes, allocation and close are exclusive.
pub struct DiskManager {
    inner: RwLock<DiskInner>,
}

impl DiskManager {
    pub fn open<P: AsRef<Path>>(path: P) -> KvResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())?;
        let size = file.metadata()?.len();
        let next_page_id = size / PAGE_SIZE as u64;
        debug!(
            "data file opened, size: {}, next page id: {}",
            size, next_page_id
        );
        Ok(Self {
            inner: RwLock::new(DiskInner { file, next_page_id }),
        })
    }

    /// Read the page at offset `pid * PAGE_SIZE`. A read past the end of
    /// the file yields an all-zero page with that id.
    pub fn read_page(&self, pid: PageId) -> KvResult<Page> {
        Self::check_pid(pid)?;
        let inner = self.inner.rl();

        let mut buf = vec![0u8; PAGE_SIZE];
        let offset = pid * PAGE_SIZE as u64;
        let mut pos = 0;
        while pos < PAGE_SIZE {
            match inner.file.read_at(&mut buf[pos..], offset + pos as u64) {
                // end of file, the rest of the buffer stays zero
                Ok(0) => break,
                Ok(n) => pos += n,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(KvError::Io(e)),
            }
        }
        Page::from_bytes(pid, buf)
    }

    /// Write all `PAGE_SIZE` bytes of the page at its offset, then fsync
    /// the data. The caller clears the dirty flag on success.
    pub fn write_page(&self, page: &Page) -> KvResult {
        Self::check_pid(page.pid())?;
        let inner = self.inner.wl();
        let offset = page.pid() * PAGE_SIZE as u64;
        inner.file.write_all_at(page.data(), offset)?;
        inner.file.sync_data()?;
        Ok(())
    }

    /// Hand out the next page id. Serialized by the exclusive lock.
    pub fn allocate_page_id(&self) -> PageId {
        let mut inner = self.inner.wl();
        let pid = inner.next_page_id;
        inner.next_page_id += 1;
        pid
    }

    pub fn num_pages(&self) -> u64 {
        self.inner.rl().next_page_id
    }

    /// fsync including file metadata.
    pub fn sync(&self) -> KvResult {
        let inner = self.inner.wl();
        inner.file.sync_all()?;
        Ok(())
    }

    fn check_pid(pid: PageId) -> KvResult {
        if pid == INVALID_PAGE_ID {
            return Err(KvError::precondition(
                "the invalid page id sentinel cannot be read or written",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_past_eof_returns_zero_page() {
        let dir = tempfile::tempdir().unwrap();
        let dm = DiskManager::open(dir.path().join("data.db")).unwrap();

        let page = dm.read_page(3).unwrap();
        assert_eq!(page.pid(), 3);
        assert!(page.data().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_allocation_follows_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");

        let dm = DiskManager::open(&path).unwrap();
        assert_eq!(dm.allocate_page_id(), 0);
        assert_eq!(dm.allocate_page_id(), 1);

        let mut page = Page::empty(1);
        page.write_body(&[0xab; 16]).unwrap();
        dm.write_page(&page).unwrap();
        drop(dm);

        // two pages on disk now, a fresh manager continues at 2
        let dm = DiskManager::open(&path).unwrap();
        assert_eq!(dm.allocate_page_id(), 2);

        let read_back = dm.read_page(1).unwrap();
        assert_eq!(&read_back.data()[..16], &[0xab; 16]);
    }

    #[test]
    fn test_invalid_pid_is_a_precondition_error() {
        let dir = tempfile::tempdir().unwrap();
        let dm = DiskManager::open(dir.path().join("data.db")).unwrap();
        match dm.read_page(INVALID_PAGE_ID) {
            Err(KvError::Precondition(_)) => {}
            other => panic!("expected precondition error, got {:?}", other.map(|_| ())),
        }
    }
}
