use crate::{error::KvError, types::KvResult};

pub const PAGE_SIZE: usize = 4096;

/// Caps on a single entry's encoded size. Together with the slot and
/// header overhead they guarantee that a one-entry leaf always fits a
/// page; larger entries are rejected at operation time.
pub const MAX_KEY_LEN: usize = 1024;
pub const MAX_VALUE_LEN: usize = 2048;

pub type PageId = u64;

/// Sentinel meaning "no page". Matches the all-ones pattern a signed -1
/// writes on disk.
pub const INVALID_PAGE_ID: PageId = u64::MAX;

/// Page 0 holds the root page id and nothing else.
pub const METADATA_PAGE_ID: PageId = 0;

/// A fixed-size page image plus its cache bookkeeping. The buffer pool
/// hands pages out wrapped in `Pod<Page>`; the page's own lock protects
/// the buffer, the pin count and the dirty flag.
pub struct Page {
    pid: PageId,
    data: Vec<u8>,
    dirty: bool,
    pin_count: u32,
}

impl Page {
    pub fn empty(pid: PageId) -> Self {
        Self {
            pid,
            data: vec![0; PAGE_SIZE],
            dirty: false,
            pin_count: 0,
        }
    }

    pub fn from_bytes(pid: PageId, data: Vec<u8>) -> KvResult<Self> {
        if data.len() != PAGE_SIZE {
            return Err(KvError::precondition(format!(
                "page image must be {} bytes, got {}",
                PAGE_SIZE,
                data.len()
            )));
        }
        Ok(Self {
            pid,
            data,
            dirty: false,
            pin_count: 0,
        })
    }

    pub fn pid(&self) -> PageId {
        self.pid
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Overwrite the page body, zero-padding the tail. Rejects bodies that
    /// do not fit the fixed page size.
    pub fn write_body(&mut self, body: &[u8]) -> KvResult {
        if body.len() > PAGE_SIZE {
            return Err(KvError::precondition(format!(
                "node image of {} bytes exceeds the {} byte page {}",
                body.len(),
                PAGE_SIZE,
                self.pid
            )));
        }
        self.data[..body.len()].copy_from_slice(body);
        for b in &mut self.data[body.len()..] {
            *b = 0;
        }
        self.dirty = true;
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    pub fn pin(&mut self) {
        self.pin_count += 1;
    }

    /// Caller must hold a pin; the buffer pool checks before calling.
    pub fn unpin(&mut self) {
        debug_assert!(self.pin_count > 0);
        self.pin_count -= 1;
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count
    }
}
