//! Swap backends
//!
//! The page pool persists evicted pages through a host-provided backend
//! implementing [`SwapBackend`]. Two implementations ship with the
//! emulator:
//! - [`RamSwap`]: pages parked in a host-side map. Useful on hosts with
//!   plenty of RAM and in tests; pointless on the microcontrollers the
//!   emulator targets.
//! - [`DirSwap`]: one file per page under a directory, the shape an SD
//!   card swap area takes.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;

use crate::config::PAGE_SIZE;
use crate::error::{KernelError, Result};
use crate::memory::PageId;

/// Store for evicted pages, keyed by page id.
///
/// `read_page` must be all-or-nothing: on error the destination buffer
/// is left untouched.
pub trait SwapBackend: Send {
    /// Persist one page image.
    fn write_page(&mut self, id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()>;

    /// Restore one page image into `dst`.
    fn read_page(&mut self, id: PageId, dst: &mut [u8; PAGE_SIZE]) -> Result<()>;

    /// Drop the stored image for one page. Missing entries are an error.
    fn remove_page(&mut self, id: PageId) -> Result<()>;

    /// Drop every stored image.
    fn clear(&mut self) -> Result<()>;
}

/// Host-RAM swap area.
#[derive(Default)]
pub struct RamSwap {
    pages: HashMap<u32, Box<[u8; PAGE_SIZE]>>,
}

impl RamSwap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pages currently parked in the backend.
    pub fn stored_pages(&self) -> usize {
        self.pages.len()
    }
}

impl SwapBackend for RamSwap {
    fn write_page(&mut self, id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        self.pages.insert(id.raw(), Box::new(*data));
        Ok(())
    }

    fn read_page(&mut self, id: PageId, dst: &mut [u8; PAGE_SIZE]) -> Result<()> {
        match self.pages.get(&id.raw()) {
            Some(stored) => {
                dst.copy_from_slice(&stored[..]);
                Ok(())
            }
            None => Err(KernelError::NotFound),
        }
    }

    fn remove_page(&mut self, id: PageId) -> Result<()> {
        match self.pages.remove(&id.raw()) {
            Some(_) => Ok(()),
            None => Err(KernelError::NotFound),
        }
    }

    fn clear(&mut self) -> Result<()> {
        self.pages.clear();
        Ok(())
    }
}

/// File-per-page swap area under a directory the backend owns.
///
/// The directory is created on construction if missing. Page `n` lives
/// at `<dir>/<n:08x>.page`.
pub struct DirSwap {
    dir: PathBuf,
}

impl DirSwap {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|_| KernelError::Io)?;
        Ok(Self { dir })
    }

    fn page_path(&self, id: PageId) -> PathBuf {
        self.dir.join(format!("{:08x}.page", id.raw()))
    }
}

impl SwapBackend for DirSwap {
    fn write_page(&mut self, id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut file = fs::File::create(self.page_path(id)).map_err(|_| KernelError::Io)?;
        file.write_all(data).map_err(|_| KernelError::Io)
    }

    fn read_page(&mut self, id: PageId, dst: &mut [u8; PAGE_SIZE]) -> Result<()> {
        // Read into a scratch buffer first so a short or failed read
        // leaves `dst` untouched.
        let mut scratch = [0u8; PAGE_SIZE];
        let mut file = fs::File::open(self.page_path(id)).map_err(|_| KernelError::NotFound)?;
        file.read_exact(&mut scratch).map_err(|_| KernelError::Io)?;
        dst.copy_from_slice(&scratch);
        Ok(())
    }

    fn remove_page(&mut self, id: PageId) -> Result<()> {
        fs::remove_file(self.page_path(id)).map_err(|_| KernelError::NotFound)
    }

    fn clear(&mut self) -> Result<()> {
        let entries = fs::read_dir(&self.dir).map_err(|_| KernelError::Io)?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "page") {
                fs::remove_file(path).map_err(|_| KernelError::Io)?;
            }
        }
        Ok(())
    }
}
