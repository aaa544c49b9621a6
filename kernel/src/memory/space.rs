//! Guest address spaces
//!
//! An [`AddressSpace`] is a sparse map from page-aligned guest addresses
//! to owned pool pages. It provides the byte and bulk accessors the
//! interpreter and the syscall layer use, with the residency rules the
//! scheduler relies on:
//!
//! - writes allocate missing pages and swap resident-but-evicted pages
//!   back in; a write can never be silently lost
//! - reads from unmapped pages yield zero without faulting
//! - reads from swapped pages transparently swap the page back in
//!
//! Dropping a space releases every page it owns.

use std::collections::BTreeMap;

use log::trace;

use crate::config::{PAGE_SIZE, RESIDENT_TARGET};
use crate::error::{KernelError, Result};
use crate::memory::{self, Page, PageId};

/// Page-aligned base of the page containing `addr`.
pub fn page_start(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

/// Offset of `addr` within its page.
pub fn page_offset(addr: u64) -> usize {
    (addr & (PAGE_SIZE as u64 - 1)) as usize
}

/// Sparse guest-virtual → page mapping.
#[derive(Default)]
pub struct AddressSpace {
    pages: BTreeMap<u64, Page>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a fresh zeroed page at the page containing `addr`.
    ///
    /// Fails with `Exists` if that page is already mapped and
    /// `OutOfMemory` if the pool is saturated.
    pub fn allocate_page(&mut self, addr: u64) -> Result<PageId> {
        let base = page_start(addr);
        if self.pages.contains_key(&base) {
            return Err(KernelError::Exists);
        }
        let page = Page::new()?;
        let id = page.id();
        self.pages.insert(base, page);
        Ok(id)
    }

    /// Map the page containing `addr` if it is not mapped yet.
    /// Idempotent; returns the backing page id either way.
    pub fn ensure_page(&mut self, addr: u64) -> Result<PageId> {
        let base = page_start(addr);
        if let Some(page) = self.pages.get(&base) {
            return Ok(page.id());
        }
        self.allocate_page(base)
    }

    /// Unmap the page containing `addr`, returning its slot to the pool.
    /// No-op when unmapped.
    pub fn deallocate_page(&mut self, addr: u64) {
        self.pages.remove(&page_start(addr));
    }

    /// Backing page id for `addr`, if mapped.
    pub fn lookup(&self, addr: u64) -> Option<PageId> {
        self.pages.get(&page_start(addr)).map(Page::id)
    }

    /// Whether every page overlapping `[addr, addr + len)` is mapped.
    pub fn is_range_mapped(&self, addr: u64, len: usize) -> bool {
        if len == 0 {
            return true;
        }
        let mut base = page_start(addr);
        let last = page_start(addr + (len as u64 - 1));
        loop {
            if !self.pages.contains_key(&base) {
                return false;
            }
            if base == last {
                return true;
            }
            base += PAGE_SIZE as u64;
        }
    }

    /// Read one guest byte. Unmapped pages read as zero; swapped pages
    /// are brought back in first.
    pub fn read_byte(&mut self, addr: u64) -> u8 {
        let mut byte = [0u8; 1];
        self.memcpy_out(&mut byte, addr);
        byte[0]
    }

    /// Write one guest byte, allocating the page if needed.
    pub fn write_byte(&mut self, addr: u64, value: u8) -> Result<()> {
        self.memcpy_in(addr, &[value])
    }

    /// Copy guest memory into `dst`, crossing pages as needed.
    /// Bytes on unmapped pages read as zero.
    pub fn memcpy_out(&mut self, dst: &mut [u8], src_addr: u64) {
        let mut addr = src_addr;
        let mut done = 0usize;
        while done < dst.len() {
            let offset = page_offset(addr);
            let chunk = (PAGE_SIZE - offset).min(dst.len() - done);
            match self.resident_page(addr) {
                Some(id) => {
                    // The page was just made resident; a failure here
                    // means the pool was mutated underneath us.
                    if memory::read_slice(id, offset, &mut dst[done..done + chunk]).is_err() {
                        dst[done..done + chunk].fill(0);
                    }
                }
                None => dst[done..done + chunk].fill(0),
            }
            addr += chunk as u64;
            done += chunk;
        }
    }

    /// Copy `src` into guest memory, allocating missing pages and
    /// swapping evicted ones back in.
    pub fn memcpy_in(&mut self, dst_addr: u64, src: &[u8]) -> Result<()> {
        let mut addr = dst_addr;
        let mut done = 0usize;
        while done < src.len() {
            let offset = page_offset(addr);
            let chunk = (PAGE_SIZE - offset).min(src.len() - done);
            let id = self.ensure_page(addr)?;
            memory::swap_in(id)?;
            memory::write_slice(id, offset, &src[done..done + chunk])?;
            addr += chunk as u64;
            done += chunk;
        }
        Ok(())
    }

    /// Fill `len` guest bytes with `value`, allocating pages as needed.
    pub fn memset(&mut self, addr: u64, value: u8, len: usize) -> Result<()> {
        let fill = [value; PAGE_SIZE];
        let mut addr = addr;
        let mut left = len;
        while left > 0 {
            let offset = page_offset(addr);
            let chunk = (PAGE_SIZE - offset).min(left);
            let id = self.ensure_page(addr)?;
            memory::swap_in(id)?;
            memory::write_slice(id, offset, &fill[..chunk])?;
            addr += chunk as u64;
            left -= chunk;
        }
        Ok(())
    }

    /// Snapshot of the full page containing `addr`, or `None` if the
    /// page is unmapped. Swapped pages are brought back in first.
    pub fn page_data(&mut self, addr: u64) -> Option<[u8; PAGE_SIZE]> {
        let id = self.resident_page(addr)?;
        let mut data = [0u8; PAGE_SIZE];
        memory::read_slice(id, 0, &mut data).ok()?;
        Some(data)
    }

    /// Bring every page of this space into RAM.
    pub fn swap_in_all(&mut self) -> Result<()> {
        for page in self.pages.values() {
            page.swap_in()?;
        }
        Ok(())
    }

    /// Evict every page of this space to the swap backend.
    pub fn swap_out_all(&mut self) -> Result<()> {
        for page in self.pages.values() {
            page.swap_out()?;
        }
        if self.pages.len() > RESIDENT_TARGET {
            trace!(
                "evicted {} pages (window peak above the {}-page resident target)",
                self.pages.len(),
                RESIDENT_TARGET
            );
        }
        Ok(())
    }

    /// Number of mapped pages.
    pub fn mapped_pages(&self) -> usize {
        self.pages.len()
    }

    /// Page-aligned bases of every mapped page, in address order.
    pub fn mapped_bases(&self) -> impl Iterator<Item = u64> + '_ {
        self.pages.keys().copied()
    }

    /// Backing page for `addr` with its buffer resident, or `None` if
    /// unmapped or the swap-in failed.
    fn resident_page(&mut self, addr: u64) -> Option<PageId> {
        let id = self.lookup(addr)?;
        if memory::is_swapped(id) {
            memory::swap_in(id).ok()?;
        }
        Some(id)
    }
}
