//! Paged memory subsystem
//!
//! This module provides the two-tier (RAM + swap) page store and the
//! sparse guest address spaces built on top of it:
//! - `pool`: the process-wide pool of fixed-size page slots
//! - `page`: RAII handle over one pool slot
//! - `space`: sparse guest-virtual → page mapping with bulk accessors
//! - `swap`: the host-provided backend the pool evicts pages into
//!
//! # Design
//! - One pool per host process, hidden behind accessor functions; every
//!   address space and every interpreter memory access is mediated by it.
//! - Residency is explicit: the scheduler brackets each tick window with
//!   swap-in-all / swap-out-all, and the accessors fault pages back in
//!   on demand between windows.
//! - No sentinel bytes: all payload access is `Result`-checked.

pub mod page;
pub mod pool;
pub mod space;
pub mod swap;

pub use page::Page;
pub use pool::{PagePool, PageId};
pub use space::AddressSpace;
pub use swap::{DirSwap, RamSwap, SwapBackend};

use crate::config::MAX_PAGES;
use crate::error::Result;

/// Process-wide page pool (initialized on first use).
static PAGE_POOL: spin::Once<spin::Mutex<PagePool>> = spin::Once::new();

/// Install a swap backend before the pool is first touched.
///
/// Returns `false` when the pool already exists (the backend is dropped
/// and the established pool keeps its store). Intended to be called once
/// at process entry; everything else goes through the accessors below.
pub fn init_swap_backend(backend: Box<dyn SwapBackend>) -> bool {
    let mut installed = false;
    PAGE_POOL.call_once(|| {
        installed = true;
        spin::Mutex::new(PagePool::new(MAX_PAGES, backend))
    });
    installed
}

fn pool() -> &'static spin::Mutex<PagePool> {
    PAGE_POOL.call_once(|| spin::Mutex::new(PagePool::new(MAX_PAGES, Box::new(RamSwap::new()))))
}

/// Claim a page slot from the process-wide pool.
pub fn open_page() -> Result<PageId> {
    pool().lock().open_page()
}

/// Return a slot to the process-wide pool.
pub fn close_page(id: PageId) {
    pool().lock().close_page(id);
}

/// Evict one page to the swap backend.
pub fn swap_out(id: PageId) -> Result<()> {
    pool().lock().swap_out(id)
}

/// Restore one page from the swap backend.
pub fn swap_in(id: PageId) -> Result<()> {
    pool().lock().swap_in(id)
}

/// Whether a page's image currently lives in the swap backend.
pub fn is_swapped(id: PageId) -> bool {
    pool().lock().is_swapped(id)
}

/// Read one byte of a resident page.
pub fn read_byte(id: PageId, offset: usize) -> Result<u8> {
    pool().lock().read_byte(id, offset)
}

/// Write one byte of a resident page.
pub fn write_byte(id: PageId, offset: usize, value: u8) -> Result<()> {
    pool().lock().write_byte(id, offset, value)
}

/// Copy out of a resident page.
pub fn read_slice(id: PageId, offset: usize, dst: &mut [u8]) -> Result<()> {
    pool().lock().read_slice(id, offset, dst)
}

/// Copy into a resident page.
pub fn write_slice(id: PageId, offset: usize, src: &[u8]) -> Result<()> {
    pool().lock().write_slice(id, offset, src)
}

/// Read a page's 16 user flag bits.
pub fn flags(id: PageId) -> Result<u16> {
    pool().lock().flags(id)
}

/// Set a page's 16 user flag bits.
pub fn set_flags(id: PageId, value: u16) -> Result<()> {
    pool().lock().set_flags(id, value)
}

/// Number of claimed slots in the process-wide pool.
pub fn live_pages() -> usize {
    pool().lock().live_pages()
}

/// Number of claimed slots currently resident in RAM.
pub fn resident_pages() -> usize {
    pool().lock().resident_pages()
}
