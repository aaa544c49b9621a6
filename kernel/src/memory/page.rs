//! RAII page handle
//!
//! [`Page`] couples the lifetime of one pool slot to a value: opening
//! claims the slot, dropping returns it. Address spaces hold their
//! mappings as `Page` values so tearing a space down releases every slot
//! it owns.

use crate::error::Result;
use crate::memory::{self, PageId};

/// Owning handle to one slot in the process-wide page pool.
#[derive(Debug)]
pub struct Page {
    id: PageId,
}

impl Page {
    /// Claim a fresh zeroed page.
    pub fn new() -> Result<Self> {
        let id = memory::open_page()?;
        Ok(Self { id })
    }

    /// The pool slot this handle owns.
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Whether the page's image is currently in the swap backend.
    pub fn is_swapped(&self) -> bool {
        memory::is_swapped(self.id)
    }

    /// Evict this page to the swap backend.
    pub fn swap_out(&self) -> Result<()> {
        memory::swap_out(self.id)
    }

    /// Restore this page from the swap backend.
    pub fn swap_in(&self) -> Result<()> {
        memory::swap_in(self.id)
    }

    /// Read the page's user flag bits.
    pub fn flags(&self) -> Result<u16> {
        memory::flags(self.id)
    }

    /// Set the page's user flag bits.
    pub fn set_flags(&self, value: u16) -> Result<()> {
        memory::set_flags(self.id, value)
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        memory::close_page(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_releases_the_slot() {
        let id = {
            let page = Page::new().unwrap();
            assert!(!page.is_swapped());
            page.set_flags(0x1234).unwrap();
            page.id()
        };
        // The slot is free again (flag access fails) or was already
        // reclaimed by another owner (flags were reset on reopen);
        // either way our marker cannot survive the close.
        if let Ok(flags) = memory::flags(id) {
            assert_ne!(flags, 0x1234);
        }
    }

    #[test]
    fn two_open_pages_never_share_an_id() {
        let a = Page::new().unwrap();
        let b = Page::new().unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn flags_survive_swap() {
        let page = Page::new().unwrap();
        page.set_flags(0x0A0B).unwrap();
        page.swap_out().unwrap();
        assert_eq!(page.flags().unwrap(), 0x0A0B);
        page.swap_in().unwrap();
        assert_eq!(page.flags().unwrap(), 0x0A0B);
    }
}
