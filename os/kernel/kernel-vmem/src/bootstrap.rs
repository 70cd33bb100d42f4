//! # Early-Boot Mapping
//!
//! Before the frame bitmap exists the kernel still needs page tables. A
//! [`BootstrapFrameAlloc`] hands out frames from a small reserved physical
//! window, and [`map_first_gib`] uses them to install two 1 GiB leaves:
//!
//! ```text
//! VA 0x0000_0000_0000_0000 ─┐
//!                           ├──► PA 0x0000_0000 .. 0x4000_0000
//! VA HHDM_BASE             ─┘
//! ```
//!
//! The identity half keeps the paging switch executable; the linear half lets
//! the bitmap and the first page-table nodes be reached through
//! [`HHDM_BASE`]. Once the bitmap-backed allocator is up, no further large
//! pages are created.

use crate::addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use crate::{AddressSpace, FrameAlloc, MapError, PageEntryBits, PhysMapper};
use kernel_info::memory::{BOOTSTRAP_IDENTITY_BYTES, HHDM_BASE};

/// A bump allocator over `[next, end)` that never reuses frames.
#[derive(Debug)]
pub struct BootstrapFrameAlloc {
    next: PhysicalAddress,
    end: PhysicalAddress,
}

impl BootstrapFrameAlloc {
    /// Hand out the 4 KiB frames fully contained in `[start, end)`.
    #[must_use]
    pub const fn new(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        let aligned = match kernel_memory_addresses::align_up(start.as_u64(), Size4K::SIZE) {
            Some(v) => v,
            None => end.as_u64(),
        };
        Self {
            next: PhysicalAddress::new(aligned),
            end,
        }
    }

    /// The first frame not yet handed out; everything below it is in use.
    #[must_use]
    pub const fn watermark(&self) -> PhysicalAddress {
        self.next
    }
}

impl FrameAlloc for BootstrapFrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        let next = self.next.checked_add(Size4K::SIZE)?;
        if next > self.end {
            return None;
        }
        let page = PhysicalPage::from_aligned(self.next)?;
        self.next = next;
        Some(page)
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        log::warn!("bootstrap allocator cannot release {page:?}; frame stays reserved");
    }
}

/// Identity-map the first GiB of RAM and alias it at [`HHDM_BASE`].
///
/// # Errors
/// Fails if `alloc` runs dry or either slot already holds a smaller mapping.
pub fn map_first_gib<M: PhysMapper, A: FrameAlloc>(
    space: &mut AddressSpace<'_, M>,
    alloc: &mut A,
) -> Result<(), MapError> {
    // Boot code executes out of this window, so it stays executable.
    let flags = PageEntryBits::new()
        .with_present(true)
        .with_writable(true)
        .with_global_translation(true);
    debug_assert_eq!(BOOTSTRAP_IDENTITY_BYTES, crate::addresses::Size1G::SIZE);

    space.map_huge_1g(alloc, VirtualAddress::zero(), PhysicalAddress::zero(), flags)?;
    space.map_huge_1g(alloc, VirtualAddress::new(HHDM_BASE), PhysicalAddress::zero(), flags)?;
    log::info!(
        "bootstrap: first {} MiB identity-mapped and aliased at {:#x}",
        BOOTSTRAP_IDENTITY_BYTES >> 20,
        HHDM_BASE
    );
    Ok(())
}
