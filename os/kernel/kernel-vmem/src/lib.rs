//! # Page Table Manager
//!
//! Builds, walks and edits x86-64 four-level translation trees.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! Each 48-bit virtual address is divided into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The CPU uses these fields as indices into four levels of
//! [`PageTable`] nodes, 512 entries each:
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE   → maps 4 KiB page
//!   │        │        └────────────► PDE   → PS=1 → 2 MiB page
//!   │        └─────────────────────► PDPTE → PS=1 → 1 GiB page
//!   └──────────────────────────────► PML4E
//! ```
//!
//! ## What lives here
//!
//! - [`PageEntryBits`]: the raw entry layout shared by all levels.
//! - [`PageTable`] / [`PageTableLevel`]: one node and its position in the tree.
//! - [`AddressSpace`]: a tree rooted at one PML4 frame with `map_page`,
//!   `map_pages`, `unmap_page` and `get_physical_address`.
//! - [`FrameAlloc`] / [`PhysMapper`]: the two seams to the rest of the kernel.
//!   Table frames come from a `FrameAlloc`; they are reached through a
//!   `PhysMapper` (the higher-half direct map at runtime, simulated RAM in tests).
//! - [`bootstrap`]: the 1 GiB large-page identity map used before the frame
//!   bitmap exists.
//!
//! Intermediate nodes are allocated lazily on the first map through them and
//! stay in the tree after their last leaf is removed. Nothing in this crate
//! flushes the TLB; callers that change live translations must do so.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

pub mod address_space;
pub mod bootstrap;
mod page_entry_bits;
pub mod page_table;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use crate::address_space::{AddressSpace, MapError, UnmapError};
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::{PageTable, PageTableLevel, TableIndex};
pub use kernel_memory_addresses as addresses;

use crate::addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Source of physical 4 KiB frames for page-table nodes.
///
/// Returned frames must be 4 KiB aligned; their contents are unspecified and
/// the page-table code zeroes them before use.
pub trait FrameAlloc {
    /// Allocate one frame, or `None` when physical memory is exhausted.
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Return a frame previously obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, page: PhysicalPage<Size4K>);
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &mut A {
    #[inline]
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        (**self).alloc_4k()
    }

    #[inline]
    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        (**self).free_4k(page);
    }
}

/// Converts physical addresses to usable references in the current virtual
/// address space, e.g. through the higher-half direct map.
pub trait PhysMapper {
    /// # Safety
    /// - `pa` must be mapped writable through this mapper for the lifetime `'a`.
    /// - The bytes at `pa` must be a valid `T`, and no other live reference
    ///   may alias them while the returned one is in use.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

impl<M: PhysMapper + ?Sized> PhysMapper for &M {
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { (**self).phys_to_mut(pa) }
    }
}
