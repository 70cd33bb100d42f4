//! Kernel virtual range allocator.
//!
//! Hands out page-granular ranges of the kernel's on-demand window
//! (`KERNEL_VMM_BASE .. KERNEL_VMM_BASE + KERNEL_VMM_SIZE` at runtime). The
//! bookkeeping is a [`PageBitmap`] with one bit per window page, so the same
//! first-fit search serves both physical and virtual allocation.

use crate::bitmap::{BitmapError, InitialState, PageBitmap};
use kernel_memory_addresses::{PageSize, Size4K, VirtualAddress};

/// First-fit allocator over a fixed window of kernel virtual pages.
pub struct VirtualRangeAlloc<'buf> {
    base: VirtualAddress,
    pages: PageBitmap<'buf>,
}

impl<'buf> VirtualRangeAlloc<'buf> {
    /// Manage `pages` pages starting at `base`, all initially free.
    ///
    /// # Errors
    /// [`BitmapError::BufferTooSmall`] if `buffer` holds fewer than `pages` bits,
    /// or [`BitmapError::InvalidAddress`] if `base` is not page aligned or the
    /// window would wrap.
    pub fn new(base: VirtualAddress, pages: u64, buffer: &'buf mut [u8]) -> Result<Self, BitmapError> {
        let wraps = pages
            .checked_mul(Size4K::SIZE)
            .and_then(|bytes| base.checked_add(bytes))
            .is_none();
        if !base.is_aligned_to(Size4K::SIZE) || wraps {
            return Err(BitmapError::InvalidAddress {
                index: base.as_u64() >> Size4K::SHIFT,
                end: pages,
                len: 0,
            });
        }
        Ok(Self {
            base,
            pages: PageBitmap::new(pages, buffer, InitialState::AllFree)?,
        })
    }

    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    /// Exclusive end of the window.
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.base.as_u64() + self.pages.len() * Size4K::SIZE)
    }

    #[must_use]
    pub const fn free_pages(&self) -> u64 {
        self.pages.free_count()
    }

    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.base.as_u64() && va.as_u64() < self.end().as_u64()
    }

    /// Whether the page containing `va` is currently handed out.
    #[must_use]
    pub fn is_allocated(&self, va: VirtualAddress) -> bool {
        self.index_of(va).is_some_and(|i| self.pages.is_used(i))
    }

    /// Reserve `count` contiguous pages.
    pub fn alloc(&mut self, count: u64) -> Option<VirtualAddress> {
        self.alloc_aligned(count, Size4K::SIZE)
    }

    /// Reserve `count` contiguous pages whose start is a multiple of
    /// `alignment` bytes (a power of two; at least one page is implied).
    pub fn alloc_aligned(&mut self, count: u64, alignment: u64) -> Option<VirtualAddress> {
        if !alignment.is_power_of_two() {
            return None;
        }
        let align_pages = alignment.max(Size4K::SIZE) >> Size4K::SHIFT;
        let bias = self.base.as_u64() >> Size4K::SHIFT;
        let first = self.pages.find_free_run(count, align_pages, bias)?;
        self.pages.mark_range_used(first, count).ok()?;
        Some(self.base + (first << Size4K::SHIFT))
    }

    /// Return `count` pages starting at `va` to the window.
    ///
    /// # Errors
    /// [`BitmapError::InvalidAddress`] if the range is not page aligned or
    /// leaves the window; nothing is released in that case.
    pub fn free(&mut self, va: VirtualAddress, count: u64) -> Result<(), BitmapError> {
        let Some(first) = self.index_of(va).filter(|_| va.is_aligned_to(Size4K::SIZE)) else {
            return Err(BitmapError::InvalidAddress {
                index: va.as_u64() >> Size4K::SHIFT,
                end: (va.as_u64() >> Size4K::SHIFT).saturating_add(count),
                len: self.pages.len(),
            });
        };
        self.pages.mark_range_free(first, count)
    }

    fn index_of(&self, va: VirtualAddress) -> Option<u64> {
        self.contains(va)
            .then(|| (va.as_u64() - self.base.as_u64()) >> Size4K::SHIFT)
    }
}
