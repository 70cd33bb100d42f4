//! # Physical Frame Allocator
//!
//! First-fit allocation of 4 KiB frames over a [`PageBitmap`]. Frame `n`
//! covers physical addresses `n * 4096 .. (n + 1) * 4096`.
//!
//! The allocator itself is not synchronized. The kernel keeps exactly one,
//! behind a [`PhysicalMemory`] lock, and lends it to the page-table code
//! through [`SharedFrameAlloc`], which takes the lock once per frame.

use crate::bitmap::{BitmapError, InitialState, PageBitmap};
use kernel_info::boot::{MemoryRegion, highest_address};
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size4K, align_down, align_up, pages_for,
};
use kernel_vmem::FrameAlloc;

/// The kernel-wide physical allocator behind its lock.
pub type PhysicalMemory<'buf> = spin::Mutex<BitmapFrameAlloc<'buf>>;

/// Bitmap-backed frame allocator.
pub struct BitmapFrameAlloc<'buf> {
    bitmap: PageBitmap<'buf>,
}

impl<'buf> BitmapFrameAlloc<'buf> {
    /// Track `total_frames` frames starting at physical address 0.
    ///
    /// # Errors
    /// [`BitmapError::BufferTooSmall`] if `buffer` cannot hold one bit per frame.
    pub fn new(total_frames: u64, buffer: &'buf mut [u8], initial: InitialState) -> Result<Self, BitmapError> {
        Ok(Self {
            bitmap: PageBitmap::new(total_frames, buffer, initial)?,
        })
    }

    /// Seed from the boot memory map.
    ///
    /// Every frame starts used; frames lying entirely inside a usable region
    /// are then freed, and frame 0 is kept reserved. The caller marks the
    /// frames holding `buffer` itself (and anything else still in use) with
    /// [`mark_range_used`](Self::mark_range_used) before allocating.
    ///
    /// # Errors
    /// [`BitmapError::BufferTooSmall`] if `buffer` cannot cover the highest
    /// reported address.
    pub fn from_memory_map(regions: &[MemoryRegion], buffer: &'buf mut [u8]) -> Result<Self, BitmapError> {
        let total_frames = pages_for::<Size4K>(highest_address(regions).as_u64());
        let mut alloc = Self::new(total_frames, buffer, InitialState::AllUsed)?;

        for region in regions.iter().filter(|r| r.is_usable()) {
            let Some(first) = align_up(region.base.as_u64(), Size4K::SIZE) else {
                continue;
            };
            let end = align_down(region.end().as_u64(), Size4K::SIZE);
            if end > first {
                alloc.bitmap.mark_range_free(first >> Size4K::SHIFT, (end - first) >> Size4K::SHIFT)?;
            }
        }
        if total_frames > 0 {
            alloc.bitmap.mark_used(0)?;
        }

        log::info!(
            "physical memory: {} frames tracked, {} free ({} KiB)",
            alloc.total_frames(),
            alloc.free_frames(),
            alloc.free_frames() * (Size4K::SIZE / 1024)
        );
        Ok(alloc)
    }

    #[must_use]
    pub const fn total_frames(&self) -> u64 {
        self.bitmap.len()
    }

    #[must_use]
    pub const fn free_frames(&self) -> u64 {
        self.bitmap.free_count()
    }

    /// # Errors
    /// [`BitmapError::InvalidAddress`] if `pa` is not a tracked frame.
    pub fn mark_used(&mut self, pa: PhysicalAddress) -> Result<(), BitmapError> {
        self.bitmap.mark_used(frame_of(pa))
    }

    /// # Errors
    /// [`BitmapError::InvalidAddress`] if `pa` is not a tracked frame.
    pub fn mark_free(&mut self, pa: PhysicalAddress) -> Result<(), BitmapError> {
        self.bitmap.mark_free(frame_of(pa))
    }

    /// Mark `count` frames from `pa` used; all-or-nothing.
    ///
    /// # Errors
    /// [`BitmapError::InvalidAddress`] if any frame of the range is not tracked.
    pub fn mark_range_used(&mut self, pa: PhysicalAddress, count: u64) -> Result<(), BitmapError> {
        self.bitmap.mark_range_used(frame_of(pa), count)
    }

    /// Mark `count` frames from `pa` free; all-or-nothing.
    ///
    /// # Errors
    /// [`BitmapError::InvalidAddress`] if any frame of the range is not tracked.
    pub fn mark_range_free(&mut self, pa: PhysicalAddress, count: u64) -> Result<(), BitmapError> {
        self.bitmap.mark_range_free(frame_of(pa), count)
    }

    #[must_use]
    pub fn is_free(&self, pa: PhysicalAddress) -> bool {
        self.bitmap.is_free(frame_of(pa))
    }

    #[must_use]
    pub fn is_used(&self, pa: PhysicalAddress) -> bool {
        self.bitmap.is_used(frame_of(pa))
    }

    /// Frame index where the next scan starts.
    #[must_use]
    pub const fn next_free_hint(&self) -> u64 {
        self.bitmap.next_free_hint()
    }

    pub fn set_next_free_hint(&mut self, frame: u64) {
        self.bitmap.set_next_free_hint(frame);
    }

    /// First free frame at or after the hint.
    pub fn alloc_page(&mut self) -> Option<PhysicalAddress> {
        let frame = self.bitmap.find_free()?;
        self.commit(frame, 1)
    }

    /// First run of `count` contiguous free frames.
    pub fn alloc_pages(&mut self, count: u64) -> Option<PhysicalAddress> {
        let frame = self.bitmap.find_free_run(count, 1, 0)?;
        self.commit(frame, count)
    }

    /// First run of `count` free frames whose base is a multiple of
    /// `alignment` bytes. `alignment` must be a power of two; values below
    /// one page are treated as one page.
    pub fn alloc_pages_aligned(&mut self, count: u64, alignment: u64) -> Option<PhysicalAddress> {
        if !alignment.is_power_of_two() {
            log::debug!("rejecting frame alignment {alignment:#x}: not a power of two");
            return None;
        }
        let align_frames = (alignment.max(Size4K::SIZE)) >> Size4K::SHIFT;
        let frame = self.bitmap.find_free_run(count, align_frames, 0)?;
        self.commit(frame, count)
    }

    /// Release one frame. Ownership is not verified; releasing a frame that
    /// is already free is logged.
    ///
    /// # Errors
    /// [`BitmapError::InvalidAddress`] if `pa` is not a tracked frame.
    pub fn free_page(&mut self, pa: PhysicalAddress) -> Result<(), BitmapError> {
        self.free_pages(pa, 1)
    }

    /// Release `count` frames starting at `pa`.
    ///
    /// # Errors
    /// [`BitmapError::InvalidAddress`] if any frame of the range is not tracked;
    /// nothing is released in that case.
    pub fn free_pages(&mut self, pa: PhysicalAddress, count: u64) -> Result<(), BitmapError> {
        let first = frame_of(pa);
        let end = self.bitmap.check_range(first, count)?;
        if let Some(frame) = (first..end).find(|&f| self.bitmap.is_free(f)) {
            log::warn!(
                "double free: frame {:#x} in {pa}+{count} was already free",
                frame << Size4K::SHIFT
            );
        }
        self.bitmap.mark_range_free(first, count)
    }

    fn commit(&mut self, frame: u64, count: u64) -> Option<PhysicalAddress> {
        // The search only returns in-range runs, so this cannot fail.
        self.bitmap.mark_range_used(frame, count).ok()?;
        Some(PhysicalAddress::new(frame << Size4K::SHIFT))
    }
}

impl FrameAlloc for BitmapFrameAlloc<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.alloc_page().and_then(PhysicalPage::from_aligned)
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        if let Err(e) = self.free_page(page.base()) {
            log::error!("page-table frame release failed: {e}");
        }
    }
}

/// Lends the locked kernel allocator to code that wants a [`FrameAlloc`].
///
/// The lock is taken for each frame, so page-table walks in different address
/// spaces only contend while a node is actually being allocated.
#[derive(Copy, Clone)]
pub struct SharedFrameAlloc<'a, 'buf>(pub &'a PhysicalMemory<'buf>);

impl FrameAlloc for SharedFrameAlloc<'_, '_> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.0.lock().alloc_4k()
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        self.0.lock().free_4k(page);
    }
}

#[inline]
const fn frame_of(pa: PhysicalAddress) -> u64 {
    pa.as_u64() >> Size4K::SHIFT
}
