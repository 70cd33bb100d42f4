//! Host-side stand-ins for physical memory, used by unit and integration tests.
//!
//! [`SimulatedPhysMemory`] is a page-aligned heap block where physical address
//! `pa` lives at byte offset `pa`. [`ListFrameAlloc`] hands out frames from it
//! and records what is outstanding so tests can check for leaks.

extern crate alloc;

use crate::addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K};
use crate::{FrameAlloc, PhysMapper};
use alloc::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::ptr::NonNull;

/// A zero-initialized block of host memory standing in for physical RAM.
pub struct SimulatedPhysMemory {
    base: NonNull<u8>,
    layout: Layout,
}

// The block is only reached through raw pointers; synchronization is the
// caller's business, as it is for real RAM.
unsafe impl Send for SimulatedPhysMemory {}
unsafe impl Sync for SimulatedPhysMemory {}

impl SimulatedPhysMemory {
    /// # Panics
    /// If `frames` is zero or the host allocation fails.
    #[must_use]
    pub fn new(frames: u64) -> Self {
        assert!(frames > 0, "simulated memory needs at least one frame");
        let size = usize::try_from(frames * Size4K::SIZE).expect("simulated RAM fits host memory");
        let layout = Layout::from_size_align(size, 4096).expect("valid layout");
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(base) = NonNull::new(ptr) else {
            handle_alloc_error(layout)
        };
        Self { base, layout }
    }

    #[must_use]
    pub const fn frames(&self) -> u64 {
        self.layout.size() as u64 / Size4K::SIZE
    }

    /// Read the `u64` stored at `pa`.
    ///
    /// # Panics
    /// If `pa` is outside the simulated range or not 8-byte aligned.
    #[must_use]
    pub fn read_u64(&self, pa: PhysicalAddress) -> u64 {
        let p = self.ptr_for(pa, 8);
        assert!(pa.as_u64().is_multiple_of(8));
        unsafe { p.cast::<u64>().read() }
    }

    /// Fill `len` bytes at `pa` with `value`.
    ///
    /// # Panics
    /// If the range leaves the simulated memory.
    pub fn fill(&self, pa: PhysicalAddress, value: u8, len: usize) {
        let p = self.ptr_for(pa, len);
        unsafe { p.write_bytes(value, len) };
    }

    /// True if every byte of `page` is zero.
    #[must_use]
    pub fn is_zeroed(&self, page: PhysicalPage<Size4K>) -> bool {
        let p = self.ptr_for(page.base(), 4096);
        let bytes = unsafe { core::slice::from_raw_parts(p, 4096) };
        bytes.iter().all(|&b| b == 0)
    }

    fn ptr_for(&self, pa: PhysicalAddress, len: usize) -> *mut u8 {
        let start = usize::try_from(pa.as_u64()).expect("address fits usize");
        assert!(
            start.checked_add(len).is_some_and(|end| end <= self.layout.size()),
            "{pa:?} (+{len}) is outside simulated RAM"
        );
        unsafe { self.base.as_ptr().add(start) }
    }
}

impl PhysMapper for SimulatedPhysMemory {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let p = self.ptr_for(pa, size_of::<T>());
        assert!(p.cast::<T>().is_aligned(), "{pa:?} misaligned for target type");
        unsafe { &mut *p.cast::<T>() }
    }
}

impl Drop for SimulatedPhysMemory {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

/// A frame allocator over an explicit list of frames, with leak accounting.
#[derive(Debug, Default)]
pub struct ListFrameAlloc {
    free: Vec<PhysicalPage<Size4K>>,
    outstanding: BTreeSet<u64>,
    budget: Option<usize>,
}

impl ListFrameAlloc {
    /// Frames `first..first+count`, handed out lowest first.
    #[must_use]
    pub fn new(first: u64, count: u64) -> Self {
        let free = (first..first + count)
            .rev()
            .map(PhysicalPage::from_frame_index)
            .collect();
        Self {
            free,
            outstanding: BTreeSet::new(),
            budget: None,
        }
    }

    /// Fail every allocation after `n` more successful ones.
    pub const fn fail_after(&mut self, n: usize) {
        self.budget = Some(n);
    }

    /// Remove any allocation limit.
    pub const fn unlimited(&mut self) {
        self.budget = None;
    }

    /// Number of frames handed out and not yet returned.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    #[must_use]
    pub fn is_outstanding(&self, page: PhysicalPage<Size4K>) -> bool {
        self.outstanding.contains(&page.base().as_u64())
    }
}

impl FrameAlloc for ListFrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        if let Some(budget) = self.budget.as_mut() {
            if *budget == 0 {
                return None;
            }
            *budget -= 1;
        }
        let page = self.free.pop()?;
        self.outstanding.insert(page.base().as_u64());
        Some(page)
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        assert!(
            self.outstanding.remove(&page.base().as_u64()),
            "double free of {page:?}"
        );
        self.free.push(page);
    }
}
