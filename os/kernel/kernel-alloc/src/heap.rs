//! # Kernel Heap
//!
//! Byte-granular kernel allocations carved from pages the heap draws from a
//! [`HeapSource`], normally the kernel [`Vmm`].
//!
//! ```text
//! ┌────────┬─────────────┬────────┬──────────┬────────┬──────────────────┐
//! │ header │ payload     │ header │ payload  │ header │ (free)           │
//! └────────┴─────────────┴────────┴──────────┴────────┴──────────────────┘
//!  ^ segment              ^ segment.next        ^ segment.next.next
//! ```
//!
//! Every segment, used or free, starts with a [`SEGMENT_HEADER`]-byte header
//! holding a magic word, the segment's total size and address-ordered links
//! to its neighbours. Allocation is first fit. A fitting segment is split
//! when the remainder can stand as a segment of its own, and a freed segment
//! merges with free neighbours that touch it. When nothing fits, the heap asks
//! its source for more pages and retries once.
//!
//! `free` only accepts pointers it finds in the segment list, so stray and
//! repeated frees are reported instead of corrupting the list. Freed payloads
//! are scrubbed. [`KernelHeap::check`] walks the list and reports the first
//! inconsistent header.
//!
//! # Locking
//! The segment lock is held while the heap grows, so the order is heap, then
//! VMM state, then physical.
//!
//! # Example
//! ```ignore
//! use kernel_alloc::heap::KernelHeap;
//!
//! let heap = KernelHeap::new(manager.vmm());
//! let p = heap.allocate_zeroed(128).ok_or(OutOfMemory)?;
//! unsafe { heap.free(p)? };
//! ```

use crate::vmm::Vmm;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use kernel_memory_addresses::{PageSize, Size4K};
use kernel_vmem::{PageEntryBits, PhysMapper};

const MAGIC_USED: u64 = u64::from_be_bytes(*b"HEAPUSED");
const MAGIC_FREE: u64 = u64::from_be_bytes(*b"HEAPFREE");

/// Alignment every payload gets without asking.
pub const MIN_ALIGN: usize = 16;

/// Bytes taken by each segment header.
pub const SEGMENT_HEADER: usize = size_of::<Segment>();

/// Smallest payload a split-off segment may carry.
const MIN_PAYLOAD: usize = MIN_ALIGN;

/// Pages requested from the source when the heap runs dry, unless the request
/// itself needs more.
pub const DEFAULT_GROW_PAGES: u64 = 16;

#[repr(C, align(16))]
struct Segment {
    magic: u64,
    /// Whole segment, header included.
    size: usize,
    prev: *mut Segment,
    next: *mut Segment,
}

/// Failures reported by [`KernelHeap`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("{0:#x} is not an allocation of this heap")]
    InvalidPointer(usize),
    #[error("{0:#x} was already freed")]
    DoubleFree(usize),
    #[error("zero-sized heap request")]
    ZeroSize,
    #[error("kernel heap exhausted")]
    OutOfMemory,
    #[error("segment {index} at {address:#x} is corrupted: {reason}")]
    Corrupted {
        index: usize,
        address: usize,
        reason: &'static str,
    },
}

/// Where a [`KernelHeap`] gets its memory.
pub trait HeapSource {
    /// `pages` writable 4 KiB pages, contiguous and directly addressable,
    /// owned by the heap from then on. `None` once nothing is left.
    fn grow(&self, pages: u64) -> Option<NonNull<u8>>;
}

impl<M: PhysMapper> HeapSource for Vmm<'_, '_, M> {
    fn grow(&self, pages: u64) -> Option<NonNull<u8>> {
        let va = self.alloc_virtual_pages(pages, PageEntryBits::kernel_rw())?;
        let addr = usize::try_from(va.as_u64()).ok()?;
        NonNull::new(ptr::with_exposed_provenance_mut(addr))
    }
}

/// A snapshot of the segment list.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct HeapStats {
    pub segments: usize,
    pub used_segments: usize,
    /// Bytes obtained from the source so far.
    pub total_bytes: usize,
    /// Payload bytes of all free segments.
    pub free_bytes: usize,
}

struct SegmentList {
    first: *mut Segment,
    total: usize,
}

// Segments are only reached through the heap lock.
unsafe impl Send for SegmentList {}

/// The kernel's general-purpose allocator.
pub struct KernelHeap<'s, S: HeapSource + ?Sized> {
    source: &'s S,
    grow_pages: u64,
    list: spin::Mutex<SegmentList>,
}

impl<'s, S: HeapSource + ?Sized> KernelHeap<'s, S> {
    /// An empty heap that grows by [`DEFAULT_GROW_PAGES`] at a time.
    #[must_use]
    pub const fn new(source: &'s S) -> Self {
        Self::with_grow_pages(source, DEFAULT_GROW_PAGES)
    }

    /// An empty heap that grows by at least `grow_pages` (minimum one) at a time.
    #[must_use]
    pub const fn with_grow_pages(source: &'s S, grow_pages: u64) -> Self {
        Self {
            source,
            grow_pages: if grow_pages == 0 { 1 } else { grow_pages },
            list: spin::Mutex::new(SegmentList {
                first: ptr::null_mut(),
                total: 0,
            }),
        }
    }

    /// `size` bytes aligned to [`MIN_ALIGN`]; `None` for a zero size or once
    /// the source is exhausted. The contents are unspecified.
    #[must_use]
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.allocate_aligned(size, MIN_ALIGN)
    }

    /// Like [`allocate`](Self::allocate), with every byte zeroed.
    #[must_use]
    pub fn allocate_zeroed(&self, size: usize) -> Option<NonNull<u8>> {
        let p = self.allocate(size)?;
        unsafe { p.as_ptr().write_bytes(0, size) };
        Some(p)
    }

    /// `size` bytes at a multiple of `align`, which must be a power of two.
    #[must_use]
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if size == 0 || !align.is_power_of_two() {
            return None;
        }
        let size = size.checked_next_multiple_of(MIN_ALIGN)?;
        let align = align.max(MIN_ALIGN);

        let mut list = self.list.lock();
        if let Some(p) = list.take_fit(size, align) {
            return Some(p);
        }
        self.grow_for(&mut list, size, align)?;
        list.take_fit(size, align)
    }

    /// Return an allocation. Its payload is scrubbed and it merges with free
    /// neighbours.
    ///
    /// # Errors
    /// [`HeapError::InvalidPointer`] if `ptr` does not start an allocation,
    /// [`HeapError::DoubleFree`] if it was freed already, and
    /// [`HeapError::Corrupted`] if its header was overwritten. The heap is
    /// unchanged in every case.
    ///
    /// # Safety
    /// The allocation must not be used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let mut list = self.list.lock();
        let seg = list.find(ptr).inspect_err(|e| log::warn!("kernel heap free: {e}"))?;
        list.release(seg);
        Ok(())
    }

    /// Resize an allocation to `new_size` bytes.
    ///
    /// It stays in place when it already fits or the free segment right after
    /// it can absorb the growth; otherwise the contents move to a fresh
    /// allocation and the old one is freed.
    ///
    /// # Errors
    /// [`HeapError::ZeroSize`] for a zero `new_size`, [`HeapError::OutOfMemory`]
    /// if no room is found, or a [`free`](Self::free) error for a bad `ptr`.
    /// The old allocation is untouched on error.
    ///
    /// # Safety
    /// On success only the returned pointer may be used.
    pub unsafe fn reallocate(&self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, HeapError> {
        unsafe { self.reallocate_aligned(ptr, new_size, MIN_ALIGN) }
    }

    /// Usable bytes behind an allocation, at least what was asked for.
    ///
    /// # Errors
    /// As for [`free`](Self::free).
    pub fn allocation_size(&self, ptr: NonNull<u8>) -> Result<usize, HeapError> {
        let list = self.list.lock();
        let seg = list.find(ptr)?;
        Ok(unsafe { payload_len(seg) })
    }

    /// Walk the whole segment list and return how many segments it holds.
    ///
    /// # Errors
    /// [`HeapError::Corrupted`] naming the first inconsistent segment.
    pub fn check(&self) -> Result<usize, HeapError> {
        self.list
            .lock()
            .check()
            .inspect_err(|e| log::error!("kernel heap: {e}"))
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let list = self.list.lock();
        let mut stats = HeapStats {
            total_bytes: list.total,
            ..HeapStats::default()
        };
        for seg in list.iter() {
            stats.segments += 1;
            unsafe {
                if (*seg).magic == MAGIC_FREE {
                    stats.free_bytes += payload_len(seg);
                } else {
                    stats.used_segments += 1;
                }
            }
        }
        stats
    }

    /// Dump every segment to the log.
    pub fn log_segments(&self) {
        let list = self.list.lock();
        log::info!("kernel heap: {} bytes from the source", list.total);
        for (i, seg) in list.iter().enumerate() {
            let (size, free) = unsafe { ((*seg).size, (*seg).magic == MAGIC_FREE) };
            log::info!(
                "  #{i}: {:#x}, {size:#x} bytes, {}",
                seg.addr(),
                if free { "free" } else { "used" }
            );
        }
    }

    unsafe fn reallocate_aligned(
        &self,
        ptr: NonNull<u8>,
        new_size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        if new_size == 0 {
            return Err(HeapError::ZeroSize);
        }
        let want = new_size
            .checked_next_multiple_of(MIN_ALIGN)
            .ok_or(HeapError::OutOfMemory)?;
        let old_len = {
            let mut list = self.list.lock();
            let seg = list.find(ptr)?;
            if list.resize_in_place(seg, want) {
                return Ok(ptr);
            }
            unsafe { payload_len(seg) }
        };

        let moved = self
            .allocate_aligned(new_size, align)
            .ok_or(HeapError::OutOfMemory)?;
        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), old_len.min(new_size));
            self.free(ptr)?;
        }
        Ok(moved)
    }

    fn grow_for(&self, list: &mut SegmentList, size: usize, align: usize) -> Option<()> {
        // Header, payload, and a worst-case gap in front for the alignment.
        let worst = size
            .checked_add(align)?
            .checked_add(2 * SEGMENT_HEADER + MIN_PAYLOAD)?;
        let pages = (worst as u64).div_ceil(Size4K::SIZE).max(self.grow_pages);
        let bytes = usize::try_from(pages.checked_mul(Size4K::SIZE)?).ok()?;

        let Some(base) = self.source.grow(pages) else {
            log::debug!("kernel heap: source refused {pages} page(s)");
            return None;
        };
        log::debug!("kernel heap grows by {pages} page(s) at {:#x}", base.as_ptr().addr());
        list.add_region(base, bytes);
        Some(())
    }
}

unsafe impl<S: HeapSource + ?Sized> GlobalAlloc for KernelHeap<'_, S> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate_aligned(layout.size(), layout.align())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let p = unsafe { self.alloc(layout) };
        if !p.is_null() {
            unsafe { p.write_bytes(0, layout.size()) };
        }
        p
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(p) = NonNull::new(ptr) {
            // Bad pointers are already logged by `free`.
            let _ = unsafe { self.free(p) };
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(p) = NonNull::new(ptr) else {
            return ptr::null_mut();
        };
        unsafe { self.reallocate_aligned(p, new_size, layout.align()) }.map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}

impl SegmentList {
    fn iter(&self) -> impl Iterator<Item = *mut Segment> + '_ {
        let mut seg = self.first;
        core::iter::from_fn(move || {
            let current = seg;
            if current.is_null() {
                return None;
            }
            seg = unsafe { (*current).next };
            Some(current)
        })
    }

    /// Link a fresh region in address order, merging with touching free segments.
    fn add_region(&mut self, base: NonNull<u8>, bytes: usize) {
        // Sources hand out whole pages.
        #[allow(clippy::cast_ptr_alignment)]
        let seg = base.as_ptr().cast::<Segment>();
        let mut prev = ptr::null_mut::<Segment>();
        let mut next = self.first;
        unsafe {
            while !next.is_null() && next.addr() < seg.addr() {
                prev = next;
                next = (*next).next;
            }
            seg.write(Segment {
                magic: MAGIC_FREE,
                size: bytes,
                prev,
                next,
            });
            match prev.as_mut() {
                Some(p) => p.next = seg,
                None => self.first = seg,
            }
            if let Some(n) = next.as_mut() {
                n.prev = seg;
            }
        }
        self.total += bytes;
        self.merge_next(seg);
        if !prev.is_null() {
            self.merge_next(prev);
        }
    }

    /// First fit for `size` payload bytes at `align`; the segment becomes used.
    fn take_fit(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let (seg, offset) = self.iter().find_map(|seg| {
            let free = unsafe { (*seg).magic == MAGIC_FREE };
            free.then(|| fit_offset(seg, size, align)).flatten().map(|o| (seg, o))
        })?;
        let chosen = if offset == 0 { seg } else { self.split(seg, offset)? };
        self.split(chosen, SEGMENT_HEADER + size);
        unsafe { (*chosen).magic = MAGIC_USED };
        NonNull::new(payload(chosen))
    }

    /// The used segment whose payload starts at `ptr`.
    fn find(&self, ptr: NonNull<u8>) -> Result<*mut Segment, HeapError> {
        let addr = ptr.as_ptr().addr();
        for (index, seg) in self.iter().enumerate() {
            if seg.addr() > addr {
                break;
            }
            if payload(seg) == ptr.as_ptr() {
                return match unsafe { (*seg).magic } {
                    MAGIC_USED => Ok(seg),
                    MAGIC_FREE => Err(HeapError::DoubleFree(addr)),
                    _ => Err(HeapError::Corrupted {
                        index,
                        address: seg.addr(),
                        reason: "bad magic",
                    }),
                };
            }
        }
        Err(HeapError::InvalidPointer(addr))
    }

    fn release(&mut self, seg: *mut Segment) {
        unsafe {
            payload(seg).write_bytes(0, payload_len(seg));
            (*seg).magic = MAGIC_FREE;
        }
        self.merge_next(seg);
        let prev = unsafe { (*seg).prev };
        if !prev.is_null() {
            self.merge_next(prev);
        }
    }

    /// Give a used segment `want` payload bytes without moving it.
    fn resize_in_place(&mut self, seg: *mut Segment, want: usize) -> bool {
        let have = unsafe { payload_len(seg) };
        if want > have {
            let next = unsafe { (*seg).next };
            let absorbable = !next.is_null()
                && touches(seg, next)
                && unsafe { (*next).magic == MAGIC_FREE && have + (*next).size >= want };
            if !absorbable {
                return false;
            }
            self.absorb_next(seg);
        }
        if let Some(tail) = self.split(seg, SEGMENT_HEADER + want) {
            unsafe {
                payload(tail).write_bytes(0, payload_len(tail));
                (*tail).magic = MAGIC_FREE;
            }
            self.merge_next(tail);
        }
        true
    }

    /// Cut `seg` after `keep` bytes if the rest can stand alone. The rest
    /// carries `seg`'s magic and is returned.
    fn split(&mut self, seg: *mut Segment, keep: usize) -> Option<*mut Segment> {
        unsafe {
            let size = (*seg).size;
            if size < keep.checked_add(SEGMENT_HEADER + MIN_PAYLOAD)? {
                return None;
            }
            let tail = seg.byte_add(keep);
            tail.write(Segment {
                magic: (*seg).magic,
                size: size - keep,
                prev: seg,
                next: (*seg).next,
            });
            if let Some(next) = (*seg).next.as_mut() {
                next.prev = tail;
            }
            (*seg).size = keep;
            (*seg).next = tail;
            Some(tail)
        }
    }

    /// Fold `seg.next` into `seg` when both are free and touch.
    fn merge_next(&mut self, seg: *mut Segment) {
        let next = unsafe { (*seg).next };
        let mergeable = !next.is_null()
            && touches(seg, next)
            && unsafe { (*seg).magic == MAGIC_FREE && (*next).magic == MAGIC_FREE };
        if mergeable {
            self.absorb_next(seg);
        }
    }

    fn absorb_next(&mut self, seg: *mut Segment) {
        unsafe {
            let next = (*seg).next;
            (*seg).size += (*next).size;
            (*seg).next = (*next).next;
            if let Some(after) = (*seg).next.as_mut() {
                after.prev = seg;
            }
            (*next).magic = 0;
        }
    }

    fn check(&self) -> Result<usize, HeapError> {
        let mut prev = ptr::null_mut::<Segment>();
        let mut count = 0;
        for (index, seg) in self.iter().enumerate() {
            let corrupted = |reason| HeapError::Corrupted {
                index,
                address: seg.addr(),
                reason,
            };
            let (magic, size, back, next) = unsafe { ((*seg).magic, (*seg).size, (*seg).prev, (*seg).next) };
            if magic != MAGIC_USED && magic != MAGIC_FREE {
                return Err(corrupted("bad magic"));
            }
            if back != prev {
                return Err(corrupted("broken back link"));
            }
            if size < SEGMENT_HEADER + MIN_PAYLOAD || !size.is_multiple_of(MIN_ALIGN) {
                return Err(corrupted("bad size"));
            }
            if !next.is_null() && next.addr() < seg.addr() + size {
                return Err(corrupted("overlaps the next segment"));
            }
            prev = seg;
            count = index + 1;
        }
        Ok(count)
    }
}

/// Offset from `seg` at which a used segment for `size` bytes at `align` can
/// start, if `seg` has room. A non-zero offset leaves a free segment in front.
fn fit_offset(seg: *mut Segment, size: usize, align: usize) -> Option<usize> {
    let start = seg.addr();
    let end = start.checked_add(unsafe { (*seg).size })?;
    let mut data = (start + SEGMENT_HEADER).checked_next_multiple_of(align)?;
    loop {
        let offset = data - SEGMENT_HEADER - start;
        if offset == 0 || offset >= SEGMENT_HEADER + MIN_PAYLOAD {
            return (data.checked_add(size)? <= end).then_some(offset);
        }
        data = data.checked_add(align)?;
    }
}

fn touches(seg: *mut Segment, next: *mut Segment) -> bool {
    seg.addr() + unsafe { (*seg).size } == next.addr()
}

const fn payload(seg: *mut Segment) -> *mut u8 {
    seg.cast::<u8>().wrapping_add(SEGMENT_HEADER)
}

unsafe fn payload_len(seg: *mut Segment) -> usize {
    unsafe { (*seg).size - SEGMENT_HEADER }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    #[derive(Copy, Clone)]
    #[repr(C, align(4096))]
    struct Page([u8; 4096]);

    /// Hands out consecutive pages of one host buffer, filled with garbage.
    struct Arena {
        _pages: Vec<Page>,
        base: NonNull<u8>,
        next: Cell<u64>,
        limit: u64,
        calls: Cell<u32>,
    }

    impl Arena {
        fn new(limit: u64) -> Self {
            let mut pages = vec![Page([0; 4096]); usize::try_from(limit).unwrap()];
            let base = NonNull::new(pages.as_mut_ptr().cast::<u8>()).unwrap();
            Self {
                _pages: pages,
                base,
                next: Cell::new(0),
                limit,
                calls: Cell::new(0),
            }
        }
    }

    impl HeapSource for Arena {
        fn grow(&self, pages: u64) -> Option<NonNull<u8>> {
            let first = self.next.get();
            if first + pages > self.limit {
                return None;
            }
            self.next.set(first + pages);
            self.calls.set(self.calls.get() + 1);
            let p = unsafe { self.base.add(usize::try_from(first * 4096).unwrap()) };
            unsafe { p.as_ptr().write_bytes(0xAA, usize::try_from(pages * 4096).unwrap()) };
            Some(p)
        }
    }

    fn bytes<'a>(p: NonNull<u8>, len: usize) -> &'a [u8] {
        unsafe { core::slice::from_raw_parts(p.as_ptr(), len) }
    }

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let arena = Arena::new(8);
        let heap = KernelHeap::with_grow_pages(&arena, 4);
        let sizes = [1usize, 24, 100, 512, 4000];
        let mut blocks: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
        for (fill, &size) in (1u8..).zip(&sizes) {
            let p = heap.allocate(size).unwrap();
            assert!(p.as_ptr().addr().is_multiple_of(MIN_ALIGN));
            assert!(heap.allocation_size(p).unwrap() >= size);
            unsafe { p.as_ptr().write_bytes(fill, size) };
            blocks.push((p, size, fill));
        }
        for &(p, size, fill) in &blocks {
            assert!(bytes(p, size).iter().all(|&b| b == fill));
        }
        blocks.sort_unstable_by_key(|&(p, ..)| p.as_ptr().addr());
        for pair in blocks.windows(2) {
            let (lo, lo_size, _) = pair[0];
            let (hi, ..) = pair[1];
            assert!(lo.as_ptr().addr() + lo_size <= hi.as_ptr().addr());
        }
        assert_eq!(heap.check(), Ok(sizes.len() + 1));
        assert_eq!(heap.allocate(0), None);
    }

    #[test]
    fn freed_neighbours_merge_back_into_one_segment() {
        let arena = Arena::new(1);
        let heap = KernelHeap::with_grow_pages(&arena, 1);
        let a = heap.allocate(100).unwrap();
        let b = heap.allocate(100).unwrap();
        let c = heap.allocate(100).unwrap();
        let stats = heap.stats();
        assert_eq!((stats.segments, stats.used_segments), (4, 3));

        unsafe {
            heap.free(b).unwrap();
            assert_eq!(heap.stats().segments, 4);
            heap.free(a).unwrap();
            assert_eq!(heap.stats().segments, 3);
            heap.free(c).unwrap();
        }
        assert_eq!(
            heap.stats(),
            HeapStats {
                segments: 1,
                used_segments: 0,
                total_bytes: 4096,
                free_bytes: 4096 - SEGMENT_HEADER,
            }
        );
        assert_eq!(heap.check(), Ok(1));
    }

    #[test]
    fn zeroed_allocations_and_scrubbed_frees() {
        let arena = Arena::new(2);
        let heap = KernelHeap::with_grow_pages(&arena, 2);
        let z = heap.allocate_zeroed(256).unwrap();
        assert!(bytes(z, 256).iter().all(|&b| b == 0));

        let p = heap.allocate(64).unwrap();
        unsafe {
            p.as_ptr().write_bytes(0x55, 64);
            heap.free(p).unwrap();
        }
        let q = heap.allocate(64).unwrap();
        assert_eq!(q, p, "first fit reuses the freed segment");
        assert!(bytes(q, 64).iter().all(|&b| b == 0));
    }

    #[test]
    fn bad_frees_are_reported_and_change_nothing() {
        let arena = Arena::new(1);
        let heap = KernelHeap::with_grow_pages(&arena, 1);
        let p = heap.allocate(64).unwrap();
        let q = heap.allocate(64).unwrap();
        let before = heap.stats();

        let inside = unsafe { p.add(16) };
        assert_eq!(
            unsafe { heap.free(inside) },
            Err(HeapError::InvalidPointer(inside.as_ptr().addr()))
        );
        let mut elsewhere = 0u64;
        let stray = NonNull::from(&mut elsewhere).cast::<u8>();
        assert!(matches!(unsafe { heap.free(stray) }, Err(HeapError::InvalidPointer(_))));
        assert_eq!(heap.stats(), before);

        unsafe { heap.free(q).unwrap() };
        assert_eq!(unsafe { heap.free(q) }, Err(HeapError::DoubleFree(q.as_ptr().addr())));
        assert_eq!(heap.allocation_size(q), Err(HeapError::DoubleFree(q.as_ptr().addr())));
        assert!(heap.check().is_ok());
    }

    #[test]
    fn grows_on_demand_and_fails_cleanly() {
        let arena = Arena::new(4);
        let heap = KernelHeap::with_grow_pages(&arena, 1);
        assert_eq!(heap.stats(), HeapStats::default());

        let a = heap.allocate(3000).unwrap();
        assert_eq!(arena.calls.get(), 1);
        let b = heap.allocate(3000).unwrap();
        assert_eq!(arena.calls.get(), 2);
        // Consecutive growth merges into the trailing free segment.
        assert_eq!(heap.stats().segments, 3);

        let before = heap.stats();
        assert_eq!(heap.allocate(3 * 4096), None);
        assert_eq!(heap.stats(), before);
        assert_eq!(arena.calls.get(), 2);

        let c = heap.allocate(5000).unwrap();
        assert_eq!(arena.calls.get(), 3);
        assert_eq!(heap.stats().total_bytes, 4 * 4096);
        assert_eq!(heap.allocate(2 * 4096), None);

        unsafe {
            heap.free(a).unwrap();
            heap.free(b).unwrap();
            heap.free(c).unwrap();
        }
        assert_eq!(heap.check(), Ok(1));
    }

    #[test]
    fn aligned_requests_leave_a_free_gap_in_front() {
        let arena = Arena::new(4);
        let heap = KernelHeap::with_grow_pages(&arena, 4);
        let small = heap.allocate(16).unwrap();
        let aligned = heap.allocate_aligned(64, 1024).unwrap();
        assert!(aligned.as_ptr().addr().is_multiple_of(1024));
        assert_eq!(heap.stats().used_segments, 2);
        assert!(heap.check().is_ok());
        assert_eq!(heap.allocate_aligned(16, 24), None);

        unsafe {
            heap.free(aligned).unwrap();
            heap.free(small).unwrap();
        }
        assert_eq!(heap.check(), Ok(1));
    }

    #[test]
    fn reallocation_in_place_and_by_moving() {
        let arena = Arena::new(2);
        let heap = KernelHeap::with_grow_pages(&arena, 2);
        let a = heap.allocate(64).unwrap();
        let b = heap.allocate(64).unwrap();
        let fence = heap.allocate(64).unwrap();
        for i in 0..64u8 {
            unsafe { a.as_ptr().add(usize::from(i)).write(i) };
        }

        unsafe {
            // Shrinking always stays put.
            assert_eq!(heap.reallocate(a, 32), Ok(a));
            // `b` is in the way, so growing moves.
            let moved = heap.reallocate(a, 200).unwrap();
            assert_ne!(moved, a);
            assert!(bytes(moved, 64).iter().copied().eq(0..64u8));
            assert_eq!(heap.free(a), Err(HeapError::DoubleFree(a.as_ptr().addr())));

            // The moved block sits before the free tail and grows into it.
            let grown = heap.reallocate(moved, 512).unwrap();
            assert_eq!(grown, moved);
            assert!(heap.allocation_size(grown).unwrap() >= 512);
            assert!(bytes(grown, 64).iter().copied().eq(0..64u8));

            let before = heap.stats();
            assert_eq!(heap.reallocate(grown, 0), Err(HeapError::ZeroSize));
            assert_eq!(heap.reallocate(grown, 1 << 20), Err(HeapError::OutOfMemory));
            assert_eq!(heap.stats(), before);

            heap.free(b).unwrap();
            heap.free(fence).unwrap();
            heap.free(grown).unwrap();
        }
        assert_eq!(heap.check(), Ok(1));
    }

    #[test]
    fn overwritten_headers_are_detected() {
        let arena = Arena::new(1);
        let heap = KernelHeap::with_grow_pages(&arena, 1);
        let _first = heap.allocate(32).unwrap();
        let p = heap.allocate(32).unwrap();
        assert_eq!(heap.check(), Ok(3));

        unsafe { p.as_ptr().sub(SEGMENT_HEADER).write_bytes(0, 8) };
        assert!(matches!(
            heap.check(),
            Err(HeapError::Corrupted { index: 1, reason: "bad magic", .. })
        ));
        assert!(matches!(unsafe { heap.free(p) }, Err(HeapError::Corrupted { index: 1, .. })));
    }

    #[test]
    fn global_alloc_keeps_layout_alignment() {
        let arena = Arena::new(4);
        let heap = KernelHeap::with_grow_pages(&arena, 4);
        let layout = Layout::from_size_align(48, 256).unwrap();
        unsafe {
            let p = heap.alloc_zeroed(layout);
            assert!(!p.is_null() && p.addr().is_multiple_of(256));
            assert!(core::slice::from_raw_parts(p, 48).iter().all(|&b| b == 0));
            p.write_bytes(7, 48);

            // Too big for the gap in front of `p`, so it lands right after it.
            let blocker = heap.alloc(Layout::from_size_align(300, 16).unwrap());
            assert!(blocker.addr() > p.addr());
            let q = heap.realloc(p, layout, 4096);
            assert!(!q.is_null() && q != p && q.addr().is_multiple_of(256));
            assert!(core::slice::from_raw_parts(q, 48).iter().all(|&b| b == 7));

            heap.dealloc(q, Layout::from_size_align(4096, 256).unwrap());
        }
        assert_eq!(heap.stats().used_segments, 1);
    }
}
