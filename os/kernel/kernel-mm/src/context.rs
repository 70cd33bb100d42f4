//! Per-process address space.
//!
//! An [`MmContext`] owns one user translation tree and the [`VmaList`] that
//! describes it, and backs anonymous areas with zeroed frames from the shared
//! physical allocator. The upper half of the tree is shared with the kernel
//! and never touched here.
//!
//! Nothing in here is locked: the owning process serializes every call. TLB
//! shootdown after `munmap`, a shrinking `brk` or a `MAP_FIXED` replacement is
//! left to that owner as well.

use crate::layout::UserLayout;
use crate::vma::{FileBacking, VmaArea, VmaHandle, VmaList, VmaProt, VmaType};
use kernel_alloc::frame_alloc::{PhysicalMemory, SharedFrameAlloc};
use kernel_alloc::vmm::Vmm;
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, align_up};
use kernel_vmem::{AddressSpace, MapError, PageEntryBits, PhysMapper, UnmapError};

#[allow(clippy::cast_possible_truncation)]
const PAGE_BYTES: usize = Size4K::SIZE as usize;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MmError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("{0} is not a usable user address")]
    InvalidAddress(VirtualAddress),
    #[error("length {0:#x} is empty or too large")]
    InvalidLength(u64),
    #[error("a mapping must be exactly one of private or shared")]
    InvalidFlags,
    #[error("range overlaps the area at {0}")]
    Conflict(VirtualAddress),
    #[error(transparent)]
    Map(#[from] MapError),
}

/// The memory of one process.
pub struct MmContext<'a, 'buf, 'm, M: PhysMapper> {
    space: AddressSpace<'m, M>,
    phys: &'a PhysicalMemory<'buf>,
    layout: UserLayout,
    vmas: VmaList,
    heap_start: VirtualAddress,
    heap_end: VirtualAddress,
}

impl<'a, 'buf, 'm, M: PhysMapper> MmContext<'a, 'buf, 'm, M> {
    /// A fresh address space whose upper half mirrors `kernel`.
    ///
    /// # Errors
    /// [`MmError::OutOfMemory`] if no frame is left for the root, or
    /// [`MmError::InvalidAddress`] if `layout` is misaligned or misordered.
    pub fn new(
        mapper: &'m M,
        phys: &'a PhysicalMemory<'buf>,
        kernel: &AddressSpace<'_, M>,
        layout: UserLayout,
    ) -> Result<Self, MmError> {
        if !layout.is_valid() {
            return Err(MmError::InvalidAddress(layout.mmap_base));
        }
        let space = AddressSpace::new_user(mapper, &mut SharedFrameAlloc(phys), kernel).ok_or(MmError::OutOfMemory)?;
        Ok(Self::with_space(space, phys, layout))
    }

    /// Like [`new`](Self::new), taking the kernel half and the frames from `vmm`.
    ///
    /// # Errors
    /// As for [`new`](Self::new).
    pub fn for_vmm(vmm: &'a Vmm<'buf, 'm, M>, layout: UserLayout) -> Result<Self, MmError> {
        if !layout.is_valid() {
            return Err(MmError::InvalidAddress(layout.mmap_base));
        }
        let space = vmm.create_user_space().ok_or(MmError::OutOfMemory)?;
        Ok(Self::with_space(space, vmm.physical(), layout))
    }

    const fn with_space(space: AddressSpace<'m, M>, phys: &'a PhysicalMemory<'buf>, layout: UserLayout) -> Self {
        Self {
            space,
            phys,
            layout,
            vmas: VmaList::new(),
            heap_start: VirtualAddress::zero(),
            heap_end: VirtualAddress::zero(),
        }
    }

    /// Frame to load into CR3 when switching to this process.
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.space.root()
    }

    #[must_use]
    pub const fn address_space(&self) -> &AddressSpace<'m, M> {
        &self.space
    }

    #[must_use]
    pub const fn layout(&self) -> &UserLayout {
        &self.layout
    }

    #[must_use]
    pub const fn vmas(&self) -> &VmaList {
        &self.vmas
    }

    #[must_use]
    pub const fn vma_count(&self) -> usize {
        self.vmas.len()
    }

    #[must_use]
    pub const fn heap_start(&self) -> VirtualAddress {
        self.heap_start
    }

    /// The current program break.
    #[must_use]
    pub const fn heap_end(&self) -> VirtualAddress {
        self.heap_end
    }

    /// Translate a user address through this process's page tables.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.space.get_physical_address(va)
    }

    #[must_use]
    pub fn find_vma(&self, addr: VirtualAddress) -> Option<&VmaArea> {
        self.vmas.find(addr)
    }

    /// Pick a place for `size` bytes.
    ///
    /// A non-zero `preferred` address is returned as-is if the range is page
    /// aligned, inside user space and free, and rejected otherwise; nothing is
    /// ever evicted. Without one, the lowest gap at or above `mmap_base` that
    /// ends below the stack region is used.
    #[must_use]
    pub fn find_free_vma_range(&self, size: u64, preferred: Option<VirtualAddress>) -> Option<VirtualAddress> {
        let size = align_up(size, Size4K::SIZE).filter(|&s| s > 0)?;
        if let Some(addr) = preferred.filter(|a| a.as_u64() != 0) {
            let fits = addr.is_aligned_to(Size4K::SIZE)
                && self.layout.contains_range(addr, size)
                && self.vmas.first_overlap(addr, addr + size).is_none();
            return fits.then_some(addr);
        }

        let mut cur = self.layout.mmap_base;
        loop {
            let end = cur
                .checked_add(size)
                .filter(|&end| end <= self.layout.stack_start)?;
            match self.vmas.first_overlap(cur, end) {
                None => return Some(cur),
                Some(vma) => cur = VirtualAddress::new(align_up(vma.end().as_u64(), Size4K::SIZE)?),
            }
        }
    }

    /// Record an area `[start, start + size)` without mapping anything.
    ///
    /// Only the user-space bounds are checked; callers that need a free range
    /// ask [`find_free_vma_range`](Self::find_free_vma_range) first.
    pub fn create_vma(
        &mut self,
        start: VirtualAddress,
        size: u64,
        prot: VmaProt,
        kind: VmaType,
        backing: Option<FileBacking>,
        file_offset: u64,
    ) -> Option<&VmaArea> {
        if !self.layout.contains_range(start, size) {
            return None;
        }
        let area = VmaArea::new(start, start + size, prot, kind).with_file(backing, file_offset);
        let handle = self.vmas.insert(area);
        self.vmas.get(handle)
    }

    /// Forget an area. Its pages stay mapped; unmap them first.
    pub fn remove_vma(&mut self, handle: VmaHandle) -> Option<VmaArea> {
        self.vmas.remove(handle)
    }

    /// Coalesce the area with matching neighbours; true if anything merged.
    pub fn merge_vmas(&mut self, handle: VmaHandle) -> bool {
        self.vmas.merge(handle).is_some()
    }

    /// Split an area at `at` and return the new upper part.
    pub fn split_vma(&mut self, handle: VmaHandle, at: VirtualAddress) -> Option<&VmaArea> {
        let upper = self.vmas.split(handle, at)?;
        self.vmas.get(upper)
    }

    /// True if an area contains `addr` and grants at least `required`.
    #[must_use]
    pub fn check_vma_flags(&self, addr: VirtualAddress, required: VmaProt) -> bool {
        self.find_vma(addr).is_some_and(|vma| vma.prot().contains(required))
    }

    /// Place an empty heap at `start` (rounded up to a page).
    ///
    /// # Errors
    /// [`MmError::InvalidAddress`] if that page is not in user space.
    pub fn init_heap(&mut self, start: VirtualAddress) -> Result<(), MmError> {
        let start = align_up(start.as_u64(), Size4K::SIZE)
            .map(VirtualAddress::new)
            .filter(|&s| self.layout.contains_range(s, Size4K::SIZE))
            .ok_or(MmError::InvalidAddress(start))?;
        self.heap_start = start;
        self.heap_end = start;
        Ok(())
    }

    /// `brk`: move the program break and return the break in effect afterwards.
    ///
    /// A request that cannot be honoured leaves the old break in place.
    pub fn set_heap_end(&mut self, new_end: VirtualAddress) -> VirtualAddress {
        if let Err(e) = self.try_set_heap_end(new_end) {
            log::debug!("brk to {new_end} refused: {e}");
        }
        self.heap_end
    }

    /// Move the program break to `new_end`.
    ///
    /// Growing backs every new page with a zeroed, writable frame and extends
    /// the heap area; shrinking unmaps and frees the pages above the new
    /// break.
    ///
    /// # Errors
    /// - [`MmError::InvalidAddress`] before [`init_heap`](Self::init_heap),
    ///   below the heap start or past user space.
    /// - [`MmError::Conflict`] if another area is in the way.
    /// - [`MmError::OutOfMemory`] / [`MmError::Map`] when backing fails; all
    ///   pages added by this call are released again.
    pub fn try_set_heap_end(&mut self, new_end: VirtualAddress) -> Result<VirtualAddress, MmError> {
        if self.heap_start.as_u64() == 0 || new_end < self.heap_start {
            return Err(MmError::InvalidAddress(new_end));
        }
        let old_top = page_ceil(self.heap_end).ok_or(MmError::InvalidAddress(self.heap_end))?;
        let new_top = page_ceil(new_end)
            .filter(|&top| top <= self.layout.userspace_end)
            .ok_or(MmError::InvalidAddress(new_end))?;

        if new_top > old_top {
            if let Some(vma) = self.vmas.first_overlap(old_top, new_top) {
                return Err(MmError::Conflict(vma.start()));
            }
            let prot = VmaProt::READ | VmaProt::WRITE;
            self.back_with_fresh_frames(old_top, pages_between(old_top, new_top), prot)?;
            let handle = self.vmas.insert(VmaArea::new(
                old_top,
                new_top,
                prot,
                VmaType::PRIVATE | VmaType::ANONYMOUS,
            ));
            self.vmas.merge(handle);
        } else if new_top < old_top {
            self.unmap_range(new_top, old_top);
        }

        self.heap_end = new_end;
        Ok(new_end)
    }

    /// Map `len` bytes of zeroed anonymous memory.
    ///
    /// `sharing` must be exactly one of [`VmaType::PRIVATE`] and
    /// [`VmaType::SHARED`] (optionally with [`VmaType::ANONYMOUS`]). With
    /// `fixed`, `addr` is used verbatim and whatever overlaps it is unmapped
    /// first; otherwise `addr` is a hint and the placement search takes over
    /// if it is not free. Every page is backed immediately.
    ///
    /// # Errors
    /// [`MmError::InvalidLength`], [`MmError::InvalidFlags`] or
    /// [`MmError::InvalidAddress`] for bad arguments,
    /// [`MmError::OutOfMemory`] if no range or not enough frames are left.
    /// On error no page of the new mapping remains; a `fixed` request may
    /// already have removed the old contents of its range.
    pub fn mmap_anonymous(
        &mut self,
        addr: Option<VirtualAddress>,
        len: u64,
        prot: VmaProt,
        sharing: VmaType,
        fixed: bool,
    ) -> Result<VirtualAddress, MmError> {
        let len = align_up(len, Size4K::SIZE)
            .filter(|&l| l > 0)
            .ok_or(MmError::InvalidLength(len))?;
        let sharing = sharing - VmaType::ANONYMOUS;
        if sharing != VmaType::PRIVATE && sharing != VmaType::SHARED {
            return Err(MmError::InvalidFlags);
        }

        let start = if fixed {
            let addr = addr.ok_or(MmError::InvalidAddress(VirtualAddress::zero()))?;
            if !addr.is_aligned_to(Size4K::SIZE) || !self.layout.contains_range(addr, len) {
                return Err(MmError::InvalidAddress(addr));
            }
            self.unmap_range(addr, addr + len);
            addr
        } else {
            self.find_free_vma_range(len, addr)
                .or_else(|| self.find_free_vma_range(len, None))
                .ok_or(MmError::OutOfMemory)?
        };

        self.back_with_fresh_frames(start, len / Size4K::SIZE, prot)?;
        let handle = self
            .vmas
            .insert(VmaArea::new(start, start + len, prot, sharing | VmaType::ANONYMOUS));
        self.vmas.merge(handle);
        log::trace!("mmap {start} +{len:#x} {prot:?} {sharing:?}");
        Ok(start)
    }

    /// Map caller-owned `frames` (shared memory, a file cache) at a fresh range.
    ///
    /// The area is [`VmaType::SHARED`], plus [`VmaType::FILE`] when `backing`
    /// is given. Its frames are never freed by this context.
    ///
    /// # Errors
    /// [`MmError::InvalidLength`] for an empty slice, [`MmError::OutOfMemory`]
    /// if no range is free, [`MmError::Map`] for a misaligned frame or a
    /// failed table allocation. Nothing stays mapped on error.
    pub fn map_shared(
        &mut self,
        frames: &[PhysicalAddress],
        prot: VmaProt,
        backing: Option<FileBacking>,
    ) -> Result<VirtualAddress, MmError> {
        let len = (frames.len() as u64)
            .checked_mul(Size4K::SIZE)
            .filter(|&l| l > 0)
            .ok_or(MmError::InvalidLength(0))?;
        if let Some(&pa) = frames.iter().find(|pa| !pa.is_aligned_to(Size4K::SIZE)) {
            return Err(MapError::InvalidPhysicalAddress(pa).into());
        }
        let start = self.find_free_vma_range(len, None).ok_or(MmError::OutOfMemory)?;

        let flags = leaf_flags(prot);
        let mut alloc = SharedFrameAlloc(self.phys);
        for (i, &pa) in (0u64..).zip(frames) {
            if let Err(e) = self.space.map_page(&mut alloc, start + i * Size4K::SIZE, pa, flags) {
                self.unmap_pages(start, i, false);
                return Err(e.into());
            }
        }

        let kind = if backing.is_some() {
            VmaType::SHARED | VmaType::FILE
        } else {
            VmaType::SHARED
        };
        self.vmas
            .insert(VmaArea::new(start, start + len, prot, kind).with_file(backing, 0));
        Ok(start)
    }

    /// Remove every mapping in `[addr, addr + len)`.
    ///
    /// Frames of anonymous areas are freed; areas that straddle the range are
    /// trimmed or split. Holes in the range are fine.
    ///
    /// # Errors
    /// [`MmError::InvalidLength`] for an empty length and
    /// [`MmError::InvalidAddress`] for a misaligned or out-of-bounds range.
    pub fn munmap(&mut self, addr: VirtualAddress, len: u64) -> Result<(), MmError> {
        let len = align_up(len, Size4K::SIZE)
            .filter(|&l| l > 0)
            .ok_or(MmError::InvalidLength(len))?;
        if !addr.is_aligned_to(Size4K::SIZE) || !self.layout.contains_range(addr, len) {
            return Err(MmError::InvalidAddress(addr));
        }
        self.unmap_range(addr, addr + len);
        Ok(())
    }

    /// Tear the address space down and return the number of frames freed.
    ///
    /// Anonymous frames go back to the allocator, then every lower-half
    /// table and the root itself.
    #[must_use]
    pub fn destroy(mut self) -> u64 {
        let mut freed = 0;
        while let Some(vma) = self.vmas.iter().next().copied() {
            let owned = vma.kind().contains(VmaType::ANONYMOUS);
            freed += self.unmap_pages(vma.start(), pages_between(vma.start(), vma.end()), owned);
            self.vmas.remove(vma.handle());
        }
        let root = self.space.root();
        self.space.release_user_tables(&mut SharedFrameAlloc(self.phys));
        log::debug!("address space {root:?} destroyed, {freed} frame(s) returned");
        freed
    }

    /// Dump the area list at debug level.
    pub fn log_regions(&self, name: &str) {
        log::debug!(
            "memory map of {name} (root {:?}), {} area(s)",
            self.space.root(),
            self.vmas.len()
        );
        for vma in &self.vmas {
            log::debug!("  {vma}");
        }
        if self.heap_start.as_u64() != 0 {
            log::debug!("  heap {}..{}", self.heap_start, self.heap_end);
        }
    }

    /// Unmap and free everything overlapping `[start, end)` and fix up the areas.
    fn unmap_range(&mut self, start: VirtualAddress, end: VirtualAddress) {
        while let Some(vma) = self.vmas.first_overlap(start, end).copied() {
            let lo = vma.start().max(start);
            let hi = vma.end().min(end);
            let owned = vma.kind().contains(VmaType::ANONYMOUS);
            self.unmap_pages(lo, pages_between(lo, hi), owned);

            let handle = vma.handle();
            match (vma.start() < start, vma.end() > end) {
                (false, false) => {
                    self.vmas.remove(handle);
                }
                (true, true) => {
                    self.vmas.split(handle, end);
                    self.vmas.truncate_end(handle, start);
                }
                (true, false) => {
                    self.vmas.truncate_end(handle, start);
                }
                (false, true) => {
                    self.vmas.truncate_start(handle, end);
                }
            }
        }
    }

    /// Allocate, zero and map `count` frames at `start`; all or nothing.
    fn back_with_fresh_frames(&mut self, start: VirtualAddress, count: u64, prot: VmaProt) -> Result<(), MmError> {
        let flags = leaf_flags(prot);
        let mut alloc = SharedFrameAlloc(self.phys);
        for i in 0..count {
            let frame = self.phys.lock().alloc_page();
            let result = match frame {
                None => Err(MmError::OutOfMemory),
                Some(pa) => {
                    self.zero_frame(pa);
                    let mapped = self.space.map_page(&mut alloc, start + i * Size4K::SIZE, pa, flags);
                    if mapped.is_err() {
                        self.release_frame(pa);
                    }
                    mapped.map_err(MmError::from)
                }
            };
            if let Err(e) = result {
                self.unmap_pages(start, i, true);
                log::debug!("backing {count} page(s) at {start} failed after {i}: {e}");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Clear `count` leaves from `start`; returns how many frames were freed.
    fn unmap_pages(&mut self, start: VirtualAddress, count: u64, free_frames: bool) -> u64 {
        let mut freed = 0;
        for i in 0..count {
            let va = start + i * Size4K::SIZE;
            match self.space.unmap_page(va) {
                Ok(pa) => {
                    if free_frames {
                        self.release_frame(pa);
                        freed += 1;
                    }
                }
                Err(UnmapError::NotMapped(_)) => {}
                Err(e) => log::warn!("leaving {va} mapped: {e}"),
            }
        }
        freed
    }

    fn zero_frame(&self, pa: PhysicalAddress) {
        // SAFETY: `pa` was just taken from the allocator and nothing maps it yet.
        let bytes = unsafe { self.space.mapper().phys_to_mut::<[u8; PAGE_BYTES]>(pa) };
        bytes.fill(0);
    }

    fn release_frame(&self, pa: PhysicalAddress) {
        if let Err(e) = self.phys.lock().free_page(pa) {
            log::warn!("frame {pa} was not allocated: {e}");
        }
    }
}

/// Leaf flags for a user page with the given protection.
const fn leaf_flags(prot: VmaProt) -> PageEntryBits {
    PageEntryBits::user_ro()
        .with_writable(prot.contains(VmaProt::WRITE))
        .with_no_execute(!prot.contains(VmaProt::EXEC))
}

fn page_ceil(va: VirtualAddress) -> Option<VirtualAddress> {
    align_up(va.as_u64(), Size4K::SIZE).map(VirtualAddress::new)
}

fn pages_between(lo: VirtualAddress, hi: VirtualAddress) -> u64 {
    (hi.as_u64() - lo.as_u64()).div_ceil(Size4K::SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_flags_follow_protection() {
        let ro = leaf_flags(VmaProt::READ);
        assert!(ro.present() && ro.user_access());
        assert!(!ro.writable() && ro.no_execute());

        let rwx = leaf_flags(VmaProt::all());
        assert!(rwx.writable() && !rwx.no_execute());
    }

    #[test]
    fn page_helpers_round_up() {
        assert_eq!(page_ceil(VirtualAddress::new(0x1001)), Some(VirtualAddress::new(0x2000)));
        assert_eq!(page_ceil(VirtualAddress::new(u64::MAX)), None);
        assert_eq!(pages_between(VirtualAddress::new(0x1000), VirtualAddress::new(0x3001)), 3);
    }
}
