//! Kernel Virtual Memory Manager (VMM).
//!
//! Pairs three resources behind one call: a range of the kernel virtual
//! window, the physical frames backing it, and the page-table entries that
//! join the two. Each allocation either completes or releases every part it
//! obtained before returning `None`.
//!
//! # Locking
//! The VMM state lock is held for the whole of every mutating call. Frames are
//! taken from the physical allocator while that lock is held, one short
//! critical section at a time, so the order is always VMM before physical.
//!
//! # Example
//! ```ignore
//! use kernel_alloc::vmm::Vmm;
//! use kernel_vmem::PageEntryBits;
//!
//! let va = vmm.alloc_contiguous_virtual_pages(4, PageEntryBits::kernel_rw()).unwrap();
//! vmm.unmap_contiguous_virtual_pages(va, 4)?;
//! ```

use crate::bitmap::BitmapError;
use crate::frame_alloc::{BitmapFrameAlloc, PhysicalMemory, SharedFrameAlloc};
use crate::phys_mapper::phys_to_virt_linear;
use crate::virt_range::VirtualRangeAlloc;
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::{AddressSpace, MapError, PageEntryBits, PhysMapper, UnmapError};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmmError {
    #[error("out of physical memory")]
    OutOfPhysicalMemory,
    #[error("kernel virtual window exhausted")]
    OutOfVirtualSpace,
    #[error("{0} is not a page-aligned address owned by the VMM")]
    InvalidAddress(VirtualAddress),
    #[error("nothing is mapped at {0}")]
    NotFound(VirtualAddress),
    #[error("alignment {0:#x} is not a power of two")]
    InvalidAlignment(u64),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Unmap(#[from] UnmapError),
    #[error(transparent)]
    Bitmap(#[from] BitmapError),
}

struct VmmState<'buf, 'm, M: PhysMapper> {
    space: AddressSpace<'m, M>,
    window: VirtualRangeAlloc<'buf>,
}

/// The kernel's virtual memory manager.
pub struct Vmm<'buf, 'm, M: PhysMapper> {
    phys: PhysicalMemory<'buf>,
    state: spin::Mutex<VmmState<'buf, 'm, M>>,
}

impl<'buf, 'm, M: PhysMapper> Vmm<'buf, 'm, M> {
    /// Manage the kernel address space rooted at `kernel_root`.
    #[must_use]
    pub fn new(
        mapper: &'m M,
        phys: BitmapFrameAlloc<'buf>,
        window: VirtualRangeAlloc<'buf>,
        kernel_root: PhysicalPage<Size4K>,
    ) -> Self {
        Self {
            phys: spin::Mutex::new(phys),
            state: spin::Mutex::new(VmmState {
                space: AddressSpace::from_root(mapper, kernel_root),
                window,
            }),
        }
    }

    /// Like [`new`](Self::new), but builds an empty kernel root from `phys`.
    #[must_use]
    pub fn with_fresh_root(
        mapper: &'m M,
        mut phys: BitmapFrameAlloc<'buf>,
        window: VirtualRangeAlloc<'buf>,
    ) -> Option<Self> {
        let space = AddressSpace::new(mapper, &mut phys)?;
        Some(Self::new(mapper, phys, window, space.root()))
    }

    /// The physical allocator shared with every other memory consumer.
    #[must_use]
    pub const fn physical(&self) -> &PhysicalMemory<'buf> {
        &self.phys
    }

    /// A [`FrameAlloc`](kernel_vmem::FrameAlloc) drawing from the shared physical allocator.
    #[must_use]
    pub const fn frame_alloc(&self) -> SharedFrameAlloc<'_, 'buf> {
        SharedFrameAlloc(&self.phys)
    }

    /// Root of the kernel translation tree.
    #[must_use]
    pub fn kernel_root(&self) -> PhysicalPage<Size4K> {
        self.state.lock().space.root()
    }

    /// A new process address space sharing the kernel half of the tree.
    #[must_use]
    pub fn create_user_space(&self) -> Option<AddressSpace<'m, M>> {
        let st = self.state.lock();
        AddressSpace::new_user(st.space.mapper(), &mut self.frame_alloc(), &st.space)
    }

    /// Translate a kernel virtual address through the page tables.
    #[must_use]
    pub fn virt_to_phys_via_walk(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.state.lock().space.get_physical_address(va)
    }

    /// Pages still available in the kernel virtual window.
    #[must_use]
    pub fn free_virtual_pages(&self) -> u64 {
        self.state.lock().window.free_pages()
    }

    /// One fresh frame mapped at a fresh kernel page.
    #[must_use]
    pub fn alloc_virtual_page(&self, flags: PageEntryBits) -> Option<VirtualAddress> {
        self.alloc_virtual_pages(1, flags)
    }

    /// `count` contiguous kernel pages, each backed by its own frame.
    #[must_use]
    pub fn alloc_virtual_pages(&self, count: u64, flags: PageEntryBits) -> Option<VirtualAddress> {
        report("alloc_virtual_pages", count, self.try_alloc_virtual_pages(count, flags))
    }

    /// `count` kernel pages backed by one physically contiguous run.
    #[must_use]
    pub fn alloc_contiguous_virtual_pages(&self, count: u64, flags: PageEntryBits) -> Option<VirtualAddress> {
        self.alloc_contiguous_virtual_pages_aligned(count, Size4K::SIZE, flags)
    }

    /// Like [`alloc_contiguous_virtual_pages`](Self::alloc_contiguous_virtual_pages),
    /// with both the virtual and the physical base aligned to `alignment`.
    #[must_use]
    pub fn alloc_contiguous_virtual_pages_aligned(
        &self,
        count: u64,
        alignment: u64,
        flags: PageEntryBits,
    ) -> Option<VirtualAddress> {
        report(
            "alloc_contiguous_virtual_pages",
            count,
            self.try_alloc_contiguous_virtual_pages_aligned(count, alignment, flags),
        )
    }

    /// Map a frame the caller already owns at a fresh kernel page.
    #[must_use]
    pub fn map_physical_page(&self, pa: PhysicalAddress, flags: PageEntryBits) -> Option<VirtualAddress> {
        self.map_contiguous_physical_pages(pa, 1, flags)
    }

    /// Map an owned, physically contiguous range at fresh kernel pages.
    #[must_use]
    pub fn map_contiguous_physical_pages(
        &self,
        pa: PhysicalAddress,
        count: u64,
        flags: PageEntryBits,
    ) -> Option<VirtualAddress> {
        report(
            "map_contiguous_physical_pages",
            count,
            self.try_map_physical(pa, count, flags),
        )
    }

    /// One frame reached through the linear window; never unmapped.
    #[must_use]
    pub fn alloc_linear_mapped_persistent_page(&self) -> Option<VirtualAddress> {
        self.alloc_linear_mapped_persistent_pages(1)
    }

    /// `count` contiguous frames reached through the linear window.
    #[must_use]
    pub fn alloc_linear_mapped_persistent_pages(&self, count: u64) -> Option<VirtualAddress> {
        let _st = self.state.lock();
        let mut phys = self.phys.lock();
        let pa = phys.alloc_pages(count)?;
        if let Some(va) = phys_to_virt_linear(pa) {
            return Some(va);
        }
        if let Err(e) = phys.free_pages(pa, count) {
            log::error!("releasing frames above the linear window failed: {e}");
        }
        None
    }

    /// Undo [`alloc_virtual_page`](Self::alloc_virtual_page).
    ///
    /// # Errors
    /// See [`unmap_contiguous_virtual_pages`](Self::unmap_contiguous_virtual_pages).
    pub fn unmap_virtual_page(&self, va: VirtualAddress) -> Result<(), VmmError> {
        self.unmap_contiguous_virtual_pages(va, 1)
    }

    /// Unmap `count` pages from `va`, free their frames, and return the range
    /// to the window.
    ///
    /// # Errors
    /// [`VmmError::InvalidAddress`] if a page is not an allocated window page,
    /// [`VmmError::NotFound`] if a page has no translation. Nothing is
    /// released unless the whole range checks out.
    pub fn unmap_contiguous_virtual_pages(&self, va: VirtualAddress, count: u64) -> Result<(), VmmError> {
        self.unmap_range(va, count, true)
    }

    /// Undo [`map_physical_page`](Self::map_physical_page); the frame stays with its owner.
    ///
    /// # Errors
    /// See [`unmap_contiguous_virtual_pages`](Self::unmap_contiguous_virtual_pages).
    pub fn unmap_physical_page(&self, va: VirtualAddress) -> Result<(), VmmError> {
        self.unmap_contiguous_physical_pages(va, 1)
    }

    /// Undo [`map_contiguous_physical_pages`](Self::map_contiguous_physical_pages).
    ///
    /// # Errors
    /// See [`unmap_contiguous_virtual_pages`](Self::unmap_contiguous_virtual_pages).
    pub fn unmap_contiguous_physical_pages(&self, va: VirtualAddress, count: u64) -> Result<(), VmmError> {
        self.unmap_range(va, count, false)
    }

    /// Hand back the physical allocator, e.g. on shutdown. The kernel tree and
    /// window are dropped as they are.
    #[must_use]
    pub fn into_physical(self) -> BitmapFrameAlloc<'buf> {
        self.phys.into_inner()
    }

    fn try_alloc_virtual_pages(&self, count: u64, flags: PageEntryBits) -> Result<VirtualAddress, VmmError> {
        let mut st = self.state.lock();
        let va = st.window.alloc(count).ok_or(VmmError::OutOfVirtualSpace)?;

        for i in 0..count {
            let page = va + i * Size4K::SIZE;
            // Bound first so the physical lock is released before mapping.
            let frame = self.phys.lock().alloc_page();
            let mapped = match frame {
                None => Err(VmmError::OutOfPhysicalMemory),
                Some(pa) => st
                    .space
                    .map_page(&mut self.frame_alloc(), page, pa, flags)
                    .map_err(|e| {
                        self.release_frames(pa, 1);
                        VmmError::from(e)
                    }),
            };
            if let Err(e) = mapped {
                self.unmap_pages(&mut st, va, i, true);
                release_window(&mut st, va, count);
                return Err(e);
            }
        }
        Ok(va)
    }

    /// [`alloc_contiguous_virtual_pages_aligned`](Self::alloc_contiguous_virtual_pages_aligned)
    /// with the failure reason.
    ///
    /// # Errors
    /// [`VmmError::InvalidAlignment`] unless `alignment` is a power of two,
    /// otherwise whichever resource ran out first. Nothing is kept on failure.
    pub fn try_alloc_contiguous_virtual_pages_aligned(
        &self,
        count: u64,
        alignment: u64,
        flags: PageEntryBits,
    ) -> Result<VirtualAddress, VmmError> {
        if !alignment.is_power_of_two() {
            return Err(VmmError::InvalidAlignment(alignment));
        }
        let mut st = self.state.lock();
        let pa = self
            .phys
            .lock()
            .alloc_pages_aligned(count, alignment)
            .ok_or(VmmError::OutOfPhysicalMemory)?;
        let Some(va) = st.window.alloc_aligned(count, alignment) else {
            self.release_frames(pa, count);
            return Err(VmmError::OutOfVirtualSpace);
        };
        if let Err(e) = st.space.map_pages(&mut self.frame_alloc(), va, pa, count, flags) {
            self.release_frames(pa, count);
            release_window(&mut st, va, count);
            return Err(e.into());
        }
        Ok(va)
    }

    fn try_map_physical(
        &self,
        pa: PhysicalAddress,
        count: u64,
        flags: PageEntryBits,
    ) -> Result<VirtualAddress, VmmError> {
        let mut st = self.state.lock();
        let va = st.window.alloc(count).ok_or(VmmError::OutOfVirtualSpace)?;
        if let Err(e) = st.space.map_pages(&mut self.frame_alloc(), va, pa, count, flags) {
            release_window(&mut st, va, count);
            return Err(e.into());
        }
        Ok(va)
    }

    fn unmap_range(&self, va: VirtualAddress, count: u64, owned: bool) -> Result<(), VmmError> {
        let mut st = self.state.lock();
        if count == 0 || !va.is_aligned_to(Size4K::SIZE) {
            return Err(VmmError::InvalidAddress(va));
        }
        for i in 0..count {
            let page = va
                .checked_add(i * Size4K::SIZE)
                .ok_or(VmmError::InvalidAddress(va))?;
            if !st.window.is_allocated(page) {
                return Err(VmmError::InvalidAddress(page));
            }
            if st.space.get_physical_address(page).is_none() {
                return Err(VmmError::NotFound(page));
            }
        }
        self.unmap_pages(&mut st, va, count, owned);
        st.window.free(va, count)?;
        Ok(())
    }

    /// Clear `count` leaves from `va`, freeing the frames when `owned`.
    fn unmap_pages(&self, st: &mut VmmState<'buf, 'm, M>, va: VirtualAddress, count: u64, owned: bool) {
        for i in 0..count {
            let page = va + i * Size4K::SIZE;
            match st.space.unmap_page(page) {
                Ok(pa) if owned => self.release_frames(pa, 1),
                Ok(_) => {}
                Err(e) => log::warn!("unmapping {page}: {e}"),
            }
        }
    }

    fn release_frames(&self, pa: PhysicalAddress, count: u64) {
        if let Err(e) = self.phys.lock().free_pages(pa, count) {
            log::warn!("releasing {count} frame(s) at {pa}: {e}");
        }
    }
}

fn release_window<M: PhysMapper>(st: &mut VmmState<'_, '_, M>, va: VirtualAddress, count: u64) {
    if let Err(e) = st.window.free(va, count) {
        log::warn!("returning {count} page(s) at {va} to the window: {e}");
    }
}

fn report(op: &str, count: u64, result: Result<VirtualAddress, VmmError>) -> Option<VirtualAddress> {
    result
        .inspect_err(|e| log::debug!("{op}({count}) failed: {e}"))
        .ok()
}
