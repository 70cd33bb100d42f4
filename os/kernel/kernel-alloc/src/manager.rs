//! The kernel's memory services, constructed once at boot.
//!
//! [`MemoryManager`] owns the [`Vmm`] (and through it the physical allocator)
//! and the [`DmaAllocator`]. Subsystems receive a reference to it instead of
//! reaching for globals; [`MemoryManager::shutdown`] undoes [`MemoryManager::init`].

use crate::bitmap::BitmapError;
use crate::dma::{DmaAllocator, DmaError, DmaPoolConfig};
use crate::frame_alloc::BitmapFrameAlloc;
use crate::virt_range::VirtualRangeAlloc;
use crate::vmm::Vmm;
use kernel_info::boot::MemoryRegion;
use kernel_info::memory::{KERNEL_VMM_BASE, KERNEL_VMM_SIZE};
use kernel_memory_addresses::{PageSize, PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::PhysMapper;

pub struct MemoryManager<'buf, 'm, M: PhysMapper> {
    vmm: Vmm<'buf, 'm, M>,
    dma: DmaAllocator,
}

impl<'buf, 'm, M: PhysMapper> MemoryManager<'buf, 'm, M> {
    #[must_use]
    pub const fn new(vmm: Vmm<'buf, 'm, M>) -> Self {
        Self {
            vmm,
            dma: DmaAllocator::new(),
        }
    }

    /// Build the physical allocator from the boot memory map and a kernel
    /// window starting at [`KERNEL_VMM_BASE`] as large as `window_buf` can
    /// track (at most [`KERNEL_VMM_SIZE`]).
    ///
    /// The frames holding both buffers and `kernel_root` must be marked used
    /// afterwards through [`Vmm::physical`], before anything is allocated.
    ///
    /// # Errors
    /// A [`BitmapError`] if either buffer is too small.
    pub fn from_memory_map(
        mapper: &'m M,
        regions: &[MemoryRegion],
        phys_buf: &'buf mut [u8],
        window_buf: &'buf mut [u8],
        kernel_root: PhysicalPage<Size4K>,
    ) -> Result<Self, BitmapError> {
        let phys = BitmapFrameAlloc::from_memory_map(regions, phys_buf)?;
        let window_pages = (window_buf.len() as u64 * 8).min(KERNEL_VMM_SIZE / Size4K::SIZE);
        let window = VirtualRangeAlloc::new(VirtualAddress::new(KERNEL_VMM_BASE), window_pages, window_buf)?;
        Ok(Self::new(Vmm::new(mapper, phys, window, kernel_root)))
    }

    /// Create the DMA pools in `ladder`
    /// (usually [`DEFAULT_DMA_POOLS`](crate::dma::DEFAULT_DMA_POOLS)).
    ///
    /// # Errors
    /// The first pool that could not be created.
    pub fn init(&self, ladder: &[DmaPoolConfig]) -> Result<(), DmaError> {
        self.dma.init(&self.vmm, ladder)?;
        let phys = self.vmm.physical().lock();
        log::info!(
            "memory manager up: {} of {} frames free, {} DMA pool(s)",
            phys.free_frames(),
            phys.total_frames(),
            self.dma.pool_count()
        );
        Ok(())
    }

    #[must_use]
    pub const fn vmm(&self) -> &Vmm<'buf, 'm, M> {
        &self.vmm
    }

    #[must_use]
    pub const fn dma(&self) -> &DmaAllocator {
        &self.dma
    }

    /// # Errors
    /// See [`DmaAllocator::create_pool`].
    pub fn create_dma_pool(&self, block_size: u64, alignment: u64, max_blocks: u64) -> Result<(), DmaError> {
        self.dma.create_pool(&self.vmm, block_size, alignment, max_blocks)
    }

    #[must_use]
    pub fn dma_allocate(&self, size: u64, alignment: u64, boundary: u64) -> Option<VirtualAddress> {
        self.dma.allocate(size, alignment, boundary)
    }

    /// # Errors
    /// See [`DmaAllocator::free`].
    pub fn dma_free(&self, va: VirtualAddress) -> Result<(), DmaError> {
        self.dma.free(va)
    }

    /// Release the DMA pools and hand the VMM back to the caller.
    #[must_use]
    pub fn shutdown(self) -> Vmm<'buf, 'm, M> {
        self.dma.release_all(&self.vmm);
        log::info!("memory manager shut down");
        self.vmm
    }
}
