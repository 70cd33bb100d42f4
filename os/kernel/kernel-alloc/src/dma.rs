//! # DMA Pools
//!
//! Fixed-size block pools for buffers a device reads or writes directly.
//!
//! Each pool is one physically contiguous, uncached run obtained from the
//! [`Vmm`], with both its physical and virtual base aligned to the pool
//! alignment. Block `i` lives at `base + i * block_size` in both address
//! spaces, so a block's physical address never needs a page-table walk.
//!
//! A request `(size, alignment, boundary)` is served from the newest pool
//! whose blocks are large and aligned enough, taking the first free block
//! that is aligned and does not straddle a multiple of `boundary`:
//!
//! ```text
//!            boundary             boundary
//!  ────────────┼────────────────────┼──────────
//!      [block ok]    [block ok] [bl|ock] ✗
//! ```

use crate::vmm::Vmm;
use alloc::vec;
use alloc::vec::Vec;
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K, VirtualAddress, pages_for};
use kernel_vmem::{PageEntryBits, PhysMapper};

/// Shape of one pool.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DmaPoolConfig {
    pub block_size: u64,
    pub alignment: u64,
    pub max_blocks: u64,
}

impl DmaPoolConfig {
    #[must_use]
    pub const fn new(block_size: u64, alignment: u64, max_blocks: u64) -> Self {
        Self {
            block_size,
            alignment,
            max_blocks,
        }
    }
}

/// Pools created by [`DmaAllocator::init`] unless the caller supplies its own.
pub const DEFAULT_DMA_POOLS: [DmaPoolConfig; 5] = [
    DmaPoolConfig::new(64, 64, 16384),
    DmaPoolConfig::new(256, 256, 4096),
    DmaPoolConfig::new(1024, 1024, 2048),
    DmaPoolConfig::new(4096, 4096, 1024),
    DmaPoolConfig::new(64 * 1024, 64 * 1024, 64),
];

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum DmaError {
    #[error("invalid pool: block size {block_size:#x}, alignment {alignment:#x}, {max_blocks} blocks")]
    InvalidPool {
        block_size: u64,
        alignment: u64,
        max_blocks: u64,
    },
    #[error("out of memory for {bytes:#x} bytes of DMA memory")]
    OutOfMemory { bytes: u64 },
    #[error("no pool can serve size {size:#x} with alignment {alignment:#x} within boundary {boundary:#x}")]
    AlignmentViolation { size: u64, alignment: u64, boundary: u64 },
    #[error("{0} does not belong to any DMA pool")]
    NotFound(VirtualAddress),
    #[error("{0} is not the start of a DMA block")]
    InvalidAddress(VirtualAddress),
    #[error("DMA block at {0} is already free")]
    AlreadyFree(VirtualAddress),
}

struct DmaPool {
    block_size: u64,
    alignment: u64,
    max_blocks: u64,
    pages: u64,
    phys_base: PhysicalAddress,
    virt_base: VirtualAddress,
    used: Vec<u64>,
    used_count: u64,
}

impl DmaPool {
    const fn bytes(&self) -> u64 {
        self.block_size * self.max_blocks
    }

    const fn contains(&self, va: VirtualAddress) -> bool {
        let v = va.as_u64();
        v >= self.virt_base.as_u64() && v - self.virt_base.as_u64() < self.bytes()
    }

    fn is_used(&self, block: u64) -> bool {
        #[allow(clippy::cast_possible_truncation)]
        let word = self.used[(block / 64) as usize];
        word & (1 << (block % 64)) != 0
    }

    fn set_used(&mut self, block: u64, used: bool) {
        #[allow(clippy::cast_possible_truncation)]
        let word = &mut self.used[(block / 64) as usize];
        if used {
            *word |= 1 << (block % 64);
            self.used_count += 1;
        } else {
            *word &= !(1 << (block % 64));
            self.used_count -= 1;
        }
    }

    /// First free block satisfying the request, by index.
    fn find_block(&self, size: u64, alignment: u64, boundary: u64) -> Option<u64> {
        (0..self.max_blocks).find(|&i| {
            if self.is_used(i) {
                return false;
            }
            let offset = i * self.block_size;
            let phys = self.phys_base.as_u64() + offset;
            let virt = self.virt_base.as_u64() + offset;
            [phys, virt]
                .into_iter()
                .all(|a| a.is_multiple_of(alignment) && !crosses(a, size, boundary))
        })
    }
}

/// True if `[a, a + size)` straddles a multiple of `boundary` (0 = no limit).
#[inline]
const fn crosses(a: u64, size: u64, boundary: u64) -> bool {
    boundary != 0 && a / boundary != (a + size - 1) / boundary
}

/// All DMA pools of the kernel, behind one lock.
pub struct DmaAllocator {
    pools: spin::Mutex<Vec<DmaPool>>,
}

impl Default for DmaAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaAllocator {
    /// An allocator without pools; see [`init`](Self::init).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pools: spin::Mutex::new(Vec::new()),
        }
    }

    /// Create one pool per entry of `ladder`, replacing any existing pools.
    ///
    /// # Errors
    /// The first [`create_pool`](Self::create_pool) failure; pools created
    /// before it are kept.
    pub fn init<M: PhysMapper>(&self, vmm: &Vmm<'_, '_, M>, ladder: &[DmaPoolConfig]) -> Result<(), DmaError> {
        self.release_all(vmm);
        for cfg in ladder {
            self.create_pool(vmm, cfg.block_size, cfg.alignment, cfg.max_blocks)?;
        }
        Ok(())
    }

    /// Reserve `max_blocks` blocks of `block_size` bytes.
    ///
    /// The effective alignment is the larger of `alignment` and `block_size`,
    /// rounded up to a power of two.
    ///
    /// # Errors
    /// [`DmaError::InvalidPool`] for a zero-sized pool or an unrepresentable
    /// alignment, [`DmaError::OutOfMemory`] if the VMM cannot back it.
    pub fn create_pool<M: PhysMapper>(
        &self,
        vmm: &Vmm<'_, '_, M>,
        block_size: u64,
        alignment: u64,
        max_blocks: u64,
    ) -> Result<(), DmaError> {
        let invalid = DmaError::InvalidPool {
            block_size,
            alignment,
            max_blocks,
        };
        if block_size == 0 || max_blocks == 0 {
            return Err(invalid);
        }
        let alignment = alignment
            .max(block_size)
            .checked_next_power_of_two()
            .ok_or(invalid)?;
        let bytes = block_size.checked_mul(max_blocks).ok_or(invalid)?;
        let pages = pages_for::<Size4K>(bytes);
        let words = usize::try_from(max_blocks.div_ceil(64)).map_err(|_| invalid)?;

        let virt_base = vmm
            .alloc_contiguous_virtual_pages_aligned(pages, alignment.max(Size4K::SIZE), PageEntryBits::kernel_uncached())
            .ok_or(DmaError::OutOfMemory { bytes })?;
        let Some(phys_base) = vmm.virt_to_phys_via_walk(virt_base) else {
            if let Err(e) = vmm.unmap_contiguous_virtual_pages(virt_base, pages) {
                log::warn!("releasing unusable DMA pool at {virt_base}: {e}");
            }
            return Err(DmaError::OutOfMemory { bytes });
        };

        log::info!(
            "DMA pool created: block size {block_size:#x}, alignment {alignment:#x}, {max_blocks} blocks, phys {phys_base}, virt {virt_base}"
        );
        self.pools.lock().push(DmaPool {
            block_size,
            alignment,
            max_blocks,
            pages,
            phys_base,
            virt_base,
            used: vec![0; words],
            used_count: 0,
        });
        Ok(())
    }

    /// A block of at least `size` bytes at an address that is a multiple of
    /// `alignment` (0 means none) and does not cross a multiple of `boundary`
    /// (0 means none). The alignment and boundary hold for both the virtual
    /// and the physical address of the block.
    #[must_use]
    pub fn allocate(&self, size: u64, alignment: u64, boundary: u64) -> Option<VirtualAddress> {
        self.try_allocate(size, alignment, boundary)
            .inspect_err(|e| log::error!("DMA allocation failed: {e}"))
            .ok()
    }

    /// [`allocate`](Self::allocate) with the reason for a failure.
    ///
    /// # Errors
    /// [`DmaError::AlignmentViolation`] if no pool could ever satisfy the
    /// request, [`DmaError::OutOfMemory`] if every eligible pool is full.
    pub fn try_allocate(&self, size: u64, alignment: u64, boundary: u64) -> Result<VirtualAddress, DmaError> {
        let alignment = alignment.max(1);
        let violation = DmaError::AlignmentViolation {
            size,
            alignment,
            boundary,
        };
        if size == 0 || (boundary != 0 && size > boundary) {
            return Err(violation);
        }

        let mut pools = self.pools.lock();
        let mut eligible = false;
        for pool in pools.iter_mut().rev() {
            if pool.block_size < size || pool.alignment < alignment {
                continue;
            }
            eligible = true;
            if let Some(block) = pool.find_block(size, alignment, boundary) {
                pool.set_used(block, true);
                return Ok(pool.virt_base + block * pool.block_size);
            }
        }
        Err(if eligible {
            DmaError::OutOfMemory { bytes: size }
        } else {
            violation
        })
    }

    /// Return the block starting at `va` to its pool.
    ///
    /// # Errors
    /// [`DmaError::NotFound`] outside every pool, [`DmaError::InvalidAddress`]
    /// for an address inside a block, [`DmaError::AlreadyFree`] for a block
    /// that is not allocated. All of them leave the pools unchanged.
    pub fn free(&self, va: VirtualAddress) -> Result<(), DmaError> {
        let mut pools = self.pools.lock();
        let Some(pool) = pools.iter_mut().find(|p| p.contains(va)) else {
            log::warn!("DMA free of {va}: not a DMA address");
            return Err(DmaError::NotFound(va));
        };
        let offset = va.as_u64() - pool.virt_base.as_u64();
        if !offset.is_multiple_of(pool.block_size) {
            log::warn!("DMA free of {va}: not a block start");
            return Err(DmaError::InvalidAddress(va));
        }
        let block = offset / pool.block_size;
        if !pool.is_used(block) {
            log::warn!("DMA free of {va}: block #{block} is already free");
            return Err(DmaError::AlreadyFree(va));
        }
        pool.set_used(block, false);
        Ok(())
    }

    /// Physical address of a DMA address, or `None` outside every pool.
    #[must_use]
    pub fn physical_address(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.pools
            .lock()
            .iter()
            .find(|p| p.contains(va))
            .map(|p| p.phys_base + (va.as_u64() - p.virt_base.as_u64()))
    }

    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.pools.lock().len()
    }

    /// Blocks currently handed out, across all pools.
    #[must_use]
    pub fn used_blocks(&self) -> u64 {
        self.pools.lock().iter().map(|p| p.used_count).sum()
    }

    pub fn log_pools(&self) {
        let pools = self.pools.lock();
        log::debug!("DMA pools:");
        for (i, p) in pools.iter().enumerate() {
            log::debug!(
                "  #{i}: block size {:#x}, alignment {:#x}, {}/{} used, phys {}, virt {}",
                p.block_size,
                p.alignment,
                p.used_count,
                p.max_blocks,
                p.phys_base,
                p.virt_base
            );
        }
    }

    /// Drop every pool and give its memory back to `vmm`.
    ///
    /// Blocks still handed out become dangling; this is a shutdown path.
    pub fn release_all<M: PhysMapper>(&self, vmm: &Vmm<'_, '_, M>) {
        let pools = core::mem::take(&mut *self.pools.lock());
        for pool in pools {
            if pool.used_count > 0 {
                log::warn!(
                    "releasing DMA pool at {} with {} block(s) still in use",
                    pool.virt_base,
                    pool.used_count
                );
            }
            if let Err(e) = vmm.unmap_contiguous_virtual_pages(pool.virt_base, pool.pages) {
                log::error!("releasing DMA pool at {}: {e}", pool.virt_base);
            }
        }
    }
}
