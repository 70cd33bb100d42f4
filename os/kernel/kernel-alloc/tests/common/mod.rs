#![allow(dead_code)]

use kernel_alloc::bitmap::{InitialState, PageBitmap};
use kernel_alloc::frame_alloc::BitmapFrameAlloc;
use kernel_alloc::virt_range::VirtualRangeAlloc;
use kernel_alloc::vmm::Vmm;
use kernel_info::memory::KERNEL_VMM_BASE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::testing::SimulatedPhysMemory;

/// Simulated RAM plus the bookkeeping buffers a [`Vmm`] borrows.
pub struct Rig {
    pub mem: SimulatedPhysMemory,
    phys_buf: Vec<u8>,
    window_buf: Vec<u8>,
    frames: u64,
    window_pages: u64,
}

impl Rig {
    pub fn new(frames: u64, window_pages: u64) -> Self {
        Self {
            mem: SimulatedPhysMemory::new(frames),
            phys_buf: vec![0; PageBitmap::required_bytes(frames)],
            window_buf: vec![0; PageBitmap::required_bytes(window_pages)],
            frames,
            window_pages,
        }
    }

    /// A VMM over all simulated frames except frame 0, with a fresh kernel root.
    pub fn vmm(&mut self) -> Vmm<'_, '_, SimulatedPhysMemory> {
        let Self {
            mem,
            phys_buf,
            window_buf,
            frames,
            window_pages,
        } = self;
        let mut phys = BitmapFrameAlloc::new(*frames, phys_buf, InitialState::AllFree).unwrap();
        phys.mark_used(PhysicalAddress::zero()).unwrap();
        let window =
            VirtualRangeAlloc::new(VirtualAddress::new(KERNEL_VMM_BASE), *window_pages, window_buf).unwrap();
        Vmm::with_fresh_root(&*mem, phys, window).unwrap()
    }
}

pub const PAGE: u64 = 4096;
