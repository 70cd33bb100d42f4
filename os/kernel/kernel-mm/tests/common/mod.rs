#![allow(dead_code)]

use kernel_alloc::bitmap::{InitialState, PageBitmap};
use kernel_alloc::frame_alloc::BitmapFrameAlloc;
use kernel_alloc::virt_range::VirtualRangeAlloc;
use kernel_alloc::vmm::Vmm;
use kernel_info::memory::KERNEL_VMM_BASE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::testing::SimulatedPhysMemory;

pub const PAGE: u64 = 4096;
const WINDOW_PAGES: u64 = 64;

/// Bookkeeping buffers for a [`Vmm`] over simulated RAM.
///
/// The RAM itself is kept apart so tests can inspect frames while the VMM
/// borrows it.
pub struct Rig {
    phys_buf: Vec<u8>,
    window_buf: Vec<u8>,
    frames: u64,
}

impl Rig {
    /// Simulated RAM of `frames` frames, all but frame 0 filled with garbage.
    pub fn new(frames: u64) -> (SimulatedPhysMemory, Self) {
        let mem = SimulatedPhysMemory::new(frames);
        mem.fill(PhysicalAddress::new(PAGE), 0xAA, ((mem.frames() - 1) * PAGE) as usize);
        let rig = Self {
            phys_buf: vec![0; PageBitmap::required_bytes(frames)],
            window_buf: vec![0; PageBitmap::required_bytes(WINDOW_PAGES)],
            frames,
        };
        (mem, rig)
    }

    /// A VMM over every frame except frame 0, with a fresh kernel root.
    pub fn vmm<'r, 'm>(&'r mut self, mem: &'m SimulatedPhysMemory) -> Vmm<'r, 'm, SimulatedPhysMemory> {
        let mut phys = BitmapFrameAlloc::new(self.frames, &mut self.phys_buf, InitialState::AllFree).unwrap();
        phys.mark_used(PhysicalAddress::zero()).unwrap();
        let window =
            VirtualRangeAlloc::new(VirtualAddress::new(KERNEL_VMM_BASE), WINDOW_PAGES, &mut self.window_buf).unwrap();
        Vmm::with_fresh_root(mem, phys, window).unwrap()
    }
}

pub fn free_frames(vmm: &Vmm<'_, '_, SimulatedPhysMemory>) -> u64 {
    vmm.physical().lock().free_frames()
}
