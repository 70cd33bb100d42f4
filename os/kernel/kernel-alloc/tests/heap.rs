mod common;

use common::{PAGE, Rig};
use kernel_alloc::heap::{HeapSource, KernelHeap};
use kernel_info::memory::KERNEL_VMM_BASE;
use kernel_memory_addresses::VirtualAddress;

#[test]
fn vmm_backs_heap_growth_with_mapped_window_pages() {
    let mut rig = Rig::new(64, 64);
    let vmm = rig.vmm();

    let base = vmm.grow(3).unwrap();
    let va = VirtualAddress::new(base.as_ptr().addr() as u64);
    assert_eq!(va, VirtualAddress::new(KERNEL_VMM_BASE));
    assert_eq!(vmm.free_virtual_pages(), 61);
    let frames: Vec<_> = (0..3)
        .map(|i| vmm.virt_to_phys_via_walk(va + i * PAGE).unwrap())
        .collect();
    assert!(frames.iter().all(|&pa| vmm.physical().lock().is_used(pa)));

    // More pages than there are frames left: nothing is kept.
    let frames_before = vmm.physical().lock().free_frames();
    assert_eq!(vmm.grow(61), None);
    assert_eq!(vmm.free_virtual_pages(), 61);
    assert_eq!(vmm.physical().lock().free_frames(), frames_before);
}

#[test]
fn empty_heap_takes_nothing_until_asked() {
    let mut rig = Rig::new(64, 64);
    let vmm = rig.vmm();
    let heap = KernelHeap::new(&vmm);

    assert_eq!(heap.allocate(0), None);
    assert_eq!(heap.stats().total_bytes, 0);
    assert_eq!(heap.check(), Ok(0));
    assert_eq!(vmm.free_virtual_pages(), 64);
}
