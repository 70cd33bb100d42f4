mod common;

use common::{PAGE, Rig};
use kernel_alloc::vmm::VmmError;
use kernel_info::memory::{HHDM_BASE, KERNEL_VMM_BASE};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PageEntryBits;

#[test]
fn contiguous_pages_unmap_cleanly() {
    let mut rig = Rig::new(64, 64);
    let vmm = rig.vmm();

    let base = vmm
        .alloc_contiguous_virtual_pages(4, PageEntryBits::kernel_rw())
        .unwrap();
    assert_eq!(base, VirtualAddress::new(KERNEL_VMM_BASE));

    let pa0 = vmm.virt_to_phys_via_walk(base).unwrap();
    for i in 0..4 {
        assert_eq!(vmm.virt_to_phys_via_walk(base + i * PAGE), Some(pa0 + i * PAGE));
        assert!(vmm.physical().lock().is_used(pa0 + i * PAGE));
    }

    vmm.unmap_contiguous_virtual_pages(base, 4).unwrap();
    for i in 0..4 {
        assert_eq!(vmm.virt_to_phys_via_walk(base + i * PAGE), None);
        assert!(vmm.physical().lock().is_free(pa0 + i * PAGE));
    }
    assert_eq!(vmm.free_virtual_pages(), 64);
}

#[test]
fn scattered_pages_get_distinct_frames() {
    let mut rig = Rig::new(64, 64);
    let vmm = rig.vmm();

    let va = vmm.alloc_virtual_pages(3, PageEntryBits::kernel_rw()).unwrap();
    let frames: Vec<PhysicalAddress> = (0..3)
        .map(|i| vmm.virt_to_phys_via_walk(va + i * PAGE).unwrap())
        .collect();
    assert_ne!(frames[0], frames[1]);
    assert_ne!(frames[1], frames[2]);
    assert_ne!(frames[0], frames[2]);

    let single = vmm.alloc_virtual_page(PageEntryBits::kernel_rw()).unwrap();
    assert_eq!(single, va + 3 * PAGE);
    vmm.unmap_virtual_page(single).unwrap();
    vmm.unmap_contiguous_virtual_pages(va, 3).unwrap();
}

#[test]
fn failed_allocation_leaks_nothing() {
    let mut rig = Rig::new(64, 64);
    let vmm = rig.vmm();

    // Build the page-table chain for the window first.
    let warm = vmm.alloc_virtual_page(PageEntryBits::kernel_rw()).unwrap();

    let mut held = Vec::new();
    while let Some(pa) = vmm.physical().lock().alloc_page() {
        held.push(pa);
    }
    let spare = [held.pop().unwrap(), held.pop().unwrap()];
    for pa in spare {
        vmm.physical().lock().free_page(pa).unwrap();
    }
    let window_before = vmm.free_virtual_pages();

    assert_eq!(vmm.alloc_virtual_pages(3, PageEntryBits::kernel_rw()), None);
    assert_eq!(vmm.alloc_contiguous_virtual_pages(3, PageEntryBits::kernel_rw()), None);

    assert_eq!(vmm.free_virtual_pages(), window_before);
    assert!(spare.iter().all(|&pa| vmm.physical().lock().is_free(pa)));
    assert_eq!(vmm.virt_to_phys_via_walk(warm + PAGE), None);
    assert_eq!(vmm.physical().lock().free_frames(), 2);
}

#[test]
fn aligned_contiguous_pages() {
    let mut rig = Rig::new(64, 64);
    let vmm = rig.vmm();
    // Misalign both allocators first.
    let _ = vmm.alloc_virtual_page(PageEntryBits::kernel_rw()).unwrap();

    let va = vmm
        .alloc_contiguous_virtual_pages_aligned(2, 0x4000, PageEntryBits::kernel_uncached())
        .unwrap();
    let pa = vmm.virt_to_phys_via_walk(va).unwrap();
    assert!(va.is_aligned_to(0x4000));
    assert!(pa.is_aligned_to(0x4000));
    assert_eq!(vmm.virt_to_phys_via_walk(va + PAGE), Some(pa + PAGE));
}

#[test]
fn odd_alignment_is_refused_before_anything_is_taken() {
    let mut rig = Rig::new(64, 64);
    let vmm = rig.vmm();
    let frames_before = vmm.physical().lock().free_frames();

    for alignment in [0, 0x3000, 0x5000] {
        assert_eq!(
            vmm.alloc_contiguous_virtual_pages_aligned(1, alignment, PageEntryBits::kernel_rw()),
            None
        );
    }
    assert_eq!(
        vmm.try_alloc_contiguous_virtual_pages_aligned(1, 0x3000, PageEntryBits::kernel_rw()),
        Err(VmmError::InvalidAlignment(0x3000))
    );
    assert_eq!(vmm.free_virtual_pages(), 64);

    let phys = vmm.into_physical();
    assert_eq!(phys.free_frames(), frames_before);
}

#[test]
fn mapping_owned_frames_does_not_free_them() {
    let mut rig = Rig::new(64, 64);
    let vmm = rig.vmm();

    let pa = vmm.physical().lock().alloc_pages(2).unwrap();
    let va = vmm
        .map_contiguous_physical_pages(pa, 2, PageEntryBits::kernel_rw())
        .unwrap();
    assert_eq!(vmm.virt_to_phys_via_walk(va + PAGE + 0x10), Some(pa + PAGE + 0x10));

    vmm.unmap_contiguous_physical_pages(va, 2).unwrap();
    assert_eq!(vmm.virt_to_phys_via_walk(va), None);
    assert!(vmm.physical().lock().is_used(pa));
    assert!(vmm.physical().lock().is_used(pa + PAGE));

    let one = vmm.map_physical_page(pa, PageEntryBits::kernel_rw()).unwrap();
    vmm.unmap_physical_page(one).unwrap();
    assert!(vmm.physical().lock().is_used(pa));
}

#[test]
fn linear_pages_bypass_the_page_tables() {
    let mut rig = Rig::new(64, 64);
    let vmm = rig.vmm();

    let va = vmm.alloc_linear_mapped_persistent_pages(2).unwrap();
    let pa = PhysicalAddress::new(va.as_u64() - HHDM_BASE);
    assert!(vmm.physical().lock().is_used(pa));
    assert!(vmm.physical().lock().is_used(pa + PAGE));
    assert_eq!(vmm.virt_to_phys_via_walk(va), None);
    assert_eq!(vmm.free_virtual_pages(), 64);

    assert!(vmm.alloc_linear_mapped_persistent_page().is_some());
}

#[test]
fn bad_unmaps_are_rejected_whole() {
    let mut rig = Rig::new(64, 64);
    let vmm = rig.vmm();
    let va = vmm.alloc_virtual_pages(2, PageEntryBits::kernel_rw()).unwrap();

    assert_eq!(
        vmm.unmap_virtual_page(va + 0x10),
        Err(VmmError::InvalidAddress(va + 0x10))
    );
    assert_eq!(
        vmm.unmap_contiguous_virtual_pages(va, 3),
        Err(VmmError::InvalidAddress(va + 2 * PAGE))
    );
    assert!(vmm.virt_to_phys_via_walk(va).is_some());
    assert!(vmm.virt_to_phys_via_walk(va + PAGE).is_some());

    let outside = VirtualAddress::new(HHDM_BASE);
    assert_eq!(vmm.unmap_virtual_page(outside), Err(VmmError::InvalidAddress(outside)));
}

#[test]
fn user_spaces_share_the_kernel_half() {
    let mut rig = Rig::new(64, 64);
    let vmm = rig.vmm();
    let va = vmm.alloc_virtual_page(PageEntryBits::kernel_rw()).unwrap();

    let user = vmm.create_user_space().unwrap();
    assert_ne!(user.root(), vmm.kernel_root());
    assert_eq!(user.get_physical_address(va), vmm.virt_to_phys_via_walk(va));
    user.release_user_tables(&mut vmm.frame_alloc());
}
