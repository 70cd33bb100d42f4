mod common;

use common::{PAGE, Rig, free_frames};
use kernel_info::memory::{HEAP_REGION_START, MMAP_REGION_START};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};
use kernel_mm::{FileBacking, MmContext, MmError, UserLayout, VmaProt, VmaType};
use kernel_vmem::{AddressSpace, MapError, PageEntryBits, PhysMapper};

const RW: VmaProt = VmaProt::READ.union(VmaProt::WRITE);

fn va(v: u64) -> VirtualAddress {
    VirtualAddress::new(v)
}

#[test]
fn brk_grows_and_shrinks() {
    let (mem, mut rig) = Rig::new(128);
    let vmm = rig.vmm(&mem);
    let mut ctx = MmContext::for_vmm(&vmm, UserLayout::default()).unwrap();
    let start = va(HEAP_REGION_START);
    ctx.init_heap(start).unwrap();
    assert_eq!(ctx.heap_end(), start);

    assert_eq!(ctx.set_heap_end(start + 0x2800), start + 0x2800);
    for i in 0..3 {
        let pa = ctx.translate(start + i * PAGE).unwrap();
        assert!(mem.is_zeroed(PhysicalPage::containing(pa)));
        assert!(ctx.address_space().leaf_entry(start + i * PAGE).unwrap().writable());
    }
    assert_eq!(ctx.translate(start + 3 * PAGE), None);
    assert_eq!(ctx.vma_count(), 1);
    assert!(ctx.check_vma_flags(start + 0x2fff, RW));

    // Growing again extends the same area.
    assert_eq!(ctx.set_heap_end(start + 5 * PAGE), start + 5 * PAGE);
    assert_eq!(ctx.vma_count(), 1);
    let heap = *ctx.find_vma(start).unwrap();
    assert_eq!((heap.start(), heap.end()), (start, start + 5 * PAGE));

    let dropped: Vec<PhysicalAddress> = (1..5).map(|i| ctx.translate(start + i * PAGE).unwrap()).collect();
    assert_eq!(ctx.set_heap_end(start + PAGE), start + PAGE);
    assert_eq!(ctx.find_vma(start).map(|a| a.end()), Some(start + PAGE));
    for (i, pa) in (1..5).zip(&dropped) {
        assert_eq!(ctx.translate(start + i * PAGE), None);
        assert!(vmm.physical().lock().is_free(*pa));
    }

    assert_eq!(ctx.set_heap_end(start), start);
    assert_eq!(ctx.vma_count(), 0);
    assert_eq!(ctx.translate(start), None);
}

#[test]
fn refused_brk_keeps_the_old_break() {
    let (mem, mut rig) = Rig::new(32);
    let vmm = rig.vmm(&mem);
    let mut ctx = MmContext::for_vmm(&vmm, UserLayout::default()).unwrap();
    let start = va(HEAP_REGION_START);

    assert_eq!(ctx.try_set_heap_end(start), Err(MmError::InvalidAddress(start)));
    ctx.init_heap(start).unwrap();
    let below = va(HEAP_REGION_START - PAGE);
    assert_eq!(ctx.try_set_heap_end(below), Err(MmError::InvalidAddress(below)));

    // Warm the page tables so the failure below allocates none.
    ctx.set_heap_end(start + PAGE);
    ctx.set_heap_end(start);
    let before = free_frames(&vmm);

    assert_eq!(ctx.try_set_heap_end(start + 64 * PAGE), Err(MmError::OutOfMemory));
    assert_eq!(ctx.set_heap_end(start + 64 * PAGE), start);
    assert_eq!(free_frames(&vmm), before);
    assert_eq!(ctx.translate(start), None);
    assert_eq!(ctx.vma_count(), 0);

    ctx.create_vma(start + 2 * PAGE, PAGE, VmaProt::READ, VmaType::PRIVATE, None, 0)
        .unwrap();
    assert_eq!(
        ctx.try_set_heap_end(start + 3 * PAGE),
        Err(MmError::Conflict(start + 2 * PAGE))
    );
    assert_eq!(ctx.heap_end(), start);
    assert_eq!(free_frames(&vmm), before);
    assert_eq!(ctx.try_set_heap_end(start + 2 * PAGE), Ok(start + 2 * PAGE));
}

#[test]
fn anonymous_mappings_are_placed_backed_and_merged() {
    let (mem, mut rig) = Rig::new(128);
    let vmm = rig.vmm(&mem);
    let mut ctx = MmContext::for_vmm(&vmm, UserLayout::default()).unwrap();
    let base = va(MMAP_REGION_START);

    let a = ctx
        .mmap_anonymous(None, 2 * PAGE, RW, VmaType::PRIVATE, false)
        .unwrap();
    let b = ctx
        .mmap_anonymous(None, 100, RW, VmaType::PRIVATE, false)
        .unwrap();
    assert_eq!((a, b), (base, base + 2 * PAGE));
    assert_eq!(ctx.vma_count(), 1);
    assert_eq!(ctx.find_vma(base).map(|v| v.len()), Some(3 * PAGE));
    assert_eq!(
        ctx.find_vma(base).map(|v| v.kind()),
        Some(VmaType::PRIVATE | VmaType::ANONYMOUS)
    );

    let ro = ctx
        .mmap_anonymous(None, PAGE, VmaProt::READ, VmaType::PRIVATE, false)
        .unwrap();
    assert_eq!(ro, base + 3 * PAGE);
    assert_eq!(ctx.vma_count(), 2);

    for i in 0..4 {
        let pa = ctx.translate(base + i * PAGE).unwrap();
        assert!(mem.is_zeroed(PhysicalPage::containing(pa)));
        let leaf = ctx.address_space().leaf_entry(base + i * PAGE).unwrap();
        assert!(leaf.user_access() && leaf.no_execute());
        assert_eq!(leaf.writable(), i < 3);
    }

    // Hints are honoured when free and ignored otherwise.
    let hinted = ctx
        .mmap_anonymous(Some(va(0x5000_0000)), PAGE, RW, VmaType::SHARED, false)
        .unwrap();
    assert_eq!(hinted, va(0x5000_0000));
    let moved = ctx
        .mmap_anonymous(Some(base), PAGE, RW, VmaType::PRIVATE, false)
        .unwrap();
    assert_eq!(moved, base + 4 * PAGE);
}

#[test]
fn bad_mmap_requests() {
    let (mem, mut rig) = Rig::new(64);
    let vmm = rig.vmm(&mem);
    let mut ctx = MmContext::for_vmm(&vmm, UserLayout::default()).unwrap();

    assert_eq!(
        ctx.mmap_anonymous(None, 0, RW, VmaType::PRIVATE, false),
        Err(MmError::InvalidLength(0))
    );
    assert_eq!(
        ctx.mmap_anonymous(None, PAGE, RW, VmaType::PRIVATE | VmaType::SHARED, false),
        Err(MmError::InvalidFlags)
    );
    assert_eq!(
        ctx.mmap_anonymous(None, PAGE, RW, VmaType::ANONYMOUS, false),
        Err(MmError::InvalidFlags)
    );
    assert_eq!(
        ctx.mmap_anonymous(None, PAGE, RW, VmaType::PRIVATE, true),
        Err(MmError::InvalidAddress(va(0)))
    );
    assert_eq!(
        ctx.mmap_anonymous(Some(va(0x5000_0800)), PAGE, RW, VmaType::PRIVATE, true),
        Err(MmError::InvalidAddress(va(0x5000_0800)))
    );
    assert_eq!(ctx.vma_count(), 0);
}

#[test]
fn failed_mmap_leaves_nothing_behind() {
    let (mem, mut rig) = Rig::new(32);
    let vmm = rig.vmm(&mem);
    let mut ctx = MmContext::for_vmm(&vmm, UserLayout::default()).unwrap();
    let base = va(MMAP_REGION_START);

    let warm = ctx
        .mmap_anonymous(None, PAGE, RW, VmaType::PRIVATE, false)
        .unwrap();
    ctx.munmap(warm, PAGE).unwrap();
    let before = free_frames(&vmm);

    assert_eq!(
        ctx.mmap_anonymous(None, 64 * PAGE, RW, VmaType::PRIVATE, false),
        Err(MmError::OutOfMemory)
    );
    assert_eq!(free_frames(&vmm), before);
    assert_eq!(ctx.vma_count(), 0);
    assert_eq!(ctx.translate(base), None);
}

#[test]
fn fixed_mapping_replaces_what_it_overlaps() {
    let (mem, mut rig) = Rig::new(128);
    let vmm = rig.vmm(&mem);
    let mut ctx = MmContext::for_vmm(&vmm, UserLayout::default()).unwrap();
    let base = ctx
        .mmap_anonymous(None, 4 * PAGE, RW, VmaType::PRIVATE, false)
        .unwrap();

    let fixed = ctx
        .mmap_anonymous(Some(base + PAGE), 2 * PAGE, VmaProt::READ, VmaType::PRIVATE, true)
        .unwrap();
    assert_eq!(fixed, base + PAGE);

    let areas: Vec<(VirtualAddress, VirtualAddress, VmaProt)> =
        ctx.vmas().iter().map(|a| (a.start(), a.end(), a.prot())).collect();
    assert_eq!(
        areas,
        vec![
            (base, base + PAGE, RW),
            (base + PAGE, base + 3 * PAGE, VmaProt::READ),
            (base + 3 * PAGE, base + 4 * PAGE, RW),
        ]
    );
    assert!(!ctx.address_space().leaf_entry(base + PAGE).unwrap().writable());
    assert!(ctx.address_space().leaf_entry(base).unwrap().writable());
}

fn offsets<M: PhysMapper>(ctx: &MmContext<'_, '_, '_, M>, base: VirtualAddress) -> Vec<(u64, u64)> {
    ctx.vmas()
        .iter()
        .map(|a| (a.start().as_u64() - base.as_u64(), a.end().as_u64() - base.as_u64()))
        .collect()
}

#[test]
fn munmap_trims_splits_and_removes() {
    let (mem, mut rig) = Rig::new(128);
    let vmm = rig.vmm(&mem);
    let mut ctx = MmContext::for_vmm(&vmm, UserLayout::default()).unwrap();
    let base = ctx
        .mmap_anonymous(None, 6 * PAGE, RW, VmaType::PRIVATE, false)
        .unwrap();
    let frames: Vec<PhysicalAddress> = (0..6).map(|i| ctx.translate(base + i * PAGE).unwrap()).collect();

    // Hole in the middle splits the area.
    ctx.munmap(base + 2 * PAGE, 2 * PAGE).unwrap();
    assert_eq!(offsets(&ctx, base), vec![(0, 2 * PAGE), (4 * PAGE, 6 * PAGE)]);
    assert_eq!(ctx.translate(base + 2 * PAGE), None);
    assert_eq!(ctx.translate(base + 3 * PAGE), None);
    assert!(vmm.physical().lock().is_free(frames[2]));
    assert!(vmm.physical().lock().is_free(frames[3]));
    assert!(vmm.physical().lock().is_used(frames[4]));

    // Front and back trims.
    ctx.munmap(base, PAGE).unwrap();
    ctx.munmap(base + 5 * PAGE, PAGE).unwrap();
    assert_eq!(offsets(&ctx, base), vec![(PAGE, 2 * PAGE), (4 * PAGE, 5 * PAGE)]);

    // Holes inside the range are fine.
    ctx.munmap(base, 8 * PAGE).unwrap();
    assert_eq!(ctx.vma_count(), 0);
    assert!(frames.iter().all(|&pa| vmm.physical().lock().is_free(pa)));

    assert_eq!(ctx.munmap(base + 1, PAGE), Err(MmError::InvalidAddress(base + 1)));
    assert_eq!(ctx.munmap(base, 0), Err(MmError::InvalidLength(0)));
    assert_eq!(ctx.munmap(va(0), PAGE), Err(MmError::InvalidAddress(va(0))));
}

#[test]
fn shared_frames_are_never_freed() {
    let (mem, mut rig) = Rig::new(64);
    let vmm = rig.vmm(&mem);
    let mut ctx = MmContext::for_vmm(&vmm, UserLayout::default()).unwrap();
    let a = vmm.physical().lock().alloc_page().unwrap();
    let b = vmm.physical().lock().alloc_page().unwrap();

    let at = ctx.map_shared(&[a, b], RW, None).unwrap();
    assert_eq!(ctx.translate(at), Some(a));
    assert_eq!(ctx.translate(at + PAGE + 8), Some(b + 8));
    assert_eq!(ctx.find_vma(at).map(|v| v.kind()), Some(VmaType::SHARED));

    ctx.munmap(at, 2 * PAGE).unwrap();
    assert_eq!(ctx.translate(at), None);
    assert!(vmm.physical().lock().is_used(a));
    assert!(vmm.physical().lock().is_used(b));

    let file = ctx
        .map_shared(&[a], VmaProt::READ, Some(FileBacking(4)))
        .unwrap();
    let area = *ctx.find_vma(file).unwrap();
    assert_eq!(area.kind(), VmaType::SHARED | VmaType::FILE);
    assert_eq!(area.backing(), Some(FileBacking(4)));

    assert_eq!(
        ctx.map_shared(&[a + 0x10], RW, None),
        Err(MmError::Map(MapError::InvalidPhysicalAddress(a + 0x10)))
    );
    assert_eq!(ctx.map_shared(&[], RW, None), Err(MmError::InvalidLength(0)));
}

#[test]
fn destroy_returns_every_owned_frame() {
    let (mem, mut rig) = Rig::new(128);
    let vmm = rig.vmm(&mem);
    let before = free_frames(&vmm);

    let mut ctx = MmContext::for_vmm(&vmm, UserLayout::default()).unwrap();
    ctx.init_heap(va(HEAP_REGION_START)).unwrap();
    ctx.set_heap_end(va(HEAP_REGION_START + 3 * PAGE));
    ctx.mmap_anonymous(None, 4 * PAGE, RW, VmaType::PRIVATE, false)
        .unwrap();
    let shared = vmm.physical().lock().alloc_page().unwrap();
    ctx.map_shared(&[shared], VmaProt::READ, None).unwrap();
    ctx.log_regions("test");

    assert_eq!(ctx.destroy(), 7);
    assert_eq!(free_frames(&vmm), before - 1);
    assert!(vmm.physical().lock().is_used(shared));
}

#[test]
fn processes_share_the_kernel_half() {
    let (mem, mut rig) = Rig::new(64);
    let vmm = rig.vmm(&mem);
    let kva = vmm.alloc_virtual_page(PageEntryBits::kernel_rw()).unwrap();

    let via_vmm = MmContext::for_vmm(&vmm, UserLayout::default()).unwrap();
    let kernel = AddressSpace::from_root(&mem, vmm.kernel_root());
    let direct = MmContext::new(&mem, vmm.physical(), &kernel, UserLayout::default()).unwrap();

    let pa = vmm.virt_to_phys_via_walk(kva);
    assert!(pa.is_some());
    assert_eq!(via_vmm.translate(kva), pa);
    assert_eq!(direct.translate(kva), pa);
    assert_ne!(via_vmm.root(), direct.root());
    assert_ne!(via_vmm.root(), vmm.kernel_root());

    let bad = UserLayout {
        mmap_base: va(0x1234),
        ..UserLayout::default()
    };
    assert!(matches!(
        MmContext::for_vmm(&vmm, bad),
        Err(MmError::InvalidAddress(_))
    ));
}
