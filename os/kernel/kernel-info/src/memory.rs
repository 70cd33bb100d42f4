//! # Memory Layout

/// Size of the base page used by every allocator.
pub const PAGE_SIZE: u64 = 4096;

/// Lowest user-space address; page 0 is never mapped.
pub const USERSPACE_START: u64 = 0x0000_0000_0000_1000;

/// Exclusive end of the user-space half (first non-canonical address).
pub const USERSPACE_END: u64 = 0x0000_8000_0000_0000;

/// Default load address for ELF segments.
pub const ELF_REGION_START: u64 = 0x0000_0000_0040_0000;

/// Lower bound for the process heap when no ELF image dictates otherwise.
pub const HEAP_REGION_START: u64 = 0x0000_0000_4000_0000;

/// Where the automatic `mmap` search starts.
pub const MMAP_REGION_START: u64 = 0x0000_7f00_0000_0000;

/// Lower bound of the stack region; `mmap` never places a mapping above it.
pub const STACK_REGION_START: u64 = 0x0000_7fff_0000_0000;

/// First root-table slot that belongs to the kernel half.
pub const KERNEL_HALF_FIRST_PML4_INDEX: usize = 256;

/// Higher Half Direct Map (HHDM) base.
///
/// Physical address `pa` is always reachable at `HHDM_BASE + pa`; this is the
/// fixed linear window used for page-table nodes and persistent kernel data.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Amount of physical memory covered by the linear window (64 TiB).
pub const HHDM_SIZE: u64 = 0x0000_4000_0000_0000;

/// Base of the kernel's on-demand virtual address window.
pub const KERNEL_VMM_BASE: u64 = 0xffff_ff80_0000_0000;

/// Size of the kernel's on-demand virtual address window (64 GiB).
pub const KERNEL_VMM_SIZE: u64 = 0x0000_0010_0000_0000;

/// Where the kernel executes (VMA), matches the linker script.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Span covered by the early-boot large-page identity map.
pub const BOOTSTRAP_IDENTITY_BYTES: u64 = 1 << 30;

const _: () = {
    assert!(USERSPACE_START.is_multiple_of(PAGE_SIZE));
    assert!(USERSPACE_START < ELF_REGION_START);
    assert!(ELF_REGION_START < HEAP_REGION_START);
    assert!(HEAP_REGION_START < MMAP_REGION_START);
    assert!(MMAP_REGION_START < STACK_REGION_START);
    assert!(STACK_REGION_START < USERSPACE_END);
    assert!(HHDM_BASE > USERSPACE_END);
    assert!(HHDM_BASE + HHDM_SIZE <= KERNEL_VMM_BASE);
    assert!(KERNEL_VMM_BASE + KERNEL_VMM_SIZE <= KERNEL_BASE);
    assert!(KERNEL_VMM_SIZE.is_multiple_of(PAGE_SIZE));
    assert!((HHDM_BASE >> 39) & 0x1FF >= KERNEL_HALF_FIRST_PML4_INDEX as u64);
};
