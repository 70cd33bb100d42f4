//! # Boot Memory Map
//!
//! The bootloader hands the kernel a list of physical ranges with a type tag.
//! The frame allocator consumes it exactly once to decide which frames start
//! out free.

use kernel_memory_addresses::PhysicalAddress;

/// What a firmware-reported physical range may be used for.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// Conventional RAM, free for the kernel to hand out.
    Usable = 0,
    /// Firmware or device reserved; never touched.
    Reserved = 1,
    /// ACPI tables; reclaimable once parsed.
    AcpiReclaimable = 2,
    /// ACPI non-volatile storage.
    AcpiNvs = 3,
    /// Memory reported as faulty.
    BadMemory = 4,
    /// Loader data that can be reclaimed after boot.
    BootloaderReclaimable = 5,
    /// The loaded kernel image.
    KernelImage = 6,
}

/// One entry of the boot memory map.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryRegion {
    pub base: PhysicalAddress,
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryRegionKind) -> Self {
        Self {
            base: PhysicalAddress::new(base),
            length,
            kind,
        }
    }

    /// Exclusive end address, saturating at the top of the address space.
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_u64().saturating_add(self.length))
    }

    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, MemoryRegionKind::Usable)
    }
}

/// Exclusive upper bound of all reported memory, usable or not.
#[must_use]
pub fn highest_address(regions: &[MemoryRegion]) -> PhysicalAddress {
    regions
        .iter()
        .map(MemoryRegion::end)
        .max()
        .unwrap_or_default()
}

/// Total bytes of usable RAM.
#[must_use]
pub fn total_usable_bytes(regions: &[MemoryRegion]) -> u64 {
    regions
        .iter()
        .filter(|r| r.is_usable())
        .map(|r| r.length)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAP: [MemoryRegion; 3] = [
        MemoryRegion::new(0x0, 0x9_F000, MemoryRegionKind::Usable),
        MemoryRegion::new(0x9_F000, 0x6_1000, MemoryRegionKind::Reserved),
        MemoryRegion::new(0x10_0000, 0x3F0_0000, MemoryRegionKind::Usable),
    ];

    #[test]
    fn highest_address_covers_all_regions() {
        assert_eq!(highest_address(&MAP), PhysicalAddress::new(0x400_0000));
        assert_eq!(highest_address(&[]), PhysicalAddress::zero());
    }

    #[test]
    fn usable_bytes_skip_reserved() {
        assert_eq!(total_usable_bytes(&MAP), 0x9_F000 + 0x3F0_0000);
    }
}
