use crate::addresses::PhysicalAddress;
use bitfield_struct::bitfield;

/// A single 64-bit x86-64 paging-structure entry in its raw bitfield form.
///
/// The layout is the common superset of PML4E, PDPTE, PDE and PTE, so one
/// type serves every level of the tree.
///
/// | Bits  | Name          | Meaning |
/// |-------|---------------|---------|
/// | 0     | `P`           | Entry is valid |
/// | 1     | `RW`          | Writable |
/// | 2     | `US`          | User-mode accessible |
/// | 3     | `PWT`         | Write-through caching |
/// | 4     | `PCD`         | Caching disabled |
/// | 5     | `A`           | Accessed |
/// | 6     | `D`           | Dirty (leaf only) |
/// | 7     | `PS`          | Large page (PDPTE / PDE only) |
/// | 8     | `G`           | Global (leaf only) |
/// | 9–11  | OS available  | Bit 9 marks a link installed by an unfinished map call |
/// | 12–51 | `addr`        | Physical frame bits 51:12 |
/// | 52–58 | OS available  | Unused |
/// | 59–62 | `PKU`         | Protection key |
/// | 63    | `NX`          | Execute disable |
///
/// ```rust
/// # use kernel_vmem::addresses::PhysicalAddress;
/// # use kernel_vmem::PageEntryBits;
/// let e = PageEntryBits::kernel_rw().with_physical_address(PhysicalAddress::new(0x12_3000));
/// assert!(e.present() && e.writable() && e.no_execute());
/// assert_eq!(e.physical_address().as_u64(), 0x12_3000);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,
    /// Writable (RW, bit 1).
    pub writable: bool,
    /// User/Supervisor (US, bit 2).
    pub user_access: bool,
    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,
    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,
    /// Accessed (A, bit 5), set by the CPU.
    pub accessed: bool,
    /// Dirty (D, bit 6), set by the CPU on write to a leaf.
    pub dirty: bool,
    /// Page Size (PS, bit 7). Only valid in PDPTEs (1 GiB) and PDEs (2 MiB).
    pub large_page: bool,
    /// Global (G, bit 8). Survives CR3 reloads when CR4.PGE is set.
    pub global_translation: bool,
    /// Software bits 9..=11, ignored by the MMU.
    #[bits(3)]
    pub os_available_low: u8,
    /// Physical frame number (bits 51:12).
    #[bits(40)]
    phys_addr_bits_51_12: u64,
    /// Software bits 52..=58, ignored by the MMU.
    #[bits(7)]
    pub os_available_high: u8,
    /// Protection key (bits 59..=62) when PKU is enabled.
    #[bits(4)]
    pub protection_key: u8,
    /// Execute Disable (NX, bit 63).
    pub no_execute: bool,
}

/// Software bit tagging a table link that was created by a map call still in flight.
const FRESH_LINK: u8 = 0b001;

impl PageEntryBits {
    /// Physical address stored in the entry (low 12 bits zero).
    #[inline]
    #[must_use]
    pub const fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_51_12() << 12)
    }

    /// Store the 4 KiB-aligned part of `pa`; the low 12 bits are dropped.
    #[inline]
    #[must_use]
    pub const fn with_physical_address(self, pa: PhysicalAddress) -> Self {
        self.with_phys_addr_bits_51_12((pa.as_u64() >> 12) & ((1 << 40) - 1))
    }

    #[inline]
    pub const fn set_physical_address(&mut self, pa: PhysicalAddress) {
        *self = self.with_physical_address(pa);
    }

    /// Link to a next-level table. User access is granted on the link when any
    /// leaf below it is user-accessible; the leaf still decides the final rights.
    #[inline]
    #[must_use]
    pub const fn table_link(table: PhysicalAddress, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(user)
            .with_physical_address(table)
    }

    /// Kernel data: read/write, never executable.
    #[inline]
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_no_execute(true)
    }

    /// Kernel code: read-only, executable.
    #[inline]
    #[must_use]
    pub const fn kernel_rx() -> Self {
        Self::new().with_present(true)
    }

    /// Kernel device or DMA memory: read/write, uncached, never executable.
    #[inline]
    #[must_use]
    pub const fn kernel_uncached() -> Self {
        Self::kernel_rw()
            .with_cache_disabled(true)
            .with_write_through(true)
    }

    /// User data: read/write, never executable.
    #[inline]
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::kernel_rw().with_user_access(true)
    }

    /// User read-only data.
    #[inline]
    #[must_use]
    pub const fn user_ro() -> Self {
        Self::new()
            .with_present(true)
            .with_user_access(true)
            .with_no_execute(true)
    }

    /// True if this entry was installed by a map call that has not committed yet.
    #[inline]
    #[must_use]
    pub const fn is_fresh_link(self) -> bool {
        self.os_available_low() & FRESH_LINK != 0
    }

    #[inline]
    #[must_use]
    pub const fn with_fresh_link(self, fresh: bool) -> Self {
        let bits = self.os_available_low();
        self.with_os_available_low(if fresh {
            bits | FRESH_LINK
        } else {
            bits & !FRESH_LINK
        })
    }
}
