//! Bounds of a process address space.

use kernel_info::memory::{MMAP_REGION_START, STACK_REGION_START, USERSPACE_END, USERSPACE_START};
use kernel_memory_addresses::{PageSize, Size4K, VirtualAddress};

/// Where user mappings may go and where the automatic placement search runs.
///
/// The defaults come from [`kernel_info::memory`]; the process layer may
/// inject a different layout per address space.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct UserLayout {
    /// Lowest mappable address.
    pub userspace_start: VirtualAddress,
    /// Exclusive upper bound of user space.
    pub userspace_end: VirtualAddress,
    /// First address tried when the kernel picks a placement.
    pub mmap_base: VirtualAddress,
    /// Automatic placements end below this address.
    pub stack_start: VirtualAddress,
}

impl UserLayout {
    /// True if `[start, start + len)` is a non-empty range inside user space.
    #[must_use]
    pub fn contains_range(&self, start: VirtualAddress, len: u64) -> bool {
        len > 0
            && start >= self.userspace_start
            && start
                .checked_add(len)
                .is_some_and(|end| end <= self.userspace_end)
    }

    /// True if the layout is page aligned and its regions are ordered.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let aligned = [self.userspace_start, self.userspace_end, self.mmap_base, self.stack_start]
            .iter()
            .all(|va| va.is_aligned_to(Size4K::SIZE));
        aligned
            && self.userspace_start <= self.mmap_base
            && self.mmap_base < self.stack_start
            && self.stack_start <= self.userspace_end
    }
}

impl Default for UserLayout {
    fn default() -> Self {
        Self {
            userspace_start: VirtualAddress::new(USERSPACE_START),
            userspace_end: VirtualAddress::new(USERSPACE_END),
            mmap_base: VirtualAddress::new(MMAP_REGION_START),
            stack_start: VirtualAddress::new(STACK_REGION_START),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_is_valid() {
        let layout = UserLayout::default();
        assert!(layout.is_valid());
        assert!(layout.contains_range(VirtualAddress::new(USERSPACE_START), 0x1000));
        assert!(!layout.contains_range(VirtualAddress::new(0), 0x1000));
        assert!(!layout.contains_range(VirtualAddress::new(USERSPACE_END - 0x1000), 0x2000));
        assert!(!layout.contains_range(VirtualAddress::new(0x1000), 0));
        assert!(!layout.contains_range(VirtualAddress::new(u64::MAX - 0xfff), 0x1000));
    }

    #[test]
    fn misordered_layout_is_rejected() {
        let layout = UserLayout {
            mmap_base: VirtualAddress::new(STACK_REGION_START),
            ..UserLayout::default()
        };
        assert!(!layout.is_valid());
    }
}
