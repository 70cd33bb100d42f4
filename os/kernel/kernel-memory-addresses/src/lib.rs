//! # Physical and Virtual Address Types
//!
//! Zero-cost newtypes that keep the two address spaces of the memory manager
//! apart at compile time.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | A location in RAM (or MMIO) as seen by the memory controller. |
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | A location as seen through a page-table translation. |
//!
//! There are no `From` conversions between the two families. Crossing from one
//! to the other always goes through a named function in a higher layer, such
//! as a linear-window offset or an explicit page-table walk.
//!
//! ## Page Sizes
//!
//! The marker types [`Size4K`], [`Size2M`] and [`Size1G`] implement
//! [`PageSize`] and parameterize the page types:
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
//! let page = va.page::<Size4K>();
//! assert_eq!(page.base().as_u64(), 0xFFFF_FFFF_8000_1000);
//! assert_eq!(va.offset::<Size4K>(), 0x234);
//!
//! let pa = PhysicalAddress::new(0x4020_0042);
//! assert_eq!(pa.page::<Size2M>().base().as_u64(), 0x4020_0000);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod page_size;
mod physical_address;
mod virtual_address;

pub use page_size::{PageSize, Size1G, Size2M, Size4K};
pub use physical_address::{PhysicalAddress, PhysicalPage};
pub use virtual_address::{VirtualAddress, VirtualPage};

/// Align `x` down to a multiple of `a`.
///
/// `a` must be a power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0, 4096), 0);
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// assert_eq!(align_down(0x12345, 16), 0x12340);
/// ```
#[inline]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    x & !(a - 1)
}

/// Align `x` up to a multiple of `a`, or `None` if that would overflow.
///
/// `a` must be a power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0, 4096), Some(0));
/// assert_eq!(align_up(1, 4096), Some(4096));
/// assert_eq!(align_up(4096, 4096), Some(4096));
/// assert_eq!(align_up(u64::MAX, 4096), None);
/// ```
#[inline]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> Option<u64> {
    debug_assert!(a.is_power_of_two());
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

/// Number of `S`-sized pages needed to cover `bytes`.
///
/// ```rust
/// # use kernel_memory_addresses::{pages_for, Size4K};
/// assert_eq!(pages_for::<Size4K>(0), 0);
/// assert_eq!(pages_for::<Size4K>(1), 1);
/// assert_eq!(pages_for::<Size4K>(8192), 2);
/// assert_eq!(pages_for::<Size4K>(8193), 3);
/// ```
#[inline]
#[must_use]
pub const fn pages_for<S: PageSize>(bytes: u64) -> u64 {
    bytes.div_ceil(S::SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_and_offset_recompose() {
        let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
        let page = pa.page::<Size4K>();
        assert_eq!(page.base().as_u64() & 0xFFF, 0);
        assert_eq!(page.base() + pa.offset::<Size4K>(), pa);

        let va = VirtualAddress::new(0x0000_0008_1234_5678);
        let page = va.page::<Size2M>();
        assert_eq!(page.base().as_u64() & (Size2M::SIZE - 1), 0);
        assert_eq!(page.base() + va.offset::<Size2M>(), va);
    }

    #[test]
    fn aligned_page_construction_rejects_misaligned() {
        assert!(PhysicalPage::<Size4K>::from_aligned(PhysicalAddress::new(0x1001)).is_none());
        assert!(PhysicalPage::<Size4K>::from_aligned(PhysicalAddress::new(0x2000)).is_some());
        assert!(VirtualPage::<Size1G>::from_aligned(VirtualAddress::new(0x4000_0000)).is_some());
        assert!(VirtualPage::<Size1G>::from_aligned(VirtualAddress::new(0x2000_0000)).is_none());
    }

    #[test]
    fn page_stepping() {
        let page = PhysicalPage::<Size4K>::containing(PhysicalAddress::new(0x5123));
        assert_eq!(page.base().as_u64(), 0x5000);
        assert_eq!(page.checked_add(3).map(|p| p.base().as_u64()), Some(0x8000));
        assert_eq!(page.frame_index(), 5);
        assert!(PhysicalPage::<Size4K>::containing(PhysicalAddress::new(u64::MAX))
            .checked_add(1)
            .is_none());
    }

    #[test]
    fn canonical_addresses() {
        assert!(VirtualAddress::new(0x0000_7FFF_FFFF_F000).is_canonical());
        assert!(VirtualAddress::new(0xFFFF_8000_0000_0000).is_canonical());
        assert!(!VirtualAddress::new(0x0000_8000_0000_0000).is_canonical());
        assert!(VirtualAddress::new(0xFFFF_8000_0000_0000).is_upper_half());
    }

    #[test]
    fn formatting() {
        assert_eq!(format!("{:?}", PhysicalAddress::new(0x1000)), "PA(0x0000000000001000)");
        assert_eq!(format!("{}", VirtualAddress::new(0x1000)), "0x0000_0000_0000_1000");
    }
}
