//! # Linear Mapping
//!
//! Every physical address below [`HHDM_SIZE`] is permanently mapped at
//! `HHDM_BASE + pa`. The two conversions here are the only places where a
//! [`PhysicalAddress`] turns into a [`VirtualAddress`] (or back) without a
//! page-table walk.
//!
//! ```rust
//! use kernel_alloc::phys_mapper::{phys_to_virt_linear, virt_to_phys_linear};
//! use kernel_info::memory::HHDM_BASE;
//! use kernel_memory_addresses::PhysicalAddress;
//!
//! let pa = PhysicalAddress::new(0x1234_5000);
//! let va = phys_to_virt_linear(pa).unwrap();
//! assert_eq!(va.as_u64(), HHDM_BASE + 0x1234_5000);
//! assert_eq!(virt_to_phys_linear(va), Some(pa));
//! ```

use kernel_info::memory::{HHDM_BASE, HHDM_SIZE};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// Linear-window address of `pa`, or `None` if `pa` lies beyond the window.
#[inline]
#[must_use]
pub const fn phys_to_virt_linear(pa: PhysicalAddress) -> Option<VirtualAddress> {
    if pa.as_u64() >= HHDM_SIZE {
        return None;
    }
    Some(VirtualAddress::new(HHDM_BASE + pa.as_u64()))
}

/// Physical address behind a linear-window address, or `None` if `va` is
/// outside the window.
#[inline]
#[must_use]
pub const fn virt_to_phys_linear(va: VirtualAddress) -> Option<PhysicalAddress> {
    let v = va.as_u64();
    if v < HHDM_BASE || v - HHDM_BASE >= HHDM_SIZE {
        return None;
    }
    Some(PhysicalAddress::new(v - HHDM_BASE))
}

/// [`PhysMapper`] for the running kernel: reaches frames through the linear window.
///
/// # Safety
/// The window must be mapped (see `kernel_vmem::bootstrap`) and cover every
/// frame handed to [`phys_to_mut`](PhysMapper::phys_to_mut).
#[derive(Debug, Default, Copy, Clone)]
pub struct HhdmPhysMapper;

impl PhysMapper for HhdmPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        debug_assert!(pa.as_u64() < HHDM_SIZE, "{pa} is outside the linear window");
        let va = HHDM_BASE.wrapping_add(pa.as_u64()) as *mut T;
        // SAFETY: caller guarantees the frame is mapped through the window and unaliased.
        unsafe { &mut *va }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_bounds() {
        assert_eq!(phys_to_virt_linear(PhysicalAddress::new(HHDM_SIZE)), None);
        assert!(phys_to_virt_linear(PhysicalAddress::new(HHDM_SIZE - 1)).is_some());
        assert_eq!(virt_to_phys_linear(VirtualAddress::new(HHDM_BASE - 1)), None);
        assert_eq!(virt_to_phys_linear(VirtualAddress::new(HHDM_BASE + HHDM_SIZE)), None);
        assert_eq!(
            virt_to_phys_linear(VirtualAddress::new(HHDM_BASE)),
            Some(PhysicalAddress::zero())
        );
    }
}
