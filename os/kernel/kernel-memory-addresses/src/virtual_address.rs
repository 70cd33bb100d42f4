use crate::PageSize;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Add, AddAssign};

/// A virtual memory address.
///
/// Canonicality is not enforced on construction; see
/// [`VirtualAddress::is_canonical`].
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The `S`-sized page containing this address.
    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> VirtualPage<S> {
        VirtualPage::containing(self)
    }

    /// Byte offset inside the `S`-sized page containing this address.
    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> u64 {
        self.0 & (S::SIZE - 1)
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned_to(self, align: u64) -> bool {
        align.is_power_of_two() && self.0 & (align - 1) == 0
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Bits 63..48 are a sign extension of bit 47 (48-bit paging).
    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        let upper = self.0 >> 47;
        upper == 0 || upper == 0x1_FFFF
    }

    /// True for addresses in the kernel half of a canonical address space.
    #[inline]
    #[must_use]
    pub const fn is_upper_half(self) -> bool {
        self.0 >> 47 == 0x1_FFFF
    }
}

pub(crate) fn write_grouped_hex(f: &mut fmt::Formatter<'_>, v: u64) -> fmt::Result {
    write!(
        f,
        "0x{:04x}_{:04x}_{:04x}_{:04x}",
        v >> 48,
        (v >> 32) & 0xFFFF,
        (v >> 16) & 0xFFFF,
        v & 0xFFFF
    )
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_grouped_hex(f, self.0)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

/// An `S`-aligned virtual page.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage<S: PageSize> {
    base: u64,
    _size: PhantomData<S>,
}

impl<S: PageSize> VirtualPage<S> {
    #[inline]
    #[must_use]
    pub const fn containing(addr: VirtualAddress) -> Self {
        Self {
            base: addr.0 & !(S::SIZE - 1),
            _size: PhantomData,
        }
    }

    /// The page starting exactly at `addr`, or `None` if `addr` is not `S`-aligned.
    #[inline]
    #[must_use]
    pub const fn from_aligned(addr: VirtualAddress) -> Option<Self> {
        if addr.0 & (S::SIZE - 1) == 0 {
            Some(Self::containing(addr))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress(self.base)
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, count: u64) -> Option<Self> {
        let Some(delta) = count.checked_mul(S::SIZE) else {
            return None;
        };
        match self.base.checked_add(delta) {
            Some(base) => Some(Self {
                base,
                _size: PhantomData,
            }),
            None => None,
        }
    }
}

impl<S: PageSize> fmt::Debug for VirtualPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage<{}>(0x{:016X})", S::NAME, self.base)
    }
}

impl<S: PageSize> From<VirtualPage<S>> for VirtualAddress {
    #[inline]
    fn from(page: VirtualPage<S>) -> Self {
        page.base()
    }
}
