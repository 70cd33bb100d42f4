use crate::PageSize;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Add, AddAssign};

/// A physical memory address.
///
/// Only carries the *kind* of the address; it is not validated against the
/// installed RAM. Use [`PhysicalAddress::page`] and [`PhysicalAddress::offset`]
/// to split it for a given [`PageSize`].
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
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
    pub const fn page<S: PageSize>(self) -> PhysicalPage<S> {
        PhysicalPage::containing(self)
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
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::virtual_address::write_grouped_hex(f, self.0)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

/// An `S`-aligned physical page (a "frame" when `S` is [`Size4K`](crate::Size4K)).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize> {
    base: u64,
    _size: PhantomData<S>,
}

impl<S: PageSize> PhysicalPage<S> {
    /// The page containing `addr` (low bits cleared).
    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        Self {
            base: addr.0 & !(S::SIZE - 1),
            _size: PhantomData,
        }
    }

    /// The page starting exactly at `addr`, or `None` if `addr` is not `S`-aligned.
    #[inline]
    #[must_use]
    pub const fn from_aligned(addr: PhysicalAddress) -> Option<Self> {
        if addr.0 & (S::SIZE - 1) == 0 {
            Some(Self::containing(addr))
        } else {
            None
        }
    }

    /// The page with the given frame number (`index * S::SIZE`).
    #[inline]
    #[must_use]
    pub const fn from_frame_index(index: u64) -> Self {
        Self {
            base: index << S::SHIFT,
            _size: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(self.base)
    }

    /// Frame number of this page (`base / S::SIZE`).
    #[inline]
    #[must_use]
    pub const fn frame_index(self) -> u64 {
        self.base >> S::SHIFT
    }

    /// The page `count` pages further up, or `None` on overflow.
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

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage<{}>(0x{:016X})", S::NAME, self.base)
    }
}

impl<S: PageSize> From<PhysicalPage<S>> for PhysicalAddress {
    #[inline]
    fn from(page: PhysicalPage<S>) -> Self {
        page.base()
    }
}
