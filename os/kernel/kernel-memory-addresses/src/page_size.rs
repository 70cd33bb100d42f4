use core::fmt;
use core::hash::Hash;

mod sealed {
    pub trait Sealed {}
}

/// Marker trait for the page sizes the x86-64 MMU can map.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + Ord + Hash + fmt::Display + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// `log2(SIZE)`, the number of offset bits inside the page.
    const SHIFT: u32;
    /// Short human-readable name, e.g. `"4K"`.
    const NAME: &'static str;
}

macro_rules! page_size {
    ($(#[$meta:meta])* $name:ident, $shift:literal, $label:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl PageSize for $name {
            const SIZE: u64 = 1 << $shift;
            const SHIFT: u32 = $shift;
            const NAME: &'static str = $label;
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(Self::NAME)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(Self::NAME)
            }
        }
    };
}

page_size!(
    /// 4 KiB page, the base granularity of every allocator in the kernel.
    Size4K, 12, "4K"
);
page_size!(
    /// 2 MiB large page (PD-level leaf).
    Size2M, 21, "2M"
);
page_size!(
    /// 1 GiB huge page (PDPT-level leaf), only used for the boot identity map.
    Size1G, 30, "1G"
);
