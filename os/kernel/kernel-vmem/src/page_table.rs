//! # Page-Table Nodes
//!
//! One [`PageTable`] occupies exactly one 4 KiB frame and holds 512
//! [`PageEntryBits`]. The same node type is used at every level; the
//! [`PageTableLevel`] of a node is implied by how it was reached.

use crate::PageEntryBits;
use crate::addresses::VirtualAddress;
use core::fmt;

/// Entries per paging-structure node.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Level of a node in the four-level translation tree, root first.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PageTableLevel {
    /// Page Map Level 4, the root referenced by CR3.
    Pml4,
    /// Page Directory Pointer Table; may hold 1 GiB leaves.
    Pdpt,
    /// Page Directory; may hold 2 MiB leaves.
    Pd,
    /// Page Table; always holds 4 KiB leaves.
    Pt,
}

impl PageTableLevel {
    /// Bit position of the lowest address bit used as index at this level.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pdpt => 30,
            Self::Pd => 21,
            Self::Pt => 12,
        }
    }

    /// Bytes of virtual address space covered by one entry at this level.
    #[inline]
    #[must_use]
    pub const fn entry_span(self) -> u64 {
        1 << self.shift()
    }

    /// Index of the entry at this level that translates `va`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index_of(self, va: VirtualAddress) -> TableIndex {
        TableIndex(((va.as_u64() >> self.shift()) & 0x1FF) as u16)
    }

    /// The level below this one, or `None` for the leaf level.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }

    /// Whether an entry with `PS=1` is a valid leaf at this level.
    #[inline]
    #[must_use]
    pub const fn allows_large_leaf(self) -> bool {
        matches!(self, Self::Pdpt | Self::Pd)
    }
}

impl fmt::Display for PageTableLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pml4 => "PML4",
            Self::Pdpt => "PDPT",
            Self::Pd => "PD",
            Self::Pt => "PT",
        })
    }
}

/// Index into a [`PageTable`], always `< 512`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl TableIndex {
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!(v < 512);
        Self(v & 0x1FF)
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_lossless)]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// A 4 KiB paging-structure node.
#[doc(alias = "PML4")]
#[doc(alias = "PDPT")]
#[doc(alias = "PD")]
#[doc(alias = "PT")]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntryBits; ENTRIES_PER_TABLE],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    /// A node with every entry not-present.
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageEntryBits::new(); ENTRIES_PER_TABLE],
        }
    }

    /// Clear every entry.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageEntryBits::new());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: TableIndex) -> PageEntryBits {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: TableIndex, e: PageEntryBits) {
        self.entries[i.as_usize()] = e;
    }

    #[inline]
    pub const fn clear(&mut self, i: TableIndex) {
        self.set(i, PageEntryBits::new());
    }

    /// True if no entry is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.present())
    }

    /// Number of present entries.
    #[must_use]
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.present()).count()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::zeroed()
    }
}
