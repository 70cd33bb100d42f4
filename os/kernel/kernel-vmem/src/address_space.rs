//! # Address Space (x86-64, PML4-rooted)
//!
//! An [`AddressSpace`] is a handle to one translation tree: the physical frame
//! of its PML4 plus the [`PhysMapper`] used to reach table frames.
//!
//! ## Mapping is all-or-nothing
//!
//! [`AddressSpace::map_pages`] runs in two passes. The first pass builds every
//! missing intermediate table for the whole range and tags each newly linked
//! entry with a software bit ([`PageEntryBits::is_fresh_link`]). If any
//! allocation fails, the range is swept and every tagged subtree is unlinked
//! and returned to the [`FrameAlloc`], which leaves the tree exactly as it was.
//! Only when the first pass succeeds are the tags cleared and the leaves
//! written; writing a leaf into an existing table cannot fail.
//!
//! ## Safety
//!
//! - Mutating active mappings requires TLB maintenance by the caller.
//! - The provided `PhysMapper` must yield writable references to table frames.
//! - Two `AddressSpace` handles for the same root must not be mutated
//!   concurrently; the owner serializes access.

use crate::addresses::{PageSize, PhysicalAddress, PhysicalPage, Size1G, Size4K, VirtualAddress};
use crate::page_table::{ENTRIES_PER_TABLE, PageTable, PageTableLevel, TableIndex};
use crate::{FrameAlloc, PageEntryBits, PhysMapper};
use kernel_info::memory::KERNEL_HALF_FIRST_PML4_INDEX;

/// Highest physical address bit the entry format can hold.
const MAX_PHYSICAL_BITS: u32 = 52;

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalPage<Size4K>,
    mapper: &'m M,
}

/// Why a map request was rejected.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("out of memory allocating a table below a {0} entry")]
    OutOfMemory(PageTableLevel),
    #[error("virtual address {0} is misaligned or not canonical")]
    InvalidVirtualAddress(VirtualAddress),
    #[error("physical address {0} is misaligned or out of range")]
    InvalidPhysicalAddress(PhysicalAddress),
    #[error("mapping at {0} conflicts with a translation of a different page size")]
    SizeConflict(VirtualAddress),
    #[error("page range overflows the address space")]
    RangeOverflow,
}

/// Why an unmap request was rejected.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum UnmapError {
    #[error("no 4 KiB page is mapped at {0}")]
    NotMapped(VirtualAddress),
    #[error("{0} is covered by a large page")]
    SizeConflict(VirtualAddress),
}

/// Location of a leaf entry found by a walk.
#[derive(Debug, Copy, Clone)]
struct LeafSlot {
    table: PhysicalPage<Size4K>,
    index: TableIndex,
    level: PageTableLevel,
    entry: PageEntryBits,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Create an empty address space with a freshly zeroed root.
    pub fn new<A: FrameAlloc>(mapper: &'m M, alloc: &mut A) -> Option<Self> {
        let root = alloc.alloc_4k()?;
        let space = Self { root, mapper };
        space.table(root).zero();
        Some(space)
    }

    /// Create a process address space whose upper half shares the kernel's
    /// translations (root slots `256..512` are copied from `kernel`).
    pub fn new_user<A: FrameAlloc>(
        mapper: &'m M,
        alloc: &mut A,
        kernel: &AddressSpace<'_, M>,
    ) -> Option<Self> {
        let space = Self::new(mapper, alloc)?;
        let src = kernel.table(kernel.root);
        let dst = space.table(space.root);
        for i in KERNEL_HALF_FIRST_PML4_INDEX..ENTRIES_PER_TABLE {
            #[allow(clippy::cast_possible_truncation)]
            let i = TableIndex::new(i as u16);
            dst.set(i, src.get(i));
        }
        Some(space)
    }

    /// Wrap an existing root.
    #[inline]
    #[must_use]
    pub const fn from_root(mapper: &'m M, root: PhysicalPage<Size4K>) -> Self {
        Self { root, mapper }
    }

    /// Physical frame of the PML4 (the value a CR3 load would use).
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    /// Map one 4 KiB page `va → pa`.
    ///
    /// An existing leaf at `va` is overwritten. `flags` describe the leaf;
    /// `present` is forced on and `PS` off.
    ///
    /// # Errors
    /// See [`MapError`]. On error no table and no leaf has been added.
    #[inline]
    pub fn map_page<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<(), MapError> {
        self.map_pages(alloc, va, pa, 1, flags)
    }

    /// Map `count` consecutive 4 KiB pages `va + i*4K → pa + i*4K`.
    ///
    /// # Errors
    /// See [`MapError`]. On error every table allocated by this call has been
    /// released and no leaf has been written.
    pub fn map_pages<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        count: u64,
        flags: PageEntryBits,
    ) -> Result<(), MapError> {
        if count == 0 {
            return Ok(());
        }
        let last = check_range(va, pa, count)?;
        let user = flags.user_access();

        for i in 0..count {
            let page_va = va + i * Size4K::SIZE;
            if let Err(e) = self.ensure_chain(alloc, page_va, user) {
                self.settle_fresh(alloc, self.root, PageTableLevel::Pml4, va.as_u64(), last, true);
                log::debug!("map of {count} page(s) at {va} failed: {e}");
                return Err(e);
            }
        }
        self.settle_fresh(alloc, self.root, PageTableLevel::Pml4, va.as_u64(), last, false);

        let leaf = flags.with_present(true).with_large_page(false).with_fresh_link(false);
        for i in 0..count {
            let page_va = va + i * Size4K::SIZE;
            // Every table on the path exists now, so this never allocates.
            let pt = self.ensure_chain(alloc, page_va, user)?;
            self.table(pt).set(
                PageTableLevel::Pt.index_of(page_va),
                leaf.with_physical_address(pa + i * Size4K::SIZE),
            );
        }
        Ok(())
    }

    /// Clear the 4 KiB leaf at `va` and return the frame it pointed to.
    ///
    /// Intermediate tables stay in place.
    ///
    /// # Errors
    /// [`UnmapError::NotMapped`] if nothing is mapped, or
    /// [`UnmapError::SizeConflict`] if `va` lies inside a large page.
    pub fn unmap_page(&mut self, va: VirtualAddress) -> Result<PhysicalAddress, UnmapError> {
        let Some(slot) = self.walk(va) else {
            return Err(UnmapError::NotMapped(va));
        };
        if slot.level != PageTableLevel::Pt {
            return Err(UnmapError::SizeConflict(va));
        }
        self.table(slot.table).clear(slot.index);
        Ok(slot.entry.physical_address())
    }

    /// Translate `va` by walking the tree (handles 1 GiB / 2 MiB / 4 KiB leaves).
    #[must_use]
    pub fn get_physical_address(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let slot = self.walk(va)?;
        let mask = slot.level.entry_span() - 1;
        let base = slot.entry.physical_address().as_u64() & !mask;
        Some(PhysicalAddress::new(base | (va.as_u64() & mask)))
    }

    /// The leaf entry translating `va`, if any.
    #[must_use]
    pub fn leaf_entry(&self, va: VirtualAddress) -> Option<PageEntryBits> {
        self.walk(va).map(|slot| slot.entry)
    }

    /// Install a 1 GiB leaf `va → pa` at the PDPT level.
    ///
    /// Used for the boot-time identity map only; see [`crate::bootstrap`].
    ///
    /// # Errors
    /// Both addresses must be 1 GiB aligned, and the PDPT slot must not already
    /// hold a table.
    pub fn map_huge_1g<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<(), MapError> {
        if !va.is_aligned_to(Size1G::SIZE) || !va.is_canonical() {
            return Err(MapError::InvalidVirtualAddress(va));
        }
        if !pa.is_aligned_to(Size1G::SIZE) || pa.as_u64() >> MAX_PHYSICAL_BITS != 0 {
            return Err(MapError::InvalidPhysicalAddress(pa));
        }

        let pdpt = self.next_table(alloc, self.root, PageTableLevel::Pml4, va, flags.user_access(), false)?;
        let table = self.table(pdpt);
        let index = PageTableLevel::Pdpt.index_of(va);
        let existing = table.get(index);
        if existing.present() && !existing.large_page() {
            return Err(MapError::SizeConflict(va));
        }
        table.set(
            index,
            flags
                .with_present(true)
                .with_large_page(true)
                .with_physical_address(pa),
        );
        Ok(())
    }

    /// Free every lower-half table and the root itself.
    ///
    /// Leaf frames are not touched; the owner must have released them. The
    /// upper half is shared with the kernel and is left alone.
    pub fn release_user_tables<A: FrameAlloc>(self, alloc: &mut A) {
        let root = self.table(self.root);
        for i in 0..KERNEL_HALF_FIRST_PML4_INDEX {
            #[allow(clippy::cast_possible_truncation)]
            let index = TableIndex::new(i as u16);
            let e = root.get(index);
            if e.present() {
                root.clear(index);
                self.free_subtree(alloc, PhysicalPage::containing(e.physical_address()), PageTableLevel::Pdpt);
            }
        }
        alloc.free_4k(self.root);
    }

    #[inline]
    fn table(&self, page: PhysicalPage<Size4K>) -> &'m mut PageTable {
        // SAFETY: table frames are owned by this tree and mapped writable by the mapper.
        unsafe { self.mapper.phys_to_mut::<PageTable>(page.base()) }
    }

    fn walk(&self, va: VirtualAddress) -> Option<LeafSlot> {
        let mut table = self.root;
        let mut level = PageTableLevel::Pml4;
        loop {
            let index = level.index_of(va);
            let entry = self.table(table).get(index);
            if !entry.present() {
                return None;
            }
            let slot = LeafSlot {
                table,
                index,
                level,
                entry,
            };
            let Some(next) = level.next() else {
                return Some(slot);
            };
            if level.allows_large_leaf() && entry.large_page() {
                return Some(slot);
            }
            table = PhysicalPage::containing(entry.physical_address());
            level = next;
        }
    }

    /// Walk to (and create as needed) the PT that holds the leaf for `va`.
    fn ensure_chain<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        va: VirtualAddress,
        user: bool,
    ) -> Result<PhysicalPage<Size4K>, MapError> {
        let pdpt = self.next_table(alloc, self.root, PageTableLevel::Pml4, va, user, true)?;
        let pd = self.next_table(alloc, pdpt, PageTableLevel::Pdpt, va, user, true)?;
        self.next_table(alloc, pd, PageTableLevel::Pd, va, user, true)
    }

    /// Follow the entry for `va` in `table`, allocating a zeroed child if it is absent.
    fn next_table<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        table: PhysicalPage<Size4K>,
        level: PageTableLevel,
        va: VirtualAddress,
        user: bool,
        mark_fresh: bool,
    ) -> Result<PhysicalPage<Size4K>, MapError> {
        let index = level.index_of(va);
        let parent = self.table(table);
        let entry = parent.get(index);

        if entry.present() {
            if entry.large_page() {
                return Err(MapError::SizeConflict(va));
            }
            if user && !entry.user_access() {
                parent.set(index, entry.with_user_access(true));
            }
            return Ok(PhysicalPage::containing(entry.physical_address()));
        }

        let child = alloc.alloc_4k().ok_or(MapError::OutOfMemory(level))?;
        self.table(child).zero();
        parent.set(
            index,
            PageEntryBits::table_link(child.base(), user).with_fresh_link(mark_fresh),
        );
        Ok(child)
    }

    /// Sweep `[first, last]` below `table`: either clear the fresh tags
    /// (`discard == false`) or unlink and free every freshly linked subtree.
    fn settle_fresh<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        table: PhysicalPage<Size4K>,
        level: PageTableLevel,
        first: u64,
        last: u64,
        discard: bool,
    ) {
        let Some(child_level) = level.next() else {
            return;
        };
        let span = level.entry_span();
        let mut cur = first;
        loop {
            let entry_last = (cur | (span - 1)).min(last);
            let index = level.index_of(VirtualAddress::new(cur));
            let parent = self.table(table);
            let entry = parent.get(index);

            if entry.present() && !entry.large_page() {
                let child = PhysicalPage::containing(entry.physical_address());
                if entry.is_fresh_link() && discard {
                    parent.clear(index);
                    self.free_subtree(alloc, child, child_level);
                } else {
                    if entry.is_fresh_link() {
                        parent.set(index, entry.with_fresh_link(false));
                    }
                    self.settle_fresh(alloc, child, child_level, cur, entry_last, discard);
                }
            }

            if entry_last >= last {
                break;
            }
            cur = entry_last + 1;
        }
    }

    /// Return `page` and every table below it; leaf targets are not freed.
    fn free_subtree<A: FrameAlloc>(&self, alloc: &mut A, page: PhysicalPage<Size4K>, level: PageTableLevel) {
        if let Some(child_level) = level.next() {
            let table = self.table(page);
            for i in 0..ENTRIES_PER_TABLE {
                #[allow(clippy::cast_possible_truncation)]
                let e = table.get(TableIndex::new(i as u16));
                if e.present() && !e.large_page() {
                    self.free_subtree(alloc, PhysicalPage::containing(e.physical_address()), child_level);
                }
            }
        }
        alloc.free_4k(page);
    }
}

/// Validate a 4 KiB page range and return the address of its last byte.
fn check_range(va: VirtualAddress, pa: PhysicalAddress, count: u64) -> Result<u64, MapError> {
    if !va.is_aligned_to(Size4K::SIZE) || !va.is_canonical() {
        return Err(MapError::InvalidVirtualAddress(va));
    }
    if !pa.is_aligned_to(Size4K::SIZE) {
        return Err(MapError::InvalidPhysicalAddress(pa));
    }
    let span = count
        .checked_mul(Size4K::SIZE)
        .ok_or(MapError::RangeOverflow)?
        - 1;
    let last_va = va.as_u64().checked_add(span).ok_or(MapError::RangeOverflow)?;
    let last_pa = pa.as_u64().checked_add(span).ok_or(MapError::RangeOverflow)?;

    let end = VirtualAddress::new(last_va);
    if !end.is_canonical() || end.is_upper_half() != va.is_upper_half() {
        return Err(MapError::RangeOverflow);
    }
    if last_pa >> MAX_PHYSICAL_BITS != 0 {
        return Err(MapError::InvalidPhysicalAddress(pa));
    }
    Ok(last_va)
}
