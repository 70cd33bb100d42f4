//! Virtual memory areas and the per-process list that orders them.
//!
//! A [`VmaList`] keeps its areas sorted by start address. Nodes live in an
//! arena of slots and are linked to their neighbours by slot index. Each area
//! is named by a [`VmaHandle`] that carries the slot's generation, so a handle
//! to a removed area stops resolving instead of reaching whatever later reuses
//! the slot.
//!
//! The list never checks for overlap; placement code does that before it
//! inserts.

use alloc::vec::Vec;
use core::fmt;
use kernel_memory_addresses::VirtualAddress;

bitflags::bitflags! {
    /// Access rights of an area (the `PROT_*` values).
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct VmaProt: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

bitflags::bitflags! {
    /// Sharing and backing of an area.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct VmaType: u32 {
        const PRIVATE = 0x1;
        const SHARED = 0x2;
        const ANONYMOUS = 0x4;
        const FILE = 0x8;
    }
}

/// Opaque identity of the object a file-backed area maps.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct FileBacking(pub u64);

/// Stable name of an area inside one [`VmaList`].
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct VmaHandle {
    index: u32,
    generation: u32,
}

impl VmaHandle {
    /// Handle of an area that has not been inserted into a list.
    pub const DETACHED: Self = Self {
        index: u32::MAX,
        generation: 0,
    };
}

impl fmt::Debug for VmaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::DETACHED {
            write!(f, "VmaHandle::DETACHED")
        } else {
            write!(f, "VmaHandle({}#{})", self.index, self.generation)
        }
    }
}

/// One contiguous range `[start, end)` of a process address space.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VmaArea {
    start: VirtualAddress,
    end: VirtualAddress,
    prot: VmaProt,
    kind: VmaType,
    backing: Option<FileBacking>,
    file_offset: u64,
    handle: VmaHandle,
}

impl VmaArea {
    /// An anonymous-or-unbacked area; attach a file with [`with_file`](Self::with_file).
    #[must_use]
    pub const fn new(start: VirtualAddress, end: VirtualAddress, prot: VmaProt, kind: VmaType) -> Self {
        Self {
            start,
            end,
            prot,
            kind,
            backing: None,
            file_offset: 0,
            handle: VmaHandle::DETACHED,
        }
    }

    #[must_use]
    pub const fn with_file(mut self, backing: Option<FileBacking>, file_offset: u64) -> Self {
        self.backing = backing;
        self.file_offset = file_offset;
        self
    }

    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    /// Exclusive end.
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        self.end
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn prot(&self) -> VmaProt {
        self.prot
    }

    #[must_use]
    pub const fn kind(&self) -> VmaType {
        self.kind
    }

    #[must_use]
    pub const fn backing(&self) -> Option<FileBacking> {
        self.backing
    }

    #[must_use]
    pub const fn file_offset(&self) -> u64 {
        self.file_offset
    }

    /// [`VmaHandle::DETACHED`] until the area is inserted.
    #[must_use]
    pub const fn handle(&self) -> VmaHandle {
        self.handle
    }

    #[must_use]
    pub fn contains(&self, addr: VirtualAddress) -> bool {
        addr >= self.start && addr < self.end
    }

    /// True if the area shares at least one byte with `[start, end)`.
    #[must_use]
    pub fn overlaps(&self, start: VirtualAddress, end: VirtualAddress) -> bool {
        self.start < end && self.end > start
    }

    /// Whether `next` continues this area seamlessly.
    fn can_absorb(&self, next: &Self) -> bool {
        self.end == next.start
            && self.prot == next.prot
            && self.kind == next.kind
            && self.backing == next.backing
            && (self.backing.is_none() || self.file_offset + self.len() == next.file_offset)
    }
}

impl fmt::Display for VmaArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |set: bool, c: char| if set { c } else { '-' };
        let kind = if self.kind.contains(VmaType::SHARED) {
            "shared"
        } else if self.kind.contains(VmaType::PRIVATE) {
            "private"
        } else {
            "-"
        };
        let backing = if self.kind.contains(VmaType::FILE) { "file" } else { "anon" };
        write!(
            f,
            "{}..{} {}{}{} {kind:<7} {backing} {:>8} KiB",
            self.start,
            self.end,
            flag(self.prot.contains(VmaProt::READ), 'r'),
            flag(self.prot.contains(VmaProt::WRITE), 'w'),
            flag(self.prot.contains(VmaProt::EXEC), 'x'),
            self.len() / 1024,
        )
    }
}

struct Node {
    area: VmaArea,
    prev: Option<u32>,
    next: Option<u32>,
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Sorted, non-owning record of the areas of one address space.
#[derive(Default)]
pub struct VmaList {
    slots: Vec<Slot>,
    free: Vec<u32>,
    head: Option<u32>,
    len: usize,
}

impl VmaList {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            len: 0,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The area named by `handle`, if it is still in the list.
    #[must_use]
    pub fn get(&self, handle: VmaHandle) -> Option<&VmaArea> {
        self.index_of(handle)
            .and_then(|i| self.node(i))
            .map(|n| &n.area)
    }

    /// Areas in ascending address order.
    #[must_use]
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            cur: self.head,
        }
    }

    #[must_use]
    pub fn next_of(&self, handle: VmaHandle) -> Option<&VmaArea> {
        let next = self.node(self.index_of(handle)?)?.next?;
        self.node(next).map(|n| &n.area)
    }

    #[must_use]
    pub fn prev_of(&self, handle: VmaHandle) -> Option<&VmaArea> {
        let prev = self.node(self.index_of(handle)?)?.prev?;
        self.node(prev).map(|n| &n.area)
    }

    /// The area containing `addr`.
    #[must_use]
    pub fn find(&self, addr: VirtualAddress) -> Option<&VmaArea> {
        self.iter()
            .take_while(|a| a.start <= addr)
            .find(|a| a.contains(addr))
    }

    /// The lowest area sharing at least one byte with `[start, end)`.
    #[must_use]
    pub fn first_overlap(&self, start: VirtualAddress, end: VirtualAddress) -> Option<&VmaArea> {
        self.iter()
            .take_while(|a| a.start < end)
            .find(|a| a.overlaps(start, end))
    }

    /// Insert `area` behind every area that starts below it.
    pub fn insert(&mut self, area: VmaArea) -> VmaHandle {
        let mut prev = None;
        let mut cur = self.head;
        while let Some(node) = cur.and_then(|i| self.node(i)) {
            if node.area.start >= area.start {
                break;
            }
            prev = cur;
            cur = node.next;
        }
        self.link(area, prev, cur)
    }

    /// Unlink the area named by `handle` and invalidate the handle.
    pub fn remove(&mut self, handle: VmaHandle) -> Option<VmaArea> {
        let index = self.index_of(handle)?;
        let slot = self.slots.get_mut(index as usize)?;
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);

        match node.prev {
            Some(p) => {
                if let Some(prev) = self.node_mut(p) {
                    prev.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        if let Some(next) = node.next.and_then(|n| self.node_mut(n)) {
            next.prev = node.prev;
        }
        self.len -= 1;
        Some(node.area)
    }

    /// Coalesce the area with identical neighbours on either side.
    ///
    /// The following area is absorbed first, then the result is absorbed
    /// into the preceding one. Returns the handle of the surviving area, or
    /// `None` if nothing was merged.
    pub fn merge(&mut self, handle: VmaHandle) -> Option<VmaHandle> {
        let area = *self.get(handle)?;
        let mut survivor = None;

        if let Some(next) = self.next_of(handle).copied()
            && area.can_absorb(&next)
        {
            self.remove(next.handle);
            self.node_mut(handle.index)?.area.end = next.end;
            survivor = Some(handle);
        }

        let area = *self.get(handle)?;
        if let Some(prev) = self.prev_of(handle).copied()
            && prev.can_absorb(&area)
        {
            self.remove(handle);
            self.node_mut(prev.handle.index)?.area.end = area.end;
            survivor = Some(prev.handle);
        }
        survivor
    }

    /// Cut the area at `at`, keeping `[start, at)` under the old handle.
    ///
    /// The upper part inherits protection, type and backing, with its file
    /// offset advanced by `at - start`. `None` unless `start < at < end`.
    pub fn split(&mut self, handle: VmaHandle, at: VirtualAddress) -> Option<VmaHandle> {
        let index = self.index_of(handle)?;
        let area = *self.get(handle)?;
        if at <= area.start || at >= area.end {
            return None;
        }
        let upper = VmaArea {
            start: at,
            file_offset: area.file_offset + (at.as_u64() - area.start.as_u64()),
            ..area
        };
        let node = self.node_mut(index)?;
        node.area.end = at;
        let next = node.next;
        Some(self.link(upper, Some(index), next))
    }

    /// Move the end of an area down to `end` (`start < end <= old end`).
    pub(crate) fn truncate_end(&mut self, handle: VmaHandle, end: VirtualAddress) -> bool {
        let Some(node) = self.index_of(handle).and_then(|i| self.node_mut(i)) else {
            return false;
        };
        if end <= node.area.start || end > node.area.end {
            return false;
        }
        node.area.end = end;
        true
    }

    /// Move the start of an area up to `start` (`old start <= start < end`),
    /// advancing its file offset by the same amount.
    pub(crate) fn truncate_start(&mut self, handle: VmaHandle, start: VirtualAddress) -> bool {
        let Some(node) = self.index_of(handle).and_then(|i| self.node_mut(i)) else {
            return false;
        };
        if start < node.area.start || start >= node.area.end {
            return false;
        }
        node.area.file_offset += start.as_u64() - node.area.start.as_u64();
        node.area.start = start;
        true
    }

    #[allow(clippy::cast_possible_truncation)]
    fn link(&mut self, mut area: VmaArea, prev: Option<u32>, next: Option<u32>) -> VmaHandle {
        let index = self.free.pop().unwrap_or_else(|| {
            self.slots.push(Slot {
                generation: 0,
                node: None,
            });
            (self.slots.len() - 1) as u32
        });
        let slot = &mut self.slots[index as usize];
        area.handle = VmaHandle {
            index,
            generation: slot.generation,
        };
        slot.node = Some(Node { area, prev, next });

        match prev {
            Some(p) => {
                if let Some(prev) = self.node_mut(p) {
                    prev.next = Some(index);
                }
            }
            None => self.head = Some(index),
        }
        if let Some(next) = next.and_then(|n| self.node_mut(n)) {
            next.prev = Some(index);
        }
        self.len += 1;
        area.handle
    }

    fn index_of(&self, handle: VmaHandle) -> Option<u32> {
        let slot = self.slots.get(handle.index as usize)?;
        (slot.generation == handle.generation && slot.node.is_some()).then_some(handle.index)
    }

    fn node(&self, index: u32) -> Option<&Node> {
        self.slots.get(index as usize)?.node.as_ref()
    }

    fn node_mut(&mut self, index: u32) -> Option<&mut Node> {
        self.slots.get_mut(index as usize)?.node.as_mut()
    }
}

impl<'a> IntoIterator for &'a VmaList {
    type Item = &'a VmaArea;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// In-order iterator over a [`VmaList`].
pub struct Iter<'a> {
    list: &'a VmaList,
    cur: Option<u32>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a VmaArea;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.list.node(self.cur?)?;
        self.cur = node.next;
        Some(&node.area)
    }
}
