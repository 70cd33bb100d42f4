//! # Page Bitmap
//!
//! One bit per page, `1` = used. The storage is a caller-provided byte slice so
//! the bitmap can live in memory carved out of the boot memory map before any
//! allocator exists.
//!
//! Every index is bounds-checked. Range updates validate the whole range
//! before touching a single bit, so a failed call leaves the bitmap unchanged.
//!
//! ## The free hint
//!
//! `next_free` is a scan start, not a promise. It never rests on a used page:
//! it is either a free page or `len`. The bitmap keeps it at or below the
//! lowest free page as long as callers only use the `mark_*` operations;
//! [`PageBitmap::set_next_free_hint`] may move it further up, after which pages
//! below the hint are not found until something below it is freed again.

use kernel_memory_addresses::{PageSize, Size4K, align_up};

/// How every page starts out when a bitmap is created.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InitialState {
    /// All pages used; the owner frees what is actually available.
    AllUsed,
    /// All pages free; the owner marks reserved ranges used.
    AllFree,
}

/// Failures reported by [`PageBitmap`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BitmapError {
    #[error("pages {index}..{end} are outside the {len} tracked pages")]
    InvalidAddress { index: u64, end: u64, len: u64 },
    #[error("bitmap buffer holds {got} bytes, {needed} needed")]
    BufferTooSmall { needed: usize, got: usize },
}

/// A bounds-checked bit-per-page occupancy map.
pub struct PageBitmap<'buf> {
    bits: &'buf mut [u8],
    len: u64,
    used: u64,
    next_free: u64,
}

impl<'buf> PageBitmap<'buf> {
    /// Bytes of backing storage for `pages` bits, rounded up to whole pages.
    ///
    /// ```rust
    /// # use kernel_alloc::bitmap::PageBitmap;
    /// assert_eq!(PageBitmap::required_bytes(16), 4096);
    /// assert_eq!(PageBitmap::required_bytes(4096 * 8 + 1), 8192);
    /// ```
    #[must_use]
    pub const fn required_bytes(pages: u64) -> usize {
        let bytes = pages.div_ceil(8);
        match align_up(bytes, Size4K::SIZE) {
            #[allow(clippy::cast_possible_truncation)]
            Some(v) => v as usize,
            None => usize::MAX,
        }
    }

    /// Bind a bitmap for `pages` pages to `buffer`.
    ///
    /// # Errors
    /// [`BitmapError::BufferTooSmall`] if `buffer` holds fewer than `pages` bits.
    pub fn new(pages: u64, buffer: &'buf mut [u8], initial: InitialState) -> Result<Self, BitmapError> {
        let needed = usize::try_from(pages.div_ceil(8)).unwrap_or(usize::MAX);
        if buffer.len() < needed {
            return Err(BitmapError::BufferTooSmall {
                needed,
                got: buffer.len(),
            });
        }
        let bits = &mut buffer[..needed];
        let (used, next_free) = match initial {
            InitialState::AllUsed => {
                bits.fill(0xFF);
                (pages, pages)
            }
            InitialState::AllFree => {
                bits.fill(0);
                (0, 0)
            }
        };
        Ok(Self {
            bits,
            len: pages,
            used,
            next_free,
        })
    }

    /// Number of tracked pages.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn used_count(&self) -> u64 {
        self.used
    }

    #[must_use]
    pub const fn free_count(&self) -> u64 {
        self.len - self.used
    }

    /// Whether page `index` is used. Untracked pages count as used.
    #[must_use]
    pub fn is_used(&self, index: u64) -> bool {
        index >= self.len || self.bit(index)
    }

    /// Whether page `index` is free. Untracked pages are never free.
    #[must_use]
    pub fn is_free(&self, index: u64) -> bool {
        !self.is_used(index)
    }

    /// # Errors
    /// [`BitmapError::InvalidAddress`] if `index` is not tracked.
    pub fn mark_used(&mut self, index: u64) -> Result<(), BitmapError> {
        self.mark_range_used(index, 1)
    }

    /// # Errors
    /// [`BitmapError::InvalidAddress`] if `index` is not tracked.
    pub fn mark_free(&mut self, index: u64) -> Result<(), BitmapError> {
        self.mark_range_free(index, 1)
    }

    /// Mark `count` pages from `index` used; nothing changes on error.
    ///
    /// # Errors
    /// [`BitmapError::InvalidAddress`] if any page of the range is not tracked.
    pub fn mark_range_used(&mut self, index: u64, count: u64) -> Result<(), BitmapError> {
        let end = self.check_range(index, count)?;
        for i in index..end {
            if !self.bit(i) {
                self.set_bit(i, true);
                self.used += 1;
            }
        }
        self.skip_used();
        Ok(())
    }

    /// Mark `count` pages from `index` free; nothing changes on error.
    ///
    /// # Errors
    /// [`BitmapError::InvalidAddress`] if any page of the range is not tracked.
    pub fn mark_range_free(&mut self, index: u64, count: u64) -> Result<(), BitmapError> {
        let end = self.check_range(index, count)?;
        for i in index..end {
            if self.bit(i) {
                self.set_bit(i, false);
                self.used -= 1;
            }
        }
        if count > 0 {
            self.next_free = self.next_free.min(index);
        }
        Ok(())
    }

    /// Where the next free-page scan starts.
    #[must_use]
    pub const fn next_free_hint(&self) -> u64 {
        self.next_free
    }

    /// Move the scan start; clamped to the tracked range and moved past any
    /// used pages at `index`.
    pub fn set_next_free_hint(&mut self, index: u64) {
        self.next_free = index.min(self.len);
        self.skip_used();
    }

    fn skip_used(&mut self) {
        while self.next_free < self.len {
            if self.next_free.is_multiple_of(8) && self.bits[byte_index(self.next_free)] == 0xFF {
                self.next_free = (self.next_free + 8).min(self.len);
            } else if self.bit(self.next_free) {
                self.next_free += 1;
            } else {
                break;
            }
        }
    }

    /// First free page at or after the hint.
    #[must_use]
    pub fn find_free(&self) -> Option<u64> {
        let mut i = self.next_free;
        while i < self.len {
            // whole bytes of used pages are skipped in one step
            if i.is_multiple_of(8) && self.bits[byte_index(i)] == 0xFF {
                i += 8;
                continue;
            }
            if !self.bit(i) {
                return Some(i);
            }
            i += 1;
        }
        None
    }

    /// First run of `count` free pages at or after the hint whose start `s`
    /// satisfies `(bias + s) % align == 0`.
    ///
    /// `align` must be a power of two; `bias` lets a caller align absolute
    /// addresses when page 0 of the bitmap is not itself aligned.
    #[must_use]
    pub fn find_free_run(&self, count: u64, align: u64, bias: u64) -> Option<u64> {
        if count == 0 || !align.is_power_of_two() {
            return None;
        }
        let mut start = self.align_index(self.next_free, align, bias)?;
        loop {
            let end = start.checked_add(count)?;
            if end > self.len {
                return None;
            }
            match (start..end).rev().find(|&i| self.bit(i)) {
                None => return Some(start),
                Some(used) => start = self.align_index(used + 1, align, bias)?,
            }
        }
    }

    fn align_index(&self, index: u64, align: u64, bias: u64) -> Option<u64> {
        let absolute = bias.checked_add(index)?;
        align_up(absolute, align).map(|a| a - bias)
    }

    pub(crate) fn check_range(&self, index: u64, count: u64) -> Result<u64, BitmapError> {
        match index.checked_add(count) {
            Some(end) if end <= self.len => Ok(end),
            _ => Err(BitmapError::InvalidAddress {
                index,
                end: index.saturating_add(count),
                len: self.len,
            }),
        }
    }

    #[inline]
    fn bit(&self, index: u64) -> bool {
        self.bits[byte_index(index)] & (1 << (index % 8)) != 0
    }

    #[inline]
    fn set_bit(&mut self, index: u64, used: bool) {
        let mask = 1u8 << (index % 8);
        let byte = &mut self.bits[byte_index(index)];
        if used {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn byte_index(index: u64) -> usize {
    (index / 8) as usize
}
