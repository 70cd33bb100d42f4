//! # Process Memory
//!
//! User address spaces built on top of `kernel-alloc` and `kernel-vmem`:
//!
//! - [`vma`]: virtual memory areas and the sorted, handle-addressed
//!   [`VmaList`](vma::VmaList) that records them.
//! - [`context`]: [`MmContext`](context::MmContext), one per process, with
//!   `brk`, anonymous and shared `mmap`, `munmap` and teardown.
//! - [`layout`]: the user-space bounds a context places mappings within.
//!
//! ```text
//! USERSPACE_START ┌──────────────────────────┐
//!                 │ ELF image, heap (brk) ↑  │
//! mmap_base       ├──────────────────────────┤
//!                 │ mmap areas ↑             │
//! stack_start     ├──────────────────────────┤
//!                 │ stacks                   │
//! USERSPACE_END   └──────────────────────────┘
//! ```

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod context;
pub mod layout;
pub mod vma;

pub use crate::context::{MmContext, MmError};
pub use crate::layout::UserLayout;
pub use crate::vma::{FileBacking, VmaArea, VmaHandle, VmaList, VmaProt, VmaType};
