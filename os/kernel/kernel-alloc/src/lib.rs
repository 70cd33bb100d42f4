//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! Physical frames, kernel virtual ranges, the kernel heap and DMA buffers,
//! layered as:
//!
//! ```text
//! ┌──────────────────────────┐ ┌────────────────────────┐
//! │  Kernel heap (heap)      │ │  DMA pools (dma)       │
//! │    • malloc / free       │ │    • fixed-size blocks │
//! └────────────┬─────────────┘ └───────────┬────────────┘
//!              └──────────────┬────────────┘
//! ┌───────────────────────────▼─────────────────────────┐
//! │  Kernel VMM (vmm)                                   │
//! │    • virtual window + frames + page tables          │
//! │    • linear-window persistent pages                 │
//! └───────┬─────────────────────────────┬───────────────┘
//!         │                             │
//! ┌───────▼──────────────┐   ┌──────────▼───────────────┐
//! │ Frame allocator      │   │ Virtual range allocator  │
//! │ (frame_alloc)        │   │ (virt_range)             │
//! └───────┬──────────────┘   └──────────┬───────────────┘
//!         └──────────────┬──────────────┘
//!              ┌─────────▼─────────┐
//!              │ Page bitmap       │
//!              │ (bitmap)          │
//!              └───────────────────┘
//! ```
//!
//! Page-table editing itself lives in `kernel-vmem`; this crate supplies it
//! with frames ([`frame_alloc::SharedFrameAlloc`]) and with a way to reach
//! them ([`phys_mapper::HhdmPhysMapper`]).
//!
//! [`manager::MemoryManager`] ties the pieces together and is what the rest
//! of the kernel is handed at boot.
//!
//! ## Memory Layout Integration
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │        User Space               │
//! 0x0000_8000_0000_0000 ├─────────────────────────────────┤
//!                       │        (non-canonical)          │
//! HHDM_BASE             ├─────────────────────────────────┤
//!                       │   Linear map of physical RAM    │
//! KERNEL_VMM_BASE       ├─────────────────────────────────┤
//!                       │   Kernel VMM window             │
//! KERNEL_BASE           ├─────────────────────────────────┤
//!                       │   Kernel image                  │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod bitmap;
pub mod dma;
pub mod frame_alloc;
pub mod heap;
pub mod manager;
pub mod phys_mapper;
pub mod virt_range;
pub mod vmm;
