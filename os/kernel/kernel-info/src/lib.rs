//! # Kernel Memory Layout and Boot Memory Map
//!
//! Shared constants and boot-handoff types for the memory-management core.
//! Everything here is plain data: no allocation, no locking, no `unsafe`.
//!
//! ## Virtual Memory Layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │   Null guard page               │
//! USERSPACE_START       ├─────────────────────────────────┤ 0x0000_0000_0000_1000
//!                       │   ELF segments                  │ ELF_REGION_START
//!                       │   Heap (brk)                    │ HEAP_REGION_START
//!                       │   mmap area (grows up)          │ MMAP_REGION_START
//!                       │   Stacks                        │ STACK_REGION_START
//! USERSPACE_END         ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │   Non-canonical hole            │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Linear map of physical RAM    │
//! KERNEL_VMM_BASE       ├─────────────────────────────────┤ 0xffff_ff80_0000_0000
//!                       │   Kernel VMM window             │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │   Kernel image                  │
//! 0xffff_ffff_ffff_ffff └─────────────────────────────────┘
//! ```
//!
//! The [`memory`] module holds the constants, [`boot`] the firmware memory map
//! that seeds the physical frame bitmap.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
