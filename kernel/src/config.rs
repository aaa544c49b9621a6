//! Emulator configuration constants
//!
//! Central place for the sizing knobs of the paged memory subsystem and
//! the guest execution model. Values match the reference configuration
//! the emulator was tuned for: hosts with a few tens of kilobytes of RAM
//! and a slow bulk store behind the swap backend.

use static_assertions::const_assert;

/// Size of one guest page in bytes. Must be a power of two.
pub const PAGE_SIZE: usize = 256;

/// Absolute maximum number of pages the pool will hand out
/// (RAM-resident and swapped-out combined).
pub const MAX_PAGES: usize = 16384;

/// Target number of RAM-resident pages per address space outside a tick
/// window. Inside a window every touched page stays resident; the
/// scheduler evicts everything at the window boundary and this value
/// only drives accounting diagnostics.
pub const RESIDENT_TARGET: usize = 16;

/// Guest instructions executed per process per scheduler tick.
pub const TICK_BATCH: usize = 64;

/// Top of the guest stack region.
pub const STACK_TOP: u32 = 0x8000_0000;

/// Guest stack size in bytes (16 KiB).
pub const STACK_SIZE: u32 = 0x4000;

/// Extra cushion mapped above [`STACK_TOP`] for the argv/argc seed words.
pub const STACK_CUSHION: u32 = 0x1000;

/// ELF `e_machine` value for RISC-V.
pub const EM_RISCV: u16 = 243;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(STACK_TOP as usize % PAGE_SIZE == 0);
const_assert!(STACK_SIZE as usize % PAGE_SIZE == 0);
