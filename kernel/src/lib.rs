//! Burrow core
//!
//! A tiny user-mode operating-system emulator for resource-constrained
//! hosts. Guest programs are ELF32 images for a supported guest ISA
//! (RV32I today); the host executes them one instruction at a time,
//! services their syscalls, and backs their address spaces with a paged
//! two-tier (RAM + swap) store.
//!
//! # Architecture
//!
//! - `memory`: the page pool, swap backends, and sparse address spaces
//! - `elf`: ELF32 loader over any seekable byte stream
//! - `isa`: guest ISA dispatch and the RV32I interpreter
//! - `sched`: cooperative process table and tick loop
//! - `syscall`: the trap boundary between guests and the VFS
//! - `vfs_io`: `Read + Seek` adapter over VFS descriptors
//!
//! The filesystem itself lives in the `burrow-vfs` crate.

pub mod config;
pub mod elf;
pub mod error;
pub mod isa;
pub mod memory;
pub mod sched;
pub mod syscall;
pub mod vfs_io;

pub use config::{EM_RISCV, MAX_PAGES, PAGE_SIZE, TICK_BATCH};
pub use elf::LoadedImage;
pub use error::{KernelError, Result};
pub use isa::{FaultKind, GuestThread, IsaKind, IsaRegistry, StepOutcome};
pub use memory::{AddressSpace, DirSwap, PageId, RamSwap, SwapBackend};
pub use sched::{ProcessExit, Scheduler, TickReport};
pub use syscall::{SyscallFrame, SyscallOutcome};
pub use vfs_io::VfsFile;
