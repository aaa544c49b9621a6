//! Guest ISA dispatch
//!
//! Maps ELF machine types to guest interpreters. Each supported ISA is a
//! variant of [`GuestThread`] sharing the step interface the scheduler
//! drives; [`IsaRegistry`] picks the variant for an image's `e_machine`
//! and [`IsaRegistry::thread_for_elf`] is the canonical load-and-spawn
//! entry point.

pub mod rv32i;

use std::collections::BTreeMap;
use std::io::{Read, Seek};

use log::debug;

use crate::config::EM_RISCV;
use crate::elf;
use crate::error::{KernelError, Result};
use crate::memory::AddressSpace;
use crate::syscall::SyscallFrame;

pub use rv32i::Rv32iThread;

/// Why a thread stopped making progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Instruction fetch from an unmapped page.
    UnmappedFetch { pc: u32 },
    /// The instruction word does not decode.
    IllegalInstruction { pc: u32, inst: u32 },
    /// A store could not be backed by a page (pool saturated).
    StoreFailed { addr: u32 },
}

/// Result of stepping a guest thread by one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Instruction retired; keep going.
    Continue,
    /// The thread's process asked to terminate with this status.
    Exit(u32),
    /// The guest executed its trap instruction; the host must service a
    /// syscall before the thread may continue.
    Trap,
    /// Unrecoverable; the thread must be removed.
    Fault(FaultKind),
}

/// Supported guest ISAs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsaKind {
    Rv32i,
}

/// A guest thread: one register context bound to an address space owned
/// by its process.
#[derive(Debug)]
pub enum GuestThread {
    Rv32i(Rv32iThread),
}

impl GuestThread {
    /// Construct a thread with the ISA's well-defined initial register
    /// state, pre-allocating its stack in `space`.
    pub fn new(kind: IsaKind, space: &mut AddressSpace) -> Result<Self> {
        match kind {
            IsaKind::Rv32i => Ok(Self::Rv32i(Rv32iThread::new(space)?)),
        }
    }

    /// Set the address execution starts at. Called at most once, before
    /// the first step.
    pub fn set_start_addr(&mut self, addr: u32) {
        match self {
            Self::Rv32i(thread) => thread.set_start_addr(addr),
        }
    }

    /// Execute one instruction against `space`.
    pub fn step(&mut self, space: &mut AddressSpace) -> StepOutcome {
        match self {
            Self::Rv32i(thread) => thread.step(space),
        }
    }

    /// Read the syscall frame. Only meaningful immediately after `step`
    /// returned [`StepOutcome::Trap`].
    pub fn syscall_frame(&self) -> SyscallFrame {
        match self {
            Self::Rv32i(thread) => thread.syscall_frame(),
        }
    }

    /// Install the result word of a serviced syscall.
    pub fn set_syscall_ret(&mut self, value: u32) {
        match self {
            Self::Rv32i(thread) => thread.set_syscall_ret(value),
        }
    }
}

/// Registry of `e_machine` → ISA bindings.
pub struct IsaRegistry {
    machines: BTreeMap<u16, IsaKind>,
}

impl Default for IsaRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl IsaRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            machines: BTreeMap::new(),
        }
    }

    /// A registry with every built-in ISA registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        // A fixed table cannot collide.
        let _ = registry.register(EM_RISCV, IsaKind::Rv32i);
        registry
    }

    /// Bind a machine type to an ISA. A second binding for the same
    /// machine fails with `Exists`.
    pub fn register(&mut self, machine: u16, kind: IsaKind) -> Result<()> {
        if self.machines.contains_key(&machine) {
            return Err(KernelError::Exists);
        }
        self.machines.insert(machine, kind);
        Ok(())
    }

    /// Construct a thread for a machine type.
    pub fn create(&self, machine: u16, space: &mut AddressSpace) -> Result<GuestThread> {
        let kind = self
            .machines
            .get(&machine)
            .copied()
            .ok_or(KernelError::Unsupported)?;
        GuestThread::new(kind, space)
    }

    /// Load an ELF image into `space` and construct the matching thread,
    /// entry point installed.
    pub fn thread_for_elf<F: Read + Seek>(
        &self,
        file: &mut F,
        space: &mut AddressSpace,
    ) -> Result<GuestThread> {
        let image = elf::load(file, space)?;
        debug!(
            "loaded image: entry={:#010x} machine={}",
            image.entry, image.machine
        );
        let mut thread = self.create(image.machine, space)?;
        thread.set_start_addr(image.entry);
        Ok(thread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = IsaRegistry::new();
        registry.register(EM_RISCV, IsaKind::Rv32i).unwrap();
        assert_eq!(
            registry.register(EM_RISCV, IsaKind::Rv32i),
            Err(KernelError::Exists)
        );
    }

    #[test]
    fn unknown_machine_is_unsupported() {
        let registry = IsaRegistry::with_defaults();
        let mut space = AddressSpace::new();
        assert!(matches!(
            registry.create(0xFFFF, &mut space),
            Err(KernelError::Unsupported)
        ));
    }

    #[test]
    fn defaults_cover_riscv() {
        let registry = IsaRegistry::with_defaults();
        let mut space = AddressSpace::new();
        let thread = registry.create(EM_RISCV, &mut space).unwrap();
        assert!(matches!(thread, GuestThread::Rv32i(_)));
    }
}
