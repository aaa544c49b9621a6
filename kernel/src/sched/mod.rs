//! Cooperative scheduler
//!
//! A process owns one address space and a list of guest threads. Each
//! [`Scheduler::tick`] visits every live process in order and gives it
//! one execution window:
//!
//! 1. swap the whole address space into RAM,
//! 2. run up to [`TICK_BATCH`] instructions round-robin across the
//!    process's threads, servicing traps synchronously,
//! 3. swap the address space back out.
//!
//! Threads that fault are removed on the spot; a process exits when a
//! thread issues the EXIT syscall or when its last thread is gone.
//! There is no preemption: the guest only advances inside `tick`.

use burrow_vfs::Vfs;
use log::{debug, warn};

use crate::config::TICK_BATCH;
use crate::error::Result;
use crate::isa::{GuestThread, IsaRegistry, StepOutcome};
use crate::memory::AddressSpace;
use crate::syscall::{self, SyscallOutcome};

/// One guest process: an address space plus its threads.
pub struct Process {
    pid: u32,
    name: String,
    space: AddressSpace,
    threads: Vec<GuestThread>,
}

impl Process {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    pub fn space_mut(&mut self) -> &mut AddressSpace {
        &mut self.space
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }
}

/// A process that terminated during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub pid: u32,
    pub name: String,
    pub status: u32,
}

/// What one scheduler tick accomplished.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Guest instructions retired across all processes.
    pub instructions: u64,
    /// Processes that exited via the EXIT syscall.
    pub exited: Vec<ProcessExit>,
}

/// The process table and tick loop.
#[derive(Default)]
pub struct Scheduler {
    processes: Vec<Process>,
    next_pid: u32,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            processes: Vec::new(),
            next_pid: 0,
        }
    }

    /// Register a process built from an address space and its first
    /// thread. Returns the assigned pid.
    pub fn spawn(&mut self, name: &str, space: AddressSpace, thread: GuestThread) -> u32 {
        self.next_pid += 1;
        let pid = self.next_pid;
        debug!("spawning {:?} as pid {}", name, pid);
        self.processes.push(Process {
            pid,
            name: name.to_string(),
            space,
            threads: vec![thread],
        });
        pid
    }

    /// Load an ELF image from `file` and spawn a process for it.
    pub fn spawn_elf<F: std::io::Read + std::io::Seek>(
        &mut self,
        name: &str,
        registry: &IsaRegistry,
        file: &mut F,
    ) -> Result<u32> {
        let mut space = AddressSpace::new();
        let thread = registry.thread_for_elf(file, &mut space)?;
        Ok(self.spawn(name, space, thread))
    }

    /// Whether there is any runnable work left.
    pub fn is_idle(&self) -> bool {
        self.processes.is_empty()
    }

    /// Number of live processes.
    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    /// Look up a live process.
    pub fn process(&self, pid: u32) -> Option<&Process> {
        self.processes.iter().find(|p| p.pid == pid)
    }

    /// Look up a live process for mutation (host-side inspection and
    /// debugging aids).
    pub fn process_mut(&mut self, pid: u32) -> Option<&mut Process> {
        self.processes.iter_mut().find(|p| p.pid == pid)
    }

    /// Run one execution window for every live process.
    pub fn tick(&mut self, vfs: &mut Vfs) -> TickReport {
        let mut report = TickReport::default();

        let mut i = 0;
        while i < self.processes.len() {
            let proc = &mut self.processes[i];
            if let Err(err) = proc.space.swap_in_all() {
                warn!("pid {}: swap-in failed: {}", proc.pid, err);
            }

            let mut exit_status = None;
            'window: for _ in 0..TICK_BATCH {
                if proc.threads.is_empty() {
                    break;
                }
                let mut t = 0;
                while t < proc.threads.len() {
                    match proc.threads[t].step(&mut proc.space) {
                        StepOutcome::Continue => {
                            report.instructions += 1;
                            t += 1;
                        }
                        StepOutcome::Trap => {
                            report.instructions += 1;
                            let frame = proc.threads[t].syscall_frame();
                            match syscall::dispatch(&frame, &mut proc.space, vfs) {
                                SyscallOutcome::Return(value) => {
                                    proc.threads[t].set_syscall_ret(value);
                                    t += 1;
                                }
                                SyscallOutcome::Exit(status) => {
                                    exit_status = Some(status);
                                    break 'window;
                                }
                            }
                        }
                        StepOutcome::Exit(status) => {
                            exit_status = Some(status);
                            break 'window;
                        }
                        StepOutcome::Fault(kind) => {
                            warn!("pid {}: thread faulted: {:?}", proc.pid, kind);
                            proc.threads.remove(t);
                        }
                    }
                }
            }

            if let Some(status) = exit_status {
                let proc = self.processes.remove(i);
                debug!("pid {} exited with status {}", proc.pid, status);
                report.exited.push(ProcessExit {
                    pid: proc.pid,
                    name: proc.name,
                    status,
                });
                continue;
            }

            if proc.threads.is_empty() {
                let proc = self.processes.remove(i);
                warn!("pid {} reaped: every thread faulted", proc.pid);
                continue;
            }

            if let Err(err) = proc.space.swap_out_all() {
                warn!("pid {}: swap-out failed: {}", proc.pid, err);
            }
            i += 1;
        }

        report
    }
}
