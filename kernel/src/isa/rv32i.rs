//! RV32I interpreter
//!
//! Executes the RISC-V base integer ISA one instruction at a time
//! against a paged guest address space. No privileged modes, no CSRs,
//! no M/A/F/D extensions: any `SYSTEM` encoding traps to the host so the
//! syscall layer can inspect `a7`, and every other unrecognised opcode
//! faults the thread.
//!
//! Memory accesses go through the address space: loads from unmapped
//! pages read zero, stores allocate missing pages on the fly.

use log::warn;

use crate::config::{PAGE_SIZE, STACK_CUSHION, STACK_SIZE, STACK_TOP};
use crate::error::Result;
use crate::isa::{FaultKind, StepOutcome};
use crate::memory::space::page_start;
use crate::memory::AddressSpace;
use crate::syscall::SyscallFrame;

/// Sign-extend the low `bits` bits of `value` to 32 bits.
fn sign_extend(value: u32, bits: u32) -> u32 {
    if value & (1 << (bits - 1)) != 0 {
        value | !((1 << bits) - 1)
    } else {
        value
    }
}

fn opcode(inst: u32) -> u32 {
    inst & 0x7F
}

fn rd(inst: u32) -> usize {
    ((inst >> 7) & 0x1F) as usize
}

fn funct3(inst: u32) -> u32 {
    (inst >> 12) & 0x07
}

fn rs1(inst: u32) -> usize {
    ((inst >> 15) & 0x1F) as usize
}

fn rs2(inst: u32) -> usize {
    ((inst >> 20) & 0x1F) as usize
}

fn funct7(inst: u32) -> u32 {
    (inst >> 25) & 0x7F
}

fn imm_i(inst: u32) -> u32 {
    sign_extend((inst >> 20) & 0xFFF, 12)
}

fn imm_s(inst: u32) -> u32 {
    sign_extend(((inst >> 25) & 0x7F) << 5 | ((inst >> 7) & 0x1F), 12)
}

fn imm_b(inst: u32) -> u32 {
    sign_extend(
        ((inst >> 31) & 0x1) << 12
            | ((inst >> 7) & 0x1) << 11
            | ((inst >> 25) & 0x3F) << 5
            | ((inst >> 8) & 0xF) << 1,
        13,
    )
}

fn imm_u(inst: u32) -> u32 {
    inst & 0xFFFF_F000
}

fn imm_j(inst: u32) -> u32 {
    sign_extend(
        ((inst >> 31) & 0x1) << 20
            | ((inst >> 12) & 0xFF) << 12
            | ((inst >> 20) & 0x1) << 11
            | ((inst >> 21) & 0x3FF) << 1,
        21,
    )
}

/// Base-ISA major opcodes this interpreter decodes.
mod op {
    pub const LOAD: u32 = 0b000_0011;
    pub const MISC_MEM: u32 = 0b000_1111;
    pub const OP_IMM: u32 = 0b001_0011;
    pub const AUIPC: u32 = 0b001_0111;
    pub const STORE: u32 = 0b010_0011;
    pub const OP: u32 = 0b011_0011;
    pub const LUI: u32 = 0b011_0111;
    pub const BRANCH: u32 = 0b110_0011;
    pub const JALR: u32 = 0b110_0111;
    pub const JAL: u32 = 0b110_1111;
    pub const SYSTEM: u32 = 0b111_0011;
}

/// One RV32I hardware thread: 32 general registers and a program
/// counter.
#[derive(Debug)]
pub struct Rv32iThread {
    regs: [u32; 32],
    pc: u32,
}

impl Rv32iThread {
    /// Create a thread with the ABI initial state: a 16 KiB stack below
    /// [`STACK_TOP`] (plus a one-page cushion above it), `sp`/`fp` at
    /// `STACK_TOP - 4`, `ra` parked at an unmapped address so a return
    /// past the entry point is a detectable fault, and two zero words
    /// seeding the argc/argv area.
    pub fn new(space: &mut AddressSpace) -> Result<Self> {
        let stack_bottom = STACK_TOP - STACK_SIZE;

        let mut addr = page_start(u64::from(stack_bottom));
        let last = page_start(u64::from(STACK_TOP) + u64::from(STACK_CUSHION));
        while addr <= last {
            space.ensure_page(addr)?;
            addr += PAGE_SIZE as u64;
        }

        let mut thread = Self {
            regs: [0; 32],
            pc: 0,
        };
        thread.write32(space, STACK_TOP, 0)?;
        thread.write32(space, STACK_TOP - 4, 0)?;
        thread.regs[2] = STACK_TOP - 4; // sp
        thread.regs[8] = STACK_TOP - 4; // fp
        thread.regs[1] = 0xFFFF_FFFF; // ra
        Ok(thread)
    }

    /// Set the address execution starts at.
    pub fn set_start_addr(&mut self, addr: u32) {
        self.pc = addr;
    }

    /// Current program counter.
    pub fn pc(&self) -> u32 {
        self.pc
    }

    /// Read a general register.
    pub fn reg(&self, index: usize) -> u32 {
        self.regs[index]
    }

    /// Execute one instruction.
    ///
    /// The PC advances by 4 unless the instruction itself redirected it.
    pub fn step(&mut self, space: &mut AddressSpace) -> StepOutcome {
        if !space.is_range_mapped(u64::from(self.pc), 4) {
            return StepOutcome::Fault(FaultKind::UnmappedFetch { pc: self.pc });
        }

        let inst = self.read32(space, self.pc);
        let old_pc = self.pc;
        let outcome = self.execute(space, inst);
        if self.pc == old_pc {
            self.pc = self.pc.wrapping_add(4);
        }
        outcome
    }

    /// The trapping syscall's frame: number in `a7`, arguments in
    /// `a0..a5`.
    pub fn syscall_frame(&self) -> SyscallFrame {
        SyscallFrame {
            number: self.regs[17],
            args: [
                self.regs[10],
                self.regs[11],
                self.regs[12],
                self.regs[13],
                self.regs[14],
                self.regs[15],
            ],
        }
    }

    /// Install a serviced syscall's result in `a0`.
    pub fn set_syscall_ret(&mut self, value: u32) {
        self.regs[10] = value;
    }

    /// Register write with the `x0` hard-wire: writes to register zero
    /// are discarded, so `x0 == 0` after every instruction.
    fn set_reg(&mut self, index: usize, value: u32) {
        if index != 0 {
            self.regs[index] = value;
        }
    }

    fn read8(&mut self, space: &mut AddressSpace, addr: u32) -> u8 {
        let mut bytes = [0u8; 1];
        space.memcpy_out(&mut bytes, u64::from(addr));
        bytes[0]
    }

    fn read16(&mut self, space: &mut AddressSpace, addr: u32) -> u16 {
        let mut bytes = [0u8; 2];
        space.memcpy_out(&mut bytes, u64::from(addr));
        u16::from_le_bytes(bytes)
    }

    fn read32(&mut self, space: &mut AddressSpace, addr: u32) -> u32 {
        let mut bytes = [0u8; 4];
        space.memcpy_out(&mut bytes, u64::from(addr));
        u32::from_le_bytes(bytes)
    }

    fn write8(&mut self, space: &mut AddressSpace, addr: u32, value: u8) -> Result<()> {
        space.memcpy_in(u64::from(addr), &[value])
    }

    fn write16(&mut self, space: &mut AddressSpace, addr: u32, value: u16) -> Result<()> {
        space.memcpy_in(u64::from(addr), &value.to_le_bytes())
    }

    fn write32(&mut self, space: &mut AddressSpace, addr: u32, value: u32) -> Result<()> {
        space.memcpy_in(u64::from(addr), &value.to_le_bytes())
    }

    fn execute(&mut self, space: &mut AddressSpace, inst: u32) -> StepOutcome {
        let rd = rd(inst);
        let rs1 = rs1(inst);
        let rs2 = rs2(inst);

        match opcode(inst) {
            op::LUI => {
                self.set_reg(rd, imm_u(inst));
                StepOutcome::Continue
            }
            op::AUIPC => {
                self.set_reg(rd, self.pc.wrapping_add(imm_u(inst)));
                StepOutcome::Continue
            }
            op::JAL => {
                self.set_reg(rd, self.pc.wrapping_add(4));
                self.pc = self.pc.wrapping_add(imm_j(inst));
                StepOutcome::Continue
            }
            op::JALR => {
                // Link the address of the instruction after this one,
                // then jump. rd may alias rs1, so the target is computed
                // first.
                let target = self.regs[rs1].wrapping_add(imm_i(inst)) & !1;
                let link = self.pc.wrapping_add(4);
                self.pc = target;
                self.set_reg(rd, link);
                StepOutcome::Continue
            }
            op::BRANCH => {
                let taken = match funct3(inst) {
                    0b000 => self.regs[rs1] == self.regs[rs2],
                    0b001 => self.regs[rs1] != self.regs[rs2],
                    0b100 => (self.regs[rs1] as i32) < (self.regs[rs2] as i32),
                    0b101 => (self.regs[rs1] as i32) >= (self.regs[rs2] as i32),
                    0b110 => self.regs[rs1] < self.regs[rs2],
                    0b111 => self.regs[rs1] >= self.regs[rs2],
                    _ => {
                        return StepOutcome::Fault(FaultKind::IllegalInstruction {
                            pc: self.pc,
                            inst,
                        })
                    }
                };
                if taken {
                    self.pc = self.pc.wrapping_add(imm_b(inst));
                }
                StepOutcome::Continue
            }
            op::LOAD => {
                let addr = self.regs[rs1].wrapping_add(imm_i(inst));
                let value = match funct3(inst) {
                    0b000 => sign_extend(u32::from(self.read8(space, addr)), 8),
                    0b001 => sign_extend(u32::from(self.read16(space, addr)), 16),
                    0b010 => self.read32(space, addr),
                    0b100 => u32::from(self.read8(space, addr)),
                    0b101 => u32::from(self.read16(space, addr)),
                    _ => {
                        return StepOutcome::Fault(FaultKind::IllegalInstruction {
                            pc: self.pc,
                            inst,
                        })
                    }
                };
                self.set_reg(rd, value);
                StepOutcome::Continue
            }
            op::STORE => {
                let addr = self.regs[rs1].wrapping_add(imm_s(inst));
                let stored = match funct3(inst) {
                    0b000 => self.write8(space, addr, self.regs[rs2] as u8),
                    0b001 => self.write16(space, addr, self.regs[rs2] as u16),
                    0b010 => self.write32(space, addr, self.regs[rs2]),
                    _ => {
                        return StepOutcome::Fault(FaultKind::IllegalInstruction {
                            pc: self.pc,
                            inst,
                        })
                    }
                };
                match stored {
                    Ok(()) => StepOutcome::Continue,
                    Err(err) => {
                        warn!("store at {:#010x} failed: {}", addr, err);
                        StepOutcome::Fault(FaultKind::StoreFailed { addr })
                    }
                }
            }
            op::OP_IMM => {
                let imm = imm_i(inst);
                let value = match funct3(inst) {
                    0b000 => self.regs[rs1].wrapping_add(imm),
                    0b010 => u32::from((self.regs[rs1] as i32) < (imm as i32)),
                    0b011 => u32::from(self.regs[rs1] < imm),
                    0b100 => self.regs[rs1] ^ imm,
                    0b110 => self.regs[rs1] | imm,
                    0b111 => self.regs[rs1] & imm,
                    0b001 => self.regs[rs1] << (imm & 0x1F),
                    0b101 => {
                        if funct7(inst) & 0x20 != 0 {
                            ((self.regs[rs1] as i32) >> (imm & 0x1F)) as u32
                        } else {
                            self.regs[rs1] >> (imm & 0x1F)
                        }
                    }
                    _ => unreachable!("funct3 is three bits"),
                };
                self.set_reg(rd, value);
                StepOutcome::Continue
            }
            op::OP => {
                let value = match funct3(inst) {
                    0b000 => {
                        if funct7(inst) & 0x20 != 0 {
                            self.regs[rs1].wrapping_sub(self.regs[rs2])
                        } else {
                            self.regs[rs1].wrapping_add(self.regs[rs2])
                        }
                    }
                    0b001 => self.regs[rs1] << (self.regs[rs2] & 0x1F),
                    0b010 => u32::from((self.regs[rs1] as i32) < (self.regs[rs2] as i32)),
                    0b011 => u32::from(self.regs[rs1] < self.regs[rs2]),
                    0b100 => self.regs[rs1] ^ self.regs[rs2],
                    0b101 => {
                        if funct7(inst) & 0x20 != 0 {
                            ((self.regs[rs1] as i32) >> (self.regs[rs2] & 0x1F)) as u32
                        } else {
                            self.regs[rs1] >> (self.regs[rs2] & 0x1F)
                        }
                    }
                    0b110 => self.regs[rs1] | self.regs[rs2],
                    0b111 => self.regs[rs1] & self.regs[rs2],
                    _ => unreachable!("funct3 is three bits"),
                };
                self.set_reg(rd, value);
                StepOutcome::Continue
            }
            // Fences are no-ops for a single in-order hart.
            op::MISC_MEM => StepOutcome::Continue,
            // ECALL, EBREAK and the CSR space all surface as a trap; the
            // host decides what to do with a7.
            op::SYSTEM => StepOutcome::Trap,
            _ => StepOutcome::Fault(FaultKind::IllegalInstruction {
                pc: self.pc,
                inst,
            }),
        }
    }
}
