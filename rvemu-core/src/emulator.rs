//! RISC-V emulator supporting the RV64I base integer instruction set.
//! Little-endian only. A pristine emulator can be forked into many
//! derived instances and each of those reset to the parent's state using
//! the MMU's dirty tracking.

use std::fmt;
use std::io;
use std::ops::Deref;

use log::trace;
use thiserror::Error;

use crate::decode::{Btype, Itype, Jtype, Rtype, Stype, Utype};
use crate::mmu::{self, Mmu, Perm, VirtAddr, PERM_EXEC};
use crate::syscall::System;

/// ECALL instruction word.
const INST_ECALL: u32 = 0x0000_0073;

/// EBREAK instruction word.
const INST_EBREAK: u32 = 0x0010_0073;

/// Emulator's exit reason.
#[derive(Debug, Error)]
pub enum VmExit {
    /// The guest terminated normally via `exit`/`exit_group`.
    #[error("exited with status {0}")]
    Exit(u64),

    /// The guest executed EBREAK.
    #[error("ebreak at {pc:#x}")]
    Ebreak { pc: u64 },

    /// The guest executed FENCE while the emulator is configured to halt
    /// on it.
    #[error("fence at {pc:#x}")]
    Fence { pc: u64 },

    /// Unsupported opcode, or a SYSTEM encoding other than ECALL/EBREAK.
    #[error("unknown opcode {opcode:#09b} at {pc:#x}")]
    UnknownOpcode { opcode: u8, pc: u64 },

    /// ECALL with a syscall number that has no handler.
    #[error("unimplemented syscall {num} args={args:x?}")]
    SyscallUnimplemented { num: u64, args: [u64; 6] },

    /// The program counter is not 4-byte aligned.
    #[error("misaligned pc {pc:#x}")]
    AddressMisaligned { pc: u64 },

    /// Register index outside the register file.
    #[error("invalid register")]
    InvalidRegister,

    /// A memory operation faulted.
    #[error("memory fault: {0}")]
    MmuFault(#[from] mmu::Error),

    /// A syscall handler failed on the host side.
    #[error("host I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Structured exit record surfaced to the host: the cause together with a
/// snapshot of the register file and the opcode being executed.
#[derive(Debug)]
pub struct EmuExit {
    pub cause: VmExit,
    pub regs: [u64; 33],
    pub opcode: u8,
}

const REG_STR: [&str; 33] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1",
    "a2", "a3", "a4", "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7",
    "s8", "s9", "s10", "s11", "t3", "t4", "t5", "t6", "pc",
];

impl fmt::Display for EmuExit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "registers:")?;
        for (i, reg_val) in self.regs.iter().enumerate() {
            write!(f, "  {:>4}: {:#018x}", REG_STR[i], reg_val)?;
            if (i + 1) % 4 == 0 {
                writeln!(f)?;
            }
        }
        writeln!(f)?;
        write!(f, "cause: {} (opcode {:#09b})", self.cause, self.opcode)
    }
}

/// A CPU register.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Reg(pub u32);

impl Deref for Reg {
    type Target = u32;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Alternative name for CPU registers.
///
/// `Reg` implements `From<RegAlias>`, so every function taking `R: Into<Reg>`
/// accepts an alias directly.
pub enum RegAlias {
    Zero = 0,
    Ra,
    Sp,
    Gp,
    Tp,
    T0,
    T1,
    T2,
    S0,
    S1,
    A0,
    A1,
    A2,
    A3,
    A4,
    A5,
    A6,
    A7,
    S2,
    S3,
    S4,
    S5,
    S6,
    S7,
    S8,
    S9,
    S10,
    S11,
    T3,
    T4,
    T5,
    T6,
    Pc,
}

impl From<RegAlias> for Reg {
    fn from(alias: RegAlias) -> Reg {
        Reg(alias as u32)
    }
}

/// RISC-V emulator.
pub struct Emulator {
    /// State of the registers.
    regs: [u64; 33],

    /// MMU used by the emulator for memory operations.
    pub mmu: Mmu,

    /// Whether FENCE terminates execution instead of being a no-op.
    fence_halt: bool,

    /// Low 7 bits of the last fetched instruction, kept for exit records.
    last_opcode: u8,

    /// Number of instructions executed since creation or reset.
    inst_execed: u64,
}

impl Emulator {
    /// Returns a new emulator with `mem_size` bytes of guest memory.
    pub fn new(mem_size: usize) -> Emulator {
        Emulator {
            regs: [0; 33],
            mmu: Mmu::new(mem_size),
            fence_halt: false,
            last_opcode: 0,
            inst_execed: 0,
        }
    }

    /// Configures whether FENCE terminates execution with
    /// `VmExit::Fence`. The default is to treat it as a no-op.
    pub fn set_fence_halt(&mut self, fence_halt: bool) {
        self.fence_halt = fence_halt;
    }

    /// Returns the number of instructions executed since creation or the
    /// last reset.
    pub fn inst_execed(&self) -> u64 {
        self.inst_execed
    }

    /// Returns a copy of the emulator, including its internal state. The
    /// copy's memory is marked entirely clean.
    pub fn fork(&self) -> Emulator {
        Emulator {
            regs: self.regs,
            mmu: self.mmu.fork(),
            fence_halt: self.fence_halt,
            last_opcode: 0,
            inst_execed: 0,
        }
    }

    /// Resets the internal state of the emulator to the given state
    /// `other`.
    pub fn reset(&mut self, other: &Emulator) {
        self.regs = other.regs;
        self.mmu.reset(&other.mmu);
        self.last_opcode = 0;
        self.inst_execed = 0;
    }

    /// Sets the value of the register `reg` to `val`. Writes to `zero`
    /// are silently discarded.
    pub fn set_reg<R: Into<Reg>>(
        &mut self,
        reg: R,
        val: u64,
    ) -> Result<(), VmExit> {
        let reg = *reg.into() as usize;

        if reg >= self.regs.len() {
            return Err(VmExit::InvalidRegister);
        }

        if reg != RegAlias::Zero as usize {
            self.regs[reg] = val;
        }
        Ok(())
    }

    /// Returns the value stored in the register `reg`. `zero` always
    /// reads as 0.
    pub fn reg<R: Into<Reg>>(&self, reg: R) -> Result<u64, VmExit> {
        let reg = *reg.into() as usize;

        if reg >= self.regs.len() {
            return Err(VmExit::InvalidRegister);
        }

        if reg == RegAlias::Zero as usize {
            Ok(0)
        } else {
            Ok(self.regs[reg])
        }
    }

    /// Returns a snapshot of the register file.
    pub fn regs(&self) -> [u64; 33] {
        self.regs
    }

    /// Run until the guest exits or traps. Implemented syscalls are
    /// serviced through `sys` without leaving the loop.
    pub fn run(&mut self, sys: &mut System) -> EmuExit {
        loop {
            if let Err(cause) = self.step(sys) {
                return EmuExit {
                    cause,
                    regs: self.regs,
                    opcode: self.last_opcode,
                };
            }
        }
    }

    /// Fetch, decode and execute a single instruction.
    fn step(&mut self, sys: &mut System) -> Result<(), VmExit> {
        let pc = self.reg(RegAlias::Pc)?;

        self.last_opcode = 0;

        if pc & 3 != 0 {
            return Err(VmExit::AddressMisaligned { pc });
        }

        let inst = self
            .mmu
            .read_int_perms::<u32>(VirtAddr(pc as usize), Perm(PERM_EXEC))?;

        self.last_opcode = (inst & 0b111_1111) as u8;

        trace!(
            "pc={:#010x} inst={:08x} opcode={:#09b}",
            pc,
            inst,
            self.last_opcode
        );

        self.inst_execed += 1;
        self.emulate_instruction(pc, inst, sys)
    }

    /// Emulates a single instruction, updating the internal state of the
    /// emulator. The program counter advances by four unless the
    /// instruction assigned it.
    fn emulate_instruction(
        &mut self,
        pc: u64,
        inst: u32,
        sys: &mut System,
    ) -> Result<(), VmExit> {
        let opcode = inst & 0b111_1111;

        match opcode {
            0b0110111 => {
                // LUI
                let dec = Utype::from(inst);

                self.set_reg(dec.rd, dec.imm as u64)?;
            }
            0b0010111 => {
                // AUIPC
                let dec = Utype::from(inst);

                self.set_reg(dec.rd, pc.wrapping_add(dec.imm as u64))?;
            }
            0b1101111 => {
                // JAL
                let dec = Jtype::from(inst);

                let offset = dec.imm as u64;

                self.set_reg(dec.rd, pc.wrapping_add(4))?;
                self.set_reg(RegAlias::Pc, pc.wrapping_add(offset))?;
                return Ok(());
            }
            0b1100111 => {
                let dec = Itype::from(inst);

                let offset = dec.imm as u64;
                let rs1 = self.reg(dec.rs1)?;

                match dec.funct3 {
                    0b000 => {
                        // JALR clears the low bit of the computed target.
                        let target = rs1.wrapping_add(offset) & !1;

                        self.set_reg(dec.rd, pc.wrapping_add(4))?;
                        self.set_reg(RegAlias::Pc, target)?;
                        return Ok(());
                    }
                    _ => return Err(self.unknown_opcode(pc, inst)),
                }
            }
            0b1100011 => {
                let dec = Btype::from(inst);

                let target = pc.wrapping_add(dec.imm as u64);
                let rs1 = self.reg(dec.rs1)?;
                let rs2 = self.reg(dec.rs2)?;

                let taken = match dec.funct3 {
                    0b000 => rs1 == rs2,                       // BEQ
                    0b001 => rs1 != rs2,                       // BNE
                    0b100 => (rs1 as i64) < (rs2 as i64),      // BLT
                    0b101 => (rs1 as i64) >= (rs2 as i64),     // BGE
                    0b110 => rs1 < rs2,                        // BLTU
                    0b111 => rs1 >= rs2,                       // BGEU
                    _ => return Err(self.unknown_opcode(pc, inst)),
                };

                if taken {
                    self.set_reg(RegAlias::Pc, target)?;
                    return Ok(());
                }
            }
            0b0000011 => {
                let dec = Itype::from(inst);

                let rs1 = self.reg(dec.rs1)?;
                let vaddr = rs1.wrapping_add(dec.imm as u64);

                let vaddr = VirtAddr(vaddr as usize);

                match dec.funct3 {
                    0b000 => {
                        // LB
                        let value = self.mmu.read_int::<i8>(vaddr)?;
                        self.set_reg(dec.rd, value as u64)?;
                    }
                    0b001 => {
                        // LH
                        let value = self.mmu.read_int::<i16>(vaddr)?;
                        self.set_reg(dec.rd, value as u64)?;
                    }
                    0b010 => {
                        // LW
                        let value = self.mmu.read_int::<i32>(vaddr)?;
                        self.set_reg(dec.rd, value as u64)?;
                    }
                    0b011 => {
                        // LD
                        let value = self.mmu.read_int::<u64>(vaddr)?;
                        self.set_reg(dec.rd, value)?;
                    }
                    0b100 => {
                        // LBU
                        let value = self.mmu.read_int::<u8>(vaddr)?;
                        self.set_reg(dec.rd, value as u64)?;
                    }
                    0b101 => {
                        // LHU
                        let value = self.mmu.read_int::<u16>(vaddr)?;
                        self.set_reg(dec.rd, value as u64)?;
                    }
                    0b110 => {
                        // LWU
                        let value = self.mmu.read_int::<u32>(vaddr)?;
                        self.set_reg(dec.rd, value as u64)?;
                    }
                    _ => return Err(self.unknown_opcode(pc, inst)),
                }
            }
            0b0100011 => {
                let dec = Stype::from(inst);

                let rs1 = self.reg(dec.rs1)?;
                let rs2 = self.reg(dec.rs2)?;
                let vaddr = rs1.wrapping_add(dec.imm as u64);

                let vaddr = VirtAddr(vaddr as usize);

                match dec.funct3 {
                    0b000 => self.mmu.write_int::<u8>(vaddr, rs2 as u8)?,
                    0b001 => self.mmu.write_int::<u16>(vaddr, rs2 as u16)?,
                    0b010 => self.mmu.write_int::<u32>(vaddr, rs2 as u32)?,
                    0b011 => self.mmu.write_int::<u64>(vaddr, rs2)?,
                    _ => return Err(self.unknown_opcode(pc, inst)),
                }
            }
            0b0010011 => {
                let dec = Itype::from(inst);

                let imm = dec.imm as u64;
                let rs1 = self.reg(dec.rs1)?;

                match dec.funct3 {
                    0b000 => {
                        // ADDI
                        self.set_reg(dec.rd, rs1.wrapping_add(imm))?;
                    }
                    0b010 => {
                        // SLTI
                        let value = ((rs1 as i64) < (imm as i64)) as u64;
                        self.set_reg(dec.rd, value)?;
                    }
                    0b011 => {
                        // SLTIU
                        self.set_reg(dec.rd, (rs1 < imm) as u64)?;
                    }
                    0b100 => {
                        // XORI
                        self.set_reg(dec.rd, rs1 ^ imm)?;
                    }
                    0b110 => {
                        // ORI
                        self.set_reg(dec.rd, rs1 | imm)?;
                    }
                    0b111 => {
                        // ANDI
                        self.set_reg(dec.rd, rs1 & imm)?;
                    }
                    0b001 => {
                        // The shift amount takes the low 6 bits of the
                        // immediate; the rest must be zero.
                        match dec.imm as u32 >> 6 {
                            0b000000 => {
                                // SLLI
                                let shamt = dec.imm & 0b11_1111;
                                self.set_reg(dec.rd, rs1 << shamt)?;
                            }
                            _ => return Err(self.unknown_opcode(pc, inst)),
                        }
                    }
                    0b101 => {
                        match dec.imm as u32 >> 6 {
                            0b000000 => {
                                // SRLI
                                let shamt = dec.imm & 0b11_1111;
                                self.set_reg(dec.rd, rs1 >> shamt)?;
                            }
                            0b010000 => {
                                // SRAI
                                let shamt = dec.imm & 0b11_1111;
                                let value = ((rs1 as i64) >> shamt) as u64;
                                self.set_reg(dec.rd, value)?;
                            }
                            _ => return Err(self.unknown_opcode(pc, inst)),
                        }
                    }
                    _ => return Err(self.unknown_opcode(pc, inst)),
                }
            }
            0b0110011 => {
                let dec = Rtype::from(inst);

                let rs1 = self.reg(dec.rs1)?;
                let rs2 = self.reg(dec.rs2)?;

                let value = match (dec.funct3, dec.funct7) {
                    (0b000, 0b0000000) => rs1.wrapping_add(rs2), // ADD
                    (0b000, 0b0100000) => rs1.wrapping_sub(rs2), // SUB
                    (0b001, 0b0000000) => rs1 << (rs2 & 0b11_1111), // SLL
                    (0b010, 0b0000000) => {
                        // SLT
                        ((rs1 as i64) < (rs2 as i64)) as u64
                    }
                    (0b011, 0b0000000) => (rs1 < rs2) as u64, // SLTU
                    (0b100, 0b0000000) => rs1 ^ rs2,          // XOR
                    (0b101, 0b0000000) => rs1 >> (rs2 & 0b11_1111), // SRL
                    (0b101, 0b0100000) => {
                        // SRA
                        ((rs1 as i64) >> (rs2 & 0b11_1111)) as u64
                    }
                    (0b110, 0b0000000) => rs1 | rs2, // OR
                    (0b111, 0b0000000) => rs1 & rs2, // AND
                    _ => return Err(self.unknown_opcode(pc, inst)),
                };

                self.set_reg(dec.rd, value)?;
            }
            0b0011011 => {
                let dec = Itype::from(inst);

                let imm = dec.imm as u32;
                let rs1 = self.reg(dec.rs1)? as u32;

                // 32-bit operations sign-extend their 32-bit result.
                match dec.funct3 {
                    0b000 => {
                        // ADDIW
                        let value = rs1.wrapping_add(imm) as i32 as u64;
                        self.set_reg(dec.rd, value)?;
                    }
                    0b001 => {
                        match (dec.imm as u32 >> 5) & 0b111_1111 {
                            0b0000000 => {
                                // SLLIW
                                let shamt = dec.imm & 0b1_1111;
                                let value = (rs1 << shamt) as i32 as u64;
                                self.set_reg(dec.rd, value)?;
                            }
                            _ => return Err(self.unknown_opcode(pc, inst)),
                        }
                    }
                    0b101 => {
                        match (dec.imm as u32 >> 5) & 0b111_1111 {
                            0b0000000 => {
                                // SRLIW
                                let shamt = dec.imm & 0b1_1111;
                                let value = (rs1 >> shamt) as i32 as u64;
                                self.set_reg(dec.rd, value)?;
                            }
                            0b0100000 => {
                                // SRAIW
                                let shamt = dec.imm & 0b1_1111;
                                let value =
                                    ((rs1 as i32) >> shamt) as i64 as u64;
                                self.set_reg(dec.rd, value)?;
                            }
                            _ => return Err(self.unknown_opcode(pc, inst)),
                        }
                    }
                    _ => return Err(self.unknown_opcode(pc, inst)),
                }
            }
            0b0111011 => {
                let dec = Rtype::from(inst);

                let rs1 = self.reg(dec.rs1)? as u32;
                let rs2 = self.reg(dec.rs2)? as u32;

                let value = match (dec.funct3, dec.funct7) {
                    (0b000, 0b0000000) => {
                        // ADDW
                        rs1.wrapping_add(rs2) as i32 as u64
                    }
                    (0b000, 0b0100000) => {
                        // SUBW
                        rs1.wrapping_sub(rs2) as i32 as u64
                    }
                    (0b001, 0b0000000) => {
                        // SLLW
                        (rs1 << (rs2 & 0b1_1111)) as i32 as u64
                    }
                    (0b101, 0b0000000) => {
                        // SRLW
                        (rs1 >> (rs2 & 0b1_1111)) as i32 as u64
                    }
                    (0b101, 0b0100000) => {
                        // SRAW
                        ((rs1 as i32) >> (rs2 & 0b1_1111)) as i64 as u64
                    }
                    _ => return Err(self.unknown_opcode(pc, inst)),
                };

                self.set_reg(dec.rd, value)?;
            }
            0b0001111 => {
                // FENCE: memory is sequentially consistent within a
                // single instance, so ordering is a no-op unless the host
                // asked for explicit visibility.
                if self.fence_halt {
                    return Err(VmExit::Fence { pc });
                }
            }
            0b1110011 => match inst {
                INST_ECALL => sys.syscall(self)?,
                INST_EBREAK => return Err(VmExit::Ebreak { pc }),
                _ => return Err(self.unknown_opcode(pc, inst)),
            },
            _ => return Err(self.unknown_opcode(pc, inst)),
        }

        self.set_reg(RegAlias::Pc, pc.wrapping_add(4))?;

        Ok(())
    }

    fn unknown_opcode(&self, pc: u64, inst: u32) -> VmExit {
        VmExit::UnknownOpcode {
            opcode: (inst & 0b111_1111) as u8,
            pc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::decode::encode;
    use crate::mmu::{PERM_READ, PERM_WRITE};

    const CODE_BASE: u64 = 0x1000;
    const DATA_BASE: u64 = 0x4000;

    const OP: u32 = 0b0110011;
    const OP_IMM: u32 = 0b0010011;
    const OP_IMM_32: u32 = 0b0011011;
    const OP_32: u32 = 0b0111011;
    const LOAD: u32 = 0b0000011;
    const STORE: u32 = 0b0100011;
    const BRANCH: u32 = 0b1100011;

    /// Builds an emulator with `code` mapped executable at `CODE_BASE`, a
    /// small RW data region at `DATA_BASE` and the PC at the first
    /// instruction.
    fn emu_with_code(code: &[u32]) -> Emulator {
        let mut emu = Emulator::new(1024 * 1024);

        let base = VirtAddr(CODE_BASE as usize);
        let size = code.len() * 4;

        emu.mmu.set_perms(base, size, Perm(PERM_WRITE)).unwrap();
        for (i, inst) in code.iter().enumerate() {
            emu.mmu
                .write_int::<u32>(VirtAddr(*base + i * 4), *inst)
                .unwrap();
        }
        emu.mmu.set_perms(base, size, Perm(PERM_EXEC)).unwrap();

        emu.mmu
            .set_perms(
                VirtAddr(DATA_BASE as usize),
                0x100,
                Perm(PERM_READ | PERM_WRITE),
            )
            .unwrap();

        emu.set_reg(RegAlias::Pc, CODE_BASE).unwrap();
        emu
    }

    fn run_until_ebreak(emu: &mut Emulator) {
        let exit = emu.run(&mut System::new());
        match exit.cause {
            VmExit::Ebreak { .. } => {}
            cause => panic!("unexpected exit: {}", cause),
        }
    }

    #[test]
    fn zero_register_is_immutable() {
        let mut emu = Emulator::new(1024 * 1024);

        emu.set_reg(RegAlias::Zero, 0xdead).unwrap();
        assert_eq!(emu.reg(RegAlias::Zero).unwrap(), 0);
    }

    #[test]
    fn invalid_register_index() {
        let emu = Emulator::new(1024 * 1024);

        match emu.reg(Reg(33)) {
            Err(VmExit::InvalidRegister) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn addi_add() {
        // addi t0, zero, 7; addi t1, zero, 35; add t2, t0, t1; ebreak
        let mut emu = emu_with_code(&[
            encode::itype(OP_IMM, 0b000, 5, 0, 7),
            encode::itype(OP_IMM, 0b000, 6, 0, 35),
            encode::rtype(OP, 0b000, 0b0000000, 7, 5, 6),
            INST_EBREAK,
        ]);

        run_until_ebreak(&mut emu);

        assert_eq!(emu.reg(RegAlias::T0).unwrap(), 7);
        assert_eq!(emu.reg(RegAlias::T1).unwrap(), 35);
        assert_eq!(emu.reg(RegAlias::T2).unwrap(), 42);
    }

    #[test]
    fn add_wraps() {
        // addi t0, zero, -1; addi t1, zero, 2; add t2, t0, t1; ebreak
        let mut emu = emu_with_code(&[
            encode::itype(OP_IMM, 0b000, 5, 0, -1),
            encode::itype(OP_IMM, 0b000, 6, 0, 2),
            encode::rtype(OP, 0b000, 0b0000000, 7, 5, 6),
            INST_EBREAK,
        ]);

        run_until_ebreak(&mut emu);

        assert_eq!(emu.reg(RegAlias::T2).unwrap(), 1);
    }

    #[test]
    fn branch_signed_vs_unsigned() {
        // addi t0, zero, -1
        // addi t1, zero, 1
        // bltu t0, t1, +8
        // addi t2, zero, 1
        // ebreak
        // addi t2, zero, 2
        // ebreak
        //
        // -1 as unsigned is the largest value, so BLTU falls through.
        let mut emu = emu_with_code(&[
            encode::itype(OP_IMM, 0b000, 5, 0, -1),
            encode::itype(OP_IMM, 0b000, 6, 0, 1),
            encode::btype(BRANCH, 0b110, 5, 6, 8),
            encode::itype(OP_IMM, 0b000, 7, 0, 1),
            INST_EBREAK,
            encode::itype(OP_IMM, 0b000, 7, 0, 2),
            INST_EBREAK,
        ]);

        run_until_ebreak(&mut emu);
        assert_eq!(emu.reg(RegAlias::T2).unwrap(), 1);

        // The signed comparison takes the branch into the second arm.
        let mut emu = emu_with_code(&[
            encode::itype(OP_IMM, 0b000, 5, 0, -1),
            encode::itype(OP_IMM, 0b000, 6, 0, 1),
            encode::btype(BRANCH, 0b100, 5, 6, 12),
            encode::itype(OP_IMM, 0b000, 7, 0, 1),
            INST_EBREAK,
            encode::itype(OP_IMM, 0b000, 7, 0, 2),
            INST_EBREAK,
        ]);

        run_until_ebreak(&mut emu);
        assert_eq!(emu.reg(RegAlias::T2).unwrap(), 2);
    }

    #[test]
    fn branch_eq_pairs() {
        // Equal operands: BEQ takes, BNE falls through.
        let mut emu = emu_with_code(&[
            encode::itype(OP_IMM, 0b000, 5, 0, 17),
            encode::itype(OP_IMM, 0b000, 6, 0, 17),
            encode::btype(BRANCH, 0b000, 5, 6, 8),
            INST_EBREAK,
            encode::itype(OP_IMM, 0b000, 7, 0, 1),
            INST_EBREAK,
        ]);

        run_until_ebreak(&mut emu);
        assert_eq!(emu.reg(RegAlias::T2).unwrap(), 1);

        let mut emu = emu_with_code(&[
            encode::itype(OP_IMM, 0b000, 5, 0, 17),
            encode::itype(OP_IMM, 0b000, 6, 0, 17),
            encode::btype(BRANCH, 0b001, 5, 6, 8),
            encode::itype(OP_IMM, 0b000, 7, 0, 1),
            INST_EBREAK,
            INST_EBREAK,
        ]);

        run_until_ebreak(&mut emu);
        assert_eq!(emu.reg(RegAlias::T2).unwrap(), 1);
    }

    #[test]
    fn load_store_widths() {
        // addi t0, zero, 0x7f; lui t1, %hi(DATA_BASE)
        // sb t0, 0(t1); lbu t2, 0(t1); lb t3, 0(t1); ebreak
        let code_7f = [
            encode::itype(OP_IMM, 0b000, 5, 0, 0x7f),
            encode::utype(0b0110111, 6, DATA_BASE as i32),
            encode::stype(STORE, 0b000, 6, 5, 0),
            encode::itype(LOAD, 0b100, 7, 6, 0),
            encode::itype(LOAD, 0b000, 28, 6, 0),
            INST_EBREAK,
        ];

        let mut emu = emu_with_code(&code_7f);
        run_until_ebreak(&mut emu);
        assert_eq!(emu.reg(RegAlias::T2).unwrap(), 0x7f);
        assert_eq!(emu.reg(RegAlias::T3).unwrap(), 0x7f);

        // 0xff sign-extends through LB but not LBU.
        let code_ff = [
            encode::itype(OP_IMM, 0b000, 5, 0, 0xff),
            encode::utype(0b0110111, 6, DATA_BASE as i32),
            encode::stype(STORE, 0b000, 6, 5, 0),
            encode::itype(LOAD, 0b100, 7, 6, 0),
            encode::itype(LOAD, 0b000, 28, 6, 0),
            INST_EBREAK,
        ];

        let mut emu = emu_with_code(&code_ff);
        run_until_ebreak(&mut emu);
        assert_eq!(emu.reg(RegAlias::T2).unwrap(), 0xff);
        assert_eq!(emu.reg(RegAlias::T3).unwrap(), 0xffff_ffff_ffff_ffff);
    }

    #[test]
    fn store_load_doubleword() {
        // Build a full 64-bit pattern with LUI/ADDI/SLLI and round-trip it
        // through memory.
        let mut emu = emu_with_code(&[
            encode::utype(0b0110111, 5, 0x12345 << 12),
            encode::itype(OP_IMM, 0b001, 5, 5, 32), // slli t0, t0, 32
            encode::utype(0b0110111, 6, DATA_BASE as i32),
            encode::stype(STORE, 0b011, 6, 5, 8),
            encode::itype(LOAD, 0b011, 7, 6, 8),
            INST_EBREAK,
        ]);

        run_until_ebreak(&mut emu);
        assert_eq!(emu.reg(RegAlias::T2).unwrap(), 0x1234_5000_0000_0000);
    }

    #[test]
    fn lui_sign_extends() {
        let mut emu = emu_with_code(&[
            encode::utype(0b0110111, 5, -4096),
            INST_EBREAK,
        ]);

        run_until_ebreak(&mut emu);
        assert_eq!(emu.reg(RegAlias::T0).unwrap(), 0xffff_ffff_ffff_f000);
    }

    #[test]
    fn auipc_adds_pc() {
        let mut emu = emu_with_code(&[
            encode::utype(0b0010111, 5, 0x1000),
            INST_EBREAK,
        ]);

        run_until_ebreak(&mut emu);
        assert_eq!(emu.reg(RegAlias::T0).unwrap(), CODE_BASE + 0x1000);
    }

    #[test]
    fn jal_links_and_jumps() {
        // jal ra, +8; ebreak; ebreak
        let mut emu = emu_with_code(&[
            encode::jtype(0b1101111, 1, 8),
            INST_EBREAK,
            INST_EBREAK,
        ]);

        let exit = emu.run(&mut System::new());
        match exit.cause {
            VmExit::Ebreak { pc } => assert_eq!(pc, CODE_BASE + 8),
            cause => panic!("unexpected exit: {}", cause),
        }
        assert_eq!(emu.reg(RegAlias::Ra).unwrap(), CODE_BASE + 4);
    }

    #[test]
    fn jalr_clears_low_bit() {
        // auipc t0, 0; jalr ra, 13(t0); ebreak; ebreak
        //
        // The odd target 0x100d must land on the aligned 0x100c.
        let mut emu = emu_with_code(&[
            encode::utype(0b0010111, 5, 0),
            encode::itype(0b1100111, 0b000, 1, 5, 13),
            INST_EBREAK,
            INST_EBREAK,
        ]);

        let exit = emu.run(&mut System::new());
        match exit.cause {
            VmExit::Ebreak { pc } => assert_eq!(pc, CODE_BASE + 12),
            cause => panic!("unexpected exit: {}", cause),
        }
        assert_eq!(emu.reg(RegAlias::Ra).unwrap(), CODE_BASE + 8);
    }

    #[test]
    fn slt_sltu() {
        let mut emu = emu_with_code(&[
            encode::itype(OP_IMM, 0b000, 5, 0, -1),
            encode::itype(OP_IMM, 0b000, 6, 0, 1),
            encode::rtype(OP, 0b010, 0b0000000, 7, 5, 6),  // slt
            encode::rtype(OP, 0b011, 0b0000000, 28, 5, 6), // sltu
            INST_EBREAK,
        ]);

        run_until_ebreak(&mut emu);
        assert_eq!(emu.reg(RegAlias::T2).unwrap(), 1);
        assert_eq!(emu.reg(RegAlias::T3).unwrap(), 0);
    }

    #[test]
    fn shift_64_uses_six_bits() {
        // addi t0, zero, 1; addi t1, zero, 63; sll t2, t0, t1; ebreak
        let mut emu = emu_with_code(&[
            encode::itype(OP_IMM, 0b000, 5, 0, 1),
            encode::itype(OP_IMM, 0b000, 6, 0, 63),
            encode::rtype(OP, 0b001, 0b0000000, 7, 5, 6),
            INST_EBREAK,
        ]);

        run_until_ebreak(&mut emu);
        assert_eq!(emu.reg(RegAlias::T2).unwrap(), 1 << 63);
    }

    #[test]
    fn srai_is_arithmetic() {
        // addi t0, zero, -16; srai t1, t0, 2; srli t2, t0, 2; ebreak
        let mut emu = emu_with_code(&[
            encode::itype(OP_IMM, 0b000, 5, 0, -16),
            encode::itype(OP_IMM, 0b101, 6, 5, (0b010000 << 6) | 2),
            encode::itype(OP_IMM, 0b101, 7, 5, 2),
            INST_EBREAK,
        ]);

        run_until_ebreak(&mut emu);
        assert_eq!(emu.reg(RegAlias::T1).unwrap() as i64, -4);
        assert_eq!(
            emu.reg(RegAlias::T2).unwrap(),
            0xffff_ffff_ffff_fff0u64 >> 2
        );
    }

    #[test]
    fn addiw_sign_extends() {
        // lui t0, 0x7ffff; addiw t1, t0, -1 operates in 32 bits.
        let mut emu = emu_with_code(&[
            encode::utype(0b0110111, 5, 0x7fff_f000u32 as i32),
            encode::itype(OP_IMM_32, 0b000, 6, 5, -1),
            INST_EBREAK,
        ]);

        run_until_ebreak(&mut emu);
        assert_eq!(emu.reg(RegAlias::T1).unwrap(), 0x7fff_efff);

        // addiw t1, zero, -1 yields a fully sign-extended value.
        let mut emu = emu_with_code(&[
            encode::itype(OP_IMM_32, 0b000, 6, 0, -1),
            INST_EBREAK,
        ]);

        run_until_ebreak(&mut emu);
        assert_eq!(emu.reg(RegAlias::T1).unwrap(), u64::MAX);
    }

    #[test]
    fn addw_overflow_sign_extends() {
        // lui t0, 0x7ffff; addiw t0, t0, 0x7ff -> near i32::MAX
        // addi t1, zero, 1; addw t2, t0, t1 wraps into the negatives.
        let mut emu = emu_with_code(&[
            encode::utype(0b0110111, 5, 0x7fff_f000u32 as i32),
            encode::itype(OP_IMM, 0b000, 5, 5, 0x7ff),
            encode::itype(OP_IMM, 0b000, 5, 5, 0x7ff),
            encode::itype(OP_IMM, 0b000, 5, 5, 1),
            encode::itype(OP_IMM, 0b000, 6, 0, 1),
            encode::rtype(OP_32, 0b000, 0b0000000, 7, 5, 6),
            INST_EBREAK,
        ]);

        run_until_ebreak(&mut emu);

        assert_eq!(emu.reg(RegAlias::T0).unwrap(), 0x7fff_ffff);
        assert_eq!(
            emu.reg(RegAlias::T2).unwrap(),
            0xffff_ffff_8000_0000
        );
    }

    #[test]
    fn sraw_uses_five_bits() {
        // t0 = -64 (32-bit); t1 = 34: only the low five bits of the shift
        // amount count, so this shifts by 2.
        let mut emu = emu_with_code(&[
            encode::itype(OP_IMM, 0b000, 5, 0, -64),
            encode::itype(OP_IMM, 0b000, 6, 0, 34),
            encode::rtype(OP_32, 0b101, 0b0100000, 7, 5, 6),
            INST_EBREAK,
        ]);

        run_until_ebreak(&mut emu);
        assert_eq!(emu.reg(RegAlias::T2).unwrap() as i64, -16);
    }

    #[test]
    fn fence_is_noop_by_default() {
        let mut emu = emu_with_code(&[
            0b0001111, // fence
            encode::itype(OP_IMM, 0b000, 5, 0, 3),
            INST_EBREAK,
        ]);

        run_until_ebreak(&mut emu);
        assert_eq!(emu.reg(RegAlias::T0).unwrap(), 3);
    }

    #[test]
    fn fence_halt_traps() {
        let mut emu = emu_with_code(&[0b0001111, INST_EBREAK]);
        emu.set_fence_halt(true);

        let exit = emu.run(&mut System::new());
        match exit.cause {
            VmExit::Fence { pc } => assert_eq!(pc, CODE_BASE),
            cause => panic!("unexpected exit: {}", cause),
        }
    }

    #[test]
    fn unknown_opcode_traps() {
        let mut emu = emu_with_code(&[0b1010101]);

        let exit = emu.run(&mut System::new());
        match exit.cause {
            VmExit::UnknownOpcode { opcode, pc } => {
                assert_eq!(opcode, 0b1010101);
                assert_eq!(pc, CODE_BASE);
            }
            cause => panic!("unexpected exit: {}", cause),
        }
        assert_eq!(exit.opcode, 0b1010101);
    }

    #[test]
    fn system_non_ecall_encoding_traps() {
        // A SYSTEM word that is neither ECALL nor EBREAK.
        let mut emu = emu_with_code(&[0x00200073]);

        let exit = emu.run(&mut System::new());
        match exit.cause {
            VmExit::UnknownOpcode { .. } => {}
            cause => panic!("unexpected exit: {}", cause),
        }
    }

    #[test]
    fn misaligned_pc_traps() {
        let mut emu = emu_with_code(&[INST_EBREAK]);
        emu.set_reg(RegAlias::Pc, CODE_BASE + 2).unwrap();

        let exit = emu.run(&mut System::new());
        match exit.cause {
            VmExit::AddressMisaligned { pc } => assert_eq!(pc, CODE_BASE + 2),
            cause => panic!("unexpected exit: {}", cause),
        }
    }

    #[test]
    fn fetch_requires_exec() {
        let mut emu = Emulator::new(1024 * 1024);
        emu.mmu
            .set_perms(VirtAddr(0x1000), 4, Perm(PERM_READ | PERM_WRITE))
            .unwrap();
        emu.mmu.write_int::<u32>(VirtAddr(0x1000), INST_EBREAK).unwrap();
        emu.set_reg(RegAlias::Pc, 0x1000).unwrap();

        let exit = emu.run(&mut System::new());
        match exit.cause {
            VmExit::MmuFault(mmu::Error::PermDenied { .. }) => {}
            cause => panic!("unexpected exit: {}", cause),
        }
    }

    #[test]
    fn fork_reset_registers_and_memory() {
        let parent = emu_with_code(&[
            encode::itype(OP_IMM, 0b000, 5, 0, 1),
            encode::utype(0b0110111, 6, DATA_BASE as i32),
            encode::stype(STORE, 0b000, 6, 5, 0),
            INST_EBREAK,
        ]);

        let mut child = parent.fork();
        run_until_ebreak(&mut child);

        assert_eq!(child.reg(RegAlias::T0).unwrap(), 1);
        assert_eq!(
            child.mmu.read_int::<u8>(VirtAddr(DATA_BASE as usize)).unwrap(),
            1
        );

        child.reset(&parent);

        assert_eq!(child.reg(RegAlias::T0).unwrap(), 0);
        assert_eq!(child.reg(RegAlias::Pc).unwrap(), CODE_BASE);
        assert_eq!(
            child.mmu.read_int::<u8>(VirtAddr(DATA_BASE as usize)).unwrap(),
            0
        );

        // The child replays to the same state.
        run_until_ebreak(&mut child);
        assert_eq!(child.reg(RegAlias::T0).unwrap(), 1);
    }
}
