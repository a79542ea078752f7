//! Bit-field extraction for the six RISC-V instruction formats.
//!
//! Each format is a plain struct built from a raw 32-bit instruction word
//! via `From<u32>`. Immediates come out sign-extended; register fields are
//! 5-bit and therefore always name a valid architectural register.

use crate::emulator::Reg;

/// Rtype encoding variant.
pub struct Rtype {
    pub funct7: u32,
    pub rs2: Reg,
    pub rs1: Reg,
    pub funct3: u32,
    pub rd: Reg,
}

impl From<u32> for Rtype {
    fn from(inst: u32) -> Rtype {
        let funct7 = (inst >> 25) & 0b111_1111;
        let rs2 = (inst >> 20) & 0b1_1111;
        let rs1 = (inst >> 15) & 0b1_1111;
        let funct3 = (inst >> 12) & 0b111;
        let rd = (inst >> 7) & 0b1_1111;

        Rtype {
            funct7,
            rs2: Reg(rs2),
            rs1: Reg(rs1),
            funct3,
            rd: Reg(rd),
        }
    }
}

/// Itype encoding variant.
pub struct Itype {
    pub imm: i32,
    pub rs1: Reg,
    pub funct3: u32,
    pub rd: Reg,
}

impl From<u32> for Itype {
    fn from(inst: u32) -> Itype {
        let imm110 = (inst >> 20) & 0b1111_1111_1111;
        let rs1 = (inst >> 15) & 0b1_1111;
        let funct3 = (inst >> 12) & 0b111;
        let rd = (inst >> 7) & 0b1_1111;

        let imm = ((imm110 as i32) << 20) >> 20;

        Itype {
            imm,
            rs1: Reg(rs1),
            funct3,
            rd: Reg(rd),
        }
    }
}

/// Stype encoding variant.
pub struct Stype {
    pub imm: i32,
    pub rs2: Reg,
    pub rs1: Reg,
    pub funct3: u32,
}

impl From<u32> for Stype {
    fn from(inst: u32) -> Stype {
        let imm115 = (inst >> 25) & 0b111_1111;
        let rs2 = (inst >> 20) & 0b1_1111;
        let rs1 = (inst >> 15) & 0b1_1111;
        let funct3 = (inst >> 12) & 0b111;
        let imm40 = (inst >> 7) & 0b1_1111;

        let imm = ((((imm115 << 5) | imm40) as i32) << 20) >> 20;

        Stype {
            imm,
            rs2: Reg(rs2),
            rs1: Reg(rs1),
            funct3,
        }
    }
}

/// Btype encoding variant. The immediate is a multiple of two.
pub struct Btype {
    pub imm: i32,
    pub rs2: Reg,
    pub rs1: Reg,
    pub funct3: u32,
}

impl From<u32> for Btype {
    fn from(inst: u32) -> Btype {
        let imm12 = (inst >> 31) & 0b1;
        let imm105 = (inst >> 25) & 0b11_1111;
        let rs2 = (inst >> 20) & 0b1_1111;
        let rs1 = (inst >> 15) & 0b1_1111;
        let funct3 = (inst >> 12) & 0b111;
        let imm41 = (inst >> 8) & 0b1111;
        let imm11 = (inst >> 7) & 0b1;

        let imm = (imm12 << 12) | (imm11 << 11) | (imm105 << 5) | (imm41 << 1);
        let imm = ((imm as i32) << 19) >> 19;

        Btype {
            imm,
            rs2: Reg(rs2),
            rs1: Reg(rs1),
            funct3,
        }
    }
}

/// Utype encoding variant. The immediate occupies bits 31..12.
pub struct Utype {
    pub imm: i32,
    pub rd: Reg,
}

impl From<u32> for Utype {
    fn from(inst: u32) -> Utype {
        let imm3112 = (inst >> 12) & 0b1111_1111_1111_1111_1111;
        let rd = (inst >> 7) & 0b1_1111;

        let imm = (imm3112 as i32) << 12;

        Utype { imm, rd: Reg(rd) }
    }
}

/// Jtype encoding variant. The immediate is a multiple of two.
pub struct Jtype {
    pub imm: i32,
    pub rd: Reg,
}

impl From<u32> for Jtype {
    fn from(inst: u32) -> Jtype {
        let imm20 = (inst >> 31) & 0b1;
        let imm101 = (inst >> 21) & 0b11_1111_1111;
        let imm11 = (inst >> 20) & 0b1;
        let imm1912 = (inst >> 12) & 0b1111_1111;
        let rd = (inst >> 7) & 0b1_1111;

        let imm =
            (imm20 << 20) | (imm1912 << 12) | (imm11 << 11) | (imm101 << 1);
        let imm = ((imm as i32) << 11) >> 11;

        Jtype { imm, rd: Reg(rd) }
    }
}
