use crate::Trap;

/// Decoded instruction forms. Registers are plain indices; `x0` semantics
/// are enforced by the register file accessors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    Lui { rd: u32, imm: i64 },
    Auipc { rd: u32, imm: i64 },
    Jal { rd: u32, imm: i64 },
    Jalr { rd: u32, rs1: u32, imm: i64 },
    Branch { rs1: u32, rs2: u32, imm: i64, funct3: u32 },
    Load { rd: u32, rs1: u32, imm: i64, funct3: u32 },
    Store { rs1: u32, rs2: u32, imm: i64, funct3: u32 },
    OpImm { rd: u32, rs1: u32, imm: i64, funct3: u32, funct7: u32 },
    Op { rd: u32, rs1: u32, rs2: u32, funct3: u32, funct7: u32 },
    OpImm32 { rd: u32, rs1: u32, imm: i64, funct3: u32, funct7: u32 },
    Op32 { rd: u32, rs1: u32, rs2: u32, funct3: u32, funct7: u32 },
    Amo { rd: u32, rs1: u32, rs2: u32, funct3: u32, funct5: u32 },
    System { rd: u32, rs1: u32, funct3: u32, imm: u32 },
    Fence,
}

pub fn decode(insn: u32) -> Result<Op, Trap> {
    let opcode = insn & 0x7F;
    let rd = (insn >> 7) & 0x1F;
    let funct3 = (insn >> 12) & 0x7;
    let rs1 = (insn >> 15) & 0x1F;
    let rs2 = (insn >> 20) & 0x1F;
    let funct7 = (insn >> 25) & 0x7F;

    let imm_i = ((insn as i32) >> 20) as i64;
    let imm_s = (((insn as i32) >> 25) << 5) as i64 | ((insn >> 7) & 0x1F) as i64;
    let imm_b = {
        let v = (((insn >> 31) & 1) << 12)
            | (((insn >> 7) & 1) << 11)
            | (((insn >> 25) & 0x3F) << 5)
            | (((insn >> 8) & 0xF) << 1);
        ((v as i32) << 19 >> 19) as i64
    };
    let imm_u = ((insn & 0xFFFF_F000) as i32) as i64;
    let imm_j = {
        let v = (((insn >> 31) & 1) << 20)
            | (((insn >> 12) & 0xFF) << 12)
            | (((insn >> 20) & 1) << 11)
            | (((insn >> 21) & 0x3FF) << 1);
        ((v as i32) << 11 >> 11) as i64
    };

    match opcode {
        0x37 => Ok(Op::Lui { rd, imm: imm_u }),
        0x17 => Ok(Op::Auipc { rd, imm: imm_u }),
        0x6F => Ok(Op::Jal { rd, imm: imm_j }),
        0x67 if funct3 == 0 => Ok(Op::Jalr { rd, rs1, imm: imm_i }),
        0x63 => Ok(Op::Branch { rs1, rs2, imm: imm_b, funct3 }),
        0x03 => Ok(Op::Load { rd, rs1, imm: imm_i, funct3 }),
        0x23 => Ok(Op::Store { rs1, rs2, imm: imm_s, funct3 }),
        0x13 => Ok(Op::OpImm { rd, rs1, imm: imm_i, funct3, funct7 }),
        0x33 => Ok(Op::Op { rd, rs1, rs2, funct3, funct7 }),
        0x1B => Ok(Op::OpImm32 { rd, rs1, imm: imm_i, funct3, funct7 }),
        0x3B => Ok(Op::Op32 { rd, rs1, rs2, funct3, funct7 }),
        0x2F => Ok(Op::Amo { rd, rs1, rs2, funct3, funct5: (insn >> 27) & 0x1F }),
        0x73 => Ok(Op::System { rd, rs1, funct3, imm: (insn >> 20) & 0xFFF }),
        0x0F => Ok(Op::Fence),
        // Floating-point opcodes exist in the state model but their compute
        // semantics live in an external soft-float library, so they are not
        // executable here.
        _ => Err(Trap::IllegalInstruction(insn as u64)),
    }
}

// -------- Compressed (C) extension expansion --------------------------------
//
// 16-bit parcels are expanded into their canonical 32-bit encodings and fed
// through `decode`, so the executor only ever sees one instruction set.

fn encode_i(imm: i32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    (((imm as u32) & 0xFFF) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

fn encode_r(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

fn encode_s(imm: i32, rs2: u32, rs1: u32, funct3: u32) -> u32 {
    let imm = (imm as u32) & 0xFFF;
    ((imm >> 5) << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | ((imm & 0x1F) << 7) | 0x23
}

fn encode_u(imm: i32, rd: u32, opcode: u32) -> u32 {
    ((imm as u32) & 0xFFFF_F000) | (rd << 7) | opcode
}

fn encode_j(imm: i32, rd: u32) -> u32 {
    let imm = imm as u32;
    (((imm >> 20) & 1) << 31)
        | (((imm >> 1) & 0x3FF) << 21)
        | (((imm >> 11) & 1) << 20)
        | (((imm >> 12) & 0xFF) << 12)
        | (rd << 7)
        | 0x6F
}

fn encode_b(imm: i32, rs2: u32, rs1: u32, funct3: u32) -> u32 {
    let imm = imm as u32;
    (((imm >> 12) & 1) << 31)
        | (((imm >> 5) & 0x3F) << 25)
        | (rs2 << 20)
        | (rs1 << 15)
        | (funct3 << 12)
        | (((imm >> 1) & 0xF) << 8)
        | (((imm >> 11) & 1) << 7)
        | 0x63
}

/// Expand a 16-bit compressed parcel to its 32-bit equivalent.
pub fn expand_compressed(half: u16) -> Result<u32, Trap> {
    let h = half as u32;
    let illegal = || Trap::IllegalInstruction(half as u64);
    let quadrant = h & 0x3;
    let funct3 = (h >> 13) & 0x7;
    // Registers in the compressed register set map to x8..x15.
    let rdp = 8 + ((h >> 2) & 0x7);
    let rs1p = 8 + ((h >> 7) & 0x7);
    let rd_full = (h >> 7) & 0x1F;
    let rs2_full = (h >> 2) & 0x1F;

    match (quadrant, funct3) {
        (0, 0) => {
            // C.ADDI4SPN: addi rd', x2, nzuimm
            let imm = (((h >> 7) & 0xF) << 6)
                | (((h >> 11) & 0x3) << 4)
                | (((h >> 5) & 1) << 3)
                | (((h >> 6) & 1) << 2);
            if imm == 0 {
                return Err(illegal());
            }
            Ok(encode_i(imm as i32, 2, 0, rdp, 0x13))
        }
        (0, 2) => {
            // C.LW
            let imm = (((h >> 10) & 0x7) << 3) | (((h >> 6) & 1) << 2) | (((h >> 5) & 1) << 6);
            Ok(encode_i(imm as i32, rs1p, 2, rdp, 0x03))
        }
        (0, 3) => {
            // C.LD
            let imm = (((h >> 10) & 0x7) << 3) | (((h >> 5) & 0x3) << 6);
            Ok(encode_i(imm as i32, rs1p, 3, rdp, 0x03))
        }
        (0, 6) => {
            // C.SW
            let imm = (((h >> 10) & 0x7) << 3) | (((h >> 6) & 1) << 2) | (((h >> 5) & 1) << 6);
            Ok(encode_s(imm as i32, rdp, rs1p, 2))
        }
        (0, 7) => {
            // C.SD
            let imm = (((h >> 10) & 0x7) << 3) | (((h >> 5) & 0x3) << 6);
            Ok(encode_s(imm as i32, rdp, rs1p, 3))
        }
        (1, 0) => {
            // C.ADDI (C.NOP when rd == 0)
            let imm = sext6((((h >> 12) & 1) << 5) | ((h >> 2) & 0x1F));
            Ok(encode_i(imm, rd_full, 0, rd_full, 0x13))
        }
        (1, 1) => {
            // C.ADDIW
            if rd_full == 0 {
                return Err(illegal());
            }
            let imm = sext6((((h >> 12) & 1) << 5) | ((h >> 2) & 0x1F));
            Ok(encode_i(imm, rd_full, 0, rd_full, 0x1B))
        }
        (1, 2) => {
            // C.LI
            let imm = sext6((((h >> 12) & 1) << 5) | ((h >> 2) & 0x1F));
            Ok(encode_i(imm, 0, 0, rd_full, 0x13))
        }
        (1, 3) => {
            if rd_full == 2 {
                // C.ADDI16SP
                let v = (((h >> 12) & 1) << 9)
                    | (((h >> 6) & 1) << 4)
                    | (((h >> 5) & 1) << 6)
                    | (((h >> 3) & 0x3) << 7)
                    | (((h >> 2) & 1) << 5);
                let imm = ((v as i32) << 22) >> 22;
                if imm == 0 {
                    return Err(illegal());
                }
                Ok(encode_i(imm, 2, 0, 2, 0x13))
            } else if rd_full != 0 {
                // C.LUI
                let v = (((h >> 12) & 1) << 17) | (((h >> 2) & 0x1F) << 12);
                let imm = ((v as i32) << 14) >> 14;
                if imm == 0 {
                    return Err(illegal());
                }
                Ok(encode_u(imm, rd_full, 0x37))
            } else {
                Err(illegal())
            }
        }
        (1, 4) => {
            let sub = (h >> 10) & 0x3;
            let shamt = (((h >> 12) & 1) << 5) | ((h >> 2) & 0x1F);
            match sub {
                0 => Ok(encode_i(shamt as i32, rs1p, 5, rs1p, 0x13)), // C.SRLI
                1 => Ok(encode_i((shamt | 0x400) as i32, rs1p, 5, rs1p, 0x13)), // C.SRAI
                2 => {
                    // C.ANDI
                    let imm = sext6(shamt);
                    Ok(encode_i(imm, rs1p, 7, rs1p, 0x13))
                }
                _ => {
                    let rs2 = rdp;
                    match (((h >> 12) & 1), (h >> 5) & 0x3) {
                        (0, 0) => Ok(encode_r(0x20, rs2, rs1p, 0, rs1p, 0x33)), // C.SUB
                        (0, 1) => Ok(encode_r(0x00, rs2, rs1p, 4, rs1p, 0x33)), // C.XOR
                        (0, 2) => Ok(encode_r(0x00, rs2, rs1p, 6, rs1p, 0x33)), // C.OR
                        (0, 3) => Ok(encode_r(0x00, rs2, rs1p, 7, rs1p, 0x33)), // C.AND
                        (1, 0) => Ok(encode_r(0x20, rs2, rs1p, 0, rs1p, 0x3B)), // C.SUBW
                        (1, 1) => Ok(encode_r(0x00, rs2, rs1p, 0, rs1p, 0x3B)), // C.ADDW
                        _ => Err(illegal()),
                    }
                }
            }
        }
        (1, 5) => {
            // C.J
            let v = (((h >> 12) & 1) << 11)
                | (((h >> 11) & 1) << 4)
                | (((h >> 9) & 0x3) << 8)
                | (((h >> 8) & 1) << 10)
                | (((h >> 7) & 1) << 6)
                | (((h >> 6) & 1) << 7)
                | (((h >> 3) & 0x7) << 1)
                | (((h >> 2) & 1) << 5);
            let imm = ((v as i32) << 20) >> 20;
            Ok(encode_j(imm, 0))
        }
        (1, 6) | (1, 7) => {
            // C.BEQZ / C.BNEZ
            let v = (((h >> 12) & 1) << 8)
                | (((h >> 10) & 0x3) << 3)
                | (((h >> 5) & 0x3) << 6)
                | (((h >> 3) & 0x3) << 1)
                | (((h >> 2) & 1) << 5);
            let imm = ((v as i32) << 23) >> 23;
            let f3 = if funct3 == 6 { 0 } else { 1 };
            Ok(encode_b(imm, 0, rs1p, f3))
        }
        (2, 0) => {
            // C.SLLI
            let shamt = (((h >> 12) & 1) << 5) | ((h >> 2) & 0x1F);
            Ok(encode_i(shamt as i32, rd_full, 1, rd_full, 0x13))
        }
        (2, 2) => {
            // C.LWSP
            if rd_full == 0 {
                return Err(illegal());
            }
            let imm = (((h >> 12) & 1) << 5) | (((h >> 4) & 0x7) << 2) | (((h >> 2) & 0x3) << 6);
            Ok(encode_i(imm as i32, 2, 2, rd_full, 0x03))
        }
        (2, 3) => {
            // C.LDSP
            if rd_full == 0 {
                return Err(illegal());
            }
            let imm = (((h >> 12) & 1) << 5) | (((h >> 5) & 0x3) << 3) | (((h >> 2) & 0x7) << 6);
            Ok(encode_i(imm as i32, 2, 3, rd_full, 0x03))
        }
        (2, 4) => {
            let bit12 = (h >> 12) & 1;
            match (bit12, rd_full, rs2_full) {
                (0, 0, _) => Err(illegal()),
                (0, rs1, 0) => Ok(encode_i(0, rs1, 0, 0, 0x67)), // C.JR
                (0, rd, rs2) => Ok(encode_r(0, rs2, 0, 0, rd, 0x33)), // C.MV
                (1, 0, 0) => Ok(0x0010_0073), // C.EBREAK
                (1, rs1, 0) => Ok(encode_i(0, rs1, 0, 1, 0x67)), // C.JALR
                (1, rd, rs2) => Ok(encode_r(0, rs2, rd, 0, rd, 0x33)), // C.ADD
                _ => Err(illegal()),
            }
        }
        (2, 6) => {
            // C.SWSP
            let imm = (((h >> 9) & 0xF) << 2) | (((h >> 7) & 0x3) << 6);
            Ok(encode_s(imm as i32, rs2_full, 2, 2))
        }
        (2, 7) => {
            // C.SDSP
            let imm = (((h >> 10) & 0x7) << 3) | (((h >> 7) & 0x7) << 6);
            Ok(encode_s(imm as i32, rs2_full, 2, 3))
        }
        _ => Err(illegal()),
    }
}

fn sext6(v: u32) -> i32 {
    ((v as i32) << 26) >> 26
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_addi() {
        // addi x1, x0, -1
        let insn = encode_i(-1, 0, 0, 1, 0x13);
        match decode(insn).unwrap() {
            Op::OpImm { rd, rs1, imm, funct3, .. } => {
                assert_eq!((rd, rs1, imm, funct3), (1, 0, -1, 0));
            }
            other => panic!("unexpected op: {:?}", other),
        }
    }

    #[test]
    fn decode_branch_negative_offset() {
        let insn = encode_b(-8, 3, 4, 1);
        match decode(insn).unwrap() {
            Op::Branch { rs1, rs2, imm, funct3 } => {
                assert_eq!((rs1, rs2, imm, funct3), (4, 3, -8, 1));
            }
            other => panic!("unexpected op: {:?}", other),
        }
    }

    #[test]
    fn fp_opcodes_are_illegal() {
        // FLD f1, 0(x2)
        assert!(decode(encode_i(0, 2, 3, 1, 0x07)).is_err());
        // FADD.D
        assert!(decode(encode_r(0x01, 2, 3, 0, 1, 0x53)).is_err());
    }

    #[test]
    fn expand_c_addi() {
        // c.addi x2, -16 -> 0x1141 in common kernels
        let expanded = expand_compressed(0x1141).unwrap();
        match decode(expanded).unwrap() {
            Op::OpImm { rd, rs1, imm, funct3, .. } => {
                assert_eq!((rd, rs1, imm, funct3), (2, 2, -16, 0));
            }
            other => panic!("unexpected op: {:?}", other),
        }
    }

    #[test]
    fn expand_c_ld_sd() {
        // c.ld a4, 0(a5) = 0x6398; c.sd a4, 0(a5) = 0xe398
        match decode(expand_compressed(0x6398).unwrap()).unwrap() {
            Op::Load { rd, rs1, imm, funct3 } => {
                assert_eq!((rd, rs1, imm, funct3), (14, 15, 0, 3));
            }
            other => panic!("unexpected op: {:?}", other),
        }
        match decode(expand_compressed(0xe398).unwrap()).unwrap() {
            Op::Store { rs1, rs2, imm, funct3 } => {
                assert_eq!((rs1, rs2, imm, funct3), (15, 14, 0, 3));
            }
            other => panic!("unexpected op: {:?}", other),
        }
    }

    #[test]
    fn zero_parcel_is_illegal() {
        assert!(expand_compressed(0).is_err());
    }
}
