//! The microarchitecture: a minimal RV64I engine whose loads and stores
//! address the outer machine's physical space, including the processor
//! shadow. Running it through a recording access layer yields a replayable
//! log of one macro-step.

use crate::access_log::{AccessLog, Replay};
use crate::bus;
use crate::cpu::MachineState;
use crate::decoder::{self, Op};
use crate::merkle::{fold_siblings, Hash, LOG2_ROOT_SIZE};
use crate::pma::{
    UARCH_RAM_START, UARCH_REGION_LOG2_SIZE, UARCH_REGION_START, UARCH_SHADOW_START,
};
use crate::shadow;
use crate::{MachineError, Trap};

pub const UARCH_PC_INIT: u64 = UARCH_RAM_START;

// Absolute physical addresses of the uarch shadow words.
pub const UARCH_X_ABS: u64 = UARCH_SHADOW_START + shadow::UARCH_SHADOW_X0;
pub const UARCH_PC_ABS: u64 = UARCH_SHADOW_START + shadow::UARCH_SHADOW_PC;
pub const UARCH_CYCLE_ABS: u64 = UARCH_SHADOW_START + shadow::UARCH_SHADOW_CYCLE;
pub const UARCH_HALT_ABS: u64 = UARCH_SHADOW_START + shadow::UARCH_SHADOW_HALT;

/// The uarch register file and control state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UarchProcessor {
    pub x: [u64; 32],
    pub pc: u64,
    pub cycle: u64,
    pub halt_flag: bool,
}

impl UarchProcessor {
    pub fn new() -> Self {
        UarchProcessor { x: [0; 32], pc: UARCH_PC_INIT, cycle: 0, halt_flag: false }
    }
}

impl Default for UarchProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UarchStepStatus {
    /// One instruction executed and the uarch cycle advanced.
    Advanced,
    /// The halt flag was already set (or the cycle counter saturated); the
    /// step was a no-op.
    Halted,
}

/// Word-granular access to the machine state, in both directions. The
/// direct implementation mutates the machine; the replay implementation
/// checks a recorded log instead.
pub trait UarchAccess {
    fn read_word(&mut self, paddr: u64) -> Result<u64, MachineError>;
    fn write_word(&mut self, paddr: u64, value: u64) -> Result<(), MachineError>;
}

/// Direct, unlogged access used by `run_uarch`.
pub struct DirectAccess<'a> {
    pub state: &'a mut MachineState,
}

fn uarch_bus_error(t: Trap) -> MachineError {
    MachineError::Uarch(format!("uarch memory access faulted: {}", t))
}

impl UarchAccess for DirectAccess<'_> {
    fn read_word(&mut self, paddr: u64) -> Result<u64, MachineError> {
        bus::read_phys(self.state, paddr, 3).map_err(uarch_bus_error)
    }

    fn write_word(&mut self, paddr: u64, value: u64) -> Result<(), MachineError> {
        write_word_direct(self.state, paddr, value)
    }
}

/// Route a uarch store: the shadows accept stores only from here, never
/// from guest MMIO.
pub fn write_word_direct(s: &mut MachineState, paddr: u64, value: u64) -> Result<(), MachineError> {
    if (UARCH_SHADOW_START..UARCH_SHADOW_START + crate::pma::UARCH_SHADOW_LENGTH).contains(&paddr) {
        if shadow::uarch_write(s, paddr - UARCH_SHADOW_START, value) {
            return Ok(());
        }
        return Err(MachineError::Uarch(format!("invalid uarch shadow store at {:#x}", paddr)));
    }
    if (crate::pma::SHADOW_START..crate::pma::SHADOW_START + crate::pma::SHADOW_LENGTH)
        .contains(&paddr)
    {
        if shadow::write(s, paddr - crate::pma::SHADOW_START, value) {
            return Ok(());
        }
        return Err(MachineError::Uarch(format!("invalid shadow store at {:#x}", paddr)));
    }
    bus::write_phys(s, paddr, value, 3).map_err(uarch_bus_error)
}

impl UarchAccess for Replay<'_> {
    fn read_word(&mut self, paddr: u64) -> Result<u64, MachineError> {
        Replay::read_word(self, paddr)
    }

    fn write_word(&mut self, paddr: u64, value: u64) -> Result<(), MachineError> {
        Replay::write_word(self, paddr, value)
    }
}

fn read_reg<A: UarchAccess>(a: &mut A, reg: u32) -> Result<u64, MachineError> {
    a.read_word(UARCH_X_ABS + 8 * reg as u64)
}

fn write_reg<A: UarchAccess>(a: &mut A, reg: u32, value: u64) -> Result<(), MachineError> {
    if reg != 0 {
        a.write_word(UARCH_X_ABS + 8 * reg as u64, value)?;
    }
    Ok(())
}

fn illegal(insn: u32) -> MachineError {
    MachineError::Uarch(format!("uarch illegal instruction {:#010x}", insn))
}

fn misaligned(addr: u64) -> MachineError {
    MachineError::Uarch(format!("uarch misaligned access at {:#x}", addr))
}

/// Execute exactly one uarch instruction through `a`.
///
/// Every piece of state consulted or changed, including the uarch registers
/// themselves, flows through the access layer, so a recording layer sees
/// the complete footprint of the step.
pub fn step<A: UarchAccess>(a: &mut A) -> Result<UarchStepStatus, MachineError> {
    if a.read_word(UARCH_HALT_ABS)? != 0 {
        return Ok(UarchStepStatus::Halted);
    }
    let cycle = a.read_word(UARCH_CYCLE_ABS)?;
    if cycle == u64::MAX {
        return Ok(UarchStepStatus::Halted);
    }
    let pc = a.read_word(UARCH_PC_ABS)?;
    if pc & 3 != 0 {
        return Err(misaligned(pc));
    }
    let word = a.read_word(pc & !7)?;
    let insn = if pc & 4 != 0 { (word >> 32) as u32 } else { word as u32 };
    if insn & 3 != 3 {
        // No compressed instructions in the uarch.
        return Err(illegal(insn));
    }

    let mut next_pc = pc.wrapping_add(4);
    match decoder::decode(insn).map_err(|_| illegal(insn))? {
        Op::Lui { rd, imm } => write_reg(a, rd, imm as u64)?,
        Op::Auipc { rd, imm } => write_reg(a, rd, pc.wrapping_add(imm as u64))?,
        Op::Jal { rd, imm } => {
            write_reg(a, rd, next_pc)?;
            next_pc = pc.wrapping_add(imm as u64);
        }
        Op::Jalr { rd, rs1, imm } => {
            let target = read_reg(a, rs1)?.wrapping_add(imm as u64) & !1;
            write_reg(a, rd, next_pc)?;
            next_pc = target;
        }
        Op::Branch { rs1, rs2, imm, funct3 } => {
            let x = read_reg(a, rs1)?;
            let y = read_reg(a, rs2)?;
            let taken = match funct3 {
                0 => x == y,
                1 => x != y,
                4 => (x as i64) < (y as i64),
                5 => (x as i64) >= (y as i64),
                6 => x < y,
                7 => x >= y,
                _ => return Err(illegal(insn)),
            };
            if taken {
                next_pc = pc.wrapping_add(imm as u64);
            }
        }
        Op::Load { rd, rs1, imm, funct3 } => {
            let addr = read_reg(a, rs1)?.wrapping_add(imm as u64);
            let size = 1u64 << (funct3 & 3);
            if addr & (size - 1) != 0 {
                return Err(misaligned(addr));
            }
            let word = a.read_word(addr & !7)?;
            let shift = (addr & 7) * 8;
            let val = match funct3 {
                0 => (word >> shift) as u8 as i8 as i64 as u64,
                1 => (word >> shift) as u16 as i16 as i64 as u64,
                2 => (word >> shift) as u32 as i32 as i64 as u64,
                3 => word,
                4 => (word >> shift) as u8 as u64,
                5 => (word >> shift) as u16 as u64,
                6 => (word >> shift) as u32 as u64,
                _ => return Err(illegal(insn)),
            };
            write_reg(a, rd, val)?;
        }
        Op::Store { rs1, rs2, imm, funct3 } => {
            let addr = read_reg(a, rs1)?.wrapping_add(imm as u64);
            if funct3 > 3 {
                return Err(illegal(insn));
            }
            let size = 1u64 << funct3;
            if addr & (size - 1) != 0 {
                return Err(misaligned(addr));
            }
            let val = read_reg(a, rs2)?;
            if funct3 == 3 {
                a.write_word(addr, val)?;
            } else {
                // Narrow stores are read-modify-write on the containing
                // word so the log stays word-granular.
                let word = a.read_word(addr & !7)?;
                let shift = (addr & 7) * 8;
                let mask = ((1u128 << (size * 8)) - 1) as u64;
                let merged = (word & !(mask << shift)) | ((val & mask) << shift);
                a.write_word(addr & !7, merged)?;
            }
        }
        Op::OpImm { rd, rs1, imm, funct3, funct7 } => {
            let x = read_reg(a, rs1)?;
            let res = match funct3 {
                0 => x.wrapping_add(imm as u64),
                1 => x << (imm & 0x3F),
                2 => ((x as i64) < imm) as u64,
                3 => (x < imm as u64) as u64,
                4 => x ^ imm as u64,
                5 => {
                    if funct7 & 0x20 != 0 {
                        ((x as i64) >> (imm & 0x3F)) as u64
                    } else {
                        x >> (imm & 0x3F)
                    }
                }
                6 => x | imm as u64,
                7 => x & imm as u64,
                _ => return Err(illegal(insn)),
            };
            write_reg(a, rd, res)?;
        }
        Op::Op { rd, rs1, rs2, funct3, funct7 } => {
            if funct7 != 0x00 && funct7 != 0x20 {
                return Err(illegal(insn));
            }
            let x = read_reg(a, rs1)?;
            let y = read_reg(a, rs2)?;
            let res = match (funct3, funct7) {
                (0, 0x00) => x.wrapping_add(y),
                (0, 0x20) => x.wrapping_sub(y),
                (1, 0x00) => x << (y & 0x3F),
                (2, 0x00) => ((x as i64) < (y as i64)) as u64,
                (3, 0x00) => (x < y) as u64,
                (4, 0x00) => x ^ y,
                (5, 0x00) => x >> (y & 0x3F),
                (5, 0x20) => ((x as i64) >> (y & 0x3F)) as u64,
                (6, 0x00) => x | y,
                (7, 0x00) => x & y,
                _ => return Err(illegal(insn)),
            };
            write_reg(a, rd, res)?;
        }
        Op::OpImm32 { rd, rs1, imm, funct3, funct7 } => {
            let x = read_reg(a, rs1)?;
            let res = match funct3 {
                0 => x.wrapping_add(imm as u64) as i32 as i64 as u64,
                1 => ((x as u32) << (imm & 0x1F)) as i32 as i64 as u64,
                5 => {
                    if funct7 & 0x20 != 0 {
                        ((x as i32) >> (imm & 0x1F)) as i64 as u64
                    } else {
                        ((x as u32) >> (imm & 0x1F)) as i32 as i64 as u64
                    }
                }
                _ => return Err(illegal(insn)),
            };
            write_reg(a, rd, res)?;
        }
        Op::Op32 { rd, rs1, rs2, funct3, funct7 } => {
            if funct7 != 0x00 && funct7 != 0x20 {
                return Err(illegal(insn));
            }
            let x = read_reg(a, rs1)?;
            let y = read_reg(a, rs2)?;
            let res = match (funct3, funct7) {
                (0, 0x00) => x.wrapping_add(y) as i32 as i64 as u64,
                (0, 0x20) => x.wrapping_sub(y) as i32 as i64 as u64,
                (1, 0x00) => ((x as u32) << (y & 0x1F)) as i32 as i64 as u64,
                (5, 0x00) => ((x as u32) >> (y & 0x1F)) as i32 as i64 as u64,
                (5, 0x20) => ((x as i32) >> (y & 0x1F)) as i64 as u64,
                _ => return Err(illegal(insn)),
            };
            write_reg(a, rd, res)?;
        }
        Op::Fence => {}
        // No atomics, CSRs or environment calls inside the deterministic
        // inner engine.
        Op::Amo { .. } | Op::System { .. } => return Err(illegal(insn)),
    }

    a.write_word(UARCH_PC_ABS, next_pc)?;
    a.write_word(UARCH_CYCLE_ABS, cycle + 1)?;
    Ok(UarchStepStatus::Advanced)
}

// ---- Static verifiers -------------------------------------------------------

/// Replay one logged step from `root_before`, returning the root it ends at.
pub fn verify_step_log(root_before: Hash, log: &AccessLog) -> Result<Hash, MachineError> {
    let mut replay = Replay::new(log, root_before)?;
    step(&mut replay)?;
    replay.finish()
}

/// Check that a logged step transforms `root_before` into `root_after`.
pub fn verify_step_state_transition(
    root_before: Hash,
    log: &AccessLog,
    root_after: Hash,
) -> Result<(), MachineError> {
    let root = verify_step_log(root_before, log)?;
    if root != root_after {
        return Err(MachineError::verification(format!(
            "final root {} does not match claimed root {}",
            root, root_after
        )));
    }
    Ok(())
}

/// Replay a logged uarch reset: a single subtree-sized write restoring the
/// uarch region to its pristine image.
pub fn verify_reset_log(root_before: Hash, log: &AccessLog) -> Result<Hash, MachineError> {
    if !log.log_type.proofs {
        return Err(MachineError::verification("access log was recorded without proofs"));
    }
    if log.accesses.len() != 1 {
        return Err(MachineError::verification(format!(
            "uarch reset log must contain exactly one access, has {}",
            log.accesses.len()
        )));
    }
    let access = &log.accesses[0];
    if access.kind != crate::access_log::AccessKind::Write
        || access.address != UARCH_REGION_START
        || access.log2_size != UARCH_REGION_LOG2_SIZE
    {
        return Err(MachineError::verification(
            "uarch reset log access does not cover the uarch region",
        ));
    }
    let siblings = access
        .sibling_hashes
        .as_ref()
        .ok_or_else(|| MachineError::verification("uarch reset access carries no sibling hashes"))?;
    if siblings.len() as u32 != LOG2_ROOT_SIZE - UARCH_REGION_LOG2_SIZE {
        return Err(MachineError::verification("uarch reset access has wrong sibling count"));
    }
    let folded =
        fold_siblings(access.address, UARCH_REGION_LOG2_SIZE, &access.hash_before, siblings);
    if folded != root_before {
        return Err(MachineError::verification("uarch reset proof does not match root before"));
    }
    let hash_after = access
        .hash_after
        .ok_or_else(|| MachineError::verification("uarch reset access carries no hash_after"))?;
    Ok(fold_siblings(access.address, UARCH_REGION_LOG2_SIZE, &hash_after, siblings))
}

pub fn verify_reset_state_transition(
    root_before: Hash,
    log: &AccessLog,
    root_after: Hash,
) -> Result<(), MachineError> {
    let root = verify_reset_log(root_before, log)?;
    if root != root_after {
        return Err(MachineError::verification(format!(
            "final root {} does not match claimed root {}",
            root, root_after
        )));
    }
    Ok(())
}
