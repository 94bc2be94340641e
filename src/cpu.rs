use crate::bus;
use crate::clint;
use crate::csr::*;
use crate::decoder::{self, Op};
use crate::htif::HtifState;
use crate::mmu::{self, AccessType, TlbSet};
use crate::plic::{self, PlicState};
use crate::pma::PmaTable;
use crate::uarch::UarchProcessor;
use crate::virtio::VirtioDevice;
use crate::Trap;

/// Causes that can be delegated to S-mode through medeleg.
pub const MEDELEG_WRITE_MASK: u64 = 0xB3FF;
/// Only supervisor interrupts can be delegated through mideleg.
pub const MIDELEG_WRITE_MASK: u64 = SIP_MASK;
/// Writable interrupt-enable bits.
pub const MIE_WRITE_MASK: u64 = MIP_SSIP | MIP_MSIP | MIP_STIP | MIP_MTIP | MIP_SEIP | MIP_MEIP;
/// Pending bits software may set directly through mip.
pub const MIP_WRITE_MASK: u64 = MIP_SSIP | MIP_STIP | MIP_SEIP;

/// The complete architectural state of one machine.
///
/// There is exactly one hart. Everything here except the TLBs and the VirtIO
/// device boxes is committed by the Merkle tree, either through a memory PMA
/// or through the processor shadow.
pub struct MachineState {
    pub x: [u64; 32],
    pub f: [u64; 32],
    pub pc: u64,
    pub fcsr: u64,

    pub mvendorid: u64,
    pub marchid: u64,
    pub mimpid: u64,

    pub mcycle: u64,
    pub icycleinstret: u64,

    pub mstatus: u64,
    pub mtvec: u64,
    pub mscratch: u64,
    pub mepc: u64,
    pub mcause: u64,
    pub mtval: u64,
    pub misa: u64,
    pub mie: u64,
    pub mip: u64,
    pub medeleg: u64,
    pub mideleg: u64,
    pub mcounteren: u64,
    pub menvcfg: u64,

    pub stvec: u64,
    pub sscratch: u64,
    pub sepc: u64,
    pub scause: u64,
    pub stval: u64,
    pub satp: u64,
    pub scounteren: u64,
    pub senvcfg: u64,

    /// LR/SC reservation: physical address of the reserved doubleword, or
    /// `u64::MAX` when no reservation is held.
    pub ilrsc: u64,
    pub iflags: Iflags,
    /// Unreproducible mode: host-side nondeterminism (console input,
    /// VirtIO) is only permitted when set.
    pub iunrep: bool,

    pub clint: clint::ClintState,
    pub htif: HtifState,
    pub plic: PlicState,
    pub uarch: UarchProcessor,

    pub pmas: PmaTable,
    pub tlb: TlbSet,
    pub virtio_devices: Vec<Box<dyn VirtioDevice>>,
}

/// What one interpreter step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// An instruction retired (or a trap was taken); `mcycle` advanced by 1.
    Retired,
    /// The hart is stalled in WFI with nothing pending. No state changed;
    /// the caller decides how far to fast-forward `mcycle`.
    Waiting,
}

impl MachineState {
    pub fn new() -> Self {
        MachineState {
            x: [0; 32],
            f: [0; 32],
            pc: PC_INIT,
            fcsr: 0,
            mvendorid: MVENDORID_INIT,
            marchid: MARCHID_INIT,
            mimpid: MIMPID_INIT,
            mcycle: 0,
            icycleinstret: 0,
            mstatus: MSTATUS_INIT,
            mtvec: MTVEC_INIT,
            mscratch: 0,
            mepc: 0,
            mcause: 0,
            mtval: 0,
            misa: MISA_INIT,
            mie: 0,
            mip: 0,
            medeleg: 0,
            mideleg: 0,
            mcounteren: 0,
            menvcfg: 0,
            stvec: 0,
            sscratch: 0,
            sepc: 0,
            scause: 0,
            stval: 0,
            satp: 0,
            scounteren: 0,
            senvcfg: 0,
            ilrsc: ILRSC_INIT,
            iflags: Iflags::new(),
            iunrep: false,
            clint: clint::ClintState::new(),
            htif: HtifState::new(),
            plic: PlicState::new(),
            uarch: UarchProcessor::new(),
            pmas: PmaTable::new(),
            tlb: TlbSet::new(),
            virtio_devices: Vec::new(),
        }
    }

    pub fn read_x(&self, reg: u32) -> u64 {
        if reg == 0 {
            0
        } else {
            self.x[reg as usize]
        }
    }

    pub fn write_x(&mut self, reg: u32, val: u64) {
        if reg != 0 {
            self.x[reg as usize] = val;
        }
    }

    /// Change privilege mode. Translation depends on the mode, so the TLBs
    /// cannot survive the switch.
    pub fn set_mode(&mut self, mode: Mode) {
        if self.iflags.prv != mode {
            self.iflags.prv = mode;
            self.tlb.flush_all();
        }
    }

    /// Replace mstatus, applying WARL masking and the required TLB flushes.
    pub fn set_mstatus(&mut self, val: u64) {
        let fixed = MSTATUS_INIT;
        let new = (val & MSTATUS_WRITE_MASK) | fixed;
        let changed = self.mstatus ^ new;
        self.mstatus = new;
        if changed & (MSTATUS_MPRV | MSTATUS_SUM | MSTATUS_MXR | MSTATUS_MPP_MASK) != 0 {
            self.tlb.flush_read_write();
        }
    }

    /// mstatus with the SD bit derived from FS.
    fn mstatus_read(&self) -> u64 {
        let mut v = self.mstatus;
        if (v & MSTATUS_FS_MASK) == MSTATUS_FS_MASK {
            v |= MSTATUS_SD;
        }
        v
    }
}

impl Default for MachineState {
    fn default() -> Self {
        Self::new()
    }
}

// ---- Interrupts -------------------------------------------------------------

/// Refresh the hardware-driven mip bits from device state: the timer
/// comparison and the PLIC bitmaps. msip is a direct doorbell and SSIP/STIP/
/// SEIP software injections persist untouched.
pub fn poll_hw_interrupts(s: &mut MachineState) {
    if clint::rtc_cycle_to_time(s.mcycle) >= s.clint.mtimecmp {
        s.mip |= MIP_MTIP;
    }
    plic::update_mip(s);
}

/// Highest-priority interrupt that must be taken now, if any.
fn pending_interrupt(s: &MachineState) -> Option<Trap> {
    let pending = s.mip & s.mie;
    if pending == 0 {
        return None;
    }

    let m_pending = pending & !s.mideleg;
    let s_pending = pending & s.mideleg;

    let m_enabled = match s.iflags.prv {
        Mode::Machine => s.mstatus & MSTATUS_MIE != 0,
        _ => true,
    };
    if m_enabled {
        if m_pending & MIP_MEIP != 0 {
            return Some(Trap::MachineExternalInterrupt);
        }
        if m_pending & MIP_MSIP != 0 {
            return Some(Trap::MachineSoftwareInterrupt);
        }
        if m_pending & MIP_MTIP != 0 {
            return Some(Trap::MachineTimerInterrupt);
        }
        if m_pending & MIP_SEIP != 0 {
            return Some(Trap::SupervisorExternalInterrupt);
        }
        if m_pending & MIP_SSIP != 0 {
            return Some(Trap::SupervisorSoftwareInterrupt);
        }
        if m_pending & MIP_STIP != 0 {
            return Some(Trap::SupervisorTimerInterrupt);
        }
    }

    let s_enabled = match s.iflags.prv {
        Mode::Machine => false,
        Mode::Supervisor => s.mstatus & MSTATUS_SIE != 0,
        Mode::User => true,
    };
    if s_enabled {
        if s_pending & MIP_SEIP != 0 {
            return Some(Trap::SupervisorExternalInterrupt);
        }
        if s_pending & MIP_SSIP != 0 {
            return Some(Trap::SupervisorSoftwareInterrupt);
        }
        if s_pending & MIP_STIP != 0 {
            return Some(Trap::SupervisorTimerInterrupt);
        }
    }

    None
}

/// Map a trap to `(is_interrupt, cause, tval)` per the privileged spec.
fn trap_cause(trap: &Trap) -> (bool, u64, u64) {
    match *trap {
        Trap::InstructionAddressMisaligned(a) => (false, 0, a),
        Trap::InstructionAccessFault(a) => (false, 1, a),
        Trap::IllegalInstruction(bits) => (false, 2, bits),
        Trap::Breakpoint => (false, 3, 0),
        Trap::LoadAddressMisaligned(a) => (false, 4, a),
        Trap::LoadAccessFault(a) => (false, 5, a),
        Trap::StoreAddressMisaligned(a) => (false, 6, a),
        Trap::StoreAccessFault(a) => (false, 7, a),
        Trap::EnvironmentCallFromU => (false, 8, 0),
        Trap::EnvironmentCallFromS => (false, 9, 0),
        Trap::EnvironmentCallFromM => (false, 11, 0),
        Trap::InstructionPageFault(a) => (false, 12, a),
        Trap::LoadPageFault(a) => (false, 13, a),
        Trap::StorePageFault(a) => (false, 15, a),

        Trap::SupervisorSoftwareInterrupt => (true, 1, 0),
        Trap::MachineSoftwareInterrupt => (true, 3, 0),
        Trap::SupervisorTimerInterrupt => (true, 5, 0),
        Trap::MachineTimerInterrupt => (true, 7, 0),
        Trap::SupervisorExternalInterrupt => (true, 9, 0),
        Trap::MachineExternalInterrupt => (true, 11, 0),
    }
}

/// Enter the trap handler: route to S-mode when delegated, otherwise to
/// M-mode, updating the relevant CSRs and redirecting the PC.
pub fn take_trap(s: &mut MachineState, trap: &Trap, pc: u64) {
    let (is_interrupt, cause, tval) = trap_cause(trap);

    let deleg_to_s = s.iflags.prv != Mode::Machine && {
        let bit = 1u64 << cause;
        if is_interrupt {
            s.mideleg & bit != 0
        } else {
            s.medeleg & bit != 0
        }
    };

    if log::log_enabled!(log::Level::Trace) {
        log::trace!(
            "trap {:?} pc={:#x} mcycle={} deleg={}",
            trap,
            pc,
            s.mcycle,
            deleg_to_s
        );
    }

    let cause_val = ((is_interrupt as u64) << 63) | cause;
    if deleg_to_s {
        s.sepc = pc;
        s.stval = tval;
        s.scause = cause_val;

        let mut mstatus = s.mstatus;
        let sie = (mstatus >> 1) & 1;
        mstatus = (mstatus & !MSTATUS_SPIE) | (sie << 5);
        mstatus &= !MSTATUS_SIE;
        let spp = match s.iflags.prv {
            Mode::Supervisor => 1,
            _ => 0,
        };
        mstatus = (mstatus & !MSTATUS_SPP) | (spp << 8);
        s.mstatus = mstatus;
        s.set_mode(Mode::Supervisor);

        s.pc = trap_vector(s.stvec, is_interrupt, cause);
    } else {
        s.mepc = pc;
        s.mtval = tval;
        s.mcause = cause_val;

        let mut mstatus = s.mstatus;
        let mie = (mstatus >> 3) & 1;
        mstatus = (mstatus & !MSTATUS_MPIE) | (mie << 7);
        mstatus &= !MSTATUS_MIE;
        mstatus = (mstatus & !MSTATUS_MPP_MASK) | (s.iflags.prv.to_prv() << MSTATUS_MPP_SHIFT);
        s.mstatus = mstatus;
        s.set_mode(Mode::Machine);

        s.pc = trap_vector(s.mtvec, is_interrupt, cause);
    }
}

fn trap_vector(tvec: u64, is_interrupt: bool, cause: u64) -> u64 {
    let base = tvec & !0b11;
    if is_interrupt && tvec & 0b11 == 1 {
        base.wrapping_add(4 * cause)
    } else {
        base
    }
}

// ---- Memory helpers ---------------------------------------------------------

fn remap_load_fault(t: Trap, vaddr: u64) -> Trap {
    match t {
        Trap::LoadAccessFault(_) => Trap::LoadAccessFault(vaddr),
        Trap::LoadAddressMisaligned(_) => Trap::LoadAddressMisaligned(vaddr),
        other => other,
    }
}

fn remap_store_fault(t: Trap, vaddr: u64) -> Trap {
    match t {
        Trap::StoreAccessFault(_) => Trap::StoreAccessFault(vaddr),
        Trap::StoreAddressMisaligned(_) => Trap::StoreAddressMisaligned(vaddr),
        other => other,
    }
}

fn virt_read(s: &mut MachineState, vaddr: u64, log2: u32) -> Result<u64, Trap> {
    if vaddr & ((1 << log2) - 1) != 0 {
        return Err(Trap::LoadAddressMisaligned(vaddr));
    }
    let paddr = mmu::translate(s, vaddr, AccessType::Load)?;
    bus::read_phys(s, paddr, log2).map_err(|t| remap_load_fault(t, vaddr))
}

fn virt_write(s: &mut MachineState, vaddr: u64, val: u64, log2: u32) -> Result<(), Trap> {
    if vaddr & ((1 << log2) - 1) != 0 {
        return Err(Trap::StoreAddressMisaligned(vaddr));
    }
    let paddr = mmu::translate(s, vaddr, AccessType::Store)?;
    bus::write_phys(s, paddr, val, log2).map_err(|t| remap_store_fault(t, vaddr))
}

/// Translate for a store but fault as a store even on read-side problems;
/// used by AMOs which architecturally require write permission.
fn amo_translate(s: &mut MachineState, vaddr: u64) -> Result<u64, Trap> {
    mmu::translate(s, vaddr, AccessType::Store)
}

fn fetch_insn(s: &mut MachineState, pc: u64) -> Result<(u32, u64), Trap> {
    if pc & 1 != 0 {
        return Err(Trap::InstructionAddressMisaligned(pc));
    }
    let pa_lo = mmu::translate(s, pc, AccessType::Fetch)?;
    let lo = bus::fetch_parcel(s, pa_lo).map_err(|t| match t {
        Trap::InstructionAccessFault(_) => Trap::InstructionAccessFault(pc),
        Trap::InstructionAddressMisaligned(_) => Trap::InstructionAddressMisaligned(pc),
        other => other,
    })?;

    if lo & 0x3 != 0x3 {
        return Ok((decoder::expand_compressed(lo)?, 2));
    }

    // A 32-bit instruction may straddle a page boundary; the upper parcel is
    // translated on its own so the second page faults precisely.
    let pc_hi = pc.wrapping_add(2);
    let pa_hi = if pc_hi & 0xFFF == 0 {
        mmu::translate(s, pc_hi, AccessType::Fetch)?
    } else {
        pa_lo + 2
    };
    let hi = bus::fetch_parcel(s, pa_hi).map_err(|t| match t {
        Trap::InstructionAccessFault(_) => Trap::InstructionAccessFault(pc_hi),
        Trap::InstructionAddressMisaligned(_) => Trap::InstructionAddressMisaligned(pc_hi),
        other => other,
    })?;
    Ok(((hi as u32) << 16 | lo as u32, 4))
}

// ---- CSR access -------------------------------------------------------------

fn csr_priv_check(s: &MachineState, addr: u32) -> Result<(), Trap> {
    let required = (addr >> 8) & 0x3;
    if s.iflags.prv.to_prv() < required as u64 {
        return Err(Trap::IllegalInstruction(addr as u64));
    }
    Ok(())
}

fn counter_enabled(s: &MachineState, bit: u32) -> bool {
    match s.iflags.prv {
        Mode::Machine => true,
        Mode::Supervisor => s.mcounteren >> bit & 1 != 0,
        Mode::User => s.mcounteren >> bit & 1 != 0 && s.scounteren >> bit & 1 != 0,
    }
}

pub fn csr_read(s: &MachineState, addr: u32) -> Result<u64, Trap> {
    csr_priv_check(s, addr)?;
    let illegal = || Trap::IllegalInstruction(addr as u64);
    match addr {
        CSR_FFLAGS => Ok(s.fcsr & FCSR_FFLAGS_MASK),
        CSR_FRM => Ok((s.fcsr & FCSR_FRM_MASK) >> FCSR_FRM_SHIFT),
        CSR_FCSR => Ok(s.fcsr & FCSR_MASK),

        CSR_SSTATUS => Ok(s.mstatus_read() & SSTATUS_READ_MASK),
        CSR_SIE => Ok(s.mie & SIP_MASK),
        CSR_STVEC => Ok(s.stvec),
        CSR_SCOUNTEREN => Ok(s.scounteren),
        CSR_SENVCFG => Ok(s.senvcfg),
        CSR_SSCRATCH => Ok(s.sscratch),
        CSR_SEPC => Ok(s.sepc),
        CSR_SCAUSE => Ok(s.scause),
        CSR_STVAL => Ok(s.stval),
        CSR_SIP => Ok(s.mip & SIP_MASK),
        CSR_SATP => Ok(s.satp),

        CSR_MSTATUS => Ok(s.mstatus_read()),
        CSR_MISA => Ok(s.misa),
        CSR_MEDELEG => Ok(s.medeleg),
        CSR_MIDELEG => Ok(s.mideleg),
        CSR_MIE => Ok(s.mie),
        CSR_MTVEC => Ok(s.mtvec),
        CSR_MCOUNTEREN => Ok(s.mcounteren),
        CSR_MENVCFG => Ok(s.menvcfg),
        CSR_MSCRATCH => Ok(s.mscratch),
        CSR_MEPC => Ok(s.mepc),
        CSR_MCAUSE => Ok(s.mcause),
        CSR_MTVAL => Ok(s.mtval),
        CSR_MIP => Ok(s.mip),

        CSR_MCYCLE => Ok(s.mcycle),
        CSR_MINSTRET => Ok(s.icycleinstret),

        CSR_CYCLE => {
            if counter_enabled(s, 0) {
                Ok(s.mcycle)
            } else {
                Err(illegal())
            }
        }
        CSR_TIME => {
            if counter_enabled(s, 1) {
                Ok(clint::rtc_cycle_to_time(s.mcycle))
            } else {
                Err(illegal())
            }
        }
        CSR_INSTRET => {
            if counter_enabled(s, 2) {
                Ok(s.icycleinstret)
            } else {
                Err(illegal())
            }
        }

        CSR_MVENDORID => Ok(s.mvendorid),
        CSR_MARCHID => Ok(s.marchid),
        CSR_MIMPID => Ok(s.mimpid),
        CSR_MHARTID => Ok(0),

        _ => Err(illegal()),
    }
}

pub fn csr_write(s: &mut MachineState, addr: u32, val: u64) -> Result<(), Trap> {
    // Bits [11:10] == 0b11 mark the CSR read-only.
    if (addr >> 10) & 0x3 == 0x3 {
        return Err(Trap::IllegalInstruction(addr as u64));
    }
    csr_priv_check(s, addr)?;
    match addr {
        CSR_FFLAGS => s.fcsr = (s.fcsr & !FCSR_FFLAGS_MASK) | (val & FCSR_FFLAGS_MASK),
        CSR_FRM => {
            s.fcsr = (s.fcsr & !FCSR_FRM_MASK) | ((val << FCSR_FRM_SHIFT) & FCSR_FRM_MASK)
        }
        CSR_FCSR => s.fcsr = val & FCSR_MASK,

        CSR_SSTATUS => {
            let merged = (s.mstatus & !SSTATUS_WRITE_MASK) | (val & SSTATUS_WRITE_MASK);
            s.set_mstatus(merged);
        }
        CSR_SIE => s.mie = (s.mie & !SIP_MASK) | (val & SIP_MASK),
        CSR_STVEC => s.stvec = val & !0b10,
        CSR_SCOUNTEREN => s.scounteren = val & 0b111,
        CSR_SENVCFG => s.senvcfg = val & 1,
        CSR_SSCRATCH => s.sscratch = val,
        CSR_SEPC => s.sepc = val & !1,
        CSR_SCAUSE => s.scause = val,
        CSR_STVAL => s.stval = val,
        CSR_SIP => s.mip = (s.mip & !SIP_WRITE_MASK) | (val & SIP_WRITE_MASK),
        CSR_SATP => {
            // WARL: only Bare and Sv48 are accepted; other modes leave the
            // register unchanged.
            let mode = val >> SATP_MODE_SHIFT;
            if mode == SATP_MODE_BARE || mode == SATP_MODE_SV48 {
                s.satp = val & ((SATP_MODE_SV48 << SATP_MODE_SHIFT) | SATP_PPN_MASK);
                s.tlb.flush_all();
            }
        }

        CSR_MSTATUS => s.set_mstatus(val),
        CSR_MISA => {
            // Writes are masked to the supported extension set, which is
            // fixed, so the register never changes.
        }
        CSR_MEDELEG => s.medeleg = val & MEDELEG_WRITE_MASK,
        CSR_MIDELEG => s.mideleg = val & MIDELEG_WRITE_MASK,
        CSR_MIE => s.mie = val & MIE_WRITE_MASK,
        CSR_MTVEC => s.mtvec = val & !0b10,
        CSR_MCOUNTEREN => s.mcounteren = val & 0b111,
        CSR_MENVCFG => s.menvcfg = val & 1,
        CSR_MSCRATCH => s.mscratch = val,
        CSR_MEPC => s.mepc = val & !1,
        CSR_MCAUSE => s.mcause = val,
        CSR_MTVAL => s.mtval = val,
        CSR_MIP => s.mip = (s.mip & !MIP_WRITE_MASK) | (val & MIP_WRITE_MASK),

        CSR_MCYCLE => s.mcycle = val,
        CSR_MINSTRET => s.icycleinstret = val,

        _ => return Err(Trap::IllegalInstruction(addr as u64)),
    }
    Ok(())
}

// ---- Step -------------------------------------------------------------------

const INSN_ECALL: u32 = 0x0000_0073;
const INSN_EBREAK: u32 = 0x0010_0073;
const INSN_SRET: u32 = 0x1020_0073;
const INSN_MRET: u32 = 0x3020_0073;
const INSN_WFI: u32 = 0x1050_0073;
const SFENCE_VMA_MASK: u32 = 0xFE00_7FFF;
const SFENCE_VMA_MATCH: u32 = 0x1200_0073;

fn advance_cycle(s: &mut MachineState) {
    s.mcycle = s.mcycle.wrapping_add(1);
    s.icycleinstret = s.icycleinstret.wrapping_add(1);
}

/// Execute one instruction (or take one interrupt). The clock advances by
/// exactly one cycle unless the hart is stalled in WFI.
pub fn step(s: &mut MachineState) -> StepOutcome {
    poll_hw_interrupts(s);
    if let Some(interrupt) = pending_interrupt(s) {
        take_trap(s, &interrupt, s.pc);
        advance_cycle(s);
        return StepOutcome::Retired;
    }

    match exec_insn(s) {
        Ok(StepOutcome::Waiting) => StepOutcome::Waiting,
        Ok(StepOutcome::Retired) => {
            advance_cycle(s);
            StepOutcome::Retired
        }
        Err(trap) => {
            take_trap(s, &trap, s.pc);
            advance_cycle(s);
            StepOutcome::Retired
        }
    }
}

fn exec_insn(s: &mut MachineState) -> Result<StepOutcome, Trap> {
    let pc = s.pc;
    let (insn, insn_len) = fetch_insn(s, pc)?;
    let op = decoder::decode(insn)?;
    let mut next_pc = pc.wrapping_add(insn_len);

    match op {
        Op::Lui { rd, imm } => s.write_x(rd, imm as u64),
        Op::Auipc { rd, imm } => s.write_x(rd, pc.wrapping_add(imm as u64)),
        Op::Jal { rd, imm } => {
            let target = pc.wrapping_add(imm as u64);
            if target & 1 != 0 {
                return Err(Trap::InstructionAddressMisaligned(target));
            }
            s.write_x(rd, next_pc);
            next_pc = target;
        }
        Op::Jalr { rd, rs1, imm } => {
            let target = s.read_x(rs1).wrapping_add(imm as u64) & !1;
            s.write_x(rd, next_pc);
            next_pc = target;
        }
        Op::Branch { rs1, rs2, imm, funct3 } => {
            let a = s.read_x(rs1);
            let b = s.read_x(rs2);
            let taken = match funct3 {
                0 => a == b,
                1 => a != b,
                4 => (a as i64) < (b as i64),
                5 => (a as i64) >= (b as i64),
                6 => a < b,
                7 => a >= b,
                _ => return Err(Trap::IllegalInstruction(insn as u64)),
            };
            if taken {
                let target = pc.wrapping_add(imm as u64);
                if target & 1 != 0 {
                    return Err(Trap::InstructionAddressMisaligned(target));
                }
                next_pc = target;
            }
        }
        Op::Load { rd, rs1, imm, funct3 } => {
            let vaddr = s.read_x(rs1).wrapping_add(imm as u64);
            let val = match funct3 {
                0 => virt_read(s, vaddr, 0)? as i8 as i64 as u64,
                1 => virt_read(s, vaddr, 1)? as i16 as i64 as u64,
                2 => virt_read(s, vaddr, 2)? as i32 as i64 as u64,
                3 => virt_read(s, vaddr, 3)?,
                4 => virt_read(s, vaddr, 0)?,
                5 => virt_read(s, vaddr, 1)?,
                6 => virt_read(s, vaddr, 2)?,
                _ => return Err(Trap::IllegalInstruction(insn as u64)),
            };
            s.write_x(rd, val);
        }
        Op::Store { rs1, rs2, imm, funct3 } => {
            let vaddr = s.read_x(rs1).wrapping_add(imm as u64);
            if funct3 > 3 {
                return Err(Trap::IllegalInstruction(insn as u64));
            }
            let val = s.read_x(rs2);
            virt_write(s, vaddr, val, funct3)?;
        }
        Op::OpImm { rd, rs1, imm, funct3, funct7 } => {
            let a = s.read_x(rs1);
            let res = match funct3 {
                0 => a.wrapping_add(imm as u64),
                1 => {
                    if imm as u64 >> 6 != 0 {
                        return Err(Trap::IllegalInstruction(insn as u64));
                    }
                    a << (imm & 0x3F)
                }
                2 => ((a as i64) < imm) as u64,
                3 => (a < imm as u64) as u64,
                4 => a ^ imm as u64,
                5 => {
                    let shamt = imm & 0x3F;
                    if funct7 & 0x20 != 0 {
                        ((a as i64) >> shamt) as u64
                    } else {
                        a >> shamt
                    }
                }
                6 => a | imm as u64,
                7 => a & imm as u64,
                _ => unreachable!(),
            };
            s.write_x(rd, res);
        }
        Op::Op { rd, rs1, rs2, funct3, funct7 } => {
            let a = s.read_x(rs1);
            let b = s.read_x(rs2);
            let res = alu64(a, b, funct3, funct7).ok_or(Trap::IllegalInstruction(insn as u64))?;
            s.write_x(rd, res);
        }
        Op::OpImm32 { rd, rs1, imm, funct3, funct7 } => {
            let a = s.read_x(rs1);
            let res = match funct3 {
                0 => a.wrapping_add(imm as u64) as i32 as i64 as u64,
                1 => ((a as u32) << (imm & 0x1F)) as i32 as i64 as u64,
                5 => {
                    let shamt = imm & 0x1F;
                    if funct7 & 0x20 != 0 {
                        ((a as i32) >> shamt) as i64 as u64
                    } else {
                        ((a as u32) >> shamt) as i32 as i64 as u64
                    }
                }
                _ => return Err(Trap::IllegalInstruction(insn as u64)),
            };
            s.write_x(rd, res);
        }
        Op::Op32 { rd, rs1, rs2, funct3, funct7 } => {
            let a = s.read_x(rs1);
            let b = s.read_x(rs2);
            let res = alu32(a, b, funct3, funct7).ok_or(Trap::IllegalInstruction(insn as u64))?;
            s.write_x(rd, res);
        }
        Op::Amo { rd, rs1, rs2, funct3, funct5 } => {
            exec_amo(s, insn, rd, rs1, rs2, funct3, funct5)?;
        }
        Op::System { rd, rs1, funct3, imm } => match funct3 {
            0 => {
                if insn & SFENCE_VMA_MASK == SFENCE_VMA_MATCH {
                    if s.iflags.prv == Mode::User {
                        return Err(Trap::IllegalInstruction(insn as u64));
                    }
                    // rs1 selects a single page; rs2 (asid) is not tracked
                    // by these TLBs, so everything else flushes all.
                    if rs1 != 0 {
                        let vaddr = s.read_x(rs1);
                        s.tlb.flush_vaddr(vaddr);
                    } else {
                        s.tlb.flush_all();
                    }
                } else {
                    match insn {
                        INSN_ECALL => {
                            return Err(match s.iflags.prv {
                                Mode::User => Trap::EnvironmentCallFromU,
                                Mode::Supervisor => Trap::EnvironmentCallFromS,
                                Mode::Machine => Trap::EnvironmentCallFromM,
                            })
                        }
                        INSN_EBREAK => return Err(Trap::Breakpoint),
                        INSN_WFI => {
                            // Stall unless something is already pending. The
                            // caller fast-forwards mcycle to the wake point.
                            if s.mip & s.mie == 0 {
                                return Ok(StepOutcome::Waiting);
                            }
                        }
                        INSN_MRET => {
                            if s.iflags.prv != Mode::Machine {
                                return Err(Trap::IllegalInstruction(insn as u64));
                            }
                            let mut mstatus = s.mstatus;
                            let mpp = Mode::from_prv((mstatus & MSTATUS_MPP_MASK) >> MSTATUS_MPP_SHIFT);
                            let mpie = (mstatus >> 7) & 1;
                            mstatus = (mstatus & !MSTATUS_MIE) | (mpie << 3);
                            mstatus |= MSTATUS_MPIE;
                            mstatus &= !MSTATUS_MPP_MASK;
                            if mpp != Mode::Machine {
                                mstatus &= !MSTATUS_MPRV;
                            }
                            s.mstatus = mstatus;
                            s.set_mode(mpp);
                            next_pc = s.mepc;
                        }
                        INSN_SRET => {
                            if s.iflags.prv != Mode::Supervisor {
                                return Err(Trap::IllegalInstruction(insn as u64));
                            }
                            let mut mstatus = s.mstatus;
                            let spp = (mstatus >> 8) & 1;
                            let spie = (mstatus >> 5) & 1;
                            mstatus = (mstatus & !MSTATUS_SIE) | (spie << 1);
                            mstatus |= MSTATUS_SPIE;
                            mstatus &= !MSTATUS_SPP;
                            mstatus &= !MSTATUS_MPRV;
                            s.mstatus = mstatus;
                            s.set_mode(if spp == 0 { Mode::User } else { Mode::Supervisor });
                            next_pc = s.sepc;
                        }
                        _ => return Err(Trap::IllegalInstruction(insn as u64)),
                    }
                }
            }
            1 | 2 | 3 | 5 | 6 | 7 => {
                exec_csr(s, insn, rd, rs1, funct3, imm)?;
            }
            _ => return Err(Trap::IllegalInstruction(insn as u64)),
        },
        Op::Fence => {
            // FENCE and FENCE.I are no-ops on a single in-order hart whose
            // fetch cache maps addresses, not contents.
        }
    }

    s.pc = next_pc;
    Ok(StepOutcome::Retired)
}

fn alu64(a: u64, b: u64, funct3: u32, funct7: u32) -> Option<u64> {
    Some(match (funct3, funct7) {
        (0, 0x00) => a.wrapping_add(b),
        (0, 0x20) => a.wrapping_sub(b),
        (1, 0x00) => a << (b & 0x3F),
        (2, 0x00) => ((a as i64) < (b as i64)) as u64,
        (3, 0x00) => (a < b) as u64,
        (4, 0x00) => a ^ b,
        (5, 0x00) => a >> (b & 0x3F),
        (5, 0x20) => ((a as i64) >> (b & 0x3F)) as u64,
        (6, 0x00) => a | b,
        (7, 0x00) => a & b,

        // M extension. Division by zero and overflow follow the RISC-V
        // fixed results: div -> -1/max, rem -> dividend.
        (0, 0x01) => ((a as i64 as i128).wrapping_mul(b as i64 as i128)) as u64,
        (1, 0x01) => (((a as i64 as i128).wrapping_mul(b as i64 as i128)) >> 64) as u64,
        (2, 0x01) => (((a as i64 as i128).wrapping_mul(b as u128 as i128)) >> 64) as u64,
        (3, 0x01) => (((a as u128).wrapping_mul(b as u128)) >> 64) as u64,
        (4, 0x01) => {
            let (a, b) = (a as i64, b as i64);
            if b == 0 {
                -1i64 as u64
            } else if a == i64::MIN && b == -1 {
                i64::MIN as u64
            } else {
                (a / b) as u64
            }
        }
        (5, 0x01) => {
            if b == 0 {
                u64::MAX
            } else {
                a / b
            }
        }
        (6, 0x01) => {
            let (a, b) = (a as i64, b as i64);
            if b == 0 {
                a as u64
            } else if a == i64::MIN && b == -1 {
                0
            } else {
                (a % b) as u64
            }
        }
        (7, 0x01) => {
            if b == 0 {
                a
            } else {
                a % b
            }
        }
        _ => return None,
    })
}

fn alu32(a: u64, b: u64, funct3: u32, funct7: u32) -> Option<u64> {
    Some(match (funct3, funct7) {
        (0, 0x00) => a.wrapping_add(b) as i32 as i64 as u64,
        (0, 0x20) => a.wrapping_sub(b) as i32 as i64 as u64,
        (1, 0x00) => ((a as u32) << (b & 0x1F)) as i32 as i64 as u64,
        (5, 0x00) => ((a as u32) >> (b & 0x1F)) as i32 as i64 as u64,
        (5, 0x20) => ((a as i32) >> (b & 0x1F)) as i64 as u64,

        (0, 0x01) => (a as i32 as i64).wrapping_mul(b as i32 as i64) as i32 as i64 as u64,
        (4, 0x01) => {
            let (a, b) = (a as i32, b as i32);
            let q = if b == 0 {
                -1i32
            } else if a == i32::MIN && b == -1 {
                i32::MIN
            } else {
                a / b
            };
            q as i64 as u64
        }
        (5, 0x01) => {
            let (a, b) = (a as u32, b as u32);
            let q = if b == 0 { u32::MAX } else { a / b };
            q as i32 as i64 as u64
        }
        (6, 0x01) => {
            let (a, b) = (a as i32, b as i32);
            let r = if b == 0 {
                a
            } else if a == i32::MIN && b == -1 {
                0
            } else {
                a % b
            };
            r as i64 as u64
        }
        (7, 0x01) => {
            let (a, b) = (a as u32, b as u32);
            let r = if b == 0 { a } else { a % b };
            r as i32 as i64 as u64
        }
        _ => return None,
    })
}

fn exec_amo(
    s: &mut MachineState,
    insn: u32,
    rd: u32,
    rs1: u32,
    rs2: u32,
    funct3: u32,
    funct5: u32,
) -> Result<(), Trap> {
    let is_word = match funct3 {
        2 => true,
        3 => false,
        _ => return Err(Trap::IllegalInstruction(insn as u64)),
    };
    let log2 = funct3;
    let vaddr = s.read_x(rs1);
    if vaddr & ((1 << log2) - 1) != 0 {
        return Err(Trap::StoreAddressMisaligned(vaddr));
    }

    match funct5 {
        0b00010 => {
            // LR: a load that records the reservation in ilrsc.
            if rs2 != 0 {
                return Err(Trap::IllegalInstruction(insn as u64));
            }
            let paddr = mmu::translate(s, vaddr, AccessType::Load)?;
            let val = bus::read_phys(s, paddr, log2).map_err(|t| remap_load_fault(t, vaddr))?;
            let val = if is_word { val as i32 as i64 as u64 } else { val };
            s.write_x(rd, val);
            s.ilrsc = paddr;
        }
        0b00011 => {
            // SC: succeeds only while the reservation matches.
            let paddr = amo_translate(s, vaddr)?;
            if s.ilrsc == paddr {
                let val = s.read_x(rs2);
                bus::write_phys(s, paddr, val, log2).map_err(|t| remap_store_fault(t, vaddr))?;
                s.write_x(rd, 0);
            } else {
                s.write_x(rd, 1);
            }
            s.ilrsc = u64::MAX;
        }
        0b00001 | 0b00000 | 0b00100 | 0b01000 | 0b01100 | 0b10000 | 0b10100 | 0b11000
        | 0b11100 => {
            let paddr = amo_translate(s, vaddr)?;
            let old_raw = bus::read_phys(s, paddr, log2).map_err(|t| remap_store_fault(t, vaddr))?;
            let old = if is_word { old_raw as i32 as i64 as u64 } else { old_raw };
            let b = s.read_x(rs2);
            let new = match funct5 {
                0b00001 => b,
                0b00000 => old.wrapping_add(b),
                0b00100 => old ^ b,
                0b01000 => old | b,
                0b01100 => old & b,
                0b10000 => {
                    if (old as i64) < (b as i64) {
                        old
                    } else {
                        b
                    }
                }
                0b10100 => {
                    if (old as i64) > (b as i64) {
                        old
                    } else {
                        b
                    }
                }
                0b11000 => {
                    if old < b {
                        old
                    } else {
                        b
                    }
                }
                0b11100 => {
                    if old > b {
                        old
                    } else {
                        b
                    }
                }
                _ => unreachable!(),
            };
            bus::write_phys(s, paddr, new, log2).map_err(|t| remap_store_fault(t, vaddr))?;
            s.write_x(rd, old);
        }
        _ => return Err(Trap::IllegalInstruction(insn as u64)),
    }
    Ok(())
}

fn exec_csr(
    s: &mut MachineState,
    insn: u32,
    rd: u32,
    rs1: u32,
    funct3: u32,
    imm: u32,
) -> Result<(), Trap> {
    let csr_addr = imm & 0xFFF;
    let old = csr_read(s, csr_addr)?;

    let operand = if funct3 >= 5 { rs1 as u64 } else { s.read_x(rs1) };
    let write_new = match funct3 & 0x3 {
        // CSRRW/CSRRWI always write.
        1 => Some(operand),
        // CSRRS/CSRRC only write for a nonzero operand register/immediate.
        2 => (rs1 != 0).then_some(old | operand),
        3 => (rs1 != 0).then_some(old & !operand),
        _ => unreachable!(),
    };

    if let Some(new) = write_new {
        csr_write(s, csr_addr, new)?;
    }
    s.write_x(rd, old);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pma::{MemoryRange, PmaEntry, PMA_FLAG_E, PMA_FLAG_R, PMA_FLAG_W, RAM_START};

    fn encode_i(imm: i32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
        (((imm as u32) & 0xFFF) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
    }

    fn encode_r(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
        (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
    }

    fn encode_amo(funct5: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32) -> u32 {
        encode_r(funct5 << 2, rs2, rs1, funct3, rd, 0x2F)
    }

    fn make_state() -> MachineState {
        let mut s = MachineState::new();
        let ram = MemoryRange::new(0x10000);
        s.pmas
            .insert(
                PmaEntry::new_memory(RAM_START, 0x10000, PMA_FLAG_R | PMA_FLAG_W | PMA_FLAG_E, ram)
                    .unwrap(),
            )
            .unwrap();
        s.pc = RAM_START;
        s
    }

    fn put_insn(s: &mut MachineState, addr: u64, insn: u32) {
        bus::write_phys(s, addr, insn as u64, 2).unwrap();
    }

    #[test]
    fn addi_retires_and_counts() {
        let mut s = make_state();
        put_insn(&mut s, RAM_START, encode_i(-1, 0, 0, 1, 0x13));
        assert_eq!(step(&mut s), StepOutcome::Retired);
        assert_eq!(s.read_x(1), u64::MAX);
        assert_eq!(s.mcycle, 1);
        assert_eq!(s.icycleinstret, 1);
        assert_eq!(s.pc, RAM_START + 4);
    }

    #[test]
    fn x0_stays_zero() {
        let mut s = make_state();
        put_insn(&mut s, RAM_START, encode_i(42, 0, 0, 0, 0x13));
        step(&mut s);
        assert_eq!(s.read_x(0), 0);
    }

    #[test]
    fn div_by_zero_follows_spec() {
        assert_eq!(alu64(10, 0, 4, 0x01), Some(u64::MAX)); // div -> -1
        assert_eq!(alu64(10, 0, 6, 0x01), Some(10)); // rem -> dividend
        assert_eq!(alu64(i64::MIN as u64, -1i64 as u64, 4, 0x01), Some(i64::MIN as u64));
        assert_eq!(alu64(i64::MIN as u64, -1i64 as u64, 6, 0x01), Some(0));
        assert_eq!(alu64(10, 0, 5, 0x01), Some(u64::MAX)); // divu -> max
    }

    #[test]
    fn illegal_instruction_traps_to_mtvec() {
        let mut s = make_state();
        s.mtvec = RAM_START + 0x100;
        put_insn(&mut s, RAM_START, 0xFFFF_FFFF);
        step(&mut s);
        assert_eq!(s.pc, RAM_START + 0x100);
        assert_eq!(s.mcause, 2);
        assert_eq!(s.mepc, RAM_START);
        // The trapping step still consumes one cycle.
        assert_eq!(s.mcycle, 1);
    }

    #[test]
    fn ecall_cause_tracks_privilege() {
        let mut s = make_state();
        s.mtvec = RAM_START + 0x100;
        put_insn(&mut s, RAM_START, INSN_ECALL);
        step(&mut s);
        assert_eq!(s.mcause, 11);
        assert_eq!(s.mstatus & MSTATUS_MPP_MASK, 0b11 << MSTATUS_MPP_SHIFT);
    }

    #[test]
    fn lr_sc_roundtrip() {
        let mut s = make_state();
        let addr = RAM_START + 0x200;
        bus::write_phys(&mut s, addr, 7, 3).unwrap();
        s.write_x(5, addr);
        s.write_x(6, 99);

        put_insn(&mut s, RAM_START, encode_amo(0b00010, 0, 5, 3, 10)); // lr.d x10,(x5)
        put_insn(&mut s, RAM_START + 4, encode_amo(0b00011, 6, 5, 3, 11)); // sc.d x11,x6,(x5)
        step(&mut s);
        assert_eq!(s.read_x(10), 7);
        assert_eq!(s.ilrsc, addr);
        step(&mut s);
        assert_eq!(s.read_x(11), 0);
        assert_eq!(bus::read_phys(&mut s, addr, 3).unwrap(), 99);
        assert_eq!(s.ilrsc, u64::MAX);
    }

    #[test]
    fn sc_without_reservation_fails() {
        let mut s = make_state();
        let addr = RAM_START + 0x200;
        bus::write_phys(&mut s, addr, 7, 3).unwrap();
        s.write_x(5, addr);
        s.write_x(6, 99);
        put_insn(&mut s, RAM_START, encode_amo(0b00011, 6, 5, 3, 11));
        step(&mut s);
        assert_eq!(s.read_x(11), 1);
        assert_eq!(bus::read_phys(&mut s, addr, 3).unwrap(), 7);
    }

    #[test]
    fn amoadd_returns_old_value() {
        let mut s = make_state();
        let addr = RAM_START + 0x300;
        bus::write_phys(&mut s, addr, 40, 3).unwrap();
        s.write_x(5, addr);
        s.write_x(6, 2);
        put_insn(&mut s, RAM_START, encode_amo(0b00000, 6, 5, 3, 10));
        step(&mut s);
        assert_eq!(s.read_x(10), 40);
        assert_eq!(bus::read_phys(&mut s, addr, 3).unwrap(), 42);
    }

    #[test]
    fn wfi_stalls_until_interrupt_pending() {
        let mut s = make_state();
        put_insn(&mut s, RAM_START, INSN_WFI);
        s.mie = MIP_MTIP;
        s.clint.mtimecmp = 1000;
        assert_eq!(step(&mut s), StepOutcome::Waiting);
        assert_eq!(s.mcycle, 0);
        assert_eq!(s.pc, RAM_START);

        // Once the timer fires the same instruction completes as a no-op.
        s.clint.mtimecmp = 0;
        assert_eq!(step(&mut s), StepOutcome::Retired);
        assert!(s.mip & MIP_MTIP != 0);
    }

    #[test]
    fn csrrw_reads_old_writes_new() {
        let mut s = make_state();
        s.mscratch = 0x123;
        s.write_x(5, 0x456);
        put_insn(&mut s, RAM_START, encode_i(CSR_MSCRATCH as i32, 5, 1, 6, 0x73));
        step(&mut s);
        assert_eq!(s.read_x(6), 0x123);
        assert_eq!(s.mscratch, 0x456);
    }

    #[test]
    fn csr_priv_enforced_in_user_mode() {
        let mut s = make_state();
        s.mtvec = RAM_START + 0x100;
        s.set_mode(Mode::User);
        put_insn(&mut s, RAM_START, encode_i(CSR_MSCRATCH as i32, 5, 1, 6, 0x73));
        step(&mut s);
        assert_eq!(s.mcause, 2); // illegal instruction
    }

    #[test]
    fn timer_interrupt_taken_when_enabled() {
        let mut s = make_state();
        s.mtvec = RAM_START + 0x100;
        s.mie = MIP_MTIP;
        s.mstatus |= MSTATUS_MIE;
        s.clint.mtimecmp = 0;
        put_insn(&mut s, RAM_START, encode_i(0, 0, 0, 0, 0x13));
        step(&mut s);
        assert_eq!(s.mcause, (1 << 63) | 7);
        assert_eq!(s.pc, RAM_START + 0x100);
    }

    #[test]
    fn mret_restores_privilege_and_pc() {
        let mut s = make_state();
        s.mepc = RAM_START + 0x40;
        // MPP = U, MPIE = 1
        s.mstatus = (s.mstatus & !MSTATUS_MPP_MASK) | MSTATUS_MPIE;
        put_insn(&mut s, RAM_START, INSN_MRET);
        step(&mut s);
        assert_eq!(s.pc, RAM_START + 0x40);
        assert_eq!(s.iflags.prv, Mode::User);
        assert!(s.mstatus & MSTATUS_MIE != 0);
    }
}
