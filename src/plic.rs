use crate::bus::PagePeek;
use crate::cpu::MachineState;
use crate::csr::{MIP_MEIP, MIP_SEIP};
use crate::pma::PMA_PAGE_SIZE;

pub const PLIC_MAX_IRQ: u32 = 31;
/// First interrupt source assigned to VirtIO slots.
pub const VIRTIO_IRQ_BASE: u32 = 1;

// Register offsets relative to the PLIC PMA start. Priorities are WARL
// constants (every valid source has priority 1), so the only mutable state
// is the pending/served bitmap pair.
pub const PLIC_PRIORITY_END: u64 = 0x1000;
pub const PLIC_PENDING: u64 = 0x1000;
pub const PLIC_SERVED: u64 = 0x1008;
pub const PLIC_ENABLE_BASE: u64 = 0x2000;
pub const PLIC_ENABLE_END: u64 = 0x2100;
pub const PLIC_CTX_BASE: u64 = 0x20_0000;
pub const PLIC_CTX_STRIDE: u64 = 0x1000;
const PLIC_NUM_CTX: u64 = 2;

/// PLIC state: one bit per source in each bitmap. Source 0 is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlicState {
    pub girqpend: u64,
    pub girqsrvd: u64,
}

impl PlicState {
    pub fn new() -> Self {
        PlicState { girqpend: 0, girqsrvd: 0 }
    }
}

impl Default for PlicState {
    fn default() -> Self {
        Self::new()
    }
}

/// Recompute the external interrupt lines from the bitmaps: any pending,
/// unserved source raises both MEIP and SEIP.
pub fn update_mip(s: &mut MachineState) {
    if s.plic.girqpend & !s.plic.girqsrvd != 0 {
        s.mip |= MIP_MEIP | MIP_SEIP;
    } else {
        s.mip &= !(MIP_MEIP | MIP_SEIP);
    }
}

/// Assert an interrupt source (devices call this from their poll hooks).
pub fn raise(s: &mut MachineState, source: u32) {
    if source >= 1 && source <= PLIC_MAX_IRQ {
        s.plic.girqpend |= 1 << source;
        update_mip(s);
    }
}

fn claim(s: &mut MachineState) -> u64 {
    let eligible = s.plic.girqpend & !s.plic.girqsrvd;
    if eligible == 0 {
        return 0;
    }
    let source = eligible.trailing_zeros() as u64;
    s.plic.girqpend &= !(1 << source);
    s.plic.girqsrvd |= 1 << source;
    update_mip(s);
    source
}

fn complete(s: &mut MachineState, source: u64) {
    if source >= 1 && source <= PLIC_MAX_IRQ as u64 {
        s.plic.girqsrvd &= !(1 << source);
        update_mip(s);
    }
}

/// PLIC MMIO read; registers are 32-bit.
pub fn mmio_read(s: &mut MachineState, offset: u64, log2: u32) -> Option<u64> {
    if log2 != 2 || offset & 3 != 0 {
        return None;
    }
    if offset < PLIC_PRIORITY_END {
        let source = (offset / 4) as u32;
        let prio = if source >= 1 && source <= PLIC_MAX_IRQ { 1 } else { 0 };
        return Some(prio);
    }
    match offset {
        PLIC_PENDING => return Some(s.plic.girqpend & 0xFFFF_FFFF),
        PLIC_SERVED => return Some(s.plic.girqsrvd & 0xFFFF_FFFF),
        _ => {}
    }
    if (PLIC_ENABLE_BASE..PLIC_ENABLE_END).contains(&offset) {
        // Every valid source is permanently enabled for both contexts.
        return Some(!1u64 & 0xFFFF_FFFF);
    }
    if offset >= PLIC_CTX_BASE {
        let ctx = (offset - PLIC_CTX_BASE) / PLIC_CTX_STRIDE;
        let reg = (offset - PLIC_CTX_BASE) % PLIC_CTX_STRIDE;
        if ctx < PLIC_NUM_CTX {
            match reg {
                0 => return Some(0), // threshold is fixed at 0
                4 => return Some(claim(s)),
                _ => {}
            }
        }
    }
    None
}

/// PLIC MMIO write; priority/threshold/enable are WARL constants, so only
/// claim-complete has an effect.
pub fn mmio_write(s: &mut MachineState, offset: u64, val: u64, log2: u32) -> bool {
    if log2 != 2 || offset & 3 != 0 {
        return false;
    }
    if offset < PLIC_PRIORITY_END || (PLIC_ENABLE_BASE..PLIC_ENABLE_END).contains(&offset) {
        return true;
    }
    if offset == PLIC_PENDING || offset == PLIC_SERVED {
        // Bitmaps are read-only to the guest.
        return true;
    }
    if offset >= PLIC_CTX_BASE {
        let ctx = (offset - PLIC_CTX_BASE) / PLIC_CTX_STRIDE;
        let reg = (offset - PLIC_CTX_BASE) % PLIC_CTX_STRIDE;
        if ctx < PLIC_NUM_CTX {
            match reg {
                0 => return true,
                4 => {
                    complete(s, val & 0xFFFF);
                    return true;
                }
                _ => {}
            }
        }
    }
    false
}

/// Only the page holding the two bitmaps is ever non-pristine.
pub fn peek(s: &MachineState, page_offset: u64, scratch: &mut [u8]) -> PagePeek {
    if page_offset != PLIC_PENDING & !(PMA_PAGE_SIZE - 1) {
        return PagePeek::Pristine;
    }
    if s.plic.girqpend == 0 && s.plic.girqsrvd == 0 {
        return PagePeek::Pristine;
    }
    scratch.fill(0);
    scratch[0..8].copy_from_slice(&s.plic.girqpend.to_le_bytes());
    scratch[8..16].copy_from_slice(&s.plic.girqsrvd.to_le_bytes());
    PagePeek::Data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_claim_complete_cycle() {
        let mut s = MachineState::new();
        raise(&mut s, 3);
        assert_eq!(s.plic.girqpend, 1 << 3);
        assert!(s.mip & MIP_MEIP != 0 && s.mip & MIP_SEIP != 0);

        // Claim returns the lowest eligible source and marks it served.
        let id = mmio_read(&mut s, PLIC_CTX_BASE + 4, 2).unwrap();
        assert_eq!(id, 3);
        assert_eq!(s.plic.girqpend, 0);
        assert_eq!(s.plic.girqsrvd, 1 << 3);
        assert_eq!(s.mip & (MIP_MEIP | MIP_SEIP), 0);

        // Nothing else pending: claim yields 0.
        assert_eq!(mmio_read(&mut s, PLIC_CTX_BASE + 4, 2).unwrap(), 0);

        assert!(mmio_write(&mut s, PLIC_CTX_BASE + 4, 3, 2));
        assert_eq!(s.plic.girqsrvd, 0);
    }

    #[test]
    fn lowest_source_claimed_first() {
        let mut s = MachineState::new();
        raise(&mut s, 7);
        raise(&mut s, 2);
        assert_eq!(mmio_read(&mut s, PLIC_CTX_BASE + 4, 2).unwrap(), 2);
        assert_eq!(mmio_read(&mut s, PLIC_CTX_BASE + 4, 2).unwrap(), 7);
    }

    #[test]
    fn served_source_does_not_reassert_meip() {
        let mut s = MachineState::new();
        raise(&mut s, 5);
        mmio_read(&mut s, PLIC_CTX_BASE + 4, 2).unwrap();
        // Device line still high: pend again while served.
        raise(&mut s, 5);
        assert_eq!(s.mip & (MIP_MEIP | MIP_SEIP), 0);
        // Completion re-evaluates and MEIP comes back.
        mmio_write(&mut s, PLIC_CTX_BASE + 4, 5, 2);
        assert!(s.mip & MIP_MEIP != 0);
    }

    #[test]
    fn source_zero_is_reserved() {
        let mut s = MachineState::new();
        raise(&mut s, 0);
        assert_eq!(s.plic.girqpend, 0);
    }
}
