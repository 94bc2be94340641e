use crate::bus;
use crate::cpu::MachineState;
use crate::csr::{
    Mode, MSTATUS_MPP_MASK, MSTATUS_MPP_SHIFT, MSTATUS_MPRV, MSTATUS_MXR, MSTATUS_SUM,
    SATP_MODE_BARE, SATP_MODE_SHIFT, SATP_MODE_SV48, SATP_PPN_MASK,
};
use crate::pma::PMA_PAGE_SIZE;
use crate::Trap;

/// Kind of virtual access, which also selects the TLB consulted.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessType {
    Fetch,
    Load,
    Store,
}

pub const TLB_SIZE: usize = 256;

const PTE_V: u64 = 1 << 0;
const PTE_R: u64 = 1 << 1;
const PTE_W: u64 = 1 << 2;
const PTE_X: u64 = 1 << 3;
const PTE_U: u64 = 1 << 4;
const PTE_A: u64 = 1 << 6;
const PTE_D: u64 = 1 << 7;
const PTE_PPN_SHIFT: u32 = 10;
const PTE_PPN_MASK: u64 = 0xFFF_FFFF_FFFF;

const SV48_LEVELS: usize = 4;
const SV48_VA_BITS: u32 = 48;

/// One direct-mapped translation cache entry. A `vaddr_page` of `u64::MAX`
/// marks the entry invalid (no page can start there).
#[derive(Clone, Copy, Debug)]
pub struct TlbEntry {
    pub vaddr_page: u64,
    pub paddr_page: u64,
    pub pma_index: usize,
}

impl TlbEntry {
    const INVALID: TlbEntry = TlbEntry { vaddr_page: u64::MAX, paddr_page: u64::MAX, pma_index: usize::MAX };
}

/// The three per-kind TLBs, each indexed by `(vaddr >> 12) mod 256`.
pub struct TlbSet {
    read: [TlbEntry; TLB_SIZE],
    write: [TlbEntry; TLB_SIZE],
    fetch: [TlbEntry; TLB_SIZE],
}

impl TlbSet {
    pub fn new() -> Self {
        TlbSet {
            read: [TlbEntry::INVALID; TLB_SIZE],
            write: [TlbEntry::INVALID; TLB_SIZE],
            fetch: [TlbEntry::INVALID; TLB_SIZE],
        }
    }

    fn slot(&self, access: AccessType, vaddr: u64) -> &TlbEntry {
        let idx = ((vaddr >> 12) as usize) % TLB_SIZE;
        match access {
            AccessType::Load => &self.read[idx],
            AccessType::Store => &self.write[idx],
            AccessType::Fetch => &self.fetch[idx],
        }
    }

    fn slot_mut(&mut self, access: AccessType, vaddr: u64) -> &mut TlbEntry {
        let idx = ((vaddr >> 12) as usize) % TLB_SIZE;
        match access {
            AccessType::Load => &mut self.read[idx],
            AccessType::Store => &mut self.write[idx],
            AccessType::Fetch => &mut self.fetch[idx],
        }
    }

    pub fn lookup(&self, access: AccessType, vaddr: u64) -> Option<&TlbEntry> {
        let entry = self.slot(access, vaddr);
        if entry.vaddr_page == vaddr & !(PMA_PAGE_SIZE - 1) {
            Some(entry)
        } else {
            None
        }
    }

    pub fn insert(&mut self, access: AccessType, vaddr: u64, paddr: u64, pma_index: usize) {
        *self.slot_mut(access, vaddr) = TlbEntry {
            vaddr_page: vaddr & !(PMA_PAGE_SIZE - 1),
            paddr_page: paddr & !(PMA_PAGE_SIZE - 1),
            pma_index,
        };
    }

    /// Invalidate everything: satp writes, SFENCE.VMA with no operands,
    /// privilege changes.
    pub fn flush_all(&mut self) {
        self.read = [TlbEntry::INVALID; TLB_SIZE];
        self.write = [TlbEntry::INVALID; TLB_SIZE];
        self.fetch = [TlbEntry::INVALID; TLB_SIZE];
    }

    /// Invalidate the load/store TLBs only: MPRV/MXR/SUM changes do not
    /// affect fetch translation.
    pub fn flush_read_write(&mut self) {
        self.read = [TlbEntry::INVALID; TLB_SIZE];
        self.write = [TlbEntry::INVALID; TLB_SIZE];
    }

    /// Invalidate any entry mapping the page containing `vaddr`
    /// (SFENCE.VMA with rs1 != x0).
    pub fn flush_vaddr(&mut self, vaddr: u64) {
        let page = vaddr & !(PMA_PAGE_SIZE - 1);
        for tlb in [&mut self.read, &mut self.write, &mut self.fetch] {
            let entry = &mut tlb[((vaddr >> 12) as usize) % TLB_SIZE];
            if entry.vaddr_page == page {
                *entry = TlbEntry::INVALID;
            }
        }
    }

    /// Invalidate any entry whose translation lands in the physical page
    /// containing `paddr` (host-side writes into memory ranges).
    pub fn flush_paddr(&mut self, paddr: u64) {
        let page = paddr & !(PMA_PAGE_SIZE - 1);
        for tlb in [&mut self.read, &mut self.write, &mut self.fetch] {
            for entry in tlb.iter_mut() {
                if entry.paddr_page == page {
                    *entry = TlbEntry::INVALID;
                }
            }
        }
    }
}

impl Default for TlbSet {
    fn default() -> Self {
        Self::new()
    }
}

fn page_fault(access: AccessType, addr: u64) -> Trap {
    match access {
        AccessType::Fetch => Trap::InstructionPageFault(addr),
        AccessType::Load => Trap::LoadPageFault(addr),
        AccessType::Store => Trap::StorePageFault(addr),
    }
}

fn access_fault(access: AccessType, addr: u64) -> Trap {
    match access {
        AccessType::Fetch => Trap::InstructionAccessFault(addr),
        AccessType::Load => Trap::LoadAccessFault(addr),
        AccessType::Store => Trap::StoreAccessFault(addr),
    }
}

/// The privilege that governs this access. Loads and stores are demoted to
/// `mstatus.MPP` when `MPRV` is set; fetches always use the live privilege.
fn effective_mode(s: &MachineState, access: AccessType) -> Mode {
    if access != AccessType::Fetch && s.mstatus & MSTATUS_MPRV != 0 {
        Mode::from_prv((s.mstatus & MSTATUS_MPP_MASK) >> MSTATUS_MPP_SHIFT)
    } else {
        s.iflags.prv
    }
}

/// Translate a virtual address, consulting and filling the per-kind TLB.
pub fn translate(s: &mut MachineState, vaddr: u64, access: AccessType) -> Result<u64, Trap> {
    let mode = effective_mode(s, access);
    if mode == Mode::Machine || (s.satp >> SATP_MODE_SHIFT) == SATP_MODE_BARE {
        return Ok(vaddr);
    }

    if let Some(entry) = s.tlb.lookup(access, vaddr) {
        return Ok(entry.paddr_page | (vaddr & (PMA_PAGE_SIZE - 1)));
    }

    let paddr = walk(s, vaddr, access, mode)?;
    let pma_index = s.pmas.find(paddr & !(PMA_PAGE_SIZE - 1), PMA_PAGE_SIZE).unwrap_or(usize::MAX);
    s.tlb.insert(access, vaddr, paddr, pma_index);
    Ok(paddr)
}

/// Translate without touching the TLB. This is the reference translator used
/// by the host virtual-memory API; `translate` must agree with it for every
/// address.
pub fn translate_nofill(s: &mut MachineState, vaddr: u64, access: AccessType) -> Result<u64, Trap> {
    let mode = effective_mode(s, access);
    if mode == Mode::Machine || (s.satp >> SATP_MODE_SHIFT) == SATP_MODE_BARE {
        return Ok(vaddr);
    }
    walk(s, vaddr, access, mode)
}

/// Sv48 page-table walk with A/D updates.
fn walk(s: &mut MachineState, vaddr: u64, access: AccessType, mode: Mode) -> Result<u64, Trap> {
    if (s.satp >> SATP_MODE_SHIFT) != SATP_MODE_SV48 {
        // satp is WARL-restricted to Bare/Sv48, so this cannot happen from
        // guest writes; treat defensively as a fault.
        return Err(page_fault(access, vaddr));
    }

    // Canonical form: bits 63..48 must replicate bit 47.
    let upper_mask = !((1u64 << SV48_VA_BITS) - 1);
    let expected = if (vaddr >> (SV48_VA_BITS - 1)) & 1 == 1 { upper_mask } else { 0 };
    if vaddr & upper_mask != expected {
        return Err(page_fault(access, vaddr));
    }

    let mxr = s.mstatus & MSTATUS_MXR != 0;
    let sum = s.mstatus & MSTATUS_SUM != 0;

    let mut table = (s.satp & SATP_PPN_MASK) * PMA_PAGE_SIZE;
    for level in (0..SV48_LEVELS).rev() {
        let vpn = (vaddr >> (12 + 9 * level as u32)) & 0x1FF;
        let pte_addr = table + vpn * 8;
        let pte = bus::read_phys(s, pte_addr, 3).map_err(|_| access_fault(access, vaddr))?;

        let r = pte & PTE_R != 0;
        let w = pte & PTE_W != 0;
        let x = pte & PTE_X != 0;

        if pte & PTE_V == 0 || (!r && w) {
            return Err(page_fault(access, vaddr));
        }

        if !r && !x {
            // Pointer to the next level.
            if level == 0 {
                return Err(page_fault(access, vaddr));
            }
            table = ((pte >> PTE_PPN_SHIFT) & PTE_PPN_MASK) * PMA_PAGE_SIZE;
            continue;
        }

        // Leaf PTE: privilege and permission checks.
        let user = pte & PTE_U != 0;
        match mode {
            Mode::User => {
                if !user {
                    return Err(page_fault(access, vaddr));
                }
            }
            Mode::Supervisor => {
                if user && (access == AccessType::Fetch || !sum) {
                    return Err(page_fault(access, vaddr));
                }
            }
            Mode::Machine => {}
        }
        let allowed = match access {
            AccessType::Fetch => x,
            AccessType::Store => w,
            AccessType::Load => r || (mxr && x),
        };
        if !allowed {
            return Err(page_fault(access, vaddr));
        }

        // Misaligned superpage.
        let ppn = (pte >> PTE_PPN_SHIFT) & PTE_PPN_MASK;
        let low_mask = (1u64 << (9 * level as u32)) - 1;
        if ppn & low_mask != 0 {
            return Err(page_fault(access, vaddr));
        }

        // A/D updates are written back through the bus so the page-table
        // page is dirtied for the Merkle tree.
        let mut new_pte = pte | PTE_A;
        if access == AccessType::Store {
            new_pte |= PTE_D;
        }
        if new_pte != pte {
            bus::write_phys(s, pte_addr, new_pte, 3).map_err(|_| access_fault(access, vaddr))?;
        }

        let result_ppn = (ppn & !low_mask) | ((vaddr >> 12) & low_mask);
        return Ok((result_ppn << 12) | (vaddr & (PMA_PAGE_SIZE - 1)));
    }

    Err(page_fault(access, vaddr))
}
