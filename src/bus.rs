use crate::cpu::MachineState;
use crate::pma::{DriverId, PMA_PAGE_SIZE};
use crate::{clint, htif, plic, shadow, Trap};

/// Result of peeking one page of a PMA for hashing purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagePeek {
    /// The page is all zeros; the caller can use the precomputed zero hash.
    Pristine,
    /// The page image was written into the caller's scratch buffer.
    Data,
}

fn check_alignment(paddr: u64, log2: u32) -> bool {
    log2 <= 3 && paddr & ((1 << log2) - 1) == 0
}

/// Read `1 << log2` bytes from the physical address space.
///
/// The access must be naturally aligned and fully contained in a single
/// readable PMA; anything else is a load access fault carrying the physical
/// address (callers translating virtual accesses rewrite it to the vaddr).
pub fn read_phys(s: &mut MachineState, paddr: u64, log2: u32) -> Result<u64, Trap> {
    if !check_alignment(paddr, log2) {
        return Err(Trap::LoadAddressMisaligned(paddr));
    }
    let len = 1u64 << log2;
    let idx = s.pmas.find(paddr, len).ok_or(Trap::LoadAccessFault(paddr))?;
    let entry = s.pmas.entry(idx);
    if !entry.is_readable() {
        return Err(Trap::LoadAccessFault(paddr));
    }
    let offset = paddr - entry.start;
    let driver = entry.driver;
    match driver {
        DriverId::Memory => {
            let mem = s.pmas.entry(idx).memory.as_ref().expect("memory PMA without backing");
            Ok(read_le(&mem.bytes()[offset as usize..], log2))
        }
        DriverId::Shadow => shadow::read(s, offset, log2).ok_or(Trap::LoadAccessFault(paddr)),
        DriverId::UarchShadow => {
            shadow::uarch_read(s, offset, log2).ok_or(Trap::LoadAccessFault(paddr))
        }
        DriverId::Clint => clint::mmio_read(s, offset, log2).ok_or(Trap::LoadAccessFault(paddr)),
        DriverId::Htif => htif::mmio_read(s, offset, log2).ok_or(Trap::LoadAccessFault(paddr)),
        DriverId::Plic => plic::mmio_read(s, offset, log2).ok_or(Trap::LoadAccessFault(paddr)),
        DriverId::Virtio(k) => {
            let dev = s
                .virtio_devices
                .get_mut(k as usize)
                .ok_or(Trap::LoadAccessFault(paddr))?;
            dev.read(offset, log2).ok_or(Trap::LoadAccessFault(paddr))
        }
    }
}

/// Write `1 << log2` bytes to the physical address space.
///
/// Stores into memory ranges mark the containing page dirty so the Merkle
/// tree rehashes it on the next update.
pub fn write_phys(s: &mut MachineState, paddr: u64, val: u64, log2: u32) -> Result<(), Trap> {
    if !check_alignment(paddr, log2) {
        return Err(Trap::StoreAddressMisaligned(paddr));
    }
    let len = 1u64 << log2;
    let idx = s.pmas.find(paddr, len).ok_or(Trap::StoreAccessFault(paddr))?;
    let entry = s.pmas.entry(idx);
    if !entry.is_writable() {
        return Err(Trap::StoreAccessFault(paddr));
    }
    let offset = paddr - entry.start;
    let driver = entry.driver;
    match driver {
        DriverId::Memory => {
            let mem = s.pmas.entry_mut(idx).memory.as_mut().expect("memory PMA without backing");
            write_le(&mut mem.bytes_mut()[offset as usize..], val, log2);
            mem.mark_dirty_page(offset);
            Ok(())
        }
        // The processor shadows accept no stores from the guest; they are
        // written only through the uarch state access.
        DriverId::Shadow | DriverId::UarchShadow => Err(Trap::StoreAccessFault(paddr)),
        DriverId::Clint => {
            clint::mmio_write(s, offset, val, log2).then_some(()).ok_or(Trap::StoreAccessFault(paddr))
        }
        DriverId::Htif => {
            htif::mmio_write(s, offset, val, log2).then_some(()).ok_or(Trap::StoreAccessFault(paddr))
        }
        DriverId::Plic => {
            plic::mmio_write(s, offset, val, log2).then_some(()).ok_or(Trap::StoreAccessFault(paddr))
        }
        DriverId::Virtio(k) => {
            let dev = s
                .virtio_devices
                .get_mut(k as usize)
                .ok_or(Trap::StoreAccessFault(paddr))?;
            let irq = dev.write(offset, val, log2).ok_or(Trap::StoreAccessFault(paddr))?;
            if irq {
                plic::raise(s, plic::VIRTIO_IRQ_BASE + k as u32);
            }
            Ok(())
        }
    }
}

/// Read a 16-bit instruction parcel. The containing PMA must be executable
/// memory; devices are never executable.
pub fn fetch_parcel(s: &mut MachineState, paddr: u64) -> Result<u16, Trap> {
    if paddr & 1 != 0 {
        return Err(Trap::InstructionAddressMisaligned(paddr));
    }
    let idx = s.pmas.find(paddr, 2).ok_or(Trap::InstructionAccessFault(paddr))?;
    let entry = s.pmas.entry(idx);
    if !entry.is_memory() || !entry.is_executable() {
        return Err(Trap::InstructionAccessFault(paddr));
    }
    let offset = (paddr - entry.start) as usize;
    let mem = entry.memory.as_ref().expect("memory PMA without backing");
    Ok(u16::from_le_bytes([mem.bytes()[offset], mem.bytes()[offset + 1]]))
}

/// Produce the image of one page of a PMA for hashing.
pub fn peek_page(
    s: &MachineState,
    pma_index: usize,
    page_offset: u64,
    scratch: &mut [u8],
) -> PagePeek {
    debug_assert_eq!(page_offset % PMA_PAGE_SIZE, 0);
    debug_assert_eq!(scratch.len() as u64, PMA_PAGE_SIZE);
    let entry = s.pmas.entry(pma_index);
    match entry.driver {
        DriverId::Memory => {
            let mem = entry.memory.as_ref().expect("memory PMA without backing");
            let bytes = &mem.bytes()[page_offset as usize..(page_offset + PMA_PAGE_SIZE) as usize];
            if bytes.iter().all(|&b| b == 0) {
                PagePeek::Pristine
            } else {
                scratch.copy_from_slice(bytes);
                PagePeek::Data
            }
        }
        DriverId::Shadow => shadow::peek(s, page_offset, scratch),
        DriverId::UarchShadow => shadow::uarch_peek(s, page_offset, scratch),
        DriverId::Clint => clint::peek(s, page_offset, scratch),
        DriverId::Htif => htif::peek(s, page_offset, scratch),
        DriverId::Plic => plic::peek(s, page_offset, scratch),
        // VirtIO devices only exist in unreproducible mode; their MMIO
        // window is committed as pristine.
        DriverId::Virtio(_) => PagePeek::Pristine,
    }
}

pub(crate) fn read_le(bytes: &[u8], log2: u32) -> u64 {
    match log2 {
        0 => bytes[0] as u64,
        1 => u16::from_le_bytes(bytes[..2].try_into().unwrap()) as u64,
        2 => u32::from_le_bytes(bytes[..4].try_into().unwrap()) as u64,
        3 => u64::from_le_bytes(bytes[..8].try_into().unwrap()),
        _ => unreachable!("unsupported access size"),
    }
}

pub(crate) fn write_le(bytes: &mut [u8], val: u64, log2: u32) {
    match log2 {
        0 => bytes[0] = val as u8,
        1 => bytes[..2].copy_from_slice(&(val as u16).to_le_bytes()),
        2 => bytes[..4].copy_from_slice(&(val as u32).to_le_bytes()),
        3 => bytes[..8].copy_from_slice(&val.to_le_bytes()),
        _ => unreachable!("unsupported access size"),
    }
}
