use crate::bus::PagePeek;
use crate::cpu::MachineState;
use std::collections::VecDeque;

// tohost decodes as device:8 | cmd:8 | payload:48.
pub const HTIF_DEV_HALT: u64 = 0;
pub const HTIF_DEV_CONSOLE: u64 = 1;
pub const HTIF_DEV_YIELD: u64 = 2;

pub const HTIF_HALT_CMD_HALT: u64 = 0;
pub const HTIF_CONSOLE_CMD_GETCHAR: u64 = 0;
pub const HTIF_CONSOLE_CMD_PUTCHAR: u64 = 1;
pub const HTIF_YIELD_CMD_MANUAL: u64 = 0;
pub const HTIF_YIELD_CMD_AUTOMATIC: u64 = 1;

// Register offsets relative to the HTIF PMA start.
pub const HTIF_TOHOST: u64 = 0x0;
pub const HTIF_FROMHOST: u64 = 0x8;

const PAYLOAD_MASK: u64 = (1 << 48) - 1;

/// HTIF doorbell state. `ihalt`/`iconsole`/`iyield` are permission bitmaps
/// with one bit per command of the respective device.
pub struct HtifState {
    pub tohost: u64,
    pub fromhost: u64,
    pub ihalt: u64,
    pub iconsole: u64,
    pub iyield: u64,

    /// Host-queued console input. Not part of the committed state; console
    /// input is only legal in unreproducible mode anyway.
    pub console_input: VecDeque<u8>,
    /// Bytes emitted by putchar, drained by the host.
    pub console_output: Vec<u8>,
    /// A getchar request was acknowledged and awaits input.
    getchar_pending: bool,
}

impl HtifState {
    pub fn new() -> Self {
        HtifState {
            tohost: 0,
            fromhost: 0,
            ihalt: 0,
            iconsole: 0,
            iyield: 0,
            console_input: VecDeque::new(),
            console_output: Vec::new(),
            getchar_pending: false,
        }
    }

    pub fn halt_enabled(&self) -> bool {
        self.ihalt >> HTIF_HALT_CMD_HALT & 1 != 0
    }

    pub fn console_getchar_enabled(&self) -> bool {
        self.iconsole >> HTIF_CONSOLE_CMD_GETCHAR & 1 != 0
    }

    pub fn console_putchar_enabled(&self) -> bool {
        self.iconsole >> HTIF_CONSOLE_CMD_PUTCHAR & 1 != 0
    }
}

impl Default for HtifState {
    fn default() -> Self {
        Self::new()
    }
}

/// HTIF only answers aligned 64-bit reads of tohost and fromhost.
pub fn mmio_read(s: &mut MachineState, offset: u64, log2: u32) -> Option<u64> {
    if log2 != 3 {
        return None;
    }
    match offset {
        HTIF_TOHOST => Some(s.htif.tohost),
        HTIF_FROMHOST => Some(s.htif.fromhost),
        _ => None,
    }
}

pub fn mmio_write(s: &mut MachineState, offset: u64, val: u64, log2: u32) -> bool {
    if log2 != 3 {
        return false;
    }
    match offset {
        HTIF_TOHOST => {
            write_tohost(s, val);
            true
        }
        HTIF_FROMHOST => {
            s.htif.fromhost = val;
            // A zeroed fromhost re-opens the doorbell for pending input.
            if val == 0 {
                deliver_pending_input(s);
            }
            true
        }
        _ => false,
    }
}

fn write_tohost(s: &mut MachineState, val: u64) {
    s.htif.tohost = val;
    let device = val >> 56;
    let cmd = (val >> 48) & 0xFF;
    let payload = val & PAYLOAD_MASK;

    // Every command is gated by the matching bit of its device's
    // permission bitmap; a disabled command is ignored like an unknown one.
    match (device, cmd) {
        (HTIF_DEV_HALT, HTIF_HALT_CMD_HALT) if payload & 1 != 0 && s.htif.halt_enabled() => {
            // tohost keeps the payload so the host can read the exit status.
            s.iflags.h = true;
        }
        (HTIF_DEV_CONSOLE, HTIF_CONSOLE_CMD_PUTCHAR) if s.htif.console_putchar_enabled() => {
            s.htif.tohost = 0; // acknowledge
            s.htif.console_output.push(payload as u8);
            s.htif.fromhost = (HTIF_DEV_CONSOLE << 56) | (HTIF_CONSOLE_CMD_PUTCHAR << 48);
        }
        (HTIF_DEV_CONSOLE, HTIF_CONSOLE_CMD_GETCHAR) => {
            if s.htif.console_getchar_enabled() {
                s.htif.tohost = 0;
                s.htif.getchar_pending = true;
                deliver_pending_input(s);
            }
        }
        (HTIF_DEV_YIELD, cmd) if cmd < 64 && s.htif.iyield >> cmd & 1 != 0 => {
            s.htif.tohost = 0;
            s.htif.fromhost = (HTIF_DEV_YIELD << 56) | (cmd << 48);
            match cmd {
                HTIF_YIELD_CMD_MANUAL => s.iflags.y = true,
                HTIF_YIELD_CMD_AUTOMATIC => s.iflags.x = true,
                _ => {}
            }
        }
        // Unknown commands are silently ignored; tohost retains the value.
        _ => {}
    }
}

/// Complete an acknowledged getchar once input is available.
pub fn deliver_pending_input(s: &mut MachineState) {
    if !s.htif.getchar_pending || s.htif.fromhost != 0 {
        return;
    }
    if let Some(byte) = s.htif.console_input.pop_front() {
        s.htif.fromhost =
            (HTIF_DEV_CONSOLE << 56) | (HTIF_CONSOLE_CMD_GETCHAR << 48) | byte as u64;
        s.htif.getchar_pending = false;
    }
}

/// Page 0 carries tohost/fromhost; the rest of the range is pristine.
pub fn peek(s: &MachineState, page_offset: u64, scratch: &mut [u8]) -> PagePeek {
    if page_offset != 0 {
        return PagePeek::Pristine;
    }
    scratch.fill(0);
    scratch[HTIF_TOHOST as usize..8].copy_from_slice(&s.htif.tohost.to_le_bytes());
    scratch[HTIF_FROMHOST as usize..16].copy_from_slice(&s.htif.fromhost.to_le_bytes());
    PagePeek::Data
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tohost(dev: u64, cmd: u64, payload: u64) -> u64 {
        (dev << 56) | (cmd << 48) | (payload & PAYLOAD_MASK)
    }

    #[test]
    fn halt_sets_flag_and_keeps_payload() {
        let mut s = MachineState::new();
        s.htif.ihalt = 1 << HTIF_HALT_CMD_HALT;
        assert!(mmio_write(&mut s, HTIF_TOHOST, tohost(0, 0, 1), 3));
        assert!(s.iflags.h);
        assert_eq!(s.htif.tohost, 1);
    }

    #[test]
    fn even_halt_payload_is_ignored() {
        let mut s = MachineState::new();
        s.htif.ihalt = 1 << HTIF_HALT_CMD_HALT;
        mmio_write(&mut s, HTIF_TOHOST, tohost(0, 0, 2), 3);
        assert!(!s.iflags.h);
    }

    #[test]
    fn halt_needs_permission() {
        let mut s = MachineState::new();
        let cmd = tohost(0, 0, 1);
        mmio_write(&mut s, HTIF_TOHOST, cmd, 3);
        // ihalt has no bit for the command: the machine keeps running and
        // tohost retains the value like any other ignored command.
        assert!(!s.iflags.h);
        assert_eq!(s.htif.tohost, cmd);
    }

    #[test]
    fn putchar_acks_and_buffers_byte() {
        let mut s = MachineState::new();
        s.htif.iconsole = 1 << HTIF_CONSOLE_CMD_PUTCHAR;
        mmio_write(&mut s, HTIF_TOHOST, tohost(1, 1, 0x41), 3);
        assert_eq!(s.htif.tohost, 0);
        assert_eq!(s.htif.fromhost, (1 << 56) | (1 << 48));
        assert_eq!(s.htif.console_output, vec![b'A']);
    }

    #[test]
    fn putchar_needs_permission() {
        let mut s = MachineState::new();
        let cmd = tohost(1, 1, 0x41);
        mmio_write(&mut s, HTIF_TOHOST, cmd, 3);
        assert_eq!(s.htif.tohost, cmd);
        assert_eq!(s.htif.fromhost, 0);
        assert!(s.htif.console_output.is_empty());
    }

    #[test]
    fn getchar_needs_permission() {
        let mut s = MachineState::new();
        let cmd = tohost(1, 0, 0);
        mmio_write(&mut s, HTIF_TOHOST, cmd, 3);
        // Disabled: the command is ignored and tohost keeps the value.
        assert_eq!(s.htif.tohost, cmd);

        s.htif.iconsole = 1 << HTIF_CONSOLE_CMD_GETCHAR;
        s.htif.console_input.push_back(b'z');
        mmio_write(&mut s, HTIF_TOHOST, cmd, 3);
        assert_eq!(s.htif.tohost, 0);
        assert_eq!(s.htif.fromhost, (1 << 56) | b'z' as u64);
    }

    #[test]
    fn yield_manual_sets_y() {
        let mut s = MachineState::new();
        s.htif.iyield = 1 << HTIF_YIELD_CMD_MANUAL;
        mmio_write(&mut s, HTIF_TOHOST, tohost(2, 0, 0), 3);
        assert!(s.iflags.y);
        assert!(!s.iflags.x);
        assert_eq!(s.htif.fromhost, 2 << 56);
    }

    #[test]
    fn yield_automatic_requires_its_own_bit() {
        let mut s = MachineState::new();
        s.htif.iyield = 1 << HTIF_YIELD_CMD_MANUAL;
        let cmd = tohost(2, 1, 0);
        mmio_write(&mut s, HTIF_TOHOST, cmd, 3);
        assert!(!s.iflags.x);
        assert_eq!(s.htif.tohost, cmd);
    }

    #[test]
    fn narrow_access_faults() {
        let mut s = MachineState::new();
        assert_eq!(mmio_read(&mut s, HTIF_TOHOST, 2), None);
        assert!(!mmio_write(&mut s, HTIF_TOHOST, 1, 2));
    }
}
