use crate::access_log::{Access, AccessKind, AccessLog, LogType};
use crate::bus::{self, PagePeek};
use crate::clint;
use crate::config::{MachineConfig, MemoryRangeConfig, RuntimeConfig, FLASH_DRIVE_MAX};
use crate::cpu::{self, MachineState, StepOutcome};
use crate::csr::{Csr, Iflags, MIP_MTIP};
use crate::htif;
use crate::merkle::{
    hash_page, range_hash_in_page, word_hash, Hash, MerkleTree, Proof, LOG2_PAGE_SIZE,
    LOG2_ROOT_SIZE, LOG2_WORD_SIZE,
};
use crate::pma::{
    DriverId, MemoryRange, PmaEntry, CLINT_LENGTH, CLINT_START, HTIF_LENGTH, HTIF_START,
    PLIC_LENGTH, PLIC_START, PMA_FLAG_E, PMA_FLAG_IR, PMA_FLAG_IW, PMA_FLAG_R, PMA_FLAG_W,
    PMA_PAGE_SIZE, RAM_START, ROM_START, SHADOW_LENGTH, SHADOW_START, UARCH_RAM_MAX_LENGTH,
    UARCH_RAM_START, UARCH_REGION_LOG2_SIZE, UARCH_REGION_START, UARCH_SHADOW_LENGTH,
    UARCH_SHADOW_START, VIRTIO_START, VIRTIO_STRIDE,
};
use crate::shadow;
use crate::uarch::{self, DirectAccess, UarchProcessor, UarchStepStatus};
use crate::virtio::VirtioDevice;
use crate::{BreakReason, MachineError, UarchBreakReason};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const HALT_PAYLOAD_MASK: u64 = (1 << 48) - 1;
/// How many interpreter steps pass between host polls in a run.
const HOST_POLL_INTERVAL: u64 = 4096;

/// A complete machine: architectural state, its Merkle commitment, and the
/// host-facing lifecycle.
pub struct Machine {
    state: MachineState,
    tree: MerkleTree,
    config: MachineConfig,
    runtime: RuntimeConfig,
    uarch_initial: UarchProcessor,
    uarch_pristine_ram: Vec<u8>,
    break_request: Arc<AtomicBool>,
    #[cfg(unix)]
    console: Option<crate::console::Console>,
}

impl Machine {
    /// Build a machine from a configuration. Fails on any inconsistency;
    /// a partially constructed machine is never returned.
    pub fn create(config: MachineConfig, runtime: RuntimeConfig) -> Result<Self, MachineError> {
        let mut state = MachineState::new();

        // Processor state.
        let p = &config.processor;
        state.x = p.x;
        state.f = p.f;
        state.pc = p.pc;
        state.fcsr = p.fcsr;
        state.mvendorid = p.mvendorid;
        state.marchid = p.marchid;
        state.mimpid = p.mimpid;
        state.mcycle = p.mcycle;
        state.icycleinstret = p.icycleinstret;
        state.mstatus = p.mstatus;
        state.mtvec = p.mtvec;
        state.mscratch = p.mscratch;
        state.mepc = p.mepc;
        state.mcause = p.mcause;
        state.mtval = p.mtval;
        state.misa = p.misa;
        state.mie = p.mie;
        state.mip = p.mip;
        state.medeleg = p.medeleg;
        state.mideleg = p.mideleg;
        state.mcounteren = p.mcounteren;
        state.menvcfg = p.menvcfg;
        state.stvec = p.stvec;
        state.sscratch = p.sscratch;
        state.sepc = p.sepc;
        state.scause = p.scause;
        state.stval = p.stval;
        state.satp = p.satp;
        state.scounteren = p.scounteren;
        state.senvcfg = p.senvcfg;
        state.ilrsc = p.ilrsc;
        state.iflags = Iflags::unpack(p.iflags);
        state.iunrep = p.iunrep;

        // Device state.
        state.clint.mtimecmp = config.clint.mtimecmp;
        state.htif.tohost = config.htif.tohost;
        state.htif.fromhost = config.htif.fromhost;
        state.htif.ihalt = (config.htif.halt as u64) << htif::HTIF_HALT_CMD_HALT;
        state.htif.iconsole = ((config.htif.console_putchar as u64)
            << htif::HTIF_CONSOLE_CMD_PUTCHAR)
            | ((config.htif.console_getchar as u64) << htif::HTIF_CONSOLE_CMD_GETCHAR);
        state.htif.iyield = ((config.htif.yield_manual as u64) << htif::HTIF_YIELD_CMD_MANUAL)
            | ((config.htif.yield_automatic as u64) << htif::HTIF_YIELD_CMD_AUTOMATIC);
        state.plic.girqpend = config.plic.girqpend;
        state.plic.girqsrvd = config.plic.girqsrvd;

        // uarch processor.
        let up = &config.uarch.processor;
        state.uarch = UarchProcessor {
            x: up.x,
            pc: up.pc,
            cycle: up.cycle,
            halt_flag: up.halt_flag,
        };
        let uarch_initial = state.uarch;

        // Fixed IO ranges.
        state.pmas.insert(PmaEntry::new_io(SHADOW_START, SHADOW_LENGTH, PMA_FLAG_R, DriverId::Shadow)?)?;
        state.pmas.insert(PmaEntry::new_io(
            CLINT_START,
            CLINT_LENGTH,
            PMA_FLAG_R | PMA_FLAG_W,
            DriverId::Clint,
        )?)?;
        state.pmas.insert(PmaEntry::new_io(
            PLIC_START,
            PLIC_LENGTH,
            PMA_FLAG_R | PMA_FLAG_W,
            DriverId::Plic,
        )?)?;
        state.pmas.insert(PmaEntry::new_io(
            HTIF_START,
            HTIF_LENGTH,
            PMA_FLAG_R | PMA_FLAG_W,
            DriverId::Htif,
        )?)?;
        state.pmas.insert(PmaEntry::new_io(
            UARCH_SHADOW_START,
            UARCH_SHADOW_LENGTH,
            PMA_FLAG_R,
            DriverId::UarchShadow,
        )?)?;

        // ROM.
        if config.rom.length == 0 {
            return Err(MachineError::config("ROM length must not be zero"));
        }
        let mut rom = load_memory_range(config.rom.length, config.rom.image_filename.as_deref())?;
        if !config.rom.bootargs.is_empty() {
            let bytes = config.rom.bootargs.as_bytes();
            if config.rom.length < PMA_PAGE_SIZE || bytes.len() as u64 >= PMA_PAGE_SIZE {
                return Err(MachineError::config("bootargs do not fit in the ROM"));
            }
            let offset = (config.rom.length - PMA_PAGE_SIZE) as usize;
            rom.bytes_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
        state.pmas.insert(PmaEntry::new_memory(
            ROM_START,
            config.rom.length,
            PMA_FLAG_R | PMA_FLAG_E | PMA_FLAG_IR | PMA_FLAG_IW,
            rom,
        )?)?;

        // RAM.
        if config.ram.length == 0 {
            return Err(MachineError::config("RAM length must not be zero"));
        }
        let ram = load_memory_range(config.ram.length, config.ram.image_filename.as_deref())?;
        state.pmas.insert(PmaEntry::new_memory(
            RAM_START,
            config.ram.length,
            PMA_FLAG_R | PMA_FLAG_W | PMA_FLAG_E | PMA_FLAG_IR | PMA_FLAG_IW,
            ram,
        )?)?;

        // uarch RAM.
        if config.uarch.ram_length == 0 || config.uarch.ram_length > UARCH_RAM_MAX_LENGTH {
            return Err(MachineError::config(format!(
                "uarch RAM length {:#x} outside (0, {:#x}]",
                config.uarch.ram_length, UARCH_RAM_MAX_LENGTH
            )));
        }
        let uarch_ram =
            load_memory_range(config.uarch.ram_length, config.uarch.ram_image.as_deref())?;
        let uarch_pristine_ram = uarch_ram.bytes().to_vec();
        state.pmas.insert(PmaEntry::new_memory(
            UARCH_RAM_START,
            config.uarch.ram_length,
            PMA_FLAG_R | PMA_FLAG_W | PMA_FLAG_IR | PMA_FLAG_IW,
            uarch_ram,
        )?)?;

        // Flash drives.
        if config.flash_drives.len() > FLASH_DRIVE_MAX {
            return Err(MachineError::config(format!(
                "more than {} flash drives",
                FLASH_DRIVE_MAX
            )));
        }
        for drive in &config.flash_drives {
            if drive.start == 0 {
                return Err(MachineError::config("flash drive start address is required"));
            }
            let mut range = load_memory_range(drive.length, drive.image_filename.as_deref())?;
            range.shared = drive.shared;
            range.image_filename = drive.image_filename.clone();
            state.pmas.insert(PmaEntry::new_memory(
                drive.start,
                drive.length,
                PMA_FLAG_R | PMA_FLAG_W | PMA_FLAG_IR | PMA_FLAG_IW,
                range,
            )?)?;
        }

        // Rollup buffers.
        if let Some(rollup) = &config.rollup {
            for rc in rollup.ranges() {
                if rc.length == 0 {
                    return Err(MachineError::config("rollup range length must not be zero"));
                }
                let mut range = load_memory_range(rc.length, rc.image_filename.as_deref())?;
                range.shared = rc.shared;
                range.image_filename = rc.image_filename.clone();
                state.pmas.insert(PmaEntry::new_memory(
                    rc.start,
                    rc.length,
                    PMA_FLAG_R | PMA_FLAG_W | PMA_FLAG_IR | PMA_FLAG_IW,
                    range,
                )?)?;
            }
        }

        Ok(Machine {
            state,
            tree: MerkleTree::new(),
            config,
            runtime,
            uarch_initial,
            uarch_pristine_ram,
            break_request: Arc::new(AtomicBool::new(false)),
            #[cfg(unix)]
            console: None,
        })
    }

    /// Load a machine previously written by [`store`](Self::store).
    pub fn load(dir: &Path, runtime: RuntimeConfig) -> Result<Self, MachineError> {
        let text = std::fs::read_to_string(dir.join("config.json"))?;
        let mut config: MachineConfig = serde_json::from_str(&text)
            .map_err(|e| MachineError::Serialization(e.to_string()))?;

        let rebase = |p: &mut Option<PathBuf>| {
            if let Some(path) = p {
                if path.is_relative() {
                    *path = dir.join(&path);
                }
            }
        };
        rebase(&mut config.rom.image_filename);
        rebase(&mut config.ram.image_filename);
        rebase(&mut config.uarch.ram_image);
        for drive in &mut config.flash_drives {
            rebase(&mut drive.image_filename);
        }
        if let Some(rollup) = &mut config.rollup {
            rebase(&mut rollup.rx_buffer.image_filename);
            rebase(&mut rollup.tx_buffer.image_filename);
            rebase(&mut rollup.input_metadata.image_filename);
            rebase(&mut rollup.voucher_hashes.image_filename);
            rebase(&mut rollup.notice_hashes.image_filename);
        }

        Self::create(config, runtime)
    }

    /// Persist the machine: a `config.json` manifest plus one byte-exact
    /// image per memory range, named `{start:016x}-{length:016x}.bin`.
    pub fn store(&mut self, dir: &Path) -> Result<(), MachineError> {
        std::fs::create_dir_all(dir)?;

        let mut config = self.serialization_config();

        let bin_name = |start: u64, length: u64| format!("{:016x}-{:016x}.bin", start, length);
        for idx in 0..self.state.pmas.len() {
            let entry = self.state.pmas.entry(idx);
            if !entry.is_memory() {
                continue;
            }
            let (start, length) = (entry.start, entry.length);
            let mem = entry.memory.as_ref().expect("memory PMA without backing");
            let name = bin_name(start, length);
            std::fs::write(dir.join(&name), mem.bytes())?;

            // Shared ranges also flush back to their original image.
            if mem.shared {
                if let Some(image) = &mem.image_filename {
                    std::fs::write(image, mem.bytes())?;
                }
            }

            let stored = Some(PathBuf::from(name));
            if start == ROM_START {
                config.rom.image_filename = stored;
            } else if start == RAM_START {
                config.ram.image_filename = stored;
            } else if start == UARCH_RAM_START {
                config.uarch.ram_image = stored;
            } else {
                for drive in &mut config.flash_drives {
                    if drive.start == start && drive.length == length {
                        drive.image_filename = stored.clone();
                    }
                }
                if let Some(rollup) = &mut config.rollup {
                    for rc in [
                        &mut rollup.rx_buffer,
                        &mut rollup.tx_buffer,
                        &mut rollup.input_metadata,
                        &mut rollup.voucher_hashes,
                        &mut rollup.notice_hashes,
                    ] {
                        if rc.start == start && rc.length == length {
                            rc.image_filename = stored.clone();
                        }
                    }
                }
            }
        }

        // The stored ROM already contains the packed bootargs.
        config.rom.bootargs = String::new();

        let text = serde_json::to_string_pretty(&config)
            .map_err(|e| MachineError::Serialization(e.to_string()))?;
        std::fs::write(dir.join("config.json"), text)?;
        Ok(())
    }

    /// The live state rendered as a configuration (what `store` writes).
    pub fn serialization_config(&self) -> MachineConfig {
        let s = &self.state;
        let mut config = self.config.clone();
        let p = &mut config.processor;
        p.x = s.x;
        p.f = s.f;
        p.pc = s.pc;
        p.fcsr = s.fcsr;
        p.mvendorid = s.mvendorid;
        p.marchid = s.marchid;
        p.mimpid = s.mimpid;
        p.mcycle = s.mcycle;
        p.icycleinstret = s.icycleinstret;
        p.mstatus = s.mstatus;
        p.mtvec = s.mtvec;
        p.mscratch = s.mscratch;
        p.mepc = s.mepc;
        p.mcause = s.mcause;
        p.mtval = s.mtval;
        p.misa = s.misa;
        p.mie = s.mie;
        p.mip = s.mip;
        p.medeleg = s.medeleg;
        p.mideleg = s.mideleg;
        p.mcounteren = s.mcounteren;
        p.menvcfg = s.menvcfg;
        p.stvec = s.stvec;
        p.sscratch = s.sscratch;
        p.sepc = s.sepc;
        p.scause = s.scause;
        p.stval = s.stval;
        p.satp = s.satp;
        p.scounteren = s.scounteren;
        p.senvcfg = s.senvcfg;
        p.ilrsc = s.ilrsc;
        p.iflags = s.iflags.pack();
        p.iunrep = s.iunrep;
        config.clint.mtimecmp = s.clint.mtimecmp;
        config.htif.tohost = s.htif.tohost;
        config.htif.fromhost = s.htif.fromhost;
        // The permission bitmaps are host-writable registers, so the
        // stored config reads them back rather than trusting its originals.
        config.htif.halt = s.htif.halt_enabled();
        config.htif.console_getchar = s.htif.console_getchar_enabled();
        config.htif.console_putchar = s.htif.console_putchar_enabled();
        config.htif.yield_manual = s.htif.iyield >> htif::HTIF_YIELD_CMD_MANUAL & 1 != 0;
        config.htif.yield_automatic = s.htif.iyield >> htif::HTIF_YIELD_CMD_AUTOMATIC & 1 != 0;
        config.plic.girqpend = s.plic.girqpend;
        config.plic.girqsrvd = s.plic.girqsrvd;
        config.uarch.processor.x = s.uarch.x;
        config.uarch.processor.pc = s.uarch.pc;
        config.uarch.processor.cycle = s.uarch.cycle;
        config.uarch.processor.halt_flag = s.uarch.halt_flag;
        config
    }

    // ---- Execution ---------------------------------------------------------

    /// Advance the machine until it halts, yields, reaches `mcycle_end`, or
    /// the host requests a break.
    pub fn run(&mut self, mcycle_end: u64) -> Result<BreakReason, MachineError> {
        // An automatic yield is consumed by resuming.
        self.state.iflags.x = false;

        let mut until_poll = 0u64;
        loop {
            if self.state.iflags.h {
                return Ok(BreakReason::Halted);
            }
            if self.state.iflags.y {
                return Ok(BreakReason::YieldedManually);
            }
            if self.state.iflags.x {
                return Ok(BreakReason::YieldedAutomatically);
            }
            if self.state.mcycle >= mcycle_end {
                return Ok(BreakReason::ReachedTargetMcycle);
            }
            if until_poll == 0 {
                until_poll = HOST_POLL_INTERVAL;
                if self.break_request.load(Ordering::Relaxed) {
                    self.break_request.store(false, Ordering::Relaxed);
                    return Ok(BreakReason::HostInterrupt);
                }
                if self.state.iunrep {
                    self.poll_host();
                }
            }
            until_poll -= 1;

            match cpu::step(&mut self.state) {
                StepOutcome::Retired => {}
                StepOutcome::Waiting => {
                    // Idle in WFI: jump the clock to the earliest cycle that
                    // can wake the hart. The jump is a pure function of the
                    // timer programming, so it is reproducible.
                    let wake = if self.state.mie & MIP_MTIP != 0 {
                        clint::rtc_time_to_cycle(self.state.clint.mtimecmp)
                    } else {
                        u64::MAX
                    };
                    let target = wake.clamp(self.state.mcycle, mcycle_end);
                    let delta = target - self.state.mcycle;
                    self.state.mcycle = target;
                    self.state.icycleinstret = self.state.icycleinstret.wrapping_add(delta);
                    cpu::poll_hw_interrupts(&mut self.state);
                    if self.state.mip & self.state.mie == 0 {
                        // Still nothing to wake for within this window.
                        if self.state.mcycle >= mcycle_end {
                            return Ok(BreakReason::ReachedTargetMcycle);
                        }
                        // Host events may unblock an unreproducible machine.
                        if self.state.iunrep {
                            self.poll_host();
                        } else if wake == u64::MAX {
                            // Nothing can ever wake this hart.
                            self.state.mcycle = mcycle_end;
                            return Ok(BreakReason::ReachedTargetMcycle);
                        }
                    }
                }
            }
        }
    }

    /// Host-side plumbing allowed only in unreproducible mode: console
    /// input/output and VirtIO readiness.
    fn poll_host(&mut self) {
        #[cfg(unix)]
        if let Some(console) = &mut self.console {
            while let Some(byte) = console.poll() {
                self.state.htif.console_input.push_back(byte);
            }
        }
        htif::deliver_pending_input(&mut self.state);

        if !self.runtime.htif.no_console_putchar && !self.state.htif.console_output.is_empty() {
            let out = std::io::stdout();
            let mut lock = out.lock();
            let _ = lock.write_all(&self.state.htif.console_output);
            let _ = lock.flush();
            self.state.htif.console_output.clear();
        }

        let mut raised = Vec::new();
        for (k, dev) in self.state.virtio_devices.iter_mut().enumerate() {
            if dev.poll() {
                raised.push(crate::plic::VIRTIO_IRQ_BASE + k as u32);
            }
        }
        for irq in raised {
            crate::plic::raise(&mut self.state, irq);
        }
    }

    /// Attach the interactive console (raw-mode TTY guard). Requires
    /// unreproducible mode.
    #[cfg(unix)]
    pub fn attach_console(&mut self) -> Result<(), MachineError> {
        if !self.state.iunrep {
            return Err(MachineError::access(
                "interactive console requires unreproducible mode",
            ));
        }
        self.console = Some(crate::console::Console::new());
        Ok(())
    }

    /// Attach a VirtIO device to the next free slot. Requires
    /// unreproducible mode.
    pub fn add_virtio_device(&mut self, dev: Box<dyn VirtioDevice>) -> Result<u32, MachineError> {
        if !self.state.iunrep {
            return Err(MachineError::access("VirtIO devices require unreproducible mode"));
        }
        let slot = self.state.virtio_devices.len() as u8;
        let start = VIRTIO_START + slot as u64 * VIRTIO_STRIDE;
        self.state.pmas.insert(PmaEntry::new_io(
            start,
            VIRTIO_STRIDE,
            PMA_FLAG_R | PMA_FLAG_W,
            DriverId::Virtio(slot),
        )?)?;
        self.state.virtio_devices.push(dev);
        Ok(crate::plic::VIRTIO_IRQ_BASE + slot as u32)
    }

    /// Handle the host can trip from another thread to break out of `run`.
    pub fn break_request_flag(&self) -> Arc<AtomicBool> {
        self.break_request.clone()
    }

    /// Exit status of a halted machine: the halt payload without its
    /// doorbell bit.
    pub fn halt_exit_code(&self) -> u8 {
        ((self.state.htif.tohost & HALT_PAYLOAD_MASK) >> 1) as u8
    }

    // ---- uarch -------------------------------------------------------------

    /// Step the microarchitecture until it halts or reaches `cycle_end`.
    pub fn run_uarch(&mut self, cycle_end: u64) -> Result<UarchBreakReason, MachineError> {
        loop {
            if self.state.uarch.halt_flag {
                return Ok(UarchBreakReason::UarchHalted);
            }
            if self.state.uarch.cycle >= cycle_end {
                return Ok(UarchBreakReason::ReachedTargetCycle);
            }
            let mut access = DirectAccess { state: &mut self.state };
            if uarch::step(&mut access)? == UarchStepStatus::Halted {
                return Ok(UarchBreakReason::UarchHalted);
            }
        }
    }

    /// Restore the microarchitecture to its creation-time state.
    pub fn reset_uarch(&mut self) {
        self.state.uarch = self.uarch_initial;
        let idx = self
            .state
            .pmas
            .find(UARCH_RAM_START, 1)
            .expect("uarch RAM is always mapped");
        let mem = self.state.pmas.entry_mut(idx).memory.as_mut().expect("uarch RAM backing");
        mem.bytes_mut().copy_from_slice(&self.uarch_pristine_ram);
        mem.mark_all_dirty();
    }

    /// Execute exactly one uarch instruction, recording every state access.
    pub fn log_uarch_step(
        &mut self,
        log_type: LogType,
        _one_based: bool,
    ) -> Result<AccessLog, MachineError> {
        self.update_merkle_tree();
        let mut recorder = Recorder { machine: self, log: AccessLog::new(log_type) };
        uarch::step(&mut recorder)?;
        Ok(recorder.log)
    }

    /// Reset the uarch, recording the restoration as one subtree write.
    pub fn log_uarch_reset(
        &mut self,
        log_type: LogType,
        _one_based: bool,
    ) -> Result<AccessLog, MachineError> {
        self.update_merkle_tree();
        let hash_before = self.tree.node_hash(UARCH_REGION_START, UARCH_REGION_LOG2_SIZE);
        let siblings = if log_type.proofs {
            Some(self.tree.sibling_hashes_above(UARCH_REGION_START, UARCH_REGION_LOG2_SIZE))
        } else {
            None
        };

        self.reset_uarch();
        self.update_merkle_tree();
        let hash_after = self.tree.node_hash(UARCH_REGION_START, UARCH_REGION_LOG2_SIZE);

        let mut log = AccessLog::new(log_type);
        log.push(
            Access {
                kind: AccessKind::Write,
                address: UARCH_REGION_START,
                log2_size: UARCH_REGION_LOG2_SIZE,
                value_before: 0,
                value_after: None,
                hash_before,
                hash_after: Some(hash_after),
                sibling_hashes: siblings,
            },
            "uarch reset",
        );
        Ok(log)
    }

    // ---- State access ------------------------------------------------------

    pub fn read_x(&self, index: usize) -> u64 {
        self.state.x[index]
    }

    pub fn write_x(&mut self, index: usize, value: u64) {
        if index != 0 {
            self.state.x[index] = value;
        }
    }

    pub fn read_f(&self, index: usize) -> u64 {
        self.state.f[index]
    }

    pub fn write_f(&mut self, index: usize, value: u64) {
        self.state.f[index] = value;
    }

    pub fn read_csr(&self, csr: Csr) -> u64 {
        match csr_location(csr) {
            CsrLocation::Shadow(offset) => shadow::read(&self.state, offset, 3).unwrap_or(0),
            CsrLocation::UarchShadow(offset) => {
                shadow::uarch_read(&self.state, offset, 3).unwrap_or(0)
            }
        }
    }

    pub fn write_csr(&mut self, csr: Csr, value: u64) -> Result<(), MachineError> {
        if matches!(csr, Csr::Mvendorid | Csr::Marchid | Csr::Mimpid) {
            return Err(MachineError::access(format!("{:?} is read-only", csr)));
        }
        let ok = match csr_location(csr) {
            CsrLocation::Shadow(offset) => shadow::write(&mut self.state, offset, value),
            CsrLocation::UarchShadow(offset) => {
                shadow::uarch_write(&mut self.state, offset, value)
            }
        };
        if ok {
            Ok(())
        } else {
            Err(MachineError::access(format!("cannot write {:?}", csr)))
        }
    }

    /// Clear the manual-yield latch so `run` can resume.
    pub fn reset_iflags_y(&mut self) {
        self.state.iflags.y = false;
    }

    pub fn read_iflags_h(&self) -> bool {
        self.state.iflags.h
    }

    pub fn read_iflags_y(&self) -> bool {
        self.state.iflags.y
    }

    pub fn read_iflags_x(&self) -> bool {
        self.state.iflags.x
    }

    /// Queue console input bytes for HTIF getchar.
    pub fn put_console_input(&mut self, bytes: &[u8]) {
        self.state.htif.console_input.extend(bytes.iter().copied());
        htif::deliver_pending_input(&mut self.state);
    }

    /// Drain buffered putchar output.
    pub fn drain_console_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.state.htif.console_output)
    }

    /// Read bytes from a physical range fully contained in one memory PMA.
    pub fn read_memory(&self, paddr: u64, buf: &mut [u8]) -> Result<(), MachineError> {
        let idx = self.find_memory_pma(paddr, buf.len() as u64)?;
        let entry = self.state.pmas.entry(idx);
        let offset = (paddr - entry.start) as usize;
        let mem = entry.memory.as_ref().expect("memory PMA without backing");
        buf.copy_from_slice(&mem.bytes()[offset..offset + buf.len()]);
        Ok(())
    }

    /// Write bytes into a physical range fully contained in one memory PMA.
    /// Dirties the touched pages and drops any TLB entry mapping them.
    pub fn write_memory(&mut self, paddr: u64, data: &[u8]) -> Result<(), MachineError> {
        if data.is_empty() {
            return Ok(());
        }
        let idx = self.find_memory_pma(paddr, data.len() as u64)?;
        let entry = self.state.pmas.entry_mut(idx);
        let start = entry.start;
        let offset = (paddr - start) as usize;
        let mem = entry.memory.as_mut().expect("memory PMA without backing");
        mem.bytes_mut()[offset..offset + data.len()].copy_from_slice(data);
        mem.mark_dirty_range(offset as u64, data.len() as u64);

        let first_page = paddr & !(PMA_PAGE_SIZE - 1);
        let last_page = (paddr + data.len() as u64 - 1) & !(PMA_PAGE_SIZE - 1);
        let mut page = first_page;
        loop {
            self.state.tlb.flush_paddr(page);
            if page == last_page {
                break;
            }
            page += PMA_PAGE_SIZE;
        }
        Ok(())
    }

    fn find_memory_pma(&self, paddr: u64, len: u64) -> Result<usize, MachineError> {
        let idx = self.state.pmas.find(paddr, len).ok_or_else(|| {
            MachineError::access(format!(
                "range {:#x}+{:#x} is not contained in a single PMA",
                paddr, len
            ))
        })?;
        if !self.state.pmas.entry(idx).is_memory() {
            return Err(MachineError::access(format!(
                "range {:#x}+{:#x} maps to a device, not memory",
                paddr, len
            )));
        }
        Ok(idx)
    }

    /// Read through the current address translation (no TLB involvement).
    pub fn read_virtual_memory(&mut self, vaddr: u64, buf: &mut [u8]) -> Result<(), MachineError> {
        let mut done = 0usize;
        while done < buf.len() {
            let va = vaddr + done as u64;
            let in_page = (PMA_PAGE_SIZE - (va & (PMA_PAGE_SIZE - 1))) as usize;
            let chunk = in_page.min(buf.len() - done);
            let pa = crate::mmu::translate_nofill(&mut self.state, va, crate::mmu::AccessType::Load)
                .map_err(|t| MachineError::access(format!("translation failed: {}", t)))?;
            let mut tmp = vec![0u8; chunk];
            self.read_memory(pa, &mut tmp)?;
            buf[done..done + chunk].copy_from_slice(&tmp);
            done += chunk;
        }
        Ok(())
    }

    /// Write through the current address translation (no TLB involvement).
    pub fn write_virtual_memory(&mut self, vaddr: u64, data: &[u8]) -> Result<(), MachineError> {
        let mut done = 0usize;
        while done < data.len() {
            let va = vaddr + done as u64;
            let in_page = (PMA_PAGE_SIZE - (va & (PMA_PAGE_SIZE - 1))) as usize;
            let chunk = in_page.min(data.len() - done);
            let pa = crate::mmu::translate_nofill(&mut self.state, va, crate::mmu::AccessType::Store)
                .map_err(|t| MachineError::access(format!("translation failed: {}", t)))?;
            self.write_memory(pa, &data[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }

    /// Swap the backing image of an existing replaceable memory range.
    /// Geometry must match exactly; disjointness is preserved by
    /// construction.
    pub fn replace_memory_range(&mut self, range: &MemoryRangeConfig) -> Result<(), MachineError> {
        let idx = self.state.pmas.find(range.start, range.length).ok_or_else(|| {
            MachineError::access(format!(
                "no memory range at {:#x}+{:#x}",
                range.start, range.length
            ))
        })?;
        let entry = self.state.pmas.entry(idx);
        if entry.start != range.start || entry.length != range.length {
            return Err(MachineError::access(
                "replacement geometry does not match the existing range",
            ));
        }
        if !entry.is_memory() {
            return Err(MachineError::access("cannot replace a device range"));
        }
        if matches!(entry.start, ROM_START | RAM_START | UARCH_RAM_START) {
            return Err(MachineError::access("only flash and rollup ranges can be replaced"));
        }

        let mut replacement = load_memory_range(range.length, range.image_filename.as_deref())?;
        replacement.shared = range.shared;
        replacement.image_filename = range.image_filename.clone();
        self.state.pmas.entry_mut(idx).memory = Some(replacement);
        self.state.tlb.flush_all();
        Ok(())
    }

    // ---- Merkle ------------------------------------------------------------

    /// Rehash every dirty page into the tree. IO ranges are re-peeked each
    /// time; their non-pristine pages are few and cheap.
    pub fn update_merkle_tree(&mut self) {
        let mut scratch = vec![0u8; PMA_PAGE_SIZE as usize];
        for idx in 0..self.state.pmas.len() {
            let (start, length, is_memory) = {
                let e = self.state.pmas.entry(idx);
                (e.start, e.length, e.is_memory())
            };
            if is_memory {
                let dirty =
                    self.state.pmas.entry(idx).memory.as_ref().expect("backing").dirty_pages();
                for offset in dirty {
                    self.hash_one_page(idx, start, offset, &mut scratch);
                    self.state
                        .pmas
                        .entry_mut(idx)
                        .memory
                        .as_mut()
                        .expect("backing")
                        .clear_dirty_page(offset);
                }
            } else {
                let mut offset = 0;
                while offset < length {
                    self.hash_one_page(idx, start, offset, &mut scratch);
                    offset += PMA_PAGE_SIZE;
                }
            }
        }
    }

    fn hash_one_page(&mut self, idx: usize, start: u64, offset: u64, scratch: &mut [u8]) {
        let address = start + offset;
        match bus::peek_page(&self.state, idx, offset, scratch) {
            PagePeek::Data => self.tree.set_page(address, hash_page(scratch)),
            PagePeek::Pristine => {
                if self.tree.page_hash(address).is_some() {
                    let zero = self.tree.zero_hash(LOG2_PAGE_SIZE);
                    self.tree.set_page(address, zero);
                }
            }
        }
    }

    /// Root of the Merkle tree over the whole physical address space.
    pub fn get_root_hash(&mut self) -> Hash {
        self.update_merkle_tree();
        self.tree.root()
    }

    /// Recompute every mapped page hash from scratch and compare with the
    /// cached tree.
    pub fn verify_merkle_tree(&mut self) -> bool {
        self.update_merkle_tree();
        let mut scratch = vec![0u8; PMA_PAGE_SIZE as usize];
        for idx in 0..self.state.pmas.len() {
            let (start, length) = {
                let e = self.state.pmas.entry(idx);
                (e.start, e.length)
            };
            let mut offset = 0;
            while offset < length {
                let address = start + offset;
                let expected = match bus::peek_page(&self.state, idx, offset, &mut scratch) {
                    PagePeek::Data => hash_page(&scratch),
                    PagePeek::Pristine => self.tree.zero_hash(LOG2_PAGE_SIZE),
                };
                let cached =
                    self.tree.page_hash(address).unwrap_or_else(|| self.tree.zero_hash(LOG2_PAGE_SIZE));
                if cached != expected {
                    log::warn!("merkle mismatch at page {:#x}", address);
                    return false;
                }
                offset += PMA_PAGE_SIZE;
            }
        }
        true
    }

    /// Merkle proof for the aligned node `[address, address + 2^log2_size)`.
    pub fn get_proof(&mut self, address: u64, log2_size: u32) -> Result<Proof, MachineError> {
        if !(LOG2_WORD_SIZE..=LOG2_ROOT_SIZE).contains(&log2_size) {
            return Err(MachineError::access(format!(
                "log2_size {} outside [{}, {}]",
                log2_size, LOG2_WORD_SIZE, LOG2_ROOT_SIZE
            )));
        }
        if log2_size == LOG2_ROOT_SIZE {
            if address != 0 {
                return Err(MachineError::access("misaligned proof target"));
            }
        } else if address & ((1u64 << log2_size) - 1) != 0 {
            return Err(MachineError::access("misaligned proof target"));
        }

        self.update_merkle_tree();

        let (target_hash, sibling_hashes) = if log2_size >= LOG2_PAGE_SIZE {
            (
                self.tree.node_hash(address, log2_size),
                self.tree.sibling_hashes_above(address, log2_size),
            )
        } else {
            // Sub-page target: must be fully inside one PMA, whose page
            // image provides the levels below 12.
            let idx = self.state.pmas.find(address, 1u64 << log2_size).ok_or_else(|| {
                MachineError::access(format!(
                    "proof target {:#x} is not contained in a single PMA",
                    address
                ))
            })?;
            let page_start = address & !(PMA_PAGE_SIZE - 1);
            let pma_start = self.state.pmas.entry(idx).start;
            let mut page = vec![0u8; PMA_PAGE_SIZE as usize];
            if bus::peek_page(&self.state, idx, page_start - pma_start, &mut page)
                == PagePeek::Pristine
            {
                page.fill(0);
            }
            let in_page = address & (PMA_PAGE_SIZE - 1);
            let target_hash = range_hash_in_page(&page, in_page, log2_size);
            let mut siblings = Vec::with_capacity((LOG2_ROOT_SIZE - log2_size) as usize);
            for log2 in log2_size..LOG2_PAGE_SIZE {
                let sibling = (in_page ^ (1u64 << log2)) & !((1u64 << log2) - 1);
                siblings.push(range_hash_in_page(&page, sibling, log2));
            }
            siblings.extend(self.tree.sibling_hashes_above(page_start, LOG2_PAGE_SIZE));
            (target_hash, siblings)
        };

        Ok(Proof {
            target_address: address,
            log2_target_size: log2_size,
            target_hash,
            log2_root_size: LOG2_ROOT_SIZE,
            sibling_hashes,
            root_hash: self.tree.root(),
        })
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn state(&self) -> &MachineState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut MachineState {
        &mut self.state
    }
}

enum CsrLocation {
    Shadow(u64),
    UarchShadow(u64),
}

fn csr_location(csr: Csr) -> CsrLocation {
    use CsrLocation::*;
    match csr {
        Csr::Pc => Shadow(shadow::SHADOW_PC),
        Csr::Fcsr => Shadow(shadow::SHADOW_FCSR),
        Csr::Mvendorid => Shadow(shadow::SHADOW_MVENDORID),
        Csr::Marchid => Shadow(shadow::SHADOW_MARCHID),
        Csr::Mimpid => Shadow(shadow::SHADOW_MIMPID),
        Csr::Mcycle => Shadow(shadow::SHADOW_MCYCLE),
        Csr::Icycleinstret => Shadow(shadow::SHADOW_ICYCLEINSTRET),
        Csr::Mstatus => Shadow(shadow::SHADOW_MSTATUS),
        Csr::Mtvec => Shadow(shadow::SHADOW_MTVEC),
        Csr::Mscratch => Shadow(shadow::SHADOW_MSCRATCH),
        Csr::Mepc => Shadow(shadow::SHADOW_MEPC),
        Csr::Mcause => Shadow(shadow::SHADOW_MCAUSE),
        Csr::Mtval => Shadow(shadow::SHADOW_MTVAL),
        Csr::Misa => Shadow(shadow::SHADOW_MISA),
        Csr::Mie => Shadow(shadow::SHADOW_MIE),
        Csr::Mip => Shadow(shadow::SHADOW_MIP),
        Csr::Medeleg => Shadow(shadow::SHADOW_MEDELEG),
        Csr::Mideleg => Shadow(shadow::SHADOW_MIDELEG),
        Csr::Mcounteren => Shadow(shadow::SHADOW_MCOUNTEREN),
        Csr::Menvcfg => Shadow(shadow::SHADOW_MENVCFG),
        Csr::Stvec => Shadow(shadow::SHADOW_STVEC),
        Csr::Sscratch => Shadow(shadow::SHADOW_SSCRATCH),
        Csr::Sepc => Shadow(shadow::SHADOW_SEPC),
        Csr::Scause => Shadow(shadow::SHADOW_SCAUSE),
        Csr::Stval => Shadow(shadow::SHADOW_STVAL),
        Csr::Satp => Shadow(shadow::SHADOW_SATP),
        Csr::Scounteren => Shadow(shadow::SHADOW_SCOUNTEREN),
        Csr::Senvcfg => Shadow(shadow::SHADOW_SENVCFG),
        Csr::Ilrsc => Shadow(shadow::SHADOW_ILRSC),
        Csr::Iflags => Shadow(shadow::SHADOW_IFLAGS),
        Csr::Iunrep => Shadow(shadow::SHADOW_IUNREP),
        Csr::ClintMtimecmp => Shadow(shadow::SHADOW_CLINT_MTIMECMP),
        Csr::PlicGirqpend => Shadow(shadow::SHADOW_PLIC_GIRQPEND),
        Csr::PlicGirqsrvd => Shadow(shadow::SHADOW_PLIC_GIRQSRVD),
        Csr::HtifTohost => Shadow(shadow::SHADOW_HTIF_TOHOST),
        Csr::HtifFromhost => Shadow(shadow::SHADOW_HTIF_FROMHOST),
        Csr::HtifIhalt => Shadow(shadow::SHADOW_HTIF_IHALT),
        Csr::HtifIconsole => Shadow(shadow::SHADOW_HTIF_ICONSOLE),
        Csr::HtifIyield => Shadow(shadow::SHADOW_HTIF_IYIELD),
        Csr::UarchPc => UarchShadow(shadow::UARCH_SHADOW_PC),
        Csr::UarchCycle => UarchShadow(shadow::UARCH_SHADOW_CYCLE),
        Csr::UarchHaltFlag => UarchShadow(shadow::UARCH_SHADOW_HALT),
    }
}

fn load_memory_range(length: u64, image: Option<&Path>) -> Result<MemoryRange, MachineError> {
    if length % PMA_PAGE_SIZE != 0 {
        return Err(MachineError::config(format!(
            "memory range length {:#x} is not page-aligned",
            length
        )));
    }
    let mut range = MemoryRange::new(length);
    if let Some(path) = image {
        let bytes = std::fs::read(path)?;
        if bytes.len() as u64 > length {
            return Err(MachineError::config(format!(
                "image {} ({} bytes) does not fit in {:#x} bytes",
                path.display(),
                bytes.len(),
                length
            )));
        }
        range.bytes_mut()[..bytes.len()].copy_from_slice(&bytes);
        range.image_filename = Some(path.to_path_buf());
    }
    Ok(range)
}

/// Recording access layer: performs the access directly and appends it,
/// with a fresh proof against the evolving root, to the log.
struct Recorder<'a> {
    machine: &'a mut Machine,
    log: AccessLog,
}

impl Recorder<'_> {
    fn word_siblings(&mut self, address: u64) -> Result<Option<Vec<Hash>>, MachineError> {
        if !self.log.log_type.proofs {
            return Ok(None);
        }
        let proof = self.machine.get_proof(address, LOG2_WORD_SIZE)?;
        Ok(Some(proof.sibling_hashes))
    }
}

impl uarch::UarchAccess for Recorder<'_> {
    fn read_word(&mut self, paddr: u64) -> Result<u64, MachineError> {
        let value = bus::read_phys(&mut self.machine.state, paddr, 3)
            .map_err(|t| MachineError::Uarch(format!("uarch memory access faulted: {}", t)))?;
        let siblings = self.word_siblings(paddr)?;
        self.log.push(
            Access {
                kind: AccessKind::Read,
                address: paddr,
                log2_size: LOG2_WORD_SIZE,
                value_before: value,
                value_after: None,
                hash_before: word_hash(value),
                hash_after: None,
                sibling_hashes: siblings,
            },
            "read",
        );
        Ok(value)
    }

    fn write_word(&mut self, paddr: u64, value: u64) -> Result<(), MachineError> {
        let old = bus::read_phys(&mut self.machine.state, paddr, 3)
            .map_err(|t| MachineError::Uarch(format!("uarch memory access faulted: {}", t)))?;
        let siblings = self.word_siblings(paddr)?;
        uarch::write_word_direct(&mut self.machine.state, paddr, value)?;
        self.log.push(
            Access {
                kind: AccessKind::Write,
                address: paddr,
                log2_size: LOG2_WORD_SIZE,
                value_before: old,
                value_after: Some(value),
                hash_before: word_hash(old),
                hash_after: Some(word_hash(value)),
                sibling_hashes: siblings,
            },
            "write",
        );
        Ok(())
    }
}
