use crate::csr::{
    Iflags, ILRSC_INIT, MARCHID_INIT, MIMPID_INIT, MISA_INIT, MSTATUS_INIT, MTIMECMP_INIT,
    MVENDORID_INIT, PC_INIT,
};
use crate::uarch::UARCH_PC_INIT;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Maximum number of flash drives in one machine.
pub const FLASH_DRIVE_MAX: usize = 8;

/// Processor state configuration. All values are raw register images; the
/// iflags field uses the packed encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
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
    pub ilrsc: u64,
    pub iflags: u64,
    pub iunrep: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
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
            mtvec: 0,
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
            iflags: Iflags::new().pack(),
            iunrep: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RamConfig {
    pub length: u64,
    pub image_filename: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RomConfig {
    pub length: u64,
    pub bootargs: String,
    pub image_filename: Option<PathBuf>,
}

impl Default for RomConfig {
    fn default() -> Self {
        RomConfig { length: 0xF000, bootargs: String::new(), image_filename: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FlashDriveConfig {
    pub start: u64,
    pub length: u64,
    /// Whether host-side changes are flushed back to the image file.
    pub shared: bool,
    pub image_filename: Option<PathBuf>,
}

/// A generic extra memory range (rollup buffers use these).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MemoryRangeConfig {
    pub start: u64,
    pub length: u64,
    pub shared: bool,
    pub image_filename: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RollupConfig {
    pub rx_buffer: MemoryRangeConfig,
    pub tx_buffer: MemoryRangeConfig,
    pub input_metadata: MemoryRangeConfig,
    pub voucher_hashes: MemoryRangeConfig,
    pub notice_hashes: MemoryRangeConfig,
}

impl RollupConfig {
    pub fn ranges(&self) -> [&MemoryRangeConfig; 5] {
        [
            &self.rx_buffer,
            &self.tx_buffer,
            &self.input_metadata,
            &self.voucher_hashes,
            &self.notice_hashes,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClintConfig {
    pub mtimecmp: u64,
}

impl Default for ClintConfig {
    fn default() -> Self {
        ClintConfig { mtimecmp: MTIMECMP_INIT }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HtifConfig {
    pub tohost: u64,
    pub fromhost: u64,
    /// Allow the halt command (on by default; a machine without it can
    /// only stop by yield or cycle target).
    pub halt: bool,
    /// Expose console getchar to the guest.
    pub console_getchar: bool,
    /// Allow console putchar (on by default).
    pub console_putchar: bool,
    /// Allow the manual yield command.
    pub yield_manual: bool,
    /// Allow the automatic yield command.
    pub yield_automatic: bool,
}

impl Default for HtifConfig {
    fn default() -> Self {
        HtifConfig {
            tohost: 0,
            fromhost: 0,
            halt: true,
            console_getchar: false,
            console_putchar: true,
            yield_manual: false,
            yield_automatic: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PlicConfig {
    pub girqpend: u64,
    pub girqsrvd: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UarchProcessorConfig {
    pub x: [u64; 32],
    pub pc: u64,
    pub cycle: u64,
    pub halt_flag: bool,
}

impl Default for UarchProcessorConfig {
    fn default() -> Self {
        UarchProcessorConfig { x: [0; 32], pc: UARCH_PC_INIT, cycle: 0, halt_flag: false }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UarchConfig {
    pub processor: UarchProcessorConfig,
    pub ram_length: u64,
    pub ram_image: Option<PathBuf>,
}

impl Default for UarchConfig {
    fn default() -> Self {
        UarchConfig { processor: UarchProcessorConfig::default(), ram_length: 0x1000, ram_image: None }
    }
}

/// Complete machine configuration: the creation-time image of the state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MachineConfig {
    pub processor: ProcessorConfig,
    pub ram: RamConfig,
    pub rom: RomConfig,
    pub flash_drives: Vec<FlashDriveConfig>,
    pub rollup: Option<RollupConfig>,
    pub clint: ClintConfig,
    pub htif: HtifConfig,
    pub plic: PlicConfig,
    pub uarch: UarchConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DhdRuntimeConfig {
    pub source_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConcurrencyRuntimeConfig {
    /// Accepted for compatibility; updates are always synchronous here.
    pub update_merkle_tree_async: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HtifRuntimeConfig {
    /// Suppress forwarding putchar bytes to the host stdout.
    pub no_console_putchar: bool,
}

/// Host-side options that do not affect the committed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub dhd: DhdRuntimeConfig,
    pub concurrency: ConcurrencyRuntimeConfig,
    pub htif: HtifRuntimeConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_json() {
        let config = MachineConfig::default();
        let text = serde_json::to_string_pretty(&config).unwrap();
        let back: MachineConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: MachineConfig =
            serde_json::from_str(r#"{"ram": {"length": 4096}}"#).unwrap();
        assert_eq!(config.ram.length, 4096);
        assert_eq!(config.processor.pc, PC_INIT);
        assert_eq!(config.rom.length, 0xF000);
    }
}
