pub mod access_log;
pub mod bus;
pub mod clint;
pub mod config;
pub mod cpu;
pub mod csr;
pub mod decoder;
pub mod htif;
pub mod machine;
pub mod merkle;
pub mod mmu;
pub mod plic;
pub mod pma;
pub mod shadow;
pub mod uarch;
pub mod virtio;

#[cfg(unix)]
pub mod console;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Architectural traps raised while interpreting guest code.
///
/// Traps never escape the interpreter: `cpu::step` consumes them by entering
/// the machine's own trap handler (updating `mepc`/`mcause`/... and
/// redirecting the PC). They are ordinary values, not host errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Trap {
    InstructionAddressMisaligned(u64),
    InstructionAccessFault(u64),
    IllegalInstruction(u64),
    Breakpoint,
    LoadAddressMisaligned(u64),
    LoadAccessFault(u64),
    StoreAddressMisaligned(u64),
    StoreAccessFault(u64),
    EnvironmentCallFromU,
    EnvironmentCallFromS,
    EnvironmentCallFromM,
    InstructionPageFault(u64),
    LoadPageFault(u64),
    StorePageFault(u64),

    MachineSoftwareInterrupt,
    MachineTimerInterrupt,
    MachineExternalInterrupt,
    SupervisorSoftwareInterrupt,
    SupervisorTimerInterrupt,
    SupervisorExternalInterrupt,
}

impl std::fmt::Display for Trap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Trap {}

/// Why a call to [`machine::Machine::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakReason {
    /// The guest halted permanently through HTIF.
    Halted,
    /// The guest yielded manually; `iflags.Y` remains set until the host
    /// clears it.
    YieldedManually,
    /// The guest yielded automatically; `iflags.X` is cleared on resume.
    YieldedAutomatically,
    /// `mcycle` reached the requested target.
    ReachedTargetMcycle,
    /// The host requested a break through the interrupt flag.
    HostInterrupt,
}

/// Why a call to [`machine::Machine::run_uarch`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UarchBreakReason {
    /// The microarchitecture program set its halt flag.
    UarchHalted,
    /// The uarch cycle counter reached the requested target.
    ReachedTargetCycle,
}

/// Host-facing errors.
///
/// Everything that is not an architectural trap surfaces through this enum
/// with a precise kind, per the propagation policy: configuration problems
/// are fatal at construction, host API misuse is rejected without touching
/// machine state, and verification failures carry the divergence point.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid memory access: {0}")]
    Access(String),

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("{0}")]
    Uarch(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl MachineError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        MachineError::Config(msg.into())
    }

    pub(crate) fn access(msg: impl Into<String>) -> Self {
        MachineError::Access(msg.into())
    }

    pub(crate) fn verification(msg: impl Into<String>) -> Self {
        MachineError::Verification(msg.into())
    }
}
