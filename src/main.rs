use clap::Parser;
use merklevm::access_log::LogType;
use merklevm::config::{FlashDriveConfig, MachineConfig, RuntimeConfig};
use merklevm::machine::Machine;
use merklevm::BreakReason;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Load a previously stored machine from this directory
    #[arg(long)]
    load: Option<PathBuf>,

    /// Store the machine into this directory after running
    #[arg(long)]
    store: Option<PathBuf>,

    /// ROM image to load at 0x1000
    #[arg(long)]
    rom_image: Option<PathBuf>,

    /// Bootargs packed into the last ROM page
    #[arg(long, default_value = "")]
    bootargs: String,

    /// RAM image to load at 0x80000000
    #[arg(long)]
    ram_image: Option<PathBuf>,

    /// RAM length in MiB
    #[arg(long, default_value_t = 64)]
    ram_length_mib: u64,

    /// Flash drive spec, repeatable: start:length:path[:shared]
    #[arg(long = "flash-drive")]
    flash_drives: Vec<String>,

    /// uarch RAM image
    #[arg(long)]
    uarch_ram_image: Option<PathBuf>,

    /// Stop when mcycle reaches this value
    #[arg(long, default_value_t = u64::MAX)]
    max_mcycle: u64,

    /// Print the state root before running
    #[arg(long)]
    initial_hash: bool,

    /// Print the state root after running
    #[arg(long)]
    final_hash: bool,

    /// Record one uarch step log (with proofs) into this file and exit
    #[arg(long)]
    log_uarch_step: Option<PathBuf>,

    /// Allow console getchar and interactive input (unreproducible)
    #[arg(long)]
    interactive: bool,

    /// Suppress forwarding putchar output to stdout
    #[arg(long)]
    no_console_putchar: bool,
}

fn parse_flash_drive(spec: &str) -> Result<FlashDriveConfig, String> {
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() < 3 || parts.len() > 4 {
        return Err(format!("bad flash drive spec '{}': want start:length:path[:shared]", spec));
    }
    let parse_u64 = |s: &str| -> Result<u64, String> {
        let s = s.trim();
        if let Some(hex) = s.strip_prefix("0x") {
            u64::from_str_radix(hex, 16).map_err(|e| e.to_string())
        } else {
            s.parse().map_err(|e: std::num::ParseIntError| e.to_string())
        }
    };
    Ok(FlashDriveConfig {
        start: parse_u64(parts[0])?,
        length: parse_u64(parts[1])?,
        image_filename: Some(PathBuf::from(parts[2])),
        shared: parts.get(3).is_some_and(|s| *s == "shared"),
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let runtime = RuntimeConfig {
        htif: merklevm::config::HtifRuntimeConfig { no_console_putchar: args.no_console_putchar },
        ..RuntimeConfig::default()
    };

    let mut machine = if let Some(dir) = &args.load {
        Machine::load(dir, runtime)?
    } else {
        let mut config = MachineConfig::default();
        config.rom.image_filename = args.rom_image.clone();
        config.rom.bootargs = args.bootargs.clone();
        config.ram.image_filename = args.ram_image.clone();
        config.ram.length = args.ram_length_mib * 1024 * 1024;
        config.uarch.ram_image = args.uarch_ram_image.clone();
        for spec in &args.flash_drives {
            config.flash_drives.push(parse_flash_drive(spec)?);
        }
        if args.interactive {
            config.htif.console_getchar = true;
            config.processor.iunrep = true;
        }
        Machine::create(config, runtime)?
    };

    #[cfg(unix)]
    if args.interactive {
        machine.attach_console()?;
    }

    if let Some(path) = &args.log_uarch_step {
        let root_before = machine.get_root_hash();
        let log = machine.log_uarch_step(LogType::with_proofs(), true)?;
        let root_after = machine.get_root_hash();
        merklevm::uarch::verify_step_state_transition(root_before, &log, root_after)?;
        let file = std::fs::File::create(path)?;
        bincode::serialize_into(file, &log)?;
        println!("step log: {} accesses, {} -> {}", log.accesses.len(), root_before, root_after);
        return Ok(());
    }

    if args.initial_hash {
        println!("{}", machine.get_root_hash());
    }

    let reason = machine.run(args.max_mcycle)?;
    let mcycle = machine.read_csr(merklevm::csr::Csr::Mcycle);
    match reason {
        BreakReason::Halted => {
            log::info!("halted at mcycle {}", mcycle);
        }
        BreakReason::YieldedManually => log::info!("yielded manually at mcycle {}", mcycle),
        BreakReason::YieldedAutomatically => {
            log::info!("yielded automatically at mcycle {}", mcycle)
        }
        BreakReason::ReachedTargetMcycle => log::info!("reached mcycle {}", mcycle),
        BreakReason::HostInterrupt => log::info!("interrupted at mcycle {}", mcycle),
    }

    // Flush any buffered guest console output.
    let output = machine.drain_console_output();
    if !output.is_empty() && !args.no_console_putchar {
        use std::io::Write;
        std::io::stdout().write_all(&output)?;
    }

    if args.final_hash {
        println!("{}", machine.get_root_hash());
    }

    if let Some(dir) = &args.store {
        machine.store(dir)?;
    }

    if reason == BreakReason::Halted {
        std::process::exit(machine.halt_exit_code() as i32);
    }
    Ok(())
}
