//! End-to-end scenarios driving whole machines through the public API.

use merklevm::access_log::LogType;
use merklevm::config::{FlashDriveConfig, MachineConfig, MemoryRangeConfig, RuntimeConfig};
use merklevm::csr::Csr;
use merklevm::machine::Machine;
use merklevm::merkle::word_hash;
use merklevm::uarch;
use merklevm::BreakReason;

const RAM_START: u64 = 0x8000_0000;
const HTIF_BASE_HI20: i32 = 0x4000_8000u32 as i32; // lui immediate, low 12 bits zero
const UARCH_RAM_START: u64 = 0x0060_0000;

// ---- Instruction encoders (RV64) ---------------------------------------------

fn encode_i(imm: i32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    (((imm as u32) & 0xFFF) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

fn encode_r(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

fn encode_s(imm: i32, rs2: u32, rs1: u32, funct3: u32) -> u32 {
    let imm = (imm as u32) & 0xFFF;
    ((imm >> 5) << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | ((imm & 0x1F) << 7) | 0x23
}

fn encode_u(imm: i32, rd: u32) -> u32 {
    ((imm as u32) & 0xFFFF_F000) | (rd << 7) | 0x37
}

fn encode_j(imm: i32, rd: u32) -> u32 {
    let imm = imm as u32;
    (((imm >> 20) & 1) << 31)
        | (((imm >> 1) & 0x3FF) << 21)
        | (((imm >> 11) & 1) << 20)
        | (((imm >> 12) & 0xFF) << 12)
        | (rd << 7)
        | 0x6F
}

fn auipc(rd: u32, imm: i32) -> u32 {
    ((imm as u32) & 0xFFFF_F000) | (rd << 7) | 0x17
}

const ECALL: u32 = 0x0000_0073;
const WFI: u32 = 0x1050_0073;

// ---- Helpers ------------------------------------------------------------------

fn small_config() -> MachineConfig {
    let mut config = MachineConfig::default();
    config.ram.length = 0x10000;
    config.processor.pc = RAM_START;
    config
}

fn build(config: MachineConfig) -> Machine {
    Machine::create(config, RuntimeConfig::default()).unwrap()
}

fn load_program(machine: &mut Machine, base: u64, program: &[u32]) {
    let bytes: Vec<u8> = program.iter().flat_map(|insn| insn.to_le_bytes()).collect();
    machine.write_memory(base, &bytes).unwrap();
}

fn temp_dir(tag: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("merklevm-{}-{}", tag, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

// ---- S1: halt through HTIF -----------------------------------------------------

#[test]
fn s1_halt_through_htif() {
    let mut machine = build(small_config());
    // li a0, 0; li a7, 93; ecall -> trap handler writes tohost = 1.
    load_program(
        &mut machine,
        RAM_START,
        &[
            encode_i(0, 0, 0, 10, 0x13),  // li a0, 0
            encode_i(93, 0, 0, 17, 0x13), // li a7, 93
            ECALL,
        ],
    );
    load_program(
        &mut machine,
        RAM_START + 0x100,
        &[
            encode_u(HTIF_BASE_HI20, 5),  // lui x5, htif
            encode_i(1, 0, 0, 6, 0x13),   // li x6, 1
            encode_s(0, 6, 5, 3),         // sd x6, 0(x5)
        ],
    );
    machine.write_csr(Csr::Mtvec, RAM_START + 0x100).unwrap();

    let reason = machine.run(u64::MAX).unwrap();
    assert_eq!(reason, BreakReason::Halted);
    // Two ALU ops, the trapping ecall, and three handler instructions.
    assert_eq!(machine.read_csr(Csr::Mcycle), 6);
    // tohost retains the halt payload and maps to exit code 0.
    assert_eq!(machine.read_csr(Csr::HtifTohost), 1);
    assert_eq!(machine.halt_exit_code(), 0);
    assert!(machine.read_iflags_h());
}

// ---- S2: putchar --------------------------------------------------------------

#[test]
fn s2_putchar_acks_without_state_leak() {
    let mut machine = build(small_config());
    let tohost_cmd: u64 = (1 << 56) | (1 << 48) | 0x41;
    machine.write_memory(RAM_START + 0x200, &tohost_cmd.to_le_bytes()).unwrap();
    load_program(
        &mut machine,
        RAM_START,
        &[
            auipc(7, 0),                    // x7 = ram base
            encode_i(0x200, 7, 3, 6, 0x03), // ld x6, 0x200(x7)
            encode_u(HTIF_BASE_HI20, 5),    // lui x5, htif
            encode_s(0, 6, 5, 3),           // sd x6, 0(x5)
        ],
    );

    let reason = machine.run(4).unwrap();
    assert_eq!(reason, BreakReason::ReachedTargetMcycle);
    assert_eq!(machine.read_csr(Csr::HtifFromhost), (1 << 56) | (1 << 48));
    assert_eq!(machine.read_csr(Csr::HtifTohost), 0);
    assert_eq!(machine.drain_console_output(), vec![b'A']);
    assert!(!machine.read_iflags_h());
}

// ---- S3: WFI + timer ----------------------------------------------------------

#[test]
fn s3_wfi_wakes_on_timer() {
    let mut machine = build(small_config());
    load_program(
        &mut machine,
        RAM_START,
        &[
            encode_u(0x0200_0000, 5),       // lui x5, clint
            encode_i(1000, 0, 0, 6, 0x13),  // li x6, 1000
            encode_u(0x4000, 7),            // lui x7, 0x4 -> 0x4000
            encode_r(0, 7, 5, 0, 5, 0x33),  // add x5, x5, x7
            encode_s(0, 6, 5, 3),           // sd x6, 0(x5) -> mtimecmp = 1000
            encode_i(128, 0, 0, 8, 0x13),   // li x8, MTIP
            encode_i(0x304, 8, 1, 0, 0x73), // csrrw x0, mie, x8
            WFI,
            encode_u(HTIF_BASE_HI20, 9), // lui x9, htif
            encode_i(1, 0, 0, 10, 0x13), // li x10, 1
            encode_s(0, 10, 9, 3),       // sd x10, 0(x9) -> halt
        ],
    );

    let reason = machine.run(u64::MAX).unwrap();
    assert_eq!(reason, BreakReason::Halted);
    // WFI idles until mtime reaches mtimecmp: mcycle jumps to 100_000.
    assert!(machine.read_csr(Csr::Mcycle) >= 100_000);
    assert!(machine.read_csr(Csr::Mcycle) < 100_010);
    assert!(machine.read_csr(Csr::Mip) & 128 != 0, "MTIP must be pending");
}

// ---- S4: Sv48 store page fault ------------------------------------------------

#[test]
fn s4_sv48_readonly_store_faults() {
    let mut config = small_config();
    config.ram.length = 0x20000;
    let mut machine = build(config);

    let pte = |ppn: u64, flags: u64| ((ppn << 10) | flags).to_le_bytes();
    const V: u64 = 1 << 0;
    const R: u64 = 1 << 1;
    const W: u64 = 1 << 2;
    const X: u64 = 1 << 3;
    const A: u64 = 1 << 6;
    const D: u64 = 1 << 7;

    let root = RAM_START + 0x8000;
    let l2 = RAM_START + 0x9000;
    let l1 = RAM_START + 0xA000;
    let l0 = RAM_START + 0xB000;

    // root[0] -> l2
    machine.write_memory(root, &pte(l2 >> 12, V)).unwrap();
    // l2[1] -> l1 (covers va 0x4000_0000 .. 0x8000_0000)
    machine.write_memory(l2 + 8, &pte(l1 >> 12, V)).unwrap();
    // l2[2]: 1 GiB identity superpage for code and data at 0x8000_0000
    machine.write_memory(l2 + 16, &pte(RAM_START >> 12, V | R | W | X | A | D)).unwrap();
    // l1[0] -> l0
    machine.write_memory(l1, &pte(l0 >> 12, V)).unwrap();
    // l0[0]: va 0x4000_0000 -> pa 0x8000_1000, read-only
    machine.write_memory(l0, &pte((RAM_START + 0x1000) >> 12, V | R | A)).unwrap();

    load_program(
        &mut machine,
        RAM_START,
        &[
            encode_u(0x4000_0000, 5), // lui x5, 0x40000
            encode_s(0, 0, 5, 3),     // sd x0, 0(x5) -> store page fault
        ],
    );
    load_program(&mut machine, RAM_START + 0x100, &[encode_j(0, 0)]); // handler spins

    machine.write_csr(Csr::Satp, (9 << 60) | (root >> 12)).unwrap();
    machine.write_csr(Csr::Medeleg, 1 << 15).unwrap();
    machine.write_csr(Csr::Stvec, RAM_START + 0x100).unwrap();
    // Drop to supervisor mode (PRV = 01).
    machine.write_csr(Csr::Iflags, 0b01 << 3).unwrap();

    let reason = machine.run(200).unwrap();
    assert_eq!(reason, BreakReason::ReachedTargetMcycle);
    assert_eq!(machine.read_csr(Csr::Scause), 15, "store page fault");
    assert_eq!(machine.read_csr(Csr::Stval), 0x4000_0000);
    assert_eq!(machine.read_csr(Csr::Sepc), RAM_START + 4);

    // The reference translator agrees with the installed mapping: reads
    // through the read-only va observe pa 0x8000_1000, and host writes
    // through it are refused like the guest store was.
    machine.write_memory(RAM_START + 0x1000, b"mapped").unwrap();
    let mut through_va = [0u8; 6];
    machine.read_virtual_memory(0x4000_0000, &mut through_va).unwrap();
    assert_eq!(&through_va, b"mapped");
    assert!(machine.write_virtual_memory(0x4000_0000, b"denied").is_err());
}

// ---- S5: uarch step log -------------------------------------------------------

/// A machine whose uarch program sets x1 = 42 and then halts by storing 1
/// into its shadow halt flag. The program arrives through the uarch RAM
/// image so that a uarch reset restores it.
fn uarch_test_machine(tag: &str) -> Machine {
    let program: &[u32] = &[
        encode_i(42, 0, 0, 1, 0x13), // addi x1, x0, 42
        encode_u(0x0040_0000, 2),    // lui x2, uarch shadow
        encode_i(1, 0, 0, 3, 0x13),  // li x3, 1
        encode_s(0x110, 3, 2, 3),    // sd x3, 0x110(x2) -> halt
    ];
    let bytes: Vec<u8> = program.iter().flat_map(|insn| insn.to_le_bytes()).collect();
    let image = std::env::temp_dir().join(format!("merklevm-uarch-{}-{}.bin", tag, std::process::id()));
    std::fs::write(&image, &bytes).unwrap();

    let mut config = small_config();
    config.uarch.ram_image = Some(image.clone());
    let machine = build(config);
    let _ = std::fs::remove_file(&image);
    machine
}

#[test]
fn s5_uarch_step_log_verifies_and_rejects_tampering() {
    let mut machine = uarch_test_machine("step");

    let root_before = machine.get_root_hash();
    let log = machine.log_uarch_step(LogType::with_proofs(), true).unwrap();
    let root_after = machine.get_root_hash();

    assert_eq!(machine.state().uarch.x[1], 42);
    assert_eq!(machine.read_csr(Csr::UarchCycle), 1);
    assert_ne!(root_before, root_after);

    uarch::verify_step_state_transition(root_before, &log, root_after).unwrap();

    // Flipping any sibling hash must break verification.
    for i in 0..log.accesses.len() {
        let mut tampered = log.clone();
        if let Some(siblings) = tampered.accesses[i].sibling_hashes.as_mut() {
            siblings[7].0[0] ^= 1;
        }
        assert!(
            uarch::verify_step_state_transition(root_before, &tampered, root_after).is_err(),
            "tampered sibling in access {} slipped through",
            i
        );
    }

    // So must a tampered value.
    let mut tampered = log.clone();
    tampered.accesses[0].value_before ^= 1;
    assert!(uarch::verify_step_state_transition(root_before, &tampered, root_after).is_err());

    // And a wrong claimed final root.
    assert!(uarch::verify_step_state_transition(root_before, &log, root_before).is_err());
}

#[test]
fn uarch_runs_to_halt_and_resets() {
    let mut machine = uarch_test_machine("reset");
    let reason = machine.run_uarch(u64::MAX).unwrap();
    assert_eq!(reason, merklevm::UarchBreakReason::UarchHalted);
    assert_eq!(machine.state().uarch.x[1], 42);
    assert!(machine.state().uarch.halt_flag);
    assert_eq!(machine.read_csr(Csr::UarchCycle), 4);

    let root_before = machine.get_root_hash();
    let log = machine.log_uarch_reset(LogType::with_proofs(), true).unwrap();
    let root_after = machine.get_root_hash();

    assert_eq!(machine.read_csr(Csr::UarchCycle), 0);
    assert!(!machine.state().uarch.halt_flag);
    assert_eq!(machine.read_csr(Csr::UarchPc), UARCH_RAM_START);

    uarch::verify_reset_state_transition(root_before, &log, root_after).unwrap();
    let mut tampered = log.clone();
    tampered.accesses[0].sibling_hashes.as_mut().unwrap()[3].0[0] ^= 1;
    assert!(uarch::verify_reset_state_transition(root_before, &tampered, root_after).is_err());

    // A reset machine steps identically to a fresh one.
    let reason = machine.run_uarch(2).unwrap();
    assert_eq!(reason, merklevm::UarchBreakReason::ReachedTargetCycle);
    assert_eq!(machine.state().uarch.x[1], 42);
}

// ---- S6: word proof folds to the root -----------------------------------------

#[test]
fn s6_word_proof_reproduces_root() {
    let mut machine = build(small_config());
    let value: u64 = 0xdead_beef_0000_0000;
    machine.write_memory(RAM_START, &value.to_le_bytes()).unwrap();

    let root = machine.get_root_hash();
    let proof = machine.get_proof(RAM_START, 3).unwrap();
    assert_eq!(proof.target_hash, word_hash(value));
    assert_eq!(proof.sibling_hashes.len(), 61);
    assert_eq!(proof.root_hash, root);
    assert!(proof.verify());
}

#[test]
fn proofs_verify_at_all_granularities() {
    let mut machine = build(small_config());
    machine.write_memory(RAM_START + 0x1238, &0x1234_5678u64.to_le_bytes()).unwrap();
    let root = machine.get_root_hash();
    for log2 in [3, 4, 5, 11, 12, 13, 20, 30] {
        let address = RAM_START & !((1u64 << log2) - 1);
        let proof = machine.get_proof(address, log2).unwrap();
        assert_eq!(proof.root_hash, root, "log2 {}", log2);
        assert!(proof.verify(), "log2 {}", log2);
    }
    // Whole-space proof has no siblings.
    let proof = machine.get_proof(0, 64).unwrap();
    assert!(proof.sibling_hashes.is_empty());
    assert_eq!(proof.target_hash, root);
}

// ---- Laws ---------------------------------------------------------------------

fn counting_program(machine: &mut Machine) {
    load_program(
        machine,
        RAM_START,
        &[
            auipc(7, 0),                   // x7 = ram base
            encode_i(1, 5, 0, 5, 0x13),    // addi x5, x5, 1
            encode_s(0x200, 5, 7, 3),      // sd x5, 0x200(x7)
            encode_j(-8, 0),               // loop
        ],
    );
}

#[test]
fn law_determinism() {
    let mut a = build(small_config());
    let mut b = build(small_config());
    counting_program(&mut a);
    counting_program(&mut b);

    assert_eq!(a.run(500).unwrap(), BreakReason::ReachedTargetMcycle);
    assert_eq!(b.run(500).unwrap(), BreakReason::ReachedTargetMcycle);
    assert_eq!(a.read_csr(Csr::Mcycle), b.read_csr(Csr::Mcycle));
    assert_eq!(a.get_root_hash(), b.get_root_hash());

    assert_eq!(a.run(900).unwrap(), BreakReason::ReachedTargetMcycle);
    assert_eq!(b.run(900).unwrap(), BreakReason::ReachedTargetMcycle);
    assert_eq!(a.get_root_hash(), b.get_root_hash());
}

#[test]
fn law_store_load_roundtrip_preserves_root() {
    let dir = temp_dir("roundtrip");
    let mut a = build(small_config());
    counting_program(&mut a);
    a.run(300).unwrap();
    let root = a.get_root_hash();

    a.store(&dir).unwrap();
    let mut b = Machine::load(&dir, RuntimeConfig::default()).unwrap();
    assert_eq!(b.get_root_hash(), root);
    assert_eq!(b.read_csr(Csr::Mcycle), a.read_csr(Csr::Mcycle));

    // Resumed execution stays in lockstep with the original.
    a.run(600).unwrap();
    b.run(600).unwrap();
    assert_eq!(a.get_root_hash(), b.get_root_hash());

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn law_merkle_tree_stays_consistent() {
    let mut machine = build(small_config());
    counting_program(&mut machine);
    assert!(machine.verify_merkle_tree());
    machine.run(200).unwrap();
    assert!(machine.verify_merkle_tree());
    machine.write_memory(RAM_START + 0x3000, b"hello").unwrap();
    assert!(machine.verify_merkle_tree());
}

#[test]
fn law_mtime_is_mcycle_over_100() {
    let mut machine = build(small_config());
    counting_program(&mut machine);
    machine.run(250).unwrap();
    let mcycle = machine.read_csr(Csr::Mcycle);
    // Reading mtime through the CLINT window must agree with mcycle/100.
    let mtime =
        merklevm::bus::read_phys(machine.state_mut(), 0x0200_0000 + 0xBFF8, 3).unwrap();
    assert_eq!(mtime, mcycle / 100);
}

#[test]
fn law_replace_memory_range() {
    let flash_start = 0x10_0000_0000;
    let mut config = small_config();
    config.flash_drives.push(FlashDriveConfig {
        start: flash_start,
        length: 0x2000,
        shared: false,
        image_filename: None,
    });
    let mut machine = build(config);

    machine.write_memory(flash_start, b"before").unwrap();
    let root_before = machine.get_root_hash();

    // Replacing with a pristine image changes the root (the drive had data).
    machine
        .replace_memory_range(&MemoryRangeConfig {
            start: flash_start,
            length: 0x2000,
            shared: false,
            image_filename: None,
        })
        .unwrap();
    let root_after = machine.get_root_hash();
    assert_ne!(root_before, root_after);
    assert!(machine.verify_merkle_tree());

    // Geometry mismatches are rejected.
    let bad = MemoryRangeConfig { start: flash_start, length: 0x1000, shared: false, image_filename: None };
    assert!(machine.replace_memory_range(&bad).is_err());
    // The built-in RAM cannot be replaced.
    let ram = MemoryRangeConfig { start: RAM_START, length: 0x10000, shared: false, image_filename: None };
    assert!(machine.replace_memory_range(&ram).is_err());
}

#[test]
fn law_host_access_errors() {
    let mut machine = build(small_config());
    // Writing into a device range is rejected.
    assert!(machine.write_memory(0x4000_8000, &[0u8; 8]).is_err());
    // A range straddling the end of RAM resolves to no single PMA.
    let mut buf = [0u8; 16];
    assert!(machine.read_memory(RAM_START + 0x10000 - 8, &mut buf).is_err());
    // Unmapped addresses are rejected.
    assert!(machine.read_memory(0x5000_0000, &mut buf).is_err());
}

#[test]
fn yield_surfaces_as_break_reason() {
    let mut config = small_config();
    config.htif.yield_manual = true;
    let mut machine = build(config);
    let cmd: u64 = 2 << 56; // device 2, manual yield
    machine.write_memory(RAM_START + 0x200, &cmd.to_le_bytes()).unwrap();
    load_program(
        &mut machine,
        RAM_START,
        &[
            auipc(7, 0),
            encode_i(0x200, 7, 3, 6, 0x03), // ld x6, 0x200(x7)
            encode_u(HTIF_BASE_HI20, 5),
            encode_s(0, 6, 5, 3), // sd x6, 0(x5) -> yield
            encode_j(0, 0),
        ],
    );

    assert_eq!(machine.run(u64::MAX).unwrap(), BreakReason::YieldedManually);
    assert!(machine.read_iflags_y());
    // The latch holds until the host clears it.
    assert_eq!(machine.run(u64::MAX).unwrap(), BreakReason::YieldedManually);
    machine.reset_iflags_y();
    assert_eq!(machine.run(machine.read_csr(Csr::Mcycle) + 10).unwrap(), BreakReason::ReachedTargetMcycle);
}

#[test]
fn htif_permissions_disable_halt_and_putchar() {
    let mut config = small_config();
    config.htif.halt = false;
    config.htif.console_putchar = false;
    let mut machine = build(config);
    let putchar_cmd: u64 = (1 << 56) | (1 << 48) | 0x41;
    machine.write_memory(RAM_START + 0x200, &putchar_cmd.to_le_bytes()).unwrap();
    load_program(
        &mut machine,
        RAM_START,
        &[
            auipc(7, 0),
            encode_i(0x200, 7, 3, 6, 0x03), // ld x6, 0x200(x7)
            encode_u(HTIF_BASE_HI20, 5),
            encode_s(0, 6, 5, 3), // sd x6, 0(x5) -> putchar, disabled
            encode_i(1, 0, 0, 6, 0x13),
            encode_s(0, 6, 5, 3), // sd x6, 0(x5) -> halt, disabled
            encode_j(0, 0),
        ],
    );

    // Neither command fires: the machine spins to the cycle target.
    assert_eq!(machine.run(50).unwrap(), BreakReason::ReachedTargetMcycle);
    assert!(!machine.read_iflags_h());
    assert!(machine.drain_console_output().is_empty());
    // The last ignored command is still visible in tohost.
    assert_eq!(machine.read_csr(Csr::HtifTohost), 1);
}

#[test]
fn virtual_memory_follows_translation() {
    let mut machine = build(small_config());
    // Bare mode: virtual equals physical.
    machine.write_virtual_memory(RAM_START + 0x800, b"paging off").unwrap();
    let mut buf = [0u8; 10];
    machine.read_virtual_memory(RAM_START + 0x800, &mut buf).unwrap();
    assert_eq!(&buf, b"paging off");
    let mut direct = [0u8; 10];
    machine.read_memory(RAM_START + 0x800, &mut direct).unwrap();
    assert_eq!(buf, direct);
}
