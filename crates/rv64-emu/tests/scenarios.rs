//! End-to-end scenarios driving the hart through a handful of instructions or a full
//! trap cycle, checked against architectural semantics rather than any one instruction's
//! unit test.
use rv64_emu::bus::DRAM_BASE;
use rv64_emu::cpu::Mode;
use rv64_emu::emu::Emu;
use rv64_emu::primitives::constants::{CLINT_BASE, DOUBLEWORD};
use rv64_emu::reg::csr::{
    MCAUSE, MEDELEG, MEPC, MIE, MSTATUS_MIE, MSTATUS_MPIE, MSTATUS_MPP, MTIP_BIT, MTVEC, SCAUSE,
    SEPC, STVEC, XSTATUS_SPP,
};

fn le(word: u32) -> [u8; 4] {
    word.to_le_bytes()
}

#[test]
fn addi_addi_add_sums_into_x3() {
    let mut data = Vec::new();
    data.extend_from_slice(&le(0x0050_0093)); // addi x1, x0, 5
    data.extend_from_slice(&le(0x0070_0113)); // addi x2, x0, 7
    data.extend_from_slice(&le(0x0020_81b3)); // add x3, x1, x2

    let mut emu = Emu::new();
    emu.initialize_dram(data);
    emu.initialize_pc(DRAM_BASE);

    for _ in 0..3 {
        emu.cpu.step().unwrap();
    }

    assert_eq!(emu.cpu.int_regs.read(3), 12);
    assert_eq!(emu.cpu.pc, DRAM_BASE + 12);
}

#[test]
fn srli_is_a_logical_shift_over_a_sign_extended_lui() {
    let mut data = Vec::new();
    data.extend_from_slice(&le(0xffff_f0b7)); // lui x1, 0xfffff
    data.extend_from_slice(&le(0x0040_d113)); // srli x2, x1, 4

    let mut emu = Emu::new();
    emu.initialize_dram(data);
    emu.initialize_pc(DRAM_BASE);

    emu.cpu.step().unwrap();
    assert_eq!(emu.cpu.int_regs.read(1), 0xffff_ffff_ffff_f000);

    emu.cpu.step().unwrap();
    // A 64-bit logical right shift of the sign-extended LUI result, not a 32-bit one.
    assert_eq!(emu.cpu.int_regs.read(2), 0x0fff_ffff_ffff_ff00);
}

#[test]
fn division_by_zero_returns_all_ones_without_trapping() {
    let mut data = Vec::new();
    data.extend_from_slice(&le(0x02a0_0113)); // addi x2, x0, 42
    data.extend_from_slice(&le(0x0201_40b3)); // div x1, x2, x0

    let mut emu = Emu::new();
    emu.initialize_dram(data);
    emu.initialize_pc(DRAM_BASE);

    emu.cpu.step().unwrap();
    emu.cpu.step().unwrap();

    assert_eq!(emu.cpu.int_regs.read(1), u64::MAX);
}

#[test]
fn ecall_from_user_mode_delegates_to_supervisor_when_medeleg_is_set() {
    let data = le(0x0000_0073).to_vec(); // ecall

    let mut emu = Emu::new();
    emu.initialize_dram(data);
    emu.initialize_pc(DRAM_BASE);
    emu.cpu.mode = Mode::User;
    emu.cpu.state.write(MEDELEG, 1 << 8);
    emu.cpu.state.write(STVEC, 0);

    emu.cpu.step().unwrap();

    assert_eq!(emu.cpu.mode, Mode::Supervisor);
    assert_eq!(emu.cpu.state.read(SCAUSE), 8);
    assert_eq!(emu.cpu.state.read(SEPC), DRAM_BASE);
    assert_eq!(emu.cpu.state.read_sstatus(XSTATUS_SPP), 0);
    assert_eq!(emu.cpu.pc, 0);
}

#[test]
fn mret_restores_supervisor_mode_and_the_interrupt_enable_stack() {
    let data = le(0x3020_0073).to_vec(); // mret

    let mut emu = Emu::new();
    emu.initialize_dram(data);
    emu.initialize_pc(DRAM_BASE);
    emu.cpu.state.write(MEPC, DRAM_BASE + 0x100);
    emu.cpu.state.write_mstatus(MSTATUS_MPP, Mode::Supervisor as u64);
    emu.cpu.state.write_mstatus(MSTATUS_MPIE, 1);

    emu.cpu.step().unwrap();

    assert_eq!(emu.cpu.pc, DRAM_BASE + 0x100);
    assert_eq!(emu.cpu.mode, Mode::Supervisor);
    assert_eq!(emu.cpu.state.read_mstatus(MSTATUS_MIE), 1);
    assert_eq!(emu.cpu.state.read_mstatus(MSTATUS_MPIE), 1);
    assert_eq!(emu.cpu.state.read_mstatus(MSTATUS_MPP), Mode::User as u64);
}

#[test]
fn timer_interrupt_fires_once_mtime_reaches_mtimecmp() {
    let nop = le(0x0000_0013); // addi x0, x0, 0
    let data = nop.repeat(16);

    let mut emu = Emu::new();
    emu.initialize_dram(data);
    emu.initialize_pc(DRAM_BASE);
    emu.cpu.bus.write(CLINT_BASE + 0x4000, 10, DOUBLEWORD).unwrap(); // mtimecmp
    emu.cpu.state.write(MIE, MTIP_BIT);
    emu.cpu.state.write_mstatus(MSTATUS_MIE, 1);

    for _ in 0..10 {
        emu.cpu.step().unwrap();
    }

    assert_eq!(emu.cpu.state.read(MCAUSE), (1u64 << 63) | 7);
}

#[test]
fn undelegated_exception_traps_to_machine_and_stacks_the_interrupt_enable_bit() {
    let data = vec![0u8, 0, 0, 0]; // an all-zero halfword is illegal in every extension this hart decodes

    let mut emu = Emu::new();
    emu.initialize_dram(data);
    emu.initialize_pc(DRAM_BASE);
    emu.cpu.mode = Mode::Supervisor;
    emu.cpu.state.write(MTVEC, 0x8000_0000);
    emu.cpu.state.write(MEDELEG, 0); // nothing delegated: every exception traps to Machine
    emu.cpu.state.write_mstatus(MSTATUS_MIE, 1);

    emu.cpu.step().unwrap_err();

    assert_eq!(emu.cpu.mode, Mode::Machine);
    assert_eq!(emu.cpu.state.read(MCAUSE), 2); // IllegalInstruction
    assert_eq!(emu.cpu.state.read(MEPC), DRAM_BASE);
    assert_eq!(emu.cpu.state.read_mstatus(MSTATUS_MIE), 0);
    assert_eq!(emu.cpu.state.read_mstatus(MSTATUS_MPIE), 1);
    assert_eq!(emu.cpu.state.read_mstatus(MSTATUS_MPP), Mode::Supervisor as u64);
    assert_eq!(emu.cpu.pc, 0x8000_0000);
}
