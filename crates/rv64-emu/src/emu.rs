//! Emulator module for RV64: owns the single hart and drives its fetch-decode-execute loop.
use crate::bus::DRAM_BASE;
use crate::cpu::CPU;
use tracing::{debug, warn};

/// A guest write to this physical address, under `--riscv-test`, ends the run: an odd value
/// is `(code << 1) | 1`, even/zero means pass.
const TOHOST_POLL_LIMIT: u64 = 0;

#[derive(Debug)]
pub struct Emu {
    /// The single hart. Public so a CLI (or a test) can seed registers/CSRs directly before
    /// calling [`Emu::start`], and inspect them afterwards.
    pub cpu: CPU,
    /// When set, `start` treats a store to this address as the riscv-tests `tohost` signal
    /// and returns instead of running until a fatal trap.
    tohost: Option<u64>,
}

impl Emu {
    pub fn new() -> Self {
        Self {
            cpu: CPU::new(),
            tohost: None,
        }
    }

    /// Reset the hart and clear the configured `tohost` address.
    pub fn restart(&mut self) {
        self.cpu.reset();
        self.tohost = None;
    }

    /// Load `data` into DRAM at offset 0 (physical address `DRAM_BASE`), replacing whatever
    /// was there. `data` is expected to already be a raw RV64 image; ELF parsing is a CLI
    /// concern, not the emulator's.
    pub fn initialize_dram(&mut self, data: Vec<u8>) {
        self.cpu.bus.dram = crate::mem::Dram::new(data, crate::primitives::constants::DRAM_SIZE);
    }

    /// Load `disk` as the VirtIO block device's backing image.
    pub fn initialize_disk(&mut self, disk: Vec<u8>) {
        self.cpu.bus.virtio = crate::devices::virtio::Virtio::new(disk, None);
    }

    /// Rebuild the boot ROM with `dtb` appended after the reset stub.
    pub fn initialize_rom(&mut self, dtb: Vec<u8>) {
        self.cpu.bus.rom = crate::rom::Rom::new(dtb);
    }

    /// Set the program counter the hart resumes at. `a1` already carries the physical
    /// address of the device tree blob from [`IntRegister::new`][crate::reg::i_reg::IntRegister::new].
    pub fn initialize_pc(&mut self, pc: u64) {
        self.cpu.pc = pc;
    }

    /// Enable the riscv-tests `tohost` termination convention: a store to `addr` ends the run.
    pub fn enable_riscv_test(&mut self, addr: u64) {
        self.tohost = Some(addr);
    }

    /// Run the hart until a fatal exception halts it, or (with `--riscv-test` semantics) the
    /// guest signals completion through `tohost`. `Err` carries the fatal exception that
    /// stopped the hart; a caller driving exit status should treat `Ok` as success.
    pub fn start(&mut self) -> Result<(), crate::exception::Exception> {
        loop {
            if let Some(addr) = self.tohost {
                if let Ok(value) = self.cpu.bus.dram.read(addr, crate::primitives::constants::DOUBLEWORD) {
                    if value != TOHOST_POLL_LIMIT {
                        debug!(value, "tohost signalled completion");
                        return Ok(());
                    }
                }
            }

            match self.cpu.step() {
                Ok(()) => {}
                Err(exception) => {
                    warn!(%exception, pc = format_args!("{:#x}", self.cpu.pc), "hart halted on fatal trap");
                    return Err(exception);
                }
            }
        }
    }
}

impl Default for Emu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reg::csr::MEPC;

    #[test]
    fn addi_then_illegal_instruction_halts_with_mepc_past_the_fault() {
        let mut emu = Emu::new();
        let data = vec![
            0x93, 0x0f, 0x50, 0x00, // addi x31, x0, 5
            0xaa, 0xaa, 0xaa, 0xaa, // invalid
            0x93, 0x0f, 0x50, 0x00, // addi x31, x0, 5
        ];
        emu.initialize_dram(data);
        emu.initialize_pc(DRAM_BASE);

        assert!(emu.start().is_err());

        assert_eq!(8 + DRAM_BASE, emu.cpu.state.read(MEPC));
    }

    #[test]
    fn tohost_nonzero_write_ends_the_run() {
        let mut emu = Emu::new();
        let tohost = DRAM_BASE + 0x1000;
        emu.initialize_dram(vec![]);
        emu.initialize_pc(DRAM_BASE);
        emu.enable_riscv_test(tohost);
        emu.cpu
            .bus
            .dram
            .write(tohost, 1, crate::primitives::constants::DOUBLEWORD)
            .unwrap();

        assert!(emu.start().is_ok());

        // start() returned instead of stepping a hart with no instructions loaded.
        assert_eq!(emu.cpu.pc, DRAM_BASE);
    }
}
