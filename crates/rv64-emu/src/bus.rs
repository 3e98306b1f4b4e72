//! The physical address router. Dispatches a `(addr, size, load|store)` access to
//! whichever component owns that range; stores to ROM or an unmapped hole fault, as do
//! loads from an unmapped hole.
use crate::devices::clint::Clint;
use crate::devices::plic::Plic;
use crate::devices::uart::Uart;
use crate::devices::virtio::Virtio;
use crate::exception::Exception;
use crate::mem::Dram;
use crate::primitives::constants::{
    CLINT_BASE, CLINT_SIZE, DRAM_SIZE, PLIC_BASE, PLIC_SIZE, ROM_BASE, ROM_SIZE, UART_BASE,
    UART_SIZE, VIRTIO_BASE, VIRTIO_SIZE,
};
use crate::reg::csr::state::State;
use crate::rom::Rom;

/// Re-exported so callers (and `Emu::initialize_pc`) need only reach through `bus::`.
pub use crate::primitives::constants::DRAM_BASE;

#[derive(Debug)]
pub struct Bus {
    pub clint: Clint,
    pub plic: Plic,
    pub uart: Uart,
    pub virtio: Virtio,
    pub dram: Dram,
    pub rom: Rom,
}

impl Bus {
    pub fn new(code: Vec<u8>, dtb: Vec<u8>, disk: Vec<u8>, disk_file: Option<std::fs::File>) -> Self {
        Self {
            clint: Clint::new(),
            plic: Plic::new(),
            uart: Uart::new(),
            virtio: Virtio::new(disk, disk_file),
            dram: Dram::new(code, DRAM_SIZE),
            rom: Rom::new(dtb),
        }
    }

    pub fn read(&mut self, addr: u64, size: u8) -> Result<u64, Exception> {
        match addr {
            ROM_BASE..=END_ROM => self.rom.read(addr, size),
            CLINT_BASE..=END_CLINT => self.clint.read(addr, size),
            PLIC_BASE..=END_PLIC => self.plic.read(addr, size),
            UART_BASE..=END_UART => self.uart.read(addr, size),
            VIRTIO_BASE..=END_VIRTIO => self.virtio.read(addr, size),
            DRAM_BASE..=END_DRAM => self.dram.read(addr, size),
            _ => Err(Exception::LoadAccessFault),
        }
    }

    pub fn write(&mut self, addr: u64, value: u64, size: u8) -> Result<(), Exception> {
        match addr {
            ROM_BASE..=END_ROM => Err(Exception::StoreAMOAccessFault),
            CLINT_BASE..=END_CLINT => self.clint.write(addr, value, size),
            PLIC_BASE..=END_PLIC => self.plic.write(addr, value, size),
            UART_BASE..=END_UART => self.uart.write(addr, value, size),
            VIRTIO_BASE..=END_VIRTIO => self.virtio.write(addr, value, size),
            DRAM_BASE..=END_DRAM => self.dram.write(addr, value, size),
            _ => Err(Exception::StoreAMOAccessFault),
        }
    }

    /// Advance the components that maintain time. Called once per hart step.
    pub fn tick(&mut self, state: &mut State) {
        self.clint.tick(state);
    }
}

const END_ROM: u64 = ROM_BASE + ROM_SIZE - 1;
const END_CLINT: u64 = CLINT_BASE + CLINT_SIZE - 1;
const END_PLIC: u64 = PLIC_BASE + PLIC_SIZE - 1;
const END_UART: u64 = UART_BASE + UART_SIZE - 1;
const END_VIRTIO: u64 = VIRTIO_BASE + VIRTIO_SIZE - 1;
const END_DRAM: u64 = DRAM_BASE + DRAM_SIZE - 1;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::constants::DOUBLEWORD;

    #[test]
    fn store_to_rom_faults() {
        let mut bus = Bus::new(vec![], vec![], vec![], None);
        assert!(matches!(
            bus.write(ROM_BASE, 0, DOUBLEWORD),
            Err(Exception::StoreAMOAccessFault)
        ));
    }

    #[test]
    fn load_from_unmapped_hole_faults() {
        let mut bus = Bus::new(vec![], vec![], vec![], None);
        assert!(matches!(bus.read(0x2000_0000, DOUBLEWORD), Err(Exception::LoadAccessFault)));
    }

    #[test]
    fn dram_roundtrip_through_bus() {
        let mut bus = Bus::new(vec![], vec![], vec![], None);
        bus.write(DRAM_BASE, 42, DOUBLEWORD).unwrap();
        assert_eq!(bus.read(DRAM_BASE, DOUBLEWORD).unwrap(), 42);
    }
}
