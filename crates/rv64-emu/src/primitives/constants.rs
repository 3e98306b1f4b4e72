//! This module holds global constants employed by the emulator: register counts,
//! access widths and the physical memory map shared by the bus and every device.

/// This is the number of registers for this VM
pub const NUM_REGISTERS: usize = 32;

/// One byte len
pub const BYTE: u8 = 8;

/// Half word len
pub const HALFWORD: u8 = 16;

/// Whole word len
pub const WORD: u8 = 32;

/// Doubleword len
pub const DOUBLEWORD: u8 = 64;

/// riscv-pk is passing x10 and x11 registers to kernel. x11 is expected to have the pointer to DTB.
/// https://github.com/riscv/riscv-pk/blob/master/machine/mentry.S#L233-L235
pub const POINTER_TO_DTB: u64 = 0x1020;

/// An address where the RAM starts reading from.
pub const RAM_BASE: u64 = DRAM_BASE;

/// Size of the RAM.
pub const RAM_SIZE: u64 = DRAM_SIZE;

/// Start address of the boot ROM. `pc` resets here.
pub const ROM_BASE: u64 = 0x1000;
/// Size of the boot ROM aperture.
pub const ROM_SIZE: u64 = 0xf000;

/// Start address of the CLINT (Core Local Interruptor) registers.
pub const CLINT_BASE: u64 = 0x0200_0000;
/// Size of the CLINT aperture.
pub const CLINT_SIZE: u64 = 0x10000;

/// Start address of the PLIC (Platform-Level Interrupt Controller) registers.
pub const PLIC_BASE: u64 = 0x0c00_0000;
/// Size of the PLIC aperture.
pub const PLIC_SIZE: u64 = 0x400000;

/// Start address of the UART0 registers.
pub const UART_BASE: u64 = 0x1000_0000;
/// Size of the UART0 aperture.
pub const UART_SIZE: u64 = 0x100;

/// Start address of the VirtIO-MMIO registers.
pub const VIRTIO_BASE: u64 = 0x1000_1000;
/// Size of the VirtIO-MMIO aperture.
pub const VIRTIO_SIZE: u64 = 0x1000;

/// Start address of DRAM. The loaded kernel/binary is placed here.
pub const DRAM_BASE: u64 = 0x8000_0000;
/// Size of DRAM (1 GiB by default).
pub const DRAM_SIZE: u64 = 0x4000_0000;
/// End address of DRAM (exclusive).
pub const DRAM_END: u64 = DRAM_BASE + DRAM_SIZE;

/// IRQ number raised by UART0.
pub const UART_IRQ: u64 = 10;
/// IRQ number raised by the VirtIO block device.
pub const VIRTIO_IRQ: u64 = 1;
