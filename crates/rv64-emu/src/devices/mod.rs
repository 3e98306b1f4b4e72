//! MMIO peripherals owned by the [`crate::bus::Bus`]: the timer/software-interrupt
//! controller (CLINT), the external-interrupt controller (PLIC), a 16550-subset UART and
//! a legacy VirtIO block device.

pub mod clint;
pub mod plic;
pub mod uart;
pub mod virtio;
