//! Global constants and small shared primitives used across the emulator.

pub mod constants;
