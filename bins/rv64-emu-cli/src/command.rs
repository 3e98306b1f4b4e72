//! CLI arguments for the rv64-emu binary.
use std::path::PathBuf;

use clap::Parser;

/// A RISC-V RV64GC emulator, enough to boot an xv6-class kernel or small Linux image.
#[derive(Parser)]
#[clap(name = "rv64-emu", version, about, long_about = None)]
pub struct Cli {
    /// Guest image to run: a raw RV64 binary, or an ELF file (detected by its magic).
    #[clap(long)]
    pub binary: PathBuf,

    /// VirtIO block device backing file.
    #[clap(long)]
    pub rfsimg: Option<PathBuf>,

    /// Enable the riscv-tests `tohost` termination convention.
    #[clap(long)]
    pub riscv_test: bool,
}
