//! rv64-emu command-line front end.
use std::fs;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use command::Cli;
use pretty_print::{print_fatal_halt, print_startup_banner};
use rv64_emu::bus::DRAM_BASE;
use rv64_emu::emu::Emu;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

mod command;
mod pretty_print;

/// Loading a guest image and handing the emulator a physical entry point is an external
/// (CLI-side) concern; the emulator crate only ever sees raw bytes to drop into DRAM.
mod loader;

fn init_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::fmt().with_env_filter(filter).with_target(false).init();
}

fn main() -> Result<ExitCode> {
    init_logger();

    let cli = Cli::parse();
    print_startup_banner(&cli.binary.display().to_string(), cli.riscv_test);

    let raw = fs::read(&cli.binary)
        .with_context(|| format!("reading guest image {}", cli.binary.display()))?;
    let loaded = loader::load(&raw).context("loading guest image")?;
    info!(entry = format_args!("{:#x}", loaded.entry), "guest image loaded");

    let mut emu = Emu::new();
    emu.initialize_dram(loaded.dram);
    emu.initialize_pc(loaded.entry);

    if let Some(rfsimg) = &cli.rfsimg {
        let disk = fs::read(rfsimg)
            .with_context(|| format!("reading disk image {}", rfsimg.display()))?;
        emu.initialize_disk(disk);
    }

    if cli.riscv_test {
        // riscv-tests places `tohost` just past the guest image; xv6/Linux images never
        // set this flag, so the fixed offset only matters in test mode.
        emu.enable_riscv_test(DRAM_BASE + 0x1000);
    }

    match emu.start() {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(exception) => {
            print_fatal_halt(&emu.cpu, &exception.to_string());
            Ok(ExitCode::FAILURE)
        }
    }
}
