//! Startup banner and halt report, printed the way a terminal-facing emulator front end would.
use colored::Colorize;

pub fn print_startup_banner(binary: &str, riscv_test: bool) {
    println!("\n{}", "╔═════════════════════════════════════════════╗".bright_cyan());
    println!(
        "{} {}  {}",
        "║".bright_cyan(),
        " RV64-EMU ".bold(),
        "║".bright_cyan()
    );
    println!(
        "{} booting {}{}",
        "║".bright_cyan(),
        binary.bright_blue(),
        if riscv_test { " (riscv-test mode)".yellow().to_string() } else { String::new() }
    );
    println!("{}", "╚═════════════════════════════════════════════╝".bright_cyan());
    println!();
}

/// Dump x/F registers and the trap CSRs to stderr, as the emulator's documented
/// error-handling contract requires for a fatal halt.
pub fn print_fatal_halt(cpu: &rv64_emu::cpu::CPU, cause: &str) {
    eprintln!("\n{}", "HART HALTED ON FATAL TRAP".red().bold());
    eprintln!("-------------------------");
    eprintln!("pc:    {}", format!("{:#x}", cpu.pc).bright_yellow());
    eprintln!("cause: {}", cause.bright_red());
    eprintln!("{}", cpu.state);
    eprintln!("{}", cpu.int_regs);
    eprintln!("{}", cpu.float_regs);
    eprintln!("-------------------------\n");
}
