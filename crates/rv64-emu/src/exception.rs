//! Synchronous exceptions raised by the execute phase.
//!
//! An `Exception` carries the RISC-V exception code (used as `mcause`/`scause`) and the
//! faulting value written to `mtval`/`stval`. The trap classifier in [`crate::trap`] decides,
//! from the variant alone, whether the hart must halt (`Fatal`), whether the trap handler
//! should run and execution continue (`Requested`), or whether it should run silently
//! (`Invisible`).
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Exception {
    #[error("instruction address misaligned")]
    InstructionAddressMisaligned,
    #[error("instruction access fault")]
    InstructionAccessFault,
    #[error("illegal instruction {0:#x}")]
    IllegalInstruction(u64),
    #[error("breakpoint")]
    Breakpoint,
    #[error("load address misaligned")]
    LoadAddressMisaligned,
    #[error("load access fault")]
    LoadAccessFault,
    #[error("store/amo address misaligned")]
    StoreAMOAddressMisaligned,
    #[error("store/amo access fault")]
    StoreAMOAccessFault,
    #[error("environment call from u-mode")]
    EnvironmentCallFromUMode,
    #[error("environment call from s-mode")]
    EnvironmentCallFromSMode,
    #[error("environment call from m-mode")]
    EnvironmentCallFromMMode,
    #[error("instruction page fault at {0:#x}")]
    InstructionPageFault(u64),
    #[error("load page fault at {0:#x}")]
    LoadPageFault(u64),
    #[error("store/amo page fault at {0:#x}")]
    StoreAMOPageFault(u64),
}

/// A `Trap` describes what the hart loop should do once an exception's handler has run
/// (or before it runs, in the `Fatal` case).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    /// The emulator cannot make progress and must halt: illegal instruction, an access
    /// fault, or a misaligned fault.
    Fatal,
    /// A deliberate trap (ECALL, EBREAK). The handler runs and the hart loop continues.
    Requested,
    /// A page fault. The handler runs, the hart loop continues, nothing is logged.
    Invisible,
}

impl Exception {
    /// The exception code placed in `mcause`/`scause` (without the interrupt bit).
    pub fn code(&self) -> u64 {
        match self {
            Exception::InstructionAddressMisaligned => 0,
            Exception::InstructionAccessFault => 1,
            Exception::IllegalInstruction(_) => 2,
            Exception::Breakpoint => 3,
            Exception::LoadAddressMisaligned => 4,
            Exception::LoadAccessFault => 5,
            Exception::StoreAMOAddressMisaligned => 6,
            Exception::StoreAMOAccessFault => 7,
            Exception::EnvironmentCallFromUMode => 8,
            Exception::EnvironmentCallFromSMode => 9,
            Exception::EnvironmentCallFromMMode => 11,
            Exception::InstructionPageFault(_) => 12,
            Exception::LoadPageFault(_) => 13,
            Exception::StoreAMOPageFault(_) => 15,
        }
    }

    /// The value written to `mtval`/`stval` when this exception is delivered.
    pub fn value(&self, pc: u64) -> u64 {
        match self {
            Exception::IllegalInstruction(v) => *v,
            Exception::InstructionPageFault(v)
            | Exception::LoadPageFault(v)
            | Exception::StoreAMOPageFault(v) => *v,
            _ => pc,
        }
    }

    /// Classify the exception for the hart driver loop. See [`Trap`].
    pub fn trap(&self) -> Trap {
        match self {
            Exception::InstructionAddressMisaligned
            | Exception::InstructionAccessFault
            | Exception::IllegalInstruction(_)
            | Exception::LoadAddressMisaligned
            | Exception::LoadAccessFault
            | Exception::StoreAMOAddressMisaligned
            | Exception::StoreAMOAccessFault => Trap::Fatal,
            Exception::Breakpoint
            | Exception::EnvironmentCallFromUMode
            | Exception::EnvironmentCallFromSMode
            | Exception::EnvironmentCallFromMMode => Trap::Requested,
            Exception::InstructionPageFault(_)
            | Exception::LoadPageFault(_)
            | Exception::StoreAMOPageFault(_) => Trap::Invisible,
        }
    }
}
