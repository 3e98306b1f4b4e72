//! Asynchronous interrupts, polled once at the top of every hart step.
//!
//! Polling order mirrors the priority the privileged spec assigns the standard causes:
//! machine-external, machine-software, machine-timer, then the supervisor equivalents.
use crate::reg::csr::{
    MEIP_BIT, MSIP_BIT, MTIP_BIT, SEIP_BIT, SSIP_BIT, STIP_BIT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    MachineExternalInterrupt,
    MachineSoftwareInterrupt,
    MachineTimerInterrupt,
    SupervisorExternalInterrupt,
    SupervisorSoftwareInterrupt,
    SupervisorTimerInterrupt,
}

impl Interrupt {
    /// The interrupt code, as it appears in `mcause`/`scause` without the interrupt bit.
    pub fn code(&self) -> u64 {
        match self {
            Interrupt::SupervisorSoftwareInterrupt => 1,
            Interrupt::MachineSoftwareInterrupt => 3,
            Interrupt::SupervisorTimerInterrupt => 5,
            Interrupt::MachineTimerInterrupt => 7,
            Interrupt::SupervisorExternalInterrupt => 9,
            Interrupt::MachineExternalInterrupt => 11,
        }
    }

    /// The `mip`/`sip` bit this interrupt corresponds to.
    pub fn pending_bit(&self) -> u64 {
        match self {
            Interrupt::SupervisorSoftwareInterrupt => SSIP_BIT,
            Interrupt::MachineSoftwareInterrupt => MSIP_BIT,
            Interrupt::SupervisorTimerInterrupt => STIP_BIT,
            Interrupt::MachineTimerInterrupt => MTIP_BIT,
            Interrupt::SupervisorExternalInterrupt => SEIP_BIT,
            Interrupt::MachineExternalInterrupt => MEIP_BIT,
        }
    }
}
