//! Core Local Interruptor: `mtime`, `mtimecmp`, and the `msip` software-interrupt latch.
use crate::exception::Exception;
use crate::primitives::constants::{CLINT_BASE, DOUBLEWORD};
use crate::reg::csr::{state::State, MIP, MSIP_BIT, MTIP_BIT};

const MSIP: u64 = CLINT_BASE;
const MTIMECMP: u64 = CLINT_BASE + 0x4000;
const MTIME: u64 = CLINT_BASE + 0xbff8;

#[derive(Debug)]
pub struct Clint {
    msip: u64,
    mtimecmp: u64,
    mtime: u64,
}

impl Clint {
    pub fn new() -> Self {
        Self {
            msip: 0,
            mtimecmp: 0,
            mtime: 0,
        }
    }

    pub fn read(&self, addr: u64, size: u8) -> Result<u64, Exception> {
        if size != DOUBLEWORD {
            return Err(Exception::LoadAccessFault);
        }
        match addr {
            MSIP => Ok(self.msip),
            MTIMECMP => Ok(self.mtimecmp),
            MTIME => Ok(self.mtime),
            _ => Ok(0),
        }
    }

    pub fn write(&mut self, addr: u64, value: u64, size: u8) -> Result<(), Exception> {
        if size != DOUBLEWORD {
            return Err(Exception::StoreAMOAccessFault);
        }
        match addr {
            MSIP => self.msip = value & 1,
            MTIMECMP => self.mtimecmp = value,
            MTIME => self.mtime = value,
            _ => {}
        }
        Ok(())
    }

    /// Advance `mtime` by one and update `MIP.MTIP`/`MIP.MSIP` in the CSR file.
    pub fn tick(&mut self, state: &mut State) {
        self.mtime = self.mtime.wrapping_add(1);
        if self.mtime >= self.mtimecmp {
            state.write(MIP, state.read(MIP) | MTIP_BIT);
        } else {
            state.write(MIP, state.read(MIP) & !MTIP_BIT);
        }
        if self.msip == 1 {
            state.write(MIP, state.read(MIP) | MSIP_BIT);
        }
    }
}

impl Default for Clint {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_fires_once_mtime_reaches_mtimecmp() {
        let mut clint = Clint::new();
        let mut state = State::new();
        clint.write(MTIMECMP, 3, DOUBLEWORD).unwrap();
        for _ in 0..3 {
            clint.tick(&mut state);
        }
        assert_eq!(state.read(MIP) & MTIP_BIT, MTIP_BIT);
    }

    #[test]
    fn msip_latches_software_interrupt() {
        let mut clint = Clint::new();
        let mut state = State::new();
        clint.write(MSIP, 1, DOUBLEWORD).unwrap();
        clint.tick(&mut state);
        assert_eq!(state.read(MIP) & MSIP_BIT, MSIP_BIT);
    }
}
