//! Backing storage for the CSR file. A few supervisor-level addresses (`sstatus`, `sie`,
//! `sip`) aren't separate storage at all — they're masked windows onto the machine-level
//! register, mirroring 4.1 of the privileged spec ("the supervisor should only view CSR
//! state that should be visible to a supervisor-level operating system"). Everything else
//! is a flat 4096-entry array indexed directly by address.
use crate::reg::csr::{
    utils::normalize_range, CsrAddress, CsrFieldRange, CSR_SIZE, MCAUSE, MEDELEG, MEPC, MIDELEG,
    MIE, MIP, MISA, MSTATUS, MTVEC, MXLEN, SCAUSE, SEDELEG, SEPC, SIDELEG, SIE, SSIP_BIT, SSTATUS,
    SSTATUS_MASK, STVEC, TIME, UCAUSE, UEPC, USTATUS, UTVEC,
};
use core::ops::RangeBounds;

/// Extension bits set in `misa` at reset: RV64, atomics, compressed, single/double-precision
/// float, integer mul/div, the base integer ISA, and supervisor/user mode support. F/D are
/// advertised because this hart decodes F/D loads and stores, even without an FPU pipeline
/// behind them.
const MISA_RESET: u64 = (2 << 62)
    | (1 << 20) // U
    | (1 << 18) // S
    | (1 << 12) // M
    | (1 << 8) // I
    | (1 << 5) // F
    | (1 << 3) // D
    | (1 << 2) // C
    | 1; // A

#[derive(Debug)]
pub struct State {
    csrs: [u64; CSR_SIZE],
}

impl State {
    pub fn new() -> Self {
        let mut state = State {
            csrs: [0; CSR_SIZE],
        };
        state.csrs[MISA as usize] = MISA_RESET;
        state
    }

    pub fn reset(&mut self) {
        self.csrs = [0; CSR_SIZE];
        self.csrs[MISA as usize] = MISA_RESET;
    }

    pub fn increment_time(&mut self) {
        self.csrs[TIME as usize] = self.csrs[TIME as usize].wrapping_add(1);
    }

    pub fn read(&self, addr: CsrAddress) -> u64 {
        match addr {
            SSTATUS => self.csrs[MSTATUS as usize] & SSTATUS_MASK,
            SIE => self.csrs[MIE as usize] & self.csrs[MIDELEG as usize],
            SIP => self.csrs[MIP as usize] & self.csrs[MIDELEG as usize],
            raw => self.csrs[raw as usize],
        }
    }

    pub fn write(&mut self, addr: CsrAddress, val: u64) {
        match addr {
            // Read-only identification registers silently ignore writes.
            crate::reg::csr::MVENDORID
            | crate::reg::csr::MARCHID
            | crate::reg::csr::MIMPID
            | crate::reg::csr::MHARTID => {}
            SSTATUS => {
                let mstatus = self.csrs[MSTATUS as usize];
                self.csrs[MSTATUS as usize] = (mstatus & !SSTATUS_MASK) | (val & SSTATUS_MASK);
            }
            SIE => {
                let deleg = self.csrs[MIDELEG as usize];
                self.csrs[MIE as usize] = (self.csrs[MIE as usize] & !deleg) | (val & deleg);
            }
            SIP => {
                let deleg = SSIP_BIT & self.csrs[MIDELEG as usize];
                self.csrs[MIP as usize] = (self.csrs[MIP as usize] & !deleg) | (val & deleg);
            }
            raw => self.csrs[raw as usize] = val,
        }
    }

    pub fn read_bit(&self, addr: CsrAddress, bit: usize) -> u64 {
        debug_assert!(bit < MXLEN, "CSR bit index out of range");
        (self.read(addr) >> bit) & 1
    }

    pub fn read_bits<T: RangeBounds<usize>>(&self, addr: CsrAddress, range: T) -> u64 {
        let span = normalize_range(&range, MXLEN);
        debug_assert!(span.start < span.end && span.end <= MXLEN, "invalid CSR field range");

        let high_mask = if span.end == MXLEN { 0 } else { !0 << span.end };
        (self.read(addr) & !high_mask) >> span.start
    }

    pub fn write_bit(&mut self, addr: CsrAddress, bit: usize, val: u64) {
        debug_assert!(bit < MXLEN, "CSR bit index out of range");
        debug_assert!(val <= 1, "write_bit takes a single bit, got {val}");

        let current = self.read(addr);
        let next = if val & 1 == 1 {
            current | (1 << bit)
        } else {
            current & !(1 << bit)
        };
        self.write(addr, next);
    }

    pub fn write_bits<T: RangeBounds<usize>>(&mut self, addr: CsrAddress, range: T, val: u64) {
        let span = normalize_range(&range, MXLEN);
        let width = span.end - span.start;
        debug_assert!(span.start < span.end && span.end <= MXLEN, "invalid CSR field range");
        debug_assert!(width == MXLEN || val >> width == 0, "value overflows CSR field");

        let keep_mask = (!0u64 << span.end) | !(!0u64 << span.start);
        self.write(addr, (self.read(addr) & keep_mask) | (val << span.start));
    }

    pub fn read_sstatus(&self, range: CsrFieldRange) -> u64 {
        self.read_bits(SSTATUS, range)
    }

    pub fn read_mstatus(&self, range: CsrFieldRange) -> u64 {
        self.read_bits(MSTATUS, range)
    }

    pub fn write_sstatus(&mut self, range: CsrFieldRange, val: u64) {
        self.write_bits(SSTATUS, range, val);
    }

    pub fn write_mstatus(&mut self, range: CsrFieldRange, val: u64) {
        self.write_bits(MSTATUS, range, val);
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for State {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let rows: [[(&str, u64); 3]; 4] = [
            [
                ("mstatus", self.read(MSTATUS)),
                ("mtvec", self.read(MTVEC)),
                ("mepc", self.read(MEPC)),
            ],
            [
                ("mcause", self.read(MCAUSE)),
                ("medeleg", self.read(MEDELEG)),
                ("mideleg", self.read(MIDELEG)),
            ],
            [
                ("sstatus", self.read(SSTATUS)),
                ("stvec", self.read(STVEC)),
                ("sepc", self.read(SEPC)),
            ],
            [
                ("scause", self.read(SCAUSE)),
                ("sedeleg", self.read(SEDELEG)),
                ("sideleg", self.read(SIDELEG)),
            ],
        ];
        for (i, row) in rows.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            for (name, val) in row {
                write!(f, "{name:>8}={val:#018x} ")?;
            }
        }
        write!(
            f,
            "\n{:>8}={:#018x} {:>8}={:#018x} {:>8}={:#018x} {:>8}={:#018x}",
            "ustatus",
            self.read(USTATUS),
            "utvec",
            self.read(UTVEC),
            "uepc",
            self.read(UEPC),
            "ucause",
            self.read(UCAUSE),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reg::csr::{MSTATUS_MIE, MSTATUS_MPP, XSTATUS_SPP};

    #[test]
    fn sstatus_is_a_masked_window_onto_mstatus() {
        let mut state = State::new();
        state.write_mstatus(MSTATUS_MIE, 1);
        state.write_mstatus(MSTATUS_MPP, 0b11);
        // MPP isn't visible through sstatus.
        assert_eq!(state.read_sstatus(XSTATUS_SPP.clone()), 0);
        state.write_sstatus(XSTATUS_SPP.clone(), 1);
        assert_eq!(state.read_mstatus(XSTATUS_SPP), 1);
    }

    #[test]
    fn sie_only_exposes_bits_delegated_via_mideleg() {
        let mut state = State::new();
        state.write(MIDELEG, 0b0010_0000); // delegate bit 5 (STIP) only
        state.write(MIE, 0b1010_0000); // bits 5 and 7 requested
        assert_eq!(state.read(SIE), 0b0010_0000);
    }

    #[test]
    fn write_bits_round_trips_an_arbitrary_field() {
        let mut state = State::new();
        state.write_bits(MCAUSE, 0..4, 0b1011);
        assert_eq!(state.read_bits(MCAUSE, 0..4), 0b1011);
    }

    #[test]
    fn reset_restores_the_isa_register_and_clears_everything_else() {
        let mut state = State::new();
        state.write(MCAUSE, 42);
        state.reset();
        assert_eq!(state.read(MCAUSE), 0);
        assert_eq!(state.read(MISA), MISA_RESET);
    }
}
