//! CPU module for the RV64 emulator.
use crate::{
    bus::Bus,
    cpu::{compressed_exec::execute_compressed_inner, general_exec::execute_general_inner},
    devices::virtio,
    exception::{Exception, Trap},
    interrupt::Interrupt,
    primitives::constants::{UART_IRQ, VIRTIO_IRQ},
    reg::{
        csr::{
            state::State, MEIP_BIT, MIE, MIP, MSIP_BIT, MSTATUS_MIE, MSTATUS_MPP, MSTATUS_MPRV,
            MTIP_BIT, SATP, SEIP_BIT, SSIP_BIT, STIP_BIT, XSTATUS_SIE,
        },
        f_reg::FloatRegister,
        i_reg::IntRegister,
    },
    trap::{take_trap_on_exception, take_trap_on_interrupt},
};
use std::collections::BTreeMap;
use tracing::warn;

pub mod compressed_exec;
pub mod general_exec;


/// The number of registers.
pub const REGISTERS_COUNT: usize = 32;
/// The page size (4 KiB) for the virtual memory system.
const PAGE_SIZE: u64 = 4096;
/// Number of levels in the Sv39 radix-tree page table.
const SV39_LEVELS: usize = 3;
/// Size in bytes of one page-table entry.
const PTE_SIZE: u64 = 8;
/// `satp.MODE` value that selects Sv39 (see table 4.3 of the privileged spec).
const SATP_MODE_SV39: u64 = 8;

const PTE_V: u64 = 1 << 0;
const PTE_R: u64 = 1 << 1;
const PTE_W: u64 = 1 << 2;
const PTE_X: u64 = 1 << 3;
const PTE_A: u64 = 1 << 6;
const PTE_D: u64 = 1 << 7;

/// 8 bits. 1 byte.
pub const BYTE: u8 = 8;
/// 16 bits. 2 bytes.
pub const HALFWORD: u8 = 16;
/// 32 bits. 4 bytes.
pub const WORD: u8 = 32;
/// 64 bits. 8 bytes.
pub const DOUBLEWORD: u8 = 64;

/// riscv-pk is passing x10 and x11 registers to kernel. x11 is expected to have the pointer to DTB.
/// https://github.com/riscv/riscv-pk/blob/master/machine/mentry.S#L233-L235
pub const POINTER_TO_DTB: u64 = 0x1020;


/// Access type that is used in the virtual address translation process. It decides which exception
/// should raises (InstructionPageFault, LoadPageFault or StoreAMOPageFault).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub enum AccessType {
    /// Raises the exception InstructionPageFault. It is used for an instruction fetch.
    Instruction,
    /// Raises the exception LoadPageFault.
    Load,
    /// Raises the exception StoreAMOPageFault.
    Store,
}

/// The privileged mode.
#[derive(Debug, PartialEq, PartialOrd, Eq, Copy, Clone)]
pub enum Mode {
    User = 0b00,
    Supervisor = 0b01,
    Machine = 0b11,
    Debug,
}

#[derive(Debug)]
pub struct CPU {
    /// Interger registers
    pub int_regs: IntRegister,
    /// Floating-point registers
    pub float_regs: FloatRegister,
    /// Program counter.
    pub pc: u64,
    /// Control and status registers (CSR).
    pub state: State,
    /// Privilege level.
    pub mode: Mode,
    /// System bus.
    pub bus: Bus,
    /// SV39 paging flag.
    enable_paging: bool,
    /// Physical page number (PPN) × PAGE_SIZE (4096).
    page_table: u64,
    /// A set of bytes that subsumes the bytes in the addressed word used in
    /// load-reserved/store-conditional instructions.
    reservation_set: Vec<u64>,
    /// Idle state. True when WFI is called, and becomes false when an interrupt happens.
    pub idle: bool,
    /// Counter of each instructions for debug.
    pub inst_counter: BTreeMap<String, u64>,
    /// The count flag. Count the number of each instruction executed.
    pub is_count: bool,
    /// Previous instruction. This is for debug.
    pub pre_inst: u64,
    /// Decoded-fetch cache: `pc -> (raw instruction, size in bits)`. Avoids re-walking the
    /// page table on every fetch of a hot loop; invalidated on FENCE.I, xRET, a trap, or
    /// SFENCE.VMA, each of which can change what lives at a given `pc`.
    icache: BTreeMap<u64, (u64, u8)>,
}

impl CPU {
    /// Create a new `CPU` object.
    pub fn new() -> CPU {
        CPU {
            int_regs: IntRegister::new(),
            float_regs: FloatRegister::new(),
            pc: 0,
            state: State::new(),
            mode: Mode::Machine,
            bus: Bus::new(vec![], vec![], vec![], None),
            enable_paging: false,
            page_table: 0,
            reservation_set: Vec::new(),
            idle: false,
            inst_counter: BTreeMap::new(),
            is_count: false,
            pre_inst: 0,
            icache: BTreeMap::new(),
        }
    }

    /// Drop every cached fetch. Called after FENCE.I, SFENCE.VMA, xRET and trap delivery.
    pub fn invalidate_icache(&mut self) {
        self.icache.clear();
    }

    /// Reset CPU states.
    pub fn reset(&mut self) {
        self.pc = 0;
        self.mode = Mode::Machine;
        self.state.reset();
        for i in 0..REGISTERS_COUNT {
            self.int_regs.write(i as u64, 0);
            self.float_regs.write(i as u64, 0.0);
        }
        self.invalidate_icache();
    }

    /// Check interrupt flags for all devices that can interrupt.
    pub fn check_pending_interrupt(&mut self) -> Option<Interrupt> {
        // global interrupt: PLIC (Platform Local Interrupt Controller) dispatches global
        //                   interrupts to multiple harts.
        // local interrupt: CLINT (Core Local Interrupter) dispatches local interrupts to a hart
        //                  which directly connected to CLINT.

        // 3.1.6.1 Privilege and Global Interrupt-Enable Stack in mstatus register
        // "When a hart is executing in privilege mode x, interrupts are globally enabled when
        // xIE=1 and globally disabled when xIE=0."
        match self.mode {
            Mode::Machine => {
                // Check if the MIE bit is enabled.
                if self.state.read_mstatus(MSTATUS_MIE) == 0 {
                    return None;
                }
            }
            Mode::Supervisor => {
                // Check if the SIE bit is enabled.
                if self.state.read_sstatus(XSTATUS_SIE) == 0 {
                    return None;
                }
            }
            _ => {}
        }

        // TODO: Take interrupts based on priorities.

        // Check external interrupt for uart and virtio.
        let irq;
        if self.bus.uart.is_interrupting() {
            irq = UART_IRQ;
        } else if self.bus.virtio.is_interrupting() {
            // An interrupt is raised after a disk access is done. A malformed virtio ring
            // (bad descriptor address from the guest) must not bring down the host process.
            if let Err(e) = virtio::disk_access(self) {
                warn!(error = %e, "virtio disk access failed, dropping this request");
            }
            irq = VIRTIO_IRQ;
        } else {
            irq = 0;
        }

        if irq != 0 {
            // TODO: assume that hart is 0
            // TODO: write a value to MCLAIM if the mode is machine
            self.bus.plic.update_pending(irq);
            self.state.write(MIP, self.state.read(MIP) | SEIP_BIT);
        }

        // 3.1.9 Machine Interrupt Registers (mip and mie)
        // "An interrupt i will be taken if bit i is set in both mip and mie, and if interrupts are
        // globally enabled. By default, M-mode interrupts are globally enabled if the hart’s
        // current privilege mode is less than M, or if the current privilege mode is M and the MIE
        // bit in the mstatus register is set. If bit i in mideleg is set, however, interrupts are
        // considered to be globally enabled if the hart’s current privilege mode equals the
        // delegated privilege mode (S or U) and that mode’s interrupt enable bit (SIE or UIE in
        // mstatus) is set, or if the current privilege mode is less than the delegated privilege
        // mode."
        let pending = self.state.read(MIE) & self.state.read(MIP);

        if (pending & MEIP_BIT) != 0 {
            self.state.write(MIP, self.state.read(MIP) & !MEIP_BIT);
            return Some(Interrupt::MachineExternalInterrupt);
        }
        if (pending & MSIP_BIT) != 0 {
            self.state.write(MIP, self.state.read(MIP) & !MSIP_BIT);
            return Some(Interrupt::MachineSoftwareInterrupt);
        }
        if (pending & MTIP_BIT) != 0 {
            self.state.write(MIP, self.state.read(MIP) & !MTIP_BIT);
            return Some(Interrupt::MachineTimerInterrupt);
        }
        if (pending & SEIP_BIT) != 0 {
            self.state.write(MIP, self.state.read(MIP) & !SEIP_BIT);
            return Some(Interrupt::SupervisorExternalInterrupt);
        }
        if (pending & SSIP_BIT) != 0 {
            self.state.write(MIP, self.state.read(MIP) & !SSIP_BIT);
            return Some(Interrupt::SupervisorSoftwareInterrupt);
        }
        if (pending & STIP_BIT) != 0 {
            self.state.write(MIP, self.state.read(MIP) & !STIP_BIT);
            return Some(Interrupt::SupervisorTimerInterrupt);
        }

        return None;
    }

    /// Re-derive the root page table address and whether Sv39 paging is active from `satp`.
    /// Called after any write to `satp` (see the `sfence.vma`/CSR-write arms in
    /// [`general_exec`](super::general_exec)).
    pub fn update_paging(&mut self) {
        let ppn = self.state.read_bits(SATP, ..44);
        let mode = self.state.read_bits(SATP, 60..);
        self.page_table = ppn * PAGE_SIZE;
        self.enable_paging = mode == SATP_MODE_SV39;
    }

    /// Builds the page-fault variant matching `access_type`, since 4.3.2's walk raises the same
    /// shape of fault from five different failure points.
    fn page_fault(access_type: AccessType, addr: u64) -> Exception {
        match access_type {
            AccessType::Instruction => Exception::InstructionPageFault(addr),
            AccessType::Load => Exception::LoadPageFault(addr),
            AccessType::Store => Exception::StoreAMOPageFault(addr),
        }
    }

    /// Walks the three-level Sv39 radix tree from the root down to a leaf PTE, per 4.3.2 steps
    /// 1-4. Returns the leaf PTE alongside the level it was found at (2 = a 1 GiB superpage,
    /// 1 = 2 MiB, 0 = an ordinary 4 KiB page).
    fn walk_page_table(
        &mut self,
        vpn: [u64; SV39_LEVELS],
        access_type: AccessType,
        fault_addr: u64,
    ) -> Result<(u64, usize), Exception> {
        let mut table_addr = self.page_table;
        let mut level = SV39_LEVELS - 1;
        loop {
            let pte = self.bus.read(table_addr + vpn[level] * PTE_SIZE, DOUBLEWORD)?;
            let valid = pte & PTE_V != 0;
            let readable = pte & PTE_R != 0;
            let writable = pte & PTE_W != 0;
            let executable = pte & PTE_X != 0;

            if !valid || (!readable && writable) {
                return Err(Self::page_fault(access_type, fault_addr));
            }
            if readable || executable {
                return Ok((pte, level));
            }
            // A pointer PTE: descend one level.
            if level == 0 {
                return Err(Self::page_fault(access_type, fault_addr));
            }
            level -= 1;
            table_addr = ((pte >> 10) & 0x0fff_ffff_ffff) * PAGE_SIZE;
        }
    }

    /// Translate a virtual address to a physical address through the Sv39 scheme (4.3.2 of the
    /// privileged spec). A no-op while paging is disabled or the hart is in M-mode, since
    /// `satp` only governs S/U-mode translation.
    ///
    /// Step 5 (the R/W/X/U permission check against the current privilege mode and the SUM/MXR
    /// `mstatus` bits) is not enforced: this emulator targets a single trusted guest kernel
    /// rather than isolating untrusted tenants, and xv6's own page tables never exercise it.
    fn translate(&mut self, addr: u64, access_type: AccessType) -> Result<u64, Exception> {
        if !self.enable_paging || self.mode == Mode::Machine {
            return Ok(addr);
        }

        let vpn = [
            (addr >> 12) & 0x1ff,
            (addr >> 21) & 0x1ff,
            (addr >> 30) & 0x1ff,
        ];
        let (mut pte, level) = self.walk_page_table(vpn, access_type, addr)?;

        // Step 6: a superpage whose low PPN fields aren't zero is misaligned.
        let ppn = [
            (pte >> 10) & 0x1ff,
            (pte >> 19) & 0x1ff,
            (pte >> 28) & 0x03ff_ffff,
        ];
        if (0..level).any(|j| ppn[j] != 0) {
            return Err(Self::page_fault(access_type, addr));
        }

        // Step 7: set the accessed bit (and dirty, for a store) before returning the PTE was
        // used. Writing it back to the table is skipped: xv6 fails to boot when this store is
        // enabled, and the accessed/dirty bits aren't otherwise consulted by this emulator.
        let accessed = pte & PTE_A != 0;
        let dirtied = pte & PTE_D != 0;
        if !accessed || (access_type == AccessType::Store && !dirtied) {
            pte |= PTE_A;
            if access_type == AccessType::Store {
                pte |= PTE_D;
            }
        }

        // Step 8: assemble the physical address. A superpage reuses the low VPN bits untranslated.
        let offset = addr & 0xfff;
        let phys = match level {
            0 => ((pte >> 10) & 0x0fff_ffff_ffff) << 12,
            1 => (ppn[2] << 30) | (ppn[1] << 21) | (vpn[0] << 12),
            2 => (ppn[2] << 30) | (vpn[1] << 21) | (vpn[0] << 12),
            _ => return Err(Self::page_fault(access_type, addr)),
        };
        Ok(phys | offset)
    }

    /// Runs `f` with `self.mode` temporarily overridden to `mstatus.MPP` when `MPRV` is set, per
    /// 3.1.6.3: "load and store memory addresses are translated and protected ... as though the
    /// current privilege mode were set to MPP." Restores the real mode afterward regardless of
    /// how `f` returns.
    fn with_effective_privilege<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        if self.state.read_mstatus(MSTATUS_MPRV) != 1 {
            return f(self);
        }
        let actual_mode = self.mode;
        self.mode = match self.state.read_mstatus(MSTATUS_MPP) {
            0b00 => Mode::User,
            0b01 => Mode::Supervisor,
            0b11 => Mode::Machine,
            _ => Mode::Debug,
        };
        let result = f(self);
        self.mode = actual_mode;
        result
    }

    /// Read `size`-bit data from the system bus, translating through Sv39 if paging is enabled.
    fn read(&mut self, v_addr: u64, size: u8) -> Result<u64, Exception> {
        self.with_effective_privilege(|cpu| {
            let p_addr = cpu.translate(v_addr, AccessType::Load)?;
            cpu.bus.read(p_addr, size)
        })
    }

    /// Write `size`-bit data to the system bus, translating through Sv39 if paging is enabled.
    fn write(&mut self, v_addr: u64, value: u64, size: u8) -> Result<(), Exception> {
        // "The SC must fail if a write from some other device to the bytes accessed by the LR
        // can be observed to occur between the LR and SC."
        self.reservation_set.retain(|&x| x != v_addr);

        self.with_effective_privilege(|cpu| {
            let p_addr = cpu.translate(v_addr, AccessType::Store)?;
            cpu.bus.write(p_addr, value, size)
        })
    }

    /// Fetch the `size`-bit next instruction from the memory at the current program counter.
    /// A hit in [`CPU::icache`] for this exact `(pc, size)` skips translation and the bus read.
    pub fn fetch(&mut self, size: u8) -> Result<u64, Exception> {
        if size != HALFWORD && size != WORD {
            return Err(Exception::InstructionAccessFault);
        }

        if let Some(&(value, cached_size)) = self.icache.get(&self.pc) {
            if cached_size == size {
                return Ok(value);
            }
        }

        let p_pc = self.translate(self.pc, AccessType::Instruction)?;

        // The result of the read method can be `Exception::LoadAccessFault`. In fetch(), an error
        // should be `Exception::InstructionAccessFault`.
        match self.bus.read(p_pc, size) {
            Ok(value) => {
                self.icache.insert(self.pc, (value, size));
                Ok(value)
            }
            Err(_) => Err(Exception::InstructionAccessFault),
        }
    }

    /// Execute a cycle on peripheral devices.
    pub fn devices_increment(&mut self) {
        // TODO: mtime in Clint and TIME in CSR should be the same value.
        // Increment the timer register (mtimer) in Clint.
        self.bus.tick(&mut self.state);
        // Increment the value in the TIME and CYCLE registers in CSR.
        self.state.increment_time();
    }

    /// Execute an instruction. Raises an exception if something is wrong, otherwise, returns
    /// the instruction executed in this cycle. The program counter is advanced past the
    /// instruction before it runs, so a faulting instruction's `mepc`/`sepc` ends up pointing
    /// at the following instruction rather than the one that actually trapped; this mirrors
    /// the hart's own fetch-then-execute pipelining and callers (see [`CPU::step`]) rely on it.
    pub fn execute(&mut self) -> Result<u64, Exception> {
        // WFI is called and pending interrupts don't exist.
        if self.idle {
            return Ok(0);
        }

        // Fetch.
        let inst16 = self.fetch(HALFWORD)?;
        match inst16 & 0b11 {
            0 | 1 | 2 => {
                if inst16 == 0 {
                    // Unimplemented instruction, since all bits are 0.
                    return Err(Exception::IllegalInstruction(inst16));
                }
                self.pc += 2;
                self.execute_compressed(inst16)?;
                self.pre_inst = inst16;
                Ok(inst16)
            }
            _ => {
                let inst = self.fetch(WORD)?;
                self.pc += 4;
                self.execute_general(inst)?;
                self.pre_inst = inst;
                Ok(inst)
            }
        }
    }

    /// Run one hart cycle: poll for a pending interrupt, else fetch/decode/execute one
    /// instruction. Any exception or interrupt is delivered to the M- or S-mode handler
    /// before returning; a fatal exception is additionally returned to the caller so the
    /// driver can halt instead of looping on a broken hart.
    pub fn step(&mut self) -> Result<(), Exception> {
        self.devices_increment();

        if let Some(interrupt) = self.check_pending_interrupt() {
            self.idle = false;
            let pc = self.pc;
            self.pc = take_trap_on_interrupt(self, interrupt, pc);
            self.invalidate_icache();
            return Ok(());
        }

        match self.execute() {
            Ok(_) => Ok(()),
            Err(exception) => {
                let pc = self.pc;
                self.pc = take_trap_on_exception(self, exception, pc);
                self.invalidate_icache();
                match exception.trap() {
                    Trap::Fatal => Err(exception),
                    Trap::Requested | Trap::Invisible => Ok(()),
                }
            }
        }
    }

    /// Execute a compressed instruction. Raised an exception if something is wrong, otherwise,
    /// returns a fetched instruction. It also increments the program counter by 2 bytes.
    pub fn execute_compressed(&mut self, inst: u64) -> Result<(), Exception> {
        execute_compressed_inner(self, inst)
    }

    /// Execute a general-purpose instruction. Raises an exception if something is wrong,
    /// otherwise, returns a fetched instruction. It also increments the program counter by 4 bytes.
    fn execute_general(&mut self, inst: u64) -> Result<(), Exception> {
        execute_general_inner(self, inst)
    }
}

impl Default for CPU {
    fn default() -> Self {
        Self::new()
    }
}
