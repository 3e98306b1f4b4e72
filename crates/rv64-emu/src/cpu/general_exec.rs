//! Executor for the full RV64IMAC 32-bit encoding space. `execute_general_inner` only decodes
//! the fixed opcode/funct3/funct7 fields and dispatches; one function per opcode class does the
//! actual work, mirroring how the ISA manual itself groups instructions by major opcode.
use crate::cpu::{Mode, BYTE, DOUBLEWORD, HALFWORD, WORD};
use crate::reg::csr::{
    MEPC, MSTATUS_MIE, MSTATUS_MPIE, MSTATUS_MPP, SATP, SEPC, XSTATUS_SIE, XSTATUS_SPIE,
    XSTATUS_SPP,
};
use crate::{cpu::CPU, exception::Exception, reg::csr::FCSR};
use std::cmp;

/// Decoded fixed fields common to every 32-bit instruction format.
struct Decoded {
    opcode: u64,
    rd: u64,
    rs1: u64,
    rs2: u64,
    funct3: u64,
    funct7: u64,
}

fn decode(inst: u64) -> Decoded {
    Decoded {
        opcode: inst & 0x7f,
        rd: (inst >> 7) & 0x1f,
        rs1: (inst >> 15) & 0x1f,
        rs2: (inst >> 20) & 0x1f,
        funct3: (inst >> 12) & 0x7,
        funct7: (inst >> 25) & 0x7f,
    }
}

/// I-type immediate: imm[11:0] = inst[31:20], sign-extended. Shared by loads, `OP-IMM`, and
/// `OP-IMM-32`, which all place their 12-bit immediate in the same field.
fn imm_i(inst: u64) -> u64 {
    ((inst as i32 as i64) >> 20) as u64
}

/// S-type immediate: imm[11:5|4:0] = inst[31:25|11:7], sign-extended. Used by integer stores.
fn imm_s(inst: u64) -> u64 {
    (((inst & 0xfe000000) as i32 as i64 >> 20) as u64) | ((inst >> 7) & 0x1f)
}

/// Marks the FCSR divide-by-zero flag, per "the quotient/remainder of division by zero...".
fn flag_divide_by_zero(cpu: &mut CPU) {
    cpu.state.write_bit(FCSR, 3, 1);
}

/// Reads `rs1` and checks it's aligned to `align` bytes, as the A extension requires for every
/// AMO/LR/SC operand address.
fn aligned_amo_addr(cpu: &CPU, rs1: u64, align: u64) -> Result<u64, Exception> {
    let addr = cpu.int_regs.read(rs1);
    if addr % align != 0 {
        return Err(Exception::LoadAddressMisaligned);
    }
    Ok(addr)
}

pub fn execute_general_inner(cpu: &mut CPU, inst: u64) -> Result<(), Exception> {
    let d = decode(inst);
    match d.opcode {
        0x03 => exec_load(cpu, inst, &d),
        0x07 => exec_load_fp(cpu, inst, &d),
        0x0f => exec_misc_mem(cpu, inst, &d),
        0x13 => exec_op_imm(cpu, inst, &d),
        0x17 => exec_auipc(cpu, inst, &d),
        0x1b => exec_op_imm_32(cpu, inst, &d),
        0x23 => exec_store(cpu, inst, &d),
        0x27 => exec_store_fp(cpu, inst, &d),
        0x2f => exec_amo(cpu, inst, &d),
        0x33 => exec_op(cpu, inst, &d),
        0x37 => exec_lui(cpu, inst, &d),
        0x3b => exec_op_32(cpu, inst, &d),
        // RV32F/RV64F fused multiply-add, arithmetic and conversion ops. This hart decodes
        // F/D register loads and stores (0x07/0x27) but carries no compute pipeline behind
        // them, so every other F/D opcode traps as undefined.
        0x43 | 0x47 | 0x4b | 0x4f | 0x53 => Err(Exception::IllegalInstruction(inst)),
        0x63 => exec_branch(cpu, inst, &d),
        0x67 => exec_jalr(cpu, inst, &d),
        0x6f => exec_jal(cpu, inst, &d),
        0x73 => exec_system(cpu, inst, &d),
        _ => Err(Exception::IllegalInstruction(inst)),
    }
}

fn exec_load(cpu: &mut CPU, inst: u64, d: &Decoded) -> Result<(), Exception> {
    let addr = cpu.int_regs.read(d.rs1).wrapping_add(imm_i(inst));
    let val = match d.funct3 {
        0x0 => cpu.read(addr, BYTE)? as i8 as i64 as u64, // lb
        0x1 => cpu.read(addr, HALFWORD)? as i16 as i64 as u64, // lh
        0x2 => cpu.read(addr, WORD)? as i32 as i64 as u64, // lw
        0x3 => cpu.read(addr, DOUBLEWORD)?,               // ld
        0x4 => cpu.read(addr, BYTE)?,                     // lbu
        0x5 => cpu.read(addr, HALFWORD)?,                 // lhu
        0x6 => cpu.read(addr, WORD)?,                     // lwu
        _ => return Err(Exception::IllegalInstruction(inst)),
    };
    cpu.int_regs.write(d.rd, val);
    Ok(())
}

fn exec_load_fp(cpu: &mut CPU, inst: u64, d: &Decoded) -> Result<(), Exception> {
    let addr = cpu.int_regs.read(d.rs1).wrapping_add(imm_i(inst));
    let val = match d.funct3 {
        0x2 => f32::from_bits(cpu.read(addr, WORD)? as u32) as f64, // flw
        0x3 => f64::from_bits(cpu.read(addr, DOUBLEWORD)?),         // fld
        _ => return Err(Exception::IllegalInstruction(inst)),
    };
    cpu.float_regs.write(d.rd, val);
    Ok(())
}

fn exec_misc_mem(cpu: &mut CPU, inst: u64, d: &Decoded) -> Result<(), Exception> {
    // This emulator steps one hart sequentially, so `fence` needs no memory barrier.
    match d.funct3 {
        0x0 => Ok(()),                    // fence
        0x1 => {                          // fence.i (Zifencei)
            cpu.invalidate_icache();
            Ok(())
        }
        _ => Err(Exception::IllegalInstruction(inst)),
    }
}

fn exec_op_imm(cpu: &mut CPU, inst: u64, d: &Decoded) -> Result<(), Exception> {
    let imm = imm_i(inst);
    let rs1v = cpu.int_regs.read(d.rs1);
    let val = match d.funct3 {
        0x0 => rs1v.wrapping_add(imm),                      // addi
        0x1 => rs1v << (imm & 0x3f),                         // slli (6-bit shamt on RV64I)
        0x2 => ((rs1v as i64) < (imm as i64)) as u64,        // slti
        0x3 => (rs1v < imm) as u64,                          // sltiu
        0x4 => rs1v ^ imm,                                   // xori
        0x5 => match d.funct7 >> 1 {
            0x00 => rs1v >> (imm & 0x3f),                    // srli
            0x10 => ((rs1v as i64) >> (imm & 0x3f)) as u64,  // srai
            _ => return Err(Exception::IllegalInstruction(inst)),
        },
        0x6 => rs1v | imm,                                   // ori
        0x7 => rs1v & imm,                                   // andi
        _ => return Err(Exception::IllegalInstruction(inst)),
    };
    cpu.int_regs.write(d.rd, val);
    Ok(())
}

fn exec_auipc(cpu: &mut CPU, inst: u64, d: &Decoded) -> Result<(), Exception> {
    // "AUIPC forms a 32-bit offset from the 20-bit U-immediate, filling the lowest 12 bits
    // with zeros."
    let imm = (inst & 0xffff_f000) as i32 as i64 as u64;
    cpu.int_regs.write(d.rd, cpu.pc.wrapping_add(imm));
    Ok(())
}

fn exec_op_imm_32(cpu: &mut CPU, inst: u64, d: &Decoded) -> Result<(), Exception> {
    let imm = imm_i(inst);
    let rs1v = cpu.int_regs.read(d.rs1);
    // "SLLIW, SRLIW, and SRAIW encodings with imm[5] != 0 are reserved."
    let shamt = (imm & 0x1f) as u32;
    let val = match d.funct3 {
        0x0 => rs1v.wrapping_add(imm) as i32 as i64 as u64, // addiw
        0x1 => (rs1v << shamt) as i32 as i64 as u64,         // slliw
        0x5 => match d.funct7 {
            0x00 => ((rs1v as u32) >> shamt) as i32 as i64 as u64, // srliw
            0x20 => ((rs1v as i32) >> shamt) as i64 as u64,        // sraiw
            _ => return Err(Exception::IllegalInstruction(inst)),
        },
        _ => return Err(Exception::IllegalInstruction(inst)),
    };
    cpu.int_regs.write(d.rd, val);
    Ok(())
}

fn exec_store(cpu: &mut CPU, inst: u64, d: &Decoded) -> Result<(), Exception> {
    let addr = cpu.int_regs.read(d.rs1).wrapping_add(imm_s(inst));
    let rs2v = cpu.int_regs.read(d.rs2);
    match d.funct3 {
        0x0 => cpu.write(addr, rs2v, BYTE),      // sb
        0x1 => cpu.write(addr, rs2v, HALFWORD),  // sh
        0x2 => cpu.write(addr, rs2v, WORD),      // sw
        0x3 => cpu.write(addr, rs2v, DOUBLEWORD), // sd
        _ => Err(Exception::IllegalInstruction(inst)),
    }
}

fn exec_store_fp(cpu: &mut CPU, inst: u64, d: &Decoded) -> Result<(), Exception> {
    // offset[11:5|4:0] = inst[31:25|11:7], same bit positions as `imm_s` but assembled here
    // without sign-extending past bit 11 (float store offsets stay within one page in practice).
    let offset = ((((inst as i32 as i64) >> 20) as u64) & 0xfe0) | ((inst >> 7) & 0x1f);
    let addr = cpu.int_regs.read(d.rs1).wrapping_add(offset);
    match d.funct3 {
        0x2 => cpu.write(addr, (cpu.float_regs.read(d.rs2) as f32).to_bits() as u64, WORD), // fsw
        0x3 => cpu.write(addr, cpu.float_regs.read(d.rs2).to_bits(), DOUBLEWORD),           // fsd
        _ => Err(Exception::IllegalInstruction(inst)),
    }
}

fn exec_amo(cpu: &mut CPU, inst: u64, d: &Decoded) -> Result<(), Exception> {
    let funct5 = d.funct7 >> 2;
    // TODO: honor aq/rl ordering (bits 1/0 of funct7); this emulator has no concurrent harts yet.
    match (d.funct3, funct5) {
        (0x2, 0x00) => amo_rmw32(cpu, d, 4, |t, rs2| t.wrapping_add(rs2 as i32) as u32), // amoadd.w
        (0x3, 0x00) => amo_rmw64(cpu, d, 8, |t, rs2| t.wrapping_add(rs2)),               // amoadd.d
        (0x2, 0x01) => amo_rmw32(cpu, d, 4, |_t, rs2| rs2 as u32),                       // amoswap.w
        (0x3, 0x01) => amo_rmw64(cpu, d, 8, |_t, rs2| rs2),                              // amoswap.d
        (0x2, 0x02) => amo_lr(cpu, d, 4, WORD, |v| v as i32 as i64 as u64),              // lr.w
        (0x3, 0x02) => amo_lr(cpu, d, 8, DOUBLEWORD, |v| v),                             // lr.d
        (0x2, 0x03) => amo_sc(cpu, d, 4, WORD),                                          // sc.w
        (0x3, 0x03) => amo_sc(cpu, d, 8, DOUBLEWORD),                                    // sc.d
        (0x2, 0x04) => amo_rmw32(cpu, d, 4, |t, rs2| (t ^ rs2 as i32) as u32),            // amoxor.w
        (0x3, 0x04) => amo_rmw64(cpu, d, 8, |t, rs2| t ^ rs2),                           // amoxor.d
        (0x2, 0x08) => amo_rmw32(cpu, d, 4, |t, rs2| (t | rs2 as i32) as u32),            // amoor.w
        (0x3, 0x08) => amo_rmw64(cpu, d, 8, |t, rs2| t | rs2),                           // amoor.d
        (0x2, 0x0c) => amo_rmw32(cpu, d, 4, |t, rs2| (t & rs2 as i32) as u32),            // amoand.w
        (0x3, 0x0c) => amo_rmw64(cpu, d, 8, |t, rs2| t & rs2),                           // amoand.d
        (0x2, 0x10) => amo_rmw32(cpu, d, 4, |t, rs2| cmp::min(t, rs2 as i32) as u32),     // amomin.w
        (0x3, 0x10) => amo_rmw64_signed(cpu, d, 8, |t, rs2| cmp::min(t, rs2 as i64) as u64), // amomin.d
        (0x2, 0x14) => amo_rmw32(cpu, d, 4, |t, rs2| cmp::max(t, rs2 as i32) as u32),     // amomax.w
        (0x3, 0x14) => amo_rmw64_signed(cpu, d, 8, |t, rs2| cmp::max(t, rs2 as i64) as u64), // amomax.d
        (0x2, 0x18) => amo_rmw32u(cpu, d, 4, |t, rs2| cmp::min(t, rs2 as u32)),           // amominu.w
        (0x3, 0x18) => amo_rmw64(cpu, d, 8, |t, rs2| cmp::min(t, rs2)),                  // amominu.d
        (0x2, 0x1c) => amo_rmw32u(cpu, d, 4, |t, rs2| cmp::max(t, rs2 as u32)),           // amomaxu.w
        (0x3, 0x1c) => amo_rmw64(cpu, d, 8, |t, rs2| cmp::max(t, rs2)),                  // amomaxu.d
        _ => Err(Exception::IllegalInstruction(inst)),
    }
}

/// Runs a 32-bit read-modify-write AMO: loads the word (sign-extended for `rd`), applies `f` to
/// the raw 32-bit value and `rs2`, and stores the (sign-extended) result back.
fn amo_rmw32(cpu: &mut CPU, d: &Decoded, align: u64, f: impl Fn(i32, u64) -> u32) -> Result<(), Exception> {
    let addr = aligned_amo_addr(cpu, d.rs1, align)?;
    let t = cpu.read(addr, WORD)?;
    let rs2v = cpu.int_regs.read(d.rs2);
    cpu.write(addr, f(t as i32, rs2v) as i32 as i64 as u64, WORD)?;
    cpu.int_regs.write(d.rd, t as i32 as i64 as u64);
    Ok(())
}

/// Unsigned-compare variant of [`amo_rmw32`] (`amominu.w`/`amomaxu.w`).
fn amo_rmw32u(cpu: &mut CPU, d: &Decoded, align: u64, f: impl Fn(u32, u64) -> u32) -> Result<(), Exception> {
    let addr = aligned_amo_addr(cpu, d.rs1, align)?;
    let t = cpu.read(addr, WORD)?;
    let rs2v = cpu.int_regs.read(d.rs2);
    cpu.write(addr, f(t as u32, rs2v) as u64, WORD)?;
    cpu.int_regs.write(d.rd, t as i32 as i64 as u64);
    Ok(())
}

/// 64-bit read-modify-write AMO.
fn amo_rmw64(cpu: &mut CPU, d: &Decoded, align: u64, f: impl Fn(u64, u64) -> u64) -> Result<(), Exception> {
    let addr = aligned_amo_addr(cpu, d.rs1, align)?;
    let t = cpu.read(addr, DOUBLEWORD)?;
    let rs2v = cpu.int_regs.read(d.rs2);
    cpu.write(addr, f(t, rs2v), DOUBLEWORD)?;
    cpu.int_regs.write(d.rd, t);
    Ok(())
}

/// Signed-compare variant of [`amo_rmw64`] (`amomin.d`/`amomax.d`).
fn amo_rmw64_signed(cpu: &mut CPU, d: &Decoded, align: u64, f: impl Fn(i64, u64) -> u64) -> Result<(), Exception> {
    let addr = aligned_amo_addr(cpu, d.rs1, align)?;
    let t = cpu.read(addr, DOUBLEWORD)?;
    let rs2v = cpu.int_regs.read(d.rs2);
    cpu.write(addr, f(t as i64, rs2v), DOUBLEWORD)?;
    cpu.int_regs.write(d.rd, t);
    Ok(())
}

/// `lr.w`/`lr.d`: load, sign-extend via `widen`, and open a reservation on the address.
fn amo_lr(cpu: &mut CPU, d: &Decoded, align: u64, size: u8, widen: impl Fn(u64) -> u64) -> Result<(), Exception> {
    let addr = aligned_amo_addr(cpu, d.rs1, align)?;
    let value = cpu.read(addr, size)?;
    cpu.int_regs.write(d.rd, widen(value));
    cpu.reservation_set.push(addr);
    Ok(())
}

/// `sc.w`/`sc.d`: store only if a reservation on this address survives; either way, the
/// reservation is consumed, and `rd` gets 0 on success or 1 on failure.
fn amo_sc(cpu: &mut CPU, d: &Decoded, align: u64, size: u8) -> Result<(), Exception> {
    let addr = cpu.int_regs.read(d.rs1);
    if addr % align != 0 {
        return Err(Exception::StoreAMOAddressMisaligned);
    }
    let had_reservation = cpu.reservation_set.contains(&addr);
    cpu.reservation_set.retain(|&x| x != addr);
    if had_reservation {
        cpu.write(addr, cpu.int_regs.read(d.rs2), size)?;
        cpu.int_regs.write(d.rd, 0);
    } else {
        cpu.int_regs.write(d.rd, 1);
    }
    Ok(())
}

fn exec_op(cpu: &mut CPU, inst: u64, d: &Decoded) -> Result<(), Exception> {
    let rs1v = cpu.int_regs.read(d.rs1);
    let rs2v = cpu.int_regs.read(d.rs2);
    let val = match (d.funct3, d.funct7) {
        (0x0, 0x00) => rs1v.wrapping_add(rs2v), // add
        (0x0, 0x01) => ((rs1v as i64).wrapping_mul(rs2v as i64)) as u64, // mul
        (0x0, 0x20) => rs1v.wrapping_sub(rs2v), // sub
        // "In RV64I, only the low 6 bits of rs2 are considered for the shift amount."
        (0x1, 0x00) => rs1v << (rs2v & 0x3f), // sll
        (0x1, 0x01) => ((rs1v as i64 as i128).wrapping_mul(rs2v as i64 as i128) >> 64) as u64, // mulh
        (0x2, 0x00) => ((rs1v as i64) < (rs2v as i64)) as u64, // slt
        (0x2, 0x01) => ((rs1v as i64 as i128 as u128).wrapping_mul(rs2v as u128) >> 64) as u64, // mulhsu
        (0x3, 0x00) => (rs1v < rs2v) as u64, // sltu
        (0x3, 0x01) => ((rs1v as u128).wrapping_mul(rs2v as u128) >> 64) as u64, // mulhu
        (0x4, 0x00) => rs1v ^ rs2v, // xor
        (0x4, 0x01) => div_i64(cpu, rs1v as i64, rs2v as i64), // div
        (0x5, 0x00) => rs1v >> (rs2v & 0x3f), // srl
        (0x5, 0x01) => divu_u64(cpu, rs1v, rs2v), // divu
        (0x5, 0x20) => ((rs1v as i64) >> (rs2v & 0x3f)) as u64, // sra
        (0x6, 0x00) => rs1v | rs2v, // or
        (0x6, 0x01) => rem_i64(rs1v as i64, rs2v as i64), // rem
        (0x7, 0x00) => rs1v & rs2v, // and
        (0x7, 0x01) => remu_u64(rs1v, rs2v), // remu
        _ => return Err(Exception::IllegalInstruction(inst)),
    };
    cpu.int_regs.write(d.rd, val);
    Ok(())
}

/// "The quotient of division by zero has all bits set"; "the quotient of a signed division
/// with overflow is equal to the dividend"; otherwise truncating division.
fn div_i64(cpu: &mut CPU, dividend: i64, divisor: i64) -> u64 {
    if divisor == 0 {
        flag_divide_by_zero(cpu);
        u64::MAX
    } else if dividend == i64::MIN && divisor == -1 {
        dividend as u64
    } else {
        dividend.wrapping_div(divisor) as u64
    }
}

fn divu_u64(cpu: &mut CPU, dividend: u64, divisor: u64) -> u64 {
    if divisor == 0 {
        flag_divide_by_zero(cpu);
        u64::MAX
    } else {
        dividend.wrapping_div(divisor)
    }
}

/// "The remainder of division by zero equals the dividend"; "the remainder [of an overflowing
/// division] is zero"; otherwise the truncating remainder.
fn rem_i64(dividend: i64, divisor: i64) -> u64 {
    if divisor == 0 {
        dividend as u64
    } else if dividend == i64::MIN && divisor == -1 {
        0
    } else {
        dividend.wrapping_rem(divisor) as u64
    }
}

fn remu_u64(dividend: u64, divisor: u64) -> u64 {
    if divisor == 0 {
        dividend
    } else {
        dividend.wrapping_rem(divisor)
    }
}

fn exec_lui(cpu: &mut CPU, inst: u64, d: &Decoded) -> Result<(), Exception> {
    // "LUI places the U-immediate value in the top 20 bits of rd, filling the low 12 with zeros."
    cpu.int_regs.write(d.rd, (inst & 0xffff_f000) as i32 as i64 as u64);
    Ok(())
}

fn exec_op_32(cpu: &mut CPU, inst: u64, d: &Decoded) -> Result<(), Exception> {
    let rs1v = cpu.int_regs.read(d.rs1);
    let rs2v = cpu.int_regs.read(d.rs2);
    let val = match (d.funct3, d.funct7) {
        (0x0, 0x00) => rs1v.wrapping_add(rs2v) as i32 as i64 as u64, // addw
        (0x0, 0x01) => ((rs1v as i32).wrapping_mul(rs2v as i32)) as i64 as u64, // mulw
        (0x0, 0x20) => rs1v.wrapping_sub(rs2v) as i32 as u64, // subw
        (0x1, 0x00) => (rs1v << (rs2v & 0x1f)) as i32 as i64 as u64, // sllw, shamt = rs2[4:0]
        (0x4, 0x01) => divw_i32(cpu, rs1v as i32, rs2v as i32), // divw
        (0x5, 0x00) => ((rs1v as u32) >> (rs2v & 0x1f)) as i32 as i64 as u64, // srlw
        (0x5, 0x01) => divuw_u32(cpu, rs1v as u32, rs2v as u32), // divuw
        (0x5, 0x20) => ((rs1v as i32) >> (rs2v & 0x1f)) as i64 as u64, // sraw
        (0x6, 0x01) => remw_i32(rs1v as i32, rs2v as i32), // remw
        (0x7, 0x01) => remuw_u32(rs1v as u32, rs2v as u32), // remuw
        _ => return Err(Exception::IllegalInstruction(inst)),
    };
    cpu.int_regs.write(d.rd, val);
    Ok(())
}

fn divw_i32(cpu: &mut CPU, dividend: i32, divisor: i32) -> u64 {
    if divisor == 0 {
        flag_divide_by_zero(cpu);
        u64::MAX
    } else if dividend == i32::MIN && divisor == -1 {
        dividend as i64 as u64
    } else {
        dividend.wrapping_div(divisor) as i64 as u64
    }
}

fn divuw_u32(cpu: &mut CPU, dividend: u32, divisor: u32) -> u64 {
    if divisor == 0 {
        flag_divide_by_zero(cpu);
        u64::MAX
    } else {
        dividend.wrapping_div(divisor) as i32 as i64 as u64
    }
}

fn remw_i32(dividend: i32, divisor: i32) -> u64 {
    if divisor == 0 {
        dividend as i64 as u64
    } else if dividend == i32::MIN && divisor == -1 {
        0
    } else {
        dividend.wrapping_rem(divisor) as i64 as u64
    }
}

fn remuw_u32(dividend: u32, divisor: u32) -> u64 {
    if divisor == 0 {
        dividend as i32 as i64 as u64
    } else {
        dividend.wrapping_rem(divisor) as i32 as i64 as u64
    }
}

fn exec_branch(cpu: &mut CPU, inst: u64, d: &Decoded) -> Result<(), Exception> {
    // imm[12|10:5|4:1|11] = inst[31|30:25|11:8|7]
    let imm = (((inst & 0x8000_0000) as i32 as i64 >> 19) as u64)
        | ((inst & 0x80) << 4)
        | ((inst >> 20) & 0x7e0)
        | ((inst >> 7) & 0x1e);
    let rs1v = cpu.int_regs.read(d.rs1);
    let rs2v = cpu.int_regs.read(d.rs2);
    let taken = match d.funct3 {
        0x0 => rs1v == rs2v,                        // beq
        0x1 => rs1v != rs2v,                        // bne
        0x4 => (rs1v as i64) < (rs2v as i64),        // blt
        0x5 => (rs1v as i64) >= (rs2v as i64),       // bge
        0x6 => rs1v < rs2v,                          // bltu
        0x7 => rs1v >= rs2v,                         // bgeu
        _ => return Err(Exception::IllegalInstruction(inst)),
    };
    if taken {
        cpu.pc = cpu.pc.wrapping_add(imm).wrapping_sub(4);
    }
    Ok(())
}

fn exec_jalr(cpu: &mut CPU, inst: u64, d: &Decoded) -> Result<(), Exception> {
    // `cpu.pc` already points past this instruction (the caller pre-increments before
    // dispatch), so it's the return address as-is. The jump target is absolute (computed
    // from `rs1`, not from `pc`), so it needs no pre-increment compensation either.
    let return_addr = cpu.pc;
    let offset = (inst as i32 as i64) >> 20;
    let target = (cpu.int_regs.read(d.rs1) as i64).wrapping_add(offset) & !1;
    cpu.pc = target as u64;
    cpu.int_regs.write(d.rd, return_addr);
    Ok(())
}

fn exec_jal(cpu: &mut CPU, inst: u64, d: &Decoded) -> Result<(), Exception> {
    // Ditto for the return address; the jump target below is pc-relative, so it does need
    // to undo the pre-increment (see the `wrapping_sub(4)` two lines down).
    cpu.int_regs.write(d.rd, cpu.pc);
    // imm[20|10:1|11|19:12] = inst[31|30:21|20|19:12]
    let offset = (((inst & 0x8000_0000) as i32 as i64 >> 11) as u64)
        | (inst & 0xff000)
        | ((inst >> 9) & 0x800)
        | ((inst >> 20) & 0x7fe);
    cpu.pc = cpu.pc.wrapping_add(offset).wrapping_sub(4);
    Ok(())
}

fn exec_system(cpu: &mut CPU, inst: u64, d: &Decoded) -> Result<(), Exception> {
    let csr_addr = ((inst >> 20) & 0xfff) as u16;
    match d.funct3 {
        0x0 => exec_privileged(cpu, inst, d),
        0x1 => exec_csr(cpu, d, csr_addr, |_old, rs1| rs1), // csrrw
        0x2 => exec_csr(cpu, d, csr_addr, |old, rs1| old | rs1), // csrrs
        0x3 => exec_csr(cpu, d, csr_addr, |old, rs1| old & !rs1), // csrrc
        0x5 => exec_csri(cpu, d, csr_addr, |_old, zimm| zimm), // csrrwi
        0x6 => exec_csri(cpu, d, csr_addr, |old, zimm| old | zimm), // csrrsi
        0x7 => exec_csri(cpu, d, csr_addr, |old, zimm| old & !zimm), // csrrci
        _ => Err(Exception::IllegalInstruction(inst)),
    }
}

/// `csrrw`/`csrrs`/`csrrc`: read the old value into `rd`, write `f(old, rs1)` back.
fn exec_csr(cpu: &mut CPU, d: &Decoded, csr_addr: u16, f: impl Fn(u64, u64) -> u64) -> Result<(), Exception> {
    let old = cpu.state.read(csr_addr);
    cpu.state.write(csr_addr, f(old, cpu.int_regs.read(d.rs1)));
    cpu.int_regs.write(d.rd, old);
    if csr_addr == SATP {
        cpu.update_paging();
    }
    Ok(())
}

/// `csrrwi`/`csrrsi`/`csrrci`: same as [`exec_csr`] but the operand is the `rs1` field read as
/// a 5-bit zero-extended immediate rather than a register.
fn exec_csri(cpu: &mut CPU, d: &Decoded, csr_addr: u16, f: impl Fn(u64, u64) -> u64) -> Result<(), Exception> {
    let zimm = d.rs1;
    let old = cpu.state.read(csr_addr);
    cpu.state.write(csr_addr, f(old, zimm));
    cpu.int_regs.write(d.rd, old);
    if csr_addr == SATP {
        cpu.update_paging();
    }
    Ok(())
}

/// `ecall`/`ebreak`/`{u,s,m}ret`/`wfi`/`sfence.vma`/`hfence.*`, distinguished by `(rs2, funct7)`.
fn exec_privileged(cpu: &mut CPU, inst: u64, d: &Decoded) -> Result<(), Exception> {
    match (d.rs2, d.funct7) {
        (0x0, 0x0) => Err(match cpu.mode {
            Mode::User => Exception::EnvironmentCallFromUMode,
            Mode::Supervisor => Exception::EnvironmentCallFromSMode,
            Mode::Machine => Exception::EnvironmentCallFromMMode,
            _ => Exception::IllegalInstruction(inst),
        }),
        (0x1, 0x0) => Err(Exception::Breakpoint), // ebreak
        (0x2, 0x0) => Err(Exception::IllegalInstruction(inst)), // uret: N extension out of scope
        (0x2, 0x8) => {
            exec_sret(cpu);
            Ok(())
        }
        (0x2, 0x18) => {
            exec_mret(cpu);
            Ok(())
        }
        (0x5, 0x8) => {
            // wfi: "a hint that the current hart can be stalled until an interrupt might need
            // servicing."
            cpu.idle = true;
            Ok(())
        }
        (_, 0x9) => {
            // sfence.vma: synchronizes updates to in-memory page tables with execution.
            cpu.invalidate_icache();
            Ok(())
        }
        (_, 0x11) => Ok(()), // hfence.bvma: Hypervisor extension out of scope
        (_, 0x51) => Ok(()), // hfence.gvma: Hypervisor extension out of scope
        _ => Err(Exception::IllegalInstruction(inst)),
    }
}

/// "Returns from a supervisor-mode exception handler. Sets the pc to CSRs[sepc], the privilege
/// mode to CSRs[sstatus].SPP, CSRs[sstatus].SIE to CSRs[sstatus].SPIE, CSRs[sstatus].SPIE to 1,
/// and CSRs[sstatus].SPP to 0." (QEMU/Spike use `mstatus` for this, not `sstatus`; so do we,
/// via [`crate::reg::csr::state::State`]'s masked window.)
fn exec_sret(cpu: &mut CPU) {
    // sepc is an absolute address, not pc-relative, so unlike branch/jump targets it needs
    // no pre-increment compensation.
    cpu.pc = cpu.state.read(SEPC);
    // TODO: check the TSR field before allowing sret.
    cpu.mode = match cpu.state.read_sstatus(XSTATUS_SPP) {
        0b0 => Mode::User,
        0b1 => Mode::Supervisor,
        _ => Mode::Debug,
    };
    cpu.state
        .write_sstatus(XSTATUS_SIE, cpu.state.read_sstatus(XSTATUS_SPIE));
    cpu.state.write_sstatus(XSTATUS_SPIE, 1);
    cpu.state.write_sstatus(XSTATUS_SPP, 0);
    cpu.invalidate_icache();
}

/// "Returns from a machine-mode exception handler. Sets the pc to CSRs[mepc], the privilege
/// mode to CSRs[mstatus].MPP, CSRs[mstatus].MIE to CSRs[mstatus].MPIE, and CSRs[mstatus].MPIE
/// to 1; and, if user mode is supported, sets CSRs[mstatus].MPP to 0".
fn exec_mret(cpu: &mut CPU) {
    // mepc is an absolute address; see the comment in exec_sret.
    cpu.pc = cpu.state.read(MEPC);
    cpu.mode = match cpu.state.read_mstatus(MSTATUS_MPP) {
        0b00 => Mode::User,
        0b01 => Mode::Supervisor,
        0b11 => Mode::Machine,
        _ => Mode::Debug,
    };
    cpu.state
        .write_mstatus(MSTATUS_MIE, cpu.state.read_mstatus(MSTATUS_MPIE));
    cpu.state.write_mstatus(MSTATUS_MPIE, 1);
    cpu.state.write_mstatus(MSTATUS_MPP, Mode::User as u64);
    cpu.invalidate_icache();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::DRAM_BASE;
    use proptest::prelude::*;

    fn r_type(opcode: u32, funct3: u32, funct7: u32, rd: u32, rs1: u32, rs2: u32) -> u64 {
        (((funct7 & 0x7f) << 25)
            | ((rs2 & 0x1f) << 20)
            | ((rs1 & 0x1f) << 15)
            | ((funct3 & 0x7) << 12)
            | ((rd & 0x1f) << 7)
            | (opcode & 0x7f)) as u64
    }

    fn i_type(opcode: u32, funct3: u32, rd: u32, rs1: u32, imm12: u32) -> u64 {
        (((imm12 & 0xfff) << 20)
            | ((rs1 & 0x1f) << 15)
            | ((funct3 & 0x7) << 12)
            | ((rd & 0x1f) << 7)
            | (opcode & 0x7f)) as u64
    }

    fn s_type(opcode: u32, funct3: u32, rs1: u32, rs2: u32, imm12: u32) -> u64 {
        let imm = imm12 & 0xfff;
        (((imm >> 5) << 25)
            | ((rs2 & 0x1f) << 20)
            | ((rs1 & 0x1f) << 15)
            | ((funct3 & 0x7) << 12)
            | ((imm & 0x1f) << 7)
            | (opcode & 0x7f)) as u64
    }

    proptest! {
        #[test]
        fn x0_is_never_written(imm in -2048i32..2048) {
            let mut cpu = CPU::new();
            let inst = i_type(0x13, 0x0, 0, 0, (imm as u32) & 0xfff); // addi x0, x0, imm
            execute_general_inner(&mut cpu, inst).unwrap();
            prop_assert_eq!(cpu.int_regs.read(0), 0);
        }

        #[test]
        fn add_matches_wrapping_twos_complement(a in any::<i64>(), b in any::<i64>()) {
            let mut cpu = CPU::new();
            cpu.int_regs.write(1, a as u64);
            cpu.int_regs.write(2, b as u64);
            execute_general_inner(&mut cpu, r_type(0x33, 0x0, 0x00, 3, 1, 2)).unwrap(); // add x3,x1,x2
            prop_assert_eq!(cpu.int_regs.read(3), a.wrapping_add(b) as u64);
        }

        #[test]
        fn sub_matches_wrapping_twos_complement(a in any::<i64>(), b in any::<i64>()) {
            let mut cpu = CPU::new();
            cpu.int_regs.write(1, a as u64);
            cpu.int_regs.write(2, b as u64);
            execute_general_inner(&mut cpu, r_type(0x33, 0x0, 0x20, 3, 1, 2)).unwrap(); // sub x3,x1,x2
            prop_assert_eq!(cpu.int_regs.read(3), a.wrapping_sub(b) as u64);
        }

        #[test]
        fn sll_only_considers_the_low_six_bits_of_the_shift_amount(val in any::<u64>(), shamt in 0u32..128) {
            let mut cpu = CPU::new();
            cpu.int_regs.write(1, val);
            cpu.int_regs.write(2, shamt as u64);
            execute_general_inner(&mut cpu, r_type(0x33, 0x1, 0x00, 3, 1, 2)).unwrap(); // sll x3,x1,x2
            prop_assert_eq!(cpu.int_regs.read(3), val << (shamt & 0x3f));
        }

        #[test]
        fn sllw_only_considers_the_low_five_bits_of_the_shift_amount(val in any::<u32>(), shamt in 0u32..128) {
            let mut cpu = CPU::new();
            cpu.int_regs.write(1, val as u64);
            cpu.int_regs.write(2, shamt as u64);
            execute_general_inner(&mut cpu, r_type(0x3b, 0x1, 0x00, 3, 1, 2)).unwrap(); // sllw x3,x1,x2
            let expected = (val << (shamt & 0x1f)) as i32 as i64 as u64;
            prop_assert_eq!(cpu.int_regs.read(3), expected);
        }

        #[test]
        fn div_by_zero_is_all_ones(dividend in any::<i64>()) {
            let mut cpu = CPU::new();
            cpu.int_regs.write(1, dividend as u64);
            cpu.int_regs.write(2, 0);
            execute_general_inner(&mut cpu, r_type(0x33, 0x4, 0x01, 3, 1, 2)).unwrap(); // div x3,x1,x2
            prop_assert_eq!(cpu.int_regs.read(3), u64::MAX);
        }

        #[test]
        fn rem_by_zero_is_the_dividend(dividend in any::<i64>()) {
            let mut cpu = CPU::new();
            cpu.int_regs.write(1, dividend as u64);
            cpu.int_regs.write(2, 0);
            execute_general_inner(&mut cpu, r_type(0x33, 0x6, 0x01, 3, 1, 2)).unwrap(); // rem x3,x1,x2
            prop_assert_eq!(cpu.int_regs.read(3), dividend as u64);
        }

        #[test]
        fn byte_store_reload_sign_extends(val in any::<i8>(), addr_off in 0u64..4096) {
            let mut cpu = CPU::new();
            let addr = DRAM_BASE + addr_off;
            cpu.int_regs.write(1, addr);
            cpu.int_regs.write(2, val as i64 as u64);
            execute_general_inner(&mut cpu, s_type(0x23, 0x0, 1, 2, 0)).unwrap(); // sb x2, 0(x1)
            execute_general_inner(&mut cpu, i_type(0x03, 0x0, 3, 1, 0)).unwrap(); // lb x3, 0(x1)
            prop_assert_eq!(cpu.int_regs.read(3), val as i64 as u64);
        }

        #[test]
        fn word_store_reload_sign_extends(val in any::<i32>(), addr_off in 0u64..1024) {
            let mut cpu = CPU::new();
            let addr = DRAM_BASE + addr_off * 4;
            cpu.int_regs.write(1, addr);
            cpu.int_regs.write(2, val as i64 as u64);
            execute_general_inner(&mut cpu, s_type(0x23, 0x2, 1, 2, 0)).unwrap(); // sw x2, 0(x1)
            execute_general_inner(&mut cpu, i_type(0x03, 0x2, 3, 1, 0)).unwrap(); // lw x3, 0(x1)
            prop_assert_eq!(cpu.int_regs.read(3), val as i64 as u64);
        }
    }

    #[test]
    fn div_overflow_returns_the_dividend() {
        let mut cpu = CPU::new();
        cpu.int_regs.write(1, i64::MIN as u64);
        cpu.int_regs.write(2, (-1i64) as u64);
        execute_general_inner(&mut cpu, r_type(0x33, 0x4, 0x01, 3, 1, 2)).unwrap(); // div x3,x1,x2
        assert_eq!(cpu.int_regs.read(3), i64::MIN as u64);
    }

    #[test]
    fn rem_overflow_is_zero() {
        let mut cpu = CPU::new();
        cpu.int_regs.write(1, i64::MIN as u64);
        cpu.int_regs.write(2, (-1i64) as u64);
        execute_general_inner(&mut cpu, r_type(0x33, 0x6, 0x01, 3, 1, 2)).unwrap(); // rem x3,x1,x2
        assert_eq!(cpu.int_regs.read(3), 0);
    }

    #[test]
    fn sc_without_a_reservation_fails_and_leaves_memory_untouched() {
        let mut cpu = CPU::new();
        let addr = DRAM_BASE;
        cpu.int_regs.write(1, addr);
        cpu.int_regs.write(2, 0xabcd);
        execute_general_inner(&mut cpu, r_type(0x2f, 0x3, 0b0001100, 3, 1, 2)).unwrap(); // sc.d x3, x2, (x1)
        assert_eq!(cpu.int_regs.read(3), 1);
        assert_eq!(cpu.read(addr, DOUBLEWORD).unwrap(), 0);
    }

    #[test]
    fn lr_then_sc_succeeds_once_and_clears_the_reservation() {
        let mut cpu = CPU::new();
        let addr = DRAM_BASE;
        cpu.int_regs.write(1, addr);
        execute_general_inner(&mut cpu, r_type(0x2f, 0x3, 0b0001000, 2, 1, 0)).unwrap(); // lr.d x2, (x1)
        assert_eq!(cpu.reservation_set, vec![addr]);

        cpu.int_regs.write(3, 0x1234);
        execute_general_inner(&mut cpu, r_type(0x2f, 0x3, 0b0001100, 4, 1, 3)).unwrap(); // sc.d x4, x3, (x1)
        assert_eq!(cpu.int_regs.read(4), 0);
        assert!(cpu.reservation_set.is_empty());
        assert_eq!(cpu.read(addr, DOUBLEWORD).unwrap(), 0x1234);

        // The reservation was consumed by the first sc.d; a second one must fail.
        cpu.int_regs.write(5, 0x5678);
        execute_general_inner(&mut cpu, r_type(0x2f, 0x3, 0b0001100, 6, 1, 5)).unwrap(); // sc.d x6, x5, (x1)
        assert_eq!(cpu.int_regs.read(6), 1);
        assert_eq!(cpu.read(addr, DOUBLEWORD).unwrap(), 0x1234);
    }

    /// A Sv39 page fault must report the faulting virtual address as `stval`, not whatever
    /// physical address the partial walk reached.
    #[test]
    fn store_to_an_unmapped_page_raises_a_page_fault_carrying_the_virtual_address() {
        use crate::bus::DRAM_BASE;

        let mut cpu = CPU::new();
        let root_pt_addr = DRAM_BASE;
        // Root page table lives at DRAM_BASE and is left all zero, so every PTE is invalid
        // (V=0). SATP: MODE=8 (Sv39) in bits 60.., PPN in bits ..44.
        cpu.state.write(SATP, (8u64 << 60) | (root_pt_addr / 4096));
        cpu.update_paging();
        cpu.mode = Mode::Supervisor;

        let vaddr = DRAM_BASE + 0x2000_0000;
        let err = cpu.write(vaddr, 0x42, DOUBLEWORD).unwrap_err();
        assert_eq!(err, Exception::StoreAMOPageFault(vaddr));
    }

    #[test]
    fn load_from_an_unmapped_page_raises_a_page_fault_carrying_the_virtual_address() {
        use crate::bus::DRAM_BASE;

        let mut cpu = CPU::new();
        let root_pt_addr = DRAM_BASE;
        cpu.state.write(SATP, (8u64 << 60) | (root_pt_addr / 4096));
        cpu.update_paging();
        cpu.mode = Mode::User;

        let vaddr = DRAM_BASE + 0x4000_0000;
        let err = cpu.read(vaddr, DOUBLEWORD).unwrap_err();
        assert_eq!(err, Exception::LoadPageFault(vaddr));
    }
}
