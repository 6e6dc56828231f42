//! Per-mnemonic x86-64 encoding functions.
//!
//! Ports the ModR/M, SIB, and REX logic of `examples/original_source/ujit_asm.c`
//! (`cb_write_rex`, `cb_write_rm`, `disp_size`) to typed Rust operands.

use super::cb::{CodeBlock, LabelId};
use super::operand::{Mem, Opnd, Reg, RegType, sig_imm_size, unsig_imm_size};
use crate::error::JitError;

fn rex_needed(opnd: &Opnd) -> bool {
    match opnd {
        Opnd::Reg(r) => r.is_extended() || (r.num_bits == 8 && (4..=7).contains(&r.reg_no) && matches!(r.reg_type, RegType::Gp)),
        Opnd::Mem(m) => (m.base_reg_no & 8) != 0 || (m.has_idx && (m.idx_reg_no & 8) != 0),
        _ => false,
    }
}

fn sib_needed(opnd: &Opnd) -> bool {
    match opnd {
        Opnd::Mem(m) => m.has_idx || (m.base_reg_no & 7) == 4, // rsp/r12 require SIB
        _ => false,
    }
}

/// Displacement width (0/8/32) required to encode `mem`.
fn disp_size(mem: &Mem) -> u8 {
    if mem.is_iprel {
        return 32;
    }
    if mem.disp != 0 {
        let bits = sig_imm_size(mem.disp as i64);
        return if bits <= 8 { 8 } else { 32 };
    }
    // rbp/r13 as base must be displaced even with disp==0
    if mem.base_reg_no & 7 == 5 {
        return 8;
    }
    0
}

fn write_rex(cb: &mut CodeBlock, w: bool, reg_no: u8, idx_reg_no: u8, rm_reg_no: u8) -> Result<(), JitError> {
    let w = w as u8;
    let r = ((reg_no & 8) != 0) as u8;
    let x = ((idx_reg_no & 8) != 0) as u8;
    let b = ((rm_reg_no & 8) != 0) as u8;
    cb.write_byte(0x40 | (w << 3) | (r << 2) | (x << 1) | b)
}

/// Encode an RM-form instruction: optional REX, `opcode` bytes, ModR/M,
/// optional SIB, optional displacement. `op_ext` selects a `/digit` opcode
/// extension in ModRM.reg when `r_opnd` is `Opnd::None`.
fn write_rm(
    cb: &mut CodeBlock,
    sz_pref: bool,
    rex_w: bool,
    r_opnd: Opnd,
    rm_opnd: Opnd,
    op_ext: Option<u8>,
    opcode: &[u8],
) -> Result<(), JitError> {
    assert!(matches!(r_opnd, Opnd::Reg(_) | Opnd::None));

    let need_rex = rex_w || rex_needed(&r_opnd) || rex_needed(&rm_opnd);
    let need_sib = sib_needed(&r_opnd) || sib_needed(&rm_opnd);

    if sz_pref {
        cb.write_byte(0x66)?;
    }

    if need_rex {
        let r = match r_opnd {
            Opnd::Reg(reg) => reg.is_extended() as u8,
            _ => 0,
        };
        let x = if need_sib {
            match rm_opnd.as_mem() {
                Some(m) if m.has_idx => ((m.idx_reg_no & 8) != 0) as u8,
                _ => 0,
            }
        } else {
            0
        };
        let b = match rm_opnd {
            Opnd::Reg(reg) => reg.is_extended() as u8,
            Opnd::Mem(m) => ((m.base_reg_no & 8) != 0) as u8,
            _ => 0,
        };
        write_rex(cb, rex_w, r << 3, x << 3, b << 3)?;
    }

    cb.write_bytes(opcode)?;

    let mod_bits: u8 = match rm_opnd {
        Opnd::Reg(_) => 3,
        Opnd::Mem(m) => {
            let dsize = disp_size(&m);
            if dsize == 0 || m.is_iprel {
                0
            } else if dsize == 8 {
                1
            } else {
                2
            }
        }
        _ => unreachable!("rm operand must be reg or mem"),
    };

    let reg_bits: u8 = if let Some(ext) = op_ext {
        ext
    } else if let Opnd::Reg(r) = r_opnd {
        r.reg_no & 7
    } else {
        0
    };

    let rm_bits: u8 = match rm_opnd {
        Opnd::Reg(r) => r.reg_no & 7,
        Opnd::Mem(_) => if need_sib { 4 } else { rm_opnd.as_mem().unwrap().base_reg_no & 7 },
        _ => unreachable!(),
    };

    cb.write_byte((mod_bits << 6) | (reg_bits << 3) | rm_bits)?;

    if need_sib {
        let m = rm_opnd.as_mem().expect("SIB only valid for memory operands");
        let scale = m.scale_exp & 3;
        let index = if m.has_idx { m.idx_reg_no & 7 } else { 4 };
        let base = m.base_reg_no & 7;
        cb.write_byte((scale << 6) | (index << 3) | base)?;
    }

    if let Opnd::Mem(m) = rm_opnd {
        write_disp(cb, &m)?;
    }

    Ok(())
}

/// Write the displacement for `m` at the width `disp_size` selected (0/8/32).
fn write_disp(cb: &mut CodeBlock, m: &Mem) -> Result<(), JitError> {
    match disp_size(m) {
        8 => cb.write_int(m.disp as u8 as u64, 8),
        32 => cb.write_int(m.disp as u32 as u64, 32),
        _ => Ok(()),
    }
}

/// Two-operand ALU instruction family (`add/and/or/xor/sub/cmp/test`),
/// selecting the register-register, register-immediate, or memory forms.
struct AluOp {
    /// opcode when `opnd0` is r/m and `opnd1` is a register (`op r/m, reg`)
    rm_r: u8,
    /// opcode when `opnd0` is a register and `opnd1` is r/m (`op reg, r/m`)
    r_rm: u8,
    /// `/digit` extension used with the `0x80`/`0x81`/`0x83` immediate-group opcode
    imm_ext: u8,
    /// true for `test`, which has its own immediate-group opcode (`0xF6`/`0xF7`)
    is_test: bool,
}

fn alu(cb: &mut CodeBlock, op: &AluOp, opnd0: Opnd, opnd1: Opnd) -> Result<(), JitError> {
    let num_bits = opnd0.num_bits().expect("first operand must be reg or mem");
    let rex_w = num_bits == 64;
    let sz_pref = num_bits == 16;

    let opnd1_imm: Option<i64> = match opnd1 {
        Opnd::Imm(i) => Some(i),
        Opnd::UImm(u) => Some(u as i64),
        _ => None,
    };

    if let Some(imm) = opnd1_imm {
        let dst = opnd0;
        if op.is_test {
            let opcode = if num_bits == 8 { 0xF6 } else { 0xF7 };
            write_rm(cb, sz_pref, rex_w, Opnd::None, dst, Some(0), &[opcode])?;
        } else {
            let fits_i8 = (-128..=127).contains(&imm);
            let opcode = if num_bits == 8 {
                0x80
            } else if fits_i8 {
                0x83
            } else {
                0x81
            };
            write_rm(cb, sz_pref, rex_w, Opnd::None, dst, Some(op.imm_ext), &[opcode])?;
        }
        let imm_bits = if num_bits == 8 {
            8
        } else if op.is_test {
            32
        } else if (-128..=127).contains(&imm) {
            8
        } else {
            32
        };
        return cb.write_int(imm as u64, imm_bits);
    }

    match (opnd0, opnd1) {
        (Opnd::Reg(_), rm) => {
            let opcode = if num_bits == 8 { op.r_rm & !1 } else { op.r_rm };
            write_rm(cb, sz_pref, rex_w, opnd0, rm, None, &[opcode])
        }
        (rm, Opnd::Reg(_)) => {
            let opcode = if num_bits == 8 { op.rm_r & !1 } else { op.rm_r };
            write_rm(cb, sz_pref, rex_w, opnd1, rm, None, &[opcode])
        }
        _ => unreachable!("unsupported ALU operand combination"),
    }
}

macro_rules! alu_mnemonic {
    ($name:ident, $rm_r:expr, $r_rm:expr, $imm_ext:expr) => {
        pub fn $name(cb: &mut CodeBlock, opnd0: Opnd, opnd1: Opnd) -> Result<(), JitError> {
            alu(cb, &AluOp { rm_r: $rm_r, r_rm: $r_rm, imm_ext: $imm_ext, is_test: false }, opnd0, opnd1)
        }
    };
}

alu_mnemonic!(add, 0x01, 0x03, 0);
alu_mnemonic!(and, 0x21, 0x23, 4);
alu_mnemonic!(or, 0x09, 0x0B, 1);
alu_mnemonic!(xor, 0x31, 0x33, 6);
alu_mnemonic!(sub, 0x29, 0x2B, 5);
alu_mnemonic!(cmp, 0x39, 0x3B, 7);

pub fn test(cb: &mut CodeBlock, opnd0: Opnd, opnd1: Opnd) -> Result<(), JitError> {
    match opnd1 {
        Opnd::Imm(_) | Opnd::UImm(_) => alu(cb, &AluOp { rm_r: 0, r_rm: 0, imm_ext: 0, is_test: true }, opnd0, opnd1),
        Opnd::Reg(_) => {
            let num_bits = opnd0.num_bits().unwrap();
            let opcode = if num_bits == 8 { 0x84 } else { 0x85 };
            write_rm(cb, num_bits == 16, num_bits == 64, opnd1, opnd0, None, &[opcode])
        }
        _ => unreachable!(),
    }
}

/// Single-operand r/m instruction selected by a ModRM `/digit` extension
/// (`not`, `neg`, and the shift family).
fn unary_ext(cb: &mut CodeBlock, opnd: Opnd, ext: u8, opcode8: u8, opcode_full: u8) -> Result<(), JitError> {
    let num_bits = opnd.num_bits().expect("operand must be reg or mem");
    let opcode = if num_bits == 8 { opcode8 } else { opcode_full };
    write_rm(cb, num_bits == 16, num_bits == 64, Opnd::None, opnd, Some(ext), &[opcode])
}

pub fn not(cb: &mut CodeBlock, opnd: Opnd) -> Result<(), JitError> {
    unary_ext(cb, opnd, 2, 0xF6, 0xF7)
}

pub fn neg(cb: &mut CodeBlock, opnd: Opnd) -> Result<(), JitError> {
    unary_ext(cb, opnd, 3, 0xF6, 0xF7)
}

fn shift(cb: &mut CodeBlock, opnd: Opnd, amount: Opnd, ext: u8) -> Result<(), JitError> {
    let num_bits = opnd.num_bits().expect("operand must be reg or mem");
    match amount {
        Opnd::Imm(1) | Opnd::UImm(1) => {
            let opcode = if num_bits == 8 { 0xD0 } else { 0xD1 };
            write_rm(cb, num_bits == 16, num_bits == 64, Opnd::None, opnd, Some(ext), &[opcode])
        }
        Opnd::Imm(n) => {
            let opcode = if num_bits == 8 { 0xC0 } else { 0xC1 };
            write_rm(cb, num_bits == 16, num_bits == 64, Opnd::None, opnd, Some(ext), &[opcode])?;
            cb.write_int(n as u8 as u64, 8)
        }
        Opnd::Reg(r) if r.reg_no == super::operand::RCX.reg_no && r.num_bits == 8 => {
            let opcode = if num_bits == 8 { 0xD2 } else { 0xD3 };
            write_rm(cb, num_bits == 16, num_bits == 64, Opnd::None, opnd, Some(ext), &[opcode])
        }
        _ => panic!("shift amount must be an immediate or cl"),
    }
}

pub fn shl(cb: &mut CodeBlock, opnd: Opnd, amount: Opnd) -> Result<(), JitError> {
    shift(cb, opnd, amount, 4)
}
pub fn shr(cb: &mut CodeBlock, opnd: Opnd, amount: Opnd) -> Result<(), JitError> {
    shift(cb, opnd, amount, 5)
}
pub fn sal(cb: &mut CodeBlock, opnd: Opnd, amount: Opnd) -> Result<(), JitError> {
    shift(cb, opnd, amount, 4)
}
pub fn sar(cb: &mut CodeBlock, opnd: Opnd, amount: Opnd) -> Result<(), JitError> {
    shift(cb, opnd, amount, 7)
}

pub fn mov(cb: &mut CodeBlock, dst: Opnd, src: Opnd) -> Result<(), JitError> {
    let src_imm: Option<u64> = match src {
        Opnd::Imm(i) => Some(i as u64),
        Opnd::UImm(u) => Some(u),
        _ => None,
    };

    match (dst, src_imm) {
        (Opnd::Reg(r), Some(imm)) if r.num_bits == 64 => {
            let sign_extends = matches!(src, Opnd::Imm(i) if (i32::MIN as i64..=i32::MAX as i64).contains(&i));
            if sign_extends {
                // mov r/m64, imm32 (sign-extended) — opcode 0xC7 /0
                write_rm(cb, false, true, Opnd::None, dst, Some(0), &[0xC7])?;
                cb.write_int(imm & 0xFFFF_FFFF, 32)
            } else {
                // mov r64, imm64 — opcode 0xB8+r
                write_rex(cb, true, 0, 0, if r.is_extended() { 8 } else { 0 })?;
                cb.write_byte(0xB8 | (r.reg_no & 7))?;
                cb.write_int(imm, 64)
            }
        }
        (Opnd::Reg(r), Some(imm)) if r.num_bits == 8 => {
            if r.is_extended() || (4..=7).contains(&r.reg_no) {
                write_rex(cb, false, 0, 0, if r.is_extended() { 8 } else { 0 })?;
            }
            cb.write_byte(0xB0 | (r.reg_no & 7))?;
            cb.write_int(imm & 0xFF, 8)
        }
        (Opnd::Reg(r), Some(imm)) => {
            if r.num_bits == 16 {
                cb.write_byte(0x66)?;
            }
            if r.is_extended() {
                write_rex(cb, false, 0, 0, 8)?;
            }
            cb.write_byte(0xB8 | (r.reg_no & 7))?;
            let mask = if r.num_bits == 16 { 0xFFFF } else { 0xFFFF_FFFF };
            cb.write_int(imm & mask, r.num_bits)
        }
        (Opnd::Mem(_), Some(imm)) => {
            let num_bits = dst.num_bits().unwrap();
            write_rm(cb, num_bits == 16, num_bits == 64, Opnd::None, dst, Some(0), &[if num_bits == 8 { 0xC6 } else { 0xC7 }])?;
            cb.write_int(imm, if num_bits == 8 { 8 } else { 32 })
        }
        (Opnd::Reg(_), None) => {
            let num_bits = dst.num_bits().unwrap();
            write_rm(cb, num_bits == 16, num_bits == 64, dst, src, None, &[if num_bits == 8 { 0x8A } else { 0x8B }])
        }
        (Opnd::Mem(_), None) => {
            let num_bits = src.num_bits().unwrap();
            write_rm(cb, num_bits == 16, num_bits == 64, src, dst, None, &[if num_bits == 8 { 0x88 } else { 0x89 }])
        }
        _ => unreachable!("unsupported mov operand combination"),
    }
}

/// `movsx dst, src` — sign-extending move.
pub fn movsx(cb: &mut CodeBlock, dst: Opnd, src: Opnd) -> Result<(), JitError> {
    let dst_reg = dst.as_reg().expect("movsx destination must be a register");
    let src_bits = src.num_bits().expect("movsx source must be reg or mem");
    let rex_w = dst_reg.num_bits == 64;
    let opcode: &[u8] = match src_bits {
        8 => &[0x0F, 0xBE],
        16 => &[0x0F, 0xBF],
        32 => &[0x63],
        _ => panic!("movsx source must be 8, 16, or 32 bits"),
    };
    write_rm(cb, false, rex_w, dst, src, None, opcode)
}

/// `movzx dst, src` — zero-extending move.
pub fn movzx(cb: &mut CodeBlock, dst: Opnd, src: Opnd) -> Result<(), JitError> {
    let dst_reg = dst.as_reg().expect("movzx destination must be a register");
    let src_bits = src.num_bits().expect("movzx source must be reg or mem");
    let rex_w = dst_reg.num_bits == 64;
    let opcode: &[u8] = match src_bits {
        8 => &[0x0F, 0xB6],
        16 => &[0x0F, 0xB7],
        _ => panic!("movzx source must be 8 or 16 bits"),
    };
    write_rm(cb, false, rex_w, dst, src, None, opcode)
}

pub fn lea(cb: &mut CodeBlock, dst: Opnd, src: Opnd) -> Result<(), JitError> {
    let num_bits = dst.num_bits().unwrap();
    write_rm(cb, false, num_bits == 64, dst, src, None, &[0x8D])
}

fn reg_opcode_plus_r(cb: &mut CodeBlock, base_opcode: u8, r: Reg) -> Result<(), JitError> {
    if r.is_extended() {
        write_rex(cb, false, 0, 0, 8)?;
    }
    cb.write_byte(base_opcode | (r.reg_no & 7))
}

pub fn push(cb: &mut CodeBlock, opnd: Opnd) -> Result<(), JitError> {
    match opnd {
        Opnd::Reg(r) => reg_opcode_plus_r(cb, 0x50, r),
        Opnd::Mem(_) => write_rm(cb, false, false, Opnd::None, opnd, Some(6), &[0xFF]),
        _ => panic!("push requires a register or memory operand"),
    }
}

pub fn pop(cb: &mut CodeBlock, opnd: Opnd) -> Result<(), JitError> {
    match opnd {
        Opnd::Reg(r) => reg_opcode_plus_r(cb, 0x58, r),
        Opnd::Mem(_) => write_rm(cb, false, false, Opnd::None, opnd, Some(0), &[0x8F]),
        _ => panic!("pop requires a register or memory operand"),
    }
}

pub fn pushfq(cb: &mut CodeBlock) -> Result<(), JitError> {
    cb.write_byte(0x9C)
}

pub fn popfq(cb: &mut CodeBlock) -> Result<(), JitError> {
    cb.write_byte(0x9D)
}

pub fn ret(cb: &mut CodeBlock) -> Result<(), JitError> {
    cb.write_byte(0xC3)
}

pub fn cdq(cb: &mut CodeBlock) -> Result<(), JitError> {
    cb.write_byte(0x99)
}

pub fn cqo(cb: &mut CodeBlock) -> Result<(), JitError> {
    write_rex(cb, true, 0, 0, 0)?;
    cb.write_byte(0x99)
}

pub fn int3(cb: &mut CodeBlock) -> Result<(), JitError> {
    cb.write_byte(0xCC)
}

pub fn ud2(cb: &mut CodeBlock) -> Result<(), JitError> {
    cb.write_byte(0x0F)?;
    cb.write_byte(0x0B)
}

/// Variable-length `nop`, padding exactly `length` bytes (1-9), using the
/// canonical multi-byte NOP encodings so padding never changes semantics.
pub fn nop(cb: &mut CodeBlock, length: usize) -> Result<(), JitError> {
    const FORMS: [&[u8]; 9] = [
        &[0x90],
        &[0x66, 0x90],
        &[0x0F, 0x1F, 0x00],
        &[0x0F, 0x1F, 0x40, 0x00],
        &[0x0F, 0x1F, 0x44, 0x00, 0x00],
        &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
        &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
        &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
        &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    ];
    let mut remaining = length;
    while remaining > 0 {
        let chunk = remaining.min(9);
        cb.write_bytes(FORMS[chunk - 1])?;
        remaining -= chunk;
    }
    Ok(())
}

/// Direct `call rel32`.
pub fn call_rel32(cb: &mut CodeBlock, rel32: i32) -> Result<(), JitError> {
    cb.write_byte(0xE8)?;
    cb.write_int(rel32 as u32 as u64, 32)
}

/// `call` through a register (`call r/m64`).
pub fn call_reg(cb: &mut CodeBlock, reg: Reg) -> Result<(), JitError> {
    write_rm(cb, false, false, Opnd::None, Opnd::Reg(reg), Some(2), &[0xFF])
}

/// Emit a call to an arbitrary absolute address: a direct `rel32` call if
/// reachable, else load `dst` into `scratch` and call indirectly.
pub fn call_ptr(cb: &mut CodeBlock, scratch: Reg, dst: *const u8) -> Result<(), JitError> {
    let cur_end = cb.get_pos() + 5; // opcode + rel32, if direct form fits
    let rel = dst as i64 - cur_end as i64;
    if rel >= i32::MIN as i64 && rel <= i32::MAX as i64 {
        call_rel32(cb, rel as i32)
    } else {
        mov(cb, Opnd::Reg(scratch), Opnd::UImm(dst as u64))?;
        call_reg(cb, scratch)
    }
}

pub fn call_label(cb: &mut CodeBlock, label: LabelId) -> Result<(), JitError> {
    cb.write_byte(0xE8)?;
    cb.label_ref(label)
}

macro_rules! cmov_mnemonic {
    ($name:ident, $opcode:expr) => {
        pub fn $name(cb: &mut CodeBlock, dst: Opnd, src: Opnd) -> Result<(), JitError> {
            let num_bits = dst.num_bits().unwrap();
            write_rm(cb, num_bits == 16, num_bits == 64, dst, src, None, &[0x0F, $opcode])
        }
    };
}

cmov_mnemonic!(cmova, 0x47);
cmov_mnemonic!(cmovae, 0x43);
cmov_mnemonic!(cmovb, 0x42);
cmov_mnemonic!(cmovbe, 0x46);
cmov_mnemonic!(cmovc, 0x42);
cmov_mnemonic!(cmove, 0x44);
cmov_mnemonic!(cmovg, 0x4F);
cmov_mnemonic!(cmovge, 0x4D);
cmov_mnemonic!(cmovl, 0x4C);
cmov_mnemonic!(cmovle, 0x4E);
cmov_mnemonic!(cmovna, 0x46);
cmov_mnemonic!(cmovnae, 0x42);
cmov_mnemonic!(cmovnb, 0x43);
cmov_mnemonic!(cmovnbe, 0x47);
cmov_mnemonic!(cmovnc, 0x43);
cmov_mnemonic!(cmovne, 0x45);
cmov_mnemonic!(cmovng, 0x4E);
cmov_mnemonic!(cmovnge, 0x4C);
cmov_mnemonic!(cmovnl, 0x4D);
cmov_mnemonic!(cmovnle, 0x4F);
cmov_mnemonic!(cmovno, 0x41);
cmov_mnemonic!(cmovnp, 0x4B);
cmov_mnemonic!(cmovns, 0x49);
cmov_mnemonic!(cmovnz, 0x45);
cmov_mnemonic!(cmovo, 0x40);
cmov_mnemonic!(cmovp, 0x4A);
cmov_mnemonic!(cmovpe, 0x4A);
cmov_mnemonic!(cmovpo, 0x4B);
cmov_mnemonic!(cmovs, 0x48);
cmov_mnemonic!(cmovz, 0x44);

/// The full condition-code space `jcc(label)` dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    A, Ae, B, Be, C, E, G, Ge, L, Le, Ns, Nz, O, P, S, Z,
    Na, Nae, Nb, Nbe, Nc, Ne, Ng, Nge, Nl, Nle, No, Np, Ps, Po,
}

impl Cond {
    /// `(tttn, negated-tttn)` nibble used by both one- and two-byte jcc forms.
    fn opcode_tail(self) -> u8 {
        use Cond::*;
        match self {
            O => 0x0, No => 0x1,
            B | C | Nae => 0x2, Ae | Nb | Nc => 0x3,
            E | Z => 0x4, Ne | Nz => 0x5,
            Be | Na => 0x6, A | Nbe => 0x7,
            S => 0x8, Ns => 0x9,
            P | Pe => 0xA, Np | Po => 0xB,
            L | Nge => 0xC, Ge | Nl => 0xD,
            Le | Ng => 0xE, G | Nle => 0xF,
        }
    }
}

/// `j<cc> label` — resolved later via `link_labels`.
pub fn jcc(cb: &mut CodeBlock, cond: Cond, label: LabelId) -> Result<(), JitError> {
    cb.write_byte(0x0F)?;
    cb.write_byte(0x80 | cond.opcode_tail())?;
    cb.label_ref(label)
}

/// `j<cc> absolute` — emits the two-byte opcode plus a computed rel32; the
/// caller must ensure the displacement fits in 32 bits (the encoder asserts).
pub fn jcc_ptr(cb: &mut CodeBlock, cond: Cond, absolute: *const u8) -> Result<(), JitError> {
    cb.write_byte(0x0F)?;
    cb.write_byte(0x80 | cond.opcode_tail())?;
    let cursor_after_opcode = cb.get_pos() + 4;
    let rel = absolute as i64 - cursor_after_opcode as i64;
    if rel < i32::MIN as i64 || rel > i32::MAX as i64 {
        return Err(JitError::EncodingConstraintViolated(format!(
            "jcc_ptr target {:p} is not reachable with a rel32 displacement from {:p}",
            absolute,
            cb.get_ptr(cursor_after_opcode)
        )));
    }
    cb.write_int(rel as u32 as u64, 32)
}

pub fn jmp(cb: &mut CodeBlock, label: LabelId) -> Result<(), JitError> {
    cb.write_byte(0xE9)?;
    cb.label_ref(label)
}

/// `jmp absolute`, asserting the rel32 range the same way `jcc_ptr` does.
/// Callers that cannot guarantee reachability should spill into a scratch
/// register and use an indirect `jmp r/m64` instead (not exposed as a bare
/// mnemonic here since the Compiler always knows which form it needs).
pub fn jmp_ptr(cb: &mut CodeBlock, absolute: *const u8) -> Result<(), JitError> {
    cb.write_byte(0xE9)?;
    let cursor_after_opcode = cb.get_pos() + 4;
    let rel = absolute as i64 - cursor_after_opcode as i64;
    if rel < i32::MIN as i64 || rel > i32::MAX as i64 {
        return Err(JitError::EncodingConstraintViolated(format!(
            "jmp_ptr target {:p} is not reachable with a rel32 displacement", absolute
        )));
    }
    cb.write_int(rel as u32 as u64, 32)
}

/// Indirect `jmp r/m64`.
pub fn jmp_reg(cb: &mut CodeBlock, reg: Reg) -> Result<(), JitError> {
    write_rm(cb, false, false, Opnd::None, Opnd::Reg(reg), Some(4), &[0xFF])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::operand::*;

    fn bytes(f: impl FnOnce(&mut CodeBlock) -> Result<(), JitError>) -> Vec<u8> {
        let mut cb = CodeBlock::new(4096).unwrap();
        f(&mut cb).unwrap();
        cb.read_bytes(0, cb.get_pos()).to_vec()
    }

    #[test]
    fn test_add_reg_reg() {
        // add rax, rcx -> REX.W 01 c8
        assert_eq!(bytes(|cb| add(cb, Opnd::Reg(RAX), Opnd::Reg(RCX))), vec![0x48, 0x01, 0xC8]);
    }

    #[test]
    fn test_add_reg_imm8() {
        // add rax, 1 -> REX.W 83 /0 ib
        assert_eq!(bytes(|cb| add(cb, Opnd::Reg(RAX), Opnd::Imm(1))), vec![0x48, 0x83, 0xC0, 0x01]);
    }

    #[test]
    fn test_sub_extended_reg() {
        // sub r8, rax -> REX.WB 29 c0 (r8 is rm, reg field is rax)
        assert_eq!(bytes(|cb| sub(cb, Opnd::Reg(R8), Opnd::Reg(RAX))), vec![0x49, 0x29, 0xC0]);
    }

    #[test]
    fn test_mov_reg_mem_disp8() {
        let mem = mem_opnd(64, RDI, 8);
        // mov rax, [rdi+8] -> REX.W 8B 47 08
        assert_eq!(bytes(|cb| mov(cb, Opnd::Reg(RAX), mem)), vec![0x48, 0x8B, 0x47, 0x08]);
    }

    #[test]
    fn test_mov_reg_mem_rbp_disp0_forces_disp8() {
        let mem = mem_opnd(64, RBP, 0);
        // mov rax, [rbp+0] must still encode an 8-bit zero displacement
        assert_eq!(bytes(|cb| mov(cb, Opnd::Reg(RAX), mem)), vec![0x48, 0x8B, 0x45, 0x00]);
    }

    #[test]
    fn test_mov_rsp_base_needs_sib() {
        let mem = mem_opnd(64, RSP, 0);
        // mov rax, [rsp] -> REX.W 8B 04 24 (SIB byte with no index)
        assert_eq!(bytes(|cb| mov(cb, Opnd::Reg(RAX), mem)), vec![0x48, 0x8B, 0x04, 0x24]);
    }

    #[test]
    fn test_push_pop_extended() {
        assert_eq!(bytes(|cb| push(cb, Opnd::Reg(R12))), vec![0x41, 0x54]);
        assert_eq!(bytes(|cb| pop(cb, Opnd::Reg(R12))), vec![0x41, 0x5C]);
    }

    #[test]
    fn test_ret_int3_ud2() {
        assert_eq!(bytes(|cb| ret(cb)), vec![0xC3]);
        assert_eq!(bytes(|cb| int3(cb)), vec![0xCC]);
        assert_eq!(bytes(|cb| ud2(cb)), vec![0x0F, 0x0B]);
    }

    #[test]
    fn test_nop_variable_length() {
        assert_eq!(bytes(|cb| nop(cb, 1)), vec![0x90]);
        assert_eq!(bytes(|cb| nop(cb, 3)), vec![0x0F, 0x1F, 0x00]);
        assert_eq!(bytes(|cb| nop(cb, 10)).len(), 10);
    }

    #[test]
    fn test_jmp_label_resolves_to_rel32() {
        let mut cb = CodeBlock::new(4096).unwrap();
        let label = cb.new_label();
        jmp(&mut cb, label).unwrap();
        let ref_end = cb.get_pos();
        nop(&mut cb, 4).unwrap();
        cb.write_label(label);
        let target = cb.get_pos();
        cb.link_labels();
        let rel = i32::from_le_bytes(cb.read_bytes(ref_end - 4, 4).try_into().unwrap());
        assert_eq!(rel, target as i32 - ref_end as i32);
        assert_eq!(cb.read_bytes(0, 1), &[0xE9]);
    }

    #[test]
    fn test_jcc_opcode() {
        let mut cb = CodeBlock::new(4096).unwrap();
        let label = cb.new_label();
        jcc(&mut cb, Cond::Z, label).unwrap();
        assert_eq!(cb.read_bytes(0, 2), &[0x0F, 0x84]);
    }

    #[test]
    fn test_cmovle() {
        assert_eq!(bytes(|cb| cmovle(cb, Opnd::Reg(RAX), Opnd::Reg(RCX))), vec![0x48, 0x0F, 0x4E, 0xC1]);
    }

    #[test]
    fn test_call_rel32_direct() {
        let mut cb = CodeBlock::new(4096).unwrap();
        let target = cb.get_ptr(0);
        // Within range: should pick the direct rel32 form.
        call_ptr(&mut cb, RAX, target).unwrap();
        assert_eq!(cb.read_bytes(0, 1), &[0xE8]);
    }

    #[test]
    fn test_shl_imm() {
        assert_eq!(bytes(|cb| shl(cb, Opnd::Reg(RAX), Opnd::Imm(1))), vec![0x48, 0xD1, 0xE0]);
        assert_eq!(bytes(|cb| shl(cb, Opnd::Reg(RAX), Opnd::Imm(5))), vec![0x48, 0xC1, 0xE0, 0x05]);
    }

    #[test]
    fn test_lea() {
        let mem = mem_opnd(64, RDI, 16);
        assert_eq!(bytes(|cb| lea(cb, Opnd::Reg(RAX), mem)), vec![0x48, 0x8D, 0x47, 0x10]);
    }
}
