//! `nop`, `pop`, `dup`, `putnil`, `putobject[_INT2FIX_0_/1_]`, `putself`.

use super::super::bytecode::Insn;
use super::super::{HandlerResult, REG0, REG_CFP, REG_SP};
use crate::asm::encoder;
use crate::asm::operand::Opnd;
use crate::core::context::{Context, TypeTag};
use crate::iface::HostInterp;
use crate::Jit;

pub fn pop<H: HostInterp>(jit: &mut Jit<H>, ctx: &mut Context) -> HandlerResult {
    ctx.pop(REG_SP, 1);
    let _ = jit;
    HandlerResult::KeepCompiling
}

/// Read the top into scratch, then push it twice.
pub fn dup<H: HostInterp>(jit: &mut Jit<H>, ctx: &mut Context) -> HandlerResult {
    let top = ctx.opnd(REG_SP, 0);
    let top_ty = ctx.get_top_type();
    encoder::mov(&mut jit.cb, Opnd::Reg(REG0), top).unwrap();
    let dst = ctx.push(REG_SP, top_ty);
    encoder::mov(&mut jit.cb, dst, Opnd::Reg(REG0)).unwrap();
    let dst2 = ctx.push(REG_SP, top_ty);
    encoder::mov(&mut jit.cb, dst2, Opnd::Reg(REG0)).unwrap();
    HandlerResult::KeepCompiling
}

pub fn putnil<H: HostInterp>(jit: &mut Jit<H>, ctx: &mut Context) -> HandlerResult {
    let dst = ctx.push(REG_SP, TypeTag::Nil);
    encoder::mov(&mut jit.cb, dst, Opnd::UImm(nil_value())).unwrap();
    HandlerResult::KeepCompiling
}

pub fn putself<H: HostInterp>(jit: &mut Jit<H>, ctx: &mut Context) -> HandlerResult {
    let self_opnd = crate::asm::operand::mem_opnd(64, REG_CFP, jit.host.cfp_layout().self_offset());
    encoder::mov(&mut jit.cb, Opnd::Reg(REG0), self_opnd).unwrap();
    let dst = ctx.push(REG_SP, ctx.self_type);
    encoder::mov(&mut jit.cb, dst, Opnd::Reg(REG0)).unwrap();
    HandlerResult::KeepCompiling
}

/// `putobject` carries its literal value as the instruction's sole operand.
/// This crate's bytecode subset only needs to distinguish fixnums from
/// everything else for specialization purposes; anything that isn't a
/// tagged fixnum is pushed with an `Unknown` tag so later guards re-check.
pub fn putobject<H: HostInterp>(jit: &mut Jit<H>, ctx: &mut Context, insn: &Insn) -> HandlerResult {
    let value = insn.operands.first().copied().unwrap_or(0);
    let ty = if is_tagged_fixnum(value, jit.host.tag_fixnum_bit()) { TypeTag::Fixnum } else { TypeTag::Unknown };
    let dst = ctx.push(REG_SP, ty);
    encoder::mov(&mut jit.cb, dst, Opnd::UImm(value as u64)).unwrap();
    HandlerResult::KeepCompiling
}

/// `putobject_INT2FIX_0_` / `putobject_INT2FIX_1_`: push the tagged fixnum
/// `n` with no operand fetch, known at compile time to be a fixnum.
pub fn putobject_int2fix<H: HostInterp>(jit: &mut Jit<H>, ctx: &mut Context, n: i64) -> HandlerResult {
    let tagged = (n << 1) | 1;
    let dst = ctx.push(REG_SP, TypeTag::Fixnum);
    encoder::mov(&mut jit.cb, dst, Opnd::UImm(tagged as u64)).unwrap();
    HandlerResult::KeepCompiling
}

fn is_tagged_fixnum(value: i64, tag_bit: u32) -> bool {
    (value & (1 << tag_bit)) != 0
}

/// The host's tagged-nil constant. Fixed by convention with the reference
/// interpreter this spec is modeled on (`Qnil`).
const fn nil_value() -> u64 {
    0x08
}
