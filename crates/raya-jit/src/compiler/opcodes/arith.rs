//! `opt_plus` / `opt_minus` / `opt_lt`: fixnum fast paths, guarded by a
//! basic-operator-redefinition check and a fixnum tag check on both
//! operands.

use super::super::{HandlerResult, REG0, REG1, REG_SP};
use crate::asm::encoder::{self, Cond};
use crate::asm::operand::Opnd;
use crate::core::block::Block;
use crate::core::context::{Context, TypeTag};
use crate::iface::HostInterp;
use crate::{bop_redefinition_token, Jit};

/// Basic-operator ids consulted against the host's redefined-flags word.
/// Values are this crate's own numbering, forwarded opaquely to the host.
pub const BOP_PLUS: u32 = 0;
pub const BOP_MINUS: u32 = 1;
pub const BOP_LT: u32 = 2;

/// Emit the shared fixnum fast-path prologue for a two-operand arithmetic
/// opcode: pop both operands into `REG0`/`REG1`, guard each is a tagged
/// fixnum (bit 0 set), side-exiting otherwise.
fn guard_both_fixnums<H: HostInterp>(jit: &mut Jit<H>, ctx: &mut Context, bytecode_idx: u32) {
    let rhs = ctx.pop(REG_SP, 1);
    let lhs = ctx.pop(REG_SP, 1);
    encoder::mov(&mut jit.cb, Opnd::Reg(REG1), rhs).unwrap();
    encoder::mov(&mut jit.cb, Opnd::Reg(REG0), lhs).unwrap();

    let tag_bit = jit.host.tag_fixnum_bit();
    for reg in [REG0, REG1] {
        encoder::test(&mut jit.cb, Opnd::Reg(reg), Opnd::UImm(1 << tag_bit)).unwrap();
        let exit_ptr = jit.gen_side_exit(ctx, bytecode_idx);
        let ok_label = jit.cb.new_label();
        encoder::jcc(&mut jit.cb, Cond::Nz, ok_label).unwrap();
        match encoder::jmp_ptr(&mut jit.cb, exit_ptr) {
            Ok(()) => {}
            Err(_) => {
                let scratch = if reg == REG0 { REG1 } else { REG0 };
                encoder::mov(&mut jit.cb, Opnd::Reg(scratch), Opnd::UImm(exit_ptr as u64)).unwrap();
                encoder::jmp_reg(&mut jit.cb, scratch).unwrap();
            }
        }
        jit.cb.write_label(ok_label);
    }
}

fn bop_not_redefined<H: HostInterp>(jit: &Jit<H>, bop_id: u32) -> bool {
    !jit.host.bop_redefined(jit.host.integer_class_ref(), bop_id)
}

pub fn opt_plus<H: HostInterp>(jit: &mut Jit<H>, block: &mut Block, ctx: &mut Context, bytecode_idx: u32) -> HandlerResult {
    if !bop_not_redefined(jit, BOP_PLUS) {
        return HandlerResult::CantCompile;
    }
    guard_both_fixnums(jit, ctx, bytecode_idx);

    // Tagged fixnums are `(n << 1) | 1`; adding them directly double-counts
    // the tag bit, so untag one operand first, then combine. The overflow
    // check must immediately follow the combining `add`, since that's the
    // instruction whose OF reflects the real arithmetic overflow.
    encoder::sub(&mut jit.cb, Opnd::Reg(REG0), Opnd::Imm(1)).unwrap();
    encoder::add(&mut jit.cb, Opnd::Reg(REG0), Opnd::Reg(REG1)).unwrap();
    side_exit_on_overflow(jit, ctx, bytecode_idx);

    let dst = ctx.push(REG_SP, TypeTag::Fixnum);
    encoder::mov(&mut jit.cb, dst, Opnd::Reg(REG0)).unwrap();
    record_bop_dep(jit, block, BOP_PLUS);
    HandlerResult::KeepCompiling
}

pub fn opt_minus<H: HostInterp>(jit: &mut Jit<H>, block: &mut Block, ctx: &mut Context, bytecode_idx: u32) -> HandlerResult {
    if !bop_not_redefined(jit, BOP_MINUS) {
        return HandlerResult::CantCompile;
    }
    guard_both_fixnums(jit, ctx, bytecode_idx);

    // Tags cancel under subtraction (`(a<<1|1) - (b<<1|1) == (a-b)<<1`), so
    // the combining `sub` produces a correctly shaped result directly; the
    // overflow check must immediately follow it, before the tag-fix `add`
    // recomputes OF from its own operands.
    encoder::sub(&mut jit.cb, Opnd::Reg(REG0), Opnd::Reg(REG1)).unwrap();
    side_exit_on_overflow(jit, ctx, bytecode_idx);
    encoder::add(&mut jit.cb, Opnd::Reg(REG0), Opnd::Imm(1)).unwrap();

    let dst = ctx.push(REG_SP, TypeTag::Fixnum);
    encoder::mov(&mut jit.cb, dst, Opnd::Reg(REG0)).unwrap();
    record_bop_dep(jit, block, BOP_MINUS);
    HandlerResult::KeepCompiling
}

pub fn opt_lt<H: HostInterp>(jit: &mut Jit<H>, block: &mut Block, ctx: &mut Context, bytecode_idx: u32) -> HandlerResult {
    if !bop_not_redefined(jit, BOP_LT) {
        return HandlerResult::CantCompile;
    }
    guard_both_fixnums(jit, ctx, bytecode_idx);

    encoder::cmp(&mut jit.cb, Opnd::Reg(REG0), Opnd::Reg(REG1)).unwrap();
    let true_val = host_true_value();
    let false_val = host_false_value();
    encoder::mov(&mut jit.cb, Opnd::Reg(REG0), Opnd::UImm(false_val)).unwrap();
    encoder::mov(&mut jit.cb, Opnd::Reg(REG1), Opnd::UImm(true_val)).unwrap();
    encoder::cmovl(&mut jit.cb, Opnd::Reg(REG0), Opnd::Reg(REG1)).unwrap();

    let dst = ctx.push(REG_SP, TypeTag::Unknown);
    encoder::mov(&mut jit.cb, dst, Opnd::Reg(REG0)).unwrap();
    record_bop_dep(jit, block, BOP_LT);
    HandlerResult::KeepCompiling
}

/// Record that this block's fast path trusts basic operator `bop_id` on the
/// fixnum/Integer class staying un-redefined, so `notify_bop_redefined` can
/// find and recompile it (see `core::invariants` and AMBIENT-4).
fn record_bop_dep<H: HostInterp>(jit: &Jit<H>, block: &mut Block, bop_id: u32) {
    let token = bop_redefinition_token(jit.host.integer_class_ref(), bop_id);
    block.deps.bop.get_or_insert(token);
}

/// Pre-op side-exit on arithmetic overflow: reads OF from whatever
/// instruction the Compiler just emitted, so callers must call this
/// immediately after the combining `add`/`sub`, before any tag-fix
/// instruction that would clobber OF with its own.
fn side_exit_on_overflow<H: HostInterp>(jit: &mut Jit<H>, ctx: &Context, bytecode_idx: u32) {
    let exit_ptr = jit.gen_side_exit(ctx, bytecode_idx);
    let ok_label = jit.cb.new_label();
    encoder::jcc(&mut jit.cb, Cond::No, ok_label).unwrap();
    match encoder::jmp_ptr(&mut jit.cb, exit_ptr) {
        Ok(()) => {}
        Err(_) => {
            encoder::mov(&mut jit.cb, Opnd::Reg(REG1), Opnd::UImm(exit_ptr as u64)).unwrap();
            encoder::jmp_reg(&mut jit.cb, REG1).unwrap();
        }
    }
    jit.cb.write_label(ok_label);
}

const fn host_true_value() -> u64 {
    0x14
}

const fn host_false_value() -> u64 {
    0x00
}
