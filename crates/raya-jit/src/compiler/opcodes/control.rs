//! `branchunless`, `jump`/`direct_jump`, and `leave`: the branch-emitting
//! opcodes that end a block.

use super::super::bytecode::Insn;
use super::super::{HandlerResult, REG0, REG_SP};
use crate::asm::cb::CodeBlock;
use crate::asm::encoder::{self, Cond};
use crate::asm::operand::Opnd;
use crate::core::block::BlockId;
use crate::core::branch::Shape;
use crate::core::context::Context;
use crate::error::JitError;
use crate::iface::HostInterp;
use crate::Jit;

/// `obj & ~Qnil == 0` identifies both `Qfalse` (0x00) and `Qnil` (0x08) —
/// the VM's two falsy immediates — in one test, mirroring the reference
/// interpreter's `RB_TEST` fast path.
fn test_truthy(cb: &mut CodeBlock, reg: crate::asm::operand::Reg) -> Result<(), JitError> {
    encoder::test(cb, Opnd::Reg(reg), Opnd::UImm(!0x08u64))
}

pub fn branchunless<H: HostInterp>(jit: &mut Jit<H>, ctx: &mut Context, insn: &Insn, bytecode_idx: u32) -> HandlerResult {
    let jump_offset = insn.operands.first().copied().unwrap_or(0) as i64;
    let target0_idx = (bytecode_idx as i64 + jump_offset) as u32; // taken when falsy
    let target1_idx = bytecode_idx + insn.len; // fallthrough, taken when truthy

    let iseq = jit_current_iseq(jit, insn);
    let cond_opnd = ctx.pop(REG_SP, 1);
    encoder::mov(&mut jit.cb, Opnd::Reg(REG0), cond_opnd).unwrap();
    test_truthy(&mut jit.cb, REG0).unwrap();

    let id0 = BlockId { iseq, bytecode_idx: target0_idx };
    let id1 = BlockId { iseq, bytecode_idx: target1_idx };
    jit.gen_branch(*ctx, id0, *ctx, Some((id1, *ctx)), branchunless_gen_fn);
    HandlerResult::EndBlock
}

fn branchunless_gen_fn(cb: &mut CodeBlock, t0: Option<*const u8>, t1: Option<*const u8>, shape: Shape) -> Result<(), JitError> {
    match shape {
        Shape::Default => {
            let t0 = t0.expect("branchunless always has target 0");
            let t1 = t1.expect("branchunless always has target 1");
            encoder::jcc_ptr(cb, Cond::Z, t0)?;
            encoder::jmp_ptr(cb, t1)
        }
        Shape::Next0 => {
            // target 0 (falsy) is adjacent: jump to target 1 when truthy,
            // otherwise fall through into target 0's code.
            let t1 = t1.expect("branchunless always has target 1");
            encoder::jcc_ptr(cb, Cond::Nz, t1)
        }
        Shape::Next1 => {
            // target 1 (truthy fallthrough) is adjacent: jump to target 0
            // when falsy, otherwise fall through.
            let t0 = t0.expect("branchunless always has target 0");
            encoder::jcc_ptr(cb, Cond::Z, t0)
        }
    }
}

pub fn jump<H: HostInterp>(jit: &mut Jit<H>, ctx: &mut Context, insn: &Insn, bytecode_idx: u32) -> HandlerResult {
    let jump_offset = insn.operands.first().copied().unwrap_or(0) as i64;
    let target_idx = (bytecode_idx as i64 + jump_offset) as u32;
    let iseq = jit_current_iseq(jit, insn);
    let id0 = BlockId { iseq, bytecode_idx: target_idx };
    jit.direct_jump(*ctx, id0);
    HandlerResult::EndBlock
}

pub fn jmp_gen_fn(cb: &mut CodeBlock, t0: Option<*const u8>, _t1: Option<*const u8>, shape: Shape) -> Result<(), JitError> {
    match shape {
        Shape::Next0 => Ok(()),
        _ => encoder::jmp_ptr(cb, t0.expect("jump always has target 0")),
    }
}

/// `leave`: return the top of the tracked stack to the interpreter via the
/// epilogue. Treated as always ending the block (there is no successor).
pub fn leave<H: HostInterp>(jit: &mut Jit<H>, ctx: &mut Context) -> HandlerResult {
    let ret_opnd = ctx.pop(REG_SP, 1);
    encoder::mov(&mut jit.cb, Opnd::Reg(crate::asm::operand::RAX), ret_opnd).unwrap();
    let epilogue = jit.epilogue.expect("prologue/epilogue must be emitted before leave");
    let epilogue_ptr = jit.cb.get_ptr(epilogue);
    match encoder::jmp_ptr(&mut jit.cb, epilogue_ptr) {
        Ok(()) => {}
        Err(_) => {
            encoder::mov(&mut jit.cb, Opnd::Reg(REG0), Opnd::UImm(epilogue_ptr as u64)).unwrap();
            encoder::jmp_reg(&mut jit.cb, REG0).unwrap();
        }
    }
    HandlerResult::EndBlock
}

/// Bytecode branch/jump targets are always within the iseq currently being
/// compiled; `Insn` itself carries no iseq identity, so the Compiler's
/// caller threads it through via the block being built. Exposed here as a
/// thin accessor to keep the handler signatures uniform with the others.
fn jit_current_iseq<H: HostInterp>(jit: &Jit<H>, _insn: &Insn) -> crate::iface::IseqRef {
    jit.compiling_iseq.expect("branch/jump handlers only run while compiling a block")
}
