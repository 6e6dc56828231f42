//! Per-opcode handler contracts. Every handler is a pure function of `ctx`
//! and the fixed-size operand slice following the opcode in the bytecode
//! stream (see spec §4.5's handler-contract list).

pub mod arith;
pub mod control;
pub mod ivar;
pub mod locals;
pub mod send;
pub mod stack;

use super::bytecode::{Insn, Opcode};
use super::HandlerResult;
use crate::core::block::Block;
use crate::core::context::Context;
use crate::iface::HostInterp;
use crate::Jit;

/// Look up and invoke the handler for `insn.op`; an opcode outside the
/// supported subset (`Opcode::Other`) always yields `CantCompile`.
pub fn dispatch<H: HostInterp>(jit: &mut Jit<H>, block: &mut Block, ctx: &mut Context, insn: &Insn, bytecode_idx: u32) -> HandlerResult {
    match insn.op {
        Opcode::Nop => HandlerResult::KeepCompiling,
        Opcode::Pop => stack::pop(jit, ctx),
        Opcode::Dup => stack::dup(jit, ctx),
        Opcode::PutNil => stack::putnil(jit, ctx),
        Opcode::PutObject => stack::putobject(jit, ctx, insn),
        Opcode::PutObjectInt2Fix0 => stack::putobject_int2fix(jit, ctx, 0),
        Opcode::PutObjectInt2Fix1 => stack::putobject_int2fix(jit, ctx, 1),
        Opcode::PutSelf => stack::putself(jit, ctx),
        Opcode::GetLocalWc0 => locals::getlocal_wc0(jit, ctx, insn),
        Opcode::SetLocalWc0 => locals::setlocal_wc0(jit, ctx, insn),
        Opcode::GetInstanceVariable => ivar::getinstancevariable(jit, block, ctx, bytecode_idx),
        Opcode::SetInstanceVariable => ivar::setinstancevariable(jit, block, ctx, bytecode_idx),
        Opcode::OptPlus => arith::opt_plus(jit, block, ctx, bytecode_idx),
        Opcode::OptMinus => arith::opt_minus(jit, block, ctx, bytecode_idx),
        Opcode::OptLt => arith::opt_lt(jit, block, ctx, bytecode_idx),
        Opcode::OptSendWithoutBlock => send::opt_send_without_block(jit, block, ctx, insn, bytecode_idx),
        Opcode::BranchUnless => control::branchunless(jit, ctx, insn, bytecode_idx),
        Opcode::Jump => control::jump(jit, ctx, insn, bytecode_idx),
        Opcode::Leave => control::leave(jit, ctx),
        Opcode::Other(_) => HandlerResult::CantCompile,
    }
}
