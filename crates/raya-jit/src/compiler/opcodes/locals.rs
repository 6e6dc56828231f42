//! `getlocal_WC_0` / `setlocal_WC_0`: access to locals through the
//! zero-depth environment pointer.

use super::super::bytecode::Insn;
use super::super::{HandlerResult, REG0, REG1, REG_CFP};
use crate::asm::encoder::{self, Cond};
use crate::asm::operand::{mem_opnd, Opnd};
use crate::core::context::{Context, TypeTag};
use crate::iface::{HostInterp, ENV_FLAG_WB_REQUIRED};
use crate::Jit;

fn load_ep<H: HostInterp>(jit: &mut Jit<H>, dst: crate::asm::operand::Reg) {
    let ep_opnd = mem_opnd(64, REG_CFP, jit.host.cfp_layout().ep_offset());
    encoder::mov(&mut jit.cb, Opnd::Reg(dst), ep_opnd).unwrap();
}

pub fn getlocal_wc0<H: HostInterp>(jit: &mut Jit<H>, ctx: &mut Context, insn: &Insn) -> HandlerResult {
    let k = insn.operands.first().copied().unwrap_or(0);
    load_ep(jit, REG0);
    let slot = mem_opnd(64, REG0, -(k as i32) * jit.host.slot_size());
    encoder::mov(&mut jit.cb, Opnd::Reg(REG0), slot).unwrap();
    let dst = ctx.push(crate::compiler::REG_SP, TypeTag::Unknown);
    encoder::mov(&mut jit.cb, dst, Opnd::Reg(REG0)).unwrap();
    HandlerResult::KeepCompiling
}

/// Per spec: "if flags & WB_REQUIRED on the EP, side-exit; else pop into
/// `[EP + -k*slot_size]`." The flag is only knowable at run time (the EP is
/// a runtime pointer), so the guard is emitted as a branch to a side exit
/// rather than checked at compile time.
pub fn setlocal_wc0<H: HostInterp>(jit: &mut Jit<H>, ctx: &mut Context, insn: &Insn, bytecode_idx: u32) -> HandlerResult {
    let k = insn.operands.first().copied().unwrap_or(0);
    load_ep(jit, REG1);

    let flags_opnd = mem_opnd(64, REG1, jit.host.ep_flags_offset());
    encoder::test(&mut jit.cb, flags_opnd, Opnd::UImm(ENV_FLAG_WB_REQUIRED as u64)).unwrap();
    let exit_ptr = jit.gen_side_exit(ctx, bytecode_idx);
    let skip_label = jit.cb.new_label();
    encoder::jcc(&mut jit.cb, Cond::Z, skip_label).unwrap();
    match encoder::jmp_ptr(&mut jit.cb, exit_ptr) {
        Ok(()) => {}
        Err(_) => {
            encoder::mov(&mut jit.cb, Opnd::Reg(REG0), Opnd::UImm(exit_ptr as u64)).unwrap();
            encoder::jmp_reg(&mut jit.cb, REG0).unwrap();
        }
    }
    jit.cb.write_label(skip_label);

    let src = ctx.pop(crate::compiler::REG_SP, 1);
    encoder::mov(&mut jit.cb, Opnd::Reg(REG0), src).unwrap();
    let slot = mem_opnd(64, REG1, -(k as i32) * jit.host.slot_size());
    encoder::mov(&mut jit.cb, slot, Opnd::Reg(REG0)).unwrap();
    HandlerResult::KeepCompiling
}
