//! `opt_send_without_block`: a C-function call site specialized on a
//! populated method cache. Always ends the block — this bounds invalidation
//! blast radius to at most one call per compiled region.

use super::super::bytecode::Insn;
use super::super::{HandlerResult, REG0, REG1, REG_CFP, REG_EC, REG_SP};
use crate::asm::encoder::{self, Cond};
use crate::asm::operand::{mem_opnd, Opnd, RDI, RSI};
use crate::core::block::{Block, DependencyToken};
use crate::core::context::{Context, TypeTag};
use crate::iface::HostInterp;
use crate::Jit;

pub fn opt_send_without_block<H: HostInterp>(
    jit: &mut Jit<H>,
    block: &mut Block,
    ctx: &mut Context,
    insn: &Insn,
    bytecode_idx: u32,
) -> HandlerResult {
    let argc = insn.operands.first().copied().unwrap_or(0) as u16;

    let cache = match jit.host.method_cache_at(block.id.iseq, bytecode_idx) {
        Some(c) => c,
        None => return HandlerResult::CantCompile,
    };
    if !matches!(cache.def_type, crate::iface::CmeDefType::Cfunc) {
        return HandlerResult::CantCompile;
    }
    if cache.cfunc_argc != argc as i32 || !cache.simple_call {
        return HandlerResult::CantCompile;
    }

    // Interrupt-flag check: bail to the interpreter if one is pending
    // rather than risk running a C call past a requested interrupt.
    let flag_opnd = mem_opnd(64, REG_EC, jit.host.ec_layout().interrupt_flag_offset());
    let mask_opnd_addr = jit.host.ec_layout().interrupt_mask_offset();
    encoder::mov(&mut jit.cb, Opnd::Reg(REG0), flag_opnd).unwrap();
    encoder::and(&mut jit.cb, Opnd::Reg(REG0), mem_opnd(64, REG_EC, mask_opnd_addr)).unwrap();
    encoder::test(&mut jit.cb, Opnd::Reg(REG0), Opnd::Reg(REG0)).unwrap();
    {
        let exit_ptr = jit.gen_side_exit(ctx, bytecode_idx);
        let ok_label = jit.cb.new_label();
        encoder::jcc(&mut jit.cb, Cond::Z, ok_label).unwrap();
        jump_to(jit, exit_ptr, REG1);
        jit.cb.write_label(ok_label);
    }

    // Class guard on the receiver (the argc'th-from-top slot).
    let recv_opnd = ctx.opnd(REG_SP, argc);
    encoder::mov(&mut jit.cb, Opnd::Reg(REG0), recv_opnd).unwrap();
    let serial_opnd = mem_opnd(64, REG0, jit.host.object_class_serial_offset());
    encoder::cmp(&mut jit.cb, serial_opnd, Opnd::UImm(cache.class_serial)).unwrap();
    {
        let exit_ptr = jit.gen_side_exit(ctx, bytecode_idx);
        let ok_label = jit.cb.new_label();
        encoder::jcc(&mut jit.cb, Cond::E, ok_label).unwrap();
        jump_to(jit, exit_ptr, REG1);
        jit.cb.write_label(ok_label);
    }

    // Advance PC into the caller's frame before any call-out, so a
    // non-local host exception unwinds to a consistent bytecode position.
    let pc_opnd = mem_opnd(64, REG_CFP, jit.host.cfp_layout().pc_offset());
    encoder::mov(&mut jit.cb, pc_opnd, Opnd::UImm((bytecode_idx + insn.len) as u64)).unwrap();

    if !cache.is_leaf_cfunc {
        push_cfunc_frame(jit, ctx, &cache, argc);
    }

    marshal_args_and_call(jit, ctx, &cache, argc);

    if !cache.is_leaf_cfunc {
        pop_cfunc_frame(jit);
    }

    for _ in 0..=argc {
        ctx.pop(REG_SP, 1);
    }
    let dst = ctx.push(REG_SP, TypeTag::Unknown);
    encoder::mov(&mut jit.cb, dst, Opnd::Reg(REG0)).unwrap();

    block.deps.cc.get_or_insert(DependencyToken(cache.cc.0));
    block.deps.cme.get_or_insert(DependencyToken(cache.cme.0));

    HandlerResult::EndBlock
}

fn jump_to<H: HostInterp>(jit: &mut Jit<H>, target: *const u8, scratch: crate::asm::operand::Reg) {
    match encoder::jmp_ptr(&mut jit.cb, target) {
        Ok(()) => {}
        Err(_) => {
            encoder::mov(&mut jit.cb, Opnd::Reg(scratch), Opnd::UImm(target as u64)).unwrap();
            encoder::jmp_reg(&mut jit.cb, scratch).unwrap();
        }
    }
}

/// Decrement `ec.cfp` by one frame and populate it as a synthetic cfunc
/// frame: `pc=0, sp=adjusted, iseq=null, self=receiver, ep=sp-1,
/// flags=CFUNC|CFRAME|LOCAL`.
fn push_cfunc_frame<H: HostInterp>(jit: &mut Jit<H>, ctx: &Context, cache: &crate::iface::MethodCacheEntry, argc: u16) {
    let _ = cache;
    let cfp_size = jit.host.cfp_size();
    encoder::sub(&mut jit.cb, Opnd::Reg(REG_CFP), Opnd::Imm(cfp_size as i64)).unwrap();
    let ec_cfp = mem_opnd(64, REG_EC, jit.host.ec_layout().cfp_offset());
    encoder::mov(&mut jit.cb, ec_cfp, Opnd::Reg(REG_CFP)).unwrap();

    encoder::mov(&mut jit.cb, mem_opnd(64, REG_CFP, jit.host.cfp_layout().pc_offset()), Opnd::Imm(0)).unwrap();
    encoder::mov(&mut jit.cb, mem_opnd(64, REG_CFP, jit.host.cfp_layout().iseq_offset()), Opnd::Imm(0)).unwrap();

    let recv_opnd = ctx.opnd(REG_SP, argc);
    encoder::mov(&mut jit.cb, Opnd::Reg(REG0), recv_opnd).unwrap();
    encoder::mov(&mut jit.cb, mem_opnd(64, REG_CFP, jit.host.cfp_layout().self_offset()), Opnd::Reg(REG0)).unwrap();

    let sp_opnd = ctx.sp_opnd(REG_SP, 0);
    encoder::lea(&mut jit.cb, Opnd::Reg(REG0), sp_opnd).unwrap();
    encoder::mov(&mut jit.cb, mem_opnd(64, REG_CFP, jit.host.cfp_layout().sp_offset()), Opnd::Reg(REG0)).unwrap();
    encoder::sub(&mut jit.cb, Opnd::Reg(REG0), Opnd::Imm(crate::core::context::SLOT_SIZE as i64)).unwrap();
    encoder::mov(&mut jit.cb, mem_opnd(64, REG_CFP, jit.host.cfp_layout().ep_offset()), Opnd::Reg(REG0)).unwrap();
}

fn pop_cfunc_frame<H: HostInterp>(jit: &mut Jit<H>) {
    let cfp_size = jit.host.cfp_size();
    encoder::add(&mut jit.cb, Opnd::Reg(REG_CFP), Opnd::Imm(cfp_size as i64)).unwrap();
    let ec_cfp = mem_opnd(64, REG_EC, jit.host.ec_layout().cfp_offset());
    encoder::mov(&mut jit.cb, ec_cfp, Opnd::Reg(REG_CFP)).unwrap();
}

/// Marshal up to `NUM_C_ARG_REGS - 1` arguments (receiver first) from the
/// temp stack into the host ABI's argument registers, save the JIT's fixed
/// registers, keep the stack 16-byte aligned, and call the C function
/// directly.
fn marshal_args_and_call<H: HostInterp>(jit: &mut Jit<H>, ctx: &Context, cache: &crate::iface::MethodCacheEntry, argc: u16) {
    let arg_regs = [RDI, RSI, crate::asm::operand::RDX, crate::asm::operand::RCX, crate::asm::operand::R8, crate::asm::operand::R9];
    let usable = (jit.host.num_c_arg_regs().saturating_sub(1)).min(arg_regs.len());

    encoder::push(&mut jit.cb, Opnd::Reg(REG_CFP)).unwrap();
    encoder::push(&mut jit.cb, Opnd::Reg(REG_EC)).unwrap();
    encoder::push(&mut jit.cb, Opnd::Reg(REG_SP)).unwrap();

    let total_args = (argc as usize + 1).min(usable);
    for i in 0..total_args {
        let slot = ctx.opnd(REG_SP, argc - i as u16);
        encoder::mov(&mut jit.cb, Opnd::Reg(arg_regs[i]), slot).unwrap();
    }

    let target = cache.cfunc_ptr.expect("Cfunc cache entry without a function pointer");
    encoder::call_ptr(&mut jit.cb, REG0, target).unwrap();

    encoder::pop(&mut jit.cb, Opnd::Reg(REG_SP)).unwrap();
    encoder::pop(&mut jit.cb, Opnd::Reg(REG_EC)).unwrap();
    encoder::pop(&mut jit.cb, Opnd::Reg(REG_CFP)).unwrap();
}
