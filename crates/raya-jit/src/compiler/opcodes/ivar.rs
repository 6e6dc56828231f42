//! `getinstancevariable` / `setinstancevariable`: specialized on the
//! inline-cache-recorded class and slot index, guarded at run time by a
//! class-serial check against `self`.

use super::super::{HandlerResult, REG0, REG1, REG_CFP, REG_SP};
use crate::asm::encoder::{self, Cond};
use crate::asm::operand::{mem_opnd, Opnd};
use crate::core::block::{Block, DependencyToken};
use crate::core::context::{Context, TypeTag};
use crate::iface::HostInterp;
use crate::Jit;

/// Guard `self` is a heap object of the cached class: load `self`, check
/// the class-serial word matches, and side-exit on mismatch.
fn guard_self_class<H: HostInterp>(jit: &mut Jit<H>, ctx: &Context, class_serial: u64, bytecode_idx: u32) {
    let self_opnd = mem_opnd(64, REG_CFP, jit.host.cfp_layout().self_offset());
    encoder::mov(&mut jit.cb, Opnd::Reg(REG0), self_opnd).unwrap();
    let serial_opnd = mem_opnd(64, REG0, jit.host.object_class_serial_offset());
    encoder::cmp(&mut jit.cb, serial_opnd, Opnd::UImm(class_serial)).unwrap();

    let exit_ptr = jit.gen_side_exit(ctx, bytecode_idx);
    let ok_label = jit.cb.new_label();
    encoder::jcc(&mut jit.cb, Cond::E, ok_label).unwrap();
    match encoder::jmp_ptr(&mut jit.cb, exit_ptr) {
        Ok(()) => {}
        Err(_) => {
            encoder::mov(&mut jit.cb, Opnd::Reg(REG1), Opnd::UImm(exit_ptr as u64)).unwrap();
            encoder::jmp_reg(&mut jit.cb, REG1).unwrap();
        }
    }
    jit.cb.write_label(ok_label);
}

pub fn getinstancevariable<H: HostInterp>(jit: &mut Jit<H>, block: &mut Block, ctx: &mut Context, bytecode_idx: u32) -> HandlerResult {
    let cache = match jit.host.ivar_cache_at(block.id.iseq, bytecode_idx) {
        Some(c) => c,
        None => return HandlerResult::CantCompile,
    };

    guard_self_class(jit, ctx, cache.class_serial, bytecode_idx);
    block.deps.cme.get_or_insert(DependencyToken(cache.class_ref));

    let self_opnd = mem_opnd(64, REG_CFP, jit.host.cfp_layout().self_offset());
    encoder::mov(&mut jit.cb, Opnd::Reg(REG0), self_opnd).unwrap();
    let slot_offset = jit.host.object_ivar_base_offset() + cache.slot_index * jit.host.slot_size();
    let slot_opnd = mem_opnd(64, REG0, slot_offset);
    encoder::mov(&mut jit.cb, Opnd::Reg(REG0), slot_opnd).unwrap();

    let dst = ctx.push(REG_SP, TypeTag::Unknown);
    encoder::mov(&mut jit.cb, dst, Opnd::Reg(REG0)).unwrap();
    HandlerResult::KeepCompiling
}

pub fn setinstancevariable<H: HostInterp>(jit: &mut Jit<H>, block: &mut Block, ctx: &mut Context, bytecode_idx: u32) -> HandlerResult {
    let cache = match jit.host.ivar_cache_at(block.id.iseq, bytecode_idx) {
        Some(c) => c,
        None => return HandlerResult::CantCompile,
    };
    if cache.needs_write_barrier {
        let exit_ptr = jit.gen_side_exit(ctx, bytecode_idx);
        match encoder::jmp_ptr(&mut jit.cb, exit_ptr) {
            Ok(()) => {}
            Err(_) => {
                encoder::mov(&mut jit.cb, Opnd::Reg(REG0), Opnd::UImm(exit_ptr as u64)).unwrap();
                encoder::jmp_reg(&mut jit.cb, REG0).unwrap();
            }
        }
        return HandlerResult::EndBlock;
    }

    guard_self_class(jit, ctx, cache.class_serial, bytecode_idx);
    block.deps.cme.get_or_insert(DependencyToken(cache.class_ref));

    let src = ctx.pop(REG_SP, 1);
    encoder::mov(&mut jit.cb, Opnd::Reg(REG0), src).unwrap();

    let self_opnd = mem_opnd(64, REG_CFP, jit.host.cfp_layout().self_offset());
    encoder::mov(&mut jit.cb, Opnd::Reg(REG1), self_opnd).unwrap();
    let slot_offset = jit.host.object_ivar_base_offset() + cache.slot_index * jit.host.slot_size();
    let slot_opnd = mem_opnd(64, REG1, slot_offset);
    encoder::mov(&mut jit.cb, slot_opnd, Opnd::Reg(REG0)).unwrap();
    HandlerResult::KeepCompiling
}
