//! Per-opcode codegen translating bytecode to encoder calls, side-exit
//! generation, and the branch/stub back-patching protocol.

pub mod bytecode;
pub mod opcodes;

use crate::asm::cb::CodeBlock;
use crate::asm::encoder;
use crate::asm::operand::{Opnd, Reg, RCX, RDI, RDX, RSI};
use crate::core::block::{Block, BlockId, BlockIdx};
use crate::core::branch::{Branch, BranchId, GenFn, Shape};
use crate::core::cache::MAX_VERSIONS;
use crate::core::context::Context;
use crate::error::JitError;
use crate::iface::{HostInterp, IseqRef};
use crate::{Jit, Options};

use bytecode::{Insn, Opcode};

/// Fixed register assignments, carried from `original_source/ujit_core.h`:
/// the control-frame pointer, execution context, and VM stack pointer live
/// in callee-saved registers for the lifetime of a JITted call.
pub const REG_CFP: Reg = RDI;
pub const REG_EC: Reg = RSI;
pub const REG_SP: Reg = RDX;
pub const REG0: Reg = crate::asm::operand::RAX;
pub const REG1: Reg = RCX;

/// Outcome of a per-opcode handler, dispatched by `compile_block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
    /// Continue with the next instruction.
    KeepCompiling,
    /// The handler already ended control flow (emitted a branch or return).
    EndBlock,
    /// Give up on this instruction; `compile_block` finalizes with a
    /// side-exit. Nothing emitted by the handler before returning this is
    /// assumed to have committed any state beyond the CodeBlock cursor,
    /// which `compile_block` rewinds.
    CantCompile,
}

impl<H: HostInterp> Jit<H> {
    /// Called by the VM the first time an iseq is about to run.
    pub fn compile_iseq(&mut self, iseq: IseqRef) {
        self.emit_prologue_once();
        let entry_id = BlockId { iseq, bytecode_idx: 0 };
        let idx = self.compile_block(entry_id, Context::default());
        let entry_ptr = self.cb.get_ptr(self.cache.get(idx).start);
        self.host.patch_entry_opcode(iseq, Some(entry_ptr));
    }

    /// Emit the shared prologue/epilogue bytes once, lazily. Every entry
    /// block jumps here first to load the host's CFP/EC/SP into the JIT's
    /// fixed registers; every side-exit jumps to the epilogue to restore
    /// them and return control to the interpreter.
    fn emit_prologue_once(&mut self) {
        if self.prologue.is_some() {
            return;
        }
        let start = self.cb.get_pos();
        // In this crate's host-call convention, CFP/EC/SP already arrive in
        // REG_CFP/REG_EC/REG_SP per the System V argument registers, so the
        // prologue's only job is to save the host's callee-saved registers
        // it is about to reuse.
        encoder::push(&mut self.cb, Opnd::Reg(REG_CFP)).unwrap();
        encoder::push(&mut self.cb, Opnd::Reg(REG_EC)).unwrap();
        encoder::push(&mut self.cb, Opnd::Reg(REG_SP)).unwrap();
        self.prologue = Some(start);

        let epilogue_start = self.cb.get_pos();
        encoder::pop(&mut self.cb, Opnd::Reg(REG_SP)).unwrap();
        encoder::pop(&mut self.cb, Opnd::Reg(REG_EC)).unwrap();
        encoder::pop(&mut self.cb, Opnd::Reg(REG_CFP)).unwrap();
        encoder::ret(&mut self.cb).unwrap();
        self.epilogue = Some(epilogue_start);
    }

    /// The inner driver: compile a fresh `Block` for `(id, ctx)`, or widen
    /// to the generic context first if the per-`BlockId` version cap
    /// (`MAX_VERSIONS`) has been reached.
    pub fn compile_block(&mut self, id: BlockId, ctx: Context) -> BlockIdx {
        let ctx = if self.cache.count(id) >= MAX_VERSIONS {
            self.stats.version_cap_hits += 1;
            // Make room before inserting the generic version, so the cap is
            // a hard ceiling rather than a one-time overshoot. The evicted
            // version's code is left in place (this crate's CodeBlock is
            // append-only) but untracked: any branch still pointing directly
            // at it keeps working, it just can no longer be invalidated.
            if let Some(oldest) = self.cache.oldest(id) {
                self.cache.delete(oldest);
                self.deps.forget(oldest);
            }
            ctx.generic()
        } else {
            ctx
        };

        self.cb.align_pos(64).expect("aligning a block start must not run out of code space");
        let start = self.cb.get_pos();
        let mut block = Block::new(id, ctx, start);
        let mut cur_ctx = ctx;
        let mut bytecode_idx = id.bytecode_idx;

        let outer_iseq = self.compiling_iseq.replace(id.iseq);

        loop {
            let insn = match self.host.decode_insn(id.iseq, bytecode_idx) {
                Some(insn) => insn,
                None => break,
            };

            let outcome = opcodes::dispatch(self, &mut block, &mut cur_ctx, &insn, bytecode_idx);

            match outcome {
                HandlerResult::KeepCompiling => {
                    bytecode_idx += insn.len;
                }
                HandlerResult::EndBlock => {
                    block.end_idx = bytecode_idx + insn.len;
                    break;
                }
                HandlerResult::CantCompile => {
                    // Per the handler contract, nothing already emitted is
                    // rewound — the block simply finalizes with a side-exit
                    // at the instruction that could not specialize.
                    let exit_ptr = self.gen_side_exit(&cur_ctx, bytecode_idx);
                    encoder::jmp_ptr(&mut self.cb, exit_ptr)
                        .or_else(|_| {
                            encoder::mov(&mut self.cb, Opnd::Reg(REG0), Opnd::UImm(exit_ptr as u64))?;
                            encoder::jmp_reg(&mut self.cb, REG0)
                        })
                        .expect("side-exit jump codegen failed");
                    block.end_idx = bytecode_idx;
                    break;
                }
            }
        }

        block.ctx_out = cur_ctx;
        block.end = self.cb.get_pos();
        self.cb.link_labels();
        self.stats.blocks_compiled += 1;
        let deps = block.deps.clone();
        let idx = self.cache.insert(block);
        if let Some(token) = deps.cme {
            self.deps.record(token, idx);
        }
        if let Some(token) = deps.cc {
            self.deps.record(token, idx);
        }
        if let Some(token) = deps.bop {
            self.deps.record(token, idx);
        }

        self.run_successor_loop();
        self.compiling_iseq = outer_iseq;
        idx
    }

    /// While the most recently registered `Next0`-shaped branch still has
    /// an unresolved target, keep compiling straight through so the hot
    /// path lays out contiguously (see §4.5's successor loop).
    fn run_successor_loop(&mut self) {
        while let Some(branch_id) = self.pending_next0.pop() {
            let (target_id, target_ctx) = {
                let branch = &self.branches[branch_id.0 as usize];
                (branch.targets[0].expect("Next0 branch must have target 0"), branch.target_ctxs[0])
            };
            let target_idx = self.compile_block(target_id, target_ctx);
            let ptr = self.cb.get_ptr(self.cache.get(target_idx).start);
            let branch = &mut self.branches[branch_id.0 as usize];
            branch.dst_addrs[0] = Some(ptr);
            self.cache.get_mut(target_idx).incoming.push(branch_id);
        }
    }

    /// Emit a side exit into the out-of-line CodeBlock: flush `SP` back if
    /// skewed, write the bailout PC into the CFP, and return to the
    /// interpreter via the shared epilogue. Returns a pointer usable as a
    /// branch target.
    pub fn gen_side_exit(&mut self, ctx: &Context, exit_pc: u32) -> *const u8 {
        let start = self.ocb.get_pos();
        if ctx.sp_offset != 0 {
            encoder::lea(&mut self.ocb, Opnd::Reg(REG_SP), crate::asm::operand::mem_opnd(64, REG_SP, ctx.sp_offset as i32 * crate::core::context::SLOT_SIZE)).unwrap();
            let cfp_sp = crate::asm::operand::mem_opnd(64, REG_CFP, self.host.cfp_layout().sp_offset());
            encoder::mov(&mut self.ocb, cfp_sp, Opnd::Reg(REG_SP)).unwrap();
        }
        let cfp_pc = crate::asm::operand::mem_opnd(64, REG_CFP, self.host.cfp_layout().pc_offset());
        encoder::mov(&mut self.ocb, cfp_pc, Opnd::UImm(exit_pc as u64)).unwrap();
        let epilogue = self.epilogue.expect("prologue/epilogue must be emitted before any side-exit");
        let epilogue_ptr = self.cb.get_ptr(epilogue);
        match encoder::jmp_ptr(&mut self.ocb, epilogue_ptr) {
            Ok(()) => {}
            Err(JitError::EncodingConstraintViolated(_)) => {
                encoder::mov(&mut self.ocb, Opnd::Reg(REG0), Opnd::UImm(epilogue_ptr as u64)).unwrap();
                encoder::jmp_reg(&mut self.ocb, REG0).unwrap();
            }
            Err(e) => panic!("side-exit codegen failed: {e}"),
        }
        self.stats.side_exits += 1;
        self.ocb.get_ptr(start)
    }

    /// Resolve `(id, ctx)` to an address usable as a branch target: a
    /// pointer into already-compiled code, or a freshly emitted stub.
    fn get_branch_target(&mut self, id: BlockId, ctx: Context, branch_id: BranchId, target_idx: u8) -> *const u8 {
        if let Some(block_idx) = self.cache.find(id, &ctx) {
            self.cache.get_mut(block_idx).incoming.push(branch_id);
            return self.cb.get_ptr(self.cache.get(block_idx).start);
        }
        self.emit_stub(branch_id, target_idx)
    }

    /// Emit an out-of-line stub that saves the fixed registers, loads
    /// `(branch_id, target_idx)` into the host ABI's first two argument
    /// registers, calls `branch_stub_hit_trampoline`, restores, and jumps
    /// to the returned address.
    pub(crate) fn emit_stub(&mut self, branch_id: BranchId, target_idx: u8) -> *const u8 {
        let start = self.ocb.get_pos();
        encoder::push(&mut self.ocb, Opnd::Reg(REG_CFP)).unwrap();
        encoder::push(&mut self.ocb, Opnd::Reg(REG_EC)).unwrap();
        encoder::push(&mut self.ocb, Opnd::Reg(REG_SP)).unwrap();
        encoder::mov(&mut self.ocb, Opnd::Reg(RDI), Opnd::UImm(branch_id.0 as u64)).unwrap();
        encoder::mov(&mut self.ocb, Opnd::Reg(RSI), Opnd::UImm(target_idx as u64)).unwrap();
        // The actual call target is resolved by the embedding host's
        // trampoline shim, which re-enters `Jit::branch_stub_hit` under the
        // VM lock; this crate only emits the calling convention.
        encoder::mov(&mut self.ocb, Opnd::Reg(REG0), Opnd::UImm(self.stub_hit_trampoline as u64)).unwrap();
        encoder::call_reg(&mut self.ocb, REG0).unwrap();
        encoder::pop(&mut self.ocb, Opnd::Reg(REG_SP)).unwrap();
        encoder::pop(&mut self.ocb, Opnd::Reg(REG_EC)).unwrap();
        encoder::pop(&mut self.ocb, Opnd::Reg(REG_CFP)).unwrap();
        encoder::jmp_reg(&mut self.ocb, REG0).unwrap();
        self.ocb.get_ptr(start)
    }

    /// Register a branch with up to two targets, resolving each target to
    /// either existing code or a stub, then calling `gen_fn` to emit the
    /// control transfer itself.
    pub fn gen_branch(
        &mut self,
        src_ctx: Context,
        id0: BlockId,
        ctx0: Context,
        id1_ctx1: Option<(BlockId, Context)>,
        gen_fn: GenFn,
    ) -> BranchId {
        let branch_id = BranchId(self.branches.len() as u32);
        let dst0 = self.get_branch_target(id0, ctx0, branch_id, 0);
        let dst1 = id1_ctx1.map(|(id1, ctx1)| self.get_branch_target(id1, ctx1, branch_id, 1));

        let start = self.cb.get_pos();
        gen_fn(&mut self.cb, Some(dst0), dst1, Shape::Default).expect("initial branch emission must fit its own reservation");
        let end = self.cb.get_pos();

        let mut targets = [Some(id0), None];
        let mut target_ctxs = [ctx0, ctx0];
        let mut dst_addrs = [Some(dst0), None];
        if let Some((id1, ctx1)) = id1_ctx1 {
            targets[1] = Some(id1);
            target_ctxs[1] = ctx1;
            dst_addrs[1] = dst1;
        }

        self.branches.push(Branch { id: branch_id, start, end, src_ctx, targets, target_ctxs, dst_addrs, gen_fn, shape: Shape::Default });
        branch_id
    }

    /// Constrained `gen_branch` allowing the `Next0` shape: if the target
    /// is already cached, emit a plain `jmp`; otherwise record the branch
    /// with `shape = Next0` and let the successor loop compile the target
    /// immediately after, so its entry lands right after this branch.
    pub fn direct_jump(&mut self, ctx: Context, id0: BlockId) -> BranchId {
        if self.cache.find(id0, &ctx).is_some() {
            return self.gen_branch(ctx, id0, ctx, None, opcodes::control::jmp_gen_fn);
        }
        let branch_id = BranchId(self.branches.len() as u32);
        let start = self.cb.get_pos();
        // The common case falls through with zero bytes (`Shape::Next0`),
        // but invalidation may later need to downgrade this branch to a
        // real `jmp` if its target is evicted before anything else
        // repoints it. Reserve room for that worst case (`jmp_ptr`'s fixed
        // 5 bytes: opcode + rel32) up front and pad it with nops, the same
        // way `Branch::patch` pads slack on every later re-emission.
        const JMP_PTR_LEN: usize = 5;
        encoder::nop(&mut self.cb, JMP_PTR_LEN).expect("direct_jump reservation must fit the code block");
        let end = self.cb.get_pos();
        self.branches.push(Branch {
            id: branch_id,
            start,
            end,
            src_ctx: ctx,
            targets: [Some(id0), None],
            target_ctxs: [ctx, ctx],
            dst_addrs: [None, None],
            gen_fn: opcodes::control::jmp_gen_fn,
            shape: Shape::Next0,
        });
        self.pending_next0.push(branch_id);
        branch_id
    }

    /// Entry point for the stub shim: resolve the real target for
    /// `(branch_id, target_idx)`, find-or-compile it, and rewrite the
    /// branch in place to point at it directly.
    pub fn branch_stub_hit(&mut self, branch_id: BranchId, target_idx: u8) -> *const u8 {
        self.stats.stub_hits += 1;
        let (id, ctx) = {
            let branch = &self.branches[branch_id.0 as usize];
            let i = target_idx as usize;
            (branch.targets[i].expect("stub hit for an absent target"), branch.target_ctxs[i])
        };

        let ctx = if self.cache.count(id) >= MAX_VERSIONS { ctx.generic() } else { ctx };
        let block_idx = match self.cache.find(id, &ctx) {
            Some(idx) => idx,
            None => self.compile_block(id, ctx),
        };

        self.cache.get_mut(block_idx).incoming.push(branch_id);
        let ptr = self.cb.get_ptr(self.cache.get(block_idx).start);

        let adjacent = {
            let branch = &self.branches[branch_id.0 as usize];
            ptr == self.cb.get_ptr(branch.end)
        };

        {
            let branch = &mut self.branches[branch_id.0 as usize];
            branch.dst_addrs[target_idx as usize] = Some(ptr);
            if adjacent {
                branch.shape = if target_idx == 0 { Shape::Next0 } else { Shape::Next1 };
            }
        }
        self.patch_branch(branch_id).expect("branch stub patch must fit its reserved range");

        ptr
    }

    pub(crate) fn patch_branch(&mut self, branch_id: BranchId) -> Result<(), JitError> {
        let saved_pos = self.cb.get_pos();
        let result = self.branches[branch_id.0 as usize].patch(&mut self.cb);
        self.cb.set_pos(saved_pos);
        result
    }
}
