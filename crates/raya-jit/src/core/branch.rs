//! Patchable control-transfer sites and the stub/back-patch protocol.

use super::block::{BlockId, CodeOffset};
use super::context::Context;
use crate::asm::cb::CodeBlock;
use crate::error::JitError;

/// Index into the `Branch` arena. Never reused (see `core::block::BlockIdx`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BranchId(pub u32);

/// Signals that target 0 and/or target 1 lies immediately after the
/// branch's `end`, letting `gen_fn` omit the corresponding jump entirely.
/// `Default` is always the largest encoding any `gen_fn` can produce for its
/// branch; `NextX` variants must never be larger (see
/// [`Branch::shape_invariant_holds`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Default,
    Next0,
    Next1,
}

/// Idempotent re-emission function for a branch: given the two (possibly
/// absent) resolved target addresses and the current shape, emit exactly
/// the bytes for this branch. Called at initial emission and at every
/// subsequent patch (invalidation, stub resolution, shape rewrite).
pub type GenFn = fn(&mut CodeBlock, Option<*const u8>, Option<*const u8>, Shape) -> Result<(), JitError>;

/// A patchable control-transfer site in generated code.
pub struct Branch {
    pub id: BranchId,
    pub start: CodeOffset,
    pub end: CodeOffset,
    pub src_ctx: Context,
    pub targets: [Option<BlockId>; 2],
    pub target_ctxs: [Context; 2],
    pub dst_addrs: [Option<*const u8>; 2],
    pub gen_fn: GenFn,
    pub shape: Shape,
}

impl Branch {
    /// Re-run `gen_fn` at `branch.start` in `cb`, and assert the emitted
    /// range never exceeds the originally reserved `[start, end)` — the
    /// crate-level "branch size never grows" invariant.
    pub fn patch(&mut self, cb: &mut CodeBlock) -> Result<(), JitError> {
        let reserved = self.end - self.start;
        cb.set_pos(self.start);
        (self.gen_fn)(cb, self.dst_addrs[0], self.dst_addrs[1], self.shape)?;
        let emitted = cb.get_pos() - self.start;
        if emitted > reserved {
            return Err(JitError::BranchWouldGrow { would_be: emitted, limit: reserved });
        }
        // Pad the slack with single-byte nops so a later, larger shape can
        // always re-emit without reading stale opcode bytes before it does.
        if emitted < reserved {
            crate::asm::encoder::nop(cb, reserved - emitted)?;
        }
        Ok(())
    }
}
