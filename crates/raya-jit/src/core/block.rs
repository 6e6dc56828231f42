//! `BlockId` and `Block`: the versioned compilation unit.

use super::context::Context;
use crate::iface::IseqRef;

/// Opaque token identifying a method-cache entry (`cc`) or callable-method
/// entry (`cme`) this compiled code trusted. The host owns the real
/// identity; the core only ever compares, hashes, and forwards it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DependencyToken(pub u64);

/// Identifies a bytecode region's entry point: `(iseq, bytecode offset)`.
/// Lifetime is tied to the referring iseq — once the VM frees an iseq every
/// `BlockId` built from it becomes meaningless and must not be looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    pub iseq: IseqRef,
    pub bytecode_idx: u32,
}

/// Index into the `Block` arena. Never reused for the life of the process
/// (see the crate's design notes on cyclic/patchable graphs) so that a stale
/// `BranchId`/`BlockIdx` in a freed block's `incoming` list can never alias
/// a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockIdx(pub u32);

/// Byte offset into a `CodeBlock`.
pub type CodeOffset = usize;

/// Dependency tokens a block's generated code trusted: `cme`/`cc` from a
/// specialized `opt_send_without_block` call site, `bop` from a fixnum
/// arithmetic fast path's basic-operator-redefinition guard (see
/// SPEC_FULL.md AMBIENT-4).
#[derive(Debug, Clone, Default)]
pub struct BlockDeps {
    pub cme: Option<DependencyToken>,
    pub cc: Option<DependencyToken>,
    pub bop: Option<DependencyToken>,
}

/// One compiled version of one `BlockId`.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub ctx_in: Context,
    pub ctx_out: Context,
    pub start: CodeOffset,
    pub end: CodeOffset,
    /// Bytecode offset immediately after the last compiled instruction.
    pub end_idx: u32,
    /// Next version for the same `BlockId` (singly-linked chain, newest
    /// first — see `BlockCache::insert`).
    pub next: Option<BlockIdx>,
    /// Branches whose target is this block.
    pub incoming: Vec<super::branch::BranchId>,
    pub deps: BlockDeps,
}

impl Block {
    pub fn new(id: BlockId, ctx_in: Context, start: CodeOffset) -> Self {
        Block {
            id,
            ctx_in,
            ctx_out: ctx_in,
            start,
            end: start,
            end_idx: id.bytecode_idx,
            next: None,
            incoming: Vec::new(),
            deps: BlockDeps::default(),
        }
    }

    /// Is this block the iseq's entry point (`idx == 0`)? Entry blocks get
    /// their original interpreter handler slot restored on invalidation
    /// (see `core::invariants::invalidate_for_dependency`).
    pub fn is_entry(&self) -> bool {
        self.id.bytecode_idx == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_equality_combines_both_fields() {
        let iseq = IseqRef(1);
        let a = BlockId { iseq, bytecode_idx: 4 };
        let b = BlockId { iseq, bytecode_idx: 4 };
        let c = BlockId { iseq, bytecode_idx: 5 };
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_new_block_entry_detection() {
        let id = BlockId { iseq: IseqRef(1), bytecode_idx: 0 };
        let block = Block::new(id, Context::default(), 0);
        assert!(block.is_entry());
    }
}
