//! Dependency table and the invalidation engine.
//!
//! Tracks which compiled blocks trusted which host-opaque method-cache
//! tokens, so that `invalidate_for_dependency` can find and rewrite exactly
//! the blocks that assumed something that is no longer true. The generic
//! `DependencyToken` model comes straight from the versioning engine;
//! concretely, this crate's opcode subset produces tokens from exactly two
//! sources: a basic-operator-redefinition token consulted by
//! `opt_plus`/`opt_minus`/`opt_lt`, and a method-lookup token consulted by
//! `opt_send_without_block` (see `compiler::opcodes::opt_send_without_block`).

use rustc_hash::FxHashMap;

use super::block::{BlockIdx, DependencyToken};
use super::cache::BlockCache;

/// `DependencyToken -> blocks that trusted it`.
#[derive(Default)]
pub struct DependencyTable {
    entries: FxHashMap<DependencyToken, Vec<BlockIdx>>,
}

impl DependencyTable {
    pub fn new() -> Self {
        DependencyTable::default()
    }

    /// Record that `block` trusted `token`. Called by the Compiler at the
    /// exact point it emits code relying on the token.
    pub fn record(&mut self, token: DependencyToken, block: BlockIdx) {
        let blocks = self.entries.entry(token).or_default();
        if !blocks.contains(&block) {
            blocks.push(block);
        }
    }

    /// Remove and return every block that trusted `token`, so the caller
    /// can rewrite their incoming branches and free them. Returns an empty
    /// vec if nothing depended on `token` (a no-op invalidation).
    pub fn take(&mut self, token: DependencyToken) -> Vec<BlockIdx> {
        self.entries.remove(&token).unwrap_or_default()
    }

    /// Drop `block` from every token's dependency list; called when a block
    /// is freed for reasons other than `invalidate_for_dependency` (e.g.
    /// `on_iseq_free`), so the table never holds a dangling `BlockIdx`.
    pub fn forget(&mut self, block: BlockIdx) {
        self.entries.retain(|_, blocks| {
            blocks.retain(|&b| b != block);
            !blocks.is_empty()
        });
    }

    /// Reassign `old` to `new` wherever it appears as a key, for
    /// `update_references_for_gc` after the host moves a token's backing
    /// object during compaction.
    pub fn rekey(&mut self, old: DependencyToken, new: DependencyToken) {
        if let Some(blocks) = self.entries.remove(&old) {
            self.entries.entry(new).or_default().extend(blocks);
        }
    }

    /// Does any block currently depend on `token`? Exposed for the
    /// invariant checks in `blocks_with_token_are_consistent` and for
    /// integration tests against a live `Jit`.
    pub fn contains(&self, token: DependencyToken) -> bool {
        self.entries.contains_key(&token)
    }
}

/// Helper asserting the crate-level invariant "for each `(token, blocks)`
/// entry, each block in `blocks` has `token` in its `deps`" — exercised from
/// integration tests against a live `Jit`, not used in production code paths.
pub fn blocks_with_token_are_consistent(cache: &BlockCache, table: &DependencyTable, token: DependencyToken) -> bool {
    table
        .entries
        .get(&token)
        .map(|blocks| {
            blocks.iter().all(|&idx| {
                let b = cache.get(idx);
                b.deps.cme == Some(token) || b.deps.cc == Some(token) || b.deps.bop == Some(token)
            })
        })
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_take() {
        let mut table = DependencyTable::new();
        let token = DependencyToken(42);
        table.record(token, BlockIdx(0));
        table.record(token, BlockIdx(1));
        let blocks = table.take(token);
        assert_eq!(blocks, vec![BlockIdx(0), BlockIdx(1)]);
        assert!(table.take(token).is_empty());
    }

    #[test]
    fn test_forget_removes_block_from_all_tokens() {
        let mut table = DependencyTable::new();
        let t0 = DependencyToken(1);
        let t1 = DependencyToken(2);
        table.record(t0, BlockIdx(5));
        table.record(t1, BlockIdx(5));
        table.forget(BlockIdx(5));
        assert!(!table.contains(t0));
        assert!(!table.contains(t1));
    }

    #[test]
    fn test_rekey_moves_dependents_to_new_token() {
        let mut table = DependencyTable::new();
        let old = DependencyToken(1);
        let new = DependencyToken(2);
        table.record(old, BlockIdx(0));
        table.rekey(old, new);
        assert!(!table.contains(old));
        assert_eq!(table.take(new), vec![BlockIdx(0)]);
    }
}
