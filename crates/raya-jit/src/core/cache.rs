//! `BlockCache`: `(iseq, idx) -> chain of Block versions`, with best-match
//! lookup and a version-count cap.

use rustc_hash::FxHashMap;

use super::block::{Block, BlockId, BlockIdx};
use super::context::{Context, Distance};

/// Per-`BlockId` cap on how many distinct versions may coexist. Once hit,
/// the Compiler widens the requested `Context` to the generic one instead
/// of creating a fifth version (see `Context::generic`).
pub const MAX_VERSIONS: usize = 4;

/// Owns every compiled `Block`, indexed both by arena position (`BlockIdx`,
/// stable for the block's lifetime) and by `BlockId` chain head.
#[derive(Default)]
pub struct BlockCache {
    arena: Vec<Option<Block>>,
    heads: FxHashMap<BlockId, BlockIdx>,
}

impl BlockCache {
    pub fn new() -> Self {
        BlockCache::default()
    }

    /// Best-distance version for `(id, ctx)`, or `None` if absent or every
    /// chained version is `Distance::Incompatible`.
    pub fn find(&self, id: BlockId, ctx: &Context) -> Option<BlockIdx> {
        let mut cursor = self.heads.get(&id).copied();
        let mut best: Option<(BlockIdx, u32)> = None;
        while let Some(idx) = cursor {
            let block = self.arena[idx.0 as usize].as_ref().expect("dangling chain link");
            if let Some(rank) = ctx.diff(&block.ctx_in).rank() {
                if best.map_or(true, |(_, best_rank)| rank < best_rank) {
                    best = Some((idx, rank));
                }
            }
            cursor = block.next;
        }
        best.map(|(idx, _)| idx)
    }

    /// Number of versions currently chained under `id`.
    pub fn count(&self, id: BlockId) -> usize {
        let mut cursor = self.heads.get(&id).copied();
        let mut n = 0;
        while let Some(idx) = cursor {
            n += 1;
            cursor = self.arena[idx.0 as usize].as_ref().expect("dangling chain link").next;
        }
        n
    }

    /// Prepend `block` to its `BlockId`'s chain; returns the new block's
    /// stable index.
    pub fn insert(&mut self, mut block: Block) -> BlockIdx {
        let id = block.id;
        block.next = self.heads.get(&id).copied();
        let idx = BlockIdx(self.arena.len() as u32);
        self.arena.push(Some(block));
        self.heads.insert(id, idx);
        idx
    }

    pub fn get(&self, idx: BlockIdx) -> &Block {
        self.arena[idx.0 as usize].as_ref().expect("use of freed BlockIdx")
    }

    pub fn get_mut(&mut self, idx: BlockIdx) -> &mut Block {
        self.arena[idx.0 as usize].as_mut().expect("use of freed BlockIdx")
    }

    /// The least-recently-inserted version in `id`'s chain (the chain
    /// tail, since `insert` always prepends), or `None` if no version
    /// exists. Used by `compile_block` to make room when the version cap
    /// is hit (see `MAX_VERSIONS`).
    pub fn oldest(&self, id: BlockId) -> Option<BlockIdx> {
        let mut cursor = self.heads.get(&id).copied()?;
        loop {
            let block = self.arena[cursor.0 as usize].as_ref().expect("dangling chain link");
            match block.next {
                Some(next) => cursor = next,
                None => return Some(cursor),
            }
        }
    }

    /// Every live block belonging to `iseq`, for `on_iseq_free`/`mark_for_gc`.
    /// Scans the arena rather than maintaining a second index, since both
    /// callers are whole-iseq teardown/GC paths, not hot.
    pub fn blocks_for_iseq(&self, iseq: crate::iface::IseqRef) -> Vec<BlockIdx> {
        self.arena
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().filter(|b| b.id.iseq == iseq).map(|_| BlockIdx(i as u32)))
            .collect()
    }

    /// Unlink and remove `idx` from its `BlockId` chain. The slot is left
    /// `None` rather than reused, per the crate's never-reuse-indices policy.
    pub fn delete(&mut self, idx: BlockIdx) -> Block {
        let id = self.arena[idx.0 as usize].as_ref().expect("double free of BlockIdx").id;

        let mut cursor = self.heads.get(&id).copied();
        let mut prev: Option<BlockIdx> = None;
        while let Some(cur) = cursor {
            let next = self.arena[cur.0 as usize].as_ref().unwrap().next;
            if cur == idx {
                match prev {
                    Some(p) => self.arena[p.0 as usize].as_mut().unwrap().next = next,
                    None => match next {
                        Some(n) => {
                            self.heads.insert(id, n);
                        }
                        None => {
                            self.heads.remove(&id);
                        }
                    },
                }
                break;
            }
            prev = Some(cur);
            cursor = next;
        }

        self.arena[idx.0 as usize].take().expect("double free of BlockIdx")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::IseqRef;

    fn id() -> BlockId {
        BlockId { iseq: IseqRef(1), bytecode_idx: 0 }
    }

    #[test]
    fn test_insert_and_find_exact() {
        let mut cache = BlockCache::new();
        let ctx = Context::default();
        let idx = cache.insert(Block::new(id(), ctx, 0));
        assert_eq!(cache.find(id(), &ctx), Some(idx));
    }

    #[test]
    fn test_find_none_when_absent() {
        let cache = BlockCache::new();
        assert_eq!(cache.find(id(), &Context::default()), None);
    }

    #[test]
    fn test_count_and_version_cap() {
        let mut cache = BlockCache::new();
        for i in 0..MAX_VERSIONS {
            let mut ctx = Context::default();
            ctx.stack_size = i as u16; // distinct shapes so each becomes its own version
            cache.insert(Block::new(id(), ctx, i));
        }
        assert_eq!(cache.count(id()), MAX_VERSIONS);
    }

    #[test]
    fn test_delete_unlinks_from_chain() {
        let mut cache = BlockCache::new();
        let ctx = Context::default();
        let idx0 = cache.insert(Block::new(id(), ctx, 0));
        let idx1 = cache.insert(Block::new(id(), ctx, 8));
        assert_eq!(cache.count(id()), 2);
        cache.delete(idx0);
        assert_eq!(cache.count(id()), 1);
        assert_eq!(cache.find(id(), &ctx), Some(idx1));
    }

    #[test]
    fn test_find_picks_minimum_distance() {
        let mut cache = BlockCache::new();
        let mut specific = Context::default();
        specific.push(crate::asm::operand::RDX, crate::core::context::TypeTag::Fixnum);
        let generic = specific.generic();

        let generic_idx = cache.insert(Block::new(id(), generic, 0));
        let specific_idx = cache.insert(Block::new(id(), specific, 8));

        assert_eq!(cache.find(id(), &specific), Some(specific_idx));
        let _ = generic_idx;
    }
}
