//! Basic-block-versioning tracing JIT for a stack-based bytecode VM.
//!
//! `Jit<H>` is the crate's single entry point: every mutating operation
//! takes `&mut self`, so the borrow checker enforces the "only one compiler
//! active at a time" rule that a real embedding would otherwise need a VM
//! lock for (see `core` module docs and SPEC_FULL.md §5).

pub mod asm;
pub mod compiler;
pub mod core;
pub mod error;
pub mod iface;

use crate::asm::cb::CodeBlock;
use crate::core::block::{BlockDeps, BlockId, BlockIdx, DependencyToken};
use crate::core::branch::{BranchId, Shape};
use crate::core::cache::BlockCache;
use crate::core::context::Context;
use crate::core::invariants::DependencyTable;
use crate::iface::{HostInterp, IseqRef};

/// Host-tunable knobs, matching `ACTIONS-RUNTIME-ruby/yjit/src/options.rs`'s
/// `Options` and the teacher's `JitConfig` (`raya-engine/src/jit/engine.rs`).
#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub exec_mem_size: usize,
    pub ocb_mem_size: usize,
    pub max_versions: usize,
    pub gen_stats: bool,
    pub enabled: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            exec_mem_size: 64 * 1024 * 1024,
            ocb_mem_size: 64 * 1024 * 1024,
            max_versions: crate::core::cache::MAX_VERSIONS,
            gen_stats: false,
            enabled: true,
        }
    }
}

impl Options {
    /// Parse the one CLI flag this crate's surface exposes (`--jit-stats`),
    /// for a host CLI to call; the core never reads `std::env::args` itself.
    pub fn parse_flag(flag: &str) -> Option<bool> {
        match flag {
            "--jit-stats" => Some(true),
            "--no-jit-stats" => Some(false),
            _ => None,
        }
    }
}

/// Queryable counters in place of a logging dependency (see
/// SPEC_FULL.md AMBIENT-1): the teacher carries no `log`/`tracing` crate
/// either, preferring `raya-engine/src/jit/profiling/counters.rs`-style
/// plain counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct JitStats {
    pub blocks_compiled: u64,
    pub side_exits: u64,
    pub version_cap_hits: u64,
    pub invalidations: u64,
    pub stub_hits: u64,
}

/// The compiler, its code regions, and every table it maintains.
pub struct Jit<H: HostInterp> {
    pub(crate) cb: CodeBlock,
    pub(crate) ocb: CodeBlock,
    pub(crate) cache: BlockCache,
    pub(crate) deps: DependencyTable,
    pub(crate) branches: Vec<crate::core::branch::Branch>,
    pub(crate) host: H,
    pub(crate) options: Options,
    pub(crate) stats: JitStats,
    pub(crate) prologue: Option<usize>,
    pub(crate) epilogue: Option<usize>,
    pub(crate) pending_next0: Vec<BranchId>,
    /// Address of the host-supplied assembly glue that saves/restores the
    /// caller's registers around a call into `Jit::branch_stub_hit`. This
    /// crate only emits the calling convention (`emit_stub`); the trampoline
    /// itself is the host's, since only the host knows its full native ABI
    /// (unwind tables, TLS, etc.) well enough to write it.
    pub(crate) stub_hit_trampoline: *const u8,
    /// Iseq whose bytecode `compile_block`'s current call frame is
    /// translating; consulted by the `branchunless`/`jump` handlers, which
    /// need an `IseqRef` to build a target `BlockId` but don't otherwise
    /// carry one. Restored to the enclosing value on return so recursive
    /// `compile_block` calls (the successor loop, stub hits) nest correctly.
    pub(crate) compiling_iseq: Option<IseqRef>,
}

impl<H: HostInterp> Jit<H> {
    /// `init(options)`: allocate the main and out-of-line `CodeBlock`s and
    /// construct empty tables. `stub_hit_trampoline` is the host's glue-code
    /// entry point (see the field doc above).
    pub fn init(host: H, options: Options, stub_hit_trampoline: *const u8) -> Result<Self, crate::error::JitError> {
        Ok(Jit {
            cb: CodeBlock::new(options.exec_mem_size)?,
            ocb: CodeBlock::new(options.ocb_mem_size)?,
            cache: BlockCache::new(),
            deps: DependencyTable::new(),
            branches: Vec::new(),
            host,
            options,
            stats: JitStats::default(),
            prologue: None,
            epilogue: None,
            pending_next0: Vec::new(),
            stub_hit_trampoline,
            compiling_iseq: None,
        })
    }

    pub fn stats(&self) -> JitStats {
        self.stats
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// `invalidate_for_dependency(token)` (spec §4.7): every block that
    /// trusted `token` gets its incoming branches rewritten to fresh stubs
    /// and is then removed from the cache.
    pub fn invalidate_for_dependency(&mut self, token: DependencyToken) {
        let blocks = self.deps.take(token);
        for block_idx in blocks {
            self.invalidate_block(block_idx);
        }
    }

    fn invalidate_block(&mut self, block_idx: BlockIdx) {
        let (incoming, is_entry, iseq, start) = {
            let block = self.cache.get(block_idx);
            (block.incoming.clone(), block.is_entry(), block.id.iseq, block.start)
        };
        let target_ptr = self.cb.get_ptr(start);

        for branch_id in incoming {
            let target_idx = {
                let branch = &self.branches[branch_id.0 as usize];
                branch
                    .dst_addrs
                    .iter()
                    .position(|addr| *addr == Some(target_ptr))
                    .expect("incoming branch must point at the block being invalidated")
            };
            let stub_ptr = self.emit_stub(branch_id, target_idx as u8);
            let branch = &mut self.branches[branch_id.0 as usize];
            branch.dst_addrs[target_idx] = Some(stub_ptr);
            if (target_idx == 0 && branch.shape == Shape::Next0) || (target_idx == 1 && branch.shape == Shape::Next1) {
                branch.shape = Shape::Default;
            }
            self.patch_branch(branch_id).expect("invalidation patch must fit its reserved range (shape downgraded to Default above)");
        }

        if is_entry {
            self.host.patch_entry_opcode(iseq, None);
        }

        self.cache.delete(block_idx);
        self.deps.forget(block_idx);
        self.stats.invalidations += 1;
    }

    /// `on_iseq_free(iseq)`: free every block belonging to `iseq`. No
    /// incoming-branch rewrites — the iseq itself is going away, so nothing
    /// will ever reach those branches again.
    pub fn on_iseq_free(&mut self, iseq: IseqRef) {
        for block_idx in self.cache.blocks_for_iseq(iseq) {
            self.cache.delete(block_idx);
            self.deps.forget(block_idx);
        }
    }

    /// `mark_for_gc(iseq, mark_callback)`: report every dependency token a
    /// live block on `iseq` holds to the host's GC mark callback, which may
    /// relocate the token's backing object. The host then calls
    /// `update_references_for_gc` once compaction is done.
    pub fn mark_for_gc(&mut self, iseq: IseqRef, mut mark_callback: impl FnMut(DependencyToken)) {
        for block_idx in self.cache.blocks_for_iseq(iseq) {
            let block = self.cache.get(block_idx);
            if let Some(token) = block.deps.cme {
                mark_callback(token);
            }
            if let Some(token) = block.deps.cc {
                mark_callback(token);
            }
            if let Some(token) = block.deps.bop {
                mark_callback(token);
            }
        }
    }

    /// `update_references_for_gc(iseq)`: the host has finished compacting
    /// and supplies the `(old, new)` token remappings it made; rewrite the
    /// dependency table and every affected block's `deps` to match.
    pub fn update_references_for_gc(&mut self, iseq: IseqRef, remap: impl Fn(DependencyToken) -> DependencyToken) {
        for block_idx in self.cache.blocks_for_iseq(iseq) {
            let block = self.cache.get_mut(block_idx);
            if let Some(old) = block.deps.cme {
                let new = remap(old);
                if new != old {
                    self.deps.rekey(old, new);
                    block.deps.cme = Some(new);
                }
            }
            if let Some(old) = block.deps.cc {
                let new = remap(old);
                if new != old {
                    self.deps.rekey(old, new);
                    block.deps.cc = Some(new);
                }
            }
            if let Some(old) = block.deps.bop {
                let new = remap(old);
                if new != old {
                    self.deps.rekey(old, new);
                    block.deps.bop = Some(new);
                }
            }
        }
    }

    /// `notify_bop_redefined`: the core has no standing version counter of
    /// its own to bump (spec.md §6's "bump a version counter" is satisfied
    /// by the dependency table itself — every block that compiled a BOP
    /// fast path recorded a token for it), so this simply forwards to
    /// `invalidate_for_dependency` for the token identifying that class's
    /// BOP state.
    pub fn notify_bop_redefined(&mut self, class_ref: u64, bop_id: u32) {
        let token = bop_redefinition_token(class_ref, bop_id);
        self.invalidate_for_dependency(token);
    }

    /// `notify_constant_state_changed`: analogous to `notify_bop_redefined`
    /// but for the single, global constant-resolution token.
    pub fn notify_constant_state_changed(&mut self) {
        self.invalidate_for_dependency(DependencyToken(CONSTANT_STATE_TOKEN));
    }

    /// Number of versions currently compiled for `id`. Debug/test
    /// introspection, mirroring the counters a host's own JIT stats command
    /// would read (see `core::cache::MAX_VERSIONS`).
    pub fn block_count(&self, id: BlockId) -> usize {
        self.cache.count(id)
    }

    /// Is there a compiled version of `id` whose context is reachable from
    /// `ctx` (exact or widened)?
    pub fn has_compatible_block(&self, id: BlockId, ctx: Context) -> bool {
        self.cache.find(id, &ctx).is_some()
    }

    /// Dependency tokens the best-matching compiled version of `id` trusts,
    /// or `None` if no version is compiled for `ctx`.
    pub fn block_deps(&self, id: BlockId, ctx: Context) -> Option<BlockDeps> {
        self.cache.find(id, &ctx).map(|idx| self.cache.get(idx).deps.clone())
    }

    /// Branches targeting the best-matching compiled version of `id`.
    pub fn block_incoming(&self, id: BlockId, ctx: Context) -> Option<Vec<BranchId>> {
        self.cache.find(id, &ctx).map(|idx| self.cache.get(idx).incoming.clone())
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    pub fn branch_shape(&self, branch_id: BranchId) -> Shape {
        self.branches[branch_id.0 as usize].shape
    }

    pub fn branch_dst_addrs(&self, branch_id: BranchId) -> [Option<*const u8>; 2] {
        self.branches[branch_id.0 as usize].dst_addrs
    }

    /// Does `token` still have dependent blocks recorded against it?
    pub fn dependency_live(&self, token: DependencyToken) -> bool {
        self.deps.contains(token)
    }

    /// Is `ptr` an address in the out-of-line `CodeBlock` (stubs, side
    /// exits), as opposed to the main one?
    pub fn is_ocb_ptr(&self, ptr: *const u8) -> bool {
        self.ocb.contains_ptr(ptr)
    }
}

/// Deterministic token for "basic operator `bop_id` on `class_ref`", so that
/// `opt_plus`/`opt_minus`/`opt_lt` handlers and `notify_bop_redefined` agree
/// on the same `DependencyToken` without a side channel. The top half of the
/// u64 carries the class reference, the bottom byte the bop id — `class_ref`
/// values are host pointers/indices that fit comfortably in 56 bits.
pub fn bop_redefinition_token(class_ref: u64, bop_id: u32) -> DependencyToken {
    DependencyToken((class_ref << 8) | (bop_id as u64 & 0xFF))
}

const CONSTANT_STATE_TOKEN: u64 = u64::MAX;
