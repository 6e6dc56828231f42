//! The versioning / block-cache engine and the invalidation engine.

pub mod block;
pub mod branch;
pub mod cache;
pub mod context;
pub mod invariants;

pub use block::{Block, BlockDeps, BlockId, BlockIdx, CodeOffset, DependencyToken};
pub use branch::{Branch, BranchId, GenFn, Shape};
pub use cache::{BlockCache, MAX_VERSIONS};
pub use context::{Context, Distance, TypeTag, MAX_LOCAL_TYPES, MAX_TEMP_TYPES, SLOT_SIZE};
pub use invariants::DependencyTable;
