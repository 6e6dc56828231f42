//! Error types for the assembler and compiler.

/// Failure modes the JIT can hit while assembling or patching machine code.
///
/// `UnsupportedOpcode`, `IncompleteInlineCache`, and hitting the per-`BlockId`
/// version cap are *not* represented here: those are recovered locally as
/// ordinary control flow (falling back to the interpreter, or to a generic
/// [`crate::core::context::Context`]) rather than propagated as errors.
#[derive(Debug, thiserror::Error)]
pub enum JitError {
    #[error("out of executable memory: needed {needed} bytes, {available} available")]
    OutOfCode { needed: usize, available: usize },

    #[error("encoding constraint violated: {0}")]
    EncodingConstraintViolated(String),

    #[error("branch rewrite would grow past its reserved range ({would_be} > {limit} bytes)")]
    BranchWouldGrow { would_be: usize, limit: usize },

    #[error("executable memory mapping failed: {0}")]
    MmapFailed(String),
}
