//! The bytecode opcode subset this crate's Compiler understands. Anything
//! else forces `CantCompile` at `compile_block` (see §6's opcode subset).

/// One decoded bytecode instruction: opcode plus its fixed-size operand
/// words, as the host's `HostInterp::decode_insn` would hand them over.
#[derive(Debug, Clone)]
pub struct Insn {
    pub op: Opcode,
    pub operands: Vec<i64>,
    /// Length in bytecode words, so the Compiler knows how far to advance.
    pub len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Nop,
    Pop,
    Dup,
    PutNil,
    PutObject,
    PutObjectInt2Fix0,
    PutObjectInt2Fix1,
    PutSelf,
    GetLocalWc0,
    SetLocalWc0,
    GetInstanceVariable,
    SetInstanceVariable,
    OptLt,
    OptMinus,
    OptPlus,
    OptSendWithoutBlock,
    BranchUnless,
    Jump,
    Leave,
    /// Any opcode outside the handled subset; always forces `CantCompile`.
    Other(u32),
}
