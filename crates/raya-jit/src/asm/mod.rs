//! The x86-64 assembler: code buffers, operands, and per-mnemonic encoders.

pub mod cb;
pub mod encoder;
pub mod operand;

pub use cb::{CodeBlock, LabelId};
pub use operand::{Mem, Opnd, Reg, RegType};
