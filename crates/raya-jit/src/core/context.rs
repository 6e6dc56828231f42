//! Per-block type and stack-shape snapshot: the versioning key beyond
//! [`crate::core::block::BlockId`].

use crate::asm::operand::{mem_opnd, Opnd, Reg};

/// Upper bound on the number of temp-stack slots tracked precisely; beyond
/// this the compiler conservatively assumes `Unknown`.
pub const MAX_TEMP_TYPES: usize = 8;

/// Upper bound on the number of local-variable slots refined per block.
pub const MAX_LOCAL_TYPES: usize = 8;

/// Bytes per VM stack slot (fixnums and object references are both one
/// machine word wide).
pub const SLOT_SIZE: i32 = 8;

/// One-byte type tag attached to a stack slot or `self`. `Unknown` is the
/// conservative top of the lattice every widening step converges to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Unknown,
    Nil,
    False,
    True,
    Fixnum,
    Flonum,
    ImmSymbol,
    HeapObject,
    Array,
    Hash,
    String,
}

impl Default for TypeTag {
    fn default() -> Self {
        TypeTag::Unknown
    }
}

/// Result of comparing how a caller's [`Context`] relates to a candidate
/// cached version. See `Context::diff` for the lattice this implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distance {
    /// Identical contexts; the candidate can be entered as-is.
    Exact,
    /// The candidate is `dst` reached from `src` by widening exactly `k`
    /// slots to `Unknown`, with no narrowing and no shape mismatch.
    Widened(u32),
    /// No relationship; the candidate cannot serve this caller.
    Incompatible,
}

impl Distance {
    /// Total order for `BlockCache::find`'s best-match search: `Exact` beats
    /// any `Widened`, and `Incompatible` never wins.
    pub fn rank(self) -> Option<u32> {
        match self {
            Distance::Exact => Some(0),
            Distance::Widened(k) => Some(k + 1),
            Distance::Incompatible => None,
        }
    }
}

/// The versioning key: depth, SP/VM-SP skew, and the type refinements
/// learned for this particular compiled path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    pub stack_size: u16,
    pub sp_offset: i16,
    pub temp_types: [TypeTag; MAX_TEMP_TYPES],
    pub self_type: TypeTag,
    pub local_types: [TypeTag; MAX_LOCAL_TYPES],
}

impl Default for Context {
    /// The entry context: empty stack, SP aligned with the VM's logical SP,
    /// everything unrefined. Every `BlockId` at bytecode index 0 must start
    /// here (see the crate-level invariant list).
    fn default() -> Self {
        Context {
            stack_size: 0,
            sp_offset: 0,
            temp_types: [TypeTag::Unknown; MAX_TEMP_TYPES],
            self_type: TypeTag::Unknown,
            local_types: [TypeTag::Unknown; MAX_LOCAL_TYPES],
        }
    }
}

impl Context {
    /// Push a typed value; returns the memory operand the caller should
    /// write the value into (`[SP + (sp_offset - 1) * SLOT_SIZE]`).
    pub fn push(&mut self, sp_reg: Reg, ty: TypeTag) -> Opnd {
        self.stack_size += 1;
        self.sp_offset += 1;
        self.set_top_type(ty);
        mem_opnd(64, sp_reg, (self.sp_offset as i32 - 1) * SLOT_SIZE)
    }

    /// Pop `n` slots, returning the memory operand of the (pre-pop) top
    /// slot. Clears the top `n` recorded types.
    pub fn pop(&mut self, sp_reg: Reg, n: u16) -> Opnd {
        assert!(n >= 1 && n <= self.stack_size, "pop underflows the tracked stack");
        let top_opnd = mem_opnd(64, sp_reg, (self.sp_offset as i32 - 1) * SLOT_SIZE);
        let shift = (n as usize).min(MAX_TEMP_TYPES);
        self.temp_types.copy_within(shift.., 0);
        for slot in self.temp_types.iter_mut().skip(MAX_TEMP_TYPES - shift) {
            *slot = TypeTag::Unknown;
        }
        self.stack_size -= n;
        self.sp_offset -= n as i16;
        top_opnd
    }

    /// Address the `idx`-th slot from the top (0 = current top) without
    /// mutating stack depth.
    pub fn opnd(&self, sp_reg: Reg, idx: u16) -> Opnd {
        assert!(idx < self.stack_size, "opnd index past tracked stack depth");
        mem_opnd(64, sp_reg, (self.sp_offset as i32 - 1 - idx as i32) * SLOT_SIZE)
    }

    /// `[SP + sp_offset*SLOT_SIZE + extra_bytes]`, used by callee-frame setup
    /// which addresses memory below the tracked temp stack.
    pub fn sp_opnd(&self, sp_reg: Reg, extra_bytes: i32) -> Opnd {
        mem_opnd(64, sp_reg, self.sp_offset as i32 * SLOT_SIZE + extra_bytes)
    }

    pub fn get_top_type(&self) -> TypeTag {
        if self.stack_size == 0 {
            TypeTag::Unknown
        } else {
            self.temp_types[0]
        }
    }

    fn set_top_type(&mut self, ty: TypeTag) {
        if self.stack_size as usize <= MAX_TEMP_TYPES {
            self.temp_types.copy_within(0..MAX_TEMP_TYPES - 1, 1);
            self.temp_types[0] = ty;
        }
        // Beyond MAX_TEMP_TYPES the pushed slot is untracked; already Unknown.
    }

    /// Generalize this context: same shape, every type tag widened to
    /// `Unknown`. Used once the per-`BlockId` version cap is hit.
    pub fn generic(&self) -> Context {
        Context {
            stack_size: self.stack_size,
            sp_offset: self.sp_offset,
            temp_types: [TypeTag::Unknown; MAX_TEMP_TYPES],
            self_type: TypeTag::Unknown,
            local_types: [TypeTag::Unknown; MAX_LOCAL_TYPES],
        }
    }

    /// Distance from `self` (the caller's shape) to `dst` (a cached
    /// version's `ctx_in`). See the crate-level `Distance` doc.
    pub fn diff(&self, dst: &Context) -> Distance {
        if self.stack_size != dst.stack_size || self.sp_offset != dst.sp_offset {
            return Distance::Incompatible;
        }
        if self == dst {
            return Distance::Exact;
        }

        let mut widened = 0u32;

        if self.self_type != dst.self_type {
            if dst.self_type != TypeTag::Unknown {
                return Distance::Incompatible;
            }
            widened += 1;
        }

        for (s, d) in self.temp_types.iter().zip(dst.temp_types.iter()) {
            if s != d {
                if *d != TypeTag::Unknown {
                    return Distance::Incompatible;
                }
                widened += 1;
            }
        }

        for (s, d) in self.local_types.iter().zip(dst.local_types.iter()) {
            if s != d {
                if *d != TypeTag::Unknown {
                    return Distance::Incompatible;
                }
                widened += 1;
            }
        }

        Distance::Widened(widened)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::operand::RDX;

    #[test]
    fn test_default_entry_context_is_empty() {
        let ctx = Context::default();
        assert_eq!(ctx.stack_size, 0);
        assert_eq!(ctx.sp_offset, 0);
    }

    #[test]
    fn test_push_pop_round_trip() {
        let mut ctx = Context::default();
        ctx.push(RDX, TypeTag::Fixnum);
        assert_eq!(ctx.stack_size, 1);
        assert_eq!(ctx.get_top_type(), TypeTag::Fixnum);
        ctx.pop(RDX, 1);
        assert_eq!(ctx.stack_size, 0);
    }

    #[test]
    fn test_diff_exact() {
        let a = Context::default();
        let b = Context::default();
        assert_eq!(a.diff(&b), Distance::Exact);
    }

    #[test]
    fn test_diff_widened_one_slot() {
        let mut specific = Context::default();
        specific.push(RDX, TypeTag::Fixnum);
        let generic = specific.generic();
        assert_eq!(specific.diff(&generic), Distance::Widened(1));
    }

    #[test]
    fn test_diff_incompatible_on_narrowing() {
        let mut unknown_ctx = Context::default();
        unknown_ctx.push(RDX, TypeTag::Unknown);
        let mut fixnum_ctx = Context::default();
        fixnum_ctx.push(RDX, TypeTag::Fixnum);
        assert_eq!(unknown_ctx.diff(&fixnum_ctx), Distance::Incompatible);
    }

    #[test]
    fn test_diff_incompatible_on_shape_mismatch() {
        let mut a = Context::default();
        a.push(RDX, TypeTag::Fixnum);
        let b = Context::default();
        assert_eq!(a.diff(&b), Distance::Incompatible);
    }
}
