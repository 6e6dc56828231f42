//! The host-callback boundary: everything the core reads from or writes
//! back into the interpreter it is embedded in, expressed as a trait so
//! pipeline code stays decoupled from any one host (mirrors how
//! `CodegenBackend`/`SymbolResolver` are defined as traits at the backend
//! seam of the teacher crate this one started from).

use crate::compiler::bytecode::Insn;
use crate::core::block::DependencyToken;

/// Opaque host identity of one bytecode sequence (iseq). The core never
/// inspects its value, only compares, hashes, and forwards it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IseqRef(pub u64);

/// Opaque host identity of a method cache entry (`cc`) or callable method
/// entry (`cme`), before it has been wrapped as a `DependencyToken` for the
/// dependency table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodCacheRef(pub u64);

impl From<MethodCacheRef> for DependencyToken {
    fn from(r: MethodCacheRef) -> Self {
        DependencyToken(r.0)
    }
}

/// `cme.def.type` — distinguishes a C-function callable method entry
/// (specializable by `opt_send_without_block`) from anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmeDefType {
    Cfunc,
    Iseq,
    Other,
}

/// A populated inline cache's method-lookup snapshot, as read from the
/// host's call-cache/callable-method-entry pair.
#[derive(Debug, Clone, Copy)]
pub struct MethodCacheEntry {
    pub cc: MethodCacheRef,
    pub cme: MethodCacheRef,
    pub klass: u64,
    pub class_serial: u64,
    pub def_type: CmeDefType,
    /// Valid only when `def_type == Cfunc`: the native function pointer and
    /// its fixed argument count.
    pub cfunc_ptr: Option<*const u8>,
    pub cfunc_argc: i32,
    /// Whether this C function is known not to read/write the control
    /// frame it's called from (no `rb_frame_this_func`-style introspection),
    /// letting `opt_send_without_block` skip pushing a fresh control frame.
    pub is_leaf_cfunc: bool,
    /// True when the call site's flags are "simple": no splat, no kwsplat,
    /// no block argument.
    pub simple_call: bool,
    /// The CME's invalidated bit; a stale read here still can't cause
    /// incorrect codegen since the compiler also records the token in the
    /// dependency table and the VM revalidates at invalidation time.
    pub invalidated: bool,
}

/// Control-frame-pointer field layout the generated prologue/epilogue and
/// `getlocal`/`setlocal`/side-exit sequences read and write.
pub trait CfpLayout {
    fn pc_offset(&self) -> i32;
    fn sp_offset(&self) -> i32;
    fn ep_offset(&self) -> i32;
    fn self_offset(&self) -> i32;
    fn iseq_offset(&self) -> i32;
    fn block_code_offset(&self) -> i32;
    fn bp_offset(&self) -> i32;
}

/// Execution-context field layout (interrupt checks in `opt_send_without_block`).
pub trait EcLayout {
    fn cfp_offset(&self) -> i32;
    fn interrupt_mask_offset(&self) -> i32;
    fn interrupt_flag_offset(&self) -> i32;
}

/// Everything the core needs from its embedding host interpreter. One
/// implementation per host; test code in this crate provides a minimal
/// double (see `tests/harness.rs`).
pub trait HostInterp {
    type Cfp: CfpLayout;
    type Ec: EcLayout;

    fn cfp_layout(&self) -> &Self::Cfp;
    fn ec_layout(&self) -> &Self::Ec;

    /// Opcode word at a bytecode offset within `iseq`, used by the Compiler
    /// to dispatch per-opcode handlers and to restore the VM's original
    /// trampoline opcode on invalidation of an entry block.
    fn opcode_at_pc(&self, iseq: IseqRef, idx: u32) -> u32;

    /// Decode the full instruction (opcode plus fixed-size operand slice)
    /// at `idx`, or `None` past the end of the iseq's bytecode.
    fn decode_insn(&self, iseq: IseqRef, idx: u32) -> Option<Insn>;

    /// Patch the iseq's first opcode slot to jump into JITted code (called
    /// once by `compile_iseq`) or back to the original interpreter handler
    /// (called by `invalidate_for_dependency` when an entry block is freed).
    fn patch_entry_opcode(&mut self, iseq: IseqRef, jit_entry: Option<*const u8>);

    /// Read the populated inline cache for an `opt_send_without_block` site,
    /// if any.
    fn method_cache_at(&self, iseq: IseqRef, idx: u32) -> Option<MethodCacheEntry>;

    /// Read the populated inline cache for a `getinstancevariable` /
    /// `setinstancevariable` site, if any.
    fn ivar_cache_at(&self, iseq: IseqRef, idx: u32) -> Option<IvarCache>;

    /// Offset, from a heap object's header, of its class-serial word —
    /// compared at run time against the inline cache's recorded
    /// `class_serial` to guard a `getinstancevariable`/`setinstancevariable`
    /// specialization.
    fn object_class_serial_offset(&self) -> i32;

    /// Offset, from a heap object's header, of the first instance-variable
    /// slot; `ivar_cache.slot_index * slot_size()` is added to this.
    fn object_ivar_base_offset(&self) -> i32;

    /// Host-opaque class reference for the fixnum/Integer built-in type,
    /// passed to `bop_redefined` by the `opt_plus`/`opt_minus`/`opt_lt`
    /// handlers.
    fn integer_class_ref(&self) -> u64;

    /// Size, in bytes, of one control frame, used by `opt_send_without_block`
    /// to compute the pushed callee frame's address (`cfp - cfp_size`).
    fn cfp_size(&self) -> i32;


    /// The VM's redefined-flags word for basic operators on the given
    /// class; `opt_plus`/`opt_minus`/`opt_lt` guard against bit `bop_id`
    /// being set both at compile time (skip specializing) and at run time
    /// (a loaded guard check, emitted regardless).
    fn bop_redefined(&self, class_ref: u64, bop_id: u32) -> bool;

    /// Number of argument registers in the host's C ABI (6 on System V).
    fn num_c_arg_regs(&self) -> usize {
        6
    }

    /// Bit position of the fixnum tag in a tagged VM value: `(n << 1) | 1`
    /// sets bit 0, matching the reference interpreter this is modeled on.
    fn tag_fixnum_bit(&self) -> u32 {
        0
    }

    fn slot_size(&self) -> i32 {
        crate::core::context::SLOT_SIZE
    }

    /// Offset of the environment pointer's flags word, relative to the EP
    /// itself, consulted by `setlocal_WC_0` before writing a local: if the
    /// `ENV_FLAG_WB_REQUIRED` bit is set the write needs a barrier the JIT
    /// does not generate, and the handler must side-exit instead.
    fn ep_flags_offset(&self) -> i32;
}

/// Bit of the EP flags word indicating a write barrier is required before
/// storing into this environment's locals.
pub const ENV_FLAG_WB_REQUIRED: i64 = 1 << 0;

/// A populated `getinstancevariable`/`setinstancevariable` inline cache:
/// the class and slot index the site was last seen with.
#[derive(Debug, Clone, Copy)]
pub struct IvarCache {
    pub class_ref: u64,
    pub class_serial: u64,
    pub slot_index: i32,
    /// Whether a write to this slot might trigger a write barrier (e.g. the
    /// object is old-generation in a generational GC); `setinstancevariable`
    /// side-exits rather than generate barrier code for this case.
    pub needs_write_barrier: bool,
}
