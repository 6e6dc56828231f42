//! Minimal `HostInterp` test double: a fake CFP/EC field layout, an
//! in-memory bytecode program per iseq, and settable method/ivar caches.
//! Modeled on the teacher's `tests/e2e/harness.rs` shape, scaled down to
//! this crate's host boundary instead of a full VM.

use std::collections::{HashMap, HashSet};

use raya_jit::compiler::bytecode::{Insn, Opcode};
use raya_jit::iface::{CfpLayout, CmeDefType, EcLayout, HostInterp, IseqRef, IvarCache, MethodCacheEntry, MethodCacheRef};

pub struct FakeCfpLayout;

impl CfpLayout for FakeCfpLayout {
    fn pc_offset(&self) -> i32 {
        0
    }
    fn sp_offset(&self) -> i32 {
        8
    }
    fn ep_offset(&self) -> i32 {
        16
    }
    fn self_offset(&self) -> i32 {
        24
    }
    fn iseq_offset(&self) -> i32 {
        32
    }
    fn block_code_offset(&self) -> i32 {
        40
    }
    fn bp_offset(&self) -> i32 {
        48
    }
}

pub struct FakeEcLayout;

impl EcLayout for FakeEcLayout {
    fn cfp_offset(&self) -> i32 {
        0
    }
    fn interrupt_mask_offset(&self) -> i32 {
        8
    }
    fn interrupt_flag_offset(&self) -> i32 {
        16
    }
}

/// Fixnum/Integer class reference this double hands back from
/// `integer_class_ref`.
pub const INTEGER_CLASS_REF: u64 = 0x1000;

pub struct FakeHost {
    programs: HashMap<IseqRef, Vec<Insn>>,
    method_caches: HashMap<(IseqRef, u32), MethodCacheEntry>,
    ivar_caches: HashMap<(IseqRef, u32), IvarCache>,
    redefined_bops: HashSet<(u64, u32)>,
    entry_patches: HashMap<IseqRef, Option<*const u8>>,
    cfp: FakeCfpLayout,
    ec: FakeEcLayout,
}

impl FakeHost {
    pub fn new() -> Self {
        FakeHost {
            programs: HashMap::new(),
            method_caches: HashMap::new(),
            ivar_caches: HashMap::new(),
            redefined_bops: HashSet::new(),
            entry_patches: HashMap::new(),
            cfp: FakeCfpLayout,
            ec: FakeEcLayout,
        }
    }

    pub fn set_program(&mut self, iseq: IseqRef, insns: Vec<Insn>) {
        self.programs.insert(iseq, insns);
    }

    pub fn set_method_cache(&mut self, iseq: IseqRef, idx: u32, entry: MethodCacheEntry) {
        self.method_caches.insert((iseq, idx), entry);
    }

    pub fn redefine_bop(&mut self, class_ref: u64, bop_id: u32) {
        self.redefined_bops.insert((class_ref, bop_id));
    }

    pub fn entry_patch(&self, iseq: IseqRef) -> Option<*const u8> {
        self.entry_patches.get(&iseq).copied().flatten()
    }

    /// Was `patch_entry_opcode(iseq, None)` ever the *last* call for this
    /// iseq (i.e. did invalidation restore the interpreter trampoline)?
    pub fn entry_is_uncompiled(&self, iseq: IseqRef) -> bool {
        matches!(self.entry_patches.get(&iseq), Some(None))
    }
}

impl HostInterp for FakeHost {
    type Cfp = FakeCfpLayout;
    type Ec = FakeEcLayout;

    fn cfp_layout(&self) -> &Self::Cfp {
        &self.cfp
    }

    fn ec_layout(&self) -> &Self::Ec {
        &self.ec
    }

    fn opcode_at_pc(&self, _iseq: IseqRef, _idx: u32) -> u32 {
        0
    }

    fn decode_insn(&self, iseq: IseqRef, idx: u32) -> Option<Insn> {
        let insns = self.programs.get(&iseq)?;
        let mut cursor = 0u32;
        for insn in insns {
            if cursor == idx {
                return Some(insn.clone());
            }
            cursor += insn.len;
        }
        None
    }

    fn patch_entry_opcode(&mut self, iseq: IseqRef, jit_entry: Option<*const u8>) {
        self.entry_patches.insert(iseq, jit_entry);
    }

    fn method_cache_at(&self, iseq: IseqRef, idx: u32) -> Option<MethodCacheEntry> {
        self.method_caches.get(&(iseq, idx)).copied()
    }

    fn ivar_cache_at(&self, iseq: IseqRef, idx: u32) -> Option<IvarCache> {
        self.ivar_caches.get(&(iseq, idx)).copied()
    }

    fn object_class_serial_offset(&self) -> i32 {
        8
    }

    fn object_ivar_base_offset(&self) -> i32 {
        16
    }

    fn integer_class_ref(&self) -> u64 {
        INTEGER_CLASS_REF
    }

    fn cfp_size(&self) -> i32 {
        56
    }

    fn bop_redefined(&self, class_ref: u64, bop_id: u32) -> bool {
        self.redefined_bops.contains(&(class_ref, bop_id))
    }

    fn ep_flags_offset(&self) -> i32 {
        -8
    }
}

pub fn insn(op: Opcode, operands: &[i64]) -> Insn {
    Insn { op, operands: operands.to_vec(), len: 1 }
}

/// A `cme`/`cc` pair plus a no-op leaf C function, for
/// `opt_send_without_block` test setups that never actually invoke the call.
pub fn fake_method_cache(cc_id: u64, cme_id: u64, class_serial: u64) -> MethodCacheEntry {
    extern "C" fn noop_leaf(_recv: u64) -> u64 {
        0
    }

    MethodCacheEntry {
        cc: MethodCacheRef(cc_id),
        cme: MethodCacheRef(cme_id),
        klass: 0x2000,
        class_serial,
        def_type: CmeDefType::Cfunc,
        cfunc_ptr: Some(noop_leaf as *const u8),
        cfunc_argc: 0,
        is_leaf_cfunc: true,
        simple_call: true,
        invalidated: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_insn_walks_variable_length_stream() {
        let mut host = FakeHost::new();
        let iseq = IseqRef(1);
        host.set_program(iseq, vec![insn(Opcode::PutNil, &[]), insn(Opcode::Leave, &[])]);
        assert_eq!(host.decode_insn(iseq, 0).unwrap().op, Opcode::PutNil);
        assert_eq!(host.decode_insn(iseq, 1).unwrap().op, Opcode::Leave);
        assert!(host.decode_insn(iseq, 2).is_none());
    }
}
