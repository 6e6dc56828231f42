//! Integration tests against a live `Jit<FakeHost>`, covering the
//! quantified invariants and end-to-end scenarios in spec §8: version cap,
//! branch bookkeeping, dependency invalidation, and GC compaction. The
//! `test_scenarioN_*` tests actually execute the generated machine code
//! (see `support::exec`), rather than only inspecting compile-time
//! bookkeeping, for the concrete scenarios spec §8 spells out.

mod support;

use raya_jit::compiler::bytecode::Opcode;
use raya_jit::compiler::opcodes::arith::BOP_PLUS;
use raya_jit::core::block::{BlockId, DependencyToken};
use raya_jit::core::branch::{BranchId, Shape};
use raya_jit::core::cache::MAX_VERSIONS;
use raya_jit::core::context::{Context, TypeTag};
use raya_jit::iface::IseqRef;
use raya_jit::{bop_redefinition_token, Jit, Options};

use support::exec::{call_entry, call_entry_with_stubs, stub_trampoline_ptr, tag_fixnum, untag_fixnum, Frame};
use support::harness::{fake_method_cache, insn, FakeHost, INTEGER_CLASS_REF};

fn new_jit() -> Jit<FakeHost> {
    Jit::init(FakeHost::new(), Options::default(), stub_trampoline_ptr()).expect("exec mem alloc")
}

#[test]
fn test_fixnum_arithmetic_compiles_one_block() {
    let mut jit = new_jit();
    let iseq = IseqRef(1);
    jit.host_mut().set_program(
        iseq,
        vec![
            insn(Opcode::PutObject, &[0b11]), // tagged fixnum 1
            insn(Opcode::PutObject, &[0b101]), // tagged fixnum 2
            insn(Opcode::OptPlus, &[]),
            insn(Opcode::Leave, &[]),
        ],
    );

    jit.compile_iseq(iseq);

    let entry = BlockId { iseq, bytecode_idx: 0 };
    assert_eq!(jit.block_count(entry), 1);
    assert!(jit.host().entry_patch(iseq).is_some(), "entry opcode must be patched to the jitted code");

    let deps = jit.block_deps(entry, Context::default()).expect("entry block must exist");
    let expected_token = bop_redefinition_token(INTEGER_CLASS_REF, BOP_PLUS);
    assert_eq!(deps.bop, Some(expected_token));
    assert!(jit.dependency_live(expected_token));
}

#[test]
fn test_version_cap_keeps_count_at_max_versions() {
    let mut jit = new_jit();
    let iseq = IseqRef(2);
    jit.host_mut().set_program(iseq, vec![insn(Opcode::PutNil, &[]), insn(Opcode::Leave, &[])]);
    let id = BlockId { iseq, bytecode_idx: 0 };

    let shapes = [TypeTag::Nil, TypeTag::False, TypeTag::True, TypeTag::Fixnum, TypeTag::Flonum];
    for (i, self_type) in shapes.iter().enumerate() {
        let mut ctx = Context::default();
        ctx.self_type = *self_type;
        jit.compile_block(id, ctx);
        let expected = (i + 1).min(MAX_VERSIONS);
        assert_eq!(jit.block_count(id), expected, "count must never exceed MAX_VERSIONS");
    }

    assert_eq!(jit.block_count(id), MAX_VERSIONS);
    assert!(jit.stats().version_cap_hits >= 1);

    // The 5th (cap-triggering) version must be the fully generic one.
    assert!(jit.has_compatible_block(id, Context::default().generic()));
}

#[test]
fn test_invalidation_rewrites_incoming_branch_to_stub() {
    let mut jit = new_jit();
    let iseq = IseqRef(3);
    let cc_id = 0xAAAA;
    let cme_id = 0xBBBB;
    jit.host_mut().set_method_cache(iseq, 2, fake_method_cache(cc_id, cme_id, 0x42));
    jit.host_mut().set_program(
        iseq,
        vec![
            insn(Opcode::Jump, &[1]),            // idx 0: jump to idx 1
            insn(Opcode::PutObject, &[0b11]),    // idx 1: receiver (callee block head)
            insn(Opcode::OptSendWithoutBlock, &[0]), // idx 2: argc = 0
            insn(Opcode::Leave, &[]),            // unreachable (OptSendWithoutBlock ends the block)
        ],
    );

    jit.compile_iseq(iseq);

    let callee = BlockId { iseq, bytecode_idx: 1 };
    let ctx = Context::default();
    assert_eq!(jit.block_count(callee), 1);
    let deps = jit.block_deps(callee, ctx).expect("callee block must be compiled");
    let cc_token = deps.cc.expect("opt_send_without_block must record a cc dependency");
    assert_eq!(cc_token, DependencyToken(cc_id));

    let incoming = jit.block_incoming(callee, ctx).expect("callee must exist");
    assert_eq!(incoming.len(), 1);
    let branch_id = incoming[0];
    assert_eq!(branch_id, BranchId(0));

    // Before invalidation the jump targets the callee's real compiled code.
    let before = jit.branch_dst_addrs(branch_id)[0].expect("branch must have resolved its target");
    assert!(!jit.is_ocb_ptr(before), "a live target must live in the main CodeBlock");

    jit.invalidate_for_dependency(cc_token);

    assert_eq!(jit.block_count(callee), 0, "invalidated block must be gone from the cache");
    assert!(!jit.dependency_live(cc_token));

    let after = jit.branch_dst_addrs(branch_id)[0].expect("branch must still have a target after invalidation");
    assert!(jit.is_ocb_ptr(after), "invalidation must rewrite the incoming branch to an out-of-line stub");
    assert_eq!(jit.branch_shape(branch_id), Shape::Default, "a Next0 branch whose target was evicted can no longer fall through; it must carry an explicit jmp");
}

#[test]
fn test_gc_compaction_rekeys_dependency_table() {
    let mut jit = new_jit();
    let iseq = IseqRef(4);
    jit.host_mut().set_program(
        iseq,
        vec![
            insn(Opcode::PutObject, &[0b11]),
            insn(Opcode::PutObject, &[0b101]),
            insn(Opcode::OptPlus, &[]),
            insn(Opcode::Leave, &[]),
        ],
    );
    jit.compile_iseq(iseq);

    let entry = BlockId { iseq, bytecode_idx: 0 };
    let old_token = jit.block_deps(entry, Context::default()).unwrap().bop.unwrap();

    let mut marked = Vec::new();
    jit.mark_for_gc(iseq, |t| marked.push(t));
    assert_eq!(marked, vec![old_token]);

    let new_token = DependencyToken(old_token.0.wrapping_add(1));
    jit.update_references_for_gc(iseq, |t| if t == old_token { new_token } else { t });

    assert!(!jit.dependency_live(old_token));
    assert!(jit.dependency_live(new_token));
    assert_eq!(jit.block_deps(entry, Context::default()).unwrap().bop, Some(new_token));

    jit.invalidate_for_dependency(new_token);
    assert_eq!(jit.block_count(entry), 0);
    assert!(jit.host().entry_is_uncompiled(iseq));
}

#[test]
fn test_on_iseq_free_drops_blocks_without_touching_incoming() {
    let mut jit = new_jit();
    let iseq = IseqRef(5);
    jit.host_mut().set_program(iseq, vec![insn(Opcode::PutNil, &[]), insn(Opcode::Leave, &[])]);
    jit.compile_iseq(iseq);

    let entry = BlockId { iseq, bytecode_idx: 0 };
    assert_eq!(jit.block_count(entry), 1);

    jit.on_iseq_free(iseq);
    assert_eq!(jit.block_count(entry), 0);
}

#[test]
fn test_scenario1_fixnum_arithmetic_executes_and_stays_monomorphic() {
    let mut jit = new_jit();
    let iseq = IseqRef(200);
    jit.host_mut().set_program(
        iseq,
        vec![
            insn(Opcode::PutObject, &[tag_fixnum(1) as i64]),
            insn(Opcode::PutObject, &[tag_fixnum(2) as i64]),
            insn(Opcode::OptPlus, &[]),
            insn(Opcode::Leave, &[]),
        ],
    );
    jit.compile_iseq(iseq);

    let entry = BlockId { iseq, bytecode_idx: 0 };
    let entry_ptr = jit.host().entry_patch(iseq).expect("entry must be patched");

    for _ in 0..100 {
        let mut frame = Frame::new();
        let ret = call_entry(entry_ptr, &mut frame);
        assert_eq!(untag_fixnum(ret), 3, "putobject 1; putobject 2; opt_plus; leave must return 3");
    }

    assert_eq!(jit.block_count(entry), 1, "a monomorphic call site never grows past its first version");
    assert_eq!(jit.stats().stub_hits, 0, "a straight-line block with no branch never hits a stub");
}

#[test]
fn test_scenario2_guard_failure_side_exits_to_the_failing_instruction() {
    let mut jit = new_jit();
    let iseq = IseqRef(201);
    jit.host_mut().set_program(
        iseq,
        vec![
            insn(Opcode::GetLocalWc0, &[0]),
            insn(Opcode::PutObject, &[tag_fixnum(1) as i64]),
            insn(Opcode::OptPlus, &[]), // bytecode_idx 2
            insn(Opcode::Leave, &[]),
        ],
    );
    jit.compile_iseq(iseq);
    let entry_ptr = jit.host().entry_patch(iseq).expect("entry must be patched");

    // local 0 = fixnum 41: the guard passes, the add runs, and the guard
    // must never have touched cfp.pc on its way through.
    let mut ok_frame = Frame::new();
    ok_frame.wire_locals();
    ok_frame.set_local(0, tag_fixnum(41));
    ok_frame.set_pc(u64::MAX);
    let ret = call_entry(entry_ptr, &mut ok_frame);
    assert_eq!(untag_fixnum(ret), 42);
    assert_eq!(ok_frame.pc(), u64::MAX, "a passing guard must never write cfp.pc");

    // local 0 = a non-fixnum (tag bit clear): guard_both_fixnums must
    // side-exit before the add ever runs. This crate has no interpreter of
    // its own to resume into, so the one thing it can prove is that the
    // side exit hands back the bailout pc for whatever interpreter the host
    // embeds, at the opt_plus instruction itself, rather than running the
    // add against garbage or crashing.
    let mut fail_frame = Frame::new();
    fail_frame.wire_locals();
    fail_frame.set_local(0, 0xDEAD_BEEFu64 << 4);
    fail_frame.set_pc(u64::MAX);
    let _ = call_entry(entry_ptr, &mut fail_frame);
    assert_eq!(fail_frame.pc(), 2, "the side exit must resume at opt_plus's own bytecode index");
}

#[test]
fn test_opt_plus_overflow_side_exits_instead_of_wrapping() {
    // Regression coverage for the overflow-check ordering fix: checking OF
    // on the untagging instruction instead of the combining add would have
    // missed this entirely and returned a wrapped, wrong fixnum.
    let mut jit = new_jit();
    let iseq = IseqRef(202);
    jit.host_mut().set_program(
        iseq,
        vec![
            insn(Opcode::PutObject, &[tag_fixnum(1i64 << 61)]),
            insn(Opcode::PutObject, &[tag_fixnum(1i64 << 61)]),
            insn(Opcode::OptPlus, &[]), // bytecode_idx 2
            insn(Opcode::Leave, &[]),
        ],
    );
    jit.compile_iseq(iseq);
    let entry_ptr = jit.host().entry_patch(iseq).expect("entry must be patched");

    let mut frame = Frame::new();
    frame.set_pc(u64::MAX);
    let _ = call_entry(entry_ptr, &mut frame);
    assert_eq!(frame.pc(), 2, "an overflowing fixnum add must side-exit at opt_plus, not silently wrap");
}

#[test]
fn test_opt_minus_overflow_side_exits_instead_of_wrapping() {
    let mut jit = new_jit();
    let iseq = IseqRef(203);
    jit.host_mut().set_program(
        iseq,
        vec![
            insn(Opcode::PutObject, &[i64::MIN + 1]), // smallest tagged fixnum
            insn(Opcode::PutObject, &[3]),             // tagged fixnum 1
            insn(Opcode::OptMinus, &[]), // bytecode_idx 2
            insn(Opcode::Leave, &[]),
        ],
    );
    jit.compile_iseq(iseq);
    let entry_ptr = jit.host().entry_patch(iseq).expect("entry must be patched");

    let mut frame = Frame::new();
    frame.set_pc(u64::MAX);
    let _ = call_entry(entry_ptr, &mut frame);
    assert_eq!(frame.pc(), 2, "an underflowing fixnum subtraction must side-exit at opt_minus, not silently wrap");
}

#[test]
fn test_scenario3_branchunless_compiles_targets_lazily_and_resolves_the_taken_stub() {
    let mut jit = new_jit();
    let iseq = IseqRef(204);
    const YES: i64 = 0x2A;
    const NO: i64 = 0x99;
    jit.host_mut().set_program(
        iseq,
        vec![
            insn(Opcode::PutObject, &[0x14]),  // idx0: a truthy literal (no tag bit 3 set)
            insn(Opcode::BranchUnless, &[3]),  // idx1: falsy -> idx 1+3 = 4 ("no")
            insn(Opcode::PutObject, &[YES]),   // idx2: "yes" block
            insn(Opcode::Leave, &[]),          // idx3
            insn(Opcode::PutObject, &[NO]),    // idx4: "no" block
            insn(Opcode::Leave, &[]),          // idx5
        ],
    );

    jit.compile_iseq(iseq);

    let entry = BlockId { iseq, bytecode_idx: 0 };
    let yes_block = BlockId { iseq, bytecode_idx: 2 };
    let no_block = BlockId { iseq, bytecode_idx: 4 };
    assert_eq!(jit.block_count(entry), 1, "only the entry block compiles eagerly");
    assert_eq!(jit.block_count(yes_block), 0, "branch targets compile lazily, on first stub hit");
    assert_eq!(jit.block_count(no_block), 0);
    assert_eq!(jit.branch_count(), 1, "branchunless registers exactly one Branch");

    let branch_id = BranchId(0);
    let dst_before = jit.branch_dst_addrs(branch_id);
    assert!(jit.is_ocb_ptr(dst_before[0].unwrap()), "both targets start out as out-of-line stubs");
    assert!(jit.is_ocb_ptr(dst_before[1].unwrap()));

    let entry_ptr = jit.host().entry_patch(iseq).expect("entry must be patched");
    let mut frame = Frame::new();
    let ret = call_entry_with_stubs(&mut jit, entry_ptr, &mut frame);

    assert_eq!(ret as i64, YES, "a truthy condition must take the fallthrough (target 1) path");
    assert_eq!(jit.block_count(entry), 1);
    assert_eq!(jit.block_count(yes_block), 1, "the taken branch's target compiles exactly once, on demand");
    assert_eq!(jit.block_count(no_block), 0, "the untaken branch's target is never compiled");
    assert_eq!(jit.branch_count(), 1, "resolving a stub patches the existing Branch in place; it adds no new one");

    let dst_after = jit.branch_dst_addrs(branch_id);
    assert!(!jit.is_ocb_ptr(dst_after[1].unwrap()), "target 1 must now point at the real compiled block, not its stub");
    assert_eq!(jit.stats().stub_hits, 1);
}
