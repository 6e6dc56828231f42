//! Execution harness: calls a compiled entry point as real machine code,
//! backed by a CFP/EC/value-stack triple laid out to match
//! `FakeCfpLayout`/`FakeEcLayout`, and a thread-local bridge so a branch
//! stub's call can reach back into the live `Jit<FakeHost>` the same way a
//! host's real `stub_hit_trampoline` would.

use std::cell::Cell;
use std::ptr;

use raya_jit::core::branch::BranchId;
use raya_jit::Jit;

use super::harness::FakeHost;

/// Backing storage for one call into JITted code. Every field is a raw
/// `u64` word since `FakeCfpLayout`/`FakeEcLayout`'s offsets are all
/// 8-byte-aligned; sized generously past `cfp_size()`/`ec`'s real footprint
/// so no opcode under test can write past the end of either buffer.
#[repr(C, align(8))]
pub struct Frame {
    cfp: [u64; 8],
    ec: [u64; 4],
    locals: [u64; 8],
    stack: [u64; 32],
}

impl Frame {
    pub fn new() -> Self {
        Frame { cfp: [0; 8], ec: [0; 4], locals: [0; 8], stack: [0; 32] }
    }

    fn cfp_ptr(&mut self) -> *mut u8 {
        self.cfp.as_mut_ptr() as *mut u8
    }

    fn ec_ptr(&mut self) -> *mut u8 {
        self.ec.as_mut_ptr() as *mut u8
    }

    fn sp_ptr(&mut self) -> *mut u8 {
        self.stack.as_mut_ptr() as *mut u8
    }

    /// Point `cfp.ep` at `locals[0]`, so `getlocal_WC_0`/`setlocal_WC_0`
    /// with `k == 0` address `self.locals[0]` directly.
    pub fn wire_locals(&mut self) {
        self.cfp[2] = self.locals.as_mut_ptr() as u64; // ep_offset == 16 bytes == word 2
    }

    pub fn set_local(&mut self, idx: usize, value: u64) {
        self.locals[idx] = value;
    }

    /// `cfp.pc`, written by `gen_side_exit` on a guard failure.
    pub fn pc(&self) -> u64 {
        self.cfp[0]
    }

    pub fn set_pc(&mut self, value: u64) {
        self.cfp[0] = value;
    }
}

type EntryFn = unsafe extern "C" fn(*mut u8, *mut u8, *mut u8) -> u64;

/// Call a compiled entry point directly. Only safe to use on a block that
/// cannot reach an unresolved branch stub (no `branchunless`/`jump` in its
/// bytecode) — use [`call_entry_with_stubs`] otherwise.
pub fn call_entry(entry: *const u8, frame: &mut Frame) -> u64 {
    let f: EntryFn = unsafe { std::mem::transmute(entry) };
    unsafe { f(frame.cfp_ptr(), frame.ec_ptr(), frame.sp_ptr()) }
}

thread_local! {
    static CURRENT_JIT: Cell<*mut Jit<FakeHost>> = Cell::new(ptr::null_mut());
}

/// `extern "C" fn(branch_id, target_idx) -> target_ptr`: exactly the ABI
/// `Jit::emit_stub` already assumes of its host-supplied trampoline (the two
/// args land in `RDI`/`RSI`, the return in `RAX`, per the System V integer
/// convention used throughout this crate). Forwards to whichever
/// `Jit<FakeHost>` `call_entry_with_stubs` last registered for this thread.
extern "C" fn stub_trampoline(branch_id: u64, target_idx: u64) -> *const u8 {
    CURRENT_JIT.with(|cell| {
        let ptr = cell.get();
        assert!(!ptr.is_null(), "a branch stub fired with no Jit registered for this thread");
        let jit = unsafe { &mut *ptr };
        jit.branch_stub_hit(BranchId(branch_id as u32), target_idx as u8)
    })
}

pub fn stub_trampoline_ptr() -> *const u8 {
    stub_trampoline as *const u8
}

/// Registers `jit` as this thread's `stub_trampoline` target for the
/// lifetime of the guard, clearing it back to null on drop (including on
/// unwind) so a panicking test can't leave a dangling pointer behind for a
/// later test that happens to reuse the same OS thread.
struct ActiveJit;

impl ActiveJit {
    fn register(jit: &mut Jit<FakeHost>) -> Self {
        CURRENT_JIT.with(|cell| cell.set(jit as *mut _));
        ActiveJit
    }
}

impl Drop for ActiveJit {
    fn drop(&mut self) {
        CURRENT_JIT.with(|cell| cell.set(ptr::null_mut()));
    }
}

/// Call a compiled entry point that may reach an unresolved branch target:
/// the stub's call into `stub_trampoline` is bridged back to `jit`, which
/// compiles the target block on demand (exactly as a host's real trampoline
/// would) and resumes directly into it.
pub fn call_entry_with_stubs(jit: &mut Jit<FakeHost>, entry: *const u8, frame: &mut Frame) -> u64 {
    let _guard = ActiveJit::register(jit);
    call_entry(entry, frame)
}

/// `(n << 1) | 1`, this crate's tagged-fixnum encoding.
pub fn tag_fixnum(n: i64) -> u64 {
    ((n << 1) | 1) as u64
}

/// Inverse of [`tag_fixnum`].
pub fn untag_fixnum(v: u64) -> i64 {
    (v as i64) >> 1
}
