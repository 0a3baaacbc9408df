//! TCG Execution Engine — TB cache and CPU execution loop.
//!
//! Provides the execution loop that drives the
//! lookup → translate → execute cycle, with TB caching via
//! a global hash table and per-CPU jump cache.
//!
//! Reference: `~/qemu/accel/tcg/cpu-exec.c`,
//! `~/qemu/accel/tcg/translate-all.c`.

pub mod exec_loop;
pub mod tb_store;

pub use exec_loop::{cpu_exec_loop, ExitReason};
pub use tb_store::TbStore;

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::{Arc, Mutex};

use tcg_backend::code_buffer::CodeBuffer;
use tcg_backend::HostCodeGen;
use tcg_core::tb::JumpCache;
use tcg_core::Context;

/// Execution statistics for profiling the TB lookup/chain
/// pipeline.
#[derive(Default)]
pub struct ExecStats {
    pub loop_iters: u64,
    // TB lookup
    pub jc_hit: u64,
    pub ht_hit: u64,
    pub translate: u64,
    // Exit types
    pub chain_exit: [u64; 2],
    pub nochain_exit: u64,
    pub real_exit: u64,
    // Chaining
    pub chain_patched: u64,
    pub chain_already: u64,
    // Hint
    pub hint_used: u64,
}

impl fmt::Display for ExecStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total_lookup = self.jc_hit + self.ht_hit + self.translate;
        writeln!(f, "=== TCG Execution Stats ===")?;
        writeln!(f, "loop iters:    {}", self.loop_iters)?;
        writeln!(f, "--- TB lookup ---")?;
        writeln!(
            f,
            "  jc hit:      {} ({:.1}%)",
            self.jc_hit,
            pct(self.jc_hit, total_lookup)
        )?;
        writeln!(
            f,
            "  ht hit:      {} ({:.1}%)",
            self.ht_hit,
            pct(self.ht_hit, total_lookup)
        )?;
        writeln!(
            f,
            "  translate:   {} ({:.1}%)",
            self.translate,
            pct(self.translate, total_lookup)
        )?;
        writeln!(f, "--- Exit types ---")?;
        writeln!(f, "  chain[0]:    {}", self.chain_exit[0])?;
        writeln!(f, "  chain[1]:    {}", self.chain_exit[1])?;
        writeln!(f, "  nochain:     {}", self.nochain_exit)?;
        writeln!(f, "  real exit:   {}", self.real_exit)?;
        writeln!(f, "--- Chaining ---")?;
        writeln!(f, "  patched:     {}", self.chain_patched)?;
        writeln!(f, "  already:     {}", self.chain_already)?;
        writeln!(f, "--- Hint ---")?;
        writeln!(f, "  hint used:   {}", self.hint_used)?;
        Ok(())
    }
}

fn pct(n: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        n as f64 / total as f64 * 100.0
    }
}

/// Trait for guest CPU state used by the execution loop.
pub trait GuestCpu {
    fn get_pc(&self) -> u64;
    fn get_flags(&self) -> u32;
    fn gen_code(&mut self, ir: &mut Context, pc: u64, max_insns: u32) -> u32;
    fn env_ptr(&mut self) -> *mut u8;

    /// Non-zero while a `fork`/`vfork` syscall wrapper is waiting on the
    /// dispatcher's fork protocol: 0 = none, 1 = plain fork, 3 =
    /// vfork-like (the parent blocks on the child). Inspected at every
    /// TB boundary. Default: fork is never requested.
    fn fork_request(&self) -> u64 {
        0
    }

    /// Write the host fork()'s return value into the guest result
    /// register and clear `fork_request` (and `quit`, if the wrapper
    /// also set it). Called once the fork protocol has run.
    fn complete_fork(&mut self, _ret: u64) {}

    /// Request to leave the dispatcher loop, checked at every TB
    /// boundary. Default: never quits.
    fn should_quit(&self) -> bool {
        false
    }

    /// Hash `size` guest source bytes starting at `pc`, for the
    /// `always_verify` SMC re-check. Default: always matches (TBs that
    /// never set `always_verify` never call this).
    fn hash_source(&self, _pc: u64, _size: u32) -> u64 {
        0
    }
}

/// State protected by translate_lock.
pub struct TranslateGuard {
    pub ir_ctx: Context,
}

/// Shared across all vCPU threads.
pub struct SharedState<B: HostCodeGen> {
    pub tb_store: TbStore,
    /// Code buffer wrapped in UnsafeCell: emit methods need
    /// &mut (under translate_lock), patch/read methods use &self.
    code_buf: UnsafeCell<CodeBuffer>,
    pub backend: B,
    pub code_gen_start: usize,
    /// Serializes code generation (IR + emit).
    pub translate_lock: Mutex<TranslateGuard>,
    /// Optional callback invoked as `(tb_idx, guest_pc, guest_size)`
    /// right after a TB is translated. Used by callers that need to
    /// track which guest pages a TB was derived from (e.g. self-
    /// modifying-code detection) without coupling this crate to that
    /// concern.
    translate_hook: Mutex<Option<Box<dyn Fn(usize, u64, u32) + Send + Sync>>>,
    /// Optional callback invoked by the dispatcher when a guest thread
    /// sets `fork_request` to a non-zero kind (1 = fork, 3 = vfork-like).
    /// Returns the value to hand back to the guest as the syscall
    /// result. Absent a hook, fork requests fail with `-ENOSYS`.
    fork_hook: Mutex<Option<Box<dyn Fn(u64) -> u64 + Send + Sync>>>,
    /// Optional predicate, queried with a guest PC right after it is
    /// translated, deciding whether the new TB must re-verify its
    /// source bytes on every entry (set once a page has been observed
    /// self-modifying). Absent a hook, no TB ever re-verifies.
    always_verify_hook: Mutex<Option<Box<dyn Fn(u64) -> bool + Send + Sync>>>,
}

// SAFETY: code_buf emit is serialized by translate_lock;
// patch methods are atomic for aligned writes; read methods
// are inherently safe.
unsafe impl<B: HostCodeGen + Send> Send for SharedState<B> {}
unsafe impl<B: HostCodeGen + Sync> Sync for SharedState<B> {}

impl<B: HostCodeGen> SharedState<B> {
    /// Get shared reference to code buffer (for patch/read).
    pub fn code_buf(&self) -> &CodeBuffer {
        // SAFETY: patch/read methods only need &self.
        unsafe { &*self.code_buf.get() }
    }

    /// Get mutable reference to code buffer.
    ///
    /// # Safety
    /// Caller must hold translate_lock.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn code_buf_mut(&self) -> &mut CodeBuffer {
        &mut *self.code_buf.get()
    }

    /// Register a callback fired after each TB translation with
    /// `(tb_idx, guest_pc, guest_size)`. Replaces any previously set hook.
    pub fn set_translate_hook(&self, hook: impl Fn(usize, u64, u32) + Send + Sync + 'static) {
        *self.translate_hook.lock().unwrap() = Some(Box::new(hook));
    }

    fn run_translate_hook(&self, tb_idx: usize, pc: u64, guest_size: u32) {
        if let Some(hook) = self.translate_hook.lock().unwrap().as_ref() {
            hook(tb_idx, pc, guest_size);
        }
    }

    /// Register the callback that services fork/vfork requests raised via
    /// `GuestCpu::fork_request`. Replaces any previously set hook.
    pub fn set_fork_hook(&self, hook: impl Fn(u64) -> u64 + Send + Sync + 'static) {
        *self.fork_hook.lock().unwrap() = Some(Box::new(hook));
    }

    fn run_fork_hook(&self, kind: u64) -> u64 {
        match self.fork_hook.lock().unwrap().as_ref() {
            Some(hook) => hook(kind),
            None => (-38i64) as u64, // ENOSYS: no fork support wired up
        }
    }

    /// Register the predicate deciding whether a freshly translated TB
    /// at a given guest PC must carry `always_verify`. Replaces any
    /// previously set hook.
    pub fn set_always_verify_hook(&self, hook: impl Fn(u64) -> bool + Send + Sync + 'static) {
        *self.always_verify_hook.lock().unwrap() = Some(Box::new(hook));
    }

    fn run_always_verify_hook(&self, pc: u64) -> bool {
        match self.always_verify_hook.lock().unwrap().as_ref() {
            Some(hook) => hook(pc),
            None => false,
        }
    }
}

/// Per-vCPU state (not shared across threads).
pub struct PerCpuState {
    pub jump_cache: JumpCache,
    pub stats: ExecStats,
}

/// Minimum remaining bytes in code buffer before refusing
/// to translate a new TB.
const MIN_CODE_BUF_REMAINING: usize = 4096;

/// Convenience wrapper for single-threaded use.
pub struct ExecEnv<B: HostCodeGen> {
    pub shared: Arc<SharedState<B>>,
    pub per_cpu: PerCpuState,
}

impl<B: HostCodeGen> ExecEnv<B> {
    pub fn new(mut backend: B) -> Self {
        let mut code_buf =
            CodeBuffer::new(16 * 1024 * 1024).expect("mmap failed");
        backend.emit_prologue(&mut code_buf);
        backend.emit_epilogue(&mut code_buf);
        let code_gen_start = code_buf.offset();

        let mut ir_ctx = Context::new();
        backend.init_context(&mut ir_ctx);

        let shared = Arc::new(SharedState {
            tb_store: TbStore::new(),
            code_buf: UnsafeCell::new(code_buf),
            backend,
            code_gen_start,
            translate_lock: Mutex::new(TranslateGuard { ir_ctx }),
            translate_hook: Mutex::new(None),
            fork_hook: Mutex::new(None),
            always_verify_hook: Mutex::new(None),
        });

        Self {
            shared,
            per_cpu: PerCpuState {
                jump_cache: JumpCache::new(),
                stats: ExecStats::default(),
            },
        }
    }

    /// Build a fresh per-CPU environment reusing an already-shared
    /// engine (TB cache, code buffer, backend). Used to start a guest
    /// thread that shares its parent's address space and TB cache.
    pub fn from_shared(shared: Arc<SharedState<B>>) -> Self {
        Self {
            shared,
            per_cpu: PerCpuState {
                jump_cache: JumpCache::new(),
                stats: ExecStats::default(),
            },
        }
    }
}
