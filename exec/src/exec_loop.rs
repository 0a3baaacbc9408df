use crate::{ExecEnv, GuestCpu, MIN_CODE_BUF_REMAINING};
use std::sync::atomic::Ordering;
use tcg_backend::translate::translate;
use tcg_backend::HostCodeGen;
use tcg_core::tb::{TranslationBlock, TB_EXIT_NOCHAIN};
use tracing::{debug, trace};

/// Reason the execution loop exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// TB returned a non-zero exit value.
    Exit(usize),
    /// Code buffer is full; caller should flush and retry.
    BufferFull,
    /// `GuestCpu::should_quit` returned true.
    Quit,
}

/// Main CPU execution loop.
///
/// Repeatedly looks up or translates TBs and executes them
/// until a TB returns a non-zero exit value or the code buffer
/// is exhausted.
///
/// # Safety
/// The caller must ensure `cpu.env_ptr()` points to a valid
/// CPU state struct matching the globals in the shared IR context.
pub unsafe fn cpu_exec_loop<B, C>(env: &mut ExecEnv<B>, cpu: &mut C) -> ExitReason
where
    B: HostCodeGen,
    C: GuestCpu,
{
    let mut next_tb_hint: Option<usize> = None;

    loop {
        // Dispatcher control-field check, ahead of every TB lookup: a
        // pending fork/vfork request is serviced first (it also clears
        // `quit`, which the fork wrapper sets alongside it to force
        // this inspection); only then does a standalone quit return.
        let fork_kind = cpu.fork_request();
        if fork_kind != 0 {
            let ret = env.shared.run_fork_hook(fork_kind);
            cpu.complete_fork(ret);
            continue;
        }
        if cpu.should_quit() {
            return ExitReason::Quit;
        }

        let tb_idx = match next_tb_hint.take() {
            Some(idx) => idx,
            None => {
                let pc = cpu.get_pc();
                let flags = cpu.get_flags();
                match tb_find(env, cpu, pc, flags) {
                    Some(idx) => idx,
                    None => return ExitReason::BufferFull,
                }
            }
        };

        env.per_cpu.stats.loop_iters += 1;

        // SMC re-check: a TB flagged `always_verify` re-hashes its
        // source bytes on every entry and self-invalidates on mismatch
        // rather than trusting the write-protect trap alone.
        {
            let tb = env.shared.tb_store.get(tb_idx);
            if tb.always_verify.load(Ordering::Relaxed) {
                let live_hash = cpu.hash_source(tb.pc, tb.size);
                if live_hash != tb.source_hash {
                    env.shared.tb_store.invalidate(
                        tb_idx,
                        env.shared.code_buf(),
                        &env.shared.backend,
                    );
                    next_tb_hint = None;
                    continue;
                }
            }
        }

        trace!(tb_idx, pc = cpu.get_pc(), "tb enter");
        let (exit_kind, exit_val) = cpu_tb_exec(env, cpu, tb_idx);
        match exit_kind {
            0 | 1 => {
                // goto_tb slot 0 or 1 — chainable direct branch.
                let slot = exit_kind;
                env.per_cpu.stats.chain_exit[slot] += 1;
                let pc = cpu.get_pc();
                let flags = cpu.get_flags();

                let cached = env.shared.tb_store.get(tb_idx).jmp.lock().unwrap().jmp_dest[slot];
                if let Some(dst) = cached {
                    let tb = env.shared.tb_store.get(dst);
                    if !tb.is_invalid() && tb.pc == pc && tb.flags == flags {
                        next_tb_hint = Some(dst);
                        continue;
                    }
                }

                let dst = match tb_find(env, cpu, pc, flags) {
                    Some(idx) => idx,
                    None => return ExitReason::BufferFull,
                };
                link_jump(env, tb_idx, slot, dst);
                next_tb_hint = Some(dst);
            }
            _ if exit_kind == TB_EXIT_NOCHAIN as usize => {
                // Indirect exit (goto_ptr) — single-entry cache per TB.
                env.per_cpu.stats.nochain_exit += 1;
                let pc = cpu.get_pc();
                let flags = cpu.get_flags();

                let cached = *env.shared.tb_store.get(tb_idx).exit_target.lock().unwrap();
                if let Some(dst) = cached {
                    let tb = env.shared.tb_store.get(dst);
                    if !tb.is_invalid() && tb.pc == pc && tb.flags == flags {
                        next_tb_hint = Some(dst);
                        continue;
                    }
                }

                let dst = match tb_find(env, cpu, pc, flags) {
                    Some(idx) => idx,
                    None => return ExitReason::BufferFull,
                };
                *env.shared.tb_store.get(tb_idx).exit_target.lock().unwrap() = Some(dst);
                next_tb_hint = Some(dst);
            }
            _ => {
                env.per_cpu.stats.real_exit += 1;
                return ExitReason::Exit(exit_val);
            }
        }
    }
}

/// Record a direct-link edge from `src` TB's exit `slot` to `dst`, and
/// patch the `goto_tb` jump instruction in place so the next entry into
/// `src` falls straight through to `dst`'s host code.
fn link_jump<B: HostCodeGen>(env: &mut ExecEnv<B>, src: usize, slot: usize, dst: usize) {
    let src_tb = env.shared.tb_store.get(src);
    let jmp_off = match src_tb.jmp_insn_offset[slot] {
        Some(off) => off as usize,
        None => return,
    };

    {
        let mut src_jmp = src_tb.jmp.lock().unwrap();
        if src_jmp.jmp_dest[slot] == Some(dst) {
            env.per_cpu.stats.chain_already += 1;
            return;
        }
        src_jmp.jmp_dest[slot] = Some(dst);
    }

    let dst_tb = env.shared.tb_store.get(dst);
    dst_tb.jmp.lock().unwrap().jmp_list.push((src, slot));

    let target_offset = dst_tb.host_offset;
    env.shared
        .backend
        .patch_jump(env.shared.code_buf(), jmp_off, target_offset);
    env.per_cpu.stats.chain_patched += 1;
}

/// Find a TB for the given (pc, flags), translating if needed.
///
/// Returns `None` if the code buffer is too full to translate.
fn tb_find<B, C>(env: &mut ExecEnv<B>, cpu: &mut C, pc: u64, flags: u32) -> Option<usize>
where
    B: HostCodeGen,
    C: GuestCpu,
{
    // Fast path: per-CPU jump cache.
    if let Some(idx) = env.per_cpu.jump_cache.lookup(pc) {
        let tb = env.shared.tb_store.get(idx);
        if !tb.is_invalid() && tb.pc == pc && tb.flags == flags {
            env.per_cpu.stats.jc_hit += 1;
            return Some(idx);
        }
    }

    // Slow path: shared hash table.
    if let Some(idx) = env.shared.tb_store.lookup(pc, flags) {
        env.per_cpu.jump_cache.insert(pc, idx);
        env.per_cpu.stats.ht_hit += 1;
        return Some(idx);
    }

    // Miss: translate a new TB.
    env.per_cpu.stats.translate += 1;
    tb_gen_code(env, cpu, pc, flags)
}

/// Translate guest code at `pc` into a new TB.
///
/// Returns `None` if the code buffer has insufficient space.
fn tb_gen_code<B, C>(env: &mut ExecEnv<B>, cpu: &mut C, pc: u64, flags: u32) -> Option<usize>
where
    B: HostCodeGen,
    C: GuestCpu,
{
    let mut guard = env.shared.translate_lock.lock().unwrap();

    // SAFETY: translate_lock is held; alloc only appends.
    if env.shared.code_buf().remaining() < MIN_CODE_BUF_REMAINING {
        return None;
    }
    let tb_idx = unsafe { env.shared.tb_store.alloc(pc, flags, 0) };

    guard.ir_ctx.reset();
    guard.ir_ctx.tb_idx = tb_idx as u32;
    let guest_size = cpu.gen_code(
        &mut guard.ir_ctx,
        pc,
        TranslationBlock::max_insns(0),
    );
    let always_verify = env.shared.run_always_verify_hook(pc);
    let source_hash = if always_verify {
        cpu.hash_source(pc, guest_size)
    } else {
        0
    };
    unsafe {
        let tb = env.shared.tb_store.get_mut(tb_idx);
        tb.size = guest_size;
        tb.source_hash = source_hash;
        tb.always_verify.store(always_verify, Ordering::Relaxed);
    }

    env.shared.backend.clear_goto_tb_offsets();

    // SAFETY: translate_lock is held, so this is the only writer
    // of the code buffer right now.
    let code_buf = unsafe { env.shared.code_buf_mut() };
    code_buf.set_writable().expect("set_writable failed");
    let host_offset = translate(&mut guard.ir_ctx, &env.shared.backend, code_buf);
    let host_size = code_buf.offset() - host_offset;
    code_buf.set_executable().expect("set_executable failed");

    let offsets = env.shared.backend.goto_tb_offsets();
    unsafe {
        let tb = env.shared.tb_store.get_mut(tb_idx);
        tb.host_offset = host_offset;
        tb.host_size = host_size;
        for (i, &(jmp, reset)) in offsets.iter().enumerate().take(2) {
            tb.set_jmp_insn_offset(i, jmp as u32);
            tb.set_jmp_reset_offset(i, reset as u32);
        }
    }

    env.shared.tb_store.insert(tb_idx);
    env.per_cpu.jump_cache.insert(pc, tb_idx);
    env.shared.run_translate_hook(tb_idx, pc, guest_size);

    debug!(tb_idx, pc, guest_size, host_size, "translated new tb");
    Some(tb_idx)
}

/// Execute a single TB and return `(chain_slot_or_nochain, payload)`
/// as decoded by `tcg_core::tb::decode_tb_exit`.
///
/// # Safety
/// Called from the unsafe `cpu_exec_loop`.
unsafe fn cpu_tb_exec<B, C>(env: &mut ExecEnv<B>, cpu: &mut C, tb_idx: usize) -> (usize, usize)
where
    B: HostCodeGen,
    C: GuestCpu,
{
    let tb = env.shared.tb_store.get(tb_idx);
    tb.in_use.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    let tb_ptr = env.shared.code_buf().ptr_at(tb.host_offset);
    let env_ptr = cpu.env_ptr();

    // Prologue signature:
    //   fn(env: *mut u8, tb_ptr: *const u8) -> usize
    let prologue_fn: unsafe extern "C" fn(*mut u8, *const u8) -> usize =
        core::mem::transmute(env.shared.code_buf().base_ptr());
    let raw = prologue_fn(env_ptr, tb_ptr);
    tb.in_use.fetch_sub(1, std::sync::atomic::Ordering::AcqRel);

    tcg_core::tb::decode_tb_exit(raw)
}
