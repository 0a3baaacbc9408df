//! Thread governor: spawns guest threads created via `clone`, grounded
//! in the teacher's `pthread_create`-shaped syscall stubs, extended to
//! real `std::thread::Builder` spawns that share the parent's
//! translated-code cache (`SharedState`) and guest address space.

use std::process;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use tcg_backend::X86_64CodeGen;
use tcg_core::context::Context;
use tcg_core::tb::{EXCP_INTERP_STRMOV, EXCP_INT3, EXCP_SYSCALL, EXCP_UD};
use tcg_exec::exec_loop::{cpu_exec_loop, ExitReason};
use tcg_exec::{ExecEnv, GuestCpu, SharedState};
use tcg_frontend::x86_64::cpu::X86Cpu;
use tcg_frontend::x86_64::gen_tb;
use tcg_frontend::x86_64::interp_fallback::{InterpFallback, StringMoveFallback};

use crate::bridge::{commit_syscall_return, read_syscall_request};
use crate::context::SharedContext;
use crate::syscall::{handle_syscall, SyscallResult, SYS_CLONE};

/// Linux flag bits this module actually inspects (clone(2) `flags`).
const CLONE_CHILD_SETTID: u64 = 0x0100_0000;
const CLONE_PARENT_SETTID: u64 = 0x0010_0000;

/// `GuestCpu` wrapper binding an `X86Cpu` to the dispatcher's control
/// fields and exit code. One exists per running guest thread (main
/// thread included).
pub struct LinuxCpu {
    pub cpu: X86Cpu,
    exit_code: i32,
}

impl LinuxCpu {
    pub fn new(cpu: X86Cpu) -> Self {
        Self { cpu, exit_code: 0 }
    }
}

impl GuestCpu for LinuxCpu {
    fn get_pc(&self) -> u64 {
        self.cpu.rip
    }

    fn get_flags(&self) -> u32 {
        0
    }

    fn gen_code(&mut self, ir: &mut Context, pc: u64, max_insns: u32) -> u32 {
        let base = self.cpu.guest_base as *const u8;
        gen_tb(ir, base, pc, max_insns)
    }

    fn env_ptr(&mut self) -> *mut u8 {
        &mut self.cpu as *mut X86Cpu as *mut u8
    }

    fn fork_request(&self) -> u64 {
        self.cpu.fork_request
    }

    fn complete_fork(&mut self, ret: u64) {
        self.cpu.fork_request = 0;
        self.cpu.quit = 0;
        self.cpu.gpr[0] = ret;
    }

    fn should_quit(&self) -> bool {
        self.cpu.quit != 0
    }

    fn hash_source(&self, pc: u64, size: u32) -> u64 {
        // SAFETY: `pc` and `size` describe a TB this CPU already
        // translated from the live guest image.
        let bytes = unsafe {
            let ptr = (self.cpu.guest_base as *const u8).add(pc as usize);
            std::slice::from_raw_parts(ptr, size.max(1) as usize)
        };
        fnv1a64(bytes)
    }
}

/// FNV-1a, used only to detect whether a guest code page changed
/// between TB entries — collision resistance against an adversary is
/// not a concern here.
fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut h = OFFSET_BASIS;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(PRIME);
    }
    h
}

/// Arguments carried across the `clone()` boundary into the new
/// thread's entry trampoline.
pub struct CloneArgs {
    pub entry: u64,
    pub stack_top: u64,
    pub tls: u64,
    /// Value placed in the child's rax (clone() returns 0 in the child).
    pub child_rax: u64,
}

/// A spawned guest thread.
pub struct ThreadHandle {
    pub tid: u64,
    join: JoinHandle<i32>,
}

impl ThreadHandle {
    /// Block until the guest thread exits, returning its exit code.
    pub fn join(self) -> i32 {
        self.join.join().unwrap_or(-1)
    }
}

/// Spawn a guest thread that starts executing at `args.entry` with the
/// given stack and TLS base, sharing the parent's TB cache.
///
/// `run` drives the new thread's dispatcher loop; it receives ownership
/// of the freshly initialized `X86Cpu` and a clone of the shared state.
pub fn spawn_guest_thread(
    shared: Arc<SharedState<X86_64CodeGen>>,
    guest_base: u64,
    tid: u64,
    args: CloneArgs,
    run: impl FnOnce(X86Cpu, Arc<SharedState<X86_64CodeGen>>) -> i32
        + Send
        + 'static,
) -> ThreadHandle {
    let mut cpu = X86Cpu::new();
    cpu.rip = args.entry;
    cpu.gpr[4] = args.stack_top; // rsp
    cpu.tls_ptr = args.tls;
    cpu.gpr[0] = args.child_rax;
    cpu.guest_base = guest_base;

    let join = std::thread::Builder::new()
        .name(format!("guest-{tid}"))
        .spawn(move || run(cpu, shared))
        .expect("failed to spawn guest thread");

    ThreadHandle { tid, join }
}

/// Drive a guest thread's dispatcher loop to completion: repeatedly
/// run `cpu_exec_loop`, service syscalls, and hand off to the
/// interpreter fallback, until the thread calls `exit`/`exit_group` or
/// sets its own `quit` field. Shared by the main thread and every
/// thread `handle_clone_syscall` spawns.
pub fn run_guest(
    ctx: &Arc<SharedContext>,
    mut env: ExecEnv<X86_64CodeGen>,
    mut lcpu: LinuxCpu,
    show_stats: bool,
) -> i32 {
    let mut strmov = StringMoveFallback;

    loop {
        let reason = unsafe { cpu_exec_loop(&mut env, &mut lcpu) };
        match reason {
            ExitReason::Exit(v) if v == EXCP_SYSCALL as usize => {
                let req = read_syscall_request(&lcpu.cpu);
                if req.nr == SYS_CLONE {
                    let child_tid = handle_clone_syscall(ctx, &lcpu.cpu, req.args);
                    commit_syscall_return(&mut lcpu.cpu, child_tid);
                    continue;
                }

                match handle_syscall(
                    &ctx.space,
                    &mut lcpu.cpu.gpr,
                    &mut lcpu.cpu.tls_ptr,
                    &mut lcpu.cpu.fork_request,
                    &ctx.mmap_next,
                    &ctx.elf_path,
                ) {
                    SyscallResult::Continue(ret) => {
                        // A fork/vfork wrapper also sets quit, forcing
                        // this TB boundary to be the last one the
                        // dispatcher inspects before running the fork
                        // protocol.
                        if lcpu.cpu.fork_request != 0 {
                            lcpu.cpu.quit = 1;
                        }
                        commit_syscall_return(&mut lcpu.cpu, ret);
                    }
                    SyscallResult::ThreadExit(code) => {
                        lcpu.exit_code = code;
                        lcpu.cpu.quit = 1;
                        commit_syscall_return(&mut lcpu.cpu, 0);
                    }
                    SyscallResult::Exit(code) => {
                        if show_stats {
                            eprint!("{}", env.per_cpu.stats);
                        }
                        process::exit(code);
                    }
                }
            }
            ExitReason::Exit(v) if v == EXCP_INTERP_STRMOV as usize => {
                let env_ptr = lcpu.env_ptr();
                let consumed = unsafe { strmov.interp_one(env_ptr) };
                if consumed == 0 {
                    if show_stats {
                        eprint!("{}", env.per_cpu.stats);
                    }
                    eprintln!("interpreter fallback failed at pc={:#x}", lcpu.cpu.rip);
                    process::exit(1);
                }
            }
            ExitReason::Exit(v) if v == EXCP_INT3 as usize => {
                if show_stats {
                    eprint!("{}", env.per_cpu.stats);
                }
                eprintln!("int3 at pc={:#x}", lcpu.cpu.rip);
                process::exit(128 + 5); // SIGTRAP
            }
            ExitReason::Exit(v) if v == EXCP_UD as usize => {
                if show_stats {
                    eprint!("{}", env.per_cpu.stats);
                }
                eprintln!("illegal instruction at pc={:#x}", lcpu.cpu.rip);
                process::exit(128 + 4); // SIGILL
            }
            ExitReason::Exit(v) => {
                if show_stats {
                    eprint!("{}", env.per_cpu.stats);
                }
                eprintln!("unexpected exit {v}");
                process::exit(1);
            }
            ExitReason::BufferFull => {
                if show_stats {
                    eprint!("{}", env.per_cpu.stats);
                }
                eprintln!("code buffer full");
                process::exit(1);
            }
            ExitReason::Quit => {
                if show_stats {
                    eprint!("{}", env.per_cpu.stats);
                }
                return lcpu.exit_code;
            }
        }
    }
}

/// Service a guest `clone(2)` syscall: allocate a tid, write it to the
/// guest's requested tid pointers, and spawn a real host thread running
/// the child from just past the `syscall` instruction, sharing the
/// parent's TB cache and address space. Returns the child's tid, as
/// `clone()` does in the parent.
///
/// Thread join is not wired to any guest-visible primitive (no futex
/// wait on `CLONE_CHILD_CLEARTID` is implemented) — the spawned thread
/// is detached and runs to completion independently.
fn handle_clone_syscall(ctx: &Arc<SharedContext>, parent: &X86Cpu, args: [u64; 6]) -> u64 {
    let flags = args[0];
    let child_stack = args[1];
    let parent_tid_ptr = args[2];
    let child_tid_ptr = args[3];
    let tls = args[4];

    let tid = ctx.next_tid.fetch_add(1, Ordering::Relaxed);

    if flags & CLONE_PARENT_SETTID != 0 && parent_tid_ptr != 0 {
        unsafe { ctx.space.write_u64(parent_tid_ptr, tid) };
    }
    if flags & CLONE_CHILD_SETTID != 0 && child_tid_ptr != 0 {
        unsafe { ctx.space.write_u64(child_tid_ptr, tid) };
    }

    let clone_args = CloneArgs {
        entry: parent.rip + 2, // past the two-byte `syscall` instruction
        stack_top: child_stack,
        tls,
        child_rax: 0,
    };
    let guest_base = ctx.space.guest_base() as u64;
    let shared = ctx.engine.clone();
    let child_ctx = ctx.clone();

    let handle = spawn_guest_thread(shared, guest_base, tid, clone_args, move |cpu, shared| {
        let env = ExecEnv::from_shared(shared);
        run_guest(&child_ctx, env, LinuxCpu::new(cpu), false)
    });
    drop(handle); // detach

    tid
}

#[cfg(test)]
mod tests {
    use super::*;
    use tcg_exec::ExecEnv;

    #[test]
    fn spawned_thread_sees_initial_register_state() {
        let env = ExecEnv::new(X86_64CodeGen::new());
        let shared = env.shared.clone();

        let handle = spawn_guest_thread(
            shared,
            0,
            7,
            CloneArgs { entry: 0x1000, stack_top: 0x2000, tls: 0x3000, child_rax: 0 },
            |cpu, _shared| {
                assert_eq!(cpu.rip, 0x1000);
                assert_eq!(cpu.gpr[4], 0x2000);
                assert_eq!(cpu.tls_ptr, 0x3000);
                0
            },
        );
        assert_eq!(handle.join(), 0);
    }
}
