//! Multi-threaded TCG (MTTCG) concurrent execution tests.

use std::thread;

use tcg_backend::X86_64CodeGen;
use tcg_core::tb::EXCP_SYSCALL;
use tcg_exec::exec_loop::{cpu_exec_loop_mt, ExitReason};
use tcg_exec::{ExecEnv, PerCpuState};

use super::{add_ri8, add_rr, asm, cmp_rr, jne8, movi, syscall, TestCpu};

const RCX: u8 = 1;
const RDX: u8 = 2;
const RBX: u8 = 3;

fn new_per_cpu() -> PerCpuState {
    PerCpuState {
        jump_cache: tcg_core::tb::JumpCache::new(),
        stats: tcg_exec::ExecStats::default(),
    }
}

/// Two vCPU threads each run an independent sum loop on
/// the same shared TB cache. Verifies correct results and
/// no panics from concurrent access.
#[test]
fn test_mt_sum_loop() {
    let body = asm(&[&add_ri8(RCX, 1), &add_rr(RDX, RCX), &cmp_rr(RCX, RBX)]);
    let back = -((body.len() + 2) as i8);
    let code = asm(&[&body, &jne8(back), &syscall()]);

    let env = ExecEnv::new(X86_64CodeGen::new());
    let shared = env.shared.clone();

    let code1 = code.clone();
    let shared1 = shared.clone();
    let h1 = thread::spawn(move || {
        let mut cpu = TestCpu::new(&code1);
        cpu.cpu.gpr[RBX as usize] = 100; // sum 1..=100
        let mut pc = new_per_cpu();
        let r = unsafe { cpu_exec_loop_mt(&shared1, &mut pc, &mut cpu) };
        assert_eq!(r, ExitReason::Exit(EXCP_SYSCALL as usize));
        assert_eq!(cpu.cpu.gpr[RDX as usize], 5050);
    });

    let code2 = code.clone();
    let shared2 = shared.clone();
    let h2 = thread::spawn(move || {
        let mut cpu = TestCpu::new(&code2);
        cpu.cpu.gpr[RBX as usize] = 200; // sum 1..=200
        let mut pc = new_per_cpu();
        let r = unsafe { cpu_exec_loop_mt(&shared2, &mut pc, &mut cpu) };
        assert_eq!(r, ExitReason::Exit(EXCP_SYSCALL as usize));
        assert_eq!(cpu.cpu.gpr[RDX as usize], 20100);
    });

    h1.join().unwrap();
    h2.join().unwrap();
}

/// Two vCPU threads execute the same code, verifying that
/// TBs are shared (translated only once).
#[test]
fn test_shared_tb_cache() {
    let code = asm(&[&movi(RCX, 42), &syscall()]);

    let env = ExecEnv::new(X86_64CodeGen::new());
    let shared = env.shared.clone();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let c = code.clone();
        let s = shared.clone();
        handles.push(thread::spawn(move || {
            let mut cpu = TestCpu::new(&c);
            let mut pc = new_per_cpu();
            let r = unsafe { cpu_exec_loop_mt(&s, &mut pc, &mut cpu) };
            assert_eq!(r, ExitReason::Exit(EXCP_SYSCALL as usize));
            assert_eq!(cpu.cpu.gpr[RCX as usize], 42);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // TB should be translated only once (or at most a few
    // times due to races before double-check kicks in).
    assert!(shared.tb_store.len() <= 4);
}

/// Multiple threads concurrently look up the same TB.
#[test]
fn test_concurrent_tb_lookup() {
    let code = asm(&[&movi(RCX, 1), &syscall()]);

    let env = ExecEnv::new(X86_64CodeGen::new());
    let shared = env.shared.clone();

    // Pre-translate by running once.
    {
        let mut cpu = TestCpu::new(&code);
        let mut pc = new_per_cpu();
        unsafe {
            cpu_exec_loop_mt(&shared, &mut pc, &mut cpu);
        }
    }
    assert_eq!(shared.tb_store.len(), 1);

    // Now spawn threads that all look up the same TB.
    let mut handles = Vec::new();
    for _ in 0..8 {
        let c = code.clone();
        let s = shared.clone();
        handles.push(thread::spawn(move || {
            let mut cpu = TestCpu::new(&c);
            let mut pc = new_per_cpu();
            let r = unsafe { cpu_exec_loop_mt(&s, &mut pc, &mut cpu) };
            assert_eq!(r, ExitReason::Exit(EXCP_SYSCALL as usize));
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    // No new TBs should have been created.
    assert_eq!(shared.tb_store.len(), 1);
}

/// Multiple threads concurrently chain TBs.
#[test]
fn test_concurrent_chaining() {
    let body = asm(&[&add_ri8(RCX, 1), &cmp_rr(RCX, RBX)]);
    let back = -((body.len() + 2) as i8);
    let code = asm(&[&body, &jne8(back), &syscall()]);

    let env = ExecEnv::new(X86_64CodeGen::new());
    let shared = env.shared.clone();

    let mut handles = Vec::new();
    for i in 0..4 {
        let c = code.clone();
        let s = shared.clone();
        handles.push(thread::spawn(move || {
            let mut cpu = TestCpu::new(&c);
            cpu.cpu.gpr[RBX as usize] = 50 + i as u64;
            let mut pc = new_per_cpu();
            let r = unsafe { cpu_exec_loop_mt(&s, &mut pc, &mut cpu) };
            assert_eq!(r, ExitReason::Exit(EXCP_SYSCALL as usize));
            assert_eq!(cpu.cpu.gpr[RCX as usize], 50 + i as u64);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
}

/// Concurrent translation: multiple threads trigger
/// translation simultaneously.
#[test]
fn test_concurrent_translation() {
    // Each thread runs a different loop count, but same code.
    let body = asm(&[&add_ri8(RCX, 1), &add_rr(RDX, RCX), &cmp_rr(RCX, RBX)]);
    let back = -((body.len() + 2) as i8);
    let code = asm(&[&body, &jne8(back), &syscall()]);

    let env = ExecEnv::new(X86_64CodeGen::new());
    let shared = env.shared.clone();

    let mut handles = Vec::new();
    for i in 0..4 {
        let c = code.clone();
        let s = shared.clone();
        handles.push(thread::spawn(move || {
            let mut cpu = TestCpu::new(&c);
            cpu.cpu.gpr[RBX as usize] = 10 * (i + 1) as u64;
            let mut pc = new_per_cpu();
            let r = unsafe { cpu_exec_loop_mt(&s, &mut pc, &mut cpu) };
            assert_eq!(r, ExitReason::Exit(EXCP_SYSCALL as usize));
            let n = cpu.cpu.gpr[RBX as usize];
            let expected = n * (n + 1) / 2;
            assert_eq!(cpu.cpu.gpr[RDX as usize], expected);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
}
