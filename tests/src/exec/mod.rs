//! Integration tests for the tcg-exec execution loop.

mod mttcg;

use tcg_backend::X86_64CodeGen;
use tcg_core::context::Context;
use tcg_core::tb::{EXCP_INT3, EXCP_SYSCALL};
use tcg_core::TempIdx;
use tcg_exec::exec_loop::{cpu_exec_loop, ExitReason};
use tcg_exec::{ExecEnv, GuestCpu};
use tcg_frontend::x86_64::cpu::{X86Cpu, NUM_GPRS};
use tcg_frontend::x86_64::{X86DisasContext, X86Translator};
use tcg_frontend::{DisasJumpType, TranslatorOps};

/// Test wrapper: X86Cpu + guest code buffer.
pub(crate) struct TestCpu {
    pub(crate) cpu: X86Cpu,
    code: Vec<u8>,
}

impl TestCpu {
    pub(crate) fn new(code: &[u8]) -> Self {
        Self {
            cpu: X86Cpu::new(),
            code: code.to_vec(),
        }
    }
}

impl GuestCpu for TestCpu {
    fn get_pc(&self) -> u64 {
        self.cpu.rip
    }

    fn get_flags(&self) -> u32 {
        0
    }

    fn gen_code(&mut self, ir: &mut Context, pc: u64, max_insns: u32) -> u32 {
        let base = self.code.as_ptr();
        let mut d = X86DisasContext::new(pc, base);
        d.base.max_insns = max_insns;

        if ir.nb_globals() == 0 {
            X86Translator::init_disas_context(&mut d, ir);
        } else {
            d.env = TempIdx(0);
            for i in 0..NUM_GPRS {
                d.gpr[i] = TempIdx(1 + i as u32);
            }
            d.rip = TempIdx(1 + NUM_GPRS as u32);
            d.rflags = TempIdx(2 + NUM_GPRS as u32);
            d.cc_op = TempIdx(3 + NUM_GPRS as u32);
            d.cc_src = TempIdx(4 + NUM_GPRS as u32);
            d.cc_dst = TempIdx(5 + NUM_GPRS as u32);
        }

        X86Translator::tb_start(&mut d, ir);
        loop {
            X86Translator::insn_start(&mut d, ir);
            X86Translator::translate_insn(&mut d, ir);
            if d.base.is_jmp != DisasJumpType::Next {
                break;
            }
            if d.base.num_insns >= d.base.max_insns {
                d.base.is_jmp = DisasJumpType::TooMany;
                break;
            }
        }
        X86Translator::tb_stop(&mut d, ir);
        (d.base.pc_next - pc) as u32
    }

    fn env_ptr(&mut self) -> *mut u8 {
        &mut self.cpu as *mut X86Cpu as *mut u8
    }
}

// ── x86_64 instruction encoding helpers (register-only subset) ──
//
// Register numbers follow X86Cpu::gpr indexing: 0=rax 1=rcx 2=rdx
// 3=rbx 6=rsi 7=rdi. rsp(4)/rbp(5) are avoided since these tests
// never touch guest memory.

pub(crate) fn movi(reg: u8, imm: u64) -> Vec<u8> {
    let mut v = vec![0x48, 0xB8 + reg];
    v.extend_from_slice(&imm.to_le_bytes());
    v
}

pub(crate) fn add_rr(dst: u8, src: u8) -> Vec<u8> {
    vec![0x48, 0x01, 0xC0 | (src << 3) | dst]
}

pub(crate) fn add_ri8(dst: u8, imm: i8) -> Vec<u8> {
    vec![0x48, 0x83, 0xC0 | dst, imm as u8]
}

pub(crate) fn sub_ri8(dst: u8, imm: i8) -> Vec<u8> {
    vec![0x48, 0x83, 0xE8 | dst, imm as u8]
}

pub(crate) fn cmp_rr(a: u8, b: u8) -> Vec<u8> {
    vec![0x48, 0x39, 0xC0 | (b << 3) | a]
}

/// jmp rel8 (relative to the byte after this instruction).
pub(crate) fn jmp8(rel: i8) -> Vec<u8> {
    vec![0xEB, rel as u8]
}

/// jcc rel8 with 0x70-based tttn condition nibble.
fn jcc8(tttn: u8, rel: i8) -> Vec<u8> {
    vec![0x70 + tttn, rel as u8]
}

pub(crate) fn je8(rel: i8) -> Vec<u8> {
    jcc8(0x4, rel)
}
pub(crate) fn jne8(rel: i8) -> Vec<u8> {
    jcc8(0x5, rel)
}
pub(crate) fn jl8(rel: i8) -> Vec<u8> {
    jcc8(0xC, rel)
}
pub(crate) fn jge8(rel: i8) -> Vec<u8> {
    jcc8(0xD, rel)
}

pub(crate) fn syscall() -> Vec<u8> {
    vec![0x0F, 0x05]
}

pub(crate) fn int3() -> Vec<u8> {
    vec![0xCC]
}

const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RBX: u8 = 3;

fn asm(chunks: &[&[u8]]) -> Vec<u8> {
    chunks.concat()
}

// ── Helper ──────────────────────────────────────────────────

fn run(code: &[u8], setup: impl FnOnce(&mut TestCpu)) -> TestCpu {
    let mut t = TestCpu::new(code);
    setup(&mut t);
    let mut env = ExecEnv::new(X86_64CodeGen::new());
    let r = unsafe { cpu_exec_loop(&mut env, &mut t) };
    assert_eq!(
        r,
        ExitReason::Exit(EXCP_SYSCALL as usize),
        "expected syscall exit"
    );
    t
}

fn run_env(
    code: &[u8],
    setup: impl FnOnce(&mut TestCpu),
) -> (TestCpu, ExecEnv<X86_64CodeGen>) {
    let mut t = TestCpu::new(code);
    setup(&mut t);
    let mut env = ExecEnv::new(X86_64CodeGen::new());
    let r = unsafe { cpu_exec_loop(&mut env, &mut t) };
    assert_eq!(r, ExitReason::Exit(EXCP_SYSCALL as usize));
    (t, env)
}

// ── Tests ────────────────────────────────────────────────────

/// Single TB that exits immediately via syscall.
#[test]
fn test_exec_loop_simple() {
    let t = run(&asm(&[&movi(RCX, 42), &syscall()]), |_| {});
    assert_eq!(t.cpu.gpr[RCX as usize], 42);
}

#[test]
fn test_exec_loop_two_tbs() {
    let (t, env) = run_env(&asm(&[&movi(RCX, 10), &syscall()]), |_| {});
    assert_eq!(t.cpu.gpr[RCX as usize], 10);
    assert_eq!(env.shared.tb_store.len(), 1);
}

/// Execute the same TB twice to verify cache hit.
#[test]
fn test_exec_loop_cache_hit() {
    let code = asm(&[&movi(RCX, 5), &syscall()]);
    let mut t = TestCpu::new(&code);
    let mut env = ExecEnv::new(X86_64CodeGen::new());

    let r1 = unsafe { cpu_exec_loop(&mut env, &mut t) };
    assert_eq!(r1, ExitReason::Exit(EXCP_SYSCALL as usize));
    assert_eq!(t.cpu.gpr[RCX as usize], 5);
    assert_eq!(env.shared.tb_store.len(), 1);

    t.cpu.rip = 0;
    t.cpu.gpr[RCX as usize] = 0;
    let r2 = unsafe { cpu_exec_loop(&mut env, &mut t) };
    assert_eq!(r2, ExitReason::Exit(EXCP_SYSCALL as usize));
    assert_eq!(t.cpu.gpr[RCX as usize], 5);
    assert_eq!(env.shared.tb_store.len(), 1);
}

/// Loop computing 1+2+...+N.
///
///   add  rcx, 1
///   add  rdx, rcx
///   cmp  rcx, rbx
///   jne  -back to add rcx,1
///   syscall
#[test]
fn test_exec_loop_sum() {
    let body = asm(&[&add_ri8(RCX, 1), &add_rr(RDX, RCX), &cmp_rr(RCX, RBX)]);
    let back = -((body.len() + 2) as i8);
    let code = asm(&[&body, &jne8(back), &syscall()]);
    let t = run(&code, |t| {
        t.cpu.gpr[RBX as usize] = 5;
    });
    assert_eq!(t.cpu.gpr[RCX as usize], 5);
    assert_eq!(t.cpu.gpr[RDX as usize], 15); // 1+2+3+4+5
}

/// Countdown: rcx starts at N, decrements to 0, then exits.
#[test]
fn test_countdown_loop() {
    let body = asm(&[&sub_ri8(RCX, 1), &cmp_rr(RCX, RDX)]);
    let back = -((body.len() + 2) as i8);
    let code = asm(&[&body, &jne8(back), &syscall()]);
    let t = run(&code, |t| {
        t.cpu.gpr[RCX as usize] = 100;
        t.cpu.gpr[RDX as usize] = 0;
    });
    assert_eq!(t.cpu.gpr[RCX as usize], 0);
}

/// jmp forward skip: jump over dead code.
///
///   movi rcx, 1
///   jmp  +len(dead)
///   movi rcx, 99     # dead
///   add  rdx, rcx
///   syscall
#[test]
fn test_jmp_forward_skip() {
    let dead = movi(RCX, 99);
    let code = asm(&[
        &movi(RCX, 1),
        &jmp8(dead.len() as i8),
        &dead,
        &add_rr(RDX, RCX),
        &add_ri8(RDX, 10),
        &syscall(),
    ]);
    let (t, env) = run_env(&code, |_| {});
    assert_eq!(t.cpu.gpr[RCX as usize], 1); // not 99
    assert_eq!(t.cpu.gpr[RDX as usize], 11); // 1 + 10
    assert_eq!(env.shared.tb_store.len(), 2);
}

/// jmp chain: TB0 -> TB1 -> TB2 -> exit.
#[test]
fn test_jmp_chain_three_tbs() {
    let tail1 = asm(&[&syscall()]);
    let body2 = asm(&[&movi(RDX, 20)]);
    let tail2 = asm(&[&syscall()]);
    let code = asm(&[
        &movi(RCX, 10),
        &jmp8(tail1.len() as i8),
        &tail1,
        &body2,
        &jmp8(tail2.len() as i8),
        &tail2,
        &add_rr(RBX, RCX),
        &add_rr(RBX, RDX),
        &syscall(),
    ]);
    let (t, env) = run_env(&code, |_| {});
    assert_eq!(t.cpu.gpr[RCX as usize], 10);
    assert_eq!(t.cpu.gpr[RDX as usize], 20);
    assert_eq!(t.cpu.gpr[RBX as usize], 30);
    assert_eq!(env.shared.tb_store.len(), 3);
}

/// Conditional path: je selects between two code paths.
///
///   cmp  rcx, rbx
///   je   path_b
///   path_a: movi rdx, 200; jmp tail
///   path_b: movi rdx, 100
///   tail: syscall
#[test]
fn test_conditional_path_taken() {
    let path_a_body = asm(&[&movi(RDX, 200)]);
    let path_b = asm(&[&movi(RDX, 100)]);
    let path_a = asm(&[&path_a_body, &jmp8(path_b.len() as i8)]);
    let code = asm(&[&cmp_rr(RCX, RBX), &je8(path_a.len() as i8), &path_a, &path_b, &syscall()]);
    let t = run(&code, |t| {
        t.cpu.gpr[RCX as usize] = 0;
        t.cpu.gpr[RBX as usize] = 0; // rcx == rbx -> branch taken -> path B
    });
    assert_eq!(t.cpu.gpr[RDX as usize], 100); // path B
}

#[test]
fn test_conditional_path_not_taken() {
    let path_a_body = asm(&[&movi(RDX, 200)]);
    let path_b = asm(&[&movi(RDX, 100)]);
    let path_a = asm(&[&path_a_body, &jmp8(path_b.len() as i8)]);
    let code = asm(&[&cmp_rr(RCX, RBX), &je8(path_a.len() as i8), &path_a, &path_b, &syscall()]);
    let t = run(&code, |t| {
        t.cpu.gpr[RCX as usize] = 1;
        t.cpu.gpr[RBX as usize] = 0; // rcx != rbx -> fall through -> path A
    });
    assert_eq!(t.cpu.gpr[RDX as usize], 200); // path A
}

/// Nested loop: outer runs M times, inner runs N times each.
/// rax accumulates total inner iterations (M * N); rsi holds the
/// outer limit so it doesn't collide with rcx (inner limit).
///
///   outer_top: movi rdx, 0
///   inner_top: add rax,1; add rdx,1; cmp rdx,rcx; jne inner_top
///              add rbx,1; cmp rbx,rsi; jne outer_top
///   syscall
#[test]
fn test_nested_loop() {
    const OUTER_LIMIT: u8 = 6; // rsi

    let inner_body = asm(&[&add_ri8(RAX, 1), &add_ri8(RDX, 1), &cmp_rr(RDX, RCX)]);
    let inner_back = -((inner_body.len() + 2) as i8);
    let inner = asm(&[&inner_body, &jne8(inner_back)]);

    let outer_tail = asm(&[&add_ri8(RBX, 1), &cmp_rr(RBX, OUTER_LIMIT)]);
    let outer_back = -((asm(&[&movi(RDX, 0)]).len() + inner.len() + outer_tail.len() + 2) as i8);

    let code = asm(&[
        &movi(RDX, 0),
        &inner,
        &outer_tail,
        &jne8(outer_back),
        &syscall(),
    ]);
    let t = run(&code, |t| {
        t.cpu.gpr[RCX as usize] = 3; // inner limit
        t.cpu.gpr[OUTER_LIMIT as usize] = 4; // outer limit
    });
    assert_eq!(t.cpu.gpr[RBX as usize], 4);
    assert_eq!(t.cpu.gpr[RAX as usize], 12); // 4 * 3
}

/// Register pipeline across multiple TBs joined by unconditional jumps.
#[test]
fn test_multi_tb_register_pipeline() {
    let seg1 = asm(&[&movi(RCX, 1)]);
    let seg2 = asm(&[&movi(RDX, 2)]);
    let seg3 = asm(&[&movi(RBX, 3)]);
    let tail = asm(&[&add_rr(RAX, RCX), &add_rr(RAX, RDX), &add_rr(RAX, RBX), &syscall()]);
    let code = asm(&[
        &seg1,
        &jmp8(seg2.len() as i8),
        &seg2,
        &jmp8(seg3.len() as i8),
        &seg3,
        &jmp8(tail.len() as i8),
        &tail,
    ]);
    let (t, env) = run_env(&code, |_| {});
    assert_eq!(t.cpu.gpr[RCX as usize], 1);
    assert_eq!(t.cpu.gpr[RDX as usize], 2);
    assert_eq!(t.cpu.gpr[RBX as usize], 3);
    assert_eq!(t.cpu.gpr[RAX as usize], 6);
    assert_eq!(env.shared.tb_store.len(), 4);
}

/// Larger sum loop: stress-tests TB cache with many iterations.
#[test]
fn test_large_sum_loop() {
    let body = asm(&[&add_ri8(RCX, 1), &add_rr(RDX, RCX), &cmp_rr(RCX, RBX)]);
    let back = -((body.len() + 2) as i8);
    let code = asm(&[&body, &jne8(back), &syscall()]);
    let t = run(&code, |t| {
        t.cpu.gpr[RBX as usize] = 100;
    });
    assert_eq!(t.cpu.gpr[RCX as usize], 100);
    assert_eq!(t.cpu.gpr[RDX as usize], 5050);
}

/// Loop exit via jl/jge style signed comparison.
#[test]
fn test_jl_loop() {
    let body = asm(&[&add_ri8(RCX, 1), &cmp_rr(RCX, RBX)]);
    let back = -((body.len() + 2) as i8);
    let code = asm(&[&body, &jl8(back), &syscall()]);
    let t = run(&code, |t| {
        t.cpu.gpr[RCX as usize] = (-5i64) as u64;
        t.cpu.gpr[RBX as usize] = 3;
    });
    assert_eq!(t.cpu.gpr[RCX as usize], 3);
}

/// jge exit loop: loop until rcx >= rbx.
#[test]
fn test_jge_exit_loop() {
    let body = asm(&[&add_ri8(RCX, 1), &cmp_rr(RCX, RBX)]);
    let tail = asm(&[&syscall()]);
    let jmp_len = 2; // length of the jmp8 instruction being skipped
    let back = -((body.len() + 2 + jmp_len) as i8);
    let code = asm(&[&body, &jge8(jmp_len as i8), &jmp8(back), &tail]);
    let t = run(&code, |t| {
        t.cpu.gpr[RBX as usize] = 10;
    });
    assert_eq!(t.cpu.gpr[RCX as usize], 10);
}

/// int3 exit: verify the breakpoint exit reason.
#[test]
fn test_int3_exit_code() {
    let code = asm(&[&movi(RCX, 77), &int3()]);
    let mut t = TestCpu::new(&code);
    let mut env = ExecEnv::new(X86_64CodeGen::new());
    let r = unsafe { cpu_exec_loop(&mut env, &mut t) };
    assert_eq!(r, ExitReason::Exit(EXCP_INT3 as usize));
    assert_eq!(t.cpu.gpr[RCX as usize], 77);
}

/// movi builds a 64-bit constant, then loops a fixed count.
#[test]
fn test_movi_with_loop() {
    let body = asm(&[&add_ri8(RDX, 1), &cmp_rr(RDX, RBX)]);
    let back = -((body.len() + 2) as i8);
    let code = asm(&[&movi(RCX, 0x1234_5678), &body, &jne8(back), &syscall()]);
    let t = run(&code, |t| {
        t.cpu.gpr[RBX as usize] = 5;
    });
    assert_eq!(t.cpu.gpr[RCX as usize], 0x1234_5678);
    assert_eq!(t.cpu.gpr[RDX as usize], 5);
}
