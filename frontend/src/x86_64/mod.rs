//! x86_64 frontend — Linux user-mode instruction translation.

pub mod cpu;
pub mod decode;
pub mod deferred_flags;
pub mod interp_fallback;

use crate::{DisasContextBase, DisasJumpType, TranslatorOps};
use cpu::{gpr_offset, CcOp, CC_DST_OFFSET, CC_OP_OFFSET, CC_SRC_OFFSET, NUM_GPRS, RFLAGS_OFFSET, RIP_OFFSET};
use decode::{decode_modrm, decode_prefixes, ModRm, Prefixes};
use deferred_flags::{gen_compute_cond, gen_defer, gen_defer_incdec, X86Cond};
use tcg_core::{Cond, Context, TempIdx, Type};

// ---------------------------------------------------------------
// Disassembly context
// ---------------------------------------------------------------

/// x86_64 disassembly context (extends `DisasContextBase`).
pub struct X86DisasContext {
    pub base: DisasContextBase,
    /// IR temp for the env pointer (fixed to host RBP).
    pub env: TempIdx,
    /// IR temps for guest GPRs (globals), indexed by x86 register number.
    pub gpr: [TempIdx; NUM_GPRS],
    /// IR temp for guest RIP (global).
    pub rip: TempIdx,
    /// IR temp for the raw rflags word (global, eager bits only).
    pub rflags: TempIdx,
    pub cc_op: TempIdx,
    pub cc_src: TempIdx,
    pub cc_dst: TempIdx,
    /// Pointer to guest code bytes for fetching.
    pub guest_base: *const u8,
    /// Length of the instruction being decoded, set once fully decoded.
    pub cur_insn_len: u32,
}

impl X86DisasContext {
    pub fn new(pc: u64, guest_base: *const u8) -> Self {
        Self {
            base: DisasContextBase {
                pc_first: pc,
                pc_next: pc,
                is_jmp: DisasJumpType::Next,
                num_insns: 0,
                max_insns: 512,
            },
            env: TempIdx(0),
            gpr: [TempIdx(0); NUM_GPRS],
            rip: TempIdx(0),
            rflags: TempIdx(0),
            cc_op: TempIdx(0),
            cc_src: TempIdx(0),
            cc_dst: TempIdx(0),
            guest_base,
            cur_insn_len: 0,
        }
    }
}

/// Marker type for the x86_64 translator.
pub struct X86Translator;

impl TranslatorOps for X86Translator {
    type DisasContext = X86DisasContext;

    fn init_disas_context(ctx: &mut X86DisasContext, ir: &mut Context) {
        ctx.env = ir.new_fixed(Type::I64, 5, "env"); // RBP
        for i in 0..NUM_GPRS {
            ctx.gpr[i] = ir.new_global(Type::I64, ctx.env, gpr_offset(i), "gpr");
        }
        ctx.rip = ir.new_global(Type::I64, ctx.env, RIP_OFFSET, "rip");
        ctx.rflags = ir.new_global(Type::I64, ctx.env, RFLAGS_OFFSET, "rflags");
        ctx.cc_op = ir.new_global(Type::I64, ctx.env, CC_OP_OFFSET, "cc_op");
        ctx.cc_src = ir.new_global(Type::I64, ctx.env, CC_SRC_OFFSET, "cc_src");
        ctx.cc_dst = ir.new_global(Type::I64, ctx.env, CC_DST_OFFSET, "cc_dst");
    }

    fn tb_start(_ctx: &mut X86DisasContext, _ir: &mut Context) {}

    fn insn_start(ctx: &mut X86DisasContext, ir: &mut Context) {
        ir.gen_insn_start(ctx.base.pc_next);
        ctx.base.num_insns += 1;
    }

    fn translate_insn(ctx: &mut X86DisasContext, ir: &mut Context) {
        // SAFETY: guest_base maps the loaded ELF image; pc_next is
        // within the TB's guest code range, which the loader validated.
        let (prefixes, opcode_off) = unsafe { decode_prefixes(ctx, 0) };
        let op0 = unsafe { ctx.fetch_u8(opcode_off) };

        let consumed = if op0 == 0x0F {
            let op1 = unsafe { ctx.fetch_u8(opcode_off + 1) };
            translate_0f(ctx, ir, &prefixes, opcode_off + 2, op1)
        } else {
            translate_one_byte(ctx, ir, &prefixes, opcode_off + 1, op0)
        };

        match consumed {
            Some(len) => {
                ctx.base.pc_next += len as u64;
            }
            None => {
                // Undecoded opcode: route through the minimal interpreter
                // fallback if it matches, else bail out as undefined.
                let pc_const = ir.new_const(Type::I64, ctx.base.pc_next);
                ir.gen_mov(Type::I64, ctx.rip, pc_const);
                ir.gen_exit_tb(tcg_core::tb::EXCP_UD as u64);
                ctx.base.is_jmp = DisasJumpType::NoReturn;
            }
        }
    }

    fn tb_stop(ctx: &mut X86DisasContext, ir: &mut Context) {
        match ctx.base.is_jmp {
            DisasJumpType::NoReturn => {}
            DisasJumpType::Next | DisasJumpType::TooMany => {
                let pc_const = ir.new_const(Type::I64, ctx.base.pc_next);
                ir.gen_mov(Type::I64, ctx.rip, pc_const);
                ir.gen_goto_tb(0);
                ir.gen_exit_tb(0);
            }
        }
    }

    fn base(ctx: &X86DisasContext) -> &DisasContextBase {
        &ctx.base
    }

    fn base_mut(ctx: &mut X86DisasContext) -> &mut DisasContextBase {
        &mut ctx.base
    }
}

/// Drive a full translation pass over guest bytes at `pc`, registering IR
/// globals on first use and reusing them on every later call that shares
/// `ir`. Returns the number of guest bytes the resulting block covers.
///
/// Every `GuestCpu::gen_code` implementation (the single-threaded runner,
/// guest thread entry points) wants exactly this sequence; factored out so
/// they can't drift apart.
pub fn gen_tb(ir: &mut Context, guest_base: *const u8, pc: u64, max_insns: u32) -> u32 {
    let mut d = X86DisasContext::new(pc, guest_base);
    d.base.max_insns = max_insns;

    if ir.nb_globals() == 0 {
        X86Translator::init_disas_context(&mut d, ir);
    } else {
        // Globals were registered by an earlier TB; the IR context is
        // shared across translations, so reuse the same temp indices
        // rather than re-registering them.
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

// ---------------------------------------------------------------
// Operand helpers
// ---------------------------------------------------------------

/// Resolve a ModRM operand to a `TempIdx` holding its value (loading
/// from guest memory through the flat guest-address space if needed).
fn load_rm(ctx: &mut X86DisasContext, ir: &mut Context, m: &ModRm, ty: Type) -> TempIdx {
    if !m.is_mem {
        return ctx.gpr[m.rm as usize];
    }
    let addr = effective_address(ctx, ir, m);
    let dst = ir.new_temp_tb(ty);
    ir.gen_qemu_ld(ty, dst, addr, memop_for(ty));
    dst
}

/// Store `val` into a ModRM operand (register move or guest memory write).
fn store_rm(ctx: &mut X86DisasContext, ir: &mut Context, m: &ModRm, ty: Type, val: TempIdx) {
    if !m.is_mem {
        ir.gen_mov(ty, ctx.gpr[m.rm as usize], val);
        return;
    }
    let addr = effective_address(ctx, ir, m);
    ir.gen_qemu_st(ty, val, addr, memop_for(ty));
}

fn memop_for(ty: Type) -> u32 {
    match ty {
        Type::I32 => tcg_core::MemOp::ul().bits() as u32,
        _ => tcg_core::MemOp::uq().bits() as u32,
    }
}

/// Compute the guest-virtual effective address of a memory ModRM operand
/// as a TB-scoped temp (base + index*scale + disp, or RIP + disp).
fn effective_address(ctx: &mut X86DisasContext, ir: &mut Context, m: &ModRm) -> TempIdx {
    let addr = ir.new_temp_tb(Type::I64);

    if m.rip_relative {
        let target = ctx.base.pc_next.wrapping_add(ctx.cur_insn_len as u64).wrapping_add(m.mem_disp as u64);
        let c = ir.new_const(Type::I64, target);
        ir.gen_mov(Type::I64, addr, c);
        return addr;
    }

    let mut have_base = false;
    if let Some(base) = m.mem_base {
        ir.gen_mov(Type::I64, addr, ctx.gpr[base as usize]);
        have_base = true;
    }

    if let Some(index) = m.mem_index {
        let scaled = if m.mem_scale > 1 {
            let shift = m.mem_scale.trailing_zeros() as u64;
            let shift_c = ir.new_const(Type::I64, shift);
            let tmp = ir.new_temp_tb(Type::I64);
            ir.gen_shl(Type::I64, tmp, ctx.gpr[index as usize], shift_c);
            tmp
        } else {
            ctx.gpr[index as usize]
        };
        if have_base {
            ir.gen_add(Type::I64, addr, addr, scaled);
        } else {
            ir.gen_mov(Type::I64, addr, scaled);
            have_base = true;
        }
    }

    if m.mem_disp != 0 || !have_base {
        let disp_c = ir.new_const(Type::I64, m.mem_disp as u64);
        if have_base {
            ir.gen_add(Type::I64, addr, addr, disp_c);
        } else {
            ir.gen_mov(Type::I64, addr, disp_c);
        }
    }

    addr
}

fn op_size_ty(prefixes: &Prefixes) -> Type {
    if prefixes.rex_w {
        Type::I64
    } else {
        // 16-bit operand size (0x66) is approximated as 32-bit: full
        // 16-bit register-half semantics are out of scope for this
        // translator's supported subset.
        Type::I32
    }
}

fn cc_op_for(prefixes: &Prefixes, family: CcFamily) -> CcOp {
    let w64 = prefixes.rex_w;
    match family {
        CcFamily::Add => {
            if w64 {
                CcOp::AddQ
            } else {
                CcOp::AddL
            }
        }
        CcFamily::Sub => {
            if w64 {
                CcOp::SubQ
            } else {
                CcOp::SubL
            }
        }
        CcFamily::Logic => {
            if w64 {
                CcOp::LogicQ
            } else {
                CcOp::LogicL
            }
        }
        CcFamily::Inc => {
            if w64 {
                CcOp::IncQ
            } else {
                CcOp::IncL
            }
        }
        CcFamily::Dec => {
            if w64 {
                CcOp::DecQ
            } else {
                CcOp::DecL
            }
        }
    }
}

#[derive(Clone, Copy)]
enum CcFamily {
    Add,
    Sub,
    Logic,
    Inc,
    Dec,
}

// ---------------------------------------------------------------
// One-byte opcode dispatch
// ---------------------------------------------------------------

/// Translate a one-byte-opcode instruction starting at `opcode_off - 1`.
/// Returns the total instruction length (prefixes + opcode + operands),
/// or `None` if the translator doesn't recognize it.
fn translate_one_byte(
    ctx: &mut X86DisasContext,
    ir: &mut Context,
    prefixes: &Prefixes,
    after_opcode: u32,
    op0: u8,
) -> Option<u32> {
    let ty = op_size_ty(prefixes);

    match op0 {
        // push r64
        0x50..=0x57 => {
            let reg = reg_with_rex_b(op0 - 0x50, prefixes);
            gen_push(ctx, ir, ctx.gpr[reg as usize]);
            Some(after_opcode)
        }
        // pop r64
        0x58..=0x5F => {
            let reg = reg_with_rex_b(op0 - 0x58, prefixes);
            gen_pop(ctx, ir, ctx.gpr[reg as usize]);
            Some(after_opcode)
        }
        // mov r, imm32/imm64
        0xB8..=0xBF => {
            let reg = reg_with_rex_b(op0 - 0xB8, prefixes);
            if prefixes.rex_w {
                let imm = unsafe { ctx.fetch_u64(after_opcode) };
                let c = ir.new_const(Type::I64, imm);
                ir.gen_mov(Type::I64, ctx.gpr[reg as usize], c);
                Some(after_opcode + 8)
            } else {
                let imm = unsafe { ctx.fetch_u32(after_opcode) };
                let c = ir.new_const(Type::I64, imm as u64);
                ir.gen_mov(Type::I64, ctx.gpr[reg as usize], c);
                Some(after_opcode + 4)
            }
        }
        // push imm32
        0x68 => {
            let imm = unsafe { ctx.fetch_i32(after_opcode) };
            let c = ir.new_const(Type::I64, imm as i64 as u64);
            gen_push(ctx, ir, c);
            Some(after_opcode + 4)
        }
        // push imm8
        0x6A => {
            let imm = unsafe { ctx.fetch_i8(after_opcode) };
            let c = ir.new_const(Type::I64, imm as i64 as u64);
            gen_push(ctx, ir, c);
            Some(after_opcode + 1)
        }
        // mov r/m, r (store)
        0x89 => {
            let m = unsafe { decode_modrm(ctx, prefixes, after_opcode) };
            ctx.cur_insn_len = after_opcode + m.len;
            let src = ctx.gpr[m.reg as usize];
            store_rm(ctx, ir, &m, ty, src);
            Some(after_opcode + m.len)
        }
        // mov r, r/m (load)
        0x8B => {
            let m = unsafe { decode_modrm(ctx, prefixes, after_opcode) };
            ctx.cur_insn_len = after_opcode + m.len;
            let val = load_rm(ctx, ir, &m, ty);
            ir.gen_mov(ty, ctx.gpr[m.reg as usize], val);
            Some(after_opcode + m.len)
        }
        // lea r, m
        0x8D => {
            let m = unsafe { decode_modrm(ctx, prefixes, after_opcode) };
            ctx.cur_insn_len = after_opcode + m.len;
            let addr = effective_address(ctx, ir, &m);
            ir.gen_mov(Type::I64, ctx.gpr[m.reg as usize], addr);
            Some(after_opcode + m.len)
        }
        // mov r/m, imm32
        0xC7 => {
            let m = unsafe { decode_modrm(ctx, prefixes, after_opcode) };
            ctx.cur_insn_len = after_opcode + m.len + 4;
            let imm = unsafe { ctx.fetch_i32(after_opcode + m.len) };
            let c = ir.new_const(ty, imm as i64 as u64);
            store_rm(ctx, ir, &m, ty, c);
            Some(after_opcode + m.len + 4)
        }
        // ALU r/m, r  (add/or/and/sub/xor/cmp families, store form)
        0x01 | 0x09 | 0x21 | 0x29 | 0x31 | 0x39 => {
            let m = unsafe { decode_modrm(ctx, prefixes, after_opcode) };
            ctx.cur_insn_len = after_opcode + m.len;
            let src = ctx.gpr[m.reg as usize];
            gen_alu_rm(ctx, ir, prefixes, &m, ty, alu_family(op0), src, op0);
            Some(after_opcode + m.len)
        }
        // ALU r, r/m  (load form)
        0x03 | 0x0B | 0x23 | 0x2B | 0x33 | 0x3B => {
            let m = unsafe { decode_modrm(ctx, prefixes, after_opcode) };
            ctx.cur_insn_len = after_opcode + m.len;
            let src = load_rm(ctx, ir, &m, ty);
            let dst = ctx.gpr[m.reg as usize];
            gen_alu_reg(ctx, ir, prefixes, ty, alu_family(op0), dst, src, op0);
            Some(after_opcode + m.len)
        }
        // test r/m, r
        0x85 => {
            let m = unsafe { decode_modrm(ctx, prefixes, after_opcode) };
            ctx.cur_insn_len = after_opcode + m.len;
            let a = load_rm(ctx, ir, &m, ty);
            let b = ctx.gpr[m.reg as usize];
            let tmp = ir.new_temp_tb(ty);
            ir.gen_and(ty, tmp, a, b);
            gen_defer(ir, ctx, cc_op_for(prefixes, CcFamily::Logic), tmp, tmp);
            Some(after_opcode + m.len)
        }
        // group1 r/m, imm8 (sign-extended)
        0x83 => {
            let m = unsafe { decode_modrm(ctx, prefixes, after_opcode) };
            ctx.cur_insn_len = after_opcode + m.len + 1;
            let imm = unsafe { ctx.fetch_i8(after_opcode + m.len) } as i64 as u64;
            gen_group1(ctx, ir, prefixes, &m, ty, imm);
            Some(after_opcode + m.len + 1)
        }
        // group1 r/m, imm32
        0x81 => {
            let m = unsafe { decode_modrm(ctx, prefixes, after_opcode) };
            ctx.cur_insn_len = after_opcode + m.len + 4;
            let imm = unsafe { ctx.fetch_i32(after_opcode + m.len) } as i64 as u64;
            gen_group1(ctx, ir, prefixes, &m, ty, imm);
            Some(after_opcode + m.len + 4)
        }
        // group5: inc/dec/call/jmp/push via r/m
        0xFF => {
            let m = unsafe { decode_modrm(ctx, prefixes, after_opcode) };
            ctx.cur_insn_len = after_opcode + m.len;
            translate_group5(ctx, ir, prefixes, &m, ty, after_opcode + m.len)
        }
        // call rel32
        0xE8 => {
            let rel = unsafe { ctx.fetch_i32(after_opcode) };
            let next_pc = ctx.base.pc_next + after_opcode as u64 + 4;
            let ret_c = ir.new_const(Type::I64, next_pc);
            gen_push(ctx, ir, ret_c);
            let target = (next_pc as i64 + rel as i64) as u64;
            let c = ir.new_const(Type::I64, target);
            ir.gen_mov(Type::I64, ctx.rip, c);
            ir.gen_exit_tb(0);
            ctx.base.is_jmp = DisasJumpType::NoReturn;
            Some(after_opcode + 4)
        }
        // ret
        0xC3 => {
            let ret_addr = ir.new_temp_tb(Type::I64);
            ir.gen_qemu_ld(Type::I64, ret_addr, ctx.gpr[4], tcg_core::MemOp::uq().bits() as u32);
            let eight = ir.new_const(Type::I64, 8);
            ir.gen_add(Type::I64, ctx.gpr[4], ctx.gpr[4], eight);
            ir.gen_mov(Type::I64, ctx.rip, ret_addr);
            ir.gen_exit_tb(0);
            ctx.base.is_jmp = DisasJumpType::NoReturn;
            Some(after_opcode)
        }
        // jmp rel32
        0xE9 => {
            let rel = unsafe { ctx.fetch_i32(after_opcode) };
            gen_direct_jump(ctx, ir, after_opcode as i64 + 4 + rel as i64);
            Some(after_opcode + 4)
        }
        // jmp rel8
        0xEB => {
            let rel = unsafe { ctx.fetch_i8(after_opcode) };
            gen_direct_jump(ctx, ir, after_opcode as i64 + 1 + rel as i64);
            Some(after_opcode + 1)
        }
        // jcc rel8
        0x70..=0x7F => {
            let rel = unsafe { ctx.fetch_i8(after_opcode) };
            let target = (ctx.base.pc_next as i64 + after_opcode as i64 + 1 + rel as i64) as u64;
            let fallthrough = ctx.base.pc_next + after_opcode as u64 + 1;
            gen_cond_branch(ctx, ir, X86Cond::from_tttn(op0 - 0x70), target, fallthrough);
            Some(after_opcode + 1)
        }
        // nop
        0x90 => Some(after_opcode),
        // int3
        0xCC => {
            gen_exit_with_rip(ctx, ir, ctx.base.pc_next + after_opcode as u64, tcg_core::tb::EXCP_INT3 as u64);
            Some(after_opcode)
        }
        // string move (movsb/movsd/movsq): routed through the interpreter
        // fallback rather than inlined IR. rip is set to the instruction's
        // own start byte so the interpreter can re-fetch and decode it.
        0xA4 | 0xA5 => {
            gen_exit_with_rip(ctx, ir, ctx.base.pc_next, tcg_core::tb::EXCP_INTERP_STRMOV as u64);
            Some(after_opcode)
        }
        _ => None,
    }
}

fn reg_with_rex_b(base: u8, prefixes: &Prefixes) -> u8 {
    if prefixes.rex_b {
        base | 0x8
    } else {
        base
    }
}

fn alu_family(opcode: u8) -> (CcFamily, tcg_core::Opcode) {
    use tcg_core::Opcode as O;
    match opcode {
        0x00 | 0x01 | 0x02 | 0x03 => (CcFamily::Add, O::Add),
        0x08 | 0x09 | 0x0A | 0x0B => (CcFamily::Logic, O::Or),
        0x20 | 0x21 | 0x22 | 0x23 => (CcFamily::Logic, O::And),
        0x28 | 0x29 | 0x2A | 0x2B => (CcFamily::Sub, O::Sub),
        0x30 | 0x31 | 0x32 | 0x33 => (CcFamily::Logic, O::Xor),
        0x38 | 0x39 | 0x3A | 0x3B => (CcFamily::Sub, O::Sub),
        _ => (CcFamily::Add, O::Add),
    }
}

fn is_cmp_opcode(opcode: u8) -> bool {
    matches!(opcode, 0x38 | 0x39 | 0x3A | 0x3B)
}

/// `r/m OP= reg`, writing the result back to `r/m` unless this is `cmp`.
fn gen_alu_rm(
    ctx: &mut X86DisasContext,
    ir: &mut Context,
    prefixes: &Prefixes,
    m: &ModRm,
    ty: Type,
    (family, opc): (CcFamily, tcg_core::Opcode),
    src: TempIdx,
    opcode: u8,
) {
    let a = load_rm(ctx, ir, m, ty);
    let dst = ir.new_temp_tb(ty);
    emit_alu_op(ir, opc, ty, dst, a, src);
    gen_defer(ir, ctx, cc_op_for(prefixes, family), dst, src);
    if !is_cmp_opcode(opcode) {
        store_rm(ctx, ir, m, ty, dst);
    }
}

fn gen_alu_reg(
    ctx: &mut X86DisasContext,
    ir: &mut Context,
    prefixes: &Prefixes,
    ty: Type,
    (family, opc): (CcFamily, tcg_core::Opcode),
    dst: TempIdx,
    src: TempIdx,
    opcode: u8,
) {
    let result = ir.new_temp_tb(ty);
    emit_alu_op(ir, opc, ty, result, dst, src);
    gen_defer(ir, ctx, cc_op_for(prefixes, family), result, src);
    if !is_cmp_opcode(opcode) {
        ir.gen_mov(ty, dst, result);
    }
}

fn emit_alu_op(ir: &mut Context, opc: tcg_core::Opcode, ty: Type, d: TempIdx, a: TempIdx, b: TempIdx) {
    use tcg_core::Opcode as O;
    match opc {
        O::Add => ir.gen_add(ty, d, a, b),
        O::Sub => ir.gen_sub(ty, d, a, b),
        O::And => ir.gen_and(ty, d, a, b),
        O::Or => ir.gen_or(ty, d, a, b),
        O::Xor => ir.gen_xor(ty, d, a, b),
        _ => ir.gen_add(ty, d, a, b),
    };
}

/// Group1 (0x80/0x81/0x83): reg field of ModRM selects add/or/adc/sbb/
/// and/sub/xor/cmp. `adc`/`sbb` are approximated without carry-in.
fn gen_group1(ctx: &mut X86DisasContext, ir: &mut Context, prefixes: &Prefixes, m: &ModRm, ty: Type, imm: u64) {
    let imm_c = ir.new_const(ty, imm);
    let a = load_rm(ctx, ir, m, ty);
    let dst = ir.new_temp_tb(ty);
    let (family, opc, is_cmp) = match m.reg & 0x7 {
        0 => (CcFamily::Add, tcg_core::Opcode::Add, false),
        1 => (CcFamily::Logic, tcg_core::Opcode::Or, false),
        2 => (CcFamily::Add, tcg_core::Opcode::Add, false), // adc, carry-in ignored
        3 => (CcFamily::Sub, tcg_core::Opcode::Sub, false), // sbb, borrow-in ignored
        4 => (CcFamily::Logic, tcg_core::Opcode::And, false),
        5 => (CcFamily::Sub, tcg_core::Opcode::Sub, false),
        6 => (CcFamily::Logic, tcg_core::Opcode::Xor, false),
        _ => (CcFamily::Sub, tcg_core::Opcode::Sub, true), // cmp
    };
    emit_alu_op(ir, opc, ty, dst, a, imm_c);
    gen_defer(ir, ctx, cc_op_for(prefixes, family), dst, imm_c);
    if !is_cmp {
        store_rm(ctx, ir, m, ty, dst);
    }
}

fn translate_group5(
    ctx: &mut X86DisasContext,
    ir: &mut Context,
    prefixes: &Prefixes,
    m: &ModRm,
    ty: Type,
    after: u32,
) -> Option<u32> {
    match m.reg & 0x7 {
        // inc
        0 => {
            let a = load_rm(ctx, ir, m, ty);
            let one = ir.new_const(ty, 1);
            let dst = ir.new_temp_tb(ty);
            ir.gen_add(ty, dst, a, one);
            gen_defer_incdec(ir, ctx, cc_op_for(prefixes, CcFamily::Inc), dst);
            store_rm(ctx, ir, m, ty, dst);
            Some(after)
        }
        // dec
        1 => {
            let a = load_rm(ctx, ir, m, ty);
            let one = ir.new_const(ty, 1);
            let dst = ir.new_temp_tb(ty);
            ir.gen_sub(ty, dst, a, one);
            gen_defer_incdec(ir, ctx, cc_op_for(prefixes, CcFamily::Dec), dst);
            store_rm(ctx, ir, m, ty, dst);
            Some(after)
        }
        // call r/m (indirect)
        2 => {
            let target = load_rm(ctx, ir, m, Type::I64);
            let next_pc = ctx.base.pc_next + after as u64;
            let ret_c = ir.new_const(Type::I64, next_pc);
            gen_push(ctx, ir, ret_c);
            ir.gen_mov(Type::I64, ctx.rip, target);
            ir.gen_goto_ptr(target);
            ctx.base.is_jmp = DisasJumpType::NoReturn;
            Some(after)
        }
        // jmp r/m (indirect)
        4 => {
            let target = load_rm(ctx, ir, m, Type::I64);
            ir.gen_mov(Type::I64, ctx.rip, target);
            ir.gen_goto_ptr(target);
            ctx.base.is_jmp = DisasJumpType::NoReturn;
            Some(after)
        }
        // push r/m
        6 => {
            let val = load_rm(ctx, ir, m, Type::I64);
            gen_push(ctx, ir, val);
            Some(after)
        }
        _ => None,
    }
}

fn gen_push(ctx: &mut X86DisasContext, ir: &mut Context, val: TempIdx) {
    let eight = ir.new_const(Type::I64, 8);
    ir.gen_sub(Type::I64, ctx.gpr[4], ctx.gpr[4], eight);
    ir.gen_qemu_st(Type::I64, val, ctx.gpr[4], tcg_core::MemOp::uq().bits() as u32);
}

fn gen_pop(ctx: &mut X86DisasContext, ir: &mut Context, dst: TempIdx) {
    ir.gen_qemu_ld(Type::I64, dst, ctx.gpr[4], tcg_core::MemOp::uq().bits() as u32);
    let eight = ir.new_const(Type::I64, 8);
    ir.gen_add(Type::I64, ctx.gpr[4], ctx.gpr[4], eight);
}

fn gen_direct_jump(ctx: &mut X86DisasContext, ir: &mut Context, rel_from_opcode_end: i64) {
    let target = (ctx.base.pc_next as i64 + rel_from_opcode_end) as u64;
    let c = ir.new_const(Type::I64, target);
    ir.gen_mov(Type::I64, ctx.rip, c);
    ir.gen_goto_tb(0);
    ir.gen_exit_tb(0);
    ctx.base.is_jmp = DisasJumpType::NoReturn;
}

fn gen_exit_with_rip(ctx: &mut X86DisasContext, ir: &mut Context, rip: u64, val: u64) {
    let c = ir.new_const(Type::I64, rip);
    ir.gen_mov(Type::I64, ctx.rip, c);
    ir.gen_exit_tb(val);
    ctx.base.is_jmp = DisasJumpType::NoReturn;
}

/// Conditional branch: taken side falls through the TB boundary with
/// `goto_tb` slot 0, not-taken side with slot 1 — both chainable once
/// their destinations are translated.
fn gen_cond_branch(ctx: &mut X86DisasContext, ir: &mut Context, cond: X86Cond, target: u64, fallthrough: u64) {
    let taken = gen_compute_cond(ir, ctx, cond);
    let zero = ir.new_const(Type::I64, 0);
    let label = ir.new_label();
    ir.gen_brcond(Type::I64, taken, zero, Cond::Eq, label);

    let target_c = ir.new_const(Type::I64, target);
    ir.gen_mov(Type::I64, ctx.rip, target_c);
    ir.gen_goto_tb(0);
    ir.gen_exit_tb(0);

    ir.gen_set_label(label);
    let fallthrough_c = ir.new_const(Type::I64, fallthrough);
    ir.gen_mov(Type::I64, ctx.rip, fallthrough_c);
    ir.gen_goto_tb(1);
    ir.gen_exit_tb(1);

    ctx.base.is_jmp = DisasJumpType::NoReturn;
}

// ---------------------------------------------------------------
// Two-byte (0x0F) opcode dispatch
// ---------------------------------------------------------------

fn translate_0f(
    ctx: &mut X86DisasContext,
    ir: &mut Context,
    prefixes: &Prefixes,
    after_opcode: u32,
    op1: u8,
) -> Option<u32> {
    match op1 {
        // syscall
        0x05 => {
            gen_exit_with_rip(ctx, ir, ctx.base.pc_next + after_opcode as u64, tcg_core::tb::EXCP_SYSCALL as u64);
            Some(after_opcode)
        }
        // ud2
        0x0B => {
            gen_exit_with_rip(ctx, ir, ctx.base.pc_next + after_opcode as u64, tcg_core::tb::EXCP_UD as u64);
            Some(after_opcode)
        }
        // multi-byte nop, 0F 1F /0
        0x1F => {
            let m = unsafe { decode_modrm(ctx, prefixes, after_opcode) };
            Some(after_opcode + m.len)
        }
        // jcc rel32
        0x80..=0x8F => {
            let rel = unsafe { ctx.fetch_i32(after_opcode) };
            let target = (ctx.base.pc_next as i64 + after_opcode as i64 + 4 + rel as i64) as u64;
            let fallthrough = ctx.base.pc_next + after_opcode as u64 + 4;
            gen_cond_branch(ctx, ir, X86Cond::from_tttn(op1 - 0x80), target, fallthrough);
            Some(after_opcode + 4)
        }
        _ => None,
    }
}
