//! Deferred (lazy) EFLAGS model.
//!
//! Flag-setting instructions store the operation tag plus its operands
//! into `cc_op`/`cc_src`/`cc_dst` instead of materializing every flag
//! bit immediately. A condition is only computed when something actually
//! reads it (`Jcc`, `SETcc`, `CMOVcc`), via a runtime helper call — the
//! same shape QEMU's per-target `helper_cc_compute_*` uses, grounded
//! here in the IR builder's existing `gen_call`/`gen_exit_tb` ops.

use super::cpu::{CcOp, X86Cpu};
use super::X86DisasContext;
use tcg_core::{Context, TempIdx, Type};

/// x86 Jcc/SETcc condition codes (the `tttn` field of 0x70-0x7F / 0x0F 0x80-0x8F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum X86Cond {
    O = 0,
    No = 1,
    B = 2,
    Ae = 3,
    E = 4,
    Ne = 5,
    Be = 6,
    A = 7,
    S = 8,
    Ns = 9,
    P = 10,
    Np = 11,
    L = 12,
    Ge = 13,
    Le = 14,
    G = 15,
}

impl X86Cond {
    pub fn from_tttn(tttn: u8) -> Self {
        match tttn & 0xF {
            0 => Self::O,
            1 => Self::No,
            2 => Self::B,
            3 => Self::Ae,
            4 => Self::E,
            5 => Self::Ne,
            6 => Self::Be,
            7 => Self::A,
            8 => Self::S,
            9 => Self::Ns,
            10 => Self::P,
            11 => Self::Np,
            12 => Self::L,
            13 => Self::Ge,
            14 => Self::Le,
            _ => Self::G,
        }
    }
}

/// Record that `dst = a OP b` just set the flags, where `op` identifies
/// the arithmetic family and operand width.
pub fn gen_defer(
    ir: &mut Context,
    ctx: &X86DisasContext,
    op: CcOp,
    dst: TempIdx,
    src: TempIdx,
) {
    let op_const = ir.new_const(Type::I64, op as u64);
    ir.gen_mov(Type::I64, ctx.cc_op, op_const);
    ir.gen_mov(Type::I64, ctx.cc_src, src);
    ir.gen_mov(Type::I64, ctx.cc_dst, dst);
}

/// Record that `dst` is the result of an `inc`/`dec`, which — unlike
/// `add`/`sub` — never touches CF. The current CF is read out (via the
/// same runtime helper `Jcc` uses) before `cc_op` is overwritten, and
/// stashed in `cc_src` so `cc_compute` can return it unchanged later.
pub fn gen_defer_incdec(ir: &mut Context, ctx: &X86DisasContext, op: CcOp, dst: TempIdx) {
    let old_cf = gen_compute_cond(ir, ctx, X86Cond::B);
    gen_defer(ir, ctx, op, dst, old_cf);
}

/// Emit a call to the runtime flag-computation helper and return a
/// 0/1 `TempIdx` holding the requested condition.
pub fn gen_compute_cond(ir: &mut Context, ctx: &X86DisasContext, cond: X86Cond) -> TempIdx {
    let dst = ir.new_temp_tb(Type::I64);
    let cond_const = ir.new_const(Type::I64, cond as u64);
    ir.gen_call(dst, cc_compute as usize as u64, &[ctx.env, cond_const]);
    dst
}

fn mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

fn op_width_bits(op: u64) -> u32 {
    match op {
        x if x == CcOp::AddB as u64
            || x == CcOp::SubB as u64
            || x == CcOp::LogicB as u64
            || x == CcOp::IncB as u64
            || x == CcOp::DecB as u64 =>
        {
            8
        }
        x if x == CcOp::AddW as u64 || x == CcOp::LogicW as u64 => 16,
        x if x == CcOp::AddL as u64
            || x == CcOp::SubL as u64
            || x == CcOp::LogicL as u64
            || x == CcOp::IncL as u64
            || x == CcOp::DecL as u64 =>
        {
            32
        }
        x if x == CcOp::AddQ as u64
            || x == CcOp::SubQ as u64
            || x == CcOp::LogicQ as u64
            || x == CcOp::IncQ as u64
            || x == CcOp::DecQ as u64 =>
        {
            64
        }
        x if x == CcOp::SubW as u64 => 16,
        _ => 64,
    }
}

/// Runtime helper invoked via `gen_call`: reads `cc_op`/`cc_src`/`cc_dst`
/// from CPU state and computes the requested flag.
///
/// # Safety
/// `env` must point to a live `X86Cpu`.
unsafe extern "C" fn cc_compute(env: *mut u8, cond: u64) -> u64 {
    let cpu = &*(env as *const X86Cpu);
    let op = cpu.cc_op;
    let bits = op_width_bits(op);
    let m = mask(bits);
    let dst = cpu.cc_dst & m;
    let src = cpu.cc_src & m;
    let sign_bit = 1u64 << (bits - 1);

    let is_sub = op == CcOp::SubB as u64
        || op == CcOp::SubW as u64
        || op == CcOp::SubL as u64
        || op == CcOp::SubQ as u64;
    let is_add = op == CcOp::AddB as u64
        || op == CcOp::AddW as u64
        || op == CcOp::AddL as u64
        || op == CcOp::AddQ as u64;
    let is_inc =
        op == CcOp::IncB as u64 || op == CcOp::IncL as u64 || op == CcOp::IncQ as u64;
    let is_dec =
        op == CcOp::DecB as u64 || op == CcOp::DecL as u64 || op == CcOp::DecQ as u64;

    let zf = dst == 0;
    let sf = dst & sign_bit != 0;

    let (cf, of) = if is_sub {
        let a = dst.wrapping_add(src) & m;
        let cf = a < src;
        let of = ((a ^ src) & (a ^ dst)) & sign_bit != 0;
        (cf, of)
    } else if is_add {
        let a = dst.wrapping_sub(src) & m;
        let cf = dst < src;
        let of = ((a ^ dst) & (src ^ dst)) & sign_bit != 0;
        (cf, of)
    } else if is_inc {
        // inc/dec never touch CF; `cc_src` holds the CF from just
        // before the operation, stashed there by `gen_defer_incdec`.
        let cf = src != 0;
        // Overflow iff the result wrapped from the largest positive
        // value to the sign bit.
        let of = dst == sign_bit;
        (cf, of)
    } else if is_dec {
        let cf = src != 0;
        // Overflow iff the result wrapped from the sign bit down to
        // the largest positive value.
        let of = dst == (sign_bit - 1);
        (cf, of)
    } else {
        // Logic family: CF and OF are always cleared by hardware.
        (false, false)
    };

    let result = match X86Cond::from_tttn(cond as u8) {
        X86Cond::O => of,
        X86Cond::No => !of,
        X86Cond::B => cf,
        X86Cond::Ae => !cf,
        X86Cond::E => zf,
        X86Cond::Ne => !zf,
        X86Cond::Be => cf || zf,
        X86Cond::A => !cf && !zf,
        X86Cond::S => sf,
        X86Cond::Ns => !sf,
        // Parity flag is not tracked by this deferred-flags model.
        X86Cond::P => false,
        X86Cond::Np => true,
        X86Cond::L => sf != of,
        X86Cond::Ge => sf == of,
        X86Cond::Le => zf || (sf != of),
        X86Cond::G => !zf && (sf == of),
    };

    result as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_zero_sets_zf() {
        let mut cpu = X86Cpu::new();
        cpu.cc_op = CcOp::SubL as u64;
        cpu.cc_src = 5;
        cpu.cc_dst = 0;
        let env = &mut cpu as *mut X86Cpu as *mut u8;
        let r = unsafe { cc_compute(env, X86Cond::E as u64) };
        assert_eq!(r, 1);
    }

    #[test]
    fn sub_borrow_sets_cf() {
        let mut cpu = X86Cpu::new();
        cpu.cc_op = CcOp::SubL as u64;
        cpu.cc_src = 10;
        cpu.cc_dst = (5u64.wrapping_sub(10)) & mask(32);
        let env = &mut cpu as *mut X86Cpu as *mut u8;
        let r = unsafe { cc_compute(env, X86Cond::B as u64) };
        assert_eq!(r, 1);
    }

    #[test]
    fn inc_preserves_prior_cf() {
        let mut cpu = X86Cpu::new();
        cpu.cc_op = CcOp::IncL as u64;
        cpu.cc_src = 1; // CF was set before the inc
        cpu.cc_dst = 6; // result of incrementing 5
        let env = &mut cpu as *mut X86Cpu as *mut u8;
        assert_eq!(unsafe { cc_compute(env, X86Cond::B as u64) }, 1);
        assert_eq!(unsafe { cc_compute(env, X86Cond::E as u64) }, 0);
    }

    #[test]
    fn inc_sets_of_on_wrap_to_sign_bit() {
        let mut cpu = X86Cpu::new();
        cpu.cc_op = CcOp::IncL as u64;
        cpu.cc_src = 0;
        cpu.cc_dst = 1u64 << 31; // incremented from i32::MAX
        let env = &mut cpu as *mut X86Cpu as *mut u8;
        assert_eq!(unsafe { cc_compute(env, X86Cond::O as u64) }, 1);
    }

    #[test]
    fn dec_preserves_prior_cf_and_sets_of_on_wrap() {
        let mut cpu = X86Cpu::new();
        cpu.cc_op = CcOp::DecL as u64;
        cpu.cc_src = 0; // CF was clear before the dec
        cpu.cc_dst = 0x7FFF_FFFF; // decremented from i32::MIN
        let env = &mut cpu as *mut X86Cpu as *mut u8;
        assert_eq!(unsafe { cc_compute(env, X86Cond::B as u64) }, 0);
        assert_eq!(unsafe { cc_compute(env, X86Cond::O as u64) }, 1);
    }

    #[test]
    fn logic_clears_cf_and_of() {
        let mut cpu = X86Cpu::new();
        cpu.cc_op = CcOp::LogicL as u64;
        cpu.cc_src = 0xFFFF_FFFF;
        cpu.cc_dst = 0xFFFF_FFFF;
        let env = &mut cpu as *mut X86Cpu as *mut u8;
        assert_eq!(unsafe { cc_compute(env, X86Cond::B as u64) }, 0);
        assert_eq!(unsafe { cc_compute(env, X86Cond::O as u64) }, 0);
        assert_eq!(unsafe { cc_compute(env, X86Cond::S as u64) }, 1);
    }
}
