//! Interpreter fallback for instructions the translator does not
//! statically decode.
//!
//! A complete x86_64 interpreter is out of scope; this provides just
//! enough to satisfy the untranslatable-instruction policy for one
//! instruction family (string move), which is also a case real
//! binary translators commonly dispatch to a helper rather than
//! inlining byte-by-byte IR for.

use super::cpu::X86Cpu;

/// One-method contract for falling back to interpretation when the
/// translator can't statically handle an opcode.
pub trait InterpFallback {
    /// Attempt to interpret exactly one guest instruction at `env`'s
    /// current `rip`. Returns the number of bytes consumed, or 0 if
    /// this instruction isn't one the fallback handles.
    ///
    /// # Safety
    /// `env` must point to a live `X86Cpu` whose `guest_base` covers
    /// the bytes at `rip`.
    unsafe fn interp_one(&mut self, env: *mut u8) -> u32;
}

/// Interprets `movsb`/`movsw`/`movsd`/`movsq` (opcodes 0xA4/0xA5),
/// honoring the direction flag. Does not handle the `rep` prefix —
/// callers loop it themselves by re-invoking per iteration.
pub struct StringMoveFallback;

impl InterpFallback for StringMoveFallback {
    unsafe fn interp_one(&mut self, env: *mut u8) -> u32 {
        let cpu = &mut *(env as *mut X86Cpu);
        let pc = cpu.rip;
        let guest = cpu.guest_base as *const u8;
        let opcode = *guest.add(pc as usize);

        let size: u64 = match opcode {
            0xA4 => 1,
            0xA5 => 8, // simplified: always treats 0xA5 as movsq width
            _ => return 0,
        };

        let df = cpu.rflags & (1 << 10) != 0;
        let rsi = cpu.gpr[6];
        let rdi = cpu.gpr[7];
        let src = (guest as *mut u8).add(rsi as usize);
        let dst = (guest as *mut u8).add(rdi as usize);
        std::ptr::copy(src, dst, size as usize);

        let delta = if df { 0u64.wrapping_sub(size) } else { size };
        cpu.gpr[6] = rsi.wrapping_add(delta);
        cpu.gpr[7] = rdi.wrapping_add(delta);
        cpu.rip = pc + 1;
        1
    }
}
