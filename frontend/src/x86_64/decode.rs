//! x86_64 prefix/ModRM/SIB decoding helpers.
//!
//! Unlike the RISC-V frontend's fixed-width decodetree tables, x86_64
//! instructions are variable length, so decoding and translation happen
//! together: `mod.rs::translate_insn` fetches bytes as it goes instead
//! of decoding a whole instruction up front.

use super::X86DisasContext;

/// Legacy + REX prefix state accumulated before the opcode byte.
#[derive(Debug, Default, Clone, Copy)]
pub struct Prefixes {
    pub rex_w: bool,
    pub rex_r: bool,
    pub rex_x: bool,
    pub rex_b: bool,
    pub has_rex: bool,
    pub opsize_16: bool, // 0x66
    pub addrsize_32: bool, // 0x67, unused for flat user-mode addressing
    pub rep: bool,  // 0xF3
    pub repne: bool, // 0xF2
    pub lock: bool, // 0xF0
}

/// Decoded ModRM byte plus the resolved operands.
pub struct ModRm {
    pub mod_: u8,
    pub reg: u8,
    pub rm: u8,
    /// True if `rm` addresses memory (mod != 3).
    pub is_mem: bool,
    /// Number of instruction bytes the ModRM (+SIB +disp) occupied.
    pub len: u32,
    /// For memory operands: base register, or `None` for RIP-relative
    /// or disp32-only addressing.
    pub mem_base: Option<u8>,
    pub mem_index: Option<u8>,
    pub mem_scale: u8,
    pub mem_disp: i64,
    pub rip_relative: bool,
}

impl X86DisasContext {
    /// # Safety
    /// `guest_base + pc_next + off` must be a valid, readable address.
    pub unsafe fn fetch_u8(&self, off: u32) -> u8 {
        *self.guest_base.add((self.base.pc_next + off as u64) as usize)
    }

    /// # Safety
    /// See `fetch_u8`.
    pub unsafe fn fetch_i8(&self, off: u32) -> i8 {
        self.fetch_u8(off) as i8
    }

    /// # Safety
    /// See `fetch_u8`.
    pub unsafe fn fetch_u16(&self, off: u32) -> u16 {
        let ptr = self
            .guest_base
            .add((self.base.pc_next + off as u64) as usize) as *const u16;
        ptr.read_unaligned()
    }

    /// # Safety
    /// See `fetch_u8`.
    pub unsafe fn fetch_u32(&self, off: u32) -> u32 {
        let ptr = self
            .guest_base
            .add((self.base.pc_next + off as u64) as usize) as *const u32;
        ptr.read_unaligned()
    }

    /// # Safety
    /// See `fetch_u8`.
    pub unsafe fn fetch_i32(&self, off: u32) -> i32 {
        self.fetch_u32(off) as i32
    }

    /// # Safety
    /// See `fetch_u8`.
    pub unsafe fn fetch_u64(&self, off: u32) -> u64 {
        let ptr = self
            .guest_base
            .add((self.base.pc_next + off as u64) as usize) as *const u64;
        ptr.read_unaligned()
    }
}

/// Parse legacy prefixes and an optional REX byte starting at
/// `pc_next + off`. Returns the prefixes and the number of bytes consumed.
///
/// # Safety
/// Bytes at `pc_next + off ..` must be readable.
pub unsafe fn decode_prefixes(ctx: &X86DisasContext, mut off: u32) -> (Prefixes, u32) {
    let mut p = Prefixes::default();
    loop {
        let b = ctx.fetch_u8(off);
        match b {
            0x66 => {
                p.opsize_16 = true;
                off += 1;
            }
            0x67 => {
                p.addrsize_32 = true;
                off += 1;
            }
            0xF0 => {
                p.lock = true;
                off += 1;
            }
            0xF2 => {
                p.repne = true;
                off += 1;
            }
            0xF3 => {
                p.rep = true;
                off += 1;
            }
            0x2E | 0x36 | 0x3E | 0x26 | 0x64 | 0x65 => {
                // segment override prefixes: cs/ss/ds/es/fs/gs.
                // fs/gs matter for TLS; tracked by the caller via raw byte.
                off += 1;
            }
            0x40..=0x4F => {
                p.has_rex = true;
                p.rex_w = b & 0x8 != 0;
                p.rex_r = b & 0x4 != 0;
                p.rex_x = b & 0x2 != 0;
                p.rex_b = b & 0x1 != 0;
                off += 1;
                break;
            }
            _ => break,
        }
    }
    (p, off)
}

/// Decode a ModRM byte (and SIB/disp if present) at `pc_next + off`.
///
/// # Safety
/// Bytes at `pc_next + off ..` must be readable.
pub unsafe fn decode_modrm(ctx: &X86DisasContext, prefixes: &Prefixes, off: u32) -> ModRm {
    let b = ctx.fetch_u8(off);
    let mod_ = (b >> 6) & 0x3;
    let mut reg = (b >> 3) & 0x7;
    let mut rm = b & 0x7;
    if prefixes.rex_r {
        reg |= 0x8;
    }

    let mut len = 1u32;

    if mod_ == 3 {
        if prefixes.rex_b {
            rm |= 0x8;
        }
        return ModRm {
            mod_,
            reg,
            rm,
            is_mem: false,
            len,
            mem_base: None,
            mem_index: None,
            mem_scale: 1,
            mem_disp: 0,
            rip_relative: false,
        };
    }

    let mut mem_base;
    let mut mem_index = None;
    let mut mem_scale = 1u8;
    let mut rip_relative = false;

    if rm == 4 {
        // SIB byte follows.
        let sib = ctx.fetch_u8(off + len);
        len += 1;
        let scale = 1u8 << ((sib >> 6) & 0x3);
        let mut idx = (sib >> 3) & 0x7;
        let mut base = sib & 0x7;
        if prefixes.rex_x {
            idx |= 0x8;
        }
        if prefixes.rex_b {
            base |= 0x8;
        }
        mem_scale = scale;
        if idx != 4 {
            // rsp-as-index (encoding 4 after REX.X=0) means "no index".
            mem_index = Some(idx);
        }
        if base & 0x7 == 5 && mod_ == 0 {
            mem_base = None; // disp32, no base
        } else {
            mem_base = Some(base);
        }
    } else if rm == 5 && mod_ == 0 {
        // RIP-relative disp32.
        mem_base = None;
        rip_relative = true;
    } else {
        let mut base = rm;
        if prefixes.rex_b {
            base |= 0x8;
        }
        mem_base = Some(base);
    }

    let mem_disp = match mod_ {
        0 => {
            if rip_relative || (rm == 4 && mem_base.is_none()) {
                let d = ctx.fetch_i32(off + len);
                len += 4;
                d as i64
            } else {
                0
            }
        }
        1 => {
            let d = ctx.fetch_i8(off + len);
            len += 1;
            d as i64
        }
        2 => {
            let d = ctx.fetch_i32(off + len);
            len += 4;
            d as i64
        }
        _ => unreachable!(),
    };

    if prefixes.rex_b && rm != 4 {
        // handled above for the non-SIB path already via `base |= 0x8`.
    }
    let _ = &mut mem_base;

    ModRm {
        mod_,
        reg,
        rm,
        is_mem: true,
        len,
        mem_base,
        mem_index,
        mem_scale,
        mem_disp,
        rip_relative,
    }
}
