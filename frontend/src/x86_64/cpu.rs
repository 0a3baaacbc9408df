//! x86_64 CPU state for user-mode emulation.

/// Number of general-purpose registers (rax..r15, System V order).
pub const NUM_GPRS: usize = 16;
/// Number of XMM registers.
pub const NUM_XMMS: usize = 16;
/// Number of segment bases/selectors tracked (cs, ds, es, ss, fs, gs).
pub const NUM_SEGS: usize = 6;
/// Depth of the x87 register stack.
pub const NUM_FPU_REGS: usize = 8;

/// x86_64 CPU architectural state (user-mode, no privileged state).
///
/// Layout must be `#[repr(C)]` so that TCG global temps can reference
/// fields at fixed offsets from the env pointer. `guest_base` sits at a
/// fixed offset because the host backend's prologue loads it directly
/// (see `GUEST_BASE_OFFSET` below, which must track this layout).
#[repr(C)]
pub struct X86Cpu {
    /// General-purpose registers, indexed by the x86-64 register encoding
    /// (0=rax, 1=rcx, 2=rdx, 3=rbx, 4=rsp, 5=rbp, 6=rsi, 7=rdi, 8-15=r8-r15).
    pub gpr: [u64; NUM_GPRS],
    /// Instruction pointer.
    pub rip: u64,
    /// Flags register. Updated eagerly for instructions the deferred-flags
    /// model doesn't cover, lazily (via `cc_op`/`cc_src`/`cc_dst`) otherwise.
    pub rflags: u64,
    /// Segment bases (cs, ds, es, ss, fs, gs). Only fs_base/gs_base are
    /// live in practice for a static Linux/x86_64 binary (TLS).
    pub seg_base: [u64; NUM_SEGS],
    /// Segment selectors, same order as `seg_base`.
    pub seg_sel: [u64; NUM_SEGS],
    /// XMM0-XMM15, widened to 128 bits (extendable to 256-bit YMM by
    /// widening this array's element type without moving later fields).
    pub xmm: [u128; NUM_XMMS],
    /// Index of the top of the x87 register stack.
    pub fpu_top: u64,
    /// Deferred-flags operation tag (`CcOp`, stored as raw `u64`).
    pub cc_op: u64,
    /// Deferred-flags source operand.
    pub cc_src: u64,
    /// Guest memory base pointer (host address), loaded into a
    /// dedicated host register by the prologue.
    pub guest_base: u64,
    /// Deferred-flags destination operand (result of the flag-setting op).
    pub cc_dst: u64,
    /// x87 register stack, 64-bit mantissa approximation (bit-exact
    /// 80-bit transcendentals are a non-goal).
    pub fpu_st: [u64; NUM_FPU_REGS],
    /// Set by a guest syscall requesting thread exit; checked by the
    /// dispatcher after every TB exit.
    pub quit: u64,
    /// Non-zero while a `fork`/`vfork`/`clone` syscall is being
    /// serviced by the thread & fork governor.
    pub fork_request: u64,
    /// Thread-local storage base (`%fs` on Linux/x86_64), set by
    /// `arch_prctl(ARCH_SET_FS, ...)`.
    pub tls_ptr: u64,
    /// Opaque pointer to process-shared state (TB store, loaded image
    /// table), set once at thread creation.
    pub shared: u64,
}

// Field offsets (bytes) from the start of X86Cpu.
// Used by `Context::new_global()` to bind IR temps, and must stay in
// sync with the host backend's hardcoded `GUEST_BASE_OFFSET`.

/// Byte offset of `gpr[i]`: `i * 8`.
pub const fn gpr_offset(i: usize) -> i64 {
    (i * 8) as i64
}

pub const RIP_OFFSET: i64 = (NUM_GPRS * 8) as i64; // 128
pub const RFLAGS_OFFSET: i64 = RIP_OFFSET + 8; // 136

pub const fn seg_base_offset(i: usize) -> i64 {
    RFLAGS_OFFSET + 8 + (i * 8) as i64
}
pub const fn seg_sel_offset(i: usize) -> i64 {
    RFLAGS_OFFSET + 8 + (NUM_SEGS * 8) as i64 + (i * 8) as i64
}

const SEGS_END_OFFSET: i64 = RFLAGS_OFFSET + 8 + (NUM_SEGS * 8 * 2) as i64; // 240

pub const fn xmm_offset(i: usize) -> i64 {
    SEGS_END_OFFSET + (i * 16) as i64
}

const XMM_END_OFFSET: i64 = SEGS_END_OFFSET + (NUM_XMMS * 16) as i64; // 496

pub const FPU_TOP_OFFSET: i64 = XMM_END_OFFSET; // 496
pub const CC_OP_OFFSET: i64 = FPU_TOP_OFFSET + 8; // 504
pub const CC_SRC_OFFSET: i64 = CC_OP_OFFSET + 8; // 512

/// Offset the host backend's prologue hardcodes. Keep this struct's
/// field order in sync with that constant rather than the other way
/// around — changing it requires updating the prologue too.
pub const GUEST_BASE_OFFSET: i64 = CC_SRC_OFFSET + 8; // 520

pub const CC_DST_OFFSET: i64 = GUEST_BASE_OFFSET + 8; // 528

const FPU_ST_OFFSET: i64 = CC_DST_OFFSET + 8; // 536
pub const fn fpu_st_offset(i: usize) -> i64 {
    FPU_ST_OFFSET + (i * 8) as i64
}
const FPU_ST_END_OFFSET: i64 = FPU_ST_OFFSET + (NUM_FPU_REGS * 8) as i64; // 600

pub const QUIT_OFFSET: i64 = FPU_ST_END_OFFSET; // 600
pub const FORK_REQUEST_OFFSET: i64 = QUIT_OFFSET + 8; // 608
pub const TLS_PTR_OFFSET: i64 = FORK_REQUEST_OFFSET + 8; // 616
pub const SHARED_OFFSET: i64 = TLS_PTR_OFFSET + 8; // 624

/// Deferred-flags operation tags, mirroring the "which instruction last
/// touched the flags" encoding a lazy-flags model needs to recompute
/// individual condition codes on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum CcOp {
    /// Flags in `rflags` are up to date; `cc_src`/`cc_dst` unused.
    Eflags = 0,
    AddB = 1,
    AddW = 2,
    AddL = 3,
    AddQ = 4,
    SubB = 5,
    SubW = 6,
    SubL = 7,
    SubQ = 8,
    LogicB = 9,
    LogicW = 10,
    LogicL = 11,
    LogicQ = 12,
    IncB = 13,
    IncL = 14,
    IncQ = 15,
    DecB = 16,
    DecL = 17,
    DecQ = 18,
}

impl X86Cpu {
    pub fn new() -> Self {
        Self {
            gpr: [0u64; NUM_GPRS],
            rip: 0,
            rflags: 0x2, // reserved bit 1 always set
            seg_base: [0u64; NUM_SEGS],
            seg_sel: [0u64; NUM_SEGS],
            xmm: [0u128; NUM_XMMS],
            fpu_top: 0,
            cc_op: CcOp::Eflags as u64,
            cc_src: 0,
            guest_base: 0,
            cc_dst: 0,
            fpu_st: [0u64; NUM_FPU_REGS],
            quit: 0,
            fork_request: 0,
            tls_ptr: 0,
            shared: 0,
        }
    }
}

impl Default for X86Cpu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_base_offset_matches_host_backend() {
        assert_eq!(GUEST_BASE_OFFSET, 520);
    }

    #[test]
    fn offsets_are_monotonic_and_in_bounds() {
        assert!(seg_base_offset(0) < seg_sel_offset(0));
        assert!(xmm_offset(NUM_XMMS - 1) < FPU_TOP_OFFSET);
        assert!(SHARED_OFFSET < std::mem::size_of::<X86Cpu>() as i64);
    }
}
