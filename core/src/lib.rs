pub mod context;
pub mod dump;
pub mod ir_builder;
pub mod label;
pub mod op;
pub mod opcode;
pub mod tb;
pub mod temp;
pub mod types;

pub use context::Context;
pub use label::{Label, LabelUse, RelocKind};
pub use op::{LifeData, Op, OpIdx, MAX_OP_ARGS};
pub use opcode::{OpDef, OpFlags, Opcode, OPCODE_DEFS};
pub use tb::{
    decode_tb_exit, encode_tb_exit, JmpState, JumpCache, TranslationBlock, EXCP_INT3,
    EXCP_INTERP_STRMOV, EXCP_SYSCALL, EXCP_UD, TB_EXIT_NOCHAIN, TB_HASH_SIZE, TB_JMP_CACHE_SIZE,
};
pub use temp::{Temp, TempIdx, TempKind};
pub use types::{Cond, MemOp, RegSet, TempVal, Type};
