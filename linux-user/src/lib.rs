pub mod bridge;
pub mod config;
pub mod context;
pub mod elf;
pub mod fork;
pub mod guest_space;
pub mod loader;
pub mod smc;
pub mod syscall;
pub mod thread;

pub use elf::{
    Elf64Ehdr, Elf64Phdr, ElfError, AT_ENTRY, AT_EXECFN, AT_NULL, AT_PAGESZ,
    AT_PHDR, AT_PHENT, AT_PHNUM, AT_RANDOM, EM_X86_64, ET_EXEC, PF_R, PF_W,
    PF_X, PT_LOAD, PT_PHDR,
};
