//! Process-wide shared state spanning all guest threads.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use tcg_backend::X86_64CodeGen;
use tcg_exec::SharedState;

use crate::fork::AtForkRegistry;
use crate::guest_space::GuestSpace;
use crate::smc::PageTracker;

/// TLS master template copied into each new thread's TLS block at
/// `clone()` time.
#[derive(Default)]
pub struct TlsTemplate {
    pub data: Vec<u8>,
}

/// One entry in the loaded-image table, enough to answer
/// `/proc/self/exe`-style introspection syscalls without threading the
/// ELF path through every syscall handler individually.
pub struct LoadedImage {
    pub path: String,
    pub entry: u64,
}

/// Everything that spans the whole process rather than one guest
/// thread: the translated-block cache (via `tcg_exec::SharedState`),
/// the loaded-image table, the at-fork callback list, the SMC page
/// tracker, and the TLS master template. Guarded by three locks: the
/// engine's own internal `translate_lock` guards the block cache,
/// `tls` here guards TLS allocation, and `AtForkRegistry`'s internal
/// lock guards the fork-callback list.
pub struct SharedContext {
    pub engine: Arc<SharedState<X86_64CodeGen>>,
    pub images: Mutex<HashMap<u64, LoadedImage>>,
    pub tls: Mutex<TlsTemplate>,
    pub at_fork: AtForkRegistry,
    pub pages: PageTracker,
    /// Guest address space, shared read/write across all CLONE_VM
    /// threads (see `GuestSpace`'s `Sync` impl).
    pub space: GuestSpace,
    /// Next guest address handed out by `mmap(addr=NULL, ...)`.
    pub mmap_next: AtomicU64,
    pub elf_path: String,
    /// Next guest tid handed out by `clone()`. Starts at 2: tid 1 is
    /// the fake main-thread tid `SYS_GETPID`/`SYS_GETTID` report.
    pub next_tid: AtomicU64,
}

impl SharedContext {
    pub fn new(
        engine: Arc<SharedState<X86_64CodeGen>>,
        space: GuestSpace,
        mmap_next: u64,
        elf_path: String,
    ) -> Self {
        Self {
            engine,
            images: Mutex::new(HashMap::new()),
            tls: Mutex::new(TlsTemplate::default()),
            at_fork: AtForkRegistry::new(),
            pages: PageTracker::new(),
            space,
            mmap_next: AtomicU64::new(mmap_next),
            elf_path,
            next_tid: AtomicU64::new(2),
        }
    }

    pub fn register_image(&self, base: u64, path: String, entry: u64) {
        self.images
            .lock()
            .unwrap()
            .insert(base, LoadedImage { path, entry });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tcg_exec::ExecEnv;

    #[test]
    fn registers_loaded_image() {
        let env = ExecEnv::new(X86_64CodeGen::new());
        let space = GuestSpace::new().unwrap();
        let ctx = SharedContext::new(
            env.shared.clone(),
            space,
            0x5000_0000,
            "/bin/hello".to_string(),
        );
        ctx.register_image(0x10000, "/bin/hello".to_string(), 0x10000);
        let images = ctx.images.lock().unwrap();
        assert_eq!(images.get(&0x10000).unwrap().path, "/bin/hello");
    }
}
