//! Self-modifying-code detection.
//!
//! Pages backing translated guest code are mapped read-only once they
//! have a TB translated from them. A guest write to such a page faults;
//! a `SIGSEGV` handler (installed via `libc::sigaction`, in the style
//! `guest_space.rs` already uses for raw mmap/mprotect calls) restores
//! write access to the page and invalidates every TB that page was
//! tracked against, via `TbStore::invalidate` (already present on the
//! teacher's execution engine).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::guest_space::{page_align_down, page_size};

/// Maps a guest page to the TB indices translated from bytes within it,
/// plus the set of pages ever observed writable (step 3 of the SMC
/// fault path: every future block compiled for such a page carries
/// `always_verify`).
#[derive(Default)]
pub struct PageTracker {
    pages: Mutex<HashMap<u64, Vec<usize>>>,
    dirty_pages: Mutex<HashSet<u64>>,
}

impl PageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `page` (already page-aligned) as having been written to
    /// while it backed translated code. Future TBs compiled for it
    /// must re-verify their source bytes on every entry.
    pub fn mark_dirty(&self, page: u64) {
        self.dirty_pages.lock().unwrap().insert(page);
    }

    /// Whether `page` has ever been observed writable.
    pub fn is_dirty(&self, page: u64) -> bool {
        self.dirty_pages.lock().unwrap().contains(&page)
    }

    /// Record that `tb_idx` was translated from `[pc, pc+size)`, so a
    /// later write anywhere in one of those pages invalidates it.
    pub fn track(&self, tb_idx: usize, pc: u64, size: u32) {
        let ps = page_size() as u64;
        let start = page_align_down(pc);
        let end = page_align_down(pc + size.max(1) as u64 - 1);
        let mut pages = self.pages.lock().unwrap();
        let mut page = start;
        loop {
            pages.entry(page).or_default().push(tb_idx);
            if page >= end {
                break;
            }
            page += ps;
        }
    }

    /// TB indices tracked against `page` (already page-aligned),
    /// removing the entry since those TBs are about to be invalidated.
    pub fn take_page(&self, page: u64) -> Vec<usize> {
        self.pages.lock().unwrap().remove(&page).unwrap_or_default()
    }
}

type InvalidateFn = Box<dyn Fn(u64) + Send + Sync>;

static GUEST_BASE: AtomicUsize = AtomicUsize::new(0);
static INVALIDATE_CB: OnceLock<Mutex<Option<InvalidateFn>>> = OnceLock::new();

/// Install the process-wide SIGSEGV handler that services SMC write
/// faults. `cb` is invoked with the page-aligned guest address that
/// faulted; it must invalidate every TB tracked against that page and
/// restore the page's write permission (typically via
/// `PageTracker::take_page` + `TbStore::invalidate` + `mprotect`).
///
/// Only one handler may be installed per process; later calls replace
/// the callback but leave the installed `sigaction` in place.
pub fn install_handler(
    guest_base: *const u8,
    cb: impl Fn(u64) + Send + Sync + 'static,
) {
    GUEST_BASE.store(guest_base as usize, Ordering::Release);
    let lock = INVALIDATE_CB.get_or_init(|| Mutex::new(None));
    *lock.lock().unwrap() = Some(Box::new(cb));

    // SAFETY: sa_sigaction is a valid extern "C" handler with matching
    // signature; sa_mask/sa_flags are zero-initialized then set.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handle_sigsegv as usize;
        sa.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGSEGV, &sa, std::ptr::null_mut());
    }
}

extern "C" fn handle_sigsegv(
    _sig: libc::c_int,
    info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    // SAFETY: info is valid for the duration of signal delivery.
    let fault_addr = unsafe { (*info).si_addr() as usize };
    let base = GUEST_BASE.load(Ordering::Acquire);
    if base == 0 || fault_addr < base {
        // Not one of ours: restore default disposition and re-raise so
        // the process dies the way it would without this handler.
        unsafe {
            libc::signal(libc::SIGSEGV, libc::SIG_DFL);
            libc::raise(libc::SIGSEGV);
        }
        return;
    }

    let ps = page_size();
    let host_page = fault_addr & !(ps - 1);
    unsafe {
        libc::mprotect(
            host_page as *mut libc::c_void,
            ps,
            libc::PROT_READ | libc::PROT_WRITE,
        );
    }

    let guest_page = (host_page - base) as u64;
    if let Some(lock) = INVALIDATE_CB.get() {
        if let Some(cb) = lock.lock().unwrap().as_ref() {
            cb(guest_page);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_and_takes_pages() {
        let t = PageTracker::new();
        let ps = page_size() as u64;
        t.track(1, 0, 10);
        t.track(2, ps + 5, 10);
        assert_eq!(t.take_page(0), vec![1]);
        assert_eq!(t.take_page(0), Vec::<usize>::new());
        assert_eq!(t.take_page(ps), vec![2]);
    }

    #[test]
    fn track_spans_multiple_pages() {
        let t = PageTracker::new();
        let ps = page_size() as u64;
        // Block starting near the end of page 0, spilling into page 1.
        t.track(9, ps - 4, 8);
        assert_eq!(t.take_page(0), vec![9]);
        assert_eq!(t.take_page(ps), vec![9]);
    }
}
