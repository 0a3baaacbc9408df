//! Deferred fork governor.
//!
//! Guest `fork`/`vfork` syscalls set `X86Cpu::fork_request` rather than
//! calling into libc directly from inside translated code: the
//! dispatcher notices the flag at the next TB boundary (never mid-block,
//! so no half-executed instruction straddles the fork) and performs the
//! real fork from this clean, re-entrant point.

use std::sync::Mutex;

/// A registered pre/post-fork callback triple, analogous to POSIX
/// `pthread_atfork`. `prepare` callbacks run in LIFO registration order
/// before the fork; `parent`/`child` callbacks run in FIFO order after
/// it, matching POSIX atfork ordering.
pub struct AtForkRecord {
    pub prepare: Box<dyn Fn() + Send + Sync>,
    pub parent: Box<dyn Fn() + Send + Sync>,
    pub child: Box<dyn Fn() + Send + Sync>,
}

#[derive(Default)]
pub struct AtForkRegistry {
    records: Mutex<Vec<AtForkRecord>>,
}

impl AtForkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, record: AtForkRecord) {
        self.records.lock().unwrap().push(record);
    }

    /// Perform a real `fork()`, running registered callbacks per POSIX
    /// ordering. Returns the raw `fork()` result: 0 in the child, the
    /// child's pid in the parent, negative on error.
    pub fn do_fork(&self) -> i32 {
        let records = self.records.lock().unwrap();
        for r in records.iter().rev() {
            (r.prepare)();
        }
        let pid = unsafe { libc::fork() };
        if pid == 0 {
            for r in records.iter() {
                (r.child)();
            }
        } else {
            for r in records.iter() {
                (r.parent)();
            }
        }
        pid
    }

    /// `vfork()`, weakened to fork()-then-parent-waits.
    ///
    /// A real `vfork()` shares the caller's address space with the
    /// child until `exec`/`_exit`; a JIT cannot honor that without
    /// risking the parent's TB cache and code buffer being mutated out
    /// from under a suspended parent thread, so the guest's vfork is
    /// serviced as a regular fork whose parent blocks until the child
    /// exits (resolved this way per the open question on vfork
    /// semantics).
    pub fn do_vfork_and_wait(&self) -> i32 {
        let pid = self.do_fork();
        if pid > 0 {
            let mut status = 0;
            unsafe {
                libc::waitpid(pid, &mut status, 0);
            }
        }
        pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn atfork_callbacks_run_in_parent() {
        let registry = AtForkRegistry::new();
        let prepared = Arc::new(AtomicU32::new(0));
        let parented = Arc::new(AtomicU32::new(0));
        let p1 = prepared.clone();
        let p2 = parented.clone();
        registry.register(AtForkRecord {
            prepare: Box::new(move || {
                p1.fetch_add(1, Ordering::SeqCst);
            }),
            parent: Box::new(move || {
                p2.fetch_add(1, Ordering::SeqCst);
            }),
            child: Box::new(|| {}),
        });

        let pid = registry.do_fork();
        assert!(pid >= 0);
        if pid > 0 {
            assert_eq!(prepared.load(Ordering::SeqCst), 1);
            assert_eq!(parented.load(Ordering::SeqCst), 1);
            unsafe {
                libc::waitpid(pid, std::ptr::null_mut(), 0);
            }
        } else {
            std::process::exit(0);
        }
    }

    #[test]
    fn vfork_waits_for_child_exit() {
        let registry = AtForkRegistry::new();
        let pid = registry.do_vfork_and_wait();
        if pid == 0 {
            std::process::exit(3);
        }
        assert!(pid > 0);
    }
}
