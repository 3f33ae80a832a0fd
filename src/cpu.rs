//! Per-thread identity and interrupt-nesting accounting.
//!
//! Each OS thread is assigned an id the first time it touches a spin-lock,
//! and keeps a `push_off`/`pop_off` nesting counter in thread-local storage
//! so that nested spin-lock acquisitions are detected rather than silently
//! tolerated.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static CPU_ID: Cell<Option<usize>> = Cell::new(None);
    static NOFF: Cell<u32> = Cell::new(0);
}

/// Returns an id that is stable for the lifetime of the calling thread and
/// unique among currently-live threads that have called into the cache.
pub fn current_id() -> usize {
    CPU_ID.with(|slot| match slot.get() {
        Some(id) => id,
        None => {
            let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
            slot.set(Some(id));
            id
        }
    })
}

/// Enter a spin-lock critical section: bump this thread's nesting depth.
pub fn push_off() {
    NOFF.with(|n| n.set(n.get() + 1));
}

/// Leave a spin-lock critical section: drop this thread's nesting depth.
pub fn pop_off() {
    NOFF.with(|n| {
        let depth = n.get();
        assert!(depth > 0, "cpu: pop_off without matching push_off");
        n.set(depth - 1);
    });
}
