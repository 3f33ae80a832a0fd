//! Spinlocks protect data that is touched from many threads at once and
//! must only be held for short, bounded critical sections.
//!
//! A thread that takes a spin-lock while already holding one on the same
//! object would deadlock against itself, so `push_off`/`pop_off` track
//! nesting depth per calling thread (see `cpu.rs`) and `holding()` panics
//! on a re-entrant acquire instead of spinning forever.

use crate::cpu;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{fence, AtomicBool, AtomicI64, Ordering};

pub struct SpinLock<T: ?Sized> {
    name: &'static str,
    locked: AtomicBool,
    // Which thread (per `cpu::current_id`) currently holds the lock, or -1.
    owner: AtomicI64,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
            owner: AtomicI64::new(-1),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            inner: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    fn acquire(&self) {
        cpu::push_off();

        if self.holding() {
            panic!("spinlock: {} acquired re-entrantly", self.name);
        }

        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire)
            .is_err()
        {
            std::hint::spin_loop();
        }
        fence(Ordering::SeqCst);
        self.owner.store(cpu::current_id() as i64, Ordering::Relaxed);
    }

    fn holding(&self) -> bool {
        self.locked.load(Ordering::Acquire)
            && self.owner.load(Ordering::Relaxed) == cpu::current_id() as i64
    }

    fn release(&self) {
        if !self.holding() {
            panic!("spinlock: release of {} by non-owner", self.name);
        }
        self.owner.store(-1, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.locked.store(false, Ordering::Release);

        cpu::pop_off();
    }
}

pub struct SpinLockGuard<'a, T: ?Sized> {
    inner: &'a SpinLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.inner.release();
    }
}
