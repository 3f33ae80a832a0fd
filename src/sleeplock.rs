//! An ownership-transferring lock whose acquisition may block the calling
//! thread for a long time (the duration of a disk I/O in the cache's case).
//!
//! A spin-lock guards a `locked` flag and a list of parked waiters. Taking
//! the lock parks the calling thread (`std::thread::park`) while `locked`
//! is true; releasing it wakes every waiter (`Thread::unpark`) so the
//! first to observe `locked == false` again wins the race to take it.

use crate::spinlock::SpinLock;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::thread::{self, Thread};

pub struct SleepLock<T> {
    inner: SpinLock<Inner>,
    data: UnsafeCell<T>,
}

struct Inner {
    locked: bool,
    waiters: Vec<Thread>,
}

unsafe impl<T: Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(data: T, _name: &'static str) -> Self {
        Self {
            inner: SpinLock::new(
                Inner {
                    locked: false,
                    waiters: Vec::new(),
                },
                "sleeplock",
            ),
            data: UnsafeCell::new(data),
        }
    }

    /// Blocks the calling thread until the lock is free, then takes it.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        loop {
            let mut guard = self.inner.lock();
            if !guard.locked {
                guard.locked = true;
                break;
            }
            guard.waiters.push(thread::current());
            drop(guard);
            thread::park();
        }

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// Releases the lock and wakes every thread parked waiting for it; the
    /// first to observe `locked == false` again wins the race to take it.
    fn unlock(&self) {
        let mut guard = self.inner.lock();
        guard.locked = false;
        let waiters = std::mem::take(&mut guard.waiters);
        drop(guard);
        for t in waiters {
            t.unpark();
        }
    }
}

pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T> SleepLockGuard<'a, T> {
    /// Explicitly give up the lock, running the same wake-up logic as
    /// `Drop` would. Release is meant to be a named operation rather than
    /// an incidental side effect of a handle going out of scope.
    pub fn unlock(self) {
        drop(self);
    }
}

impl<'a, T> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.data
    }
}

impl<'a, T> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data
    }
}

impl<'a, T> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
