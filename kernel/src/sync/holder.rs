//! A lock that remembers which thread holds it.
//!
//! The filesystem lock has to be observable by its holder: a syscall that is
//! already inside the filesystem can fault on a user buffer, and the fault
//! handler must then read file-backed pages without acquiring the lock again.

use crate::mem::address_space::Tid;
use core::sync::atomic::{
    AtomicU16,
    Ordering::{AcqRel, Acquire, Release},
};

const NO_HOLDER: Tid = 0;

pub struct HolderLock {
    holding_thread: AtomicU16,
}

/// Releases the [`HolderLock`] when dropped.
#[must_use = "the lock is released when the guard falls out of scope"]
pub struct HolderLockGuard<'a> {
    lock: &'a HolderLock,
}

impl HolderLock {
    pub const fn new() -> Self {
        Self {
            holding_thread: AtomicU16::new(NO_HOLDER),
        }
    }

    /// Spins until the lock is free, then takes it on behalf of `tid`.
    ///
    /// Panics if `tid` already holds the lock; use [`Self::held_by`] first
    /// when the caller may be nested inside a holder.
    pub fn acquire(&self, tid: Tid) -> HolderLockGuard {
        assert_ne!(tid, NO_HOLDER, "thread id 0 is reserved");
        loop {
            match self
                .holding_thread
                .compare_exchange(NO_HOLDER, tid, AcqRel, Acquire)
            {
                Ok(_) => return HolderLockGuard { lock: self },
                Err(holder) if holder == tid => {
                    panic!("thread {tid} tried to acquire a lock it already holds")
                }
                Err(_) => core::hint::spin_loop(),
            }
        }
    }

    pub fn held_by(&self, tid: Tid) -> bool {
        tid != NO_HOLDER && self.holding_thread.load(Acquire) == tid
    }
}

impl Default for HolderLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HolderLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.holding_thread.store(NO_HOLDER, Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_holder() {
        let lock = HolderLock::new();
        assert!(!lock.held_by(3));
        let guard = lock.acquire(3);
        assert!(lock.held_by(3));
        assert!(!lock.held_by(4));
        drop(guard);
        assert!(!lock.held_by(3));
        let _guard = lock.acquire(4);
        assert!(lock.held_by(4));
    }

    #[test]
    fn other_thread_waits_for_the_holder() {
        let lock = HolderLock::new();
        std::thread::scope(|scope| {
            let guard = lock.acquire(1);
            let waiter = scope.spawn(|| {
                let _guard = lock.acquire(2);
                lock.held_by(2)
            });
            std::thread::sleep(std::time::Duration::from_millis(20));
            assert!(lock.held_by(1));
            drop(guard);
            assert!(waiter.join().unwrap());
        });
        assert!(!lock.held_by(2));
    }

    #[test]
    #[should_panic]
    fn reacquire_by_holder_panics() {
        let lock = HolderLock::new();
        let _guard = lock.acquire(1);
        let _again = lock.acquire(1);
    }
}
