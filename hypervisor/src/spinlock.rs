//! Busy-wait locking usable in VMX root operation and at any interrupt level.
//!
//! Root mode runs with interrupts disabled and without a scheduler, so the OS
//! wait primitives are unusable there. The same lock is used from normal kernel
//! context as well; keeping a single primitive for both avoids deadlocks between
//! a root-mode holder and a guest-mode waiter on the same core.
//!
//! Re-acquiring a lock already held by the same logical core deadlocks. Callers
//! must not nest acquisitions of the same lock.

use {
    crate::config::SPINLOCK_MAX_WAIT,
    core::{
        cell::UnsafeCell,
        hint::spin_loop,
        ops::{Deref, DerefMut},
        sync::atomic::{AtomicBool, Ordering},
    },
};

/// A test-and-set lock with exponential pause backoff.
///
/// There is no fairness guarantee and no owner tracking.
#[derive(Debug, Default)]
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Performs a single atomic test-and-set. Never blocks.
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Spins until the lock is acquired.
    ///
    /// Each failed round pauses for `wait` iterations, starting at 1 and
    /// doubling up to [`SPINLOCK_MAX_WAIT`].
    pub fn lock(&self) {
        let mut wait = 1u32;

        while !self.try_lock() {
            for _ in 0..wait {
                spin_loop();
            }

            if wait * 2 > SPINLOCK_MAX_WAIT {
                wait = SPINLOCK_MAX_WAIT;
            } else {
                wait *= 2;
            }
        }
    }

    /// Stores the idle value.
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// Data protected by a [`SpinLock`].
pub struct SpinMutex<T> {
    lock: SpinLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            lock: SpinLock::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        self.lock.lock();
        SpinMutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        if self.lock.try_lock() {
            Some(SpinMutexGuard { mutex: self })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

/// Releases the lock when dropped.
pub struct SpinMutexGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::{
            sync::{
                atomic::{AtomicUsize, Ordering},
                Arc,
            },
            thread,
        },
    };

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new();
        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
        assert!(!lock.is_locked());
    }

    #[test]
    fn only_one_holder_at_a_time() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 2000;

        let lock = Arc::new(SpinLock::new());
        let holders = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let (lock, holders, total) = (lock.clone(), holders.clone(), total.clone());
                thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        lock.lock();
                        assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);
                        total.fetch_add(1, Ordering::Relaxed);
                        assert_eq!(holders.fetch_sub(1, Ordering::SeqCst), 1);
                        lock.unlock();
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(total.load(Ordering::Relaxed), THREADS * ROUNDS);
        assert!(!lock.is_locked());
    }

    #[test]
    fn mutex_guards_data() {
        let counter = Arc::new(SpinMutex::new(0u64));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *counter.lock() += 1;
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(*counter.lock(), 4000);
        assert!(!counter.is_locked());
    }

    #[test]
    fn try_lock_on_mutex() {
        let mutex = SpinMutex::new(5u8);
        let guard = mutex.lock();
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert_eq!(*mutex.try_lock().unwrap(), 5);
    }
}
