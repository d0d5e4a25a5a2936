//! Spinlocks.
//!
//! A [`SpinLock`] is a word flipped between 0 and 1 with atomic
//! compare-and-swap, plus an owner hint for debugging double-acquire bugs.
//! The [`IrqSpinLock`] variant saves and restores the interrupt-enable flag
//! around the critical section; it is required for any lock that an
//! interrupt handler can also take, since handlers run with interrupts
//! disabled and must never spin on a lock held by the code they interrupted.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU32, AtomicUsize, Ordering},
};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// A spinlock protecting a value of type `T`.
pub struct SpinLock<T: ?Sized> {
    locked: AtomicU32,
    /// Last owner as reported by the caller; purely diagnostic.
    owner_hint: AtomicUsize,
    data: UnsafeCell<T>,
}

// SAFETY: the lock serializes all access to `data`.
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create an unlocked spinlock.
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicU32::new(UNLOCKED),
            owner_hint: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Spin until the lock is acquired.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) == LOCKED {
                core::hint::spin_loop();
            }
        }
        SpinLockGuard { lock: self }
    }

    /// Try to acquire the lock without spinning.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.locked
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinLockGuard { lock: self })
    }

    /// Record who holds the lock (diagnostic only).
    pub fn set_owner_hint(&self, owner: usize) {
        self.owner_hint.store(owner, Ordering::Relaxed);
    }

    fn unlock(&self) {
        self.locked.store(UNLOCKED, Ordering::Release);
    }
}

/// RAII guard; releases the lock on drop.
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive ownership of the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive ownership of the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// A spinlock whose guard also masks interrupts.
///
/// Acquisition saves the interrupt-enable flag and disables interrupts;
/// the saved state is restored when the guard drops. This is the standard
/// pattern for locks shared between thread context and IRQ handlers
/// (frame bitmap, scheduler queues, VFS internals).
pub struct IrqSpinLock<T: ?Sized> {
    inner: SpinLock<T>,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            inner: SpinLock::new(data),
        }
    }
}

impl<T: ?Sized> IrqSpinLock<T> {
    /// Disable interrupts and acquire the lock.
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let were_enabled = crate::arch::interrupts_enabled();
        crate::arch::disable_interrupts();
        let guard = self.inner.lock();
        IrqSpinLockGuard {
            guard: Some(guard),
            restore_interrupts: were_enabled,
        }
    }
}

/// Guard that releases the lock and then restores the interrupt flag.
pub struct IrqSpinLockGuard<'a, T: ?Sized> {
    guard: Option<SpinLockGuard<'a, T>>,
    restore_interrupts: bool,
}

impl<T: ?Sized> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().expect("guard taken")
    }
}

impl<T: ?Sized> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("guard taken")
    }
}

impl<T: ?Sized> Drop for IrqSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release the lock before re-enabling interrupts, never after.
        self.guard.take();
        if self.restore_interrupts {
            crate::arch::enable_interrupts();
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn lock_provides_mutable_access() {
        let lock = SpinLock::new(41);
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 42);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn guard_releases_on_drop() {
        let lock = SpinLock::new(0u32);
        {
            let mut g = lock.lock();
            *g = 7;
        }
        assert_eq!(*lock.lock(), 7);
    }
}
