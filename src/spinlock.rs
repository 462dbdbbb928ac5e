use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::proc::{Cpu, InterruptLock, current_cpu, lock_current_cpu};

/// A mutual-exclusion lock that disables interrupts on the current hart while held.
///
/// Locked when the stored CPU pointer is non-null; that pointer also doubles as the
/// "who holds this" check used by `holding()`.
#[derive(Debug)]
pub struct SpinLock<T> {
    name: &'static str,
    cpu: AtomicPtr<Cpu>,
    data: UnsafeCell<T>,
}

// Safety: the `UnsafeCell` inside is never aliased outside of a guard or an exclusive
// reference, so `SpinLock<T>` may be shared across harts as long as `T` may be sent.
unsafe impl<T> Sync for SpinLock<T> where T: Send {}

pub struct SpinLockGuard<'a, T: 'a> {
    lock: &'a SpinLock<T>,
    _intr_lock: InterruptLock,
}

// Safety: only one hart can hold the guard at a time; sharing `&SpinLockGuard` is safe as
// long as `T` is.
unsafe impl<T> Sync for SpinLockGuard<'_, T> where T: Sync {}

impl<T> SpinLock<T> {
    pub const fn new(value: T, name: &'static str) -> Self {
        SpinLock {
            name,
            cpu: AtomicPtr::new(ptr::null_mut()),
            data: UnsafeCell::new(value),
        }
    }

    /// # Safety
    /// Must be called with interrupts disabled.
    unsafe fn holding(&self) -> bool {
        self.cpu.load(Ordering::Relaxed) == unsafe { current_cpu() as *mut Cpu }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let _intr_lock = lock_current_cpu();

        unsafe {
            assert!(!self.holding(), "acquire lock {}", self.name);

            loop {
                if self
                    .cpu
                    .compare_exchange(
                        ptr::null_mut(),
                        current_cpu() as *mut Cpu,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    break SpinLockGuard {
                        lock: self,
                        _intr_lock,
                    };
                }

                hint::spin_loop()
            }
        }
    }

    /// Releases the lock, returning a reference so the caller can reacquire it later.
    ///
    /// Used by [`crate::proc::sleep`] to atomically swap a collaborator's lock for the
    /// process's own lock without leaving a window where neither is held: the guard's
    /// normal `Drop` runs (clearing the CPU pointer and the interrupt-disable count),
    /// and the returned reference is reacquired once the process is woken.
    pub fn unlock(guard: SpinLockGuard<'_, T>) -> &'_ SpinLock<T> {
        let lock = guard.lock;
        drop(guard);
        lock
    }

    /// Releases a lock left held across a context switch, for which no [`SpinLockGuard`]
    /// exists in the current call frame (the guard lives on the suspended scheduler
    /// stack). Mirrors what the guard's `Drop` would have done: clears the CPU pointer
    /// and restores this hart's interrupt-disable nesting count by one.
    ///
    /// # Safety
    /// The caller must be the process that the scheduler just switched to, and this lock
    /// must be the process's own lock, still held from scheduler selection.
    pub unsafe fn force_unlock(&self) {
        unsafe {
            assert!(self.holding(), "force_unlock {}", self.name);
            self.cpu.store(ptr::null_mut(), Ordering::Release);
            current_cpu().unlock();
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// # Safety
    /// The caller must ensure no other hart observes `&mut T` concurrently.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut_unchecked(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<'a, T: 'a> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        unsafe {
            assert!(self.lock.holding(), "release lock {}", self.lock.name);
        }
        self.lock.cpu.store(ptr::null_mut(), Ordering::Release);
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}
