use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    ops::{Deref, DerefMut},
};

use libc::{
    pthread_mutex_consistent, pthread_mutex_init, pthread_mutex_lock, pthread_mutex_t,
    pthread_mutex_trylock, pthread_mutex_unlock, pthread_mutexattr_init,
    pthread_mutexattr_setpshared, pthread_mutexattr_setrobust, EBUSY, EOWNERDEAD,
    PTHREAD_MUTEX_ROBUST, PTHREAD_PROCESS_SHARED,
};

use crate::shm::ShmSafe;

use super::check;

/// Process-shared robust mutex wrapping its protected value.
///
/// Lives inside a shared region and is constructed in place with
/// [`Mutex::init_at`]. Robustness means a locker observes the death of a
/// previous owner (`EOWNERDEAD`) instead of deadlocking; the guard
/// reports this through [`MutexGuard::owner_died`].
///
/// The mutex is never destructed: the backing region is unlinked
/// wholesale and the kernel reclaims the primitive with it.
#[repr(C)]
pub struct Mutex<T> {
    lock: UnsafeCell<MaybeUninit<pthread_mutex_t>>,
    data: UnsafeCell<MaybeUninit<T>>,
}

/// Outcome of a non-blocking acquire of the raw lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryLock {
    Acquired,
    Busy,
    /// Acquired, after recovering the lock from a dead owner.
    OwnerDied,
}

impl<T> Mutex<T> {
    unsafe fn init_lock(lock: *mut pthread_mutex_t) {
        let mut attr = MaybeUninit::uninit();
        check(pthread_mutexattr_init(attr.as_mut_ptr()), "mutexattr_init");
        check(
            pthread_mutexattr_setpshared(attr.as_mut_ptr(), PTHREAD_PROCESS_SHARED),
            "mutexattr_setpshared",
        );
        check(
            pthread_mutexattr_setrobust(attr.as_mut_ptr(), PTHREAD_MUTEX_ROBUST),
            "mutexattr_setrobust",
        );
        check(pthread_mutex_init(lock, attr.as_ptr()), "mutex_init");
    }

    /// In-place construction inside shared memory. `init_data` must fully
    /// initialize the protected value.
    pub unsafe fn init_at(target: *mut Self, init_data: impl FnOnce(*mut T)) {
        let lock: *mut pthread_mutex_t = (&raw mut (*target).lock).cast();
        let data: *mut T = (&raw mut (*target).data).cast();
        unsafe { Self::init_lock(lock) };
        init_data(data);
    }

    fn raw(&self) -> *mut pthread_mutex_t {
        unsafe { (*self.lock.get()).as_mut_ptr() }
    }

    pub fn lock(&self) -> MutexGuard<T> {
        let owner_died = unsafe {
            match pthread_mutex_lock(self.raw()) {
                0 => false,
                EOWNERDEAD => {
                    check(pthread_mutex_consistent(self.raw()), "mutex_consistent");
                    true
                }
                e => panic!("failed to lock mutex: code {e}"),
            }
        };
        MutexGuard {
            lock: self,
            data: unsafe { (*self.data.get()).assume_init_mut() },
            owner_died,
        }
    }

    /// Non-blocking acquire without a guard. The sink holds its binder
    /// lock across arbitrary call stacks, so pairing with
    /// [`Mutex::unlock_raw`] is explicit.
    pub fn try_lock_raw(&self) -> TryLock {
        unsafe {
            match pthread_mutex_trylock(self.raw()) {
                0 => TryLock::Acquired,
                EBUSY => TryLock::Busy,
                EOWNERDEAD => {
                    check(pthread_mutex_consistent(self.raw()), "mutex_consistent");
                    TryLock::OwnerDied
                }
                e => panic!("failed to try-lock mutex: code {e}"),
            }
        }
    }

    /// Releases a lock taken with [`Mutex::try_lock_raw`].
    ///
    /// # Safety
    /// The calling thread must currently hold the lock.
    pub unsafe fn unlock_raw(&self) {
        check(unsafe { pthread_mutex_unlock(self.raw()) }, "mutex_unlock");
    }
}

pub struct MutexGuard<'a, T: 'a> {
    lock: &'a Mutex<T>,
    data: &'a mut T,
    owner_died: bool,
}

impl<'a, T: 'a> MutexGuard<'a, T> {
    /// True when this acquisition recovered the mutex from a dead owner.
    pub fn owner_died(&self) -> bool {
        self.owner_died
    }

    pub(crate) fn raw_lock(&self) -> *mut pthread_mutex_t {
        self.lock.raw()
    }

    pub(crate) fn set_owner_died(&mut self) {
        self.owner_died = true;
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.data
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        unsafe {
            if pthread_mutex_unlock(self.lock.raw()) != 0 {
                panic!("failed to unlock mutex");
            }
        }
    }
}

unsafe impl<T> Send for Mutex<T> {}
unsafe impl<T> Sync for Mutex<T> {}

unsafe impl<T> ShmSafe for Mutex<T> where T: ShmSafe {}

#[cfg(test)]
mod test {
    use std::{mem::MaybeUninit, thread};

    use super::{Mutex, TryLock};

    fn heap_mutex(value: u64) -> Box<Mutex<u64>> {
        let storage = Box::new(MaybeUninit::<Mutex<u64>>::uninit());
        let ptr = Box::into_raw(storage).cast::<Mutex<u64>>();
        unsafe {
            Mutex::init_at(ptr, |data| data.write(value));
            Box::from_raw(ptr)
        }
    }

    #[test]
    fn lock_roundtrip() {
        let mutex = heap_mutex(7);
        {
            let mut guard = mutex.lock();
            assert!(!guard.owner_died());
            *guard += 1;
        }
        assert_eq!(*mutex.lock(), 8);
    }

    #[test]
    fn try_lock_reports_busy() {
        let mutex = heap_mutex(0);
        assert_eq!(mutex.try_lock_raw(), TryLock::Acquired);

        thread::scope(|s| {
            s.spawn(|| assert_eq!(mutex.try_lock_raw(), TryLock::Busy));
        });

        unsafe { mutex.unlock_raw() };
    }

    #[test]
    fn try_lock_recovers_from_dead_owner() {
        let mutex = heap_mutex(0);

        thread::scope(|s| {
            // Take the lock and let the owning thread die without
            // releasing it.
            s.spawn(|| assert_eq!(mutex.try_lock_raw(), TryLock::Acquired))
                .join()
                .unwrap();

            assert_eq!(mutex.try_lock_raw(), TryLock::OwnerDied);
            unsafe { mutex.unlock_raw() };

            // Recovery makes the mutex consistent again.
            assert_eq!(mutex.try_lock_raw(), TryLock::Acquired);
            unsafe { mutex.unlock_raw() };
        });
    }

    #[test]
    fn lock_flags_dead_owner_once() {
        let mutex = heap_mutex(3);

        thread::scope(|s| {
            s.spawn(|| {
                let guard = mutex.lock();
                std::mem::forget(guard);
            })
            .join()
            .unwrap();
        });

        let guard = mutex.lock();
        assert!(guard.owner_died());
        assert_eq!(*guard, 3);
        drop(guard);

        assert!(!mutex.lock().owner_died());
    }
}
