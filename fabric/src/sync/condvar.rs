use std::{cell::UnsafeCell, mem::MaybeUninit};

use libc::{
    pthread_cond_broadcast, pthread_cond_init, pthread_cond_signal, pthread_cond_t,
    pthread_cond_wait, pthread_condattr_init, pthread_condattr_setpshared,
    pthread_mutex_consistent, EOWNERDEAD, PTHREAD_PROCESS_SHARED,
};

use crate::shm::ShmSafe;

use super::{check, MutexGuard};

/// Process-shared condition variable, constructed in place inside a
/// shared region. Like the mutex it is never destructed.
#[repr(C)]
pub struct Condvar {
    inner: UnsafeCell<MaybeUninit<pthread_cond_t>>,
}

impl Condvar {
    pub unsafe fn init_at(target: *mut Self) {
        let cond: *mut pthread_cond_t = (&raw mut (*target).inner).cast();
        let mut attr = MaybeUninit::uninit();
        check(pthread_condattr_init(attr.as_mut_ptr()), "condattr_init");
        check(
            pthread_condattr_setpshared(attr.as_mut_ptr(), PTHREAD_PROCESS_SHARED),
            "condattr_setpshared",
        );
        check(pthread_cond_init(cond, attr.as_ptr()), "cond_init");
    }

    fn raw(&self) -> *mut pthread_cond_t {
        unsafe { (*self.inner.get()).as_mut_ptr() }
    }

    pub fn signal(&self) {
        check(unsafe { pthread_cond_signal(self.raw()) }, "cond_signal");
    }

    pub fn broadcast(&self) {
        check(unsafe { pthread_cond_broadcast(self.raw()) }, "cond_broadcast");
    }

    /// Atomically releases the guard's mutex and waits for a wakeup.
    /// Relocking may observe the death of another owner; the guard
    /// records it for the caller to translate into the poison protocol.
    pub fn wait<'m, T>(&self, mut guard: MutexGuard<'m, T>) -> MutexGuard<'m, T> {
        match unsafe { pthread_cond_wait(self.raw(), guard.raw_lock()) } {
            0 => {}
            EOWNERDEAD => {
                check(
                    unsafe { pthread_mutex_consistent(guard.raw_lock()) },
                    "mutex_consistent",
                );
                guard.set_owner_died();
            }
            e => panic!("failed to wait on condvar: code {e}"),
        }
        guard
    }
}

unsafe impl Send for Condvar {}
unsafe impl Sync for Condvar {}

unsafe impl ShmSafe for Condvar {}
