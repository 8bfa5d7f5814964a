//! Lock and thread helpers shared by the multiplexer and the workers.

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Poll interval while waiting for a thread to finish.
const JOIN_POLL: Duration = Duration::from_millis(1);

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Every structure guarded in this crate stays consistent across a panic in
/// user callbacks (those run outside the locks), so the data is safe to reuse.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Join a thread, giving up after `timeout`.
///
/// Returns `true` if the thread finished. A thread that misses the deadline
/// is detached; callers guard against it with a generation check. Called
/// from the thread itself (a stop issued by a callback running on it), the
/// handle is dropped at once and the thread exits when it unwinds back to
/// its loop.
pub(crate) fn join_bounded(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let name = handle.thread().name().unwrap_or("<unnamed>").to_owned();
    if handle.thread().id() == thread::current().id() {
        tracing::debug!("thread {} stopping itself, not joined", name);
        return false;
    }

    let deadline = Instant::now() + timeout;

    while !handle.is_finished() {
        if Instant::now() >= deadline {
            tracing::warn!("thread {} did not stop within {:?}, detaching", name, timeout);
            return false;
        }
        thread::sleep(JOIN_POLL);
    }

    if handle.join().is_err() {
        tracing::error!("thread {} panicked", name);
    }
    true
}
