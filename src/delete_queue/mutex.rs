//! The lock guarding a [`DeleteQueue`](super::DeleteQueue)'s links.
//!
//! `Mutex<T, L>` works like `std::sync::Mutex<T>`, but takes its locking
//! strategy as a type parameter so the queue stays `no_std`.

use core::{
    cell::{Cell, UnsafeCell},
    ops::{Deref, DerefMut},
};

#[cfg(feature = "std")]
use core::fmt;
#[cfg(feature = "std")]
use parking_lot::lock_api::RawMutex;

/// Mutual exclusion for a delete queue.
///
/// The process-wide queue, available with the `std` feature, uses
/// `ParkingLock`. A queue that never leaves its thread, such as one created
/// in a test, can use [`SingleThreadedLock`].
///
/// # Safety
///
/// * A `Sync` implementation makes every queue built on it `Sync`, so `lock`
///   must really exclude other threads.
///
/// * Every implementation must refuse to lock while already locked, including
///   from the thread holding the lock. Panicking or blocking forever both
///   qualify.
pub unsafe trait Lock {
    /// Acquire the lock. Must not return while the lock is held.
    fn lock(&self);

    /// Release the lock.
    fn unlock(&self);
}

/// A single-threaded implementation of [`Lock`].
///
/// A `Cell<bool>` flag that panics on re-entry. Queues using it are not
/// `Sync`, so their snapshots and handles stay on one thread.
#[derive(Debug)]
pub struct SingleThreadedLock {
    locked: Cell<bool>,
}

unsafe impl Lock for SingleThreadedLock {
    #[inline]
    fn lock(&self) {
        assert!(!self.locked.replace(true), "delete queue lock is already held");
    }

    #[inline]
    fn unlock(&self) {
        debug_assert!(self.locked.get());
        self.locked.set(false);
    }
}

impl Default for SingleThreadedLock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl SingleThreadedLock {
    /// Create an unlocked `SingleThreadedLock`.
    #[inline]
    pub const fn new() -> Self {
        SingleThreadedLock {
            locked: Cell::new(false),
        }
    }
}

/// A [`Lock`] backed by `parking_lot`'s raw mutex.
///
/// Contended threads park instead of spinning. Re-entrant locking deadlocks.
#[cfg(feature = "std")]
pub struct ParkingLock {
    raw: parking_lot::RawMutex,
}

#[cfg(feature = "std")]
unsafe impl Lock for ParkingLock {
    #[inline]
    fn lock(&self) {
        self.raw.lock();
    }

    #[inline]
    fn unlock(&self) {
        // Safety: `Mutex` only unlocks from the guard taken by `lock`.
        unsafe { self.raw.unlock() }
    }
}

#[cfg(feature = "std")]
impl Default for ParkingLock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl ParkingLock {
    /// Create an unlocked `ParkingLock`.
    #[inline]
    pub const fn new() -> Self {
        ParkingLock {
            raw: <parking_lot::RawMutex as RawMutex>::INIT,
        }
    }
}

#[cfg(feature = "std")]
impl fmt::Debug for ParkingLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParkingLock")
            .field("locked", &self.raw.is_locked())
            .finish()
    }
}

pub(super) struct Mutex<T, L> {
    lock: L,
    value: UnsafeCell<T>,
}

// Safety: moving the mutex moves its value and lock, and nothing else.
unsafe impl<T, L> Send for Mutex<T, L>
where
    T: Send,
    L: Send,
{
}

// Safety: a `Sync` lock excludes other threads per the `Lock` contract. `T`
// must be `Send` since a guard on another thread hands out `&mut T`.
unsafe impl<T, L> Sync for Mutex<T, L>
where
    T: Send,
    L: Sync + Lock,
{
}

impl<T, L> Mutex<T, L>
where
    L: Lock,
{
    pub(super) const fn new(value: T, lock: L) -> Self {
        Mutex {
            lock,
            value: UnsafeCell::new(value),
        }
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, T, L> {
        self.lock.lock();
        MutexGuard { mutex: self }
    }

    /// Get the value without locking; `&mut self` proves exclusive access.
    pub(super) fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

pub(super) struct MutexGuard<'a, T, L>
where
    L: Lock,
{
    mutex: &'a Mutex<T, L>,
}

impl<T, L> Drop for MutexGuard<'_, T, L>
where
    L: Lock,
{
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}

impl<T, L> Deref for MutexGuard<'_, T, L>
where
    L: Lock,
{
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // Safety: the guard holds the lock.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T, L> DerefMut for MutexGuard<'_, T, L>
where
    L: Lock,
{
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: the guard holds the lock, and `&mut self` makes this the
        // only borrow through it.
        unsafe { &mut *self.mutex.value.get() }
    }
}
