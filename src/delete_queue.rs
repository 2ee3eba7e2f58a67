//! A deferred-deletion queue that lets diagnostic snapshots safely look at
//! objects that were deleted while the snapshot was alive.
//!
//! The queue is an intrusive doubly linked list of handles, oldest at the head
//! and newest at the tail, guarded by a single lock. There are two kinds of
//! handle:
//!
//! * A [`Snapshot`] links itself at the tail when created and stays in the
//!   queue until it is dropped.
//!
//! * A [`Handle<T>`] owns a `T`. When it is deleted while the queue is empty,
//!   the `T` is dropped immediately, without touching the lock. Otherwise the
//!   handle is linked at the tail and its `T` stays alive until every snapshot
//!   taken before the deletion is gone.
//!
//! The head of a non-empty queue is always a snapshot. When the head snapshot
//! is dropped, every deleted handle directly behind it is reclaimed, up to the
//! next snapshot.
//!
//! ```
//! use rope_rep::{DeleteQueue, Handle, SingleThreadedLock, Snapshot};
//!
//! let queue = DeleteQueue::new(SingleThreadedLock::new());
//!
//! let snapshot = Snapshot::new_in(&queue);
//! let handle = Handle::new_in(String::from("sampled"), &queue);
//! handle.delete();
//!
//! // The snapshot predates the deletion, so the string is still alive.
//! assert_eq!(snapshot.inspect_deleted::<String>(), [&"sampled"]);
//!
//! drop(snapshot);
//! assert!(queue.is_empty());
//! ```

use core::any::TypeId;
use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::ops::Deref;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

use alloc::boxed::Box;
use alloc::vec::Vec;

mod mutex;
use mutex::{Mutex, MutexGuard};
pub use mutex::{Lock, SingleThreadedLock};

#[cfg(feature = "std")]
pub use mutex::ParkingLock;

/// The lock a queue uses unless another is named.
#[cfg(feature = "std")]
pub type DefaultLock = ParkingLock;

/// The lock a queue uses unless another is named. Without the `std` feature
/// there is no thread-safe default.
#[cfg(not(feature = "std"))]
pub type DefaultLock = SingleThreadedLock;

#[cfg(feature = "std")]
static GLOBAL_QUEUE: DeleteQueue<ParkingLock> = DeleteQueue::new(ParkingLock::new());

/// The process-wide delete queue.
#[cfg(feature = "std")]
#[inline]
pub fn global() -> &'static DeleteQueue<ParkingLock> {
    &GLOBAL_QUEUE
}

/// Counters maintained by a [`DeleteQueue`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Deleted handles currently waiting in the queue.
    pub pending: usize,
    /// Deleted handles that waited in the queue and have since been dropped.
    pub reclaimed: u64,
}

type Guard<'a, L> = MutexGuard<'a, QueueStats, L>;

struct Links {
    /// The next older handle, towards the head.
    prev: Option<NonNull<HandleHeader>>,
    /// The next newer handle, towards the tail.
    next: Option<NonNull<HandleHeader>>,
}

struct HandleHeader {
    is_snapshot: bool,
    type_id: TypeId,
    links: UnsafeCell<Links>,
    destroy: unsafe fn(NonNull<HandleHeader>),
}

#[repr(C)]
struct HandleBox<T> {
    header: HandleHeader,
    value: T,
}

impl HandleHeader {
    fn allocate<T: 'static>(is_snapshot: bool, value: T) -> NonNull<HandleHeader> {
        let boxed = Box::new(HandleBox {
            header: HandleHeader {
                is_snapshot,
                type_id: TypeId::of::<T>(),
                links: UnsafeCell::new(Links {
                    prev: None,
                    next: None,
                }),
                destroy: destroy_box::<T>,
            },
            value,
        });
        // Safety: `Box::into_raw` is never null, and the header comes first.
        unsafe { NonNull::new_unchecked(Box::into_raw(boxed)).cast() }
    }
}

/// # Safety
///
/// `ptr` must come from `HandleHeader::allocate::<T>` and be unreachable.
unsafe fn destroy_box<T>(ptr: NonNull<HandleHeader>) {
    drop(Box::from_raw(ptr.cast::<HandleBox<T>>().as_ptr()));
}

// Link accessors. The guard proves the queue lock is held.

#[inline]
unsafe fn prev<L: Lock>(
    h: NonNull<HandleHeader>,
    _: &Guard<'_, L>,
) -> Option<NonNull<HandleHeader>> {
    (*h.as_ref().links.get()).prev
}

#[inline]
unsafe fn next<L: Lock>(
    h: NonNull<HandleHeader>,
    _: &Guard<'_, L>,
) -> Option<NonNull<HandleHeader>> {
    (*h.as_ref().links.get()).next
}

#[inline]
unsafe fn set_prev<L: Lock>(
    h: NonNull<HandleHeader>,
    prev: Option<NonNull<HandleHeader>>,
    _: &Guard<'_, L>,
) {
    (*h.as_ref().links.get()).prev = prev;
}

#[inline]
unsafe fn set_next<L: Lock>(
    h: NonNull<HandleHeader>,
    next: Option<NonNull<HandleHeader>>,
    _: &Guard<'_, L>,
) {
    (*h.as_ref().links.get()).next = next;
}

/// The identity of a snapshot or handle, for diagnostics.
///
/// Identities are only meaningful while the snapshot or handle is alive or
/// waiting in a queue; afterwards the same identity may be reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandleId {
    addr: usize,
    is_snapshot: bool,
}

impl HandleId {
    fn of(header: NonNull<HandleHeader>) -> HandleId {
        HandleId {
            addr: header.as_ptr() as usize,
            // Safety: ids are only made from live headers.
            is_snapshot: unsafe { header.as_ref().is_snapshot },
        }
    }

    /// Does this identify a snapshot?
    #[inline]
    pub fn is_snapshot(&self) -> bool {
        self.is_snapshot
    }
}

/// A queue of snapshots and deleted handles.
///
/// Most users want the process-wide queue returned by `global()`. Separate
/// queues are independent of each other.
pub struct DeleteQueue<L: Lock = DefaultLock> {
    state: Mutex<QueueStats, L>,
    /// The newest handle in the queue, or null when the queue is empty.
    /// Written with release ordering under the lock, read with acquire
    /// ordering without it.
    tail: AtomicPtr<HandleHeader>,
}

impl<L: Lock> DeleteQueue<L> {
    /// Create a new, empty queue using the given lock.
    pub const fn new(lock: L) -> Self {
        DeleteQueue {
            state: Mutex::new(
                QueueStats {
                    pending: 0,
                    reclaimed: 0,
                },
                lock,
            ),
            tail: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Is the queue empty? Never takes the lock.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tail.load(Ordering::Acquire).is_null()
    }

    /// The identities of everything in the queue, newest first.
    pub fn entries(&self) -> Vec<HandleId> {
        let guard = self.state.lock();
        let mut entries = Vec::new();
        let mut cur = NonNull::new(self.tail.load(Ordering::Relaxed));
        while let Some(h) = cur {
            entries.push(HandleId::of(h));
            // Safety: we hold the lock.
            cur = unsafe { prev(h, &guard) };
        }
        entries
    }

    /// The queue's counters.
    pub fn stats(&self) -> QueueStats {
        *self.state.lock()
    }

    /// Link `h` at the tail. The caller must hold the lock.
    unsafe fn push(&self, h: NonNull<HandleHeader>, guard: &Guard<'_, L>) {
        let tail = NonNull::new(self.tail.load(Ordering::Relaxed));
        set_prev(h, tail, guard);
        set_next(h, None, guard);
        if let Some(tail) = tail {
            set_next(tail, Some(h), guard);
        }
        self.tail.store(h.as_ptr(), Ordering::Release);
    }
}

impl<L: Lock + Default> Default for DeleteQueue<L> {
    fn default() -> Self {
        Self::new(L::default())
    }
}

impl<L: Lock> Drop for DeleteQueue<L> {
    fn drop(&mut self) {
        debug_assert!(self.tail.get_mut().is_null());
        debug_assert_eq!(self.state.get_mut().pending, 0);
    }
}

impl<L: Lock> fmt::Debug for DeleteQueue<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeleteQueue")
            .field("entries", &self.entries())
            .field("stats", &self.stats())
            .finish()
    }
}

/// A diagnostic snapshot.
///
/// Every handle deleted after a snapshot was created stays alive until the
/// snapshot is dropped, so the snapshot may safely inspect it.
pub struct Snapshot<'q, L: Lock = DefaultLock> {
    header: NonNull<HandleHeader>,
    queue: &'q DeleteQueue<L>,
}

// Safety: the header is only touched under the queue's lock, which must be
// `Sync` for the queue to be shared.
unsafe impl<L: Lock + Sync> Send for Snapshot<'_, L> {}
unsafe impl<L: Lock + Sync> Sync for Snapshot<'_, L> {}

#[cfg(feature = "std")]
impl Snapshot<'static, ParkingLock> {
    /// Create a snapshot in the process-wide queue.
    #[inline]
    pub fn new() -> Self {
        Snapshot::new_in(global())
    }
}

#[cfg(feature = "std")]
impl Default for Snapshot<'static, ParkingLock> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<'q, L: Lock> Snapshot<'q, L> {
    /// Create a snapshot in `queue`.
    pub fn new_in(queue: &'q DeleteQueue<L>) -> Self {
        let header = HandleHeader::allocate(true, ());
        let guard = queue.state.lock();
        // Safety: we hold the lock and `header` is not yet in any queue.
        unsafe { queue.push(header, &guard) };
        drop(guard);
        log::trace!("created snapshot {:?}", HandleId::of(header));
        Snapshot { header, queue }
    }

    /// This snapshot's identity.
    #[inline]
    pub fn id(&self) -> HandleId {
        HandleId::of(self.header)
    }

    /// Can this snapshot safely inspect `handle`?
    ///
    /// `None` is always safe, and other snapshots never are. A deleted handle
    /// is safe when it was deleted after this snapshot was created. A handle
    /// that is not in the queue at all has not been deleted, so it is safe
    /// too.
    pub fn is_safe_to_inspect(&self, handle: Option<HandleId>) -> bool {
        let handle = match handle {
            None => return true,
            Some(h) if h.is_snapshot => return false,
            Some(h) => h,
        };
        let guard = self.queue.state.lock();
        let mut found_self = false;
        let mut cur = NonNull::new(self.queue.tail.load(Ordering::Relaxed));
        while let Some(h) = cur {
            if h.as_ptr() as usize == handle.addr {
                return !found_self;
            }
            if h == self.header {
                found_self = true;
            }
            // Safety: we hold the lock.
            cur = unsafe { prev(h, &guard) };
        }
        debug_assert!(found_self, "snapshot is missing from its queue");
        true
    }

    /// Every deleted handle this snapshot can safely inspect, oldest first.
    pub fn safe_to_inspect_deleted_handles(&self) -> Vec<HandleId> {
        self.deleted_after_self()
            .into_iter()
            .map(HandleId::of)
            .collect()
    }

    /// The values of every deleted `Handle<T>` this snapshot can safely
    /// inspect, oldest first.
    pub fn inspect_deleted<T>(&self) -> Vec<&T>
    where
        T: Send + Sync + 'static,
    {
        let type_id = TypeId::of::<T>();
        self.deleted_after_self()
            .into_iter()
            .filter(|h| unsafe { (*h.as_ptr()).type_id } == type_id)
            // Safety: the type matches, and handles deleted after this
            // snapshot stay alive until this snapshot is dropped.
            .map(|h| unsafe { &(*h.cast::<HandleBox<T>>().as_ptr()).value })
            .collect()
    }

    fn deleted_after_self(&self) -> Vec<NonNull<HandleHeader>> {
        let guard = self.queue.state.lock();
        let mut handles = Vec::new();
        // Safety: we hold the lock.
        let mut cur = unsafe { next(self.header, &guard) };
        while let Some(h) = cur {
            // Safety: `h` is in the queue, so it is alive.
            if !unsafe { h.as_ref().is_snapshot } {
                handles.push(h);
            }
            cur = unsafe { next(h, &guard) };
        }
        handles
    }

    /// Drop this snapshot, reclaiming the deleted handles that only it was
    /// keeping alive.
    #[inline]
    pub fn delete(self) {
        drop(self);
    }
}

impl<L: Lock> Drop for Snapshot<'_, L> {
    fn drop(&mut self) {
        let id = self.id();
        let mut doomed = Vec::new();
        {
            let mut guard = self.queue.state.lock();
            // Safety: we hold the lock, and every linked header is alive.
            unsafe {
                let prev = prev(self.header, &guard);
                let mut next = next(self.header, &guard);
                match prev {
                    Some(prev) => set_next(prev, next, &guard),
                    None => {
                        // We are the head, so deleted handles up to the next
                        // snapshot were waiting only on us.
                        while let Some(h) = next {
                            if h.as_ref().is_snapshot {
                                break;
                            }
                            doomed.push(h);
                            next = self::next(h, &guard);
                        }
                    }
                }
                match next {
                    Some(next) => set_prev(next, prev, &guard),
                    None => self.queue.tail.store(
                        prev.map_or(ptr::null_mut(), |p| p.as_ptr()),
                        Ordering::Release,
                    ),
                }
            }
            guard.pending -= doomed.len();
            guard.reclaimed += doomed.len() as u64;
        }

        log::debug!(
            "dropped snapshot {id:?}, reclaiming {} deleted handles",
            doomed.len()
        );
        for h in doomed {
            log::trace!("reclaiming deleted handle {:?}", HandleId::of(h));
            // Safety: unlinked above, and nothing else refers to it.
            unsafe { (h.as_ref().destroy)(h) };
        }
        // Safety: unlinked above.
        unsafe { destroy_box::<()>(self.header) };
    }
}

impl<L: Lock> fmt::Debug for Snapshot<'_, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Snapshot").field(&self.id()).finish()
    }
}

/// An owned `T` whose deletion is deferred while snapshots may be looking at
/// it.
pub struct Handle<'q, T, L: Lock = DefaultLock>
where
    T: Send + Sync + 'static,
{
    header: NonNull<HandleHeader>,
    queue: &'q DeleteQueue<L>,
    _value: PhantomData<T>,
}

// Safety: deleting the handle may drop `T` on another thread, hence `Send`,
// and snapshots on other threads may borrow it, hence `Sync`.
unsafe impl<T, L> Send for Handle<'_, T, L>
where
    T: Send + Sync + 'static,
    L: Lock + Sync,
{
}

unsafe impl<T, L> Sync for Handle<'_, T, L>
where
    T: Send + Sync + 'static,
    L: Lock + Sync,
{
}

#[cfg(feature = "std")]
impl<T> Handle<'static, T, ParkingLock>
where
    T: Send + Sync + 'static,
{
    /// Create a handle owning `value` in the process-wide queue.
    #[inline]
    pub fn new(value: T) -> Self {
        Handle::new_in(value, global())
    }
}

impl<'q, T, L> Handle<'q, T, L>
where
    T: Send + Sync + 'static,
    L: Lock,
{
    /// Create a handle owning `value` in `queue`.
    ///
    /// The handle does not join the queue until it is deleted.
    pub fn new_in(value: T, queue: &'q DeleteQueue<L>) -> Self {
        Handle {
            header: HandleHeader::allocate(false, value),
            queue,
            _value: PhantomData,
        }
    }

    /// This handle's identity.
    #[inline]
    pub fn id(&self) -> HandleId {
        HandleId::of(self.header)
    }

    /// Would deleting this handle drop its value right away?
    #[inline]
    pub fn safe_to_delete(&self) -> bool {
        self.queue.is_empty()
    }

    /// A pointer to the owned value, stable until the value is dropped.
    #[inline]
    pub fn as_ptr(&self) -> NonNull<T> {
        // Safety: the header and value share one live allocation.
        unsafe {
            let value = ptr::addr_of_mut!((*self.header.cast::<HandleBox<T>>().as_ptr()).value);
            NonNull::new_unchecked(value)
        }
    }

    /// Delete this handle: drop the value now when no snapshot can be looking
    /// at it, or defer it until every current snapshot is gone.
    #[inline]
    pub fn delete(self) {
        drop(self);
    }
}

impl<T, L> Deref for Handle<'_, T, L>
where
    T: Send + Sync + 'static,
    L: Lock,
{
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: the value is alive while the handle is.
        unsafe { self.as_ptr().as_ref() }
    }
}

impl<T, L> Drop for Handle<'_, T, L>
where
    T: Send + Sync + 'static,
    L: Lock,
{
    fn drop(&mut self) {
        if !self.safe_to_delete() {
            let mut guard = self.queue.state.lock();
            // A snapshot may have been dropped since we looked, so check again
            // under the lock.
            if !self.queue.tail.load(Ordering::Relaxed).is_null() {
                // Safety: we hold the lock and the handle is not yet queued.
                unsafe { self.queue.push(self.header, &guard) };
                guard.pending += 1;
                log::trace!("deferred deletion of handle {:?}", self.id());
                return;
            }
        }
        // Safety: the handle never joined the queue, so nothing else refers
        // to it.
        unsafe { destroy_box::<T>(self.header) };
    }
}

impl<T, L> fmt::Debug for Handle<'_, T, L>
where
    T: Send + Sync + fmt::Debug + 'static,
    L: Lock,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id())
            .field("value", &**self)
            .finish()
    }
}
