//! Per-value sampling records.
//!
//! A sampled tree value stores the address of its [`SampleInfo`] in the
//! inline sample slot. The record itself lives in a delete queue [`Handle`],
//! so a profiler holding a [`Snapshot`](crate::Snapshot) can keep reading it
//! after the value it describes is gone.

use core::fmt;
use core::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use crate::delete_queue::{DeleteQueue, Handle, Lock};
use crate::inline::InlineData;

/// The operation that created or updated a sampled value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    /// Not known.
    Unknown,
    /// Appended bytes.
    AppendBytes,
    /// Appended an external node.
    AppendExternal,
    /// Assigned bytes.
    AssignBytes,
    /// Cleared the value.
    Clear,
    /// Constructed from bytes.
    ConstructorBytes,
    /// Constructed from a node tree.
    ConstructorTree,
    /// Constructed from an external node.
    MakeFromExternal,
    /// Removed a prefix.
    RemovePrefix,
    /// Removed a suffix.
    RemoveSuffix,
    /// Took a sub-range.
    SubRange,
}

impl Method {
    /// The number of methods.
    pub const COUNT: usize = 11;

    /// Every method, in declaration order.
    pub const ALL: [Method; Method::COUNT] = [
        Method::Unknown,
        Method::AppendBytes,
        Method::AppendExternal,
        Method::AssignBytes,
        Method::Clear,
        Method::ConstructorBytes,
        Method::ConstructorTree,
        Method::MakeFromExternal,
        Method::RemovePrefix,
        Method::RemoveSuffix,
        Method::SubRange,
    ];
}

/// Per-method update counters.
///
/// Updates are lossy: concurrent adds to the same counter may lose counts.
/// These are statistics, not an exact tally, and a relaxed load plus store is
/// much cheaper than a read-modify-write.
pub struct UpdateTracker {
    values: [AtomicI64; Method::COUNT],
}

impl UpdateTracker {
    /// Create a tracker with every counter at zero.
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicI64 = AtomicI64::new(0);
        UpdateTracker {
            values: [ZERO; Method::COUNT],
        }
    }

    /// The current count for `method`.
    #[inline]
    pub fn value(&self, method: Method) -> i64 {
        self.values[method as usize].load(Ordering::Relaxed)
    }

    /// Add `n` to the count for `method`.
    #[inline]
    pub fn lossy_add(&self, method: Method, n: i64) {
        let value = &self.values[method as usize];
        value.store(value.load(Ordering::Relaxed) + n, Ordering::Relaxed);
    }

    /// Add every count in `other` to this tracker.
    pub fn lossy_add_all(&self, other: &UpdateTracker) {
        for method in Method::ALL {
            let n = other.value(method);
            if n != 0 {
                self.lossy_add(method, n);
            }
        }
    }
}

impl Default for UpdateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UpdateTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                Method::ALL
                    .iter()
                    .map(|m| (m, self.value(*m)))
                    .filter(|(_, n)| *n != 0),
            )
            .finish()
    }
}

/// The sampling record of one tree value.
#[derive(Debug)]
pub struct SampleInfo {
    method: Method,
    size: AtomicUsize,
    tracker: UpdateTracker,
}

impl SampleInfo {
    /// Create a record for a value created by `method`.
    pub fn new(method: Method) -> Self {
        SampleInfo {
            method,
            size: AtomicUsize::new(0),
            tracker: UpdateTracker::new(),
        }
    }

    /// The method that created the sampled value.
    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    /// The size of the sampled value when it was last updated.
    #[inline]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Counts of the updates made to the sampled value.
    #[inline]
    pub fn tracker(&self) -> &UpdateTracker {
        &self.tracker
    }

    /// Record an update by `method` that left the value at `size` bytes.
    pub fn record_update(&self, method: Method, size: usize) {
        self.tracker.lossy_add(method, 1);
        self.size.store(size, Ordering::Relaxed);
    }

    /// Start sampling the tree value `data`, which was created by `method`.
    ///
    /// The returned handle owns the record; pass it to
    /// [`SampleInfo::untrack`] when the value stops being sampled or dies.
    ///
    /// # Panics
    ///
    /// Panics if `data` is not a tree.
    pub fn track<'q, L: Lock>(
        data: &mut InlineData,
        method: Method,
        queue: &'q DeleteQueue<L>,
    ) -> Handle<'q, SampleInfo, L> {
        assert!(data.is_tree(), "only tree values can be sampled");
        let info = SampleInfo::new(method);
        info.size.store(data.len(), Ordering::Relaxed);
        let handle = Handle::new_in(info, queue);
        data.set_sample(Some(handle.as_ptr()));
        log::trace!("sampling {:?} value of {} bytes", method, data.len());
        handle
    }

    /// Stop sampling `data` and delete its record.
    ///
    /// The record stays readable by snapshots taken before this call.
    pub fn untrack<L: Lock>(data: &mut InlineData, handle: Handle<'_, SampleInfo, L>) {
        debug_assert_eq!(data.sample(), Some(handle.as_ptr()));
        data.clear_sample();
        handle.delete();
    }
}
