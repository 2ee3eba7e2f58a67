//! The reference count embedded in every node.

use core::fmt;
use core::sync::atomic::{AtomicI32, Ordering};

/// The bottom bit is reserved for the immortal flag.
const NUM_FLAGS: u32 = 1;

/// Set on values that must never be destroyed, such as static constants.
const IMMORTAL_FLAG: i32 = 0x1;

/// The amount one reference adds to the packed count.
const REF_INCREMENT: i32 = 1 << NUM_FLAGS;

/// A packed atomic reference count and immortal flag.
///
/// The live count is stored shifted left by one bit; bit 0 is the immortal
/// flag. Immortal values are odd, so they never compare equal to
/// `REF_INCREMENT` and therefore never report reaching zero, no matter how
/// many times they are decremented.
pub struct Refcount {
    count: AtomicI32,
}

impl Refcount {
    /// Create a new count holding exactly one reference.
    #[inline]
    pub const fn new() -> Self {
        Refcount {
            count: AtomicI32::new(REF_INCREMENT),
        }
    }

    /// Create a new immortal count.
    #[inline]
    pub const fn immortal() -> Self {
        Refcount {
            count: AtomicI32::new(IMMORTAL_FLAG),
        }
    }

    /// Add a reference.
    ///
    /// Imposes no memory ordering: taking a new reference never publishes new
    /// data to other threads.
    #[inline]
    pub fn increment(&self) {
        self.count.fetch_add(REF_INCREMENT, Ordering::Relaxed);
    }

    /// Drop a reference.
    ///
    /// Returns `false` if that was the last reference, `true` otherwise. The
    /// acquire-release decrement makes every write made through any reference
    /// visible to the thread that observes `false`. Always returns `true` for
    /// immortal counts.
    #[inline]
    pub fn decrement(&self) -> bool {
        let count = self.count.load(Ordering::Acquire);
        debug_assert!(count > 0 || count & IMMORTAL_FLAG != 0);
        count != REF_INCREMENT
            && self.count.fetch_sub(REF_INCREMENT, Ordering::AcqRel) != REF_INCREMENT
    }

    /// Like [`Refcount::decrement`], but for call sites that expect the count
    /// to be greater than one, which skips the initial load.
    #[inline]
    pub fn decrement_expect_high(&self) -> bool {
        let count = self.count.fetch_sub(REF_INCREMENT, Ordering::AcqRel);
        debug_assert!(count > 0 || count & IMMORTAL_FLAG != 0);
        count != REF_INCREMENT
    }

    /// Get the current number of references, with acquire semantics.
    #[inline]
    pub fn get(&self) -> usize {
        (self.count.load(Ordering::Acquire) >> NUM_FLAGS) as usize
    }

    /// Is there exactly one reference?
    ///
    /// When the count is used conventionally, a count of one means the caller
    /// holds the only reference. The acquire load synchronizes with every
    /// earlier decrement, so the caller may then mutate in place. Always
    /// `false` for immortal counts.
    #[inline]
    pub fn is_one(&self) -> bool {
        self.count.load(Ordering::Acquire) == REF_INCREMENT
    }

    /// Is this count immortal?
    #[inline]
    pub fn is_immortal(&self) -> bool {
        self.count.load(Ordering::Relaxed) & IMMORTAL_FLAG != 0
    }
}

impl Default for Refcount {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Refcount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Refcount")
            .field("count", &self.get())
            .field("immortal", &self.is_immortal())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::vec::Vec;

    #[test]
    fn starts_at_one() {
        let count = Refcount::new();
        assert!(count.is_one());
        assert!(!count.is_immortal());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn balanced_increments_and_decrements() {
        let count = Refcount::new();
        count.increment();
        count.increment();
        assert_eq!(count.get(), 3);
        assert!(!count.is_one());

        assert!(count.decrement());
        assert!(count.decrement_expect_high());
        assert!(count.is_one());
        assert!(!count.decrement());
    }

    #[test]
    fn last_expect_high_decrement_reports_zero() {
        let count = Refcount::new();
        assert!(!count.decrement_expect_high());
    }

    #[test]
    fn immortal_never_reaches_zero() {
        let count = Refcount::immortal();
        assert!(count.is_immortal());
        assert!(!count.is_one());
        for _ in 0..100 {
            assert!(count.decrement());
            assert!(count.decrement_expect_high());
        }
        count.increment();
        assert!(count.is_immortal());
        assert!(!count.is_one());
    }

    #[test]
    fn concurrent_balanced_operations_reach_zero_once() {
        const THREADS: usize = 8;
        const ITERS: usize = 10_000;

        let count = Refcount::new();
        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    for _ in 0..ITERS {
                        count.increment();
                        assert!(count.decrement_expect_high());
                    }
                });
            }
        });
        assert!(count.is_one());
        assert!(!count.decrement());
    }

    #[test]
    fn increment_visible_to_is_one() {
        let count = Refcount::new();
        let published = AtomicBool::new(false);

        thread::scope(|s| {
            s.spawn(|| {
                count.increment();
                published.store(true, Ordering::Release);
            });
            s.spawn(|| {
                while !published.load(Ordering::Acquire) {
                    std::hint::spin_loop();
                }
                assert!(!count.is_one());
            });
        });

        let results: Vec<bool> = (0..2).map(|_| count.decrement()).collect();
        assert_eq!(results, [true, false]);
    }
}
