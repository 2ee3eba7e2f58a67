//! Reference-counted rope nodes.
//!
//! A node is a header (`length`, `refcount`, `tag`) followed by kind-specific
//! fields. The tag alone decides the kind, and destruction dispatches on it:
//!
//! * **Buffer** nodes store their payload inline, right after the header, in an
//!   allocation whose size class is encoded in the tag (see [`crate::tag`]).
//! * **External** nodes point at bytes owned by someone else and carry a
//!   type-erased releaser that runs exactly once when the node dies.
//! * **Range** nodes are an offset and length view into a buffer or external
//!   node. They never point at another range node.
//!
//! [`NodeRef`] is the owning handle: it holds exactly one reference, cloning it
//! adds one, and dropping it releases one.

use core::fmt;
use core::mem;
use core::ptr::{self, NonNull};
use core::slice;

use crate::refcount::Refcount;
use crate::tag;

mod buffer;
mod external;
mod range;

pub use external::{ExternalNode, Releaser, WithData};
pub use range::RangeNode;

/// Sub-ranges shorter than this are cheaper to copy than to share.
pub const MAX_BYTES_TO_COPY: usize = 511;

/// The header shared by every node kind.
#[repr(C)]
pub(crate) struct Node {
    pub(crate) length: usize,
    pub(crate) refcount: Refcount,
    pub(crate) tag: u8,
}

impl Node {
    #[inline]
    pub(crate) const fn new(length: usize, tag: u8) -> Self {
        Node {
            length,
            refcount: Refcount::new(),
            tag,
        }
    }
}

/// The kind of a node, as decoded from its tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// The payload lives inline after the node header.
    Buffer,
    /// The payload is owned by someone else and released through a callback.
    External,
    /// A view into a buffer or external node.
    Range,
}

/// An owning reference to a node.
///
/// `NodeRef` is a single pointer in size, and `Option<NodeRef>` is too.
#[repr(transparent)]
pub struct NodeRef {
    ptr: NonNull<Node>,
}

// Safety: node headers are only mutated through atomics, or through a
// `&mut NodeRef` that has proven it holds the only reference. Releasers are
// `Send`, and owned payloads are `Send + Sync`.
unsafe impl Send for NodeRef {}
unsafe impl Sync for NodeRef {}

impl NodeRef {
    /// Take ownership of a freshly created node holding one reference.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live node whose tag matches its layout, and the
    /// caller must be transferring one reference.
    #[inline]
    pub(crate) unsafe fn from_node(ptr: NonNull<Node>) -> Self {
        NodeRef { ptr }
    }

    #[inline]
    pub(crate) fn node(&self) -> &Node {
        // Safety: we hold a reference, so the node is alive.
        unsafe { self.ptr.as_ref() }
    }

    /// Get the shared, immortal, empty node.
    #[inline]
    pub fn empty() -> NodeRef {
        static EMPTY: ExternalNode = ExternalNode::new_static(&[]);
        NodeRef::from_static(&EMPTY)
    }

    /// The number of bytes this node represents.
    #[inline]
    pub fn len(&self) -> usize {
        self.node().length
    }

    /// Does this node represent zero bytes?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// This node's raw tag.
    #[inline]
    pub fn tag(&self) -> u8 {
        self.node().tag
    }

    /// This node's kind.
    pub fn kind(&self) -> NodeKind {
        match self.tag() {
            tag::RANGE => NodeKind::Range,
            tag::EXTERNAL => NodeKind::External,
            t if tag::is_buffer(t) => NodeKind::Buffer,
            t => invalid_tag(t),
        }
    }

    /// The number of references to this node.
    ///
    /// Immortal nodes report an unspecified count.
    #[inline]
    pub fn refcount(&self) -> usize {
        self.node().refcount.get()
    }

    /// Is this the only reference to the node?
    ///
    /// When this returns `true`, all writes made through references that have
    /// since been dropped are visible to the caller.
    #[inline]
    pub fn is_unique(&self) -> bool {
        self.node().refcount.is_one()
    }

    /// Is this node immortal?
    #[inline]
    pub fn is_immortal(&self) -> bool {
        self.node().refcount.is_immortal()
    }

    /// Do `a` and `b` reference the same node?
    #[inline]
    pub fn ptr_eq(a: &NodeRef, b: &NodeRef) -> bool {
        a.ptr == b.ptr
    }

    /// The node's bytes.
    ///
    /// Every node kind is contiguous, so this never copies.
    pub fn as_bytes(&self) -> &[u8] {
        let len = self.len();
        match self.tag() {
            tag::RANGE => {
                let range = self.as_range_unchecked();
                &range.child().as_bytes()[range.start()..][..len]
            }
            tag::EXTERNAL => {
                // Safety: the tag says this is an external node, and we hold a
                // reference to it.
                unsafe { external::bytes(self.ptr.cast()) }
            }
            t if tag::is_buffer(t) => {
                // Safety: the first `length` bytes of a buffer's payload are
                // initialized.
                unsafe { slice::from_raw_parts(buffer::data(self.ptr), len) }
            }
            t => invalid_tag(t),
        }
    }

    /// The payload capacity of a buffer node, or `None` for other kinds.
    #[inline]
    pub fn capacity(&self) -> Option<usize> {
        let t = self.tag();
        tag::is_buffer(t).then(|| tag::length_for(t))
    }

    /// View this node as a range node, if it is one.
    #[inline]
    pub fn as_range(&self) -> Option<&RangeNode> {
        (self.tag() == tag::RANGE).then(|| self.as_range_unchecked())
    }

    #[inline]
    fn as_range_unchecked(&self) -> &RangeNode {
        debug_assert_eq!(self.tag(), tag::RANGE);
        // Safety: range nodes are `#[repr(C)]` with the header first.
        unsafe { self.ptr.cast::<RangeNode>().as_ref() }
    }

    /// Append as much of `data` as fits into this node's spare capacity,
    /// returning the number of bytes appended.
    ///
    /// Only a buffer node held through its only reference is written to;
    /// anything else appends nothing, and the caller should copy instead.
    pub fn append_in_place(&mut self, data: &[u8]) -> usize {
        let t = self.tag();
        if !tag::is_buffer(t) || !self.is_unique() {
            return 0;
        }
        let len = self.len();
        let n = data.len().min(tag::length_for(t) - len);
        // Safety: we hold the only reference, the destination is within the
        // buffer's capacity, and `data` cannot alias a node we uniquely own.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), buffer::data(self.ptr).add(len), n);
            (*self.ptr.as_ptr()).length = len + n;
        }
        n
    }

    /// Create a node representing `n` bytes of this node starting at `pos`.
    ///
    /// A request for the whole node returns a new reference to this node. A
    /// request into a range node is rebased onto that range's child, so the
    /// result is never a range of a range.
    ///
    /// # Panics
    ///
    /// Panics unless `n > 0`, `pos < self.len()`, and `n <= self.len() - pos`.
    pub fn sub_range(&self, pos: usize, n: usize) -> NodeRef {
        let len = self.len();
        assert!(
            n > 0 && pos < len && n <= len - pos,
            "invalid sub-range of {n} bytes at {pos} in a node of {len} bytes"
        );
        if n == len {
            return self.clone();
        }
        match self.as_range() {
            Some(range) => RangeNode::new(range.child().clone(), range.start() + pos, n),
            None => RangeNode::new(self.clone(), pos, n),
        }
    }

    /// Like [`NodeRef::sub_range`], but a partial range of at most
    /// [`MAX_BYTES_TO_COPY`] bytes is copied into a fresh buffer node instead
    /// of keeping the whole node alive.
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`NodeRef::sub_range`].
    pub fn sub_range_or_copy(&self, pos: usize, n: usize) -> NodeRef {
        let len = self.len();
        if n == len || n > MAX_BYTES_TO_COPY {
            return self.sub_range(pos, n);
        }
        assert!(
            n > 0 && pos < len && n <= len - pos,
            "invalid sub-range of {n} bytes at {pos} in a node of {len} bytes"
        );
        NodeRef::copy_from_slice(&self.as_bytes()[pos..][..n])
    }

    /// Consume this reference, returning the raw node pointer.
    ///
    /// The reference is leaked until it is passed to [`NodeRef::from_raw`].
    #[inline]
    pub fn into_raw(self) -> NonNull<()> {
        let ptr = self.ptr.cast();
        mem::forget(self);
        ptr
    }

    /// Reclaim a reference previously leaked with [`NodeRef::into_raw`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `NodeRef::into_raw`, and each leaked reference
    /// may be reclaimed only once.
    #[inline]
    pub unsafe fn from_raw(ptr: NonNull<()>) -> NodeRef {
        NodeRef { ptr: ptr.cast() }
    }
}

impl Clone for NodeRef {
    #[inline]
    fn clone(&self) -> Self {
        self.node().refcount.increment();
        NodeRef { ptr: self.ptr }
    }
}

impl Drop for NodeRef {
    #[inline]
    fn drop(&mut self) {
        if !self.node().refcount.decrement_expect_high() {
            // Safety: that was the last reference.
            unsafe { destroy(self.ptr) }
        }
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("NodeRef");
        s.field("kind", &self.kind()).field("len", &self.len());
        if let Some(range) = self.as_range() {
            s.field("start", &range.start());
        }
        s.field("refcount", &self.node().refcount).finish()
    }
}

/// Free a node whose last reference was just dropped.
#[cold]
unsafe fn destroy(ptr: NonNull<Node>) {
    let t = ptr.as_ref().tag;
    match t {
        tag::RANGE => range::destroy(ptr.cast()),
        tag::EXTERNAL => external::destroy(ptr.cast()),
        t if tag::is_buffer(t) => buffer::deallocate(ptr, t),
        t => invalid_tag(t),
    }
}

#[cold]
#[inline(never)]
fn invalid_tag(tag: u8) -> ! {
    log::error!("encountered a node with invalid tag {tag}");
    panic!("invalid node tag: {tag}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    fn buffer_of(data: &[u8]) -> NodeRef {
        let node = NodeRef::copy_from_slice(data);
        assert_eq!(node.kind(), NodeKind::Buffer);
        node
    }

    #[test]
    fn clone_and_drop_are_balanced() {
        let node = buffer_of(b"hello");
        let clones: Vec<NodeRef> = (0..10).map(|_| node.clone()).collect();
        assert_eq!(node.refcount(), 11);
        assert!(!node.is_unique());
        drop(clones);
        assert!(node.is_unique());
        assert_eq!(node.as_bytes(), b"hello");
    }

    #[test]
    fn concurrent_clones_release_external_once() {
        let _ = env_logger::try_init();

        struct Owner(Box<[u8]>, Arc<AtomicUsize>);

        impl AsRef<[u8]> for Owner {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl Drop for Owner {
            fn drop(&mut self) {
                self.1.fetch_add(1, Ordering::SeqCst);
            }
        }

        let released = Arc::new(AtomicUsize::new(0));
        let node = NodeRef::from_owner(Owner(Box::from(&b"shared"[..]), released.clone()));
        assert_eq!(node.kind(), NodeKind::External);

        thread::scope(|s| {
            for _ in 0..8 {
                let node = node.clone();
                s.spawn(move || {
                    for _ in 0..1000 {
                        let extra = node.clone();
                        assert_eq!(extra.as_bytes(), b"shared");
                    }
                });
            }
        });

        assert!(node.is_unique());
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(node);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sub_range_of_range_is_rebased() {
        let base = buffer_of(b"0123456789abcdefghij");
        let outer = base.sub_range(5, 10);
        assert_eq!(outer.kind(), NodeKind::Range);
        assert_eq!(outer.as_bytes(), b"56789abcde");

        let inner = outer.sub_range(2, 3);
        let range = inner.as_range().unwrap();
        assert_eq!(range.start(), 7);
        assert!(NodeRef::ptr_eq(range.child(), &base));
        assert_eq!(inner.as_bytes(), b"789");
        assert_eq!(base.refcount(), 3);
    }

    #[test]
    fn full_sub_range_shares_the_node() {
        let node = buffer_of(b"whole");
        let same = node.sub_range(0, 5);
        assert!(NodeRef::ptr_eq(&node, &same));
        assert_eq!(node.refcount(), 2);

        let range = node.sub_range(1, 3);
        let same_range = range.sub_range(0, 3);
        assert!(NodeRef::ptr_eq(&range, &same_range));
    }

    #[test]
    fn small_sub_ranges_are_copied() {
        let data: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
        let node = buffer_of(&data);

        let small = node.sub_range_or_copy(10, MAX_BYTES_TO_COPY);
        assert_eq!(small.kind(), NodeKind::Buffer);
        assert_eq!(small.as_bytes(), &data[10..][..MAX_BYTES_TO_COPY]);
        assert!(node.is_unique());

        let large = node.sub_range_or_copy(10, MAX_BYTES_TO_COPY + 1);
        assert_eq!(large.kind(), NodeKind::Range);
        assert_eq!(large.as_bytes(), &data[10..][..MAX_BYTES_TO_COPY + 1]);
        assert_eq!(node.refcount(), 2);

        let whole = node.sub_range_or_copy(0, data.len());
        assert!(NodeRef::ptr_eq(&whole, &node));
    }

    #[test]
    #[should_panic(expected = "invalid sub-range")]
    fn small_out_of_bounds_copy_panics() {
        buffer_of(b"abc").sub_range_or_copy(2, 2);
    }

    #[test]
    fn dropping_a_range_releases_its_child() {
        let node = buffer_of(b"abcdef");
        let range = node.sub_range(1, 2);
        assert_eq!(node.refcount(), 2);
        drop(range);
        assert!(node.is_unique());
    }

    #[test]
    #[should_panic(expected = "invalid sub-range")]
    fn empty_sub_range_panics() {
        buffer_of(b"abc").sub_range(1, 0);
    }

    #[test]
    #[should_panic(expected = "invalid sub-range")]
    fn out_of_bounds_sub_range_panics() {
        buffer_of(b"abc").sub_range(2, 2);
    }

    #[test]
    fn append_in_place_requires_unique_buffer() {
        let mut node = NodeRef::new_buffer(4);
        let cap = node.capacity().unwrap();
        assert_eq!(node.append_in_place(b"abc"), 3);

        let shared = node.clone();
        assert_eq!(node.append_in_place(b"def"), 0);
        drop(shared);
        assert_eq!(node.append_in_place(b"def"), 3);
        assert_eq!(node.as_bytes(), b"abcdef");

        let filler = std::vec![b'x'; cap];
        assert_eq!(node.append_in_place(&filler), cap - 6);
        assert_eq!(node.len(), cap);
        assert_eq!(node.append_in_place(b"y"), 0);

        let mut range = node.sub_range(1, 2);
        assert_eq!(range.append_in_place(b"z"), 0);
    }

    #[test]
    fn unique_ownership_is_visible_across_threads() {
        let mut node = NodeRef::new_buffer(64);
        let other = node.clone();

        thread::spawn(move || {
            assert_eq!(other.len(), 0);
            drop(other);
        })
        .join()
        .unwrap();

        assert!(node.is_unique());
        assert_eq!(node.append_in_place(b"mine"), 4);
        assert_eq!(node.as_bytes(), b"mine");
    }

    #[test]
    fn raw_round_trip_keeps_the_reference() {
        let node = buffer_of(b"raw");
        let other = node.clone();
        let raw = other.into_raw();
        assert_eq!(node.refcount(), 2);
        let back = unsafe { NodeRef::from_raw(raw) };
        assert!(NodeRef::ptr_eq(&node, &back));
        drop(back);
        assert!(node.is_unique());
    }

    #[test]
    fn empty_node_is_immortal() {
        let a = NodeRef::empty();
        let b = NodeRef::empty();
        assert!(NodeRef::ptr_eq(&a, &b));
        assert!(a.is_immortal());
        assert!(a.is_empty());
        assert!(!a.is_unique());
        assert_eq!(a.kind(), NodeKind::External);
        assert_eq!(a.as_bytes(), b"");
    }

    #[test]
    fn node_ref_is_pointer_sized() {
        assert_eq!(mem::size_of::<NodeRef>(), mem::size_of::<usize>());
        assert_eq!(mem::size_of::<Option<NodeRef>>(), mem::size_of::<usize>());
    }
}
