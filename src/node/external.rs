//! External nodes: the payload is owned by someone else.
//!
//! An external node is created with a releaser, and that releaser is called
//! exactly once, with the node's final bytes, when the last reference to the
//! node goes away. The releaser is stored in the same heap allocation as the
//! node, behind a type-erased function pointer, so every external node has the
//! same header regardless of its releaser's type.

use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::ptr::{self, addr_of, NonNull};
use core::slice;

use alloc::boxed::Box;

use super::{Node, NodeRef};
use crate::refcount::Refcount;
use crate::tag;

/// The header of an external node.
///
/// Outside this crate, values of this type can only be created with
/// [`ExternalNode::new_static`], to build immortal constants in `static`
/// items.
#[repr(C)]
pub struct ExternalNode {
    node: Node,
    base: *const u8,
    release: Option<unsafe fn(NonNull<ExternalNode>)>,
}

// Safety: `base` is only ever read through, and immortal nodes have no
// releaser.
unsafe impl Sync for ExternalNode {}

impl ExternalNode {
    /// Create an immortal external node over `bytes`, suitable for a `static`.
    ///
    /// ```
    /// use rope_rep::{ExternalNode, NodeRef};
    ///
    /// static GREETING: ExternalNode = ExternalNode::new_static(b"hello");
    ///
    /// let node = NodeRef::from_static(&GREETING);
    /// assert!(node.is_immortal());
    /// assert_eq!(node.as_bytes(), b"hello");
    /// ```
    pub const fn new_static(bytes: &'static [u8]) -> ExternalNode {
        ExternalNode {
            node: Node {
                length: bytes.len(),
                refcount: Refcount::immortal(),
                tag: tag::EXTERNAL,
            },
            base: bytes.as_ptr(),
            release: None,
        }
    }
}

/// A callback that releases an external node's memory.
///
/// Implemented for closures taking the released bytes, `FnOnce(&[u8])`, and
/// for closures taking nothing, `FnOnce()`. The `M` parameter only tells the
/// two apart and is always inferred.
pub trait Releaser<M>: Send + 'static {
    /// Release `data`, the bytes of the node being destroyed.
    fn release(self, data: &[u8]);
}

/// Marker for releasers that take the released bytes.
#[derive(Debug)]
pub enum WithData {}

impl<F> Releaser<WithData> for F
where
    F: FnOnce(&[u8]) + Send + 'static,
{
    #[inline]
    fn release(self, data: &[u8]) {
        self(data)
    }
}

impl<F> Releaser<()> for F
where
    F: FnOnce() + Send + 'static,
{
    #[inline]
    fn release(self, _data: &[u8]) {
        self()
    }
}

/// What actually runs when an external node is destroyed.
trait Release: Send + 'static {
    /// Release the `len` bytes at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads of `len` bytes.
    unsafe fn release(self, base: *const u8, len: usize);
}

struct ReleaserFn<R, M>(R, PhantomData<fn() -> M>);

impl<R, M> Release for ReleaserFn<R, M>
where
    R: Releaser<M>,
    M: 'static,
{
    #[inline]
    unsafe fn release(self, base: *const u8, len: usize) {
        self.0.release(slice::from_raw_parts(base, len))
    }
}

/// Owns the payload itself; releasing just drops the owner.
struct DropOwner<B>(B);

impl<B> Release for DropOwner<B>
where
    B: Send + Sync + 'static,
{
    #[inline]
    unsafe fn release(self, _base: *const u8, _len: usize) {
        drop(self.0)
    }
}

#[repr(C)]
struct ExternalImpl<R> {
    ext: ExternalNode,
    releaser: ManuallyDrop<R>,
}

impl<R> ExternalImpl<R>
where
    R: Release,
{
    fn boxed(base: *const u8, len: usize, releaser: R) -> NonNull<ExternalImpl<R>> {
        let node = Box::new(ExternalImpl {
            ext: ExternalNode {
                node: Node::new(len, tag::EXTERNAL),
                base,
                release: Some(Self::release_and_free),
            },
            releaser: ManuallyDrop::new(releaser),
        });
        // Safety: `Box::into_raw` is never null.
        unsafe { NonNull::new_unchecked(Box::into_raw(node)) }
    }

    unsafe fn release_and_free(ptr: NonNull<ExternalNode>) {
        let this = ptr.cast::<Self>().as_ptr();
        let base = (*this).ext.base;
        let len = (*this).ext.node.length;
        log::trace!("releasing external node of {len} bytes");
        let releaser = ManuallyDrop::into_inner(ptr::read(addr_of!((*this).releaser)));
        releaser.release(base, len);
        drop(Box::from_raw(this));
    }
}

/// The bytes of the external node at `ptr`.
///
/// # Safety
///
/// `ptr` must be a live external node, and the returned slice must not outlive
/// the reference the caller holds.
#[inline]
pub(super) unsafe fn bytes<'a>(ptr: NonNull<ExternalNode>) -> &'a [u8] {
    let ext = ptr.as_ref();
    slice::from_raw_parts(ext.base, ext.node.length)
}

/// Run the releaser of an external node whose last reference is gone.
///
/// # Safety
///
/// `ptr` must be an external node with no remaining references.
pub(super) unsafe fn destroy(ptr: NonNull<ExternalNode>) {
    let release = ptr.as_ref().release;
    debug_assert!(release.is_some(), "immortal external node was destroyed");
    if let Some(release) = release {
        release(ptr);
    }
}

impl NodeRef {
    /// Create an external node over `len` bytes at `base`.
    ///
    /// `releaser` is called exactly once, when the last reference to the node
    /// is dropped. It may take the node's bytes, `|data: &[u8]| ...`, or
    /// nothing, `|| ...`.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads of `len` bytes from any thread, and the
    /// bytes must not be mutated, until `releaser` is called.
    pub unsafe fn from_external_parts<R, M>(base: *const u8, len: usize, releaser: R) -> NodeRef
    where
        R: Releaser<M>,
        M: 'static,
    {
        let ptr = ExternalImpl::boxed(base, len, ReleaserFn(releaser, PhantomData));
        NodeRef::from_node(ptr.cast())
    }

    /// Create an external node that owns `owner` and represents its bytes.
    ///
    /// The owner is dropped when the last reference to the node goes away.
    ///
    /// ```
    /// use rope_rep::{NodeKind, NodeRef};
    ///
    /// let node = NodeRef::from_owner(vec![1u8, 2, 3]);
    /// assert_eq!(node.kind(), NodeKind::External);
    /// assert_eq!(node.as_bytes(), &[1, 2, 3]);
    /// ```
    pub fn from_owner<B>(owner: B) -> NodeRef
    where
        B: AsRef<[u8]> + Send + Sync + 'static,
    {
        let ptr = ExternalImpl::boxed(ptr::null(), 0, DropOwner(owner));
        // Safety: the owner has reached its final address inside the node, so
        // the bytes it lends out stay put until it is dropped.
        unsafe {
            let this = ptr.as_ptr();
            let owner: &ManuallyDrop<DropOwner<B>> = &(*this).releaser;
            let data = owner.0.as_ref();
            (*this).ext.base = data.as_ptr();
            (*this).ext.node.length = data.len();
            NodeRef::from_node(ptr.cast())
        }
    }

    /// Get a reference to an immortal external node.
    #[inline]
    pub fn from_static(node: &'static ExternalNode) -> NodeRef {
        debug_assert!(node.node.refcount.is_immortal());
        node.node.refcount.increment();
        // Safety: immortal nodes are never destroyed.
        unsafe { NodeRef::from_node(NonNull::from(node).cast()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::vec::Vec;

    #[test]
    fn releaser_sees_the_final_bytes_once() {
        let data: &'static [u8] = b"external bytes";
        let seen = Arc::new(Mutex::new(Vec::new()));
        let node = {
            let seen = seen.clone();
            unsafe {
                NodeRef::from_external_parts(data.as_ptr(), data.len(), move |bytes: &[u8]| {
                    seen.lock().unwrap().push(bytes.to_vec());
                })
            }
        };
        assert_eq!(node.kind(), NodeKind::External);
        assert_eq!(node.as_bytes(), data);

        let range = node.sub_range(9, 5);
        drop(node);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(range.as_bytes(), b"bytes");

        drop(range);
        assert_eq!(*seen.lock().unwrap(), [data.to_vec()]);
    }

    #[test]
    fn releaser_without_arguments() {
        let count = Arc::new(AtomicUsize::new(0));
        let node = {
            let count = count.clone();
            unsafe {
                NodeRef::from_external_parts(b"abc".as_ptr(), 3, move || {
                    count.fetch_add(1, Ordering::SeqCst);
                })
            }
        };
        let clone = node.clone();
        drop(node);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        drop(clone);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn owner_with_inline_bytes() {
        let node = NodeRef::from_owner([9u8; 40]);
        assert_eq!(node.len(), 40);
        assert!(node.as_bytes().iter().all(|b| *b == 9));
        assert_eq!(node.capacity(), None);

        // The bytes are read from the owner where it lives inside the node,
        // not from where it was before being moved in.
        let raw = node.clone().into_raw();
        let start = raw.as_ptr() as usize;
        let end = start + core::mem::size_of::<ExternalImpl<DropOwner<[u8; 40]>>>();
        let bytes = node.as_bytes().as_ptr() as usize;
        assert!(start <= bytes && bytes + 40 <= end);
        drop(unsafe { NodeRef::from_raw(raw) });
        assert!(node.is_unique());
    }

    #[test]
    fn static_nodes_are_immortal() {
        static NODE: ExternalNode = ExternalNode::new_static(b"forever");
        let nodes: Vec<NodeRef> = (0..4).map(|_| NodeRef::from_static(&NODE)).collect();
        for node in &nodes {
            assert!(node.is_immortal());
            assert_eq!(node.as_bytes(), b"forever");
        }
        drop(nodes);
        let node = NodeRef::from_static(&NODE);
        assert_eq!(node.sub_range(3, 4).as_bytes(), b"ever");
    }
}
