//! Range nodes: a view of part of another node.

use core::ptr::NonNull;

use alloc::boxed::Box;

use super::{Node, NodeKind, NodeRef};
use crate::tag;

/// A range node: `length` bytes of `child`, starting at `start`.
///
/// The child of a range node is always a buffer or external node.
#[repr(C)]
pub struct RangeNode {
    node: Node,
    start: usize,
    child: NodeRef,
}

impl RangeNode {
    /// Wrap `n` bytes of `child` starting at `start` in a new range node.
    pub(super) fn new(child: NodeRef, start: usize, n: usize) -> NodeRef {
        match child.kind() {
            NodeKind::Buffer | NodeKind::External => {}
            NodeKind::Range => invalid_child(),
        }
        debug_assert!(0 < n && n < child.len());
        debug_assert!(start <= child.len() - n);
        let node = Box::new(RangeNode {
            node: Node::new(n, tag::RANGE),
            start,
            child,
        });
        // Safety: `Box::into_raw` is never null, and the header comes first.
        unsafe { NodeRef::from_node(NonNull::new_unchecked(Box::into_raw(node)).cast()) }
    }

    /// The offset of this range within its child.
    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    /// The number of bytes in this range.
    #[inline]
    pub fn len(&self) -> usize {
        self.node.length
    }

    /// Is this range empty? Never true for a well-formed range node.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The buffer or external node this range views.
    #[inline]
    pub fn child(&self) -> &NodeRef {
        &self.child
    }
}

#[cold]
#[inline(never)]
fn invalid_child() -> ! {
    log::error!("attempted to create a range node over another range node");
    panic!("range nodes may only wrap buffer or external nodes")
}

/// Free a range node whose last reference is gone, releasing its child.
///
/// # Safety
///
/// `ptr` must be a range node with no remaining references.
pub(super) unsafe fn destroy(ptr: NonNull<RangeNode>) {
    drop(Box::from_raw(ptr.as_ptr()));
}
