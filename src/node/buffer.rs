//! Buffer nodes: the payload lives in the same allocation as the header.

use core::alloc::Layout;
use core::mem;
use core::ptr::{self, NonNull};

use alloc::alloc::handle_alloc_error;
use alloc::boxed::Box;

use super::{Node, NodeRef};
use crate::tag::{self, BUFFER_OVERHEAD};
use crate::{Allocator, Global};

/// The layout of a buffer node allocation with the given tag.
#[inline]
fn layout_for(t: u8) -> Layout {
    debug_assert!(tag::is_buffer(t));
    // Safety: `size_for` is bounded by `MAX_LARGE_BUFFER_SIZE`, a multiple of
    // the header alignment, which is a power of two.
    unsafe { Layout::from_size_align_unchecked(tag::size_for(t), mem::align_of::<Node>()) }
}

/// Allocate an empty buffer node with room for at least `len` bytes, clamped
/// to `max_len`.
fn allocate(len: usize, max_len: usize) -> NodeRef {
    let len = len.clamp(tag::MIN_BUFFER_LENGTH, max_len);
    let t = tag::tag_for(tag::round_up_for_tag(len + BUFFER_OVERHEAD));
    let layout = layout_for(t);
    let ptr = match Global.allocate(layout) {
        Ok(ptr) => ptr.cast::<Node>(),
        Err(_) => handle_alloc_error(layout),
    };
    // Safety: the allocation is large enough and aligned for a node header.
    unsafe {
        ptr.as_ptr().write(Node::new(0, t));
        NodeRef::from_node(ptr)
    }
}

/// Pointer to the first payload byte of the buffer node at `ptr`.
///
/// Derived from the allocation pointer rather than a header reference, so it
/// may be used to access the whole payload.
#[inline]
pub(super) fn data(ptr: NonNull<Node>) -> *mut u8 {
    // Safety: every buffer allocation is larger than its header.
    unsafe { ptr.as_ptr().cast::<u8>().add(BUFFER_OVERHEAD) }
}

/// Free a buffer node whose last reference is gone.
///
/// # Safety
///
/// `ptr` must be a buffer node with tag `t` and no remaining references.
pub(super) unsafe fn deallocate(ptr: NonNull<Node>, t: u8) {
    log::trace!("freeing buffer node of {} bytes", tag::size_for(t));
    Global.deallocate(ptr.cast(), layout_for(t));
}

impl NodeRef {
    /// Create an empty buffer node with capacity for at least `len` bytes.
    ///
    /// The request is clamped to `[MIN_BUFFER_LENGTH, MAX_BUFFER_LENGTH]`, so
    /// the capacity may be less than `len` for very large requests.
    #[inline]
    pub fn new_buffer(len: usize) -> NodeRef {
        allocate(len, tag::MAX_BUFFER_LENGTH)
    }

    /// Like [`NodeRef::new_buffer`], but allows capacities up to
    /// `MAX_LARGE_BUFFER_LENGTH`.
    #[inline]
    pub fn new_large_buffer(len: usize) -> NodeRef {
        allocate(len, tag::MAX_LARGE_BUFFER_LENGTH)
    }

    /// Create a node holding a copy of `data`.
    ///
    /// Small data gets a regular buffer node, larger data a large buffer node,
    /// and anything bigger than the largest size class an external node that
    /// owns a heap copy.
    pub fn copy_from_slice(data: &[u8]) -> NodeRef {
        let mut node = if data.len() <= tag::MAX_BUFFER_LENGTH {
            NodeRef::new_buffer(data.len())
        } else if data.len() <= tag::MAX_LARGE_BUFFER_LENGTH {
            NodeRef::new_large_buffer(data.len())
        } else {
            return NodeRef::from_owner(Box::<[u8]>::from(data));
        };
        let written = node.append_in_place(data);
        debug_assert_eq!(written, data.len());
        node
    }

    /// Create a buffer node holding a copy of `data`, with room to append at
    /// least `extra` more bytes when that fits in a regular buffer node.
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than `MAX_BUFFER_LENGTH`.
    pub fn buffer_with_extra(data: &[u8], extra: usize) -> NodeRef {
        assert!(
            data.len() <= tag::MAX_BUFFER_LENGTH,
            "{} bytes do not fit in a buffer node",
            data.len()
        );
        let node = NodeRef::new_buffer(data.len().saturating_add(extra));
        // Safety: a fresh node is unique and its capacity covers `data`.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self::data(node.ptr), data.len());
            (*node.ptr.as_ptr()).length = data.len();
        }
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeKind;
    use std::vec::Vec;

    #[test]
    fn small_requests_get_the_minimum_buffer() {
        let node = NodeRef::new_buffer(1);
        assert_eq!(node.tag(), tag::BUFFER);
        assert_eq!(node.capacity(), Some(tag::MIN_BUFFER_LENGTH));
        assert!(node.is_empty());
        assert!(node.is_unique());
    }

    #[test]
    fn capacity_covers_the_request() {
        for len in [0, 17, 100, 496, 497, 1000, 4000, tag::MAX_BUFFER_LENGTH] {
            let node = NodeRef::new_buffer(len);
            let cap = node.capacity().unwrap();
            assert!(cap >= len, "len {len} cap {cap}");
            assert_eq!(tag::size_for(node.tag()), cap + BUFFER_OVERHEAD);
        }
    }

    #[test]
    fn regular_buffers_are_clamped() {
        let node = NodeRef::new_buffer(tag::MAX_BUFFER_LENGTH * 4);
        assert_eq!(node.capacity(), Some(tag::MAX_BUFFER_LENGTH));

        let large = NodeRef::new_large_buffer(tag::MAX_BUFFER_LENGTH * 4);
        assert!(large.capacity().unwrap() >= tag::MAX_BUFFER_LENGTH * 4);

        let huge = NodeRef::new_large_buffer(usize::MAX / 2);
        assert_eq!(huge.tag(), tag::MAX_BUFFER_TAG);
        assert_eq!(huge.capacity(), Some(tag::MAX_LARGE_BUFFER_LENGTH));
    }

    #[test]
    fn copy_from_slice_picks_a_representation() {
        let small = NodeRef::copy_from_slice(b"tiny");
        assert_eq!(small.kind(), NodeKind::Buffer);
        assert_eq!(small.as_bytes(), b"tiny");

        let medium: Vec<u8> = (0..10_000).map(|i| i as u8).collect();
        let node = NodeRef::copy_from_slice(&medium);
        assert_eq!(node.kind(), NodeKind::Buffer);
        assert!(node.capacity().unwrap() > tag::MAX_BUFFER_LENGTH);
        assert_eq!(node.as_bytes(), &medium[..]);

        let big = std::vec![7u8; tag::MAX_LARGE_BUFFER_LENGTH + 1];
        let node = NodeRef::copy_from_slice(&big);
        assert_eq!(node.kind(), NodeKind::External);
        assert_eq!(node.as_bytes(), &big[..]);
    }

    #[test]
    fn buffer_with_extra_reserves_room() {
        let mut node = NodeRef::buffer_with_extra(b"head", 100);
        assert_eq!(node.as_bytes(), b"head");
        assert!(node.capacity().unwrap() >= 104);
        assert_eq!(node.append_in_place(b"-tail"), 5);
        assert_eq!(node.as_bytes(), b"head-tail");

        let capped = NodeRef::buffer_with_extra(b"x", usize::MAX);
        assert_eq!(capped.capacity(), Some(tag::MAX_BUFFER_LENGTH));
    }
}
