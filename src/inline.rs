//! A 16-byte value that is either a short inline byte string or a reference
//! to a node tree.
//!
//! Layout, with byte 0 doubling as the discriminant:
//!
//! ```text
//! inline:  [ size << 1 | payload (up to 15 bytes)                         ]
//! tree:    [ sample slot (u64, little endian, bit 0 set) | root NodeRef   ]
//! ```
//!
//! The sample slot holds `1` when the value is not sampled, or the address of
//! its `SampleInfo` with bit 0 set. Either way bit 0 of byte 0 is set for
//! trees and clear for inline values, independent of host byte order.
//!
//! In debug builds the unused tail of an inline value is filled with a poison
//! pattern after every mutation, and every observer of the raw bytes reads a
//! copy with that tail zeroed.

use core::cmp::Ordering;
use core::fmt;
use core::mem::{self, ManuallyDrop};
use core::ptr::{self, addr_of, addr_of_mut};

#[cfg(feature = "sampling")]
use core::ptr::NonNull;

use crate::node::NodeRef;
#[cfg(feature = "sampling")]
use crate::sample::SampleInfo;

/// The maximum number of bytes an inline value can hold.
pub const MAX_INLINE: usize = 15;

const SIZE: usize = 16;

/// Sample slot value of a tree that is not sampled.
const NULL_SLOT: u64 = 1;

/// Bit 0 of byte 0: set for trees.
const TREE_FLAG: u8 = 1;

/// Fills the unused tail of inline values in debug builds.
const POISON: u8 = 0xA5;

#[repr(C)]
struct AsTree {
    slot: [u8; 8],
    root: NodeRef,
}

#[repr(C, align(8))]
union Rep {
    bytes: [u8; SIZE],
    tree: ManuallyDrop<AsTree>,
}

/// A small value stored inline, or a reference to a node tree.
///
/// An `InlineData` in tree form owns one reference to its root.
pub struct InlineData {
    rep: Rep,
}

const _: () = assert!(mem::size_of::<InlineData>() == SIZE);

impl InlineData {
    /// Create an empty inline value.
    #[inline]
    pub const fn new() -> Self {
        InlineData {
            rep: Rep { bytes: [0; SIZE] },
        }
    }

    /// Create an inline value holding `data`.
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than [`MAX_INLINE`].
    pub fn from_inline(data: &[u8]) -> Self {
        let mut value = Self::new();
        value.write_inline(data);
        value
    }

    /// Create a tree value with the given root that is not sampled.
    pub fn from_tree(root: NodeRef) -> Self {
        let mut value = Self::new();
        value.write_tree(NULL_SLOT, root);
        value
    }

    /// Create a value holding a copy of `data`: inline when it fits, otherwise
    /// a tree whose root is a fresh node.
    pub fn copy_from(data: &[u8]) -> Self {
        if data.len() <= MAX_INLINE {
            Self::from_inline(data)
        } else {
            Self::from_tree(NodeRef::copy_from_slice(data))
        }
    }

    /// Is this value a tree?
    #[inline]
    pub fn is_tree(&self) -> bool {
        self.control() & TREE_FLAG != 0
    }

    #[inline]
    fn control(&self) -> u8 {
        // Safety: byte 0 is initialized in both forms.
        unsafe { self.rep.bytes[0] }
    }

    #[inline]
    fn tree_ptr(&self) -> *const AsTree {
        addr_of!(self.rep).cast()
    }

    #[inline]
    fn tree_ptr_mut(&mut self) -> *mut AsTree {
        addr_of_mut!(self.rep).cast()
    }

    /// Overwrite the representation with an inline value. Any tree must
    /// already have been released.
    fn write_inline(&mut self, data: &[u8]) {
        assert!(
            data.len() <= MAX_INLINE,
            "{} bytes do not fit in an inline value",
            data.len()
        );
        let mut bytes = [0; SIZE];
        bytes[0] = (data.len() as u8) << 1;
        bytes[1..][..data.len()].copy_from_slice(data);
        self.rep = Rep { bytes };
        self.poison_tail();
    }

    /// Overwrite the representation with a tree. Any tree must already have
    /// been released.
    fn write_tree(&mut self, slot: u64, root: NodeRef) {
        debug_assert!(slot & 1 == 1);
        self.rep = Rep { bytes: [0; SIZE] };
        let tree = self.tree_ptr_mut();
        // Safety: both fields are in bounds of `rep`, and the old contents
        // hold nothing that needs dropping.
        unsafe {
            addr_of_mut!((*tree).slot).write(slot.to_le_bytes());
            addr_of_mut!((*tree).root).write(root);
        }
    }

    #[inline]
    fn poison_tail(&mut self) {
        if cfg!(debug_assertions) && !self.is_tree() {
            let start = 1 + self.inline_size();
            // Safety: inline values are plain bytes.
            unsafe { self.rep.bytes[start..].fill(POISON) }
        }
    }

    /// A copy of the raw bytes of an inline value with its tail zeroed.
    fn sanitized(&self) -> [u8; SIZE] {
        debug_assert!(!self.is_tree());
        // Safety: inline values are plain bytes.
        let mut bytes = unsafe { self.rep.bytes };
        bytes[1 + self.inline_size()..].fill(0);
        bytes
    }

    /// Replace this value with inline `data`, releasing any tree.
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than [`MAX_INLINE`].
    pub fn set_inline_data(&mut self, data: &[u8]) {
        drop(self.take_tree());
        self.write_inline(data);
    }

    /// The inline payload buffer, for writing data in place. Pair with
    /// [`InlineData::set_inline_size`], in either order.
    ///
    /// # Panics
    ///
    /// Panics if this value is a tree.
    pub fn inline_buf_mut(&mut self) -> &mut [u8; MAX_INLINE] {
        assert!(!self.is_tree(), "inline buffer of a tree value");
        // Safety: inline values are plain bytes.
        let [_, payload @ ..] = unsafe { &mut self.rep.bytes };
        payload
    }

    /// Set the size of an inline value.
    ///
    /// Bytes newly covered by growing the size are unspecified until written
    /// through [`InlineData::inline_buf_mut`]: debug builds fill them with a
    /// poison pattern, release builds leave whatever was there before.
    ///
    /// # Panics
    ///
    /// Panics if this value is a tree, or if `size` exceeds [`MAX_INLINE`].
    pub fn set_inline_size(&mut self, size: usize) {
        assert!(!self.is_tree(), "inline size of a tree value");
        assert!(size <= MAX_INLINE, "inline size {size} is too large");
        // Safety: inline values are plain bytes.
        unsafe { self.rep.bytes[0] = (size as u8) << 1 };
        self.poison_tail();
    }

    /// Make this value a tree with the given root, releasing whatever it held
    /// before. The result is not sampled.
    pub fn make_tree(&mut self, root: NodeRef) {
        drop(self.take_tree());
        self.write_tree(NULL_SLOT, root);
    }

    /// Replace the root of a tree value, keeping its sample, and return the
    /// old root.
    ///
    /// # Panics
    ///
    /// Panics if this value is not a tree.
    pub fn set_tree(&mut self, root: NodeRef) -> NodeRef {
        assert!(self.is_tree(), "set_tree on an inline value");
        let tree = self.tree_ptr_mut();
        // Safety: this is a tree, so `root` holds a live reference.
        unsafe { ptr::replace(addr_of_mut!((*tree).root), root) }
    }

    /// Take the root out of a tree value, leaving an empty inline value.
    ///
    /// Any sample in the slot is forgotten; sampled values should be
    /// untracked first.
    pub fn take_tree(&mut self) -> Option<NodeRef> {
        if !self.is_tree() {
            return None;
        }
        let tree = self.tree_ptr();
        // Safety: this is a tree, and the representation is overwritten right
        // away so the reference is moved out exactly once.
        let root = unsafe { ptr::read(addr_of!((*tree).root)) };
        self.write_inline(&[]);
        Some(root)
    }

    /// Release any tree and reset to an empty inline value.
    pub fn clear(&mut self) {
        drop(self.take_tree());
        self.write_inline(&[]);
    }

    /// The size of an inline value.
    #[inline]
    pub fn inline_size(&self) -> usize {
        debug_assert!(!self.is_tree());
        (self.control() >> 1) as usize
    }

    /// The payload of an inline value, or `None` for trees.
    pub fn as_inline(&self) -> Option<&[u8]> {
        if self.is_tree() {
            return None;
        }
        // Safety: inline values are plain bytes.
        let bytes = unsafe { &self.rep.bytes };
        Some(&bytes[1..][..self.inline_size()])
    }

    /// The root of a tree value, or `None` for inline values.
    pub fn as_tree(&self) -> Option<&NodeRef> {
        if !self.is_tree() {
            return None;
        }
        // Safety: this is a tree, so `root` holds a live reference.
        Some(unsafe { &*addr_of!((*self.tree_ptr()).root) })
    }

    /// The number of bytes this value represents.
    pub fn len(&self) -> usize {
        match self.as_tree() {
            Some(root) => root.len(),
            None => self.inline_size(),
        }
    }

    /// Does this value represent zero bytes?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The bytes this value represents, following the root of a tree.
    pub fn as_bytes(&self) -> &[u8] {
        match self.as_tree() {
            Some(root) => root.as_bytes(),
            None => self.as_inline().unwrap_or_default(),
        }
    }

    /// Copy the full inline payload area, including unused bytes, which read
    /// as zero.
    ///
    /// # Panics
    ///
    /// Panics if this value is a tree.
    pub fn copy_max_inline_to(&self, dst: &mut [u8; MAX_INLINE]) {
        assert!(!self.is_tree(), "copy_max_inline_to on a tree value");
        dst.copy_from_slice(&self.sanitized()[1..]);
    }

    /// Compare two inline values as byte strings.
    ///
    /// Looks only at the inline representation and never dereferences a tree.
    ///
    /// # Panics
    ///
    /// Panics if either value is a tree.
    pub fn compare(&self, rhs: &InlineData) -> Ordering {
        assert!(
            !self.is_tree() && !rhs.is_tree(),
            "compare requires two inline values"
        );
        let lhs_bytes = self.sanitized();
        let rhs_bytes = rhs.sanitized();
        let word = |bytes: &[u8; SIZE], at: usize| {
            let mut word = [0; 8];
            word.copy_from_slice(&bytes[at..][..8]);
            u64::from_be_bytes(word)
        };
        word(&lhs_bytes, 1)
            .cmp(&word(&rhs_bytes, 1))
            .then_with(|| word(&lhs_bytes, 8).cmp(&word(&rhs_bytes, 8)))
            .then_with(|| self.inline_size().cmp(&rhs.inline_size()))
    }

    #[inline]
    fn slot(&self) -> u64 {
        assert!(self.is_tree(), "sample slot of an inline value");
        // Safety: this is a tree, so the slot is initialized.
        u64::from_le_bytes(unsafe { (*self.tree_ptr()).slot })
    }
}

#[cfg(feature = "sampling")]
impl InlineData {
    /// Is this tree value sampled?
    ///
    /// # Panics
    ///
    /// Panics if this value is not a tree.
    #[inline]
    pub fn is_sampled(&self) -> bool {
        self.slot() != NULL_SLOT
    }

    /// Is either of two tree values sampled?
    ///
    /// # Panics
    ///
    /// Panics if either value is not a tree.
    #[inline]
    pub fn is_either_sampled(a: &InlineData, b: &InlineData) -> bool {
        (a.slot() | b.slot()) != NULL_SLOT
    }

    /// The sample record of this tree value, if any.
    ///
    /// # Panics
    ///
    /// Panics if this value is not a tree.
    pub fn sample(&self) -> Option<NonNull<SampleInfo>> {
        NonNull::new((self.slot() & !1) as usize as *mut SampleInfo)
    }

    /// Set or clear the sample record of this tree value.
    ///
    /// # Panics
    ///
    /// Panics if this value is not a tree.
    pub fn set_sample(&mut self, info: Option<NonNull<SampleInfo>>) {
        assert!(self.is_tree(), "sample slot of an inline value");
        let slot = match info {
            Some(info) => info.as_ptr() as usize as u64 | 1,
            None => NULL_SLOT,
        };
        let tree = self.tree_ptr_mut();
        // Safety: this is a tree, so the slot is in bounds and plain bytes.
        unsafe { addr_of_mut!((*tree).slot).write(slot.to_le_bytes()) }
    }

    /// Clear the sample record of this tree value.
    #[inline]
    pub fn clear_sample(&mut self) {
        self.set_sample(None);
    }
}

impl Default for InlineData {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for InlineData {
    fn clone(&self) -> Self {
        match self.as_tree() {
            Some(root) => Self::from_tree(root.clone()),
            None => InlineData {
                // Safety: inline values are plain bytes.
                rep: Rep {
                    bytes: unsafe { self.rep.bytes },
                },
            },
        }
    }
}

impl Drop for InlineData {
    fn drop(&mut self) {
        drop(self.take_tree());
    }
}

impl PartialEq for InlineData {
    fn eq(&self, other: &Self) -> bool {
        match (self.as_tree(), other.as_tree()) {
            (None, None) => self.sanitized() == other.sanitized(),
            (Some(a), Some(b)) => self.slot() == other.slot() && NodeRef::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for InlineData {}

impl fmt::Debug for InlineData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_tree() {
            Some(root) => f
                .debug_struct("InlineData::Tree")
                .field("root", root)
                .field("sampled", &(self.slot() != NULL_SLOT))
                .finish(),
            None => f
                .debug_tuple("InlineData::Inline")
                .field(&self.as_bytes())
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeKind;

    #[test]
    fn inline_round_trip() {
        let value = InlineData::from_inline(b"0123456789");
        assert!(!value.is_tree());
        assert_eq!(value.inline_size(), 10);
        assert_eq!(value.as_inline(), Some(&b"0123456789"[..]));
        assert_eq!(value.as_bytes(), b"0123456789");
        assert!(value.as_tree().is_none());
    }

    #[test]
    fn tree_round_trip() {
        let root = NodeRef::copy_from_slice(b"a value too long to be inline");
        let value = InlineData::from_tree(root.clone());
        assert!(value.is_tree());
        assert!(NodeRef::ptr_eq(value.as_tree().unwrap(), &root));
        assert_eq!(value.len(), root.len());
        assert_eq!(value.as_inline(), None);
        assert_eq!(root.refcount(), 2);
        drop(value);
        assert!(root.is_unique());
    }

    #[test]
    fn tree_flag_is_in_byte_zero() {
        let value = InlineData::from_tree(NodeRef::empty());
        assert_eq!(unsafe { value.rep.bytes[0] } & TREE_FLAG, TREE_FLAG);
        assert_eq!(value.slot(), NULL_SLOT);
    }

    #[test]
    fn copy_from_switches_representation() {
        let small = InlineData::copy_from(&[1; MAX_INLINE]);
        assert!(!small.is_tree());
        let big = InlineData::copy_from(&[1; MAX_INLINE + 1]);
        assert!(big.is_tree());
        assert_eq!(big.as_tree().unwrap().kind(), NodeKind::Buffer);
        assert_eq!(big.as_bytes(), &[1; MAX_INLINE + 1]);
    }

    #[test]
    #[should_panic(expected = "do not fit in an inline value")]
    fn oversized_inline_data_panics() {
        InlineData::from_inline(&[0; MAX_INLINE + 1]);
    }

    #[test]
    fn poisoned_tail_never_leaks() {
        let mut value = InlineData::from_inline(b"fifteen bytes!!");
        value.set_inline_data(b"short");
        assert_eq!(value, InlineData::from_inline(b"short"));

        let mut out = [0xff; MAX_INLINE];
        value.copy_max_inline_to(&mut out);
        assert_eq!(&out[..5], b"short");
        assert!(out[5..].iter().all(|b| *b == 0));
    }

    #[test]
    fn inline_buffer_then_size_or_size_then_buffer() {
        let mut a = InlineData::new();
        a.inline_buf_mut()[..3].copy_from_slice(b"abc");
        a.set_inline_size(3);

        let mut b = InlineData::new();
        b.set_inline_size(3);
        b.inline_buf_mut()[..3].copy_from_slice(b"abc");

        assert_eq!(a, b);
        assert_eq!(a.as_bytes(), b"abc");
    }

    #[test]
    fn growing_after_shrinking_needs_a_rewrite() {
        let mut value = InlineData::from_inline(b"abcdef");
        value.set_inline_size(2);
        value.set_inline_size(5);
        if cfg!(debug_assertions) {
            assert_eq!(&value.as_bytes()[2..], [POISON; 3]);
        }

        value.inline_buf_mut()[2..5].copy_from_slice(b"xyz");
        assert_eq!(value.as_bytes(), b"abxyz");
        assert_eq!(value, InlineData::from_inline(b"abxyz"));
    }

    #[test]
    fn make_tree_set_tree_and_clear() {
        let first = NodeRef::copy_from_slice(b"first root");
        let second = NodeRef::copy_from_slice(b"second root");

        let mut value = InlineData::from_inline(b"inline");
        value.make_tree(first.clone());
        assert!(NodeRef::ptr_eq(value.as_tree().unwrap(), &first));

        let old = value.set_tree(second.clone());
        assert!(NodeRef::ptr_eq(&old, &first));
        drop(old);
        assert!(first.is_unique());
        assert_eq!(value.as_bytes(), b"second root");

        value.clear();
        assert!(!value.is_tree());
        assert!(value.is_empty());
        assert!(second.is_unique());
    }

    #[test]
    #[should_panic(expected = "set_tree on an inline value")]
    fn set_tree_requires_a_tree() {
        InlineData::new().set_tree(NodeRef::empty());
    }

    #[test]
    fn compare_orders_like_byte_strings() {
        let cases: &[(&[u8], &[u8])] = &[
            (b"", b"a"),
            (b"abc", b"abd"),
            (b"abc", b"abc\0"),
            (b"abcdefgh", b"abcdefgi"),
            (b"abcdefghijklmno", b"abcdefghijklmnp"),
            (b"abcdefghijklmno", b"b"),
        ];
        for (lo, hi) in cases {
            let lo_value = InlineData::from_inline(lo);
            let hi_value = InlineData::from_inline(hi);
            assert_eq!(lo_value.compare(&hi_value), Ordering::Less, "{lo:?} < {hi:?}");
            assert_eq!(hi_value.compare(&lo_value), Ordering::Greater, "{hi:?} > {lo:?}");
            assert_eq!(lo_value.compare(&lo_value.clone()), Ordering::Equal);
        }
    }

    #[test]
    #[should_panic(expected = "compare requires two inline values")]
    fn compare_rejects_trees() {
        let tree = InlineData::from_tree(NodeRef::empty());
        InlineData::new().compare(&tree);
    }

    #[test]
    fn mixed_forms_are_unequal() {
        let inline = InlineData::new();
        let tree = InlineData::from_tree(NodeRef::empty());
        assert_ne!(inline, tree);
        assert_eq!(tree, tree.clone());
    }

    #[cfg(feature = "sampling")]
    mod sampling {
        use super::*;
        use crate::sample::Method;

        #[test]
        fn sample_slot_round_trip() {
            let info = SampleInfo::new(Method::ConstructorTree);
            let info = NonNull::from(&info);

            let mut value = InlineData::from_tree(NodeRef::empty());
            assert!(!value.is_sampled());
            assert_eq!(value.sample(), None);

            value.set_sample(Some(info));
            assert!(value.is_sampled());
            assert_eq!(value.sample(), Some(info));
            assert_eq!(unsafe { value.rep.bytes[0] } & TREE_FLAG, TREE_FLAG);

            let other = InlineData::from_tree(NodeRef::empty());
            assert!(InlineData::is_either_sampled(&value, &other));
            assert!(InlineData::is_either_sampled(&other, &value));
            assert!(!InlineData::is_either_sampled(&other, &other));

            let copy = value.clone();
            assert!(!copy.is_sampled());
            assert_ne!(copy, value);

            let old = value.set_tree(NodeRef::copy_from_slice(b"new root"));
            drop(old);
            assert_eq!(value.sample(), Some(info));

            value.clear_sample();
            assert!(!value.is_sampled());
        }

        #[test]
        #[should_panic(expected = "sample slot of an inline value")]
        fn inline_values_have_no_sample() {
            InlineData::new().is_sampled();
        }
    }
}
