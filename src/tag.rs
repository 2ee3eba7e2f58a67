//! Node tags and the buffer size-class codec.
//!
//! Every node starts with a one-byte tag. Small tag values name a node kind;
//! every tag in `BUFFER..=MAX_BUFFER_TAG` names a buffer node *and* encodes
//! the size class of its allocation, so a buffer node needs no separate
//! capacity field.
//!
//! Allocation sizes are quantized into three geometric bands:
//!
//! * 8-byte granularity for sizes in `[32, 512]`,
//! * 64-byte granularity for sizes in `(512, 8 KiB]`,
//! * 4 KiB granularity for sizes in `(8 KiB, 256 KiB]`.
//!
//! [`size_for`] and [`tag_for`] are exact inverses for every size that
//! [`round_up_for_tag`] can produce. Buffer nodes are allocated and
//! deallocated with sizes computed by this module, and only this module.

use core::mem;

use crate::node::Node;

/// Tag of a range node: an offset and length view into a buffer or external
/// node.
pub const RANGE: u8 = 2;

/// Tag of an external node, whose payload is owned by someone else.
pub const EXTERNAL: u8 = 3;

/// The smallest buffer node tag. Buffer tags run up to and including
/// [`MAX_BUFFER_TAG`].
pub const BUFFER: u8 = 4;

/// The largest buffer node tag.
pub const MAX_BUFFER_TAG: u8 = 246;

/// Chosen so that a tag of `BUFFER` encodes `MIN_BUFFER_SIZE`.
const TAG_BASE: u8 = BUFFER - 4;

/// Upper bound (inclusive) of the 8-byte granularity band.
const SMALL_BAND_END: usize = 512;

/// Upper bound (inclusive) of the 64-byte granularity band.
const MEDIUM_BAND_END: usize = 8192;

/// Number of tags used by the 8-byte band.
const SMALL_TAGS: usize = SMALL_BAND_END / 8;

/// Number of tags used by the 64-byte band.
const MEDIUM_TAGS: usize = (MEDIUM_BAND_END - SMALL_BAND_END) / 64;

/// The number of bytes a buffer node's header takes before its payload.
pub const BUFFER_OVERHEAD: usize = mem::size_of::<Node>();

/// The smallest allocation we make for a buffer node.
pub const MIN_BUFFER_SIZE: usize = 32;

/// The largest allocation we make for a regular buffer node.
pub const MAX_BUFFER_SIZE: usize = 4096;

/// The largest allocation we make for an explicitly large buffer node.
pub const MAX_LARGE_BUFFER_SIZE: usize = 256 * 1024;

/// Payload capacity of the smallest buffer node.
pub const MIN_BUFFER_LENGTH: usize = MIN_BUFFER_SIZE - BUFFER_OVERHEAD;

/// Payload capacity of the largest regular buffer node.
pub const MAX_BUFFER_LENGTH: usize = MAX_BUFFER_SIZE - BUFFER_OVERHEAD;

/// Payload capacity of the largest large buffer node.
pub const MAX_LARGE_BUFFER_LENGTH: usize = MAX_LARGE_BUFFER_SIZE - BUFFER_OVERHEAD;

/// Convert an allocation size into its tag without checking that the result
/// is a valid buffer tag.
///
/// Sizes that are not exactly representable round down to the next smaller
/// size class.
pub const fn tag_for_unchecked(size: usize) -> u8 {
    let base = TAG_BASE as usize;
    let tag = if size <= SMALL_BAND_END {
        base + size / 8
    } else if size <= MEDIUM_BAND_END {
        base + SMALL_TAGS + size / 64 - SMALL_BAND_END / 64
    } else {
        base + SMALL_TAGS + MEDIUM_TAGS + size / 4096 - MEDIUM_BAND_END / 4096
    };
    tag as u8
}

/// Convert an allocation size into its buffer tag.
///
/// Sizes that are not exactly representable round down to the next smaller
/// size class; use [`round_up_for_tag`] first to get an exact size.
///
/// # Panics
///
/// Panics if `size` is outside `[MIN_BUFFER_SIZE, MAX_LARGE_BUFFER_SIZE]`.
#[inline]
pub fn tag_for(size: usize) -> u8 {
    assert!(
        (MIN_BUFFER_SIZE..=MAX_LARGE_BUFFER_SIZE).contains(&size),
        "allocation size {size} has no buffer tag"
    );
    let tag = tag_for_unchecked(size);
    debug_assert!((BUFFER..=MAX_BUFFER_TAG).contains(&tag));
    tag
}

/// Convert a buffer tag into its exact allocation size.
pub const fn size_for(tag: u8) -> usize {
    let tag = tag as usize;
    let base = TAG_BASE as usize;
    if tag <= base + SMALL_TAGS {
        (tag - base) * 8
    } else if tag <= base + SMALL_TAGS + MEDIUM_TAGS {
        SMALL_BAND_END + (tag - base - SMALL_TAGS) * 64
    } else {
        MEDIUM_BAND_END + (tag - base - SMALL_TAGS - MEDIUM_TAGS) * 4096
    }
}

/// Convert a buffer tag into the payload capacity of a buffer node with that
/// tag.
pub const fn length_for(tag: u8) -> usize {
    size_for(tag) - BUFFER_OVERHEAD
}

/// Round `size` up to the nearest size that is exactly expressible as a tag.
#[inline]
pub const fn round_up_for_tag(size: usize) -> usize {
    let granularity = if size <= SMALL_BAND_END {
        8
    } else if size <= MEDIUM_BAND_END {
        64
    } else {
        4096
    };
    // `granularity` is a power of two.
    (size + granularity - 1) & !(granularity - 1)
}

/// Is `tag` the tag of a buffer node?
#[inline]
pub const fn is_buffer(tag: u8) -> bool {
    tag >= BUFFER && tag <= MAX_BUFFER_TAG
}

const _: () = {
    assert!(tag_for_unchecked(MIN_BUFFER_SIZE) == BUFFER);
    assert!(tag_for_unchecked(MAX_LARGE_BUFFER_SIZE) == MAX_BUFFER_TAG);
    assert!(size_for(MAX_BUFFER_TAG) == MAX_LARGE_BUFFER_SIZE);
    assert!(size_for(BUFFER) == MIN_BUFFER_SIZE);
    assert!(RANGE < EXTERNAL && EXTERNAL < BUFFER);
    assert!(BUFFER_OVERHEAD < MIN_BUFFER_SIZE);
};
