#![doc = include_str!("../README.md")]
#![no_std]
#![deny(missing_docs)]
#![cfg_attr(feature = "allocator_api", feature(allocator_api))]

extern crate alloc;

#[cfg(test)]
extern crate std;

use cfg_if::cfg_if;

pub mod tag;

mod refcount;
pub use refcount::Refcount;

mod node;
pub use node::{
    ExternalNode, NodeKind, NodeRef, RangeNode, Releaser, WithData, MAX_BYTES_TO_COPY,
};

mod inline;
pub use inline::{InlineData, MAX_INLINE};

cfg_if! {
    if #[cfg(feature = "sampling")] {
        pub mod delete_queue;
        pub use delete_queue::{
            DefaultLock, DeleteQueue, Handle, HandleId, Lock, QueueStats, SingleThreadedLock,
            Snapshot,
        };

        #[cfg(feature = "std")]
        pub use delete_queue::{global, ParkingLock};

        mod sample;
        pub use sample::{Method, SampleInfo, UpdateTracker};
    }
}

cfg_if! {
    if #[cfg(feature = "allocator_api")] {
        pub use alloc::alloc::{AllocError, Allocator, Global};
    } else if #[cfg(feature = "allocator_api2")] {
        pub use allocator_api2::alloc::{AllocError, Allocator, Global};
    } else {
        compile_error!("Must enable one of the `allocator_api` or `allocator_api2` cargo features");
    }
}
