//! Container root filesystem assembly.
//!
//! The rootfs is built by merging extracted layers, bottom-most first, into a
//! single directory tree that later becomes the container's `/`.

mod merge;

pub use merge::{MergeStats, RootfsMerger, OPAQUE_MARKER, WHITEOUT_PREFIX};
pub(crate) use merge::make_tree_writable;
