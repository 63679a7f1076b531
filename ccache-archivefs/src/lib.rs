//! Lazy archive materializer and FUSE mount (§4.8, §5).
//!
//! An archive's root blob lists its chunk-packed, encrypted item stream in
//! breadth-first order, optionally alongside a metadata index mapping paths
//! to byte windows within that stream. [`Materializer`] resolves only the
//! directories and files a caller actually traverses; [`fuse_session::run`]
//! drives it from a real mount, one request at a time.

mod archive;
mod bfs;
mod itemcache;
mod materializer;

pub mod fuse_session;

pub use archive::{ArchiveMeta, MetadataIndex, Window};
pub use materializer::{Attr, Materializer};
pub use tree::ROOT_INODE;

mod tree;
