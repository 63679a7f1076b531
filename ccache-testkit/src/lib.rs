//! Fakes and builders shared by this workspace's tests: an in-memory
//! repository, a reversible (non-cryptographic) key, and helpers to build
//! manifest and archive blobs in the wire shapes the real crates expect.

mod archive;
mod key;
mod manifest;
mod repository;

pub use archive::{pack_item, pack_items, ArchiveBuilder};
pub use key::TestKey;
pub use manifest::{build_and_store as build_manifest, ManifestEntry};
pub use repository::MemoryRepository;
