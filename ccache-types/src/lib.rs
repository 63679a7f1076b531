//! Shared data types for the backup client's chunk cache and archive
//! materializer: chunk/path identifiers, the cache error taxonomy, running
//! stats, and the `Repository`/`Key` traits the cache is built against.

mod chunk;
mod error;
mod path_hash;
mod repository;
mod stats;

pub use chunk::{ChunkEntry, ChunkId};
pub use error::CacheError;
pub use path_hash::PathHash;
pub use repository::{Key, Repository};
pub use stats::Stats;
