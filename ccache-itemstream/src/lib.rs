//! Decoder for an archive's item stream: the concatenated plaintext of an
//! archive's chunk list is a run of per-item maps (§3, §4.7). This crate
//! turns that byte stream into `Item` values, tolerating corruption by
//! resynchronizing on the next decodable, validator-approved map.

mod item;
mod unpacker;

pub use item::{ChunkRef, Item, ItemKind, RawItem};
pub use unpacker::{always_valid, ItemUnpacker, StreamEvent};
