//! Builds archive root blobs and their backing item-stream chunks, so
//! tests can exercise the materializer without a real backup client.

use anyhow::Error;
use serde::Serialize;

use ccache_itemstream::{Item, RawItem};
use ccache_types::{ChunkId, Key, Repository};

#[derive(Serialize)]
struct RawMetaEntry {
    path: Vec<String>,
    chunk_index: u32,
    skip_bytes: u64,
    length: u64,
}

#[derive(Serialize)]
struct RawArchiveRoot {
    version: u32,
    name: Option<String>,
    items: Vec<[u8; 32]>,
    metadata_index: Option<Vec<RawMetaEntry>>,
}

/// Encodes one item the same way the real item stream does: a
/// struct-as-map msgpack record with no length prefix (the decoder relies
/// on msgpack framing alone, see `ccache-itemstream`).
pub fn pack_item(item: &Item) -> Vec<u8> {
    let raw = RawItem::from(item);
    let mut buf = Vec::new();
    let mut serializer = rmp_serde::Serializer::new(&mut buf).with_struct_map();
    serde::Serialize::serialize(&raw, &mut serializer).expect("RawItem always serializes");
    buf
}

/// Concatenates `items` into one plaintext item-stream blob, the shape a
/// version-0/1 archive root's `items` chunks hold (no metadata index).
pub fn pack_items(items: &[Item]) -> Vec<u8> {
    let mut buf = Vec::new();
    for item in items {
        buf.extend(pack_item(item));
    }
    buf
}

/// Builds an archive's item-stream chunks (one chunk per item, for
/// simplicity) plus a version-2 root with a metadata index covering every
/// item, and stores all of it in `repository`.
#[derive(Default)]
pub struct ArchiveBuilder {
    items: Vec<Item>,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        ArchiveBuilder::default()
    }

    pub fn add(mut self, item: Item) -> Self {
        self.items.push(item);
        self
    }

    /// Stores the archive and returns the root blob's id, suitable for
    /// `Materializer::add_archive`. Root is metadata version 2 (one
    /// metadata-index window per item, one chunk per item) so lazy lookup
    /// and directory-open windowing are both exercised.
    pub fn build<R: Repository, K: Key>(
        &self,
        repository: &R,
        key: &K,
        name: &str,
    ) -> Result<ChunkId, Error> {
        self.store(repository, key, Some(name), true)
    }

    /// Stores the archive as a plain version-1 root (no metadata index),
    /// the shape `ccache-core`'s sync algorithm requires (§4.5 "require
    /// version == 1").
    pub fn build_v1<R: Repository, K: Key>(
        &self,
        repository: &R,
        key: &K,
    ) -> Result<ChunkId, Error> {
        self.store(repository, key, None, false)
    }

    fn store<R: Repository, K: Key>(
        &self,
        repository: &R,
        key: &K,
        name: Option<&str>,
        with_index: bool,
    ) -> Result<ChunkId, Error> {
        let mut chunk_ids = Vec::with_capacity(self.items.len());
        let mut metadata_index = Vec::with_capacity(self.items.len());

        for (index, item) in self.items.iter().enumerate() {
            let bytes = pack_item(item);
            let length = bytes.len() as u64;
            let id = key.id_hash(&bytes);
            let ciphertext = key.encrypt(&bytes)?;
            repository.put(&id, &ciphertext, true)?;
            chunk_ids.push(*id.as_bytes());

            let path: Vec<String> = item
                .path
                .split('/')
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            metadata_index.push(RawMetaEntry {
                path,
                chunk_index: index as u32,
                skip_bytes: 0,
                length,
            });
        }

        let root = RawArchiveRoot {
            version: if with_index { 2 } else { 1 },
            name: name.map(String::from),
            items: chunk_ids,
            metadata_index: if with_index { Some(metadata_index) } else { None },
        };

        let mut buf = Vec::new();
        let mut serializer = rmp_serde::Serializer::new(&mut buf).with_struct_map();
        root.serialize(&mut serializer)?;

        let root_id = key.id_hash(&buf);
        let ciphertext = key.encrypt(&buf)?;
        repository.put(&root_id, &ciphertext, true)?;
        Ok(root_id)
    }
}
