//! Encodes a repository manifest blob in the shape `ccache-core::Manifest`
//! expects, so tests can drive `Cache::ensure_synced` without a real
//! repository-side manifest writer.

use std::collections::BTreeMap;

use anyhow::Error;
use serde::Serialize;

use ccache_types::{ChunkId, Key, Repository};

#[derive(Serialize)]
struct RawArchiveInfo {
    id: [u8; 32],
    timestamp: String,
}

#[derive(Serialize)]
struct RawManifest {
    version: u32,
    archives: BTreeMap<String, RawArchiveInfo>,
    timestamp: String,
}

/// One archive entry to place in a built manifest.
pub struct ManifestEntry {
    pub name: String,
    pub root_id: ChunkId,
    pub timestamp: String,
}

/// Builds and stores a manifest blob under `ChunkId::MANIFEST`, returning
/// its id (the id_hash of the encoded bytes, as `Cache::ensure_synced`
/// expects to be handed).
pub fn build_and_store<R: Repository, K: Key>(
    repository: &R,
    key: &K,
    timestamp: &str,
    entries: &[ManifestEntry],
) -> Result<ChunkId, Error> {
    let archives = entries
        .iter()
        .map(|e| {
            (
                e.name.clone(),
                RawArchiveInfo {
                    id: *e.root_id.as_bytes(),
                    timestamp: e.timestamp.clone(),
                },
            )
        })
        .collect();

    let raw = RawManifest {
        version: 1,
        archives,
        timestamp: timestamp.to_string(),
    };

    let mut buf = Vec::new();
    let mut serializer = rmp_serde::Serializer::new(&mut buf).with_struct_map();
    raw.serialize(&mut serializer)?;

    let manifest_id = key.id_hash(&buf);
    let ciphertext = key.encrypt(&buf)?;
    repository.put(&ChunkId::MANIFEST, &ciphertext, true)?;
    Ok(manifest_id)
}
