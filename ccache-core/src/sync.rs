//! Rebuilds the chunk index from the manifest (§4.5). Invoked whenever the
//! in-memory manifest id disagrees with the one recorded in the cache
//! config; the `RepositoryReplay` guard lives in the caller
//! (`Cache::ensure_synced`), since it depends on the cache's own state.

use anyhow::{bail, Error};
use serde::Deserialize;

use ccache_index::ChunkIndex;
use ccache_itemstream::{always_valid, Item, ItemKind, ItemUnpacker, StreamEvent};
use ccache_types::{ChunkEntry, ChunkId, Key, Repository};

use crate::manifest::Manifest;

#[derive(Deserialize)]
struct RawArchiveRoot {
    version: u32,
    items: Vec<[u8; 32]>,
}

/// `add(id, size, csize)`: increments refcount if already present,
/// otherwise inserts at refcount 1. When different archives disagree on
/// `csize` for the same id, the first insert wins — defensive only, since
/// the ciphertext for a given id is deterministic up to chunk-framing.
fn add(chunks: &mut ChunkIndex, id: &ChunkId, size: u32, csize: u32) {
    match chunks.get(id) {
        Some(mut entry) => {
            entry.refcount += 1;
            chunks.set(id, entry);
        }
        None => chunks.set(id, ChunkEntry::new(size, csize)),
    }
}

pub fn sync<R: Repository, K: Key>(
    repository: &R,
    key: &K,
    manifest: &Manifest,
    chunks: &mut ChunkIndex,
) -> Result<(), Error> {
    chunks.clear();
    log::info!("rebuilding chunk index from {} archive(s)", manifest.archives.len());

    for (name, info) in &manifest.archives {
        log::debug!("sync: walking archive {name:?}");
        let ciphertext = repository.get(&info.id)?;
        let plaintext = key
            .decrypt(&info.id, &ciphertext)
            .map_err(|err| anyhow::anyhow!("archive '{name}' root failed to decrypt: {err}"))?;
        add(chunks, &info.id, plaintext.len() as u32, ciphertext.len() as u32);

        let root: RawArchiveRoot = rmp_serde::from_slice(&plaintext)
            .map_err(|err| anyhow::anyhow!("archive '{name}' root decode failed: {err}"))?;
        if root.version != 1 {
            bail!(
                "archive '{name}' has unknown metadata version {}",
                root.version
            );
        }

        let item_ids: Vec<ChunkId> = root.items.into_iter().map(ChunkId::from_bytes).collect();
        let mut unpacker = ItemUnpacker::new(always_valid);

        for (id, chunk_result) in item_ids.iter().zip(repository.get_many(&item_ids)) {
            let ciphertext = chunk_result?;
            let plaintext = key.decrypt(id, &ciphertext)?;
            add(chunks, id, plaintext.len() as u32, ciphertext.len() as u32);

            unpacker.feed(&plaintext);
            while let Some(event) = unpacker.next_event() {
                if let StreamEvent::Item(Item {
                    kind: ItemKind::RegularFile { chunks: file_chunks },
                    ..
                }) = event
                {
                    for chunk_ref in file_chunks {
                        add(chunks, &chunk_ref.id, chunk_ref.size, chunk_ref.csize);
                    }
                }
            }
        }
    }

    Ok(())
}
