use std::collections::BTreeMap;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

use ccache_types::ChunkId;

#[derive(Serialize, Deserialize)]
struct RawArchiveInfo {
    id: [u8; 32],
    timestamp: String,
}

#[derive(Serialize, Deserialize)]
struct RawManifest {
    version: u32,
    archives: BTreeMap<String, RawArchiveInfo>,
    timestamp: String,
}

/// One archive entry inside the manifest: its root blob's id, and the
/// timestamp it was created at.
#[derive(Clone, Debug)]
pub struct ArchiveInfo {
    pub id: ChunkId,
    pub timestamp: String,
}

/// The repository's index of archives. Stored (by the repository layer,
/// out of scope here) under the well-known all-zero id
/// (`ChunkId::MANIFEST`). Produced and consumed externally; this crate
/// only decodes it well enough to drive `sync`.
#[derive(Clone, Debug)]
pub struct Manifest {
    pub version: u32,
    pub archives: BTreeMap<String, ArchiveInfo>,
    pub timestamp: String,
}

impl Manifest {
    pub fn decode(plaintext: &[u8]) -> Result<Self, Error> {
        let raw: RawManifest = rmp_serde::from_slice(plaintext)?;
        if raw.version != 1 {
            bail!("unsupported manifest version {}", raw.version);
        }
        let archives = raw
            .archives
            .into_iter()
            .map(|(name, info)| {
                (
                    name,
                    ArchiveInfo {
                        id: ChunkId::from_bytes(info.id),
                        timestamp: info.timestamp,
                    },
                )
            })
            .collect();
        Ok(Manifest {
            version: raw.version,
            archives,
            timestamp: raw.timestamp,
        })
    }
}
