//! Decoding of an archive's root blob (§3 "Archive metadata", §4.8).

use anyhow::{bail, Error};
use serde::Deserialize;

use ccache_types::ChunkId;

use crate::bfs::bfs_cmp;

/// A byte range spanning one or more `items` chunks, guaranteed to contain
/// the item records under some path prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub chunk_index: u32,
    pub skip_bytes: u64,
    pub length: u64,
}

#[derive(Deserialize)]
struct RawMetadataIndexEntry {
    path: Vec<String>,
    chunk_index: u32,
    skip_bytes: u64,
    length: u64,
}

#[derive(Deserialize)]
struct RawArchiveRoot {
    version: u32,
    #[allow(dead_code)]
    name: Option<String>,
    items: Vec<[u8; 32]>,
    #[serde(default)]
    metadata_index: Option<Vec<RawMetadataIndexEntry>>,
}

/// Path -> byte-range index, present from metadata version >= 2. Entries
/// are kept in BFS order (§4.8 "BFS ordering") so `lookup_many` can scan
/// forward without an auxiliary sort.
pub struct MetadataIndex {
    entries: Vec<(Vec<String>, Window)>,
}

impl MetadataIndex {
    fn from_raw(mut raw: Vec<RawMetadataIndexEntry>) -> Self {
        raw.sort_by(|a, b| bfs_cmp(&a.path, &b.path));
        let entries = raw
            .into_iter()
            .map(|e| {
                (
                    e.path,
                    Window {
                        chunk_index: e.chunk_index,
                        skip_bytes: e.skip_bytes,
                        length: e.length,
                    },
                )
            })
            .collect();
        MetadataIndex { entries }
    }

    /// A single window guaranteed to contain the item record for `path`.
    pub fn lookup(&self, path: &[String]) -> Option<Window> {
        self.entries
            .binary_search_by(|(p, _)| bfs_cmp(p, path))
            .ok()
            .map(|idx| self.entries[idx].1)
    }

    /// Windows for the immediate children of `prefix`, in BFS order. Used
    /// to enumerate one directory's contents without loading unrelated
    /// subtrees (§4.8 step 3, testable property 7).
    pub fn lookup_many<'a>(&'a self, prefix: &'a [String]) -> impl Iterator<Item = Window> + 'a {
        let child_depth = prefix.len() + 1;
        self.entries.iter().filter_map(move |(path, window)| {
            if path.len() == child_depth && path[..prefix.len()] == *prefix {
                Some(*window)
            } else {
                None
            }
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decoded root of one archive: the ordered item-stream chunk list plus an
/// optional metadata index for lazy lookups.
pub struct ArchiveMeta {
    pub version: u32,
    pub items: Vec<ChunkId>,
    pub metadata_index: Option<MetadataIndex>,
}

impl ArchiveMeta {
    pub fn decode(plaintext: &[u8]) -> Result<Self, Error> {
        let raw: RawArchiveRoot = rmp_serde::from_slice(plaintext)?;
        if raw.version == 0 {
            bail!("archive root has unsupported metadata version 0");
        }
        let metadata_index = if raw.version >= 2 {
            raw.metadata_index.map(MetadataIndex::from_raw)
        } else {
            None
        };
        Ok(ArchiveMeta {
            version: raw.version,
            items: raw.items.into_iter().map(ChunkId::from_bytes).collect(),
            metadata_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segs(path: &str) -> Vec<String> {
        path.split('/').map(String::from).collect()
    }

    fn w(i: u32) -> Window {
        Window {
            chunk_index: i,
            skip_bytes: 0,
            length: 100,
        }
    }

    #[test]
    fn test_lookup_many_returns_only_immediate_children() {
        let raw = vec![
            RawMetadataIndexEntry {
                path: segs("a"),
                chunk_index: 0,
                skip_bytes: 0,
                length: 10,
            },
            RawMetadataIndexEntry {
                path: segs("a/b"),
                chunk_index: 1,
                skip_bytes: 0,
                length: 10,
            },
            RawMetadataIndexEntry {
                path: segs("a/d"),
                chunk_index: 2,
                skip_bytes: 0,
                length: 10,
            },
            RawMetadataIndexEntry {
                path: segs("a/b/c"),
                chunk_index: 3,
                skip_bytes: 0,
                length: 10,
            },
            RawMetadataIndexEntry {
                path: segs("a/d/e"),
                chunk_index: 4,
                skip_bytes: 0,
                length: 10,
            },
        ];
        let index = MetadataIndex::from_raw(raw);

        let children: Vec<Window> = index.lookup_many(&segs("a")).collect();
        assert_eq!(children, vec![w(1), w(2)]);

        let exact = index.lookup(&segs("a/b/c")).unwrap();
        assert_eq!(exact.chunk_index, 3);
    }

    #[test]
    fn test_lookup_miss_returns_none() {
        let index = MetadataIndex::from_raw(vec![RawMetadataIndexEntry {
            path: segs("a"),
            chunk_index: 0,
            skip_bytes: 0,
            length: 10,
        }]);
        assert!(index.lookup(&segs("z")).is_none());
    }
}
