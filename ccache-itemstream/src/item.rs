use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use ccache_types::ChunkId;

/// One chunk reference inside a regular file's content list.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ChunkRef {
    pub id: ChunkId,
    pub size: u32,
    pub csize: u32,
}

/// What an item *is*, as a tagged sum rather than the source's "presence
/// of `source`/`chunks`" dynamic dispatch (see DESIGN.md).
#[derive(Clone, PartialEq, Debug)]
pub enum ItemKind {
    RegularFile { chunks: Vec<ChunkRef> },
    HardLink { source: String },
    Directory,
    Symlink { source: String },
    Device { rdev: u64 },
}

/// A decoded entry from an archive's item stream.
#[derive(Clone, PartialEq, Debug)]
pub struct Item {
    pub path: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_ns: i64,
    pub xattrs: BTreeMap<String, Vec<u8>>,
    pub kind: ItemKind,
}

impl Item {
    pub fn content_size(&self) -> u64 {
        match &self.kind {
            ItemKind::RegularFile { chunks } => chunks.iter().map(|c| c.size as u64).sum(),
            _ => 0,
        }
    }
}

/// Wire shape of one item map record: `{path, mode, uid, gid, mtime,
/// [chunks], [source], [xattrs], [rdev]}` (§3). Kept as a flat struct with
/// optional fields so the format stays a map (format stability, per
/// DESIGN.md) while in-memory code works against the tagged `Item` above.
#[derive(Serialize, Deserialize, Default)]
pub struct RawItem {
    pub path: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
    #[serde(default)]
    pub chunks: Option<Vec<([u8; 32], u32, u32)>>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub rdev: Option<u64>,
    #[serde(default)]
    pub xattrs: Option<BTreeMap<String, Vec<u8>>>,
}

impl From<&Item> for RawItem {
    fn from(item: &Item) -> Self {
        let mut raw = RawItem {
            path: item.path.clone(),
            mode: item.mode,
            uid: item.uid,
            gid: item.gid,
            mtime: item.mtime_ns,
            xattrs: if item.xattrs.is_empty() {
                None
            } else {
                Some(item.xattrs.clone())
            },
            ..Default::default()
        };
        match &item.kind {
            ItemKind::RegularFile { chunks } => {
                raw.chunks = Some(
                    chunks
                        .iter()
                        .map(|c| (*c.id.as_bytes(), c.size, c.csize))
                        .collect(),
                );
            }
            ItemKind::HardLink { source } | ItemKind::Symlink { source } => {
                raw.source = Some(source.clone());
            }
            ItemKind::Directory => {}
            ItemKind::Device { rdev } => {
                raw.rdev = Some(*rdev);
            }
        }
        raw
    }
}

impl TryFrom<RawItem> for Item {
    type Error = anyhow::Error;

    fn try_from(raw: RawItem) -> Result<Self, Self::Error> {
        let file_type = raw.mode & libc::S_IFMT;

        let kind = if file_type == libc::S_IFDIR {
            ItemKind::Directory
        } else if file_type == libc::S_IFLNK {
            let source = raw
                .source
                .ok_or_else(|| anyhow::anyhow!("symlink item missing 'source'"))?;
            ItemKind::Symlink { source }
        } else if file_type == libc::S_IFCHR || file_type == libc::S_IFBLK {
            let rdev = raw
                .rdev
                .ok_or_else(|| anyhow::anyhow!("device item missing 'rdev'"))?;
            ItemKind::Device { rdev }
        } else if let Some(source) = raw.source {
            // regular-file mode with a 'source' field: hard link (§4.8)
            ItemKind::HardLink { source }
        } else {
            let chunks = raw
                .chunks
                .unwrap_or_default()
                .into_iter()
                .map(|(id, size, csize)| ChunkRef {
                    id: ChunkId::from_bytes(id),
                    size,
                    csize,
                })
                .collect();
            ItemKind::RegularFile { chunks }
        };

        Ok(Item {
            path: raw.path,
            mode: raw.mode,
            uid: raw.uid,
            gid: raw.gid,
            mtime_ns: raw.mtime,
            xattrs: raw.xattrs.unwrap_or_default(),
            kind,
        })
    }
}
