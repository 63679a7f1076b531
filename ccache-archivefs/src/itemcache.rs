//! Spill store for decoded leaf items (§4.9). Keeping every item in memory
//! is unacceptable for large archives, so each leaf is appended to a
//! scratch file and addressed by `file_offset + BASE_OFFSET`; the handle
//! doubles as the leaf's inode, chosen high enough that it never collides
//! with the small integers used for directory inodes.

use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::Error;

use ccache_itemstream::Item;

/// Directory inodes are allocated monotonically from 1 and archives rarely
/// have more than a few million directories; this leaves an enormous
/// margin before a spill handle could ever alias one.
pub const BASE_OFFSET: u64 = 1u64 << 40;

pub struct ItemCache {
    file: std::fs::File,
    cursor: u64,
}

impl ItemCache {
    pub fn new() -> Result<Self, Error> {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "ccache-archivefs-itemcache-{}-{:x}",
            std::process::id(),
            std::ptr::addr_of!(path) as usize
        ));
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        // Unlink immediately: the fd keeps the data alive for the life of
        // the mount session without leaving a named file behind.
        let _ = std::fs::remove_file(&path);
        Ok(ItemCache { file, cursor: 0 })
    }

    /// Appends `item`, returning its handle (also its inode).
    pub fn add(&mut self, item: &Item) -> Result<u64, Error> {
        let mut buf = Vec::new();
        let raw = ccache_itemstream::RawItem::from(item);
        let mut serializer = rmp_serde::Serializer::new(&mut buf);
        serde::Serialize::serialize(&raw, &mut serializer)?;

        let offset = self.cursor;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file
            .write_all(&(buf.len() as u32).to_le_bytes())?;
        self.file.write_all(&buf)?;
        self.cursor += 4 + buf.len() as u64;

        Ok(offset + BASE_OFFSET)
    }

    pub fn get(&mut self, handle: u64) -> Result<Item, Error> {
        let offset = handle
            .checked_sub(BASE_OFFSET)
            .ok_or_else(|| anyhow::anyhow!("handle {} below item cache base offset", handle))?;

        self.file.seek(SeekFrom::Start(offset))?;
        let mut len_bytes = [0u8; 4];
        self.file.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf)?;

        let raw: ccache_itemstream::RawItem = rmp_serde::from_slice(&buf)?;
        Ok(Item::try_from(raw)?)
    }

    pub fn is_handle(value: u64) -> bool {
        value >= BASE_OFFSET
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccache_itemstream::ItemKind;
    use std::collections::BTreeMap;

    fn dir_item(path: &str) -> Item {
        Item {
            path: path.to_string(),
            mode: libc::S_IFDIR | 0o755,
            uid: 0,
            gid: 0,
            mtime_ns: 0,
            xattrs: BTreeMap::new(),
            kind: ItemKind::Directory,
        }
    }

    #[test]
    fn test_add_get_roundtrip() {
        let mut cache = ItemCache::new().unwrap();
        let a = dir_item("a");
        let b = dir_item("bb");

        let handle_a = cache.add(&a).unwrap();
        let handle_b = cache.add(&b).unwrap();
        assert_ne!(handle_a, handle_b);
        assert!(ItemCache::is_handle(handle_a));

        assert_eq!(cache.get(handle_a).unwrap(), a);
        assert_eq!(cache.get(handle_b).unwrap(), b);
    }

    #[test]
    fn test_handles_never_alias_small_inodes() {
        assert!(!ItemCache::is_handle(1));
        assert!(!ItemCache::is_handle(1_000_000));
        assert!(ItemCache::is_handle(BASE_OFFSET));
    }
}
