//! Persistent chunk-reference index: an open-addressed hashtable mapping a
//! 32-byte chunk id to `(refcount, plaintext_size, ciphertext_size)`.
//!
//! The on-disk format is a small header (`header.rs`) followed by the raw
//! bucket array (`bucket.rs`), little-endian, loaded in full on open and
//! rewritten atomically on commit. This mirrors the fixed/dynamic index
//! files in the datastore layer, except those are read-mostly and mapped
//! for the lifetime of the reader; here the whole table is small enough
//! (one entry per distinct chunk the *client* has ever seen) to live in a
//! plain `Vec` once loaded, so only the read path touches `mmap`.

mod bucket;
mod header;

use std::convert::TryInto;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::{bail, format_err, Error};

use proxmox_io::ReadExt;
use proxmox_sys::fs::CreateOptions;

use ccache_types::{ChunkEntry, ChunkId};

use bucket::{Bucket, EMPTY, TOMBSTONE};
use header::{ChunkIndexHeader, CHUNK_INDEX_MAGIC_1_0, CHUNK_INDEX_VERSION};

const MIN_CAPACITY: usize = 16;
const MAX_LOAD_FACTOR: f64 = 0.7;

/// In-memory open-addressed map from `ChunkId` to `ChunkEntry`.
pub struct ChunkIndex {
    buckets: Vec<Bucket>,
    len: usize,
}

impl Default for ChunkIndex {
    fn default() -> Self {
        Self::with_capacity(MIN_CAPACITY)
    }
}

impl ChunkIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = next_power_of_two(capacity.max(MIN_CAPACITY));
        ChunkIndex {
            buckets: vec![Bucket::empty(); capacity],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        for bucket in self.buckets.iter_mut() {
            *bucket = Bucket::empty();
        }
        self.len = 0;
    }

    pub fn get(&self, id: &ChunkId) -> Option<ChunkEntry> {
        let idx = self.find_slot(id)?;
        let bucket = &self.buckets[idx];
        Some(ChunkEntry {
            refcount: bucket.refcount,
            plaintext_size: bucket.plaintext_size,
            ciphertext_size: bucket.ciphertext_size,
        })
    }

    pub fn set(&mut self, id: &ChunkId, entry: ChunkEntry) {
        if self.len + 1 > ((self.buckets.len() as f64) * MAX_LOAD_FACTOR) as usize {
            self.grow();
        }

        let capacity = self.buckets.len();
        let mut idx = home_slot(id, capacity);
        let mut first_tombstone: Option<usize> = None;

        loop {
            let bucket = &self.buckets[idx];
            if bucket.is_empty() {
                let target = first_tombstone.unwrap_or(idx);
                self.buckets[target] = Bucket {
                    key: *id.as_bytes(),
                    refcount: entry.refcount,
                    plaintext_size: entry.plaintext_size,
                    ciphertext_size: entry.ciphertext_size,
                };
                self.len += 1;
                return;
            }
            if bucket.is_tombstone() {
                if first_tombstone.is_none() {
                    first_tombstone = Some(idx);
                }
            } else if &bucket.key == id.as_bytes() {
                self.buckets[idx] = Bucket {
                    key: *id.as_bytes(),
                    refcount: entry.refcount,
                    plaintext_size: entry.plaintext_size,
                    ciphertext_size: entry.ciphertext_size,
                };
                return;
            }
            idx = (idx + 1) % capacity;
        }
    }

    pub fn remove(&mut self, id: &ChunkId) -> Option<ChunkEntry> {
        let idx = self.find_slot(id)?;
        let bucket = self.buckets[idx];
        self.buckets[idx] = Bucket {
            key: [0u8; 32],
            refcount: TOMBSTONE,
            plaintext_size: 0,
            ciphertext_size: 0,
        };
        self.len -= 1;
        Some(ChunkEntry {
            refcount: bucket.refcount,
            plaintext_size: bucket.plaintext_size,
            ciphertext_size: bucket.ciphertext_size,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChunkId, ChunkEntry)> + '_ {
        self.buckets.iter().filter(|b| b.is_occupied()).map(|b| {
            (
                ChunkId::from_bytes(b.key),
                ChunkEntry {
                    refcount: b.refcount,
                    plaintext_size: b.plaintext_size,
                    ciphertext_size: b.ciphertext_size,
                },
            )
        })
    }

    fn find_slot(&self, id: &ChunkId) -> Option<usize> {
        let capacity = self.buckets.len();
        let mut idx = home_slot(id, capacity);
        let mut probed = 0;
        loop {
            let bucket = &self.buckets[idx];
            if bucket.is_empty() {
                return None;
            }
            if bucket.is_occupied() && &bucket.key == id.as_bytes() {
                return Some(idx);
            }
            idx = (idx + 1) % capacity;
            probed += 1;
            if probed >= capacity {
                return None;
            }
        }
    }

    fn grow(&mut self) {
        let new_capacity = self.buckets.len() * 2;
        let mut grown = ChunkIndex {
            buckets: vec![Bucket::empty(); new_capacity],
            len: 0,
        };
        for (id, entry) in self.iter() {
            grown.set(&id, entry);
        }
        *self = grown;
    }

    /// Loads the index from `path`, mapping the bucket region and copying
    /// it into an in-memory table. The mapping is torn down before
    /// returning; there is no persistent mmap held for the writer path.
    pub fn read(path: &Path) -> Result<Self, Error> {
        let mut file = std::fs::File::open(path)
            .map_err(|err| format_err!("unable to open chunk index {:?} - {}", path, err))?;

        let stat = nix::sys::stat::fstat(file.as_raw_fd())
            .map_err(|err| format_err!("fstat failed on {:?} - {}", path, err))?;
        let header_size = std::mem::size_of::<ChunkIndexHeader>();
        if (stat.st_size as usize) < header_size {
            bail!("chunk index {:?} is too small", path);
        }

        let header: Box<ChunkIndexHeader> = unsafe { file.read_host_value_boxed()? };
        if header.magic != CHUNK_INDEX_MAGIC_1_0 {
            bail!("chunk index {:?} has unknown magic number", path);
        }
        if u32::from_le(header.version) != CHUNK_INDEX_VERSION {
            bail!("chunk index {:?} has unsupported version", path);
        }

        let bucket_count = u64::from_le(header.bucket_count) as usize;
        let occupied = u64::from_le(header.occupied) as usize;
        let bucket_size = std::mem::size_of::<Bucket>();
        let expected = header_size + bucket_count * bucket_size;
        if stat.st_size as usize != expected {
            bail!(
                "chunk index {:?} has unexpected size ({} != {})",
                path,
                stat.st_size,
                expected
            );
        }

        if bucket_count == 0 {
            return Ok(ChunkIndex {
                buckets: Vec::new(),
                len: 0,
            });
        }

        let region_len = bucket_count * bucket_size;
        let data = unsafe {
            nix::sys::mman::mmap(
                None,
                std::num::NonZeroUsize::new(region_len)
                    .ok_or_else(|| format_err!("invalid bucket region size"))?,
                nix::sys::mman::ProtFlags::PROT_READ,
                nix::sys::mman::MapFlags::MAP_PRIVATE,
                file.as_raw_fd(),
                header_size as i64,
            )
        }
        .map_err(|err| format_err!("mmap failed for {:?} - {}", path, err))? as *mut u8;

        let buckets = unsafe {
            let slice = std::slice::from_raw_parts(data as *const Bucket, bucket_count);
            slice.to_vec()
        };

        if let Err(err) =
            unsafe { nix::sys::mman::munmap(data as *mut std::ffi::c_void, region_len) }
        {
            log::warn!("failed to unmap chunk index {:?}: {}", path, err);
        }

        Ok(ChunkIndex {
            buckets,
            len: occupied,
        })
    }

    /// Serializes the index and writes it atomically: `chunks.tmp`, fsync,
    /// rename to the final path. `path` should be the final (non-tmp) path;
    /// the caller is responsible for passing a path that lives inside an
    /// active transaction directory.
    pub fn write(&self, path: &Path) -> Result<(), Error> {
        let header_size = std::mem::size_of::<ChunkIndexHeader>();
        if header_size != 4096 {
            bail!("chunk index header is not page-aligned ({} bytes)", header_size);
        }

        let header = ChunkIndexHeader::new(self.buckets.len() as u64, self.len as u64);

        let header_bytes = unsafe {
            std::slice::from_raw_parts(
                &header as *const ChunkIndexHeader as *const u8,
                std::mem::size_of::<ChunkIndexHeader>(),
            )
        };
        let bucket_bytes = unsafe {
            std::slice::from_raw_parts(
                self.buckets.as_ptr() as *const u8,
                self.buckets.len() * std::mem::size_of::<Bucket>(),
            )
        };

        let mut buffer = Vec::with_capacity(header_bytes.len() + bucket_bytes.len());
        buffer.extend_from_slice(header_bytes);
        buffer.extend_from_slice(bucket_bytes);

        proxmox_sys::fs::replace_file(path, &buffer, CreateOptions::new(), true)
            .map_err(|err| format_err!("writing chunk index {:?} failed - {}", path, err))
    }
}

fn home_slot(id: &ChunkId, capacity: usize) -> usize {
    let bytes: [u8; 8] = id.as_bytes()[0..8].try_into().unwrap();
    (u64::from_le_bytes(bytes) as usize) & (capacity - 1)
}

fn next_power_of_two(n: usize) -> usize {
    n.next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> ChunkId {
        let mut bytes = [0u8; 32];
        bytes[0] = byte;
        ChunkId::from_bytes(bytes)
    }

    #[test]
    fn test_set_get_remove() {
        let mut index = ChunkIndex::new();
        assert!(index.get(&id(1)).is_none());

        index.set(&id(1), ChunkEntry::new(5, 8));
        let entry = index.get(&id(1)).unwrap();
        assert_eq!(entry.refcount, 1);
        assert_eq!(entry.plaintext_size, 5);
        assert_eq!(entry.ciphertext_size, 8);
        assert_eq!(index.len(), 1);

        index.remove(&id(1));
        assert!(index.get(&id(1)).is_none());
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_grows_under_load() {
        let mut index = ChunkIndex::with_capacity(4);
        for i in 0..200u8 {
            index.set(&id(i), ChunkEntry::new(i as u32, i as u32));
        }
        assert_eq!(index.len(), 200);
        for i in 0..200u8 {
            assert_eq!(index.get(&id(i)).unwrap().plaintext_size, i as u32);
        }
    }

    #[test]
    fn test_tombstone_reuse_does_not_break_lookup() {
        let mut index = ChunkIndex::with_capacity(4);
        index.set(&id(1), ChunkEntry::new(1, 1));
        index.set(&id(2), ChunkEntry::new(2, 2));
        index.remove(&id(1));
        index.set(&id(3), ChunkEntry::new(3, 3));
        assert!(index.get(&id(1)).is_none());
        assert_eq!(index.get(&id(2)).unwrap().plaintext_size, 2);
        assert_eq!(index.get(&id(3)).unwrap().plaintext_size, 3);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mut path = std::env::temp_dir();
        path.push(format!("ccache-index-test-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let mut index = ChunkIndex::new();
        for i in 0..20u8 {
            index.set(&id(i), ChunkEntry::new(i as u32 * 10, i as u32 * 11));
        }
        index.write(&path).unwrap();

        let reread = ChunkIndex::read(&path).unwrap();
        assert_eq!(reread.len(), index.len());
        for i in 0..20u8 {
            assert_eq!(
                reread.get(&id(i)).unwrap().plaintext_size,
                index.get(&id(i)).unwrap().plaintext_size
            );
        }

        let _ = std::fs::remove_file(&path);
    }
}
