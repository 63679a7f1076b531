//! In-memory stand-in for the content-addressed blob store (§3
//! "Repository", out of scope for the cache itself). Lets tests exercise
//! `Cache`/`Materializer` without a real backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{format_err, Error};

use ccache_types::{ChunkId, Repository};

#[derive(Clone, Default)]
pub struct MemoryRepository {
    id: [u8; 32],
    blobs: Arc<Mutex<HashMap<[u8; 32], Vec<u8>>>>,
}

impl MemoryRepository {
    pub fn new(id: [u8; 32]) -> Self {
        MemoryRepository {
            id,
            blobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.blobs.lock().unwrap().contains_key(id.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrites a stored blob with arbitrary bytes, for tests that need
    /// to simulate a corrupted or truncated chunk.
    pub fn corrupt(&self, id: &ChunkId, bytes: Vec<u8>) {
        self.blobs.lock().unwrap().insert(*id.as_bytes(), bytes);
    }

    pub fn remove(&self, id: &ChunkId) {
        self.blobs.lock().unwrap().remove(id.as_bytes());
    }
}

impl Repository for MemoryRepository {
    fn id(&self) -> [u8; 32] {
        self.id
    }

    fn get(&self, id: &ChunkId) -> Result<Vec<u8>, Error> {
        self.blobs
            .lock()
            .unwrap()
            .get(id.as_bytes())
            .cloned()
            .ok_or_else(|| format_err!("no such chunk {}", id))
    }

    fn get_many<'a>(
        &'a self,
        ids: &'a [ChunkId],
    ) -> Box<dyn Iterator<Item = Result<Vec<u8>, Error>> + 'a> {
        Box::new(ids.iter().map(move |id| self.get(id)))
    }

    fn put(&self, id: &ChunkId, ciphertext: &[u8], _wait: bool) -> Result<(), Error> {
        self.blobs
            .lock()
            .unwrap()
            .insert(*id.as_bytes(), ciphertext.to_vec());
        Ok(())
    }

    fn delete(&self, id: &ChunkId, _wait: bool) -> Result<(), Error> {
        self.blobs.lock().unwrap().remove(id.as_bytes());
        Ok(())
    }
}
