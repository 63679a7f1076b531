//! File-system backed `Repository`: chunks are stored as individual files
//! under a two-level hex-prefix directory layout, the same sharding a real
//! object-store repository uses to keep any one directory from growing
//! unbounded (see pbs-datastore's `chunk_store.rs` `digest_to_prefix`).
//!
//! The real repository RPC transport is out of scope here (it is the
//! surrounding glue, not the cache/materializer this crate wraps); this
//! gives the binary something concrete to point the cache and materializer
//! at without needing a running server.

use std::fs;
use std::path::PathBuf;

use anyhow::Error;

use ccache_types::{ChunkId, Repository};

pub struct FsRepository {
    base: PathBuf,
    id: [u8; 32],
}

const ID_FILE: &str = "repository-id";
const CHUNKS_DIR: &str = "chunks";

impl FsRepository {
    pub fn open(base: PathBuf) -> Result<Self, Error> {
        fs::create_dir_all(base.join(CHUNKS_DIR))?;

        let id_path = base.join(ID_FILE);
        let id = match fs::read(&id_path) {
            Ok(bytes) if bytes.len() == 32 => {
                let mut out = [0u8; 32];
                out.copy_from_slice(&bytes);
                out
            }
            _ => {
                let mut id = [0u8; 32];
                openssl::rand::rand_bytes(&mut id)?;
                fs::write(&id_path, id)?;
                id
            }
        };

        Ok(FsRepository { base, id })
    }

    fn chunk_path(&self, id: &ChunkId) -> PathBuf {
        let hex = id.to_hex();
        self.base.join(CHUNKS_DIR).join(&hex[0..2]).join(&hex)
    }
}

impl Repository for FsRepository {
    fn id(&self) -> [u8; 32] {
        self.id
    }

    fn get(&self, id: &ChunkId) -> Result<Vec<u8>, Error> {
        Ok(fs::read(self.chunk_path(id))?)
    }

    fn get_many<'a>(
        &'a self,
        ids: &'a [ChunkId],
    ) -> Box<dyn Iterator<Item = Result<Vec<u8>, Error>> + 'a> {
        Box::new(ids.iter().map(move |id| self.get(id)))
    }

    fn put(&self, id: &ChunkId, ciphertext: &[u8], _wait: bool) -> Result<(), Error> {
        let path = self.chunk_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, ciphertext)?;
        Ok(())
    }

    fn delete(&self, id: &ChunkId, _wait: bool) -> Result<(), Error> {
        match fs::remove_file(self.chunk_path(id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
