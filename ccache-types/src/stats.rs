use std::fmt;

/// Running totals accumulated across `add_chunk` / `chunk_incref` /
/// `chunk_decref` calls for one cache session.
#[derive(Default, Clone, Copy)]
pub struct Stats {
    pub total_size: u64,
    pub total_csize: u64,
    pub total_chunks: u64,
    pub total_unique_chunks: u64,
    pub unique_size: u64,
    pub unique_csize: u64,
    pub total_unique_size: u64,
    pub total_unique_csize: u64,
}

impl Stats {
    pub fn chunk_added(&mut self, size: u64, csize: u64, unique: bool) {
        self.total_chunks += 1;
        self.total_size += size;
        self.total_csize += csize;
        if unique {
            self.total_unique_chunks += 1;
            self.unique_size += size;
            self.unique_csize += csize;
        }
    }

    /// Records a chunk freed by `chunk_decref`. `unique` is true iff this
    /// decref dropped the refcount to zero (the chunk was actually deleted).
    pub fn chunk_freed(&mut self, size: u64, csize: u64, unique: bool) {
        if unique {
            self.total_unique_size += size;
            self.total_unique_csize += csize;
        }
    }

    pub fn deduplication_factor(&self) -> f64 {
        if self.unique_size == 0 {
            1.0
        } else {
            self.total_size as f64 / self.unique_size as f64
        }
    }

    pub fn compression_factor(&self) -> f64 {
        if self.unique_csize == 0 {
            1.0
        } else {
            self.unique_size as f64 / self.unique_csize as f64
        }
    }
}

impl fmt::Debug for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stats")
            .field("total_chunks", &self.total_chunks)
            .field("total_unique_chunks", &self.total_unique_chunks)
            .field("total_size", &self.total_size)
            .field("total_csize", &self.total_csize)
            .field("dedup_factor", &self.deduplication_factor())
            .field("compression_factor", &self.compression_factor())
            .finish()
    }
}
