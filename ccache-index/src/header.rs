/// On-disk header for the chunk index file. Padded to a full page so the
/// bucket array that follows starts at a page-aligned file offset: `mmap(2)`
/// requires its `offset` argument to be a multiple of the page size, and the
/// bucket region is mapped directly from this offset in `ChunkIndex::read`.
#[repr(C)]
pub struct ChunkIndexHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub bucket_count: u64,
    pub occupied: u64,
    reserved: [u8; 4068],
}
proxmox_lang::static_assert_size!(ChunkIndexHeader, 4096);

// openssl::sha::sha256(b"Chunk Cache Index Magic 1.0")[0..8]
pub const CHUNK_INDEX_MAGIC_1_0: [u8; 8] = [0x1f, 0xca, 0x96, 0xbc, 0xe8, 0x20, 0x5a, 0x11];

pub const CHUNK_INDEX_VERSION: u32 = 1;

impl ChunkIndexHeader {
    pub fn new(bucket_count: u64, occupied: u64) -> Self {
        ChunkIndexHeader {
            magic: CHUNK_INDEX_MAGIC_1_0,
            version: CHUNK_INDEX_VERSION.to_le(),
            bucket_count: bucket_count.to_le(),
            occupied: occupied.to_le(),
            reserved: [0u8; 4068],
        }
    }
}
