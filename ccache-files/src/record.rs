use serde::{Deserialize, Serialize};

/// Wire shape of one files-cache record: `(path_hash, [age, inode, size,
/// mtime_ns, chunk_ids])`, matching the tuple layout the source format
/// used (msgpack is self-framing, so records are simply concatenated —
/// there is no separate length prefix).
#[derive(Serialize, Deserialize)]
pub struct Record {
    pub path_hash: [u8; 32],
    pub age: u32,
    pub inode: u64,
    pub size: u64,
    pub mtime_ns: i64,
    pub chunk_ids: Vec<[u8; 32]>,
}
