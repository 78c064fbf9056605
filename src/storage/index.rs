//! Bucket Index
//!
//! In-memory map from content hash to the location of its payload in the
//! bucket's data file, plus its on-disk encoding.
//!
//! # File Format
//!
//! ```text
//! ┌──────────┬─────────┬───────────┬─────────┬──────────────────────────────┐
//! │ "AIDX"   │ version │ bucket id │ count   │ entries × count              │
//! │ 4 bytes  │ u16     │ u32       │ u32     │ hash_len u16 │ hash │ offset │
//! │          │         │           │         │ u64 │ length u32             │
//! └──────────┴─────────┴───────────┴─────────┴──────────────────────────────┘
//! ```
//!
//! All integers are little-endian. The whole file is rewritten on every
//! flush through a temporary file and an atomic rename.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FaultKind, StorageFault};
use crate::shard::BucketId;
use crate::task::ContentHash;

/// Leading magic bytes of every index file
pub const INDEX_MAGIC: [u8; 4] = *b"AIDX";

/// Current index format version
pub const INDEX_FORMAT_VERSION: u16 = 1;

/// Longest hash an index entry can hold
pub const MAX_HASH_LEN: usize = u16::MAX as usize;

const HEADER_LEN: usize = 4 + 2 + 4 + 4;

/// Location of one payload in a bucket's data file.
///
/// Ordered by offset so that a batch of reads can be issued in disk order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataEntry {
    /// Byte offset in the data file
    pub offset: u64,
    /// Payload length in bytes
    pub length: u32,
}

impl DataEntry {
    pub fn new(offset: u64, length: u32) -> Self {
        Self { offset, length }
    }

    /// Offset one past the last byte.
    pub fn end(&self) -> u64 {
        self.offset + self.length as u64
    }
}

/// The authoritative record of what one bucket stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketIndex {
    bucket: BucketId,
    entries: HashMap<ContentHash, DataEntry>,
}

impl BucketIndex {
    /// Create an empty index.
    pub fn new(bucket: BucketId) -> Self {
        Self {
            bucket,
            entries: HashMap::new(),
        }
    }

    pub fn bucket(&self) -> BucketId {
        self.bucket
    }

    pub fn get(&self, hash: &ContentHash) -> Option<DataEntry> {
        self.entries.get(hash).copied()
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.entries.contains_key(hash)
    }

    /// Insert an entry, returning the previous one.
    pub fn insert(&mut self, hash: ContentHash, entry: DataEntry) -> Option<DataEntry> {
        self.entries.insert(hash, entry)
    }

    pub fn remove(&mut self, hash: &ContentHash) -> Option<DataEntry> {
        self.entries.remove(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ContentHash, &DataEntry)> {
        self.entries.iter()
    }

    /// Total payload bytes referenced by the index.
    pub fn stored_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.length as u64).sum()
    }

    // =========================================================================
    // Encoding
    // =========================================================================

    /// Encode the index. Entries are written in offset order so the output
    /// is deterministic. Fails if a hash is longer than [`MAX_HASH_LEN`].
    pub fn encode(&self) -> Result<Bytes, StorageFault> {
        let mut sorted: Vec<(&ContentHash, &DataEntry)> = self.entries.iter().collect();
        sorted.sort_by_key(|(hash, entry)| (**entry, (*hash).clone()));

        let body: usize = sorted.iter().map(|(h, _)| 2 + h.len() + 8 + 4).sum();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + body);

        buf.put_slice(&INDEX_MAGIC);
        buf.put_u16_le(INDEX_FORMAT_VERSION);
        buf.put_u32_le(self.bucket.0);
        buf.put_u32_le(sorted.len() as u32);

        for (hash, entry) in sorted {
            let hash_len = u16::try_from(hash.len()).map_err(|_| {
                StorageFault::new(
                    FaultKind::IndexWrite,
                    self.bucket,
                    format!("hash of {} bytes exceeds the index limit", hash.len()),
                )
            })?;
            buf.put_u16_le(hash_len);
            buf.put_slice(hash.as_bytes());
            buf.put_u64_le(entry.offset);
            buf.put_u32_le(entry.length);
        }

        Ok(buf.freeze())
    }

    /// Decode an index previously produced by [`encode`](Self::encode).
    pub fn decode(bucket: BucketId, data: &[u8]) -> Result<Self, StorageFault> {
        let corrupt = |detail: String| StorageFault::new(FaultKind::IndexCorrupt, bucket, detail);

        let mut buf = data;
        if buf.remaining() < HEADER_LEN {
            return Err(corrupt(format!(
                "index is {} bytes, shorter than its header",
                data.len()
            )));
        }

        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != INDEX_MAGIC {
            return Err(corrupt(format!("bad magic {:?}", magic)));
        }

        let version = buf.get_u16_le();
        if version != INDEX_FORMAT_VERSION {
            return Err(corrupt(format!("unsupported index version {}", version)));
        }

        let stored_bucket = buf.get_u32_le();
        if stored_bucket != bucket.0 {
            return Err(corrupt(format!(
                "index belongs to bucket {}",
                stored_bucket
            )));
        }

        let count = buf.get_u32_le() as usize;
        let mut entries = HashMap::with_capacity(count.min(1 << 16));

        for i in 0..count {
            if buf.remaining() < 2 {
                return Err(corrupt(format!("truncated at entry {}", i)));
            }
            let hash_len = buf.get_u16_le() as usize;
            if buf.remaining() < hash_len + 8 + 4 {
                return Err(corrupt(format!("truncated at entry {}", i)));
            }
            let hash = ContentHash::from(Bytes::copy_from_slice(&buf[..hash_len]));
            buf.advance(hash_len);
            let offset = buf.get_u64_le();
            let length = buf.get_u32_le();

            if entries.insert(hash, DataEntry::new(offset, length)).is_some() {
                return Err(corrupt(format!("duplicate hash at entry {}", i)));
            }
        }

        if buf.has_remaining() {
            return Err(corrupt(format!("{} trailing bytes", buf.remaining())));
        }

        Ok(Self { bucket, entries })
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Read the index at `path`. Returns `None` when no index exists yet.
    pub fn load(bucket: BucketId, path: &Path) -> Result<Option<Self>, StorageFault> {
        match std::fs::read(path) {
            Ok(data) => Self::decode(bucket, &data).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageFault::io(FaultKind::IndexRead, bucket, &e)),
        }
    }

    /// Replace the index at `path` with this one.
    ///
    /// The new contents are written to a temporary file in the same
    /// directory and renamed over `path`, so a crash leaves either the old or
    /// the new index, never a torn one.
    pub fn persist(&self, path: &Path, sync: bool) -> Result<(), StorageFault> {
        let fault = |e: &std::io::Error| StorageFault::io(FaultKind::IndexWrite, self.bucket, e);
        let dir = path.parent().unwrap_or_else(|| Path::new("."));

        let encoded = self.encode()?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| fault(&e))?;
        tmp.write_all(&encoded).map_err(|e| fault(&e))?;
        if sync {
            tmp.as_file().sync_all().map_err(|e| fault(&e))?;
        }
        tmp.persist(path).map_err(|e| fault(&e.error))?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
