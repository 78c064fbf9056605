//! Content Addressing and Sharding
//!
//! Maps a content hash to the bucket that stores it, and a bucket to the
//! storage node that owns it.
//!
//! # Design
//!
//! ```text
//!   hash: 1011 0010 1110 ...      bucket_bits = 3
//!         ^^^
//!         bucket = 0b101 = 5      server = 5 mod num_servers
//! ```
//!
//! Both mappings are pure: the same inputs always produce the same ids, so a
//! bucket belongs to exactly one node for the lifetime of a deployment.

mod proptest;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::task::ContentHash;

/// Width of a bucket id in bits. Bucket bit counts above this are rejected.
pub const MAX_BUCKET_BITS: u32 = u32::BITS;

/// Default number of bucket bits (128 buckets)
pub const DEFAULT_BUCKET_BITS: u32 = 7;

/// Identifier of a bucket (a shard of the hash space).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketId(pub u32);

impl std::fmt::Display for BucketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a registered storage node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerId(pub usize);

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Derives bucket and server ids from content hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sharder {
    bits: u32,
}

impl Sharder {
    /// Create a sharder using the top `bits` bits of each hash.
    pub fn new(bits: u32) -> Result<Self> {
        if bits > MAX_BUCKET_BITS {
            return Err(Error::ShardingConfig {
                bits,
                max_bits: MAX_BUCKET_BITS,
            });
        }
        Ok(Self { bits })
    }

    /// Number of bucket bits in use.
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Number of distinct buckets (`2^bits`).
    pub fn bucket_count(&self) -> u64 {
        1u64 << self.bits
    }

    /// Bucket owning `hash`.
    ///
    /// Missing trailing bytes of a short hash read as zero.
    #[inline]
    pub fn bucket_of(&self, hash: &ContentHash) -> BucketId {
        if self.bits == 0 {
            return BucketId(0);
        }

        let mut prefix = [0u8; 4];
        let bytes = hash.as_bytes();
        let n = bytes.len().min(prefix.len());
        prefix[..n].copy_from_slice(&bytes[..n]);

        BucketId(u32::from_be_bytes(prefix) >> (MAX_BUCKET_BITS - self.bits))
    }

    /// Node owning `hash` among `num_servers` registered nodes.
    #[inline]
    pub fn route(&self, hash: &ContentHash, num_servers: usize) -> (BucketId, ServerId) {
        let bucket = self.bucket_of(hash);
        (bucket, server_of(bucket, num_servers))
    }
}

/// Node owning `bucket` among `num_servers` registered nodes.
///
/// `num_servers` must be non-zero.
#[inline]
pub fn server_of(bucket: BucketId, num_servers: usize) -> ServerId {
    debug_assert!(num_servers > 0, "server_of requires at least one server");
    ServerId(bucket.0 as usize % num_servers)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(bytes: &[u8]) -> ContentHash {
        ContentHash::from(bytes.to_vec())
    }

    #[test]
    fn test_rejects_too_many_bits() {
        assert!(Sharder::new(MAX_BUCKET_BITS).is_ok());

        let err = Sharder::new(MAX_BUCKET_BITS + 1).unwrap_err();
        assert!(matches!(
            err,
            Error::ShardingConfig {
                bits: 33,
                max_bits: 32
            }
        ));
    }

    #[test]
    fn test_bucket_count() {
        assert_eq!(Sharder::new(0).unwrap().bucket_count(), 1);
        assert_eq!(Sharder::new(3).unwrap().bucket_count(), 8);
        assert_eq!(Sharder::new(7).unwrap().bucket_count(), 128);
    }

    #[test]
    fn test_top_bits() {
        let sharder = Sharder::new(3).unwrap();
        // 0b101x_xxxx
        assert_eq!(sharder.bucket_of(&hash(&[0b1011_0010, 0xff])), BucketId(5));
        assert_eq!(sharder.bucket_of(&hash(&[0x00, 0xff])), BucketId(0));
        assert_eq!(sharder.bucket_of(&hash(&[0xff])), BucketId(7));

        let sharder = Sharder::new(7).unwrap();
        assert_eq!(sharder.bucket_of(&hash(&[0xff, 0x00])), BucketId(127));
        assert_eq!(sharder.bucket_of(&hash(&[0x02, 0x00])), BucketId(1));
    }

    #[test]
    fn test_bits_spanning_bytes() {
        let sharder = Sharder::new(12).unwrap();
        assert_eq!(
            sharder.bucket_of(&hash(&[0xab, 0xcd, 0xef])),
            BucketId(0xabc)
        );

        let sharder = Sharder::new(32).unwrap();
        assert_eq!(
            sharder.bucket_of(&hash(&[0xde, 0xad, 0xbe, 0xef, 0x01])),
            BucketId(0xdead_beef)
        );
    }

    #[test]
    fn test_zero_bits_is_single_bucket() {
        let sharder = Sharder::new(0).unwrap();
        assert_eq!(sharder.bucket_of(&hash(&[0xff; 20])), BucketId(0));
        assert_eq!(sharder.bucket_of(&hash(&[0x12; 20])), BucketId(0));
    }

    #[test]
    fn test_short_hash_is_zero_padded() {
        let sharder = Sharder::new(16).unwrap();
        assert_eq!(sharder.bucket_of(&hash(&[0x80])), BucketId(0x8000));
        assert_eq!(sharder.bucket_of(&hash(&[])), BucketId(0));
    }

    #[test]
    fn test_server_of() {
        assert_eq!(server_of(BucketId(9), 4), ServerId(1));
        assert_eq!(server_of(BucketId(8), 4), ServerId(0));
        assert_eq!(server_of(BucketId(127), 3), ServerId(1));
    }

    #[test]
    fn test_single_server_always_zero() {
        for b in 0..128 {
            assert_eq!(server_of(BucketId(b), 1), ServerId(0));
        }
    }

    #[test]
    fn test_route_combines_both() {
        let sharder = Sharder::new(3).unwrap();
        let (bucket, server) = sharder.route(&hash(&[0b1010_0000]), 3);
        assert_eq!(bucket, BucketId(5));
        assert_eq!(server, ServerId(2));
    }
}
