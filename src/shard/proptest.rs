//! Property-Based Tests for Sharding
//!
//! # Test Properties
//!
//! 1. **Determinism**: bucket and server ids are stable across calls
//! 2. **Range**: bucket ids fit in `bits`, server ids fit in `num_servers`
//! 3. **Prefix**: only the leading bytes of a hash influence its bucket

#![cfg(test)]

use proptest::prelude::*;

use super::{server_of, BucketId, Sharder, MAX_BUCKET_BITS};
use crate::task::ContentHash;

fn hash_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..64)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_bucket_is_deterministic(bits in 0u32..=MAX_BUCKET_BITS, bytes in hash_strategy()) {
        let sharder = Sharder::new(bits)?;
        let hash = ContentHash::from(bytes.clone());
        let again = ContentHash::from(bytes);

        prop_assert_eq!(sharder.bucket_of(&hash), sharder.bucket_of(&again));
    }

    #[test]
    fn prop_bucket_in_range(bits in 0u32..=16, bytes in hash_strategy()) {
        let sharder = Sharder::new(bits)?;
        let bucket = sharder.bucket_of(&ContentHash::from(bytes));

        prop_assert!((bucket.0 as u64) < sharder.bucket_count());
    }

    #[test]
    fn prop_server_in_range(bucket in any::<u32>(), servers in 1usize..64) {
        let server = server_of(BucketId(bucket), servers);

        prop_assert!(server.0 < servers);
        prop_assert_eq!(server, server_of(BucketId(bucket), servers));
    }

    #[test]
    fn prop_only_prefix_matters(
        bits in 1u32..=32,
        prefix in prop::collection::vec(any::<u8>(), 4),
        tail_a in hash_strategy(),
        tail_b in hash_strategy(),
    ) {
        let sharder = Sharder::new(bits)?;
        let mut a = prefix.clone();
        a.extend(tail_a);
        let mut b = prefix;
        b.extend(tail_b);

        prop_assert_eq!(
            sharder.bucket_of(&ContentHash::from(a)),
            sharder.bucket_of(&ContentHash::from(b))
        );
    }
}
