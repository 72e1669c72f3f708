//! Protolab Utils - Utility Functions
//!
//! Hashing and time helpers shared by the simulation engines.
//!
//! Key Features:
//! - Fast hashing using xxHash3 for placement decisions
//! - Ring-position hashing bounded to a configurable ring size
//! - Wall-clock milliseconds via chrono
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use xxhash_rust::xxh3::xxh3_64;

// =============================================================================
// Hashing Functions
// =============================================================================

/// Compute a 64-bit hash of the given bytes using xxHash3.
#[inline]
pub fn hash64(data: &[u8]) -> u64 {
    xxh3_64(data)
}

/// Compute a hash suitable for consistent hashing ring placement.
#[inline]
pub fn ring_hash(key: &[u8]) -> u64 {
    hash64(key)
}

/// Position of `key` on a ring of `ring_size` slots. A ring size of zero is
/// treated as the full 64-bit space.
#[inline]
pub fn ring_position(key: &str, ring_size: u64) -> u64 {
    let h = ring_hash(key.as_bytes());
    if ring_size == 0 {
        h
    } else {
        h % ring_size
    }
}

/// Bucket index for `key` among `buckets` buckets.
#[inline]
pub fn bucket_of(key: &str, buckets: usize) -> usize {
    if buckets == 0 {
        return 0;
    }
    (hash64(key.as_bytes()) % buckets as u64) as usize
}

// =============================================================================
// Time Functions
// =============================================================================

/// Milliseconds since the Unix epoch.
#[inline]
pub fn current_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(hash64(b"key-1"), hash64(b"key-1"));
        assert_ne!(hash64(b"key-1"), hash64(b"key-2"));
    }

    #[test]
    fn test_ring_position_bounded() {
        for i in 0..100 {
            let key = format!("key-{}", i);
            assert!(ring_position(&key, 360) < 360);
        }
        assert_eq!(ring_position("a", 0), ring_hash(b"a"));
    }

    #[test]
    fn test_bucket_of() {
        assert_eq!(bucket_of("anything", 0), 0);
        for i in 0..50 {
            assert!(bucket_of(&format!("k{}", i), 8) < 8);
        }
    }

    #[test]
    fn test_current_millis_advances() {
        let a = current_millis();
        let b = current_millis();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000);
    }
}
