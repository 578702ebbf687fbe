//! Stable key partitioner
//!
//! `fnv1a_hash(key) % partitions`. The mapping only depends on the key bytes
//! and the partition count, so every producer process agrees on it.

/// FNV-1a offset basis (32-bit).
const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;

/// FNV-1a prime (32-bit).
const FNV_PRIME: u32 = 0x0100_0193;

/// Computes a 32-bit FNV-1a hash of the key bytes.
///
/// ```
/// use smsgate_queue::fnv1a_hash;
///
/// assert_eq!(fnv1a_hash("hello"), 1_335_831_723);
/// assert_eq!(fnv1a_hash(""), 2_166_136_261);
/// ```
#[must_use]
pub fn fnv1a_hash(key: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in key.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Partition owning `key` among `partitions` (treated as at least 1)
#[must_use]
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    fnv1a_hash(key) % partitions.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_partitions() {
        assert_eq!(partition_for("hello", 271), 95);
        assert_eq!(partition_for("key1", 271), 268);
    }

    #[test]
    fn test_single_partition() {
        assert_eq!(partition_for("anything", 1), 0);
        assert_eq!(partition_for("anything", 0), 0);
    }

    #[test]
    fn test_uuid_keys_spread() {
        let keys: Vec<String> = (0..64)
            .map(|i| format!("00000000-0000-0000-0000-{:012}", i))
            .collect();
        let used: std::collections::HashSet<u32> =
            keys.iter().map(|k| partition_for(k, 8)).collect();
        assert!(used.len() > 1);
    }
}
