//! Key-hash convention shared by the string table and the HAMT.

use xxhash_rust::xxh32::xxh32;

/// Hash a byte string to the 32-bit code used for key lookups.
///
/// xxHash32 with seed 0. The string interning table and [`Hamt`](crate::Hamt)
/// both key on this, so an encoded dictionary and its companion index agree
/// on hash codes.
#[inline]
#[must_use]
pub fn hash32(data: &[u8]) -> u32 {
    xxh32(data, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vectors() {
        // Reference values from the xxHash sanity suite (seed 0).
        assert_eq!(hash32(b""), 0x02CC_5D05);
        assert_eq!(hash32(b"a"), 0x550D_7456);
        assert_eq!(hash32(b"abc"), 0x32D1_53FF);
    }

    #[test]
    fn test_distinct_inputs_differ() {
        assert_ne!(hash32(b"key"), hash32(b"kez"));
    }
}
