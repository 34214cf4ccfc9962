//! Content checksums for config files
//!
//! BLAKE3 hex digests identify config file content. Two creates of the same
//! file id must carry the same checksum, which is how retried requests are
//! told apart from conflicting ones.

/// Compute BLAKE3 hash of data, return hex string
pub fn blake3_hash(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    format!("{}", hash)
}

/// Checksum of a config file's content
pub fn content_checksum(content: &str) -> String {
    blake3_hash(content.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blake3_hash() {
        let hash1 = blake3_hash(b"hello world");
        let hash2 = blake3_hash(b"hello world");
        let hash3 = blake3_hash(b"hello world!");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 64);
    }

    #[test]
    fn test_content_checksum_matches_bytes() {
        assert_eq!(content_checksum("listen 0.0.0.0"), blake3_hash(b"listen 0.0.0.0"));
    }
}
