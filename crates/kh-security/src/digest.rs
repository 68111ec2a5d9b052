//! SHA-256 content digests.
//!
//! Used for computing the content address of stored artifacts (wordlists,
//! rule files, hashcat binaries) and for hashing claim codes / API keys
//! before they are persisted.

use sha2::{Digest, Sha256};

/// Compute the lowercase hex SHA-256 digest of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Incremental SHA-256 hasher for streaming large files without buffering
/// the whole content in memory (file store writes digest while spooling
/// to disk).
#[derive(Default)]
pub struct StreamingDigest {
    hasher: Sha256,
}

impl StreamingDigest {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    pub fn finish_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_matches_known_vector() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn streaming_digest_matches_one_shot() {
        let mut streaming = StreamingDigest::new();
        streaming.update(b"hello ");
        streaming.update(b"world");
        assert_eq!(streaming.finish_hex(), sha256_hex(b"hello world"));
    }
}
