//! Digest selection by hash length
//!
//! The coordinator names objects by MD5 (32 hex chars) or SHA-1 (anything
//! else). The rule is part of the wire contract and must not change without
//! a protocol bump.

use md5::Md5;
use sha1::{Digest, Sha1};

/// Hex length of an MD5 digest
const MD5_HEX_LEN: usize = 32;

/// Incremental hasher matching an expected content hash
pub enum ContentHasher {
    Md5(Md5),
    Sha1(Sha1),
}

impl ContentHasher {
    pub fn for_hash(expected: &str) -> Self {
        if expected.len() == MD5_HEX_LEN {
            ContentHasher::Md5(Md5::new())
        } else {
            ContentHasher::Sha1(Sha1::new())
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            ContentHasher::Md5(h) => h.update(data),
            ContentHasher::Sha1(h) => h.update(data),
        }
    }

    /// Lowercase hex digest
    pub fn finalize(self) -> String {
        match self {
            ContentHasher::Md5(h) => hex::encode(h.finalize()),
            ContentHasher::Sha1(h) => hex::encode(h.finalize()),
        }
    }
}

/// Hashes are compared case-insensitively
pub fn matches(expected: &str, actual: &str) -> bool {
    expected.eq_ignore_ascii_case(actual)
}
