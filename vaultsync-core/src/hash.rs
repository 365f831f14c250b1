//! Content hashing for chunk ids.
//!
//! The strategy is selected once at construction from the settings; hashing
//! itself is pure and deterministic. With a passphrase configured the hash is
//! salted so ids do not leak content equality across passphrase boundaries,
//! and the id carries a trailing `+` so readers can tell the encrypted chunk
//! format apart without decrypting.

use crate::config::{HashAlgorithm, VaultSettings};
use crate::document::{CHUNK_ID_PREFIX, DocumentId, ENCRYPTED_ID_SUFFIX};
use sha2::{Digest, Sha256};

/// Computes stable content-hash ids for chunk pieces.
#[derive(Debug, Clone)]
pub struct ChunkHasher {
    algorithm: HashAlgorithm,
    salt: Option<String>,
}

impl ChunkHasher {
    pub fn new(settings: &VaultSettings) -> Self {
        Self {
            algorithm: settings.effective_hash_algorithm(),
            salt: settings.passphrase.clone(),
        }
    }

    /// Compute the chunk id for a piece of content.
    pub fn compute(&self, piece: &str) -> DocumentId {
        match self.algorithm {
            HashAlgorithm::Sha256 => {
                let digest = Sha256::digest(piece.as_bytes());
                DocumentId::new(format!("{}{}", CHUNK_ID_PREFIX, hex::encode(digest)))
            }
            HashAlgorithm::SaltedSha256 => {
                let mut hasher = Sha256::new();
                if let Some(salt) = &self.salt {
                    hasher.update(salt.as_bytes());
                    hasher.update((salt.len() as u64).to_le_bytes());
                }
                hasher.update(piece.as_bytes());
                let digest = hasher.finalize();
                DocumentId::new(format!(
                    "{}{}{}",
                    CHUNK_ID_PREFIX,
                    hex::encode(digest),
                    ENCRYPTED_ID_SUFFIX
                ))
            }
        }
    }
}
