//! Sealing primitives for credential entries
//!
//! AES-256-GCM and ChaCha20-Poly1305 envelopes for secrets at rest,
//! Argon2id for deriving a wrapping key from a device passphrase.

use crate::{Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use argon2::{Argon2, ParamsBuilder, Version};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Current envelope format version
const ENVELOPE_VERSION: u8 = 1;

/// Header: [version(1)][algorithm(1)][nonce(12)]
const HEADER_LEN: usize = 14;

/// Sealing algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealingAlgorithm {
    /// AES-256-GCM
    AesGcm,
    /// ChaCha20-Poly1305
    ChaCha20Poly1305,
}

impl SealingAlgorithm {
    fn tag(self) -> u8 {
        match self {
            SealingAlgorithm::AesGcm => 0,
            SealingAlgorithm::ChaCha20Poly1305 => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(SealingAlgorithm::AesGcm),
            1 => Ok(SealingAlgorithm::ChaCha20Poly1305),
            other => Err(Error::Encryption(format!("Unknown algorithm tag: {}", other))),
        }
    }
}

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub m_cost: u32,
    /// Iterations
    pub t_cost: u32,
    /// Parallel lanes
    pub p_cost: u32,
}

impl Default for KdfParams {
    /// 64 MiB, 3 iterations, 4 lanes
    fn default() -> Self {
        Self {
            m_cost: 65536,
            t_cost: 3,
            p_cost: 4,
        }
    }
}

/// Key used to seal credential entries
#[derive(Clone)]
pub struct SealingKey {
    key: Zeroizing<[u8; 32]>,
    algorithm: SealingAlgorithm,
}

impl SealingKey {
    /// Generate new random sealing key
    pub fn generate(algorithm: SealingAlgorithm) -> Self {
        let mut key = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut key[..]);
        Self { key, algorithm }
    }

    /// Derive from a passphrase with Argon2id
    pub fn from_passphrase(
        passphrase: &str,
        salt: &[u8],
        params: KdfParams,
        algorithm: SealingAlgorithm,
    ) -> Result<Self> {
        let key = derive_key_bytes(passphrase, salt, params)?;
        Ok(Self { key, algorithm })
    }

    /// Algorithm used for new envelopes
    pub fn algorithm(&self) -> SealingAlgorithm {
        self.algorithm
    }

    /// Seal plaintext into a versioned envelope
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = match self.algorithm {
            SealingAlgorithm::AesGcm => Aes256Gcm::new(self.key.as_ref().into())
                .encrypt(Nonce::from_slice(&nonce_bytes), plaintext),
            SealingAlgorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new(self.key.as_ref().into())
                .encrypt(chacha20poly1305::Nonce::from_slice(&nonce_bytes), plaintext),
        }
        .map_err(|e| Error::Encryption(e.to_string()))?;

        let mut result = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        result.push(ENVELOPE_VERSION);
        result.push(self.algorithm.tag());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Open an envelope produced by [`SealingKey::seal`].
    ///
    /// The algorithm recorded in the envelope wins over the key's default, so
    /// entries sealed before an algorithm switch stay readable.
    pub fn open(&self, data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if data.len() < HEADER_LEN {
            return Err(Error::Encryption("Invalid ciphertext length".to_string()));
        }
        if data[0] != ENVELOPE_VERSION {
            return Err(Error::Encryption(format!(
                "Unsupported envelope version: {}",
                data[0]
            )));
        }
        let algorithm = SealingAlgorithm::from_tag(data[1])?;
        let nonce = &data[2..HEADER_LEN];
        let ciphertext = &data[HEADER_LEN..];

        let plaintext = match algorithm {
            SealingAlgorithm::AesGcm => Aes256Gcm::new(self.key.as_ref().into())
                .decrypt(Nonce::from_slice(nonce), ciphertext),
            SealingAlgorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new(self.key.as_ref().into())
                .decrypt(chacha20poly1305::Nonce::from_slice(nonce), ciphertext),
        }
        .map_err(|e| Error::Encryption(e.to_string()))?;

        Ok(Zeroizing::new(plaintext))
    }
}

/// Derive raw key bytes from passphrase using Argon2id.
pub fn derive_key_bytes(passphrase: &str, salt: &[u8], params: KdfParams) -> Result<Zeroizing<[u8; 32]>> {
    if salt.len() < 16 {
        return Err(Error::Encryption("Salt too short".to_string()));
    }

    let params = ParamsBuilder::new()
        .m_cost(params.m_cost)
        .t_cost(params.t_cost)
        .p_cost(params.p_cost)
        .output_len(32)
        .build()
        .map_err(|e| Error::Encryption(e.to_string()))?;

    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key[..])
        .map_err(|e| Error::Encryption(e.to_string()))?;
    Ok(key)
}

/// Generate secure random salt
pub fn generate_salt() -> [u8; 32] {
    let mut salt = [0u8; 32];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Hash data with SHA-256
pub fn hash_sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
