//! Per-chunk encryption
//!
//! Every chunk is sealed under its own key, derived from the session key with
//! `HKDF-SHA256(ikm = session key, salt = "chunk", info = index as u32 BE)`.
//! Ciphertexts are AES-256-GCM output (payload plus 16-byte tag); the 96-bit
//! IV is carried separately in the manifest entry.

use crate::errors::{CairnError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Symmetric key length in bytes
pub const KEY_LEN: usize = 32;

/// AES-GCM nonce length in bytes
pub const IV_LEN: usize = 12;

/// HKDF salt for chunk key derivation
pub const CHUNK_KEY_SALT: &[u8] = b"chunk";

/// Random per-recording key from which all chunk keys derive
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    /// Generate a fresh key from the OS RNG
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// From existing key material
    pub fn from_bytes(key: [u8; KEY_LEN]) -> Self {
        Self(key)
    }

    /// Borrow the key material
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Key for exactly one chunk index
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ChunkKey([u8; KEY_LEN]);

impl ChunkKey {
    /// Borrow the key material
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// Derive the key for chunk `index` of a session
pub fn derive_chunk_key(session_key: &SessionKey, index: u32) -> Result<ChunkKey> {
    let hkdf = Hkdf::<Sha256>::new(Some(CHUNK_KEY_SALT), session_key.as_bytes());
    let mut okm = [0u8; KEY_LEN];
    hkdf.expand(&index.to_be_bytes(), &mut okm)
        .map_err(|e| CairnError::encryption(format!("HKDF expansion failed: {e}")))?;
    Ok(ChunkKey(okm))
}

/// Fresh random 96-bit IV
pub fn generate_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    iv
}

/// Seal a plaintext segment
pub fn seal_chunk(key: &ChunkKey, iv: &[u8; IV_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CairnError::encryption(format!("Failed to create cipher: {e}")))?;
    cipher
        .encrypt(Nonce::from_slice(iv), plaintext)
        .map_err(|e| CairnError::encryption(format!("AES-GCM encryption failed: {e}")))
}

/// Open a sealed segment; fails if the tag does not authenticate
pub fn open_chunk(key: &ChunkKey, iv: &[u8; IV_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CairnError::encryption(format!("Failed to create cipher: {e}")))?;
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|e| CairnError::encryption(format!("AES-GCM decryption failed: {e}")))
}
