//! Chunk and key-wrap cryptography
//!
//! - [`chunk`]: per-chunk key derivation (HKDF-SHA256) and AES-256-GCM sealing
//! - [`wrap`]: wrapping the session key under a group secret

pub mod chunk;
pub mod wrap;

pub use chunk::{
    derive_chunk_key, generate_iv, open_chunk, seal_chunk, ChunkKey, SessionKey, CHUNK_KEY_SALT,
    IV_LEN, KEY_LEN,
};
pub use wrap::{unwrap_session_key, wrap_session_key, GroupSecret, WrappedKey, WRAP_KEY_SALT};
