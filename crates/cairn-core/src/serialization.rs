//! Serialization helpers
//!
//! Byte fields are encoded as lowercase hex so the same record reads the same
//! in JSON (durable store) and canonical CBOR (manifests).

use crate::errors::Result;
use serde::{de::DeserializeOwned, Serialize};

/// Canonical CBOR encoding; equal values always produce equal bytes
pub fn to_canonical_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_cbor::to_vec(value)?)
}

/// Decode canonical CBOR
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_cbor::from_slice(bytes)?)
}

/// JSON encoding for durable-store records
pub fn to_record_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// `#[serde(with = "hex_vec")]` for `Vec<u8>`
pub mod hex_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize bytes as hex
    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    /// Deserialize bytes from hex
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// `#[serde(with = "hex_iv")]` for 12-byte AES-GCM nonces
pub mod hex_iv {
    use crate::crypto::IV_LEN;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize a nonce as hex
    pub fn serialize<S>(iv: &[u8; IV_LEN], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(iv))
    }

    /// Deserialize a nonce from hex
    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; IV_LEN], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let mut iv = [0u8; IV_LEN];
        hex::decode_to_slice(s, &mut iv).map_err(serde::de::Error::custom)?;
        Ok(iv)
    }
}
