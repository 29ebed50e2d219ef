//! Session key wrapping
//!
//! The session key is sealed once per authorized group at session start.
//! The wrap key is `HKDF-SHA256(ikm = group secret, salt = "wrap",
//! info = group id)`; the session id is bound in as associated data so a
//! wrapped key cannot be replayed into another session's access list.

use super::chunk::{generate_iv, SessionKey, IV_LEN, KEY_LEN};
use crate::errors::{CairnError, Result};
use crate::identifiers::{GroupId, SessionId};
use crate::serialization::{hex_iv, hex_vec};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// HKDF salt for wrap key derivation
pub const WRAP_KEY_SALT: &[u8] = b"wrap";

/// Shared secret of one group, supplied by the key service
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct GroupSecret([u8; KEY_LEN]);

impl GroupSecret {
    /// From existing key material
    pub fn from_bytes(secret: [u8; KEY_LEN]) -> Self {
        Self(secret)
    }

    /// Borrow the secret
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for GroupSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("GroupSecret(..)")
    }
}

/// Session key sealed for one group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// AES-GCM output over the session key
    #[serde(with = "hex_vec")]
    pub ciphertext: Vec<u8>,
    /// Nonce used for this wrap
    #[serde(with = "hex_iv")]
    pub iv: [u8; IV_LEN],
}

fn wrap_cipher(secret: &GroupSecret, group_id: &GroupId) -> Result<Aes256Gcm> {
    let hkdf = Hkdf::<Sha256>::new(Some(WRAP_KEY_SALT), secret.as_bytes());
    let mut okm = [0u8; KEY_LEN];
    hkdf.expand(group_id.as_str().as_bytes(), &mut okm)
        .map_err(|e| CairnError::encryption(format!("HKDF expansion failed: {e}")))?;
    let cipher = Aes256Gcm::new_from_slice(&okm)
        .map_err(|e| CairnError::encryption(format!("Failed to create cipher: {e}")));
    okm.zeroize();
    cipher
}

/// Seal the session key for `group_id` with a fresh IV
pub fn wrap_session_key(
    key: &SessionKey,
    secret: &GroupSecret,
    session_id: &SessionId,
    group_id: &GroupId,
) -> Result<WrappedKey> {
    let cipher = wrap_cipher(secret, group_id)?;
    let iv = generate_iv();
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: key.as_bytes(),
                aad: session_id.as_bytes(),
            },
        )
        .map_err(|e| CairnError::encryption(format!("Key wrapping failed: {e}")))?;
    Ok(WrappedKey { ciphertext, iv })
}

/// Recover the session key; any failure means the caller has no access
pub fn unwrap_session_key(
    wrapped: &WrappedKey,
    secret: &GroupSecret,
    session_id: &SessionId,
    group_id: &GroupId,
) -> Result<SessionKey> {
    let cipher = wrap_cipher(secret, group_id)?;
    let mut plaintext = cipher
        .decrypt(
            Nonce::from_slice(&wrapped.iv),
            Payload {
                msg: &wrapped.ciphertext,
                aad: session_id.as_bytes(),
            },
        )
        .map_err(|_| {
            CairnError::access_denied(format!("Wrapped key for group {group_id} did not open"))
        })?;

    if plaintext.len() != KEY_LEN {
        plaintext.zeroize();
        return Err(CairnError::access_denied(format!(
            "Wrapped key for group {group_id} has wrong length"
        )));
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&plaintext);
    plaintext.zeroize();
    Ok(SessionKey::from_bytes(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (SessionKey, GroupSecret, SessionId, GroupId) {
        (
            SessionKey::generate(),
            GroupSecret::from_bytes([3u8; 32]),
            SessionId::new(),
            GroupId::new("family"),
        )
    }

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let (key, secret, session, group) = fixture();
        let wrapped = wrap_session_key(&key, &secret, &session, &group).unwrap();
        let unwrapped = unwrap_session_key(&wrapped, &secret, &session, &group).unwrap();
        assert_eq!(key.as_bytes(), unwrapped.as_bytes());
    }

    #[test]
    fn test_fresh_iv_per_wrap() {
        let (key, secret, session, group) = fixture();
        let a = wrap_session_key(&key, &secret, &session, &group).unwrap();
        let b = wrap_session_key(&key, &secret, &session, &group).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wrong_secret_is_access_denied() {
        let (key, secret, session, group) = fixture();
        let wrapped = wrap_session_key(&key, &secret, &session, &group).unwrap();
        let other = GroupSecret::from_bytes([4u8; 32]);
        let result = unwrap_session_key(&wrapped, &other, &session, &group);
        assert!(matches!(result, Err(CairnError::AccessDenied { .. })));
    }

    #[test]
    fn test_wrap_bound_to_session() {
        let (key, secret, session, group) = fixture();
        let wrapped = wrap_session_key(&key, &secret, &session, &group).unwrap();
        let result = unwrap_session_key(&wrapped, &secret, &SessionId::new(), &group);
        assert!(matches!(result, Err(CairnError::AccessDenied { .. })));
    }

    #[test]
    fn test_wrap_bound_to_group() {
        let (key, secret, session, group) = fixture();
        let wrapped = wrap_session_key(&key, &secret, &session, &group).unwrap();
        let result = unwrap_session_key(&wrapped, &secret, &session, &GroupId::new("work"));
        assert!(result.is_err());
    }
}
