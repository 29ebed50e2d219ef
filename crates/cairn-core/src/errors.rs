//! Unified error system for the capture pipeline
//!
//! One error enum covers the whole taxonomy. Callers branch on
//! [`CairnError::is_transient`] to decide between retrying and surfacing.

use serde::{Deserialize, Serialize};

/// Unified error type for all Cairn operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum CairnError {
    /// Key derivation or AEAD sealing failed; never retried with the same key material
    #[error("Encryption error: {message}")]
    Encryption {
        /// Error message describing the cryptographic failure
        message: String,
    },

    /// A digest did not match the committed value
    #[error("Hash mismatch for {subject}: expected {expected}, got {actual}")]
    HashMismatch {
        /// What was being checked (e.g. "chunk 3 ciphertext")
        subject: String,
        /// Expected digest (hex)
        expected: String,
        /// Computed digest (hex)
        actual: String,
    },

    /// Object store call failed
    #[error("Upload error: {message}")]
    Upload {
        /// Error message describing the upload failure
        message: String,
    },

    /// Ledger commit failed
    #[error("Anchor error: {message}")]
    Anchor {
        /// Error message describing the anchor failure
        message: String,
    },

    /// Caller holds no usable wrapped key for the session
    #[error("Access denied: {message}")]
    AccessDenied {
        /// Error message describing why access was refused
        message: String,
    },

    /// The durable local store returned data that cannot be decoded
    #[error("Store corruption: {message}")]
    StoreCorruption {
        /// Error message describing the corrupted record
        message: String,
    },

    /// Durable store I/O failed
    #[error("Storage error: {message}")]
    Storage {
        /// Error message describing the storage failure
        message: String,
    },

    /// Resource not found
    #[error("Not found: {message}")]
    NotFound {
        /// Error message describing what was not found
        message: String,
    },

    /// Invalid input, configuration or state transition
    #[error("Invalid: {message}")]
    Invalid {
        /// Error message describing the invalid input
        message: String,
    },

    /// A network attempt exceeded its time budget
    #[error("Timed out after {millis}ms: {operation}")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Budget that was exceeded
        millis: u64,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message describing the serialization failure
        message: String,
    },

    /// Internal system error
    #[error("Internal error: {message}")]
    Internal {
        /// Error message describing the internal error
        message: String,
    },
}

impl CairnError {
    /// Create an encryption error
    pub fn encryption(message: impl Into<String>) -> Self {
        Self::Encryption {
            message: message.into(),
        }
    }

    /// Create a hash mismatch error
    pub fn hash_mismatch(
        subject: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::HashMismatch {
            subject: subject.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create an upload error
    pub fn upload(message: impl Into<String>) -> Self {
        Self::Upload {
            message: message.into(),
        }
    }

    /// Create an anchor error
    pub fn anchor(message: impl Into<String>) -> Self {
        Self::Anchor {
            message: message.into(),
        }
    }

    /// Create an access denied error
    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::AccessDenied {
            message: message.into(),
        }
    }

    /// Create a store corruption error
    pub fn store_corruption(message: impl Into<String>) -> Self {
        Self::StoreCorruption {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, millis: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            millis,
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether a retry of the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Upload { .. } | Self::Anchor { .. } | Self::Timeout { .. } | Self::Storage { .. }
        )
    }

    /// Whether the failure requires intervention rather than a retry
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Encryption { .. } | Self::StoreCorruption { .. } | Self::AccessDenied { .. }
        )
    }
}

/// Standard Result type for Cairn operations
pub type Result<T> = std::result::Result<T, CairnError>;

impl From<serde_json::Error> for CairnError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<serde_cbor::Error> for CairnError {
    fn from(err: serde_cbor::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<std::io::Error> for CairnError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(err.to_string()),
            std::io::ErrorKind::InvalidData => Self::store_corruption(err.to_string()),
            _ => Self::storage(err.to_string()),
        }
    }
}
