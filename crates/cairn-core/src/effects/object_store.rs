//! Content-addressed object store

use crate::errors::Result;
use crate::identifiers::ObjectAddress;
use async_trait::async_trait;

/// Immutable blob storage addressed by content
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes`, returning their address. Storing equal bytes twice
    /// returns the same address.
    async fn put(&self, bytes: Vec<u8>) -> Result<ObjectAddress>;

    /// Fetch the bytes stored at `address`
    async fn get(&self, address: &ObjectAddress) -> Result<Vec<u8>>;
}
