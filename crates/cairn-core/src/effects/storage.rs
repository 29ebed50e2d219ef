//! Durable local key-value store

use crate::errors::Result;
use async_trait::async_trait;

/// Local key-value persistence used for records and queue tasks
///
/// A successful `put` must survive a process restart. Keys are ordered
/// byte-wise; `scan` returns matches in ascending key order.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Write `value` under `key`, replacing any previous value
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Read the value under `key`
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// All entries whose key starts with `prefix`, ascending by key
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Remove `key`; returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;
}
