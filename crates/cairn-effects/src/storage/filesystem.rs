//! Filesystem durable store
//!
//! One file per key under a base directory. The filename is the hex encoding
//! of the key, so arbitrary key characters (including `/`) never escape the
//! directory and prefix scans can be answered by decoding names. Writes go to
//! a temp file that is synced and then renamed over the target.

use async_trait::async_trait;
use cairn_core::effects::DurableStore;
use cairn_core::{CairnError, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const RECORD_EXT: &str = "rec";
const TEMP_EXT: &str = "tmp";
const MAX_KEY_LEN: usize = 120;

/// Durable store backed by a directory of files
#[derive(Debug, Clone)]
pub struct FilesystemDurableStore {
    base_path: PathBuf,
}

impl FilesystemDurableStore {
    /// Open (creating if needed) a store rooted at `base_path`
    ///
    /// Temp files left behind by an interrupted write are removed.
    pub async fn open(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).await.map_err(|e| {
            CairnError::storage(format!("Failed to create {}: {e}", base_path.display()))
        })?;

        let store = Self { base_path };
        let removed = store.remove_stale_temp_files().await?;
        info!(path = %store.base_path.display(), removed, "Opened filesystem durable store");
        Ok(store)
    }

    /// Directory holding the record files
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(CairnError::invalid("Key cannot be empty"));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(CairnError::invalid(format!(
                "Key too long ({} > {MAX_KEY_LEN} bytes)",
                key.len()
            )));
        }
        Ok(())
    }

    fn key_to_path(&self, key: &str) -> PathBuf {
        self.base_path
            .join(format!("{}.{RECORD_EXT}", hex::encode(key.as_bytes())))
    }

    fn path_to_key(path: &Path) -> Option<String> {
        if path.extension()?.to_str()? != RECORD_EXT {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let bytes = hex::decode(stem).ok()?;
        String::from_utf8(bytes).ok()
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let temp_path = path.with_extension(TEMP_EXT);
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| CairnError::storage(format!("Failed to create temp file: {e}")))?;
        file.write_all(data)
            .await
            .map_err(|e| CairnError::storage(format!("Failed to write data: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| CairnError::storage(format!("Failed to sync: {e}")))?;
        drop(file);

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| CairnError::storage(format!("Failed to rename temp file: {e}")))
    }

    async fn read_record(path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CairnError::store_corruption(format!(
                "Unreadable record {}: {e}",
                path.display()
            ))),
        }
    }

    async fn remove_stale_temp_files(&self) -> Result<usize> {
        let mut removed = 0;
        let mut read_dir = fs::read_dir(&self.base_path)
            .await
            .map_err(|e| CairnError::storage(format!("Failed to read directory: {e}")))?;
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| CairnError::storage(format!("Failed to read entry: {e}")))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(TEMP_EXT) {
                if let Err(e) = fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %e, "Failed to remove stale temp file");
                } else {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl DurableStore for FilesystemDurableStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        Self::validate_key(key)?;
        let path = self.key_to_path(key);
        self.write_atomic(&path, &value).await?;
        debug!(key, bytes = value.len(), "Stored record");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Self::validate_key(key)?;
        Self::read_record(&self.key_to_path(key)).await
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut keys = Vec::new();
        let mut read_dir = fs::read_dir(&self.base_path)
            .await
            .map_err(|e| CairnError::storage(format!("Failed to read directory: {e}")))?;
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| CairnError::storage(format!("Failed to read entry: {e}")))?
        {
            let path = entry.path();
            match Self::path_to_key(&path) {
                Some(key) if key.starts_with(prefix) => keys.push((key, path)),
                Some(_) => {}
                None => {
                    if path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXT) {
                        return Err(CairnError::store_corruption(format!(
                            "Undecodable record name {}",
                            path.display()
                        )));
                    }
                }
            }
        }
        keys.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = Vec::with_capacity(keys.len());
        for (key, path) in keys {
            // Deleted between listing and reading
            if let Some(bytes) = Self::read_record(&path).await? {
                out.push((key, bytes));
            }
        }
        Ok(out)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Self::validate_key(key)?;
        match fs::remove_file(self.key_to_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CairnError::storage(format!("Failed to delete {key}: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemDurableStore::open(dir.path()).await.unwrap();

        store.put("session/abc", b"record".to_vec()).await.unwrap();
        assert_eq!(
            store.get("session/abc").await.unwrap(),
            Some(b"record".to_vec())
        );
        assert!(store.delete("session/abc").await.unwrap());
        assert!(!store.delete("session/abc").await.unwrap());
        assert_eq!(store.get("session/abc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scan_sorted_by_key() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemDurableStore::open(dir.path()).await.unwrap();
        for key in ["queue/0003", "queue/0001", "chunk/x/0", "queue/0002"] {
            store.put(key, key.as_bytes().to_vec()).await.unwrap();
        }

        let scanned = store.scan("queue/").await.unwrap();
        let keys: Vec<&str> = scanned.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["queue/0001", "queue/0002", "queue/0003"]);
        assert_eq!(scanned[0].1, b"queue/0001".to_vec());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FilesystemDurableStore::open(dir.path()).await.unwrap();
            store.put("k", vec![7, 7]).await.unwrap();
        }
        let reopened = FilesystemDurableStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.get("k").await.unwrap(), Some(vec![7, 7]));
    }

    #[tokio::test]
    async fn test_stale_temp_files_removed_on_open() {
        let dir = TempDir::new().unwrap();
        let stale = dir.path().join(format!("{}.{TEMP_EXT}", hex::encode("k")));
        std::fs::write(&stale, b"partial").unwrap();

        let store = FilesystemDurableStore::open(dir.path()).await.unwrap();
        assert!(!stale.exists());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_bad_record_name_is_corruption() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemDurableStore::open(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("not-hex.rec"), b"x").unwrap();
        let result = store.scan("").await;
        assert!(matches!(result, Err(CairnError::StoreCorruption { .. })));
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemDurableStore::open(dir.path()).await.unwrap();
        assert!(store.put("", vec![]).await.is_err());
    }
}
