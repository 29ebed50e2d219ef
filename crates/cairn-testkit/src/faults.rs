//! Fault-injecting collaborators
//!
//! Each wrapper delegates to the in-memory handler from `cairn-effects` and
//! adds knobs a test can turn while the pipeline is running. Clones share
//! both the inner state and the knobs.

use async_trait::async_trait;
use cairn_core::effects::{
    AnchorRecord, AnchorRequest, DurableStore, LedgerEffects, ObjectStore, TxReceipt,
};
use cairn_core::{CairnError, ObjectAddress, Result, SessionId};
use cairn_effects::{MemoryDurableStore, MemoryLedger, MemoryObjectStore};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Default)]
struct ObjectFaults {
    fail_puts: usize,
    delays: Option<(StdRng, u64)>,
    tampered: HashMap<ObjectAddress, usize>,
    lost: HashSet<ObjectAddress>,
    put_attempts: usize,
    puts: usize,
    gets: usize,
}

/// Object store that can fail, stall, delay or corrupt
#[derive(Clone)]
pub struct FaultyObjectStore {
    inner: MemoryObjectStore,
    faults: Arc<Mutex<ObjectFaults>>,
    gate: Arc<watch::Sender<bool>>,
}

impl Default for FaultyObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultyObjectStore {
    /// Healthy store with no faults armed
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            inner: MemoryObjectStore::new(),
            faults: Arc::new(Mutex::new(ObjectFaults::default())),
            gate: Arc::new(gate),
        }
    }

    /// The wrapped store, bypassing every fault
    pub fn inner(&self) -> &MemoryObjectStore {
        &self.inner
    }

    /// Fail the next `n` puts with an upload error
    pub fn fail_next_puts(&self, n: usize) {
        self.faults.lock().fail_puts = n;
    }

    /// Delay each put by a seeded random duration up to `max_ms`
    pub fn random_delays(&self, seed: u64, max_ms: u64) {
        self.faults.lock().delays = Some((StdRng::seed_from_u64(seed), max_ms));
    }

    /// Block puts until [`release_puts`](Self::release_puts)
    pub fn hold_puts(&self) {
        self.gate.send_replace(false);
    }

    /// Let held and future puts through
    pub fn release_puts(&self) {
        self.gate.send_replace(true);
    }

    /// Flip one byte of the object at `address` on every later read
    pub fn tamper(&self, address: &ObjectAddress, byte: usize) {
        self.faults.lock().tampered.insert(address.clone(), byte);
    }

    /// Make the object at `address` unreadable
    pub fn lose(&self, address: &ObjectAddress) {
        self.faults.lock().lost.insert(address.clone());
    }

    /// Puts that reached the inner store
    pub fn put_count(&self) -> usize {
        self.faults.lock().puts
    }

    /// Puts attempted, including injected failures
    pub fn put_attempts(&self) -> usize {
        self.faults.lock().put_attempts
    }

    /// Reads attempted, including lost objects
    pub fn get_count(&self) -> usize {
        self.faults.lock().gets
    }

    /// Distinct objects held
    pub async fn object_count(&self) -> usize {
        self.inner.len().await
    }
}

#[async_trait]
impl ObjectStore for FaultyObjectStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<ObjectAddress> {
        let mut gate = self.gate.subscribe();
        gate.wait_for(|open| *open)
            .await
            .map_err(|_| CairnError::upload("object store gate dropped"))?;

        let delay_ms = {
            let mut faults = self.faults.lock();
            faults.put_attempts += 1;
            if faults.fail_puts > 0 {
                faults.fail_puts -= 1;
                return Err(CairnError::upload("injected put failure"));
            }
            match faults.delays.as_mut() {
                Some((rng, max_ms)) if *max_ms > 0 => rng.gen_range(0..=*max_ms),
                _ => 0,
            }
        };
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        let address = self.inner.put(bytes).await?;
        self.faults.lock().puts += 1;
        Ok(address)
    }

    async fn get(&self, address: &ObjectAddress) -> Result<Vec<u8>> {
        let (lost, tampered) = {
            let mut faults = self.faults.lock();
            faults.gets += 1;
            (
                faults.lost.contains(address),
                faults.tampered.get(address).copied(),
            )
        };
        if lost {
            return Err(CairnError::not_found(format!("Object {address} is gone")));
        }
        let mut bytes = self.inner.get(address).await?;
        if let Some(position) = tampered {
            if !bytes.is_empty() {
                let len = bytes.len();
                bytes[position % len] ^= 0xff;
            }
        }
        Ok(bytes)
    }
}

/// Durable store whose writes can be held back by key prefix
#[derive(Clone)]
pub struct FaultyDurableStore {
    inner: MemoryDurableStore,
    // `Some(prefix)`: writes outside `prefix` wait
    gate: Arc<watch::Sender<Option<String>>>,
}

impl Default for FaultyDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultyDurableStore {
    /// Store with every write let through
    pub fn new() -> Self {
        let (gate, _) = watch::channel(None);
        Self {
            inner: MemoryDurableStore::new(),
            gate: Arc::new(gate),
        }
    }

    /// The wrapped store, bypassing the gate
    pub fn inner(&self) -> &MemoryDurableStore {
        &self.inner
    }

    /// Block puts and deletes of keys outside `prefix` until
    /// [`release_puts`](Self::release_puts)
    pub fn hold_puts_except(&self, prefix: &str) {
        self.gate.send_replace(Some(prefix.to_string()));
    }

    /// Let held and future writes through
    pub fn release_puts(&self) {
        self.gate.send_replace(None);
    }

    async fn pass_gate(&self, key: &str) -> Result<()> {
        let mut gate = self.gate.subscribe();
        gate.wait_for(|held| held.as_deref().map_or(true, |prefix| key.starts_with(prefix)))
            .await
            .map(|_| ())
            .map_err(|_| CairnError::storage("durable store gate dropped"))
    }
}

#[async_trait]
impl DurableStore for FaultyDurableStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.pass_gate(key).await?;
        self.inner.put(key, value).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.inner.scan(prefix).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.pass_gate(key).await?;
        self.inner.delete(key).await
    }
}

#[derive(Default)]
struct LedgerFaults {
    fail_commits: usize,
    commit_attempts: usize,
}

/// Ledger that can reject commits
#[derive(Clone, Default)]
pub struct FaultyLedger {
    inner: MemoryLedger,
    faults: Arc<Mutex<LedgerFaults>>,
}

impl FaultyLedger {
    /// Healthy ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` commits with an anchor error
    pub fn fail_next_commits(&self, n: usize) {
        self.faults.lock().fail_commits = n;
    }

    /// Commits that landed for `session_id`, in arrival order
    pub fn commits(&self, session_id: &SessionId) -> Vec<AnchorRequest> {
        self.inner.commits(session_id)
    }

    /// Commits that landed across all sessions
    pub fn commit_count(&self) -> usize {
        self.inner.commit_count()
    }

    /// Commits attempted, including injected failures
    pub fn commit_attempts(&self) -> usize {
        self.faults.lock().commit_attempts
    }
}

#[async_trait]
impl LedgerEffects for FaultyLedger {
    async fn commit(&self, request: AnchorRequest) -> Result<TxReceipt> {
        {
            let mut faults = self.faults.lock();
            faults.commit_attempts += 1;
            if faults.fail_commits > 0 {
                faults.fail_commits -= 1;
                return Err(CairnError::anchor("injected commit failure"));
            }
        }
        self.inner.commit(request).await
    }

    async fn latest_anchor(&self, session_id: &SessionId) -> Result<Option<AnchorRecord>> {
        self.inner.latest_anchor(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::Hash32;

    #[tokio::test]
    async fn test_failures_then_recovery() {
        let store = FaultyObjectStore::new();
        store.fail_next_puts(2);
        assert!(store.put(b"a".to_vec()).await.is_err());
        assert!(store.put(b"a".to_vec()).await.is_err());
        let address = store.put(b"a".to_vec()).await.unwrap();
        assert_eq!(store.put_attempts(), 3);
        assert_eq!(store.put_count(), 1);
        assert_eq!(store.get(&address).await.unwrap(), b"a".to_vec());
    }

    #[tokio::test]
    async fn test_tamper_changes_hash() {
        let store = FaultyObjectStore::new();
        let address = store.put(b"payload".to_vec()).await.unwrap();
        store.tamper(&address, 3);
        let bytes = store.get(&address).await.unwrap();
        assert_ne!(Hash32::from_bytes(&bytes), Hash32::from_bytes(b"payload"));
    }

    #[tokio::test]
    async fn test_held_put_completes_after_release() {
        let store = FaultyObjectStore::new();
        store.hold_puts();
        let pending = tokio::spawn({
            let store = store.clone();
            async move { store.put(b"x".to_vec()).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(store.put_count(), 0);
        store.release_puts();
        pending.await.unwrap().unwrap();
        assert_eq!(store.put_count(), 1);
    }

    #[tokio::test]
    async fn test_held_durable_writes_skip_exempt_prefix() {
        let store = FaultyDurableStore::new();
        store.hold_puts_except("payload/");
        store.put("payload/a", b"p".to_vec()).await.unwrap();

        let pending = tokio::spawn({
            let store = store.clone();
            async move { store.put("chunk/a", b"c".to_vec()).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(store.get("chunk/a").await.unwrap().is_none());

        store.release_puts();
        pending.await.unwrap().unwrap();
        assert_eq!(store.inner().len().await, 2);
    }

    #[tokio::test]
    async fn test_ledger_failures_are_transient() {
        let ledger = FaultyLedger::new();
        ledger.fail_next_commits(1);
        let request = AnchorRequest {
            session_id: SessionId::new(),
            integrity_root: Hash32::ZERO,
            manifest_address: ObjectAddress::for_content(b"m"),
            chunk_count: 1,
            group_ids: vec![],
        };
        let err = ledger.commit(request.clone()).await.unwrap_err();
        assert!(err.is_transient());
        ledger.commit(request).await.unwrap();
        assert_eq!(ledger.commit_count(), 1);
        assert_eq!(ledger.commit_attempts(), 2);
    }
}
