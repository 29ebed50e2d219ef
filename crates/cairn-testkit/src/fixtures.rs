//! Segments, secrets and a wired-up pipeline

use crate::faults::{FaultyLedger, FaultyObjectStore};
use cairn_core::crypto::GroupSecret;
use cairn_core::effects::DurableStore;
use cairn_core::{GroupId, Hash32, SessionId};
use cairn_effects::{FilesystemDurableStore, MemoryDurableStore, StaticKeyService, SystemClock};
use cairn_pipeline::{
    CairnConfig, GroupCredential, PipelineEffects, SessionCoordinator, VerificationReport,
    VerificationService,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Deterministic stand-in for ten seconds of captured media
pub fn segment(index: u32) -> Vec<u8> {
    let mut bytes = format!("segment-{index:04}:").into_bytes();
    bytes.extend((0..1024u32).map(|i| (i.wrapping_mul(31).wrapping_add(index) % 251) as u8));
    bytes
}

/// Group secret derived from a label
pub fn group_secret(label: &str) -> GroupSecret {
    GroupSecret::from_bytes(*Hash32::from_bytes(format!("group:{label}").as_bytes()).as_bytes())
}

/// Collaborators that outlive any one coordinator
///
/// Every handle is shared, so dropping a coordinator and calling
/// [`open`](Self::open) again behaves like a process restart over the same
/// disk, object store and ledger. A harness built with
/// [`on_disk`](Self::on_disk) reopens its directory on every `open`.
#[derive(Clone)]
pub struct TestHarness {
    /// Durable local store
    pub store: Arc<dyn DurableStore>,
    disk: Option<PathBuf>,
    /// Object store with fault knobs
    pub objects: FaultyObjectStore,
    /// Ledger with fault knobs
    pub ledger: FaultyLedger,
    /// Memberships of the capturing identity
    pub keys: StaticKeyService,
    /// Configuration used by `open`
    pub config: CairnConfig,
}

impl TestHarness {
    /// Harness whose identity belongs to `groups`, with test timings
    pub fn new(groups: &[&str]) -> Self {
        let keys = groups.iter().fold(StaticKeyService::new(), |keys, label| {
            keys.with_group(*label, group_secret(label))
        });
        Self {
            store: Arc::new(MemoryDurableStore::new()),
            disk: None,
            objects: FaultyObjectStore::new(),
            ledger: FaultyLedger::new(),
            keys,
            config: CairnConfig::for_testing(),
        }
    }

    /// Harness persisting to a [`FilesystemDurableStore`] under `base_path`
    pub async fn on_disk(groups: &[&str], base_path: impl Into<PathBuf>) -> Self {
        let mut harness = Self::new(groups);
        harness.config.storage.base_path = base_path.into();
        let store = FilesystemDurableStore::open(&harness.config.storage.base_path)
            .await
            .expect("durable store opens");
        harness.store = Arc::new(store);
        harness.disk = Some(harness.config.storage.base_path.clone());
        harness
    }

    /// Replace the durable store
    pub fn with_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = store;
        self.disk = None;
        self
    }

    /// Replace the configuration
    pub fn with_config(mut self, config: CairnConfig) -> Self {
        self.config = config;
        self
    }

    /// Effects handed to the coordinator
    pub fn effects(&self) -> PipelineEffects {
        PipelineEffects {
            durable_store: self.store.clone(),
            object_store: Arc::new(self.objects.clone()),
            ledger: Arc::new(self.ledger.clone()),
            keys: Arc::new(self.keys.clone()),
            clock: Arc::new(SystemClock::new()),
        }
    }

    /// Open a coordinator over the shared state
    pub async fn open(&self) -> SessionCoordinator {
        let mut effects = self.effects();
        if let Some(path) = &self.disk {
            let store = FilesystemDurableStore::open(path)
                .await
                .expect("durable store reopens");
            effects.durable_store = Arc::new(store);
        }
        SessionCoordinator::open(self.config.clone(), effects)
            .await
            .expect("coordinator opens")
    }

    /// Verifier holding the secret of `group`
    pub fn verifier(&self, group: &str) -> VerificationService {
        VerificationService::new(
            Arc::new(self.objects.clone()),
            GroupCredential {
                group_id: GroupId::new(group),
                secret: group_secret(group),
            },
            self.config.verification.clone(),
        )
    }

    /// Verify the latest ledger anchor of `session_id` as a member of `group`
    pub async fn verify_latest(&self, session_id: &SessionId, group: &str) -> VerificationReport {
        self.verifier(group)
            .verify_latest(session_id, &self.ledger)
            .await
            .expect("verification runs")
    }
}
