//! Restart scenarios: a coordinator is dropped with work outstanding and a
//! new one is opened over the same durable store, object store and ledger.
//! The durable store is either shared memory or a directory that is reopened
//! on every start.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use cairn_core::effects::DurableStore;
use cairn_core::{ChunkStatus, GroupId, QueueTask, SessionId, SessionStatus, TaskKind};
use cairn_pipeline::queue::QUEUE_PREFIX;
use cairn_pipeline::records::chunk_key;
use cairn_pipeline::SessionCoordinator;
use cairn_testkit::{init_tracing, segment, TestHarness};
use std::collections::HashSet;
use std::time::Duration;
use tempfile::TempDir;

async fn settle(coordinator: &SessionCoordinator, session_id: &SessionId) {
    tokio::time::timeout(
        Duration::from_secs(10),
        coordinator.wait_until_settled(session_id),
    )
    .await
    .expect("session settles in time")
    .expect("progress channel open");
}

async fn wait_for_confirmed(coordinator: &SessionCoordinator, session_id: &SessionId, count: u32) {
    let mut progress = coordinator.progress(session_id).await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(10),
        progress.wait_for(|p| p.chunks_confirmed >= count),
    )
    .await
    .expect("chunks confirmed in time")
    .unwrap();
}

async fn persisted_tasks(harness: &TestHarness) -> Vec<QueueTask> {
    harness
        .store
        .scan(QUEUE_PREFIX)
        .await
        .unwrap()
        .into_iter()
        .map(|(_, bytes)| serde_json::from_slice(&bytes).unwrap())
        .collect()
}

/// Poll until uploads of chunks `from..from + count` are persisted
async fn wait_for_upload_tasks(harness: &TestHarness, from: u32, count: usize) -> Vec<QueueTask> {
    for _ in 0..500 {
        let tasks = persisted_tasks(harness).await;
        let uploads = tasks
            .iter()
            .filter(|t| matches!(t.kind, TaskKind::UploadChunk { index } if index >= from))
            .count();
        if uploads >= count {
            return tasks;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{count} upload tasks were never persisted");
}

fn assert_no_duplicate_anchors(harness: &TestHarness, session_id: &SessionId) {
    let commits = harness.ledger.commits(session_id);
    let counts: HashSet<u32> = commits.iter().map(|c| c.chunk_count).collect();
    assert_eq!(counts.len(), commits.len(), "a chunk count was anchored twice");
}

async fn tasks_survive_restart(harness: TestHarness) {
    harness.objects.hold_puts();

    let session_id = {
        let coordinator = harness.open().await;
        let session_id = coordinator
            .start_session(vec![GroupId::new("family")])
            .await
            .unwrap();
        for i in 0..4 {
            coordinator.process_chunk(segment(i)).await.unwrap();
        }
        let pending = wait_for_upload_tasks(&harness, 0, 4).await;
        assert_eq!(pending.len(), 4);
        assert_eq!(harness.objects.put_count(), 0);
        session_id
    };

    harness.objects.release_puts();
    let coordinator = harness.open().await;
    assert_eq!(
        coordinator.session_status(&session_id).await.unwrap(),
        SessionStatus::Interrupted
    );
    settle(&coordinator, &session_id).await;

    let session = coordinator.session(&session_id).await.unwrap();
    assert_eq!(session.chunk_count, 4);
    assert_eq!(session.anchored_chunk_count, 4);
    assert!(coordinator
        .chunks(&session_id)
        .await
        .unwrap()
        .iter()
        .all(|c| c.status == ChunkStatus::Confirmed));
    assert_no_duplicate_anchors(&harness, &session_id);
    assert!(persisted_tasks(&harness).await.is_empty());

    let report = harness.verify_latest(&session_id, "family").await;
    assert!(report.is_complete());
    let expected: Vec<u8> = (0..4).flat_map(segment).collect();
    assert_eq!(report.reassemble(), expected);
}

#[tokio::test]
async fn persisted_tasks_succeed_after_restart() {
    init_tracing();
    tasks_survive_restart(TestHarness::new(&["family"])).await;
}

#[tokio::test]
async fn persisted_tasks_succeed_after_restart_on_disk() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    tasks_survive_restart(TestHarness::on_disk(&["family"], dir.path()).await).await;
}

async fn restart_extends_history(harness: TestHarness) {
    let (session_id, anchored_before) = {
        let coordinator = harness.open().await;
        let session_id = coordinator
            .start_session(vec![GroupId::new("family")])
            .await
            .unwrap();
        coordinator.process_chunk(segment(0)).await.unwrap();
        coordinator.process_chunk(segment(1)).await.unwrap();
        wait_for_confirmed(&coordinator, &session_id, 2).await;

        harness.objects.hold_puts();
        coordinator.process_chunk(segment(2)).await.unwrap();
        coordinator.process_chunk(segment(3)).await.unwrap();
        wait_for_upload_tasks(&harness, 2, 2).await;
        (session_id, harness.ledger.commits(&session_id).len())
    };
    assert!(anchored_before >= 1);

    harness.objects.release_puts();
    let coordinator = harness.open().await;
    settle(&coordinator, &session_id).await;

    let session = coordinator.session(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Interrupted);
    assert_eq!(session.anchored_chunk_count, 4);
    let counts: Vec<u32> = session.manifests.iter().map(|m| m.chunk_count).collect();
    assert_eq!(counts, vec![1, 2, 3, 4]);
    assert_no_duplicate_anchors(&harness, &session_id);

    let report = harness.verify_latest(&session_id, "family").await;
    assert!(report.is_complete());
    assert_eq!(report.per_chunk.len(), 4);
}

#[tokio::test]
async fn restart_mid_session_extends_existing_history() {
    init_tracing();
    restart_extends_history(TestHarness::new(&["family"])).await;
}

#[tokio::test]
async fn restart_mid_session_extends_existing_history_on_disk() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    restart_extends_history(TestHarness::on_disk(&["family"], dir.path()).await).await;
}

#[tokio::test]
async fn payload_without_chunk_record_is_rebuilt() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let harness = TestHarness::on_disk(&["family"], dir.path()).await;
    harness.objects.hold_puts();

    let session_id = {
        let coordinator = harness.open().await;
        let session_id = coordinator
            .start_session(vec![GroupId::new("family")])
            .await
            .unwrap();
        coordinator.process_chunk(segment(0)).await.unwrap();
        coordinator.process_chunk(segment(1)).await.unwrap();
        wait_for_upload_tasks(&harness, 0, 2).await;
        session_id
    };

    // Crash right after the payload of chunk 1 was written: no chunk record
    // and no upload task made it to disk
    let (task_key, _) = harness
        .store
        .scan(QUEUE_PREFIX)
        .await
        .unwrap()
        .into_iter()
        .find(|(_, bytes)| {
            let task: QueueTask = serde_json::from_slice(bytes).unwrap();
            task.kind == TaskKind::UploadChunk { index: 1 }
        })
        .unwrap();
    harness.store.delete(&task_key).await.unwrap();
    assert!(harness.store.delete(&chunk_key(&session_id, 1)).await.unwrap());

    harness.objects.release_puts();
    let coordinator = harness.open().await;
    settle(&coordinator, &session_id).await;

    let session = coordinator.session(&session_id).await.unwrap();
    assert_eq!(session.chunk_count, 2);
    assert_eq!(session.anchored_chunk_count, 2);
    let chunks = coordinator.chunks(&session_id).await.unwrap();
    assert_eq!(chunks.len(), 2);
    assert!(chunks.iter().all(|c| c.status == ChunkStatus::Confirmed));
    assert_no_duplicate_anchors(&harness, &session_id);

    let report = harness.verify_latest(&session_id, "family").await;
    let expected: Vec<u8> = (0..2).flat_map(segment).collect();
    assert_eq!(report.reassemble(), expected);
}

#[tokio::test]
async fn ended_session_interrupted_by_restart_still_drains() {
    init_tracing();
    let harness = TestHarness::new(&["family"]);
    harness.objects.hold_puts();

    let session_id = {
        let coordinator = harness.open().await;
        let session_id = coordinator
            .start_session(vec![GroupId::new("family")])
            .await
            .unwrap();
        for i in 0..3 {
            coordinator.process_chunk(segment(i)).await.unwrap();
        }
        coordinator.end_session().await.unwrap();
        coordinator.shutdown();
        session_id
    };

    harness.objects.release_puts();
    let coordinator = harness.open().await;
    assert!(coordinator.active_session().is_none());
    settle(&coordinator, &session_id).await;

    let session = coordinator.session(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Interrupted);
    assert!(session.ended_at.is_some());
    assert_eq!(session.anchored_chunk_count, 3);
}
