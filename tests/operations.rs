//! Integration tests for push and pull operations.
//!
//! Operations run against the in-memory backend with the nop and mock
//! providers. The nop provider's `delay` parameter keeps an operation
//! running long enough to exercise conflicts and cancellation.

use std::sync::Arc;

use serde_json::json;

use stratum::core::error::Error;
use stratum::core::paths::DatasetPaths;
use stratum::core::types::{Commit, Properties, Remote, RemoteParameters, Repository};
use stratum::ops::{
    MemoryStore, MetadataStore, OperationEngine, OperationState, OperationType, ProgressEntry,
    ProgressType,
};
use stratum::remote::mock::{FailOn, MockCall, MockProvider, MOCK_PROVIDER};
use stratum::remote::RemoteRegistry;
use stratum::storage::memory::{FailOn as StorageFailOn, MemoryBackend};
use stratum::storage::StorageEngine;

// =============================================================================
// Test Helpers
// =============================================================================

struct Harness {
    backend: MemoryBackend,
    store: MemoryStore,
    mock: MockProvider,
    engine: OperationEngine,
}

impl Harness {
    /// Repository `foo` with volume `vol`, commit `c1`, a nop remote
    /// `origin` and a mock remote `mirror`.
    fn new() -> Self {
        Self::with_mock(MockProvider::new())
    }

    fn with_mock(mock: MockProvider) -> Self {
        let backend = MemoryBackend::new("tank");
        let storage = StorageEngine::new(
            Arc::new(backend.clone()),
            DatasetPaths::new("tank", "/var/lib/stratum/mnt"),
        );
        storage.initialize().unwrap();
        storage.create_repository(&Repository::new("foo")).unwrap();
        storage.create_volume("foo", "vol", &Properties::new()).unwrap();
        storage.create_commit("foo", &Commit::new("c1")).unwrap();
        storage.add_remote("foo", &Remote::nop("origin")).unwrap();
        storage
            .add_remote("foo", &Remote::new("mirror", MOCK_PROVIDER))
            .unwrap();

        let store = MemoryStore::new();
        let registry = RemoteRegistry::with_defaults().with(mock.clone());
        let engine = OperationEngine::new(storage, registry, Arc::new(store.clone()), None);
        Self {
            backend,
            store,
            mock,
            engine,
        }
    }

    fn storage(&self) -> &StorageEngine {
        self.engine.storage()
    }

    /// Wait for the operation and return every progress entry it produced.
    async fn finish(&self, id: &str) -> Vec<ProgressEntry> {
        self.engine.join("foo", id).await.unwrap();
        self.engine.get_progress("foo", id).await.unwrap()
    }
}

fn mock_params() -> RemoteParameters {
    RemoteParameters::new(MOCK_PROVIDER)
}

fn kinds(progress: &[ProgressEntry]) -> Vec<ProgressType> {
    progress.iter().map(|p| p.kind).collect()
}

// =============================================================================
// Progress streams
// =============================================================================

#[tokio::test]
async fn nop_pull_reports_exact_sequence() {
    let h = Harness::new();
    let op = h
        .engine
        .start_pull("foo", "origin", "c2", RemoteParameters::nop(), false)
        .await
        .unwrap();
    assert_eq!(op.kind, OperationType::Pull);
    assert_eq!(op.state, OperationState::Running);
    assert_eq!(op.commit_id, "c2");
    assert_eq!(op.remote, "origin");

    let progress = h.finish(&op.id).await;
    assert_eq!(
        progress,
        vec![
            ProgressEntry::message("Pulling c2 from 'origin'"),
            ProgressEntry::start("Running operation"),
            ProgressEntry::end(),
            ProgressEntry::complete(),
        ]
    );

    let commit = h.storage().get_commit("foo", "c2").unwrap();
    assert!(commit.timestamp().is_some());
    assert!(h.store.list(None).unwrap().is_empty());
}

#[tokio::test]
async fn nop_push_discards_workspace() {
    let h = Harness::new();
    let before = h.backend.dataset_names();
    let op = h
        .engine
        .start_push("foo", "origin", "c1", RemoteParameters::nop(), false)
        .await
        .unwrap();
    let progress = h.finish(&op.id).await;

    assert_eq!(progress[0], ProgressEntry::message("Pushing c1 to 'origin'"));
    assert_eq!(progress.last(), Some(&ProgressEntry::complete()));
    assert_eq!(h.backend.dataset_names(), before);
    assert!(h.backend.mounts().is_empty());
}

#[tokio::test]
async fn finished_operation_is_read_once() {
    let h = Harness::new();
    let op = h
        .engine
        .start_pull("foo", "origin", "c2", RemoteParameters::nop(), false)
        .await
        .unwrap();
    h.finish(&op.id).await;

    let err = h.engine.get_progress("foo", &op.id).await.unwrap_err();
    assert!(err.is_no_such_object());
    assert!(h.engine.get_operation("foo", &op.id).await.unwrap_err().is_no_such_object());
    assert!(h.engine.list_operations("foo").await.unwrap().is_empty());
}

// =============================================================================
// Single writer per commit
// =============================================================================

/// Start an operation of `kind` on `c1` that stays running until aborted.
async fn start_slow(
    h: &Harness,
    kind: OperationType,
    metadata_only: bool,
) -> Result<String, Error> {
    let params = RemoteParameters::nop_with_delay(60);
    let op = match kind {
        OperationType::Push => {
            h.engine
                .start_push("foo", "origin", "c1", params, metadata_only)
                .await?
        }
        OperationType::Pull => {
            h.engine
                .start_pull("foo", "origin", "c1", params, metadata_only)
                .await?
        }
    };
    Ok(op.id)
}

#[tokio::test]
async fn one_running_operation_per_commit() {
    // A full pull of c1 is rejected since c1 exists locally, so the pull
    // side of each pair refreshes metadata.
    let pairs = [
        ((OperationType::Push, false), (OperationType::Push, false)),
        ((OperationType::Push, false), (OperationType::Pull, true)),
        ((OperationType::Pull, true), (OperationType::Push, true)),
        ((OperationType::Pull, true), (OperationType::Pull, true)),
    ];

    for ((first_kind, first_meta), (second_kind, second_meta)) in pairs {
        let h = Harness::new();
        let first = start_slow(&h, first_kind, first_meta).await.unwrap();

        let err = start_slow(&h, second_kind, second_meta).await.unwrap_err();
        assert!(
            err.is_object_exists(),
            "{first_kind} then {second_kind}: expected conflict, got {err:?}"
        );
        assert!(err.to_string().contains(&first));

        h.engine.abort_operation("foo", &first).await.unwrap();
        h.engine.join("foo", &first).await.unwrap();
    }
}

#[tokio::test]
async fn other_commits_are_not_blocked() {
    let h = Harness::new();
    let slow = start_slow(&h, OperationType::Push, false).await.unwrap();

    let op = h
        .engine
        .start_pull("foo", "origin", "c2", RemoteParameters::nop(), false)
        .await
        .unwrap();
    let progress = h.finish(&op.id).await;
    assert_eq!(progress.last(), Some(&ProgressEntry::complete()));

    let running = h.engine.list_operations("foo").await.unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].id, slow);

    h.engine.abort_operation("foo", &slow).await.unwrap();
    h.engine.join("foo", &slow).await.unwrap();
}

#[tokio::test]
async fn commit_is_free_again_after_completion() {
    let h = Harness::new();
    for _ in 0..2 {
        let op = h
            .engine
            .start_push("foo", "origin", "c1", RemoteParameters::nop(), false)
            .await
            .unwrap();
        h.finish(&op.id).await;
    }
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn abort_stops_a_running_pull() {
    let h = Harness::new();
    let op = h
        .engine
        .start_pull("foo", "origin", "c2", RemoteParameters::nop_with_delay(60), false)
        .await
        .unwrap();
    assert_eq!(h.store.list(Some("foo")).unwrap().len(), 1);

    h.engine.abort_operation("foo", &op.id).await.unwrap();
    h.engine.join("foo", &op.id).await.unwrap();

    let aborted = h.engine.get_operation("foo", &op.id).await.unwrap();
    assert_eq!(aborted.state, OperationState::Aborted);

    let progress = h.engine.get_progress("foo", &op.id).await.unwrap();
    assert_eq!(progress.last(), Some(&ProgressEntry::abort()));
    assert!(!kinds(&progress).contains(&ProgressType::Complete));

    assert!(h.storage().get_commit("foo", "c2").unwrap_err().is_no_such_object());
    assert!(h.backend.mounts().is_empty());
    assert!(h.store.list(None).unwrap().is_empty());
}

#[tokio::test]
async fn aborting_a_finished_operation_is_harmless() {
    let h = Harness::new();
    let op = h
        .engine
        .start_push("foo", "origin", "c1", RemoteParameters::nop(), false)
        .await
        .unwrap();
    h.engine.join("foo", &op.id).await.unwrap();

    h.engine.abort_operation("foo", &op.id).await.unwrap();
    let done = h.engine.get_operation("foo", &op.id).await.unwrap();
    assert_eq!(done.state, OperationState::Complete);
}

#[tokio::test]
async fn abort_of_unknown_operation_fails() {
    let h = Harness::new();
    let unknown = "9a4c2e1b-0d3f-4e5a-b6c7-d8e9f0a1b2c3";
    let err = h.engine.abort_operation("foo", unknown).await.unwrap_err();
    assert!(err.is_no_such_object());
}

#[tokio::test]
async fn malformed_operation_ids_are_rejected() {
    let h = Harness::new();
    for id in ["nope", "op-1", ""] {
        let err = h.engine.get_progress("foo", id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidName(_)), "{id}: {err}");
        let err = h.engine.abort_operation("foo", id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidName(_)), "{id}: {err}");
    }
}

// =============================================================================
// Validation
// =============================================================================

#[tokio::test]
async fn mismatched_parameters_are_rejected() {
    let h = Harness::new();
    let err = h
        .engine
        .start_pull("foo", "origin", "c2", mock_params(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(
        err.to_string(),
        "invalid argument: operation parameters type (mock) doesn't match type of remote 'origin' (nop)"
    );
}

#[tokio::test]
async fn push_of_missing_commit_fails() {
    let h = Harness::new();
    let err = h
        .engine
        .start_push("foo", "origin", "c9", RemoteParameters::nop(), false)
        .await
        .unwrap_err();
    assert!(err.is_no_such_object());
}

#[tokio::test]
async fn pull_of_existing_commit_fails() {
    let h = Harness::new();
    let err = h
        .engine
        .start_pull("foo", "origin", "c1", RemoteParameters::nop(), false)
        .await
        .unwrap_err();
    assert!(err.is_object_exists());
}

#[tokio::test]
async fn metadata_pull_needs_local_commit() {
    let h = Harness::new();
    let err = h
        .engine
        .start_pull("foo", "origin", "c9", RemoteParameters::nop(), true)
        .await
        .unwrap_err();
    assert!(err.is_no_such_object());
}

#[tokio::test]
async fn unknown_remote_and_repository_fail() {
    let h = Harness::new();
    let err = h
        .engine
        .start_pull("foo", "nowhere", "c2", RemoteParameters::nop(), false)
        .await
        .unwrap_err();
    assert!(err.is_no_such_object());

    let err = h
        .engine
        .start_pull("bar", "origin", "c2", RemoteParameters::nop(), false)
        .await
        .unwrap_err();
    assert!(err.is_no_such_object());

    let err = h
        .engine
        .start_pull("foo", "origin", "bad/id", RemoteParameters::nop(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidName(_)));
}

// =============================================================================
// Mock provider
// =============================================================================

#[tokio::test]
async fn push_transfers_volumes_then_metadata() {
    let h = Harness::new();
    let op = h
        .engine
        .start_push("foo", "mirror", "c1", mock_params(), false)
        .await
        .unwrap();
    let progress = h.finish(&op.id).await;

    assert_eq!(
        progress,
        vec![
            ProgressEntry::message("Pushing c1 to 'mirror'"),
            ProgressEntry::start("Pushing vol"),
            ProgressEntry::end(),
            ProgressEntry::complete(),
        ]
    );
    assert_eq!(
        h.mock.calls(),
        vec![
            // Validation looks the commit up before the operation starts.
            MockCall::GetCommit { remote: "mirror".into(), commit: "c1".into() },
            MockCall::StartOperation { operation: op.id.clone() },
            MockCall::PushVolume { volume: "vol".into() },
            MockCall::PushMetadata { commit: "c1".into(), is_update: false },
            MockCall::EndOperation { operation: op.id.clone() },
        ]
    );

    let local = h.storage().get_commit("foo", "c1").unwrap();
    assert_eq!(h.mock.commit("mirror", "c1"), Some(local));
}

#[tokio::test]
async fn push_of_commit_already_on_remote_fails() {
    let h = Harness::with_mock(MockProvider::new().with_commit("mirror", Commit::new("c1")));
    let err = h
        .engine
        .start_push("foo", "mirror", "c1", mock_params(), false)
        .await
        .unwrap_err();
    assert!(err.is_object_exists());
}

#[tokio::test]
async fn metadata_push_replaces_remote_properties() {
    let h = Harness::with_mock(MockProvider::new().with_commit("mirror", Commit::new("c1")));
    h.storage()
        .update_commit("foo", &Commit::with_properties("c1", props(json!({"note": "local"}))))
        .unwrap();

    let op = h
        .engine
        .start_push("foo", "mirror", "c1", mock_params(), true)
        .await
        .unwrap();
    let progress = h.finish(&op.id).await;
    assert_eq!(progress.last(), Some(&ProgressEntry::complete()));

    let calls = h.mock.calls();
    assert!(calls.contains(&MockCall::PushMetadata { commit: "c1".into(), is_update: true }));
    assert!(!calls.iter().any(|c| matches!(c, MockCall::PushVolume { .. })));
    let remote = h.mock.commit("mirror", "c1").unwrap();
    assert_eq!(remote.properties["note"], "local");
}

#[tokio::test]
async fn metadata_pull_refreshes_local_properties() {
    let remote = Commit::with_properties("c1", props(json!({"note": "remote"})));
    let h = Harness::with_mock(MockProvider::new().with_commit("mirror", remote));
    let before = h.backend.dataset_names();
    let timestamp = h
        .storage()
        .get_commit("foo", "c1")
        .unwrap()
        .timestamp()
        .map(str::to_string);

    let op = h
        .engine
        .start_pull("foo", "mirror", "c1", mock_params(), true)
        .await
        .unwrap();
    let progress = h.finish(&op.id).await;
    assert_eq!(progress.last(), Some(&ProgressEntry::complete()));

    let local = h.storage().get_commit("foo", "c1").unwrap();
    assert_eq!(local.properties["note"], "remote");
    assert_eq!(local.timestamp().map(str::to_string), timestamp);
    assert_eq!(h.backend.dataset_names(), before);
}

#[tokio::test]
async fn full_pull_transfers_each_volume() {
    let h = Harness::with_mock(MockProvider::new().with_commit("mirror", Commit::new("c2")));
    let op = h
        .engine
        .start_pull("foo", "mirror", "c2", mock_params(), false)
        .await
        .unwrap();
    let progress = h.finish(&op.id).await;

    assert_eq!(
        kinds(&progress),
        vec![
            ProgressType::Message,
            ProgressType::Start,
            ProgressType::End,
            ProgressType::Complete
        ]
    );
    assert!(h.mock.calls().contains(&MockCall::PullVolume { volume: "vol".into() }));
    h.storage().get_commit("foo", "c2").unwrap();
}

#[tokio::test]
async fn pull_of_commit_missing_on_remote_fails() {
    let h = Harness::new();
    let err = h
        .engine
        .start_pull("foo", "mirror", "c2", mock_params(), false)
        .await
        .unwrap_err();
    assert!(err.is_no_such_object());
}

#[tokio::test]
async fn failed_transfer_reports_failure() {
    let mock = MockProvider::new().fail_on(FailOn::PushVolume("connection reset".into()));
    let h = Harness::with_mock(mock);
    let before = h.backend.dataset_names();

    let op = h
        .engine
        .start_push("foo", "mirror", "c1", mock_params(), false)
        .await
        .unwrap();
    h.engine.join("foo", &op.id).await.unwrap();

    let failed = h.engine.get_operation("foo", &op.id).await.unwrap();
    assert_eq!(failed.state, OperationState::Failed);

    let progress = h.engine.get_progress("foo", &op.id).await.unwrap();
    assert_eq!(progress.last(), Some(&ProgressEntry::failed("connection reset")));

    let calls = h.mock.calls();
    assert!(calls.contains(&MockCall::FailOperation { operation: op.id.clone() }));
    assert!(!calls.iter().any(|c| matches!(c, MockCall::EndOperation { .. })));
    assert_eq!(h.mock.commit("mirror", "c1"), None);

    assert!(h.backend.mounts().is_empty());
    assert_eq!(h.backend.dataset_names(), before);
    assert!(h.store.list(None).unwrap().is_empty());
}

#[tokio::test]
async fn failed_commit_step_discards_workspace() {
    let h = Harness::new();
    let before = h.backend.dataset_names();
    h.backend
        .fail_on(StorageFailOn::new("snapshot", "out of space").on("@c2"));

    let op = h
        .engine
        .start_pull("foo", "origin", "c2", RemoteParameters::nop(), false)
        .await
        .unwrap();
    let progress = h.finish(&op.id).await;

    let last = progress.last().unwrap();
    assert_eq!(last.kind, ProgressType::Failed);
    assert!(last.message.as_deref().unwrap_or("").contains("out of space"));
    assert!(!h.storage().operation_exists("foo", &op.id).unwrap());
    assert!(h.storage().get_commit("foo", "c2").unwrap_err().is_no_such_object());
    assert_eq!(h.backend.dataset_names(), before);
    assert!(h.backend.mounts().is_empty());
}

#[tokio::test]
async fn volume_can_be_deleted_after_a_pull() {
    let h = Harness::new();
    let op = h
        .engine
        .start_pull("foo", "origin", "c2", RemoteParameters::nop(), false)
        .await
        .unwrap();
    assert_eq!(h.finish(&op.id).await.last(), Some(&ProgressEntry::complete()));

    h.storage().delete_volume("foo", "vol").unwrap();
    assert!(h.storage().list_volumes("foo").unwrap().is_empty());
    assert!(h.storage().get_commit("foo", "c2").is_ok());
}

fn props(value: serde_json::Value) -> Properties {
    match value {
        serde_json::Value::Object(map) => map,
        _ => panic!("properties must be an object"),
    }
}
