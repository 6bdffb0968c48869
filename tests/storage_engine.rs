//! Integration tests for the storage engine and reaper.
//!
//! Everything runs against the in-memory backend, which follows the same
//! copy-on-write rules as the real filesystem: snapshots pin clones,
//! deferred destroys wait for the last clone, and mounted datasets are
//! busy.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use stratum::core::error::Error;
use stratum::core::paths::DatasetPaths;
use stratum::core::tags::TagFilter;
use stratum::core::types::{Commit, Properties, Remote, Repository};
use stratum::storage::backend::SpaceUsage;
use stratum::storage::memory::{FailOn, MemoryBackend};
use stratum::storage::{Reaper, StorageEngine};

// =============================================================================
// Test Helpers
// =============================================================================

struct Fixture {
    backend: MemoryBackend,
    engine: StorageEngine,
}

impl Fixture {
    fn new() -> Self {
        let backend = MemoryBackend::new("tank");
        let engine = StorageEngine::new(
            Arc::new(backend.clone()),
            DatasetPaths::new("tank", "/var/lib/stratum/mnt"),
        );
        engine.initialize().expect("initialize");
        Self { backend, engine }
    }

    /// A repository `foo` with the given volumes.
    fn with_repo(volumes: &[&str]) -> Self {
        let fixture = Self::new();
        fixture
            .engine
            .create_repository(&Repository::new("foo"))
            .expect("create repository");
        for volume in volumes {
            fixture
                .engine
                .create_volume("foo", volume, &Properties::new())
                .expect("create volume");
        }
        fixture
    }

    fn volume_dataset(&self, guid: &str, volume: &str) -> String {
        self.engine.paths().volume("foo", guid, volume)
    }

    fn active(&self) -> String {
        self.engine.active_volume_set("foo").expect("active volume set")
    }
}

fn props(value: Value) -> Properties {
    match value {
        Value::Object(map) => map,
        _ => panic!("properties must be an object"),
    }
}

// =============================================================================
// Repositories
// =============================================================================

#[test]
fn repository_lifecycle() {
    let f = Fixture::new();
    let created = f
        .engine
        .create_repository(&Repository::with_properties("foo", props(json!({"owner": "ops"}))))
        .unwrap();
    assert_eq!(created.properties["owner"], "ops");

    let err = f.engine.create_repository(&Repository::new("foo")).unwrap_err();
    assert!(err.is_object_exists());

    let names: Vec<String> = f
        .engine
        .list_repositories()
        .unwrap()
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, vec!["foo"]);

    f.engine
        .update_repository("foo", &Repository::new("bar"))
        .unwrap();
    assert!(f.engine.get_repository("foo").unwrap_err().is_no_such_object());
    assert_eq!(f.engine.get_repository("bar").unwrap().name, "bar");

    f.engine.delete_repository("bar").unwrap();
    assert!(f.engine.list_repositories().unwrap().is_empty());
    assert!(f.engine.delete_repository("bar").unwrap_err().is_no_such_object());
}

#[test]
fn invalid_names_touch_nothing() {
    let f = Fixture::new();
    let before = f.backend.dataset_names();
    let err = f.engine.create_repository(&Repository::new("bad/name")).unwrap_err();
    assert!(matches!(err, Error::InvalidName(_)));
    assert_eq!(f.backend.dataset_names(), before);
}

#[test]
fn unrecognized_command_failures_propagate_unchanged() {
    let f = Fixture::with_repo(&[]);
    f.backend
        .fail_on(FailOn::new("snapshot", "pool is suspended"));
    let err = f.engine.create_commit("foo", &Commit::new("c1")).unwrap_err();
    match err {
        Error::Command(e) => assert!(e.output.contains("pool is suspended")),
        other => panic!("expected command error, got {other:?}"),
    }
}

// =============================================================================
// Commits
// =============================================================================

#[test]
fn commit_gets_authoritative_timestamp() {
    let f = Fixture::with_repo(&["vol"]);
    let commit = f
        .engine
        .create_commit("foo", &Commit::with_properties("hash", props(json!({"a": "b"}))))
        .unwrap();

    assert_eq!(commit.properties.len(), 2);
    assert_eq!(commit.properties["a"], "b");
    let timestamp = commit.timestamp().expect("timestamp property");
    assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());

    assert_eq!(f.engine.get_commit("foo", "hash").unwrap(), commit);

    f.engine.delete_commit("foo", "hash").unwrap();
    assert!(f.engine.get_commit("foo", "hash").unwrap_err().is_no_such_object());
}

#[test]
fn caller_timestamp_is_overwritten() {
    let f = Fixture::with_repo(&[]);
    let commit = f
        .engine
        .create_commit(
            "foo",
            &Commit::with_properties("c1", props(json!({"timestamp": "1999-01-01T00:00:00Z"}))),
        )
        .unwrap();
    assert_ne!(commit.timestamp(), Some("1999-01-01T00:00:00Z"));
}

#[test]
fn commit_ids_are_unique_across_volume_sets() {
    let f = Fixture::with_repo(&["vol"]);
    f.engine.create_commit("foo", &Commit::new("c1")).unwrap();
    f.engine.checkout_commit("foo", "c1").unwrap();

    // The active volume set changed, but the id is still taken.
    let err = f.engine.create_commit("foo", &Commit::new("c1")).unwrap_err();
    assert!(err.is_object_exists());
}

#[test]
fn initial_commit_is_reserved() {
    let f = Fixture::with_repo(&["vol"]);
    assert!(matches!(
        f.engine.create_commit("foo", &Commit::new("initial")).unwrap_err(),
        Error::InvalidName(_)
    ));
    assert!(f.engine.list_commits("foo", &TagFilter::default()).unwrap().is_empty());
}

#[test]
fn list_commits_newest_first_with_tags() {
    let f = Fixture::with_repo(&["vol"]);
    f.engine
        .create_commit(
            "foo",
            &Commit::with_properties("c1", props(json!({"tags": {"env": "prod"}}))),
        )
        .unwrap();
    f.engine
        .create_commit(
            "foo",
            &Commit::with_properties("c2", props(json!({"tags": {"env": "dev"}}))),
        )
        .unwrap();
    f.engine.checkout_commit("foo", "c1").unwrap();
    f.engine.create_commit("foo", &Commit::new("c3")).unwrap();

    let ids: Vec<String> = f
        .engine
        .list_commits("foo", &TagFilter::default())
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(ids, vec!["c3", "c2", "c1"]);

    let prod = f.engine.list_commits("foo", &TagFilter::parse(["env=prod"])).unwrap();
    assert_eq!(prod.len(), 1);
    assert_eq!(prod[0].id, "c1");

    let tagged = f.engine.list_commits("foo", &TagFilter::parse(["env"])).unwrap();
    assert_eq!(tagged.len(), 2);
}

#[test]
fn update_commit_keeps_timestamp() {
    let f = Fixture::with_repo(&[]);
    let original = f.engine.create_commit("foo", &Commit::new("c1")).unwrap();
    let updated = f
        .engine
        .update_commit("foo", &Commit::with_properties("c1", props(json!({"note": "x"}))))
        .unwrap();
    assert_eq!(updated.timestamp(), original.timestamp());
    assert_eq!(f.engine.get_commit("foo", "c1").unwrap().properties["note"], "x");
}

#[test]
fn commit_status_sums_volume_snapshots() {
    let f = Fixture::with_repo(&["v1", "v2", "v3"]);
    f.engine.create_commit("foo", &Commit::new("c1")).unwrap();
    let guid = f.active();

    for (volume, size) in [("v1", 1u64), ("v2", 2), ("v3", 3)] {
        let snapshot = f.engine.paths().snapshot(&f.volume_dataset(&guid, volume), "c1");
        f.backend
            .set_space(
                &snapshot,
                SpaceUsage {
                    logical: size,
                    referenced: size * 10,
                    used: size * 100,
                },
            )
            .unwrap();
    }
    // The volume-set level snapshot is not part of the sum.
    let top = f.engine.paths().snapshot(&f.engine.paths().volume_set("foo", &guid), "c1");
    f.backend
        .set_space(&top, SpaceUsage { logical: 1000, referenced: 1000, used: 1000 })
        .unwrap();

    let status = f.engine.get_commit_status("foo", "c1").unwrap();
    assert_eq!(status.logical_size, 6);
    assert_eq!(status.actual_size, 60);
    assert_eq!(status.unique_size, 600);
}

#[test]
fn commit_status_without_volumes_is_zero() {
    let f = Fixture::with_repo(&[]);
    f.engine.create_commit("foo", &Commit::new("c1")).unwrap();
    let status = f.engine.get_commit_status("foo", "c1").unwrap();
    assert_eq!((status.logical_size, status.actual_size, status.unique_size), (0, 0, 0));
}

// =============================================================================
// Checkout
// =============================================================================

#[test]
fn checkout_is_non_destructive() {
    let f = Fixture::with_repo(&["vol"]);
    f.engine.create_commit("foo", &Commit::new("c1")).unwrap();
    let original = f.active();

    let first = f.engine.checkout_commit("foo", "c1").unwrap();
    let second = f.engine.checkout_commit("foo", "c1").unwrap();
    assert_ne!(first, second);
    assert_ne!(first, original);
    assert_eq!(f.active(), second);

    for guid in [&original, &first, &second] {
        assert!(f.backend.exists(&f.volume_dataset(guid, "vol")));
    }

    // Deleting the volume in the active set leaves the other clone alone.
    f.engine.delete_volume("foo", "vol").unwrap();
    assert!(!f.backend.exists(&f.volume_dataset(&second, "vol")));
    assert!(f.backend.exists(&f.volume_dataset(&first, "vol")));
    assert!(f.backend.exists(&f.volume_dataset(&original, "vol")));
}

#[test]
fn status_reports_source_and_last_commit() {
    let f = Fixture::with_repo(&["vol"]);
    f.engine.create_commit("foo", &Commit::new("c1")).unwrap();
    f.engine.create_commit("foo", &Commit::new("c2")).unwrap();

    let status = f.engine.get_repository_status("foo").unwrap();
    assert_eq!(status.last_commit.as_deref(), Some("c2"));
    assert_eq!(status.source_commit, None);
    assert_eq!(status.volumes.len(), 1);
    assert!(!status.volumes[0].ready);

    f.engine.checkout_commit("foo", "c1").unwrap();
    let status = f.engine.get_repository_status("foo").unwrap();
    assert_eq!(status.source_commit.as_deref(), Some("c1"));
    assert_eq!(status.last_commit, None);
}

#[test]
fn checkout_of_missing_commit_fails() {
    let f = Fixture::with_repo(&["vol"]);
    assert!(f.engine.checkout_commit("foo", "nope").unwrap_err().is_no_such_object());
}

// =============================================================================
// Volumes and remotes
// =============================================================================

#[test]
fn volumes_mount_at_stable_paths() {
    let f = Fixture::with_repo(&["data"]);
    let volume = f.engine.mount_volume("foo", "data").unwrap();
    assert_eq!(volume.mountpoint(), Some("/var/lib/stratum/mnt/foo/data"));
    assert!(f.engine.get_volume_status("foo", "data").unwrap().ready);

    f.engine.unmount_volume("foo", "data").unwrap();
    f.engine.unmount_volume("foo", "data").unwrap();
    assert!(!f.engine.get_volume_status("foo", "data").unwrap().ready);
}

#[test]
fn reserved_volumes_are_hidden() {
    let f = Fixture::with_repo(&["data"]);
    assert!(matches!(
        f.engine.create_volume("foo", "_scratch", &Properties::new()).unwrap_err(),
        Error::InvalidName(_)
    ));
    let names: Vec<String> = f
        .engine
        .list_volumes("foo")
        .unwrap()
        .into_iter()
        .map(|v| v.name)
        .collect();
    assert_eq!(names, vec!["data"]);
}

#[test]
fn remote_crud() {
    let f = Fixture::with_repo(&[]);
    f.engine.add_remote("foo", &Remote::nop("origin")).unwrap();
    assert!(f.engine.add_remote("foo", &Remote::nop("origin")).unwrap_err().is_object_exists());

    f.engine
        .update_remote("foo", "origin", &Remote::nop("upstream"))
        .unwrap();
    assert!(f.engine.get_remote("foo", "origin").unwrap_err().is_no_such_object());
    assert_eq!(f.engine.get_remote("foo", "upstream").unwrap().provider, "nop");

    f.engine.remove_remote("foo", "upstream").unwrap();
    assert!(f.engine.list_remotes("foo").unwrap().is_empty());
}

// =============================================================================
// Deletion and the reaper
// =============================================================================

#[test]
fn deleting_last_commit_of_inactive_set_destroys_it() {
    let f = Fixture::with_repo(&["vol"]);
    f.engine.create_commit("foo", &Commit::new("c1")).unwrap();
    f.engine.checkout_commit("foo", "c1").unwrap();
    let middle = f.active();
    f.engine.create_commit("foo", &Commit::new("c2")).unwrap();
    f.engine.checkout_commit("foo", "c1").unwrap();

    // Nothing was cloned from c2, so the set can go right away.
    f.engine.delete_commit("foo", "c2").unwrap();
    assert!(!f.backend.exists(&f.engine.paths().volume_set("foo", &middle)));
}

#[test]
fn volume_with_clones_is_left_to_the_reaper() {
    const OP: &str = "7c1e2d3f-4a5b-4c6d-8e9f-0a1b2c3d4e5f";
    let f = Fixture::with_repo(&["vol"]);
    f.engine.create_commit("foo", &Commit::new("c1")).unwrap();
    f.engine.create_operation("foo", OP, Some("c1")).unwrap();
    let dataset = f.volume_dataset(&f.active(), "vol");

    f.engine.delete_volume("foo", "vol").unwrap();
    assert!(f.backend.exists(&dataset));
    assert!(f.engine.list_volumes("foo").unwrap().is_empty());
    assert!(f.engine.get_volume("foo", "vol").unwrap_err().is_no_such_object());
    assert!(f.engine.delete_volume("foo", "vol").unwrap_err().is_no_such_object());

    let reaper = Reaper::new(f.engine.clone(), Duration::from_secs(3600));
    assert_eq!(reaper.reap(), 0);
    assert!(f.backend.exists(&dataset));

    f.engine.discard_operation("foo", OP).unwrap();
    assert_eq!(reaper.reap(), 1);
    assert!(!f.backend.exists(&dataset));
}

#[tokio::test]
async fn reaper_destroys_sets_once_clones_are_gone() {
    let f = Fixture::with_repo(&["vol"]);
    f.engine.create_commit("foo", &Commit::new("c1")).unwrap();
    f.engine.checkout_commit("foo", "c1").unwrap();
    let middle = f.active();
    let middle_dataset = f.engine.paths().volume_set("foo", &middle);
    f.engine.create_commit("foo", &Commit::new("c2")).unwrap();
    f.engine.checkout_commit("foo", "c2").unwrap();

    // c2 still backs the active clone: the snapshot is deferred and the set
    // is left for the reaper.
    f.engine.delete_commit("foo", "c2").unwrap();
    assert!(f.engine.get_commit("foo", "c2").unwrap_err().is_no_such_object());
    assert!(f.backend.exists(&middle_dataset));

    let reaper = Reaper::new(f.engine.clone(), Duration::from_secs(3600));
    assert_eq!(reaper.reap(), 0);
    assert!(f.backend.exists(&middle_dataset));

    // Dropping the clone releases the deferred snapshot.
    f.engine.delete_volume("foo", "vol").unwrap();

    let handle = reaper.spawn();
    for _ in 0..100 {
        if !f.backend.exists(&middle_dataset) {
            break;
        }
        reaper.signal();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    reaper.stop();
    handle.await.unwrap();
    assert!(!f.backend.exists(&middle_dataset));
}
