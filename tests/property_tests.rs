//! Property-based tests for naming, tag filtering and space accounting.
//!
//! These tests use proptest to verify invariants hold across
//! randomly generated inputs.

use std::sync::Arc;

use proptest::prelude::*;
use serde_json::{Map, Value};

use stratum::core::naming::{self, MAX_NAME_LEN};
use stratum::core::paths::DatasetPaths;
use stratum::core::tags::{TagFilter, TAGS_PROPERTY};
use stratum::core::types::{Commit, Properties, Repository};
use stratum::ops::ProgressEntry;
use stratum::storage::backend::SpaceUsage;
use stratum::storage::memory::MemoryBackend;
use stratum::storage::StorageEngine;

/// Strategy for characters allowed in names.
fn name_char() -> impl Strategy<Value = char> {
    prop_oneof![
        prop::char::range('a', 'z'),
        prop::char::range('A', 'Z'),
        prop::char::range('0', '9'),
        Just('-'),
        Just(':'),
        Just('.'),
        Just('_'),
    ]
}

/// Strategy for valid repository names.
fn valid_name() -> impl Strategy<Value = String> {
    prop::collection::vec(name_char(), 1..=MAX_NAME_LEN)
        .prop_map(|chars| chars.into_iter().collect())
}

/// Strategy for characters that are never allowed.
fn forbidden_char() -> impl Strategy<Value = char> {
    prop_oneof![
        Just('/'),
        Just('@'),
        Just(' '),
        Just('#'),
        Just('%'),
        Just('*'),
        Just('é'),
    ]
}

fn tagged(id: &str, tags: &[(String, String)]) -> Commit {
    let map: Map<String, Value> = tags
        .iter()
        .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
        .collect();
    let mut properties = Properties::new();
    properties.insert(TAGS_PROPERTY.to_string(), Value::Object(map));
    Commit::with_properties(id, properties)
}

proptest! {
    #[test]
    fn valid_names_are_accepted(name in valid_name()) {
        prop_assert!(naming::validate_repository(&name).is_ok());
        prop_assert!(naming::validate_remote(&name).is_ok());
    }

    #[test]
    fn forbidden_characters_are_rejected(
        prefix in valid_name(),
        bad in forbidden_char(),
        suffix in "[a-z]{0,5}",
    ) {
        let name = format!("{}{bad}{suffix}", &prefix[..prefix.len().min(40)]);
        prop_assert!(naming::validate_repository(&name).is_err());
        prop_assert!(naming::validate_volume(&name).is_err());
        prop_assert!(naming::validate_commit(&name).is_err());
    }

    #[test]
    fn overlong_names_are_rejected(extra in 1usize..32) {
        let name = "a".repeat(MAX_NAME_LEN + extra);
        prop_assert!(naming::validate_repository(&name).is_err());
    }

    #[test]
    fn reserved_volume_prefix_is_rejected(name in valid_name()) {
        let reserved = format!("_{}", &name[..name.len().min(MAX_NAME_LEN - 1)]);
        prop_assert!(naming::validate_volume(&reserved).is_err());
        prop_assert!(naming::validate_repository(&reserved).is_ok());
    }

    #[test]
    fn empty_filter_keeps_everything(
        tags in prop::collection::vec(("[a-z]{1,4}", "[a-z]{1,4}"), 0..5),
    ) {
        let commits = vec![tagged("c1", &tags), Commit::new("c2")];
        prop_assert_eq!(TagFilter::default().filter(commits.clone()), commits);
    }

    #[test]
    fn key_value_filter_matches_exact_values(
        tags in prop::collection::btree_map("[a-z]{1,4}", "[a-z]{1,4}", 1..5),
        candidate in "[a-z]{1,4}",
    ) {
        let pairs: Vec<(String, String)> = tags.clone().into_iter().collect();
        let commit = tagged("c1", &pairs);
        let (key, value) = &pairs[0];

        prop_assert!(TagFilter::parse([key.as_str()]).matches(&commit));
        let exact = format!("{key}={value}");
        prop_assert!(TagFilter::parse([exact.as_str()]).matches(&commit));

        let expected = tags.get(key).map(|v| *v == candidate).unwrap_or(false);
        let guess = format!("{key}={candidate}");
        prop_assert_eq!(TagFilter::parse([guess.as_str()]).matches(&commit), expected);
        prop_assert!(!TagFilter::parse([key.as_str()]).matches(&Commit::new("c2")));
    }

    #[test]
    fn progress_percent_never_exceeds_100(percent in any::<u8>()) {
        let entry = ProgressEntry::progress(percent, None);
        prop_assert!(entry.percent.unwrap_or(0) <= 100);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn commit_status_is_sum_of_volumes(
        sizes in prop::collection::vec((0u64..1 << 30, 0u64..1 << 30, 0u64..1 << 30), 0..5),
    ) {
        let backend = MemoryBackend::new("tank");
        let engine = StorageEngine::new(
            Arc::new(backend.clone()),
            DatasetPaths::new("tank", "/mnt"),
        );
        engine.create_repository(&Repository::new("foo")).unwrap();
        for i in 0..sizes.len() {
            engine.create_volume("foo", &format!("v{i}"), &Properties::new()).unwrap();
        }
        engine.create_commit("foo", &Commit::new("c1")).unwrap();
        let guid = engine.active_volume_set("foo").unwrap();

        for (i, (logical, referenced, used)) in sizes.iter().enumerate() {
            let volume = engine.paths().volume("foo", &guid, &format!("v{i}"));
            backend
                .set_space(
                    &engine.paths().snapshot(&volume, "c1"),
                    SpaceUsage { logical: *logical, referenced: *referenced, used: *used },
                )
                .unwrap();
        }

        let status = engine.get_commit_status("foo", "c1").unwrap();
        prop_assert_eq!(status.logical_size, sizes.iter().map(|s| s.0).sum::<u64>());
        prop_assert_eq!(status.actual_size, sizes.iter().map(|s| s.1).sum::<u64>());
        prop_assert_eq!(status.unique_size, sizes.iter().map(|s| s.2).sum::<u64>());
    }
}
