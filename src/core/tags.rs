//! core::tags
//!
//! Tag filtering for commit listings.
//!
//! Tags live in the `tags` map of a commit's properties. A filter term is
//! either `key` (the tag must be present) or `key=value` (present with that
//! exact value). All terms must match. An empty filter matches everything.
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use stratum::core::tags::TagFilter;
//! use stratum::core::types::Commit;
//!
//! let mut commit = Commit::new("c1");
//! commit.properties.insert("tags".into(), json!({"env": "prod", "pinned": ""}));
//!
//! assert!(TagFilter::parse(["env=prod", "pinned"]).matches(&commit));
//! assert!(!TagFilter::parse(["env=dev"]).matches(&commit));
//! ```

use serde_json::Value;

use crate::core::types::Commit;

/// Commit property holding the tag map.
pub const TAGS_PROPERTY: &str = "tags";

/// A parsed tag filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagFilter {
    terms: Vec<(String, Option<String>)>,
}

impl TagFilter {
    /// Parse filter terms of the form `key` or `key=value`.
    pub fn parse<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let terms = terms
            .into_iter()
            .map(|t| match t.as_ref().split_once('=') {
                Some((k, v)) => (k.to_string(), Some(v.to_string())),
                None => (t.as_ref().to_string(), None),
            })
            .collect();
        Self { terms }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Check a single commit.
    pub fn matches(&self, commit: &Commit) -> bool {
        if self.terms.is_empty() {
            return true;
        }

        let Some(Value::Object(tags)) = commit.properties.get(TAGS_PROPERTY) else {
            return false;
        };

        self.terms.iter().all(|(key, expected)| match tags.get(key) {
            None => false,
            Some(actual) => match expected {
                None => true,
                Some(expected) => actual.as_str() == Some(expected.as_str()),
            },
        })
    }

    /// Keep only matching commits.
    pub fn filter(&self, commits: Vec<Commit>) -> Vec<Commit> {
        commits.into_iter().filter(|c| self.matches(c)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tagged(id: &str, tags: Value) -> Commit {
        let mut commit = Commit::new(id);
        commit.properties.insert(TAGS_PROPERTY.into(), tags);
        commit
    }

    #[test]
    fn empty_filter_matches_untagged() {
        assert!(TagFilter::default().matches(&Commit::new("a")));
    }

    #[test]
    fn untagged_commit_fails_non_empty_filter() {
        assert!(!TagFilter::parse(["a"]).matches(&Commit::new("a")));
    }

    #[test]
    fn non_map_tags_never_match() {
        let commit = tagged("a", json!(["a", "b"]));
        assert!(!TagFilter::parse(["a"]).matches(&commit));
    }

    #[test]
    fn all_terms_must_match() {
        let commit = tagged("a", json!({"a": "1", "b": "2"}));
        assert!(TagFilter::parse(["a", "b=2"]).matches(&commit));
        assert!(!TagFilter::parse(["a", "c"]).matches(&commit));
        assert!(!TagFilter::parse(["a=2"]).matches(&commit));
    }

    #[test]
    fn value_may_contain_equals() {
        let commit = tagged("a", json!({"expr": "x=y"}));
        assert!(TagFilter::parse(["expr=x=y"]).matches(&commit));
    }

    #[test]
    fn filter_preserves_order() {
        let commits = vec![
            tagged("one", json!({"keep": ""})),
            Commit::new("two"),
            tagged("three", json!({"keep": "yes"})),
        ];
        let ids: Vec<_> = TagFilter::parse(["keep"])
            .filter(commits)
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["one", "three"]);
    }
}
