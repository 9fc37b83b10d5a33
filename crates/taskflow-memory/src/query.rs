//! Search queries over the memory working set.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entry::MemoryEntry;

/// Default maximum number of search results.
pub const DEFAULT_SEARCH_LIMIT: usize = 50;

/// What to look for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SearchQuery {
    /// Case-insensitive substring over key, namespace and serialized value.
    Text(String),
    /// Structural subset match against the stored value.
    Structured(Value),
}

impl From<&str> for SearchQuery {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for SearchQuery {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Value> for SearchQuery {
    fn from(v: Value) -> Self {
        match v {
            Value::String(s) => Self::Text(s),
            other => Self::Structured(other),
        }
    }
}

/// Field used to order search results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    /// Last write time.
    #[default]
    Timestamp,
    Key,
    Namespace,
    Size,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Search options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    /// Restrict results to one namespace.
    pub namespace: Option<String>,
    /// Maximum results; 0 means unlimited.
    pub limit: usize,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
    /// Include stored values in the hits.
    pub include_value: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            namespace: None,
            limit: DEFAULT_SEARCH_LIMIT,
            sort_by: SortBy::default(),
            sort_order: SortOrder::default(),
            include_value: false,
        }
    }
}

impl SearchOptions {
    /// Restrict to a namespace.
    #[must_use]
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set the result limit.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Set sort field and direction.
    #[must_use]
    pub const fn sorted(mut self, sort_by: SortBy, sort_order: SortOrder) -> Self {
        self.sort_by = sort_by;
        self.sort_order = sort_order;
        self
    }

    /// Include values in hits.
    #[must_use]
    pub const fn with_values(mut self) -> Self {
        self.include_value = true;
        self
    }
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub namespace: String,
    pub key: String,
    pub timestamp: DateTime<Utc>,
    pub size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl SearchHit {
    pub(crate) fn from_entry(entry: &MemoryEntry, include_value: bool) -> Self {
        Self {
            namespace: entry.namespace.clone(),
            key: entry.key.clone(),
            timestamp: entry.updated_at,
            size: entry.size,
            value: include_value.then(|| entry.value.clone()),
        }
    }
}

impl SearchQuery {
    /// Whether an entry satisfies the query.
    #[must_use]
    pub fn matches(&self, entry: &MemoryEntry) -> bool {
        match self {
            Self::Text(text) => {
                let needle = text.to_lowercase();
                entry.key.to_lowercase().contains(&needle)
                    || entry.namespace.to_lowercase().contains(&needle)
                    || serde_json::to_string(&entry.value)
                        .is_ok_and(|s| s.to_lowercase().contains(&needle))
            }
            Self::Structured(pattern) => is_subset(pattern, &entry.value),
        }
    }
}

/// Partial deep match: every part of `pattern` is present in `value`.
///
/// Objects match when each pattern field matches the same field of the value.
/// Arrays match when each pattern element matches some element of the value.
/// Everything else compares by equality.
#[must_use]
pub fn is_subset(pattern: &Value, value: &Value) -> bool {
    match (pattern, value) {
        (Value::Object(want), Value::Object(have)) => want
            .iter()
            .all(|(k, v)| have.get(k).is_some_and(|h| is_subset(v, h))),
        (Value::Array(want), Value::Array(have)) => want
            .iter()
            .all(|w| have.iter().any(|h| is_subset(w, h))),
        _ => pattern == value,
    }
}

pub(crate) fn sort_hits(hits: &mut [SearchHit], sort_by: SortBy, order: SortOrder) {
    hits.sort_by(|a, b| {
        let ord = match sort_by {
            SortBy::Timestamp => a.timestamp.cmp(&b.timestamp),
            SortBy::Key => a.key.cmp(&b.key),
            SortBy::Namespace => a.namespace.cmp(&b.namespace),
            SortBy::Size => a.size.cmp(&b.size),
        };
        let ord = match order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        };
        // Stable tie-break so equal timestamps still order deterministically.
        if ord == Ordering::Equal {
            (&a.namespace, &a.key).cmp(&(&b.namespace, &b.key))
        } else {
            ord
        }
    });
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_subset_objects_and_arrays() {
        let value = json!({
            "city": "Milano",
            "tags": ["seo", "it", {"kind": "page"}],
            "nested": {"a": 1, "b": 2}
        });

        assert!(is_subset(&json!({"city": "Milano"}), &value));
        assert!(is_subset(&json!({"nested": {"a": 1}}), &value));
        assert!(is_subset(&json!({"tags": ["it"]}), &value));
        assert!(is_subset(&json!({"tags": [{"kind": "page"}]}), &value));
        assert!(is_subset(&json!({}), &value));

        assert!(!is_subset(&json!({"city": "Roma"}), &value));
        assert!(!is_subset(&json!({"nested": {"c": 3}}), &value));
        assert!(!is_subset(&json!({"tags": ["missing"]}), &value));
        assert!(!is_subset(&json!({"city": {"x": 1}}), &value));
    }

    #[test]
    fn test_text_match_is_case_insensitive() {
        let entry = MemoryEntry::new("Pages", "home", json!({"title": "Assistenza IT"}), None);
        assert!(SearchQuery::from("ASSISTENZA").matches(&entry));
        assert!(SearchQuery::from("pages").matches(&entry));
        assert!(SearchQuery::from("HOME").matches(&entry));
        assert!(!SearchQuery::from("cloud").matches(&entry));
    }

    #[test]
    fn test_query_from_value() {
        assert_eq!(SearchQuery::from(json!("abc")), SearchQuery::Text("abc".into()));
        assert_eq!(
            SearchQuery::from(json!({"a": 1})),
            SearchQuery::Structured(json!({"a": 1}))
        );
    }

    #[test]
    fn test_sort_hits() {
        let mk = |key: &str, size| SearchHit {
            namespace: "ns".into(),
            key: key.into(),
            timestamp: Utc::now(),
            size,
            value: None,
        };
        let mut hits = vec![mk("b", 3), mk("a", 1), mk("c", 2)];

        sort_hits(&mut hits, SortBy::Size, SortOrder::Asc);
        assert_eq!(hits.iter().map(|h| h.size).collect::<Vec<_>>(), vec![1, 2, 3]);

        sort_hits(&mut hits, SortBy::Key, SortOrder::Desc);
        assert_eq!(hits.iter().map(|h| h.key.as_str()).collect::<Vec<_>>(), vec!["c", "b", "a"]);
    }
}
