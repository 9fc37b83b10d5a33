//! Stored memory entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One value stored under `(namespace, key)`.
///
/// This is also the durable record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: Uuid,
    pub namespace: String,
    pub key: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Serialized size of `value` in bytes.
    pub size: usize,
    /// Bumped every time the key is overwritten.
    pub version: u64,
    #[serde(default)]
    pub access_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    /// Build a fresh entry, or the next version of `previous`.
    #[must_use]
    pub fn new(namespace: &str, key: &str, value: Value, previous: Option<&Self>) -> Self {
        let now = Utc::now();
        let size = value_size(&value);
        Self {
            id: Uuid::new_v4(),
            namespace: namespace.to_string(),
            key: key.to_string(),
            value,
            created_at: previous.map_or(now, |p| p.created_at),
            updated_at: now,
            size,
            version: previous.map_or(1, |p| p.version + 1),
            access_count: 0,
            last_accessed: None,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.access_count += 1;
        self.last_accessed = Some(Utc::now());
    }
}

/// Serialized length of a JSON value.
#[must_use]
pub fn value_size(value: &Value) -> usize {
    serde_json::to_string(value).map_or(0, |s| s.len())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_new_version_keeps_creation_time() {
        let first = MemoryEntry::new("ns", "k", json!({"a": 1}), None);
        assert_eq!(first.version, 1);
        assert_eq!(first.size, r#"{"a":1}"#.len());

        let second = MemoryEntry::new("ns", "k", json!(2), Some(&first));
        assert_eq!(second.version, 2);
        assert_eq!(second.created_at, first.created_at);
        assert_ne!(second.id, first.id);
    }
}
