//! Reserved memory namespaces.

use crate::traits::SessionId;

/// Namespace used when the caller does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Namespace holding persisted session records, keyed by session id.
pub const SESSIONS_NAMESPACE: &str = "sessions";

/// Namespace for engine bookkeeping (state snapshots, error records).
pub const SYSTEM_NAMESPACE: &str = "system";

/// Dedicated memory namespace of a session.
#[must_use]
pub fn session_namespace(session_id: SessionId) -> String {
    format!("session:{session_id}")
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_session_namespace() {
        let id = Uuid::nil();
        assert_eq!(
            session_namespace(id),
            "session:00000000-0000-0000-0000-000000000000"
        );
    }
}
