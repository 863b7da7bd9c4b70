//! Process-wide session storage.
//!
//! Maps session identifiers to their [`Session`] records. The registry is
//! the only shared mutable structure in the core; `DashMap` keeps create,
//! lookup, delete, and the cleanup sweep linearizable without a global
//! lock. Sessions never hold references back to the registry.

use std::sync::Arc;

use dashmap::DashMap;

use crate::config::SessionConfig;
use crate::session::Session;

/// Indexed storage for active sessions.
pub struct SessionRegistry {
    /// session_id -> Session
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    /// Creates a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Creates and registers a session.
    ///
    /// Creating a session under an id that is still registered is the
    /// caller's bug; the orchestrator tears down any prior entry first.
    pub fn create_session(
        &self,
        session_id: &str,
        connection_id: &str,
        config: SessionConfig,
    ) -> Arc<Session> {
        let session = Arc::new(Session::new(
            session_id.to_string(),
            connection_id.to_string(),
            config,
        ));
        self.sessions.insert(session_id.to_string(), session.clone());
        log::info!(
            "[Registry] session registered: {} (total: {})",
            session_id,
            self.sessions.len()
        );
        session
    }

    /// Looks up a session by id.
    #[must_use]
    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|r| r.value().clone())
    }

    /// Whether a session with this id is registered.
    #[must_use]
    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Cleans up and removes a session.
    ///
    /// Returns the removed session if it existed.
    pub async fn delete_session(&self, session_id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(session_id).map(|(_, session)| session);
        if let Some(session) = &removed {
            session.cleanup().await;
            log::info!(
                "[Registry] session removed: {} (remaining: {})",
                session_id,
                self.sessions.len()
            );
        }
        removed
    }

    /// Removes a session without running its cleanup.
    ///
    /// Used by the forced-teardown path after a cleanup budget expired.
    pub(crate) fn remove_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(session_id).map(|(_, session)| session)
    }

    /// Snapshot of all registered sessions.
    #[must_use]
    pub fn get_all_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|r| r.value().clone()).collect()
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Cleans up and removes every session.
    pub async fn cleanup(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|r| r.key().clone()).collect();
        for id in ids {
            self.delete_session(&id).await;
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServiceConfig, SessionConfig, SttConfig};

    fn make_config() -> SessionConfig {
        let caller = SttConfig {
            session_id: "sess-1".to_string(),
            connection_id: "conn-1".to_string(),
            sample_rate: 16_000,
            language: None,
        };
        SessionConfig::resolve(&caller, &ServiceConfig::default())
    }

    #[test]
    fn create_and_get() {
        let registry = SessionRegistry::new();
        registry.create_session("s1", "c1", make_config());

        assert!(registry.has_session("s1"));
        let session = registry.get_session("s1").unwrap();
        assert_eq!(session.session_id, "s1");
        assert_eq!(session.connection_id, "c1");
        assert_eq!(registry.session_count(), 1);
    }

    #[test]
    fn get_unknown_returns_none() {
        let registry = SessionRegistry::new();
        assert!(registry.get_session("nope").is_none());
        assert!(!registry.has_session("nope"));
    }

    #[tokio::test]
    async fn delete_cleans_up_and_removes() {
        let registry = SessionRegistry::new();
        registry.create_session("s1", "c1", make_config());

        let removed = registry.delete_session("s1").await.unwrap();
        assert!(!removed.is_active());
        assert!(removed.is_released());
        assert!(!registry.has_session("s1"));
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn delete_unknown_is_none() {
        let registry = SessionRegistry::new();
        assert!(registry.delete_session("nope").await.is_none());
    }

    #[test]
    fn snapshot_is_a_copy() {
        let registry = SessionRegistry::new();
        registry.create_session("s1", "c1", make_config());
        registry.create_session("s2", "c2", make_config());

        let snapshot = registry.get_all_sessions();
        assert_eq!(snapshot.len(), 2);

        // Mutating the registry afterwards does not affect the snapshot.
        registry.remove_session("s1");
        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.session_count(), 1);
    }

    #[tokio::test]
    async fn registry_cleanup_tears_down_everything() {
        let registry = SessionRegistry::new();
        registry.create_session("s1", "c1", make_config());
        registry.create_session("s2", "c2", make_config());
        let s1 = registry.get_session("s1").unwrap();

        registry.cleanup().await;
        assert_eq!(registry.session_count(), 0);
        assert!(!s1.is_active());
    }

    #[test]
    fn recreate_after_delete_is_permitted() {
        let registry = SessionRegistry::new();
        registry.create_session("s1", "c1", make_config());
        registry.remove_session("s1");
        let session = registry.create_session("s1", "c9", make_config());
        assert_eq!(session.connection_id, "c9");
    }
}
