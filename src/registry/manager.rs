//! The directory of live listener sessions

use super::session::{ListenerSession, SessionInfo};
use crate::error::{Error, Result};
use crate::protocol::MSG_DUPLICATE_NAME;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Registry of connected listeners.
///
/// This is the only shared mutable state of the dispatcher. Every operation
/// holds the lock only for the duration of a scan over the backing vector;
/// lookups return cloned `Arc`s so no lock is held across a relay.
#[derive(Default)]
pub struct ListenerRegistry {
    sessions: RwLock<Vec<Arc<ListenerSession>>>,
}

impl ListenerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session unless one with the same name and remote address is live
    pub async fn insert(&self, session: Arc<ListenerSession>) -> Result<()> {
        self.insert_with(session, || {}).await
    }

    /// Like `insert`, running `on_insert` before the write lock is released.
    ///
    /// Nothing can find the session until `on_insert` has returned, so a frame
    /// queued there reaches the listener ahead of any relay.
    pub async fn insert_with<F>(&self, session: Arc<ListenerSession>, on_insert: F) -> Result<()>
    where
        F: FnOnce(),
    {
        let mut sessions = self.sessions.write().await;
        let conflict = sessions
            .iter()
            .any(|s| s.name() == session.name() && s.remote_addr() == session.remote_addr());
        if conflict {
            return Err(Error::Registration(MSG_DUPLICATE_NAME.to_string()));
        }

        tracing::info!(
            listener = %session.name(),
            remote = %session.remote_addr(),
            actions = ?session.actions(),
            "Registered listener"
        );
        sessions.push(session);
        on_insert();
        Ok(())
    }

    /// Remove the session bound to `connection_id`.
    ///
    /// Uses `swap_remove`: the order of the remaining sessions changes.
    pub async fn remove_by_connection(&self, connection_id: &str) -> Option<Arc<ListenerSession>> {
        let mut sessions = self.sessions.write().await;
        let idx = sessions.iter().position(|s| s.id() == connection_id)?;
        let session = sessions.swap_remove(idx);

        tracing::info!(
            listener = %session.name(),
            remote = %session.remote_addr(),
            "Unregistered listener"
        );
        Some(session)
    }

    /// Every session advertising `action`, in registry order
    pub async fn find_by_action(&self, action: &str) -> Vec<Arc<ListenerSession>> {
        self.sessions
            .read()
            .await
            .iter()
            .filter(|s| s.advertises(action))
            .cloned()
            .collect()
    }

    /// All live sessions, in registry order
    pub async fn snapshot(&self) -> Vec<Arc<ListenerSession>> {
        self.sessions.read().await.clone()
    }

    /// Serializable view of all live sessions
    pub async fn describe(&self) -> Vec<SessionInfo> {
        let sessions = self.snapshot().await;
        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.info().await);
        }
        infos
    }

    /// Number of live sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
