use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{Session, SessionInfo, TeardownReason};
use crate::error::SessionError;

/// Live sessions of one proxy instance, keyed by session id.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: Arc<Session>) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session.id()) {
            return Err(SessionError::AlreadyExists(session.id().to_string()));
        }
        info!(session_id = %session.id(), target = %session.target(), "Registered session");
        sessions.insert(session.id().to_string(), session);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn require(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        self.get(id)
            .await
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Removes the session and releases its resources. Only the first caller
    /// for a given session does anything; later calls return `false`.
    pub async fn cleanup(&self, id: &str, reason: TeardownReason) -> bool {
        let removed = self.sessions.write().await.remove(id);
        match removed {
            Some(session) => {
                session.teardown(reason);
                info!(session_id = %id, ?reason, "Removed session");
                true
            }
            None => {
                debug!(session_id = %id, ?reason, "Session already cleaned up");
                false
            }
        }
    }

    /// Like [`cleanup`](Self::cleanup), but only when the registered session
    /// under that id is `session` itself. A stale handle whose id has since
    /// been reused leaves the newer session alone.
    pub async fn cleanup_if(&self, session: &Arc<Session>, reason: TeardownReason) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(session.id()) {
                Some(current) if Arc::ptr_eq(current, session) => sessions.remove(session.id()),
                _ => None,
            }
        };
        match removed {
            Some(session) => {
                session.teardown(reason);
                info!(session_id = %session.id(), ?reason, "Removed session");
                true
            }
            None => {
                debug!(session_id = %session.id(), ?reason, "Session already cleaned up or replaced");
                false
            }
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn snapshot(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.info().await);
        }
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    pub async fn idle_session_ids(&self, threshold: Duration) -> Vec<String> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut idle = Vec::new();
        for session in sessions {
            if session.idle_for().await >= threshold {
                idle.push(session.id().to_string());
            }
        }
        idle
    }

    /// Evicts every session idle for at least `threshold`. Returns how many went.
    pub async fn reap_idle(&self, threshold: Duration) -> usize {
        let mut reaped = 0;
        for id in self.idle_session_ids(threshold).await {
            if self.cleanup(&id, TeardownReason::IdleTimeout).await {
                info!(session_id = %id, "Reaped idle session");
                reaped += 1;
            }
        }
        reaped
    }

    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            self.cleanup(&id, TeardownReason::Shutdown).await;
        }
    }
}
