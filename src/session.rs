//! Session management.
//!
//! A session binds a running container to its group and transport identity.
//! The manager keeps three indexes (session id, connection identity,
//! container id); each enforces uniqueness, and create/delete update all
//! three in one critical section.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::types::{ConnectionIdentity, ContainerId, Error, GroupId, Result, SessionId};

/// A bound container session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub session_id: SessionId,
    pub container_id: ContainerId,
    pub group: GroupId,
    pub connection_identity: ConnectionIdentity,
    pub started_at: DateTime<Utc>,
}

/// The pipeline-visible projection of a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub group: GroupId,
    /// The trusted container identity stamped on envelopes.
    pub source: ContainerId,
    pub started_at: DateTime<Utc>,
}

impl From<&Session> for SessionContext {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.session_id.clone(),
            group: session.group.clone(),
            source: session.container_id.clone(),
            started_at: session.started_at,
        }
    }
}

#[derive(Debug, Default)]
struct Indexes {
    by_session: HashMap<SessionId, Arc<Session>>,
    by_identity: HashMap<ConnectionIdentity, SessionId>,
    by_container: HashMap<ContainerId, SessionId>,
}

/// Session registry with three unique indexes.
#[derive(Debug, Default)]
pub struct SessionManager {
    inner: Mutex<Indexes>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session for a container that reached the running state.
    /// Rejects if the connection identity or container id is already bound.
    pub fn create(
        &self,
        container_id: ContainerId,
        group: GroupId,
        connection_identity: ConnectionIdentity,
    ) -> Result<Arc<Session>> {
        let mut inner = self.inner.lock().expect("session indexes poisoned");

        if inner.by_identity.contains_key(&connection_identity) {
            return Err(Error::validation(format!(
                "connection identity {} is already bound to a session",
                connection_identity
            )));
        }
        if inner.by_container.contains_key(&container_id) {
            return Err(Error::validation(format!(
                "container {} is already bound to a session",
                container_id
            )));
        }

        let session = Arc::new(Session {
            session_id: SessionId::new(),
            container_id: container_id.clone(),
            group,
            connection_identity: connection_identity.clone(),
            started_at: Utc::now(),
        });

        inner
            .by_identity
            .insert(connection_identity, session.session_id.clone());
        inner
            .by_container
            .insert(container_id, session.session_id.clone());
        inner
            .by_session
            .insert(session.session_id.clone(), session.clone());

        Ok(session)
    }

    /// Look up by session id.
    pub fn get(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.inner
            .lock()
            .expect("session indexes poisoned")
            .by_session
            .get(session_id)
            .cloned()
    }

    /// Look up by transport connection identity.
    pub fn lookup_identity(&self, identity: &ConnectionIdentity) -> Option<Arc<Session>> {
        let inner = self.inner.lock().expect("session indexes poisoned");
        let session_id = inner.by_identity.get(identity)?;
        inner.by_session.get(session_id).cloned()
    }

    /// Look up by container id.
    pub fn lookup_container(&self, container_id: &ContainerId) -> Option<Arc<Session>> {
        let inner = self.inner.lock().expect("session indexes poisoned");
        let session_id = inner.by_container.get(container_id)?;
        inner.by_session.get(session_id).cloned()
    }

    /// Remove a session from all three indexes atomically.
    pub fn delete(&self, session_id: &SessionId) -> Result<Arc<Session>> {
        let mut inner = self.inner.lock().expect("session indexes poisoned");
        let session = inner
            .by_session
            .remove(session_id)
            .ok_or_else(|| Error::not_found(format!("unknown session: {}", session_id)))?;
        inner.by_identity.remove(&session.connection_identity);
        inner.by_container.remove(&session.container_id);
        Ok(session)
    }

    /// Project to the pipeline-visible view.
    pub fn to_session_context(&self, session_id: &SessionId) -> Result<SessionContext> {
        self.get(session_id)
            .map(|s| SessionContext::from(s.as_ref()))
            .ok_or_else(|| Error::not_found(format!("unknown session: {}", session_id)))
    }

    /// All live sessions.
    pub fn list(&self) -> Vec<Arc<Session>> {
        let inner = self.inner.lock().expect("session indexes poisoned");
        let mut sessions: Vec<Arc<Session>> = inner.by_session.values().cloned().collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        sessions
    }

    pub fn count(&self) -> usize {
        self.inner
            .lock()
            .expect("session indexes poisoned")
            .by_session
            .len()
    }
}
