//! Per-request context.
//!
//! Handlers never see raw session state: every invocation carries an explicit
//! `RequestContext`, and every core-services call takes one. There is no
//! ambient fallback — code without a context cannot make group-scoped calls,
//! which rules out leaking another request's group by construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::SessionContext;
use crate::types::{GroupId, SessionId};

/// The context a handler invocation runs with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestContext {
    pub group: GroupId,
    pub session_id: SessionId,
    pub started_at: DateTime<Utc>,
}

impl From<&SessionContext> for RequestContext {
    fn from(session: &SessionContext) -> Self {
        Self {
            group: session.group.clone(),
            session_id: session.session_id.clone(),
            started_at: session.started_at,
        }
    }
}
