//! Confirmation gate for high-risk tools.
//!
//! The decision source is a pluggable capability: the pipeline only knows
//! `await_decision`. [`PendingConfirmations`] is the in-tree implementation a
//! host UI drives by resolving correlations; [`AutoApprove`] waves everything
//! through for hosts that gate risk elsewhere.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

/// A pending decision shown to whoever approves it.
#[derive(Debug, Clone)]
pub struct ConfirmationRequest {
    pub correlation: String,
    pub tool: String,
    pub arguments: Value,
}

/// Outcome of a confirmation wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationDecision {
    Approved,
    Denied,
    TimedOut,
}

/// Abstract source of confirmation decisions.
#[async_trait]
pub trait ConfirmationSource: Send + Sync {
    async fn await_decision(
        &self,
        request: ConfirmationRequest,
        timeout: Duration,
    ) -> ConfirmationDecision;
}

/// Approves every request immediately.
#[derive(Debug, Default)]
pub struct AutoApprove;

#[async_trait]
impl ConfirmationSource for AutoApprove {
    async fn await_decision(
        &self,
        _request: ConfirmationRequest,
        _timeout: Duration,
    ) -> ConfirmationDecision {
        ConfirmationDecision::Approved
    }
}

/// Oneshot-backed decision table keyed by correlation.
///
/// `await_decision` parks the request; a host-side approver calls
/// [`PendingConfirmations::resolve`] with the correlation to release it.
#[derive(Debug, Default)]
pub struct PendingConfirmations {
    pending: Mutex<HashMap<String, oneshot::Sender<bool>>>,
}

impl PendingConfirmations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a pending confirmation. Returns false if the correlation is
    /// not waiting (already resolved, timed out, or never asked).
    pub fn resolve(&self, correlation: &str, approve: bool) -> bool {
        let sender = self
            .pending
            .lock()
            .expect("confirmation table poisoned")
            .remove(correlation);
        match sender {
            Some(tx) => tx.send(approve).is_ok(),
            None => false,
        }
    }

    /// Correlations currently awaiting a decision.
    pub fn pending_correlations(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .pending
            .lock()
            .expect("confirmation table poisoned")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ConfirmationSource for PendingConfirmations {
    async fn await_decision(
        &self,
        request: ConfirmationRequest,
        timeout: Duration,
    ) -> ConfirmationDecision {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("confirmation table poisoned")
            .insert(request.correlation.clone(), tx);

        let decision = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(true)) => ConfirmationDecision::Approved,
            Ok(Ok(false)) | Ok(Err(_)) => ConfirmationDecision::Denied,
            Err(_) => ConfirmationDecision::TimedOut,
        };

        // Drop the entry if it is still there (timeout path).
        self.pending
            .lock()
            .expect("confirmation table poisoned")
            .remove(&request.correlation);
        decision
    }
}
