//! Supervisor — the accept loop tying the bus to the pipeline.
//!
//! One task owns the inbound request stream. Each request resolves its
//! session from the transport identity, runs the pipeline as its own task,
//! and responds on the same identity. Requests from identities with no bound
//! session are dropped: no session means no group, and nothing without a
//! group gets past the trust boundary.

use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::bus::MessageBus;
use crate::pipeline::{EventDispatcher, ToolPipeline};
use crate::protocol::Envelope;
use crate::session::{Session, SessionContext, SessionManager};
use crate::types::Result;

/// Host-side request/event loop.
pub struct Supervisor {
    bus: Arc<MessageBus>,
    sessions: Arc<SessionManager>,
    pipeline: Arc<ToolPipeline>,
    events: Arc<EventDispatcher>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("sessions", &self.sessions.count())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    pub fn new(
        bus: Arc<MessageBus>,
        sessions: Arc<SessionManager>,
        pipeline: Arc<ToolPipeline>,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            bus,
            sessions,
            pipeline,
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Run until cancelled. Takes the bus's request stream; the bus must be
    /// bound first.
    pub async fn run(&self) -> Result<()> {
        let mut requests = self.bus.requests()?;
        let mut event_feed = self.bus.subscribe([""])?;
        tracing::info!("supervisor running");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("supervisor shutting down");
                    break;
                }
                inbound = requests.recv() => {
                    let Some(inbound) = inbound else { break };
                    let Some(session) = self.sessions.lookup_identity(&inbound.identity) else {
                        tracing::warn!(
                            identity = inbound.identity.as_str(),
                            "dropping request from unknown connection identity"
                        );
                        continue;
                    };

                    let ctx = SessionContext::from(session.as_ref());
                    let pipeline = self.pipeline.clone();
                    let bus = self.bus.clone();
                    tokio::spawn(async move {
                        let response = pipeline.process(&inbound.bytes, &ctx).await;
                        if let Err(e) = bus.respond(&inbound.identity, &response).await {
                            tracing::warn!(
                                identity = inbound.identity.as_str(),
                                "response delivery failed: {}",
                                e
                            );
                        }
                    });
                }
                event = event_feed.recv() => {
                    let Some(event) = event else { break };
                    if let Err(e) = event.envelope.verify_version() {
                        tracing::warn!(topic = %event.topic, "dropping event: {}", e);
                        continue;
                    }
                    self.events.dispatch(&event.envelope);
                }
            }
        }
        Ok(())
    }

    /// Request graceful shutdown of the run loop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Publish the lifecycle event for a freshly bound session.
    pub fn announce_session_started(&self, session: &Session) -> Result<()> {
        self.bus.publish(&Envelope::event(
            "session.started",
            session.container_id.clone(),
            session.group.clone(),
            json!({ "session_id": session.session_id.as_str() }),
        ))
    }

    /// Publish the lifecycle event for a session that was shut down.
    pub fn announce_session_ended(&self, session: &Session) -> Result<()> {
        self.bus.publish(&Envelope::event(
            "session.ended",
            session.container_id.clone(),
            session.group.clone(),
            json!({ "session_id": session.session_id.as_str() }),
        ))
    }
}
