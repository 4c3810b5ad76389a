//! The six-stage request pipeline.
//!
//! construct → topic → payload → authorize → confirm → route. Stages 1–5 run
//! synchronously; stage 6 suspends at the handler boundary. A rejection at
//! stage *k* short-circuits: later stages never run, so an unauthorized
//! request consumes no token and an unconfirmed one never reaches a handler.
//! Every request ends in exactly one audit entry carrying its terminal stage
//! and outcome.

pub mod confirm;
pub mod context;
pub mod dispatch;

pub use confirm::{
    AutoApprove, ConfirmationDecision, ConfirmationRequest, ConfirmationSource,
    PendingConfirmations,
};
pub use context::RequestContext;
pub use dispatch::{EventDispatcher, EventHandler, HandlerRegistry, ToolHandler};

use serde_json::{Map, Value};
use std::sync::Arc;

use crate::audit::{scrub, AuditEntry, AuditLog, AuditOutcome};
use crate::protocol::{
    parse_tool_invoke, Envelope, ErrorCode, PipelineError, PipelineStage, ResponseError,
    WireMessage,
};
use crate::protocol::wire::WireRejection;
use crate::ratelimit::{RateDecision, RateLimiter};
use crate::services::CoreServices;
use crate::session::SessionContext;
use crate::tools::{GroupAuthorizer, RegisteredTool, RiskLevel, ToolCatalog};
use crate::types::{CredentialsConfig, PayloadLimits, PipelineConfig};

/// The request pipeline. One instance serves all sessions; each request is
/// processed as its own task by the supervisor.
pub struct ToolPipeline {
    catalog: Arc<ToolCatalog>,
    groups: Arc<GroupAuthorizer>,
    limiter: Arc<RateLimiter>,
    audit: Arc<AuditLog>,
    handlers: Arc<HandlerRegistry>,
    confirmations: Arc<dyn ConfirmationSource>,
    limits: PayloadLimits,
    timeouts: PipelineConfig,
    credentials: CredentialsConfig,
}

impl std::fmt::Debug for ToolPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolPipeline")
            .field("tools", &self.catalog.len())
            .field("handlers", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

impl ToolPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<ToolCatalog>,
        groups: Arc<GroupAuthorizer>,
        limiter: Arc<RateLimiter>,
        audit: Arc<AuditLog>,
        handlers: Arc<HandlerRegistry>,
        confirmations: Arc<dyn ConfirmationSource>,
        limits: PayloadLimits,
        timeouts: PipelineConfig,
        credentials: CredentialsConfig,
    ) -> Self {
        Self {
            catalog,
            groups,
            limiter,
            audit,
            handlers,
            confirmations,
            limits,
            timeouts,
            credentials,
        }
    }

    /// Run one raw wire message through all six stages and produce the
    /// response envelope. Never fails at the host level: every outcome is a
    /// response.
    pub async fn process(&self, raw: &[u8], session: &SessionContext) -> Envelope {
        // Stage 1 — construct.
        let wire = match WireMessage::parse(raw, &self.limits) {
            Ok(wire) => wire,
            Err(rejection) => return self.reject_unparsed(session, rejection).await,
        };
        if wire.correlation.is_none() {
            let err = PipelineError::new(
                ErrorCode::ValidationFailed,
                PipelineStage::Construct,
                "correlation is required on requests",
            );
            let response = Envelope::error_parts(
                wire.topic.clone(),
                None,
                session.source.clone(),
                session.group.clone(),
                ResponseError::from(&err),
            );
            self.audit_rejection(session, &wire.topic, None, &err).await;
            return response;
        }
        let request = Envelope::request(&wire, session.source.clone(), session.group.clone());

        // Stage 2 — topic.
        let tool = match self.resolve_tool(&request.topic) {
            Ok(tool) => tool,
            Err(err) => return self.reject(&request, session, err).await,
        };

        // Stage 3 — payload.
        let arguments = Value::Object(wire.arguments.clone());
        if let Err(err) = self.validate_payload(&tool, &arguments) {
            return self.reject(&request, session, err).await;
        }

        // Stage 4 — authorize. Group check runs first so an unauthorized
        // request consumes no token.
        if !self.groups.is_allowed(tool.name(), &session.group) {
            let err = PipelineError::new(
                ErrorCode::Unauthorized,
                PipelineStage::Authorize,
                format!(
                    "tool {} is not available to group {}",
                    tool.name(),
                    session.group
                ),
            );
            return self.reject(&request, session, err).await;
        }
        if let RateDecision::Limited { retry_after } =
            self.limiter.try_consume(&session.session_id, &session.group)
        {
            let err = PipelineError::new(
                ErrorCode::RateLimited,
                PipelineStage::Authorize,
                format!("rate limit exceeded; next token in {:.2}s", retry_after),
            )
            .with_retry_after(retry_after);
            return self.reject(&request, session, err).await;
        }

        // Stage 5 — confirm.
        if tool.risk_level() == RiskLevel::High {
            let confirmation = ConfirmationRequest {
                correlation: wire.correlation.clone().unwrap_or_default(),
                tool: tool.name().to_string(),
                arguments: arguments.clone(),
            };
            match self
                .confirmations
                .await_decision(confirmation, self.timeouts.confirmation_timeout)
                .await
            {
                ConfirmationDecision::Approved => {}
                ConfirmationDecision::Denied => {
                    let err = PipelineError::new(
                        ErrorCode::ConfirmationDenied,
                        PipelineStage::Confirm,
                        format!("confirmation denied for tool {}", tool.name()),
                    );
                    return self.reject(&request, session, err).await;
                }
                ConfirmationDecision::TimedOut => {
                    let err = PipelineError::new(
                        ErrorCode::ConfirmationTimeout,
                        PipelineStage::Confirm,
                        format!(
                            "no confirmation decision for tool {} within {:?}",
                            tool.name(),
                            self.timeouts.confirmation_timeout
                        ),
                    );
                    return self.reject(&request, session, err).await;
                }
            }
        }

        // Stage 6 — route.
        self.route(&request, session, &tool, wire.arguments).await
    }

    fn resolve_tool(&self, topic: &str) -> Result<Arc<RegisteredTool>, PipelineError> {
        let Some(name) = parse_tool_invoke(topic) else {
            return Err(PipelineError::new(
                ErrorCode::UnknownTool,
                PipelineStage::Topic,
                format!("topic {:?} is not a tool invocation", topic),
            ));
        };
        self.catalog.get(name).ok_or_else(|| {
            PipelineError::new(
                ErrorCode::UnknownTool,
                PipelineStage::Topic,
                format!("unknown tool: {}", name),
            )
        })
    }

    fn validate_payload(
        &self,
        tool: &RegisteredTool,
        arguments: &Value,
    ) -> Result<(), PipelineError> {
        let serialized = serde_json::to_vec(arguments).unwrap_or_default();
        if serialized.len() > self.limits.max_payload_bytes {
            return Err(PipelineError::new(
                ErrorCode::ValidationFailed,
                PipelineStage::Payload,
                format!(
                    "payload of {} bytes exceeds limit of {} bytes",
                    serialized.len(),
                    self.limits.max_payload_bytes
                ),
            ));
        }
        if let Some((path, size)) = oversized_field(arguments, self.limits.max_field_bytes, "") {
            return Err(PipelineError::new(
                ErrorCode::ValidationFailed,
                PipelineStage::Payload,
                format!(
                    "field {} of {} bytes exceeds limit of {} bytes",
                    path, size, self.limits.max_field_bytes
                ),
            ));
        }

        let violations = tool.validate_arguments(arguments);
        if !violations.is_empty() {
            return Err(PipelineError::new(
                ErrorCode::ValidationFailed,
                PipelineStage::Payload,
                format!(
                    "arguments for tool {} rejected: {}",
                    tool.name(),
                    violations.join("; ")
                ),
            ));
        }
        Ok(())
    }

    async fn route(
        &self,
        request: &Envelope,
        session: &SessionContext,
        tool: &RegisteredTool,
        arguments: Map<String, Value>,
    ) -> Envelope {
        let Some(registration) = self.handlers.get(tool.name()) else {
            let err = PipelineError::new(
                ErrorCode::PluginUnavailable,
                PipelineStage::Route,
                format!("no handler registered for tool {}", tool.name()),
            );
            return self.reject(request, session, err).await;
        };

        let ctx = RequestContext::from(session);
        let services = CoreServices::for_plugin(
            self.audit.clone(),
            self.catalog.clone(),
            &self.credentials,
            registration.plugin.clone(),
        );
        let handler = registration.handler.clone();
        let mut task = tokio::spawn(async move { handler.handle(ctx, arguments, services).await });

        let joined = match tokio::time::timeout(self.timeouts.handler_timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_elapsed) => {
                task.abort();
                let err = PipelineError::new(
                    ErrorCode::PluginTimeout,
                    PipelineStage::Route,
                    format!(
                        "handler for tool {} did not finish within {:?}",
                        tool.name(),
                        self.timeouts.handler_timeout
                    ),
                );
                self.audit_terminal(
                    session,
                    AuditEntry::new(
                        session.group.as_str(),
                        session.source.as_str(),
                        &request.topic,
                        request.correlation.clone(),
                        PipelineStage::Route,
                        AuditOutcome::Error,
                    )
                    .with_error(err.message.clone(), "timeout"),
                )
                .await;
                return Envelope::response_error(request, ResponseError::from(&err));
            }
        };

        match joined {
            Ok(Ok(result)) => {
                self.audit_terminal(
                    session,
                    AuditEntry::new(
                        session.group.as_str(),
                        session.source.as_str(),
                        &request.topic,
                        request.correlation.clone(),
                        PipelineStage::Route,
                        AuditOutcome::Routed,
                    ),
                )
                .await;
                Envelope::response_ok(request, result)
            }
            Ok(Err(handler_err)) => {
                // Outbound error text passes the scrubber like everything
                // else leaving the trust domain.
                let (scrubbed, changed) = scrub::scrub_str(handler_err.text());
                let mut response_err = ResponseError::from(&handler_err);
                response_err.message = scrubbed;

                let entry = AuditEntry::new(
                    session.group.as_str(),
                    session.source.as_str(),
                    &request.topic,
                    request.correlation.clone(),
                    PipelineStage::Route,
                    if changed {
                        AuditOutcome::Sanitized
                    } else {
                        AuditOutcome::Error
                    },
                );
                let entry = if changed {
                    entry
                        .with_field_paths(vec!["error.message".to_string()])
                        .with_error(response_err.message.clone(), "handler")
                } else {
                    entry.with_error(response_err.message.clone(), "handler")
                };
                self.audit_terminal(session, entry).await;
                Envelope::response_error(request, response_err)
            }
            Err(join_err) => {
                let message = panic_message(join_err);
                let err = PipelineError::new(
                    ErrorCode::PluginError,
                    PipelineStage::Route,
                    message.clone(),
                );
                self.audit_terminal(
                    session,
                    AuditEntry::new(
                        session.group.as_str(),
                        session.source.as_str(),
                        &request.topic,
                        request.correlation.clone(),
                        PipelineStage::Route,
                        AuditOutcome::Error,
                    )
                    .with_error(message, "panic"),
                )
                .await;
                Envelope::response_error(request, ResponseError::from(&err))
            }
        }
    }

    async fn reject(
        &self,
        request: &Envelope,
        session: &SessionContext,
        err: PipelineError,
    ) -> Envelope {
        self.audit_rejection(session, &request.topic, request.correlation.clone(), &err)
            .await;
        Envelope::response_error(request, ResponseError::from(&err))
    }

    async fn reject_unparsed(
        &self,
        session: &SessionContext,
        rejection: WireRejection,
    ) -> Envelope {
        let stage = match rejection {
            WireRejection::TooLarge { .. } | WireRejection::TooDeep { .. } => {
                PipelineStage::Payload
            }
            WireRejection::Malformed(_) => PipelineStage::Construct,
        };
        let err = PipelineError::new(ErrorCode::ValidationFailed, stage, rejection.to_string());
        self.audit_rejection(session, "", None, &err).await;
        Envelope::error_parts(
            String::new(),
            None,
            session.source.clone(),
            session.group.clone(),
            ResponseError::from(&err),
        )
    }

    async fn audit_rejection(
        &self,
        session: &SessionContext,
        topic: &str,
        correlation: Option<String>,
        err: &PipelineError,
    ) {
        let entry = AuditEntry::new(
            session.group.as_str(),
            session.source.as_str(),
            topic,
            correlation,
            err.stage,
            AuditOutcome::Rejected,
        )
        .with_reason(err.message.clone());
        if let Err(e) = self.audit.append(entry).await {
            tracing::error!(group = session.group.as_str(), "audit append failed: {}", e);
        }
    }

    async fn audit_terminal(&self, session: &SessionContext, entry: AuditEntry) {
        if let Err(e) = self.audit.append(entry).await {
            tracing::error!(group = session.group.as_str(), "audit append failed: {}", e);
        }
    }
}

/// Depth-first search for a string field larger than `limit` bytes.
fn oversized_field(value: &Value, limit: usize, path: &str) -> Option<(String, usize)> {
    match value {
        Value::String(s) => {
            if s.len() > limit {
                let path = if path.is_empty() { "<root>" } else { path };
                Some((path.to_string(), s.len()))
            } else {
                None
            }
        }
        Value::Object(map) => map.iter().find_map(|(key, child)| {
            let child_path = if path.is_empty() {
                key.clone()
            } else {
                format!("{}.{}", path, key)
            };
            oversized_field(child, limit, &child_path)
        }),
        Value::Array(items) => items.iter().enumerate().find_map(|(i, child)| {
            oversized_field(child, limit, &format!("{}[{}]", path, i))
        }),
        _ => None,
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => {
            if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "handler panicked".to_string()
            }
        }
        Err(e) => format!("handler task failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditFilter;
    use crate::protocol::HandlerError;
    use crate::tools::ToolDeclaration;
    use crate::types::{AuditConfig, ContainerId, GroupId, RateLimitSettings, SessionId};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    struct EchoHandler;

    #[async_trait]
    impl ToolHandler for EchoHandler {
        async fn handle(
            &self,
            _ctx: RequestContext,
            arguments: Map<String, Value>,
            _services: CoreServices,
        ) -> Result<Value, HandlerError> {
            Ok(json!({ "echo": Value::Object(arguments) }))
        }
    }

    struct FailingHandler {
        code: &'static str,
        message: &'static str,
    }

    #[async_trait]
    impl ToolHandler for FailingHandler {
        async fn handle(
            &self,
            _ctx: RequestContext,
            _arguments: Map<String, Value>,
            _services: CoreServices,
        ) -> Result<Value, HandlerError> {
            Err(HandlerError::new(self.code, self.message))
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl ToolHandler for PanickingHandler {
        async fn handle(
            &self,
            _ctx: RequestContext,
            _arguments: Map<String, Value>,
            _services: CoreServices,
        ) -> Result<Value, HandlerError> {
            panic!("Database connection failed");
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl ToolHandler for SlowHandler {
        async fn handle(
            &self,
            _ctx: RequestContext,
            _arguments: Map<String, Value>,
            _services: CoreServices,
        ) -> Result<Value, HandlerError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        }
    }

    struct Harness {
        pipeline: ToolPipeline,
        limiter: Arc<RateLimiter>,
        audit: Arc<AuditLog>,
        groups: Arc<GroupAuthorizer>,
        catalog: Arc<ToolCatalog>,
        handlers: Arc<HandlerRegistry>,
        confirmations: Arc<PendingConfirmations>,
        _dir: TempDir,
    }

    fn echo_tool(name: &str, risk: RiskLevel) -> ToolDeclaration {
        ToolDeclaration {
            name: name.to_string(),
            description: "test tool".to_string(),
            risk_level: risk,
            arguments_schema: json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "text": { "type": "string" },
                    "blob": { "type": "object" },
                },
            }),
        }
    }

    fn harness() -> Harness {
        harness_with(RateLimitSettings {
            requests_per_minute: 6000,
            burst_size: 100,
        })
    }

    fn harness_with(settings: RateLimitSettings) -> Harness {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(ToolCatalog::new());
        let groups = Arc::new(GroupAuthorizer::new());
        let limiter = Arc::new(RateLimiter::new(settings).unwrap());
        let audit = Arc::new(AuditLog::new(&AuditConfig {
            dir: dir.path().join("audit"),
        }));
        let handlers = Arc::new(HandlerRegistry::new());
        let confirmations = Arc::new(PendingConfirmations::new());

        catalog.register(echo_tool("echo", RiskLevel::Low)).unwrap();
        handlers
            .register("echo-plugin", "echo", Arc::new(EchoHandler))
            .unwrap();

        let pipeline = ToolPipeline::new(
            catalog.clone(),
            groups.clone(),
            limiter.clone(),
            audit.clone(),
            handlers.clone(),
            confirmations.clone(),
            PayloadLimits::default(),
            PipelineConfig {
                confirmation_timeout: Duration::from_millis(100),
                handler_timeout: Duration::from_millis(500),
            },
            CredentialsConfig {
                dir: dir.path().join("credentials"),
            },
        );

        Harness {
            pipeline,
            limiter,
            audit,
            groups,
            catalog,
            handlers,
            confirmations,
            _dir: dir,
        }
    }

    fn session(group: &str) -> SessionContext {
        SessionContext {
            session_id: SessionId::new(),
            group: GroupId::from_string(group.to_string()).unwrap(),
            source: ContainerId::from_string("ctr-1".to_string()).unwrap(),
            started_at: Utc::now(),
        }
    }

    fn request_bytes(topic: &str, correlation: &str, arguments: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "topic": topic,
            "correlation": correlation,
            "arguments": arguments,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn unknown_tool_rejects_at_stage_two() {
        let h = harness();
        let session = session("test");
        let raw = request_bytes("tool.invoke.nonexistent", "c1", json!({}));

        let response = h.pipeline.process(&raw, &session).await;
        let err = response.error().unwrap();
        assert_eq!(err.code, "UNKNOWN_TOOL");
        assert_eq!(err.stage, Some(2));
        assert!(!err.retriable);
        assert_eq!(response.correlation.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn successful_invocation_routes_and_audits() {
        let h = harness();
        let session = session("test");
        let raw = request_bytes("tool.invoke.echo", "c1", json!({ "text": "hi" }));

        let response = h.pipeline.process(&raw, &session).await;
        assert!(response.error().is_none());
        assert_eq!(response.result().unwrap()["echo"]["text"], "hi");

        let entries = h.audit.query("test", &AuditFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, AuditOutcome::Routed);
        assert_eq!(entries[0].stage, PipelineStage::Route);
        assert_eq!(entries[0].correlation.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn group_denial_consumes_no_token() {
        let h = harness();
        h.groups.restrict("echo", ["slack"]);
        let session = session("email");
        let raw = request_bytes("tool.invoke.echo", "c1", json!({}));

        let response = h.pipeline.process(&raw, &session).await;
        let err = response.error().unwrap();
        assert_eq!(err.code, "UNAUTHORIZED");
        assert_eq!(err.stage, Some(4));

        // No bucket was ever touched for the session.
        assert_eq!(h.limiter.tokens_remaining(&session.session_id), None);
    }

    #[tokio::test]
    async fn rate_limit_rejects_third_burst_request() {
        let h = harness_with(RateLimitSettings {
            requests_per_minute: 60,
            burst_size: 2,
        });
        let session = session("test");

        for i in 0..2 {
            let raw = request_bytes("tool.invoke.echo", &format!("c{}", i), json!({}));
            let response = h.pipeline.process(&raw, &session).await;
            assert!(response.error().is_none(), "request {} unexpectedly failed", i);
        }

        let raw = request_bytes("tool.invoke.echo", "c3", json!({}));
        let response = h.pipeline.process(&raw, &session).await;
        let err = response.error().unwrap();
        assert_eq!(err.code, "RATE_LIMITED");
        assert!(err.retriable);
        let retry_after = err.retry_after.unwrap();
        assert!((retry_after - 1.0).abs() < 0.1, "retry_after = {}", retry_after);
    }

    #[tokio::test]
    async fn schema_violation_rejects_at_stage_three() {
        let h = harness();
        let session = session("test");
        let raw = request_bytes("tool.invoke.echo", "c1", json!({ "unexpected": 1 }));

        let response = h.pipeline.process(&raw, &session).await;
        let err = response.error().unwrap();
        assert_eq!(err.code, "VALIDATION_FAILED");
        assert_eq!(err.stage, Some(3));
    }

    #[tokio::test]
    async fn sentinel_key_rejects_at_stage_three() {
        let h = harness();
        let session = session("test");
        let raw = request_bytes(
            "tool.invoke.echo",
            "c1",
            json!({ "blob": { "__proto__": { "polluted": true } } }),
        );

        let response = h.pipeline.process(&raw, &session).await;
        assert_eq!(response.error().unwrap().code, "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn oversized_field_rejects_at_stage_three() {
        let h = harness();
        let session = session("test");
        let raw = request_bytes(
            "tool.invoke.echo",
            "c1",
            json!({ "text": "x".repeat(101 * 1024) }),
        );

        let response = h.pipeline.process(&raw, &session).await;
        let err = response.error().unwrap();
        assert_eq!(err.code, "VALIDATION_FAILED");
        assert_eq!(err.stage, Some(3));
        assert!(err.message.contains("text"));
    }

    #[tokio::test]
    async fn adversarial_identity_bytes_cannot_spoof_the_envelope() {
        let h = harness();
        let session = session("test");
        let raw = serde_json::to_vec(&json!({
            "topic": "tool.invoke.echo",
            "correlation": "c1",
            "arguments": { "text": "hi" },
            "source": "other-container",
            "group": "admin",
            "id": "forged",
            "type": "event",
            "version": 99,
        }))
        .unwrap();

        let response = h.pipeline.process(&raw, &session).await;
        assert!(response.error().is_none());
        assert_eq!(response.source.as_str(), "ctr-1");
        assert_eq!(response.group.as_str(), "test");
        assert_eq!(response.kind, crate::protocol::EnvelopeType::Response);
    }

    #[tokio::test]
    async fn missing_correlation_rejects_at_construct() {
        let h = harness();
        let session = session("test");
        let raw = serde_json::to_vec(&json!({
            "topic": "tool.invoke.echo",
            "arguments": {},
        }))
        .unwrap();

        let response = h.pipeline.process(&raw, &session).await;
        let err = response.error().unwrap();
        assert_eq!(err.code, "VALIDATION_FAILED");
        assert_eq!(err.stage, Some(1));
    }

    #[tokio::test]
    async fn high_risk_tool_denied_by_confirmation() {
        let h = harness();
        h.catalog
            .register(echo_tool("wipe", RiskLevel::High))
            .unwrap();
        h.handlers
            .register("danger-plugin", "wipe", Arc::new(EchoHandler))
            .unwrap();
        let session = session("test");

        let confirmations = h.confirmations.clone();
        tokio::spawn(async move {
            loop {
                if confirmations.resolve("c1", false) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let raw = request_bytes("tool.invoke.wipe", "c1", json!({}));
        let response = h.pipeline.process(&raw, &session).await;
        let err = response.error().unwrap();
        assert_eq!(err.code, "CONFIRMATION_DENIED");
        assert_eq!(err.stage, Some(5));
        assert!(!err.retriable);
    }

    #[tokio::test]
    async fn high_risk_tool_times_out_without_decision() {
        let h = harness();
        h.catalog
            .register(echo_tool("wipe", RiskLevel::High))
            .unwrap();
        h.handlers
            .register("danger-plugin", "wipe", Arc::new(EchoHandler))
            .unwrap();
        let session = session("test");

        let raw = request_bytes("tool.invoke.wipe", "c1", json!({}));
        let response = h.pipeline.process(&raw, &session).await;
        let err = response.error().unwrap();
        assert_eq!(err.code, "CONFIRMATION_TIMEOUT");
        assert!(err.retriable);
    }

    #[tokio::test]
    async fn low_risk_tool_skips_confirmation() {
        // The harness confirmation source would time out if consulted; a
        // low-risk tool must pass without asking it.
        let h = harness();
        let session = session("test");
        let raw = request_bytes("tool.invoke.echo", "c1", json!({}));
        let response = h.pipeline.process(&raw, &session).await;
        assert!(response.error().is_none());
    }

    #[tokio::test]
    async fn missing_handler_yields_plugin_unavailable() {
        let h = harness();
        h.catalog
            .register(echo_tool("orphan", RiskLevel::Low))
            .unwrap();
        let session = session("test");

        let raw = request_bytes("tool.invoke.orphan", "c1", json!({}));
        let response = h.pipeline.process(&raw, &session).await;
        let err = response.error().unwrap();
        assert_eq!(err.code, "PLUGIN_UNAVAILABLE");
        assert_eq!(err.stage, Some(6));
    }

    #[tokio::test]
    async fn handler_reserved_code_is_recoded() {
        let h = harness();
        h.catalog
            .register(echo_tool("spoof", RiskLevel::Low))
            .unwrap();
        h.handlers
            .register(
                "spoof-plugin",
                "spoof",
                Arc::new(FailingHandler {
                    code: "UNKNOWN_TOOL",
                    message: "pretending to be the pipeline",
                }),
            )
            .unwrap();
        let session = session("test");

        let raw = request_bytes("tool.invoke.spoof", "c1", json!({}));
        let response = h.pipeline.process(&raw, &session).await;
        let err = response.error().unwrap();
        assert_eq!(err.code, "HANDLER_ERROR");
    }

    #[tokio::test]
    async fn handler_panic_becomes_plugin_error_with_message() {
        let h = harness();
        h.catalog
            .register(echo_tool("crash", RiskLevel::Low))
            .unwrap();
        h.handlers
            .register("crash-plugin", "crash", Arc::new(PanickingHandler))
            .unwrap();
        let session = session("test");

        let raw = request_bytes("tool.invoke.crash", "c7", json!({}));
        let response = h.pipeline.process(&raw, &session).await;
        let err = response.error().unwrap();
        assert_eq!(err.code, "PLUGIN_ERROR");
        assert!(err.message.contains("Database connection failed"));
        assert_eq!(response.correlation.as_deref(), Some("c7"));
    }

    #[tokio::test]
    async fn slow_handler_yields_plugin_timeout() {
        let h = harness();
        h.catalog
            .register(echo_tool("slow", RiskLevel::Low))
            .unwrap();
        h.handlers
            .register("slow-plugin", "slow", Arc::new(SlowHandler))
            .unwrap();
        let session = session("test");

        let raw = request_bytes("tool.invoke.slow", "c1", json!({}));
        let response = h.pipeline.process(&raw, &session).await;
        let err = response.error().unwrap();
        assert_eq!(err.code, "PLUGIN_TIMEOUT");
        assert!(err.retriable);
    }

    #[tokio::test]
    async fn handler_error_message_is_scrubbed_and_audited_sanitized() {
        let h = harness();
        h.catalog
            .register(echo_tool("leaky", RiskLevel::Low))
            .unwrap();
        h.handlers
            .register(
                "leaky-plugin",
                "leaky",
                Arc::new(FailingHandler {
                    code: "HANDLER_ERROR",
                    message: "upstream rejected key sk-ant-api03-verysecret123",
                }),
            )
            .unwrap();
        let session = session("test");

        let raw = request_bytes("tool.invoke.leaky", "c1", json!({}));
        let response = h.pipeline.process(&raw, &session).await;
        let err = response.error().unwrap();
        assert!(!err.message.contains("sk-ant"));
        assert!(err.message.contains(scrub::REDACTION_MARKER));

        let entries = h.audit.query("test", &AuditFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, AuditOutcome::Sanitized);
        assert_eq!(
            entries[0].field_paths.as_deref(),
            Some(&["error.message".to_string()][..])
        );
    }

    #[tokio::test]
    async fn rejection_is_audited_with_stage_and_reason() {
        let h = harness();
        let session = session("test");
        let raw = request_bytes("tool.invoke.nonexistent", "c1", json!({}));
        h.pipeline.process(&raw, &session).await;

        let entries = h.audit.query("test", &AuditFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, AuditOutcome::Rejected);
        assert_eq!(entries[0].stage, PipelineStage::Topic);
        assert!(entries[0].reason.as_deref().unwrap().contains("nonexistent"));
    }

    #[tokio::test]
    async fn oversized_raw_message_rejected_before_parse() {
        let h = harness();
        let session = session("test");
        let raw = vec![b'{'; 2 * 1024 * 1024];
        let response = h.pipeline.process(&raw, &session).await;
        let err = response.error().unwrap();
        assert_eq!(err.code, "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn sessions_do_not_share_buckets() {
        let h = harness_with(RateLimitSettings {
            requests_per_minute: 60,
            burst_size: 1,
        });
        let a = session("test");
        let b = session("test");

        let raw = request_bytes("tool.invoke.echo", "c1", json!({}));
        assert!(h.pipeline.process(&raw, &a).await.error().is_none());
        // Session a is exhausted, b is not.
        assert!(h.pipeline.process(&raw, &a).await.error().is_some());
        assert!(h.pipeline.process(&raw, &b).await.error().is_none());
    }
}
