//! Bus integration tests — a peer socket plays the container side:
//! request datagrams in, pipeline responses back on the same identity,
//! events fanned out to prefix subscribers.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UnixDatagram;

use carapace::audit::AuditLog;
use carapace::bus::{codec, MessageBus};
use carapace::pipeline::{
    AutoApprove, EventDispatcher, HandlerRegistry, RequestContext, ToolHandler, ToolPipeline,
};
use carapace::protocol::{Envelope, HandlerError};
use carapace::ratelimit::RateLimiter;
use carapace::services::CoreServices;
use carapace::session::SessionManager;
use carapace::supervisor::Supervisor;
use carapace::tools::{GroupAuthorizer, RiskLevel, ToolCatalog, ToolDeclaration};
use carapace::types::{
    AuditConfig, BusConfig, ConnectionIdentity, ContainerId, CredentialsConfig, GroupId,
    PayloadLimits, PipelineConfig, RateLimitSettings,
};

struct EchoHandler;

#[async_trait]
impl ToolHandler for EchoHandler {
    async fn handle(
        &self,
        _ctx: RequestContext,
        arguments: Map<String, Value>,
        _services: CoreServices,
    ) -> Result<Value, HandlerError> {
        Ok(Value::Object(arguments))
    }
}

struct World {
    bus: Arc<MessageBus>,
    sessions: Arc<SessionManager>,
    supervisor: Arc<Supervisor>,
    dir: TempDir,
}

async fn world() -> World {
    let dir = TempDir::new().unwrap();
    let bus = Arc::new(MessageBus::new(BusConfig {
        socket_dir: dir.path().to_path_buf(),
        ..BusConfig::default()
    }));
    bus.bind().unwrap();

    let catalog = Arc::new(ToolCatalog::new());
    catalog
        .register(ToolDeclaration {
            name: "echo".to_string(),
            description: "Echo arguments".to_string(),
            risk_level: RiskLevel::Low,
            arguments_schema: json!({
                "type": "object",
                "additionalProperties": false,
                "properties": { "text": { "type": "string" } },
            }),
        })
        .unwrap();
    let handlers = Arc::new(HandlerRegistry::new());
    handlers
        .register("echo-plugin", "echo", Arc::new(EchoHandler))
        .unwrap();

    let pipeline = Arc::new(ToolPipeline::new(
        catalog,
        Arc::new(GroupAuthorizer::new()),
        Arc::new(RateLimiter::new(RateLimitSettings::default()).unwrap()),
        Arc::new(AuditLog::new(&AuditConfig {
            dir: dir.path().join("audit"),
        })),
        handlers,
        Arc::new(AutoApprove),
        PayloadLimits::default(),
        PipelineConfig::default(),
        CredentialsConfig {
            dir: dir.path().join("credentials"),
        },
    ));

    let sessions = Arc::new(SessionManager::new());
    let supervisor = Arc::new(Supervisor::new(
        bus.clone(),
        sessions.clone(),
        pipeline,
        Arc::new(EventDispatcher::new()),
    ));
    {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            let _ = supervisor.run().await;
        });
    }

    World {
        bus,
        sessions,
        supervisor,
        dir,
    }
}

/// Bind a peer socket and register a session for it.
fn attach_container(w: &World, name: &str, group: &str) -> UnixDatagram {
    let peer_path = w.dir.path().join(format!("{}.sock", name));
    let peer = UnixDatagram::bind(&peer_path).unwrap();
    w.sessions
        .create(
            ContainerId::from_string(name.to_string()).unwrap(),
            GroupId::from_string(group.to_string()).unwrap(),
            ConnectionIdentity::from_string(peer_path.display().to_string()).unwrap(),
        )
        .unwrap();
    peer
}

async fn recv_envelope(peer: &UnixDatagram) -> Envelope {
    let mut buf = vec![0u8; 1024 * 1024];
    let n = tokio::time::timeout(Duration::from_secs(5), peer.recv(&mut buf))
        .await
        .expect("response timed out")
        .unwrap();
    serde_json::from_slice(&buf[..n]).unwrap()
}

#[tokio::test]
async fn request_round_trips_over_the_socket() {
    let w = world().await;
    let peer = attach_container(&w, "ctr-1", "test");

    let request = json!({
        "topic": "tool.invoke.echo",
        "correlation": "c1",
        "arguments": { "text": "over the wire" },
    });
    peer.send_to(
        &serde_json::to_vec(&request).unwrap(),
        w.dir.path().join("requests.sock"),
    )
    .await
    .unwrap();

    let response = recv_envelope(&peer).await;
    assert_eq!(response.correlation.as_deref(), Some("c1"));
    assert_eq!(response.result().unwrap()["text"], "over the wire");
    assert_eq!(response.source.as_str(), "ctr-1");
    assert_eq!(response.group.as_str(), "test");
    w.supervisor.shutdown();
    w.bus.close();
}

#[tokio::test]
async fn spoofed_identity_fields_are_ignored_on_the_wire() {
    let w = world().await;
    let peer = attach_container(&w, "ctr-1", "test");

    let request = json!({
        "topic": "tool.invoke.echo",
        "correlation": "c1",
        "arguments": {},
        "source": "someone-else",
        "group": "admin",
    });
    peer.send_to(
        &serde_json::to_vec(&request).unwrap(),
        w.dir.path().join("requests.sock"),
    )
    .await
    .unwrap();

    let response = recv_envelope(&peer).await;
    assert_eq!(response.source.as_str(), "ctr-1");
    assert_eq!(response.group.as_str(), "test");
    w.supervisor.shutdown();
    w.bus.close();
}

#[tokio::test]
async fn responses_route_to_the_requesting_peer_only() {
    let w = world().await;
    let peer_a = attach_container(&w, "ctr-a", "test");
    let peer_b = attach_container(&w, "ctr-b", "test");

    let request = json!({
        "topic": "tool.invoke.echo",
        "correlation": "from-a",
        "arguments": {},
    });
    peer_a
        .send_to(
            &serde_json::to_vec(&request).unwrap(),
            w.dir.path().join("requests.sock"),
        )
        .await
        .unwrap();

    let response = recv_envelope(&peer_a).await;
    assert_eq!(response.correlation.as_deref(), Some("from-a"));

    // Peer b saw nothing.
    let mut buf = vec![0u8; 1024];
    let outcome =
        tokio::time::timeout(Duration::from_millis(100), peer_b.recv(&mut buf)).await;
    assert!(outcome.is_err());
    w.supervisor.shutdown();
    w.bus.close();
}

#[tokio::test]
async fn unknown_identity_gets_no_response() {
    let w = world().await;
    // Bound socket, but no session registered for it.
    let stranger_path = w.dir.path().join("stranger.sock");
    let stranger = UnixDatagram::bind(&stranger_path).unwrap();

    let request = json!({
        "topic": "tool.invoke.echo",
        "correlation": "c1",
        "arguments": {},
    });
    stranger
        .send_to(
            &serde_json::to_vec(&request).unwrap(),
            w.dir.path().join("requests.sock"),
        )
        .await
        .unwrap();

    let mut buf = vec![0u8; 1024];
    let outcome =
        tokio::time::timeout(Duration::from_millis(200), stranger.recv(&mut buf)).await;
    assert!(outcome.is_err());
    w.supervisor.shutdown();
    w.bus.close();
}

#[tokio::test]
async fn session_events_reach_remote_subscribers() {
    let w = world().await;
    let peer_path = w.dir.path().join("watcher.sock");
    let peer = UnixDatagram::bind(&peer_path).unwrap();
    peer.send_to(
        &codec::encode_control(true, "session."),
        w.dir.path().join("events.sock"),
    )
    .await
    .unwrap();

    let session = w
        .sessions
        .create(
            ContainerId::from_string("ctr-ev".to_string()).unwrap(),
            GroupId::from_string("test".to_string()).unwrap(),
            ConnectionIdentity::from_string("/tmp/ctr-ev.sock".to_string()).unwrap(),
        )
        .unwrap();

    // The subscription datagram races the publish; retry until delivery.
    let mut buf = vec![0u8; 64 * 1024];
    let n = loop {
        w.supervisor.announce_session_started(&session).unwrap();
        match tokio::time::timeout(Duration::from_millis(100), peer.recv(&mut buf)).await {
            Ok(Ok(n)) => break n,
            _ => continue,
        }
    };

    let (topic, payload) = codec::decode_event(&buf[..n]).unwrap();
    assert_eq!(topic, "session.started");
    let envelope: Envelope = serde_json::from_slice(&payload).unwrap();
    assert_eq!(envelope.group.as_str(), "test");
    assert_eq!(
        envelope.payload["session_id"],
        session.session_id.as_str()
    );
    w.supervisor.shutdown();
    w.bus.close();
}
