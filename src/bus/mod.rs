//! Dual-channel message bus over Unix datagram sockets.
//!
//! The host binds two sockets under the configured directory: `events.sock`
//! (fan-out pub/sub) and `requests.sock` (correlated request/response).
//! Containers connect from their own bound socket; the sender's path is the
//! per-peer connection identity the transport vouches for.
//!
//! Fan-out never blocks the publisher: every subscriber — in-process or
//! remote — gets its own bounded queue, and a full queue drops events for
//! that subscriber only. Remote subscribers manage their topic-prefix set
//! with control datagrams on the events socket.

pub mod codec;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::net::UnixDatagram;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::Envelope;
use crate::types::{BusConfig, ConnectionIdentity, Error, Result};

/// An event as seen by an in-process subscriber.
#[derive(Debug, Clone)]
pub struct EventMessage {
    pub topic: String,
    pub envelope: Envelope,
}

/// A raw request surfaced by the request channel. `identity` is the sender's
/// bound socket path — transport-assigned, never message content.
#[derive(Debug)]
pub struct InboundRequest {
    pub identity: ConnectionIdentity,
    pub bytes: Vec<u8>,
}

/// Handle for an in-process subscription.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<EventMessage>,
}

impl Subscription {
    /// Next matching event, or `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<EventMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<EventMessage> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug)]
struct LocalSubscriber {
    prefixes: Vec<String>,
    tx: mpsc::Sender<EventMessage>,
}

#[derive(Debug)]
struct RemoteSubscriber {
    prefixes: Vec<String>,
    tx: mpsc::Sender<bytes::Bytes>,
}

#[derive(Debug)]
struct Channels {
    event_sock: Arc<UnixDatagram>,
    request_sock: Arc<UnixDatagram>,
    local_subs: Mutex<Vec<LocalSubscriber>>,
    remote_subs: Arc<Mutex<HashMap<String, RemoteSubscriber>>>,
}

#[derive(Debug)]
enum BusState {
    Unbound,
    Bound(Arc<Channels>),
    Closed,
}

/// The dual-channel bus. `bind` before any `publish` or `subscribe`; `close`
/// is safe in any state.
#[derive(Debug)]
pub struct MessageBus {
    config: BusConfig,
    state: Mutex<BusState>,
    requests_rx: Mutex<Option<mpsc::Receiver<InboundRequest>>>,
    cancel: CancellationToken,
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BusState::Unbound),
            requests_rx: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Bind both sockets and start the channel reader tasks. Fails if the
    /// bus was already bound or closed.
    pub fn bind(&self) -> Result<()> {
        let mut state = self.state.lock().expect("bus state poisoned");
        match *state {
            BusState::Unbound => {}
            BusState::Bound(_) => return Err(Error::state("EventBus is already bound")),
            BusState::Closed => return Err(Error::state("EventBus is closed")),
        }

        std::fs::create_dir_all(&self.config.socket_dir)?;
        let events_path = self.config.events_path();
        let requests_path = self.config.requests_path();
        remove_stale_socket(&events_path)?;
        remove_stale_socket(&requests_path)?;

        let event_sock = Arc::new(UnixDatagram::bind(&events_path)?);
        let request_sock = Arc::new(UnixDatagram::bind(&requests_path)?);

        let (requests_tx, requests_rx) = mpsc::channel(self.config.request_queue_capacity);
        *self.requests_rx.lock().expect("bus requests poisoned") = Some(requests_rx);

        let channels = Arc::new(Channels {
            event_sock: event_sock.clone(),
            request_sock: request_sock.clone(),
            local_subs: Mutex::new(Vec::new()),
            remote_subs: Arc::new(Mutex::new(HashMap::new())),
        });

        tokio::spawn(run_request_reader(
            request_sock,
            requests_tx,
            self.config.max_datagram_bytes,
            self.cancel.clone(),
        ));
        tokio::spawn(run_control_reader(
            event_sock,
            channels.remote_subs.clone(),
            channels.event_sock.clone(),
            self.config.subscriber_queue_capacity,
            self.cancel.clone(),
        ));

        tracing::info!(
            events = %events_path.display(),
            requests = %requests_path.display(),
            "message bus bound"
        );

        *state = BusState::Bound(channels);
        Ok(())
    }

    fn channels(&self) -> Result<Arc<Channels>> {
        match &*self.state.lock().expect("bus state poisoned") {
            BusState::Bound(channels) => Ok(channels.clone()),
            BusState::Unbound | BusState::Closed => Err(Error::state("EventBus is not bound")),
        }
    }

    /// Take the inbound request stream. Yields once per bind.
    pub fn requests(&self) -> Result<mpsc::Receiver<InboundRequest>> {
        self.channels()?;
        self.requests_rx
            .lock()
            .expect("bus requests poisoned")
            .take()
            .ok_or_else(|| Error::state("request stream already taken"))
    }

    /// Register an in-process subscriber for the given topic prefixes.
    pub fn subscribe<I, S>(&self, prefixes: I) -> Result<Subscription>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channels = self.channels()?;
        let (tx, rx) = mpsc::channel(self.config.subscriber_queue_capacity);
        channels
            .local_subs
            .lock()
            .expect("bus subscribers poisoned")
            .push(LocalSubscriber {
                prefixes: prefixes.into_iter().map(Into::into).collect(),
                tx,
            });
        Ok(Subscription { rx })
    }

    /// Publish an event to every subscriber with a matching prefix.
    /// Best-effort: a subscriber whose queue is full misses this event.
    pub fn publish(&self, envelope: &Envelope) -> Result<()> {
        let channels = self.channels()?;
        let topic = envelope.topic.as_str();

        // In-process fan-out.
        {
            let mut subs = channels
                .local_subs
                .lock()
                .expect("bus subscribers poisoned");
            subs.retain(|sub| !sub.tx.is_closed());
            for sub in subs.iter() {
                if !matches_any(&sub.prefixes, topic) {
                    continue;
                }
                let message = EventMessage {
                    topic: topic.to_string(),
                    envelope: envelope.clone(),
                };
                if let Err(mpsc::error::TrySendError::Full(_)) = sub.tx.try_send(message) {
                    tracing::warn!(topic, "slow subscriber, dropping event");
                }
            }
        }

        // Remote fan-out: encode once, queue per peer.
        let remote_subs = channels
            .remote_subs
            .lock()
            .expect("bus remote subscribers poisoned");
        if !remote_subs.is_empty() {
            let json = serde_json::to_vec(envelope)?;
            let frame = codec::encode_event(topic, &json);
            for (peer, sub) in remote_subs.iter() {
                if !matches_any(&sub.prefixes, topic) {
                    continue;
                }
                if let Err(mpsc::error::TrySendError::Full(_)) = sub.tx.try_send(frame.clone()) {
                    tracing::warn!(topic, peer = %peer, "slow remote subscriber, dropping event");
                }
            }
        }
        Ok(())
    }

    /// Route a response datagram back to the originating connection identity.
    pub async fn respond(&self, identity: &ConnectionIdentity, envelope: &Envelope) -> Result<()> {
        let channels = self.channels()?;
        let bytes = serde_json::to_vec(envelope)?;
        channels
            .request_sock
            .send_to(&bytes, Path::new(identity.as_str()))
            .await?;
        Ok(())
    }

    /// Close all sockets and stop the reader tasks. Safe to call on an
    /// unbound or already-closed bus.
    pub fn close(&self) {
        self.cancel.cancel();
        let mut state = self.state.lock().expect("bus state poisoned");
        if matches!(*state, BusState::Bound(_)) {
            let _ = std::fs::remove_file(self.config.events_path());
            let _ = std::fs::remove_file(self.config.requests_path());
        }
        *state = BusState::Closed;
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn matches_any(prefixes: &[String], topic: &str) -> bool {
    prefixes.iter().any(|p| topic.starts_with(p.as_str()))
}

fn remove_stale_socket(path: &PathBuf) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Reader task for the request socket: surface `(identity, bytes)` pairs.
async fn run_request_reader(
    sock: Arc<UnixDatagram>,
    requests_tx: mpsc::Sender<InboundRequest>,
    max_datagram_bytes: usize,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; max_datagram_bytes + 1];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = sock.recv_from(&mut buf) => {
                let (n, addr) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("request socket read failed: {}", e);
                        break;
                    }
                };
                let Some(path) = addr.as_pathname() else {
                    tracing::warn!("dropping request from unnamed peer socket");
                    continue;
                };
                let identity = match ConnectionIdentity::from_string(path.display().to_string()) {
                    Ok(identity) => identity,
                    Err(_) => continue,
                };
                let request = InboundRequest {
                    identity,
                    bytes: buf[..n].to_vec(),
                };
                if requests_tx.try_send(request).is_err() {
                    tracing::warn!("request queue full, dropping inbound request");
                }
            }
        }
    }
}

/// Reader task for the events socket: apply subscribe/unsubscribe control
/// frames and maintain one sender task per remote peer.
async fn run_control_reader(
    sock: Arc<UnixDatagram>,
    remote_subs: Arc<Mutex<HashMap<String, RemoteSubscriber>>>,
    send_sock: Arc<UnixDatagram>,
    queue_capacity: usize,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = sock.recv_from(&mut buf) => {
                let (n, addr) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("events socket read failed: {}", e);
                        break;
                    }
                };
                let Some(peer) = addr.as_pathname().map(|p| p.display().to_string()) else {
                    continue;
                };
                let Some((subscribe, prefix)) = codec::decode_control(&buf[..n]) else {
                    tracing::debug!(peer = %peer, "ignoring malformed control frame");
                    continue;
                };

                let mut subs = remote_subs.lock().expect("bus remote subscribers poisoned");
                if subscribe {
                    let entry = subs.entry(peer.clone()).or_insert_with(|| {
                        let (tx, rx) = mpsc::channel(queue_capacity);
                        tokio::spawn(run_remote_sender(
                            send_sock.clone(),
                            peer.clone(),
                            rx,
                            cancel.clone(),
                        ));
                        RemoteSubscriber {
                            prefixes: Vec::new(),
                            tx,
                        }
                    });
                    if !entry.prefixes.contains(&prefix) {
                        entry.prefixes.push(prefix);
                    }
                } else if let Some(entry) = subs.get_mut(&peer) {
                    entry.prefixes.retain(|p| p != &prefix);
                    if entry.prefixes.is_empty() {
                        subs.remove(&peer);
                    }
                }
            }
        }
    }
}

/// Sender task draining one remote subscriber's queue. Ends when the
/// subscriber is removed (its queue closes) or the bus shuts down.
async fn run_remote_sender(
    sock: Arc<UnixDatagram>,
    peer: String,
    mut rx: mpsc::Receiver<bytes::Bytes>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sock.send_to(&frame, Path::new(&peer)).await {
                    tracing::debug!(peer = %peer, "event delivery failed: {}", e);
                }
            }
        }
    }
}
