//! Container lifecycle management.
//!
//! spawn → await health → bind session → hand back a handle; teardown undoes
//! the same steps in reverse. A container that never becomes healthy is
//! stopped before the error surfaces, so no partial state outlives a failed
//! spawn.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::credentials::{serialize_credentials, Credential};
use crate::ratelimit::RateLimiter;
use crate::runtime::{ContainerHandle, ContainerRuntime, ContainerStatus, SpawnOptions};
use crate::session::{Session, SessionManager};
use crate::types::{ConnectionIdentity, Error, GroupId, LifecycleConfig, Result, SessionId};

/// What a caller asks for when spawning an agent container.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub image: String,
    pub group: GroupId,
    pub credentials: Vec<Credential>,
    pub labels: HashMap<String, String>,
}

/// A successfully spawned and session-bound container.
#[derive(Debug, Clone)]
pub struct SpawnedContainer {
    pub session: Arc<Session>,
    pub handle: ContainerHandle,
}

/// Drives the container runtime adapter and binds sessions.
pub struct ContainerLifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    sessions: Arc<SessionManager>,
    limiter: Arc<RateLimiter>,
    config: LifecycleConfig,
    socket_dir: PathBuf,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ContainerLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerLifecycleManager")
            .field("runtime", &self.runtime.name())
            .field("sessions", &self.sessions.count())
            .finish_non_exhaustive()
    }
}

impl ContainerLifecycleManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        sessions: Arc<SessionManager>,
        limiter: Arc<RateLimiter>,
        config: LifecycleConfig,
        socket_dir: PathBuf,
    ) -> Self {
        Self {
            runtime,
            sessions,
            limiter,
            config,
            socket_dir,
            cancel: CancellationToken::new(),
        }
    }

    /// Start a container, wait for it to become healthy, and bind a session.
    pub async fn spawn(&self, request: SpawnRequest) -> Result<SpawnedContainer> {
        if !self.runtime.is_available().await {
            return Err(Error::runtime(format!(
                "container runtime {} is not available",
                self.runtime.name()
            )));
        }
        if !self.runtime.image_exists(&request.image).await? {
            return Err(Error::not_found(format!(
                "image {} not found by runtime {}",
                request.image,
                self.runtime.name()
            )));
        }

        let identity = self.generate_identity();
        let stdin_payload = serialize_credentials(&request.credentials)?;

        let options = SpawnOptions {
            image: request.image.clone(),
            group: request.group.clone(),
            connection_identity: identity.clone(),
            socket_dir: self.socket_dir.clone(),
            stdin_payload: Some(stdin_payload.into_bytes()),
            labels: request.labels,
        };

        let handle = self.runtime.spawn(options).await?;
        tracing::info!(
            container = handle.container_id.as_str(),
            group = request.group.as_str(),
            "container spawned, awaiting health"
        );

        if let Err(e) = self.wait_healthy(&handle).await {
            tracing::warn!(
                container = handle.container_id.as_str(),
                "container never became healthy, tearing down: {}",
                e
            );
            self.teardown_container(&handle).await;
            return Err(e);
        }

        let session = match self
            .sessions
            .create(handle.container_id.clone(), request.group, identity)
        {
            Ok(session) => session,
            Err(e) => {
                self.teardown_container(&handle).await;
                return Err(e);
            }
        };

        tracing::info!(
            container = handle.container_id.as_str(),
            session = session.session_id.as_str(),
            "session bound"
        );
        Ok(SpawnedContainer { session, handle })
    }

    /// Stop a session's container and remove all of its state.
    pub async fn shutdown(&self, session_id: &SessionId) -> Result<()> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| Error::not_found(format!("unknown session: {}", session_id)))?;

        let handle = ContainerHandle {
            container_id: session.container_id.clone(),
        };
        self.teardown_container(&handle).await;
        self.sessions.delete(session_id)?;
        self.limiter.reset_session(session_id);
        tracing::info!(session = session_id.as_str(), "session shut down");
        Ok(())
    }

    /// Stop everything on process exit. In-flight health waits are
    /// cancelled first; shutdown failures are logged and do not stop the
    /// sweep.
    pub async fn shutdown_all(&self) {
        self.cancel.cancel();
        let sessions = self.sessions.list();
        let shutdowns = sessions
            .iter()
            .map(|session| self.shutdown(&session.session_id));
        for result in futures::future::join_all(shutdowns).await {
            if let Err(e) = result {
                tracing::warn!("session shutdown failed: {}", e);
            }
        }
    }

    fn generate_identity(&self) -> ConnectionIdentity {
        let path = self
            .socket_dir
            .join(format!("peer-{}.sock", uuid::Uuid::new_v4()));
        ConnectionIdentity::from_string(path.display().to_string())
            .expect("generated identity path is never empty")
    }

    async fn wait_healthy(&self, handle: &ContainerHandle) -> Result<()> {
        let wait = async {
            let mut interval = tokio::time::interval(self.config.health_poll_interval);
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        return Err(Error::cancelled("health wait cancelled by shutdown"));
                    }
                    _ = interval.tick() => {
                        match self.runtime.inspect(handle).await? {
                            ContainerStatus::Running => return Ok(()),
                            ContainerStatus::Exited => {
                                return Err(Error::runtime(format!(
                                    "container {} exited before becoming healthy",
                                    handle.container_id
                                )));
                            }
                            ContainerStatus::Starting | ContainerStatus::Unknown => {}
                        }
                    }
                }
            }
        };

        match tokio::time::timeout(self.config.health_check_timeout, wait).await {
            Ok(result) => result,
            Err(_elapsed) => Err(Error::timeout(format!(
                "container {} not healthy within {:?}",
                handle.container_id, self.config.health_check_timeout
            ))),
        }
    }

    async fn teardown_container(&self, handle: &ContainerHandle) {
        if let Err(e) = self.runtime.stop(handle, self.config.stop_timeout).await {
            tracing::warn!(
                container = handle.container_id.as_str(),
                "container stop failed: {}",
                e
            );
        }
    }
}
