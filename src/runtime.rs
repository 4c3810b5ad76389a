//! Container runtime adapter surface.
//!
//! The core drives concrete engines (Docker, Podman, …) through this trait
//! only; engines ship as plugins. Credentials travel exclusively via
//! `SpawnOptions::stdin_payload` — never environment variables, image layers
//! or mounted files.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{ConnectionIdentity, ContainerId, GroupId, Result};

/// Options handed to the runtime when starting a container.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub image: String,
    pub group: GroupId,

    /// The socket path the container's tool shim binds; the transport-side
    /// trust anchor for everything the container sends.
    pub connection_identity: ConnectionIdentity,

    /// Host directory with the bus sockets, mounted into the container.
    pub socket_dir: PathBuf,

    /// Bytes piped to the container's stdin at boot (the credential block).
    pub stdin_payload: Option<Vec<u8>>,

    /// Engine-specific labels.
    pub labels: HashMap<String, String>,
}

/// Opaque reference to a started container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub container_id: ContainerId,
}

/// Coarse container state as reported by `inspect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Starting,
    Running,
    Exited,
    Unknown,
}

/// The capability set a container engine must provide.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Engine name for logs and diagnostics.
    fn name(&self) -> &str;

    /// Whether the engine can be used at all on this host.
    async fn is_available(&self) -> bool;

    /// Whether the image is present locally.
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Start a container. Returns once the engine has accepted the request;
    /// readiness is observed via `inspect`.
    async fn spawn(&self, options: SpawnOptions) -> Result<ContainerHandle>;

    /// Stop a container, giving it `timeout` to exit gracefully.
    async fn stop(&self, handle: &ContainerHandle, timeout: Duration) -> Result<()>;

    async fn is_running(&self, handle: &ContainerHandle) -> Result<bool>;

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerStatus>;
}
