//! Configuration structures.
//!
//! Configuration is assembled by the embedding host; file parsing lives
//! outside the core. Every subsystem gets its own struct with serde derives
//! and sensible defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Global supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Message bus transport configuration.
    #[serde(default)]
    pub bus: BusConfig,

    /// Inbound message size/depth guards.
    #[serde(default)]
    pub limits: PayloadLimits,

    /// Default rate-limit settings (per-group overrides are set at runtime).
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    /// Audit log configuration.
    #[serde(default)]
    pub audit: AuditConfig,

    /// Container lifecycle configuration.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Pipeline timeouts.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Plugin credential delivery.
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Persisted LLM-session store.
    #[serde(default)]
    pub session_store: SessionStoreConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Message bus transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Directory holding the host's datagram sockets and peer sockets.
    pub socket_dir: PathBuf,

    /// Maximum accepted datagram size in bytes (caps a single wire message
    /// before any parsing happens).
    pub max_datagram_bytes: usize,

    /// Bounded queue capacity per subscriber. A full queue drops events for
    /// that subscriber only.
    pub subscriber_queue_capacity: usize,

    /// Bounded queue capacity for inbound requests surfaced to the supervisor.
    pub request_queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from("/run/carapace"),
            max_datagram_bytes: 2 * 1024 * 1024,
            subscriber_queue_capacity: 256,
            request_queue_capacity: 1024,
        }
    }
}

impl BusConfig {
    /// Path of the events (pub/sub) socket.
    pub fn events_path(&self) -> PathBuf {
        self.socket_dir.join("events.sock")
    }

    /// Path of the request/response socket.
    pub fn requests_path(&self) -> PathBuf {
        self.socket_dir.join("requests.sock")
    }
}

/// Size and nesting guards applied to inbound wire messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadLimits {
    /// Maximum raw message size in bytes, checked before parsing.
    pub max_raw_bytes: usize,

    /// Maximum serialized payload size in bytes.
    pub max_payload_bytes: usize,

    /// Maximum size of any single string field in bytes.
    pub max_field_bytes: usize,

    /// Maximum JSON nesting depth, checked before parsing.
    pub max_depth: usize,
}

impl Default for PayloadLimits {
    fn default() -> Self {
        Self {
            max_raw_bytes: 1024 * 1024,
            max_payload_bytes: 1024 * 1024,
            max_field_bytes: 100 * 1024,
            max_depth: 64,
        }
    }
}

/// Token-bucket rate-limit settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Sustained refill rate.
    pub requests_per_minute: u32,

    /// Bucket capacity (burst size).
    pub burst_size: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst_size: 10,
        }
    }
}

/// Audit log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Directory holding one `<group>.jsonl` file per group.
    pub dir: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/carapace/audit"),
        }
    }
}

/// Container lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Maximum time to wait for a spawned container to become healthy.
    #[serde(with = "humantime_serde")]
    pub health_check_timeout: Duration,

    /// Interval between runtime `inspect` polls while waiting for health.
    #[serde(with = "humantime_serde")]
    pub health_poll_interval: Duration,

    /// Grace period handed to the runtime when stopping a container.
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            health_check_timeout: Duration::from_secs(90),
            health_poll_interval: Duration::from_millis(250),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// Pipeline timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// How long stage 5 waits for a confirmation decision on high-risk tools.
    #[serde(with = "humantime_serde")]
    pub confirmation_timeout: Duration,

    /// How long stage 6 waits for a handler before yielding PLUGIN_TIMEOUT.
    #[serde(with = "humantime_serde")]
    pub handler_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout: Duration::from_secs(120),
            handler_timeout: Duration::from_secs(60),
        }
    }
}

/// Plugin credential delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Root directory holding one subdirectory of credential files per plugin.
    pub dir: PathBuf,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/etc/carapace/credentials"),
        }
    }
}

/// Persisted LLM-session store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStoreConfig {
    /// Path of the JSON store file.
    pub path: PathBuf,

    /// Rows older than this (by last use) are skipped by `get_latest`.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/carapace/llm_sessions.json"),
            ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
