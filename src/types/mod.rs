//! Core types: configuration, errors, strongly-typed IDs.

pub mod config;
pub mod errors;
pub mod ids;

pub use config::{
    AuditConfig, BusConfig, Config, CredentialsConfig, LifecycleConfig, ObservabilityConfig,
    PayloadLimits, PipelineConfig, RateLimitSettings, SessionStoreConfig,
};
pub use errors::{Error, Result};
pub use ids::{ConnectionIdentity, ContainerId, EnvelopeId, GroupId, SessionId};
