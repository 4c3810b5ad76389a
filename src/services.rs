//! Core services — the query surface exposed to plugin handlers.
//!
//! Every group-scoped method takes the request context; there is no way to
//! query without one, and the context's group is always the scope regardless
//! of what the filter asks for.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::audit::{AuditFilter, AuditLog, AuditOutcome};
use crate::pipeline::context::RequestContext;
use crate::protocol::PipelineStage;
use crate::tools::{ToolCatalog, ToolDeclaration};
use crate::types::{CredentialsConfig, Error, Result};

/// Simplified outcome pair shown to plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimpleOutcome {
    Success,
    Error,
}

impl From<AuditOutcome> for SimpleOutcome {
    fn from(outcome: AuditOutcome) -> Self {
        match outcome {
            AuditOutcome::Routed | AuditOutcome::Sanitized => SimpleOutcome::Success,
            AuditOutcome::Rejected | AuditOutcome::Error => SimpleOutcome::Error,
        }
    }
}

/// Audit query filter accepted from plugins.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub correlation: Option<String>,
    pub topic: Option<String>,
    pub outcome: Option<SimpleOutcome>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub tail: Option<usize>,
}

/// Audit record as projected for plugins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    pub correlation: Option<String>,
    pub stage: PipelineStage,
    pub outcome: SimpleOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-plugin view of the core services.
#[derive(Debug, Clone)]
pub struct CoreServices {
    audit: Arc<AuditLog>,
    catalog: Arc<ToolCatalog>,
    credentials_dir: PathBuf,
    plugin: String,
}

impl CoreServices {
    pub fn for_plugin(
        audit: Arc<AuditLog>,
        catalog: Arc<ToolCatalog>,
        credentials: &CredentialsConfig,
        plugin: impl Into<String>,
    ) -> Self {
        Self {
            audit,
            catalog,
            credentials_dir: credentials.dir.clone(),
            plugin: plugin.into(),
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Audit entries scoped to the request's group.
    pub async fn get_audit_log(
        &self,
        ctx: &RequestContext,
        query: &AuditQuery,
    ) -> Result<Vec<AuditRecord>> {
        let outcomes = query.outcome.map(|o| match o {
            SimpleOutcome::Success => vec![AuditOutcome::Routed, AuditOutcome::Sanitized],
            SimpleOutcome::Error => vec![AuditOutcome::Rejected, AuditOutcome::Error],
        });
        let filter = AuditFilter {
            correlation: query.correlation.clone(),
            topic: query.topic.clone(),
            outcomes,
            since: query.since,
            until: query.until,
            tail: query.tail,
        };

        let entries = self.audit.query(ctx.group.as_str(), &filter).await?;
        Ok(entries
            .into_iter()
            .map(|e| AuditRecord {
                seq: e.seq,
                timestamp: e.timestamp,
                topic: e.topic,
                correlation: e.correlation,
                stage: e.stage,
                outcome: SimpleOutcome::from(e.outcome),
                reason: e.reason,
                error: e.error,
            })
            .collect())
    }

    /// All registered tools. Not group-scoped.
    pub fn get_tool_catalog(&self) -> Vec<ToolDeclaration> {
        self.catalog.list()
    }

    /// The current request context.
    pub fn get_session_info(&self, ctx: &RequestContext) -> RequestContext {
        ctx.clone()
    }

    /// Read a credential file from this plugin's credentials directory.
    pub async fn read_credential(&self, key: &str) -> Result<String> {
        validate_credential_key(key)?;

        let plugin_dir = self.credentials_dir.join(&self.plugin);
        let path = plugin_dir.join(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(value.trim_end_matches('\n').to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(format!(
                    "credential {:?} for plugin {:?} not found; expected a file at {}",
                    key,
                    self.plugin,
                    path.display()
                )))
            }
            Err(e) => Err(Error::internal(format!(
                "credential {:?} for plugin {:?} unreadable at {}: {}",
                key,
                self.plugin,
                path.display(),
                e
            ))),
        }
    }
}

/// Reject keys that could escape the plugin's credentials directory,
/// before any filesystem access.
fn validate_credential_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::validation("credential key cannot be empty"));
    }
    if key.contains('/') || key.contains('\\') || key.contains("..") || key.contains('\0') {
        return Err(Error::validation(format!(
            "credential key {:?} contains path separators",
            key
        )));
    }
    Ok(())
}
