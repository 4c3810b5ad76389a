//! Host-constructed envelopes.
//!
//! Every identity field is filled from trusted session state by the
//! constructors below; the only container-owned inputs are `topic`,
//! `correlation` and the request arguments, copied from a [`WireMessage`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::{HandlerError, PipelineError};
use super::wire::WireMessage;
use super::PROTOCOL_VERSION;
use crate::types::{ContainerId, EnvelopeId, Error, GroupId, Result};

/// Envelope kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    Event,
    Request,
    Response,
}

/// Error object carried in a response payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseError {
    pub code: String,
    pub message: String,

    /// 1-based originating stage; absent for handler-origin errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<u8>,

    pub retriable: bool,

    /// Seconds until a retry may succeed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<f64>,
}

impl From<&PipelineError> for ResponseError {
    fn from(err: &PipelineError) -> Self {
        Self {
            code: err.code.as_str().to_string(),
            message: err.message.clone(),
            stage: Some(err.stage.number()),
            retriable: err.retriable,
            retry_after: err.retry_after,
        }
    }
}

impl From<&HandlerError> for ResponseError {
    fn from(err: &HandlerError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.text().to_string(),
            stage: None,
            retriable: err.is_retriable(),
            retry_after: None,
        }
    }
}

/// The full internal message. Identity fields are host-owned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub id: EnvelopeId,
    pub version: u32,

    #[serde(rename = "type")]
    pub kind: EnvelopeType,

    pub topic: String,
    pub source: ContainerId,

    pub correlation: Option<String>,

    pub timestamp: DateTime<Utc>,
    pub group: GroupId,

    pub payload: Value,
}

impl Envelope {
    /// Construct a request envelope. Only `topic`, `correlation` and
    /// `arguments` come from the wire; identity comes from the arguments
    /// of this call, which the pipeline fills from session state.
    pub fn request(wire: &WireMessage, source: ContainerId, group: GroupId) -> Self {
        Self {
            id: EnvelopeId::new(),
            version: PROTOCOL_VERSION,
            kind: EnvelopeType::Request,
            topic: wire.topic.clone(),
            source,
            correlation: wire.correlation.clone(),
            timestamp: Utc::now(),
            group,
            payload: json!({ "arguments": Value::Object(wire.arguments.clone()) }),
        }
    }

    /// Construct a successful response paired with `request`.
    pub fn response_ok(request: &Envelope, result: Value) -> Self {
        Self {
            id: EnvelopeId::new(),
            version: PROTOCOL_VERSION,
            kind: EnvelopeType::Response,
            topic: request.topic.clone(),
            source: request.source.clone(),
            correlation: request.correlation.clone(),
            timestamp: Utc::now(),
            group: request.group.clone(),
            payload: json!({ "result": result, "error": Value::Null }),
        }
    }

    /// Construct an error response paired with `request`.
    pub fn response_error(request: &Envelope, error: ResponseError) -> Self {
        Self::error_parts(
            request.topic.clone(),
            request.correlation.clone(),
            request.source.clone(),
            request.group.clone(),
            error,
        )
    }

    /// Construct an error response from bare parts, for failures that happen
    /// before a request envelope exists (guard rejections, unparseable wire
    /// bytes).
    pub fn error_parts(
        topic: String,
        correlation: Option<String>,
        source: ContainerId,
        group: GroupId,
        error: ResponseError,
    ) -> Self {
        Self {
            id: EnvelopeId::new(),
            version: PROTOCOL_VERSION,
            kind: EnvelopeType::Response,
            topic,
            source,
            correlation,
            timestamp: Utc::now(),
            group,
            payload: json!({ "result": Value::Null, "error": error }),
        }
    }

    /// Construct an event envelope.
    pub fn event(topic: impl Into<String>, source: ContainerId, group: GroupId, payload: Value) -> Self {
        Self {
            id: EnvelopeId::new(),
            version: PROTOCOL_VERSION,
            kind: EnvelopeType::Event,
            topic: topic.into(),
            source,
            correlation: None,
            timestamp: Utc::now(),
            group,
            payload,
        }
    }

    /// Reject an envelope whose protocol version does not match ours.
    pub fn verify_version(&self) -> Result<()> {
        if self.version != PROTOCOL_VERSION {
            return Err(Error::validation(format!(
                "unsupported protocol version {} (expected {})",
                self.version, PROTOCOL_VERSION
            )));
        }
        Ok(())
    }

    /// The error object of a response payload, if any.
    pub fn error(&self) -> Option<ResponseError> {
        let err = self.payload.get("error")?;
        if err.is_null() {
            return None;
        }
        serde_json::from_value(err.clone()).ok()
    }

    /// The result value of a successful response payload, if any.
    pub fn result(&self) -> Option<&Value> {
        match self.payload.get("result") {
            Some(Value::Null) | None => None,
            some => some,
        }
    }
}
