//! Pipeline error taxonomy.
//!
//! Pipeline rejections are values that become wire responses, never host
//! failures. Each code carries a fixed default for the `retriable` flag;
//! handlers may only override `retriable` for `HANDLER_ERROR`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved error codes exposed to handlers and audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    UnknownTool,
    ValidationFailed,
    Unauthorized,
    RateLimited,
    ConfirmationDenied,
    ConfirmationTimeout,
    HandlerError,
    PluginError,
    PluginTimeout,
    PluginUnavailable,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UnknownTool => "UNKNOWN_TOOL",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::ConfirmationDenied => "CONFIRMATION_DENIED",
            ErrorCode::ConfirmationTimeout => "CONFIRMATION_TIMEOUT",
            ErrorCode::HandlerError => "HANDLER_ERROR",
            ErrorCode::PluginError => "PLUGIN_ERROR",
            ErrorCode::PluginTimeout => "PLUGIN_TIMEOUT",
            ErrorCode::PluginUnavailable => "PLUGIN_UNAVAILABLE",
        }
    }

    /// Fixed default for the advisory retry flag.
    pub fn default_retriable(&self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimited | ErrorCode::ConfirmationTimeout | ErrorCode::PluginTimeout
        )
    }

    /// True for every code a handler must not mint itself. Only
    /// `HANDLER_ERROR` is constructible from handler-provided codes.
    pub fn is_reserved(code: &str) -> bool {
        matches!(
            code,
            "UNKNOWN_TOOL"
                | "VALIDATION_FAILED"
                | "UNAUTHORIZED"
                | "RATE_LIMITED"
                | "CONFIRMATION_DENIED"
                | "CONFIRMATION_TIMEOUT"
                | "PLUGIN_ERROR"
                | "PLUGIN_TIMEOUT"
                | "PLUGIN_UNAVAILABLE"
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The six pipeline stages, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Construct,
    Topic,
    Payload,
    Authorize,
    Confirm,
    Route,
}

impl PipelineStage {
    /// 1-based stage number reported in error responses.
    pub fn number(&self) -> u8 {
        match self {
            PipelineStage::Construct => 1,
            PipelineStage::Topic => 2,
            PipelineStage::Payload => 3,
            PipelineStage::Authorize => 4,
            PipelineStage::Confirm => 5,
            PipelineStage::Route => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Construct => "construct",
            PipelineStage::Topic => "topic",
            PipelineStage::Payload => "payload",
            PipelineStage::Authorize => "authorize",
            PipelineStage::Confirm => "confirm",
            PipelineStage::Route => "route",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pipeline rejection: stage of origin, reserved code, advisory retry flag.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineError {
    pub code: ErrorCode,
    pub stage: PipelineStage,
    pub message: String,
    pub retriable: bool,
    /// Seconds until a retry may succeed; only set for `RATE_LIMITED`.
    pub retry_after: Option<f64>,
}

impl PipelineError {
    pub fn new(code: ErrorCode, stage: PipelineStage, message: impl Into<String>) -> Self {
        Self {
            code,
            stage,
            message: message.into(),
            retriable: code.default_retriable(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, seconds: f64) -> Self {
        self.retry_after = Some(seconds);
        self
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at stage {}: {}", self.code, self.stage, self.message)
    }
}

/// The only error type handlers can hand back across the core boundary.
///
/// The constructor is the spoofing guard: a reserved code is re-coded to
/// `HANDLER_ERROR` on the spot, so a handler cannot impersonate a pipeline
/// rejection no matter what string it supplies. Non-reserved domain codes
/// (for example `SMTP_FAILURE`) pass through verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    code: String,
    message: String,
    retriable: bool,
}

impl HandlerError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let code = if ErrorCode::is_reserved(&code) {
            ErrorCode::HandlerError.as_str().to_string()
        } else {
            code
        };
        Self {
            code,
            message: message.into(),
            retriable: false,
        }
    }

    /// Shorthand for a plain `HANDLER_ERROR`.
    pub fn message(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::HandlerError.as_str(), message)
    }

    /// Override the retry flag. Only honored for `HANDLER_ERROR`; other codes
    /// keep their fixed default.
    pub fn retriable(mut self, retriable: bool) -> Self {
        if self.code == ErrorCode::HandlerError.as_str() {
            self.retriable = retriable;
        }
        self
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn text(&self) -> &str {
        &self.message
    }

    pub fn is_retriable(&self) -> bool {
        self.retriable
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for HandlerError {}
