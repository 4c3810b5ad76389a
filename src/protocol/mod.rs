//! Wire protocol: the trust boundary between containers and the host.
//!
//! A container owns exactly three fields on the wire (`topic`, `correlation`,
//! `arguments`); everything else in an [`Envelope`] is filled from host state.
//! The split is structural: [`WireMessage`] physically lacks identity fields,
//! so adversarial bytes injecting `id`/`source`/`group` keys have nowhere to
//! land.

pub mod envelope;
pub mod error;
pub mod wire;

pub use envelope::{Envelope, EnvelopeType, ResponseError};
pub use error::{ErrorCode, HandlerError, PipelineError, PipelineStage};
pub use wire::WireMessage;

/// Protocol version stamped on every envelope. Incoming envelopes on internal
/// paths carrying a different version are rejected.
pub const PROTOCOL_VERSION: u32 = 1;

/// Topic prefix for tool invocation requests.
pub const TOOL_INVOKE_PREFIX: &str = "tool.invoke.";

/// Parse a `tool.invoke.<name>` topic, returning the tool name.
///
/// Returns `None` if the prefix is missing or the name is empty.
pub fn parse_tool_invoke(topic: &str) -> Option<&str> {
    match topic.strip_prefix(TOOL_INVOKE_PREFIX) {
        Some(name) if !name.is_empty() => Some(name),
        _ => None,
    }
}
