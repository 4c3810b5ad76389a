//! Container-owned wire message and pre-parse guards.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::PayloadLimits;

/// The three-field message a container is allowed to put on the wire.
///
/// Deserialization ignores unknown keys, so a container injecting `id`,
/// `source`, `group` or any other host-owned field changes nothing: the
/// struct has no slot for them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireMessage {
    pub topic: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<String>,

    #[serde(default)]
    pub arguments: Map<String, Value>,
}

/// Reason a raw message was refused before or during parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireRejection {
    TooLarge { size: usize, limit: usize },
    TooDeep { limit: usize },
    Malformed(String),
}

impl std::fmt::Display for WireRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireRejection::TooLarge { size, limit } => {
                write!(f, "message of {} bytes exceeds limit of {} bytes", size, limit)
            }
            WireRejection::TooDeep { limit } => {
                write!(f, "message nesting exceeds maximum depth of {}", limit)
            }
            WireRejection::Malformed(msg) => write!(f, "malformed message: {}", msg),
        }
    }
}

impl WireMessage {
    /// Parse raw bytes into a wire message, enforcing the size and nesting
    /// guards before handing anything to the JSON parser.
    pub fn parse(raw: &[u8], limits: &PayloadLimits) -> Result<Self, WireRejection> {
        if raw.len() > limits.max_raw_bytes {
            return Err(WireRejection::TooLarge {
                size: raw.len(),
                limit: limits.max_raw_bytes,
            });
        }
        if !within_depth(raw, limits.max_depth) {
            return Err(WireRejection::TooDeep {
                limit: limits.max_depth,
            });
        }
        serde_json::from_slice(raw).map_err(|e| WireRejection::Malformed(e.to_string()))
    }
}

/// Scan raw JSON bytes and check bracket nesting without building a DOM.
///
/// Tracks string/escape state so brackets inside string literals don't count.
fn within_depth(raw: &[u8], max_depth: usize) -> bool {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for &b in raw {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => {
                depth += 1;
                if depth > max_depth {
                    return false;
                }
            }
            b'}' | b']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> PayloadLimits {
        PayloadLimits::default()
    }

    #[test]
    fn parse_minimal_request() {
        let raw = br#"{"topic": "tool.invoke.echo", "correlation": "c1", "arguments": {}}"#;
        let msg = WireMessage::parse(raw, &limits()).unwrap();
        assert_eq!(msg.topic, "tool.invoke.echo");
        assert_eq!(msg.correlation.as_deref(), Some("c1"));
        assert!(msg.arguments.is_empty());
    }

    #[test]
    fn identity_keys_on_the_wire_are_dropped() {
        let raw = br#"{
            "topic": "tool.invoke.echo",
            "correlation": "c1",
            "arguments": {},
            "id": "attacker-id",
            "source": "attacker-container",
            "group": "admin",
            "type": "event",
            "timestamp": "1970-01-01T00:00:00Z",
            "version": 99
        }"#;
        let msg = WireMessage::parse(raw, &limits()).unwrap();
        // Round-trip back to JSON: only the three owned fields survive.
        let value = serde_json::to_value(&msg).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 3);
        assert!(obj.contains_key("topic"));
        assert!(obj.contains_key("correlation"));
        assert!(obj.contains_key("arguments"));
    }

    #[test]
    fn oversized_message_rejected_before_parse() {
        let mut limits = limits();
        limits.max_raw_bytes = 64;
        let raw = vec![b'x'; 65];
        match WireMessage::parse(&raw, &limits) {
            Err(WireRejection::TooLarge { size: 65, limit: 64 }) => {}
            other => panic!("expected TooLarge, got {:?}", other),
        }
    }

    #[test]
    fn deep_nesting_rejected_before_parse() {
        let mut limits = limits();
        limits.max_depth = 8;
        let nested = format!(
            r#"{{"topic": "t", "arguments": {{"a": {}{}{}}}}}"#,
            "[".repeat(10),
            "1",
            "]".repeat(10),
        );
        match WireMessage::parse(nested.as_bytes(), &limits) {
            Err(WireRejection::TooDeep { limit: 8 }) => {}
            other => panic!("expected TooDeep, got {:?}", other),
        }
    }

    #[test]
    fn brackets_inside_strings_do_not_count_as_nesting() {
        let mut limits = limits();
        limits.max_depth = 4;
        let raw = br#"{"topic": "t", "arguments": {"a": "[[[[[[[[[[{{{{{"}}"#;
        assert!(WireMessage::parse(raw, &limits).is_ok());
    }

    #[test]
    fn malformed_json_rejected() {
        let raw = b"{not json";
        assert!(matches!(
            WireMessage::parse(raw, &limits()),
            Err(WireRejection::Malformed(_))
        ));
    }

    #[test]
    fn missing_topic_rejected() {
        let raw = br#"{"correlation": "c1"}"#;
        assert!(matches!(
            WireMessage::parse(raw, &limits()),
            Err(WireRejection::Malformed(_))
        ));
    }
}
