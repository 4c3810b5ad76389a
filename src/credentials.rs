//! Credential delivery for container boot.
//!
//! Credentials are piped to the container's standard input as a
//! newline-delimited block: one `NAME=VALUE` line per credential, terminated
//! by an empty line. Stdin is the only channel; the serializer refuses names
//! and values the entrypoint could misparse.

use crate::types::{Error, Result};

/// A named secret to deliver at boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub name: String,
    pub value: String,
}

impl Credential {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Serialize credentials into the stdin block.
///
/// Names must match `[A-Za-z_][A-Za-z0-9_]*`; values must not contain
/// newlines. Values may contain `=` — the entrypoint splits on the first one.
pub fn serialize_credentials(credentials: &[Credential]) -> Result<String> {
    let mut out = String::new();
    for credential in credentials {
        if !is_valid_name(&credential.name) {
            return Err(Error::validation(format!(
                "credential name {:?} is not a valid identifier",
                credential.name
            )));
        }
        if credential.value.contains('\n') || credential.value.contains('\r') {
            return Err(Error::validation(format!(
                "credential {:?} has a value containing a newline",
                credential.name
            )));
        }
        out.push_str(&credential.name);
        out.push('=');
        out.push_str(&credential.value);
        out.push('\n');
    }
    out.push('\n');
    Ok(out)
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_name_value_lines_with_terminator() {
        let block = serialize_credentials(&[
            Credential::new("ANTHROPIC_API_KEY", "sk-ant-test"),
            Credential::new("OTHER", "x=y"),
        ])
        .unwrap();
        assert_eq!(block, "ANTHROPIC_API_KEY=sk-ant-test\nOTHER=x=y\n\n");
    }

    #[test]
    fn empty_set_serializes_to_bare_terminator() {
        assert_eq!(serialize_credentials(&[]).unwrap(), "\n");
    }

    #[test]
    fn rejects_invalid_names() {
        for name in ["BAD-NAME", "1LEADING_DIGIT", "WITH SPACE", "", "A.B"] {
            let err = serialize_credentials(&[Credential::new(name, "v")]).unwrap_err();
            assert!(
                err.to_string().contains("not a valid identifier"),
                "name {:?} accepted",
                name
            );
        }
    }

    #[test]
    fn accepts_underscore_names() {
        assert!(serialize_credentials(&[Credential::new("_PRIVATE", "v")]).is_ok());
    }

    #[test]
    fn rejects_values_with_newlines() {
        assert!(serialize_credentials(&[Credential::new("KEY", "line1\nline2")]).is_err());
        assert!(serialize_credentials(&[Credential::new("KEY", "line1\rline2")]).is_err());
    }
}
