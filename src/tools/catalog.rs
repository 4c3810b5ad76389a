//! Tool catalog — declarations and compiled argument validators.
//!
//! Owns tool *metadata* (not implementations — handlers live in the
//! dispatcher). Each registration compiles the declared JSON Schema once;
//! invocations validate against the precompiled validator.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::types::{Error, Result};

/// Declared risk level. High-risk tools require a confirmation decision
/// before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    High,
}

/// A tool declaration as registered by a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub risk_level: RiskLevel,
    /// JSON Schema for the arguments object. Must be `type: object` with
    /// `additionalProperties: false` literally present.
    pub arguments_schema: Value,
}

/// A registered tool with its compiled validator.
pub struct RegisteredTool {
    declaration: ToolDeclaration,
    validator: jsonschema::Validator,
}

impl RegisteredTool {
    pub fn declaration(&self) -> &ToolDeclaration {
        &self.declaration
    }

    pub fn name(&self) -> &str {
        &self.declaration.name
    }

    pub fn risk_level(&self) -> RiskLevel {
        self.declaration.risk_level
    }

    /// Validate an arguments object. Returns all violations (empty = valid).
    pub fn validate_arguments(&self, arguments: &Value) -> Vec<String> {
        let mut errors: Vec<String> = Vec::new();

        if let Some(path) = find_sentinel_key(arguments, "") {
            errors.push(format!("forbidden key at {}", path));
        }

        for err in self.validator.iter_errors(arguments) {
            let path = err.instance_path.to_string();
            if path.is_empty() {
                errors.push(err.to_string());
            } else {
                errors.push(format!("{} at {}", err, path));
            }
        }
        errors
    }
}

impl fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("declaration", &self.declaration)
            .finish_non_exhaustive()
    }
}

/// Object keys that enable prototype/sentinel pollution in downstream
/// consumers, rejected regardless of what the schema would permit.
const SENTINEL_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

fn find_sentinel_key(value: &Value, path: &str) -> Option<String> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                if SENTINEL_KEYS.contains(&key.as_str()) {
                    return Some(child_path);
                }
                if let Some(found) = find_sentinel_key(child, &child_path) {
                    return Some(found);
                }
            }
            None
        }
        Value::Array(items) => items
            .iter()
            .enumerate()
            .find_map(|(i, child)| find_sentinel_key(child, &format!("{}[{}]", path, i))),
        _ => None,
    }
}

/// In-memory tool catalog. Updates happen on plugin load/unload; invocations
/// are reads.
#[derive(Debug, Default)]
pub struct ToolCatalog {
    tools: RwLock<HashMap<String, Arc<RegisteredTool>>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Rejects empty or duplicate names and schemas that
    /// are not closed object schemas.
    pub fn register(&self, declaration: ToolDeclaration) -> Result<()> {
        if declaration.name.is_empty() {
            return Err(Error::validation("tool name cannot be empty"));
        }
        verify_closed_object_schema(&declaration.name, &declaration.arguments_schema)?;

        let validator = jsonschema::validator_for(&declaration.arguments_schema).map_err(|e| {
            Error::validation(format!(
                "tool {}: schema does not compile: {}",
                declaration.name, e
            ))
        })?;

        let mut tools = self.tools.write().expect("tool catalog poisoned");
        if tools.contains_key(&declaration.name) {
            return Err(Error::validation(format!(
                "tool {} is already registered",
                declaration.name
            )));
        }
        tools.insert(
            declaration.name.clone(),
            Arc::new(RegisteredTool {
                declaration,
                validator,
            }),
        );
        Ok(())
    }

    /// Remove a tool (plugin unload). Returns whether it existed.
    pub fn unregister(&self, name: &str) -> bool {
        self.tools
            .write()
            .expect("tool catalog poisoned")
            .remove(name)
            .is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegisteredTool>> {
        self.tools
            .read()
            .expect("tool catalog poisoned")
            .get(name)
            .cloned()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools
            .read()
            .expect("tool catalog poisoned")
            .contains_key(name)
    }

    /// All declarations, sorted by name.
    pub fn list(&self) -> Vec<ToolDeclaration> {
        let tools = self.tools.read().expect("tool catalog poisoned");
        let mut decls: Vec<ToolDeclaration> =
            tools.values().map(|t| t.declaration.clone()).collect();
        decls.sort_by(|a, b| a.name.cmp(&b.name));
        decls
    }

    pub fn len(&self) -> usize {
        self.tools.read().expect("tool catalog poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn verify_closed_object_schema(name: &str, schema: &Value) -> Result<()> {
    let obj = schema.as_object().ok_or_else(|| {
        Error::validation(format!("tool {}: arguments_schema must be an object", name))
    })?;

    if obj.get("type").and_then(|t| t.as_str()) != Some("object") {
        return Err(Error::validation(format!(
            "tool {}: arguments_schema must declare type \"object\"",
            name
        )));
    }
    if obj.get("additionalProperties") != Some(&Value::Bool(false)) {
        return Err(Error::validation(format!(
            "tool {}: arguments_schema must set additionalProperties to false",
            name
        )));
    }
    Ok(())
}
