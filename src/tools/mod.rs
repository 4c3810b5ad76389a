//! Tool metadata: catalog, schema validation, group authorization.

pub mod catalog;
pub mod groups;

pub use catalog::{RegisteredTool, RiskLevel, ToolCatalog, ToolDeclaration};
pub use groups::GroupAuthorizer;
