//! Group authorization — tool-scoped group allowlists.
//!
//! Tools absent from the map are unrestricted. Tools present with an empty
//! allowed set are denied to every group. Tools with a non-empty set are
//! allowed only to the listed groups.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::types::GroupId;

/// Tool → allowed-groups policy.
#[derive(Debug, Default)]
pub struct GroupAuthorizer {
    rules: RwLock<HashMap<String, HashSet<String>>>,
}

impl GroupAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict a tool to the given groups. An empty iterator denies the
    /// tool to all groups.
    pub fn restrict<I, S>(&self, tool: &str, groups: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: HashSet<String> = groups.into_iter().map(Into::into).collect();
        self.rules
            .write()
            .expect("group rules poisoned")
            .insert(tool.to_string(), set);
    }

    /// Drop a tool's restriction, making it unrestricted again.
    pub fn clear(&self, tool: &str) {
        self.rules.write().expect("group rules poisoned").remove(tool);
    }

    /// Check whether `group` may invoke `tool`.
    pub fn is_allowed(&self, tool: &str, group: &GroupId) -> bool {
        let rules = self.rules.read().expect("group rules poisoned");
        match rules.get(tool) {
            None => true,
            Some(allowed) => allowed.contains(group.as_str()),
        }
    }

    /// The allowed groups for a tool, if restricted. Sorted for stable output.
    pub fn allowed_groups(&self, tool: &str) -> Option<Vec<String>> {
        let rules = self.rules.read().expect("group rules poisoned");
        rules.get(tool).map(|set| {
            let mut groups: Vec<String> = set.iter().cloned().collect();
            groups.sort();
            groups
        })
    }
}
