use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

/// Value domain of a dynamic list. Also used as the `matchType` of compiled
/// list predicates; a predicate may only reference lists of its own type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListType {
    Domains,
    Emails,
    Identifiers,
}

impl std::fmt::Display for ListType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ListType::Domains => "domains",
            ListType::Emails => "emails",
            ListType::Identifiers => "identifiers",
        };
        f.write_str(s)
    }
}

/// One entry of `dynamic-lists.json`, produced offline. The effective value
/// set seen by the engine is `(values ∪ manualAdditions) \ manualRemovals`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedList {
    pub r#type: ListType,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub manual_additions: Vec<String>,
    #[serde(default)]
    pub manual_removals: Vec<String>,
    #[serde(default)]
    pub resolved_at: Option<String>,
    #[serde(default)]
    pub input_hash: Option<String>,
}

impl ResolvedList {
    pub fn effective(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(self.values.len());
        for value in self.values.iter().chain(self.manual_additions.iter()) {
            if self.manual_removals.contains(value) || out.contains(value) {
                continue;
            }
            out.push(value.clone());
        }
        out
    }
}

/// All resolved lists, keyed by list name. Rules reference them as `@name`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResolvedLists {
    by_name: HashMap<String, ResolvedList>,
}

impl ResolvedLists {
    pub fn new(by_name: HashMap<String, ResolvedList>) -> Self {
        Self { by_name }
    }

    pub fn get(&self, name: &str) -> Option<&ResolvedList> {
        self.by_name.get(name)
    }
}

/// `@name` → `name`; anything else is a concrete value.
pub(crate) fn list_reference(value: &str) -> Option<&str> {
    value.strip_prefix('@')
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn effective_set_applies_additions_then_removals() {
        let list: ResolvedList = serde_json::from_value(json!({
            "type": "domains",
            "values": ["github.com", "crates.io", "internal.dev"],
            "manualAdditions": ["docs.rs", "crates.io"],
            "manualRemovals": ["internal.dev"],
            "resolvedAt": "2026-07-01T00:00:00Z",
            "inputHash": "abc123"
        }))
        .unwrap();
        assert_eq!(
            list.effective(),
            vec!["github.com", "crates.io", "docs.rs"]
        );
    }

    #[test]
    fn missing_optional_fields_default() {
        let lists: ResolvedLists = serde_json::from_value(json!({
            "teammates": { "type": "emails", "values": ["a@example.com"] }
        }))
        .unwrap();
        let list = lists.get("teammates").unwrap();
        assert_eq!(list.r#type, ListType::Emails);
        assert_eq!(list.effective(), vec!["a@example.com"]);
        assert!(lists.get("absent").is_none());
    }

    #[test]
    fn list_references_need_the_at_prefix() {
        assert_eq!(list_reference("@allowed-domains"), Some("allowed-domains"));
        assert_eq!(list_reference("github.com"), None);
    }
}
