use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

use crate::error::PolicyError;
use crate::roles::ArgumentRole;

/// Pipeline-produced metadata for one `(server, tool)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolAnnotation {
    #[serde(default)]
    pub comment: String,
    pub side_effects: bool,
    /// Argument name -> roles. Arguments not listed here are opaque.
    #[serde(default)]
    pub args: HashMap<String, Vec<ArgumentRole>>,
}

impl ToolAnnotation {
    /// All roles attached to any argument of this tool.
    pub fn attached_roles(&self) -> Vec<ArgumentRole> {
        let mut roles: Vec<ArgumentRole> = self.args.values().flatten().copied().collect();
        roles.sort();
        roles.dedup();
        roles
    }

    pub fn has_resource_arguments(&self) -> bool {
        self.args
            .values()
            .flatten()
            .any(|role| role.is_resource_identifier())
    }
}

/// The full annotation map, keyed by server name then tool name. This is the
/// engine's ground truth: a tool absent from the map is unknown and every
/// call to it is denied structurally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolAnnotations {
    by_server: HashMap<String, HashMap<String, ToolAnnotation>>,
}

impl ToolAnnotations {
    pub fn new(by_server: HashMap<String, HashMap<String, ToolAnnotation>>) -> Self {
        Self { by_server }
    }

    pub fn lookup(&self, server: &str, tool: &str) -> Option<&ToolAnnotation> {
        self.by_server.get(server)?.get(tool)
    }

    pub fn servers(&self) -> impl Iterator<Item = &String> {
        self.by_server.keys()
    }

    /// Reject annotations that attach a server-restricted role to a tool of
    /// some other server.
    pub fn validate(&self) -> Result<(), PolicyError> {
        for (server, tools) in &self.by_server {
            for (tool, annotation) in tools {
                for (arg, roles) in &annotation.args {
                    for role in roles {
                        if let Some(allowed) = role.server_restriction() {
                            if !allowed.contains(&server.as_str()) {
                                return Err(PolicyError::RoleServerMismatch {
                                    server: server.clone(),
                                    tool: tool.clone(),
                                    arg: arg.clone(),
                                    role: role.to_string(),
                                    allowed: allowed.iter().map(|s| s.to_string()).collect(),
                                });
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn annotations_from(value: serde_json::Value) -> ToolAnnotations {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn parses_the_artifact_layout() {
        let annotations = annotations_from(json!({
            "fs": {
                "read_file": {
                    "comment": "Reads a file from disk",
                    "sideEffects": false,
                    "args": { "path": ["read-path"] }
                }
            }
        }));
        let annotation = annotations.lookup("fs", "read_file").unwrap();
        assert!(!annotation.side_effects);
        assert_eq!(
            annotation.args.get("path"),
            Some(&vec![ArgumentRole::ReadPath])
        );
        assert!(annotations.lookup("fs", "write_file").is_none());
        assert!(annotations.lookup("git", "read_file").is_none());
    }

    #[test]
    fn history_roles_are_rejected_off_the_git_server() {
        let annotations = annotations_from(json!({
            "fs": {
                "rewrite": {
                    "sideEffects": true,
                    "args": { "repo": ["write-history"] }
                }
            }
        }));
        assert!(matches!(
            annotations.validate(),
            Err(PolicyError::RoleServerMismatch { .. })
        ));

        let annotations = annotations_from(json!({
            "git": {
                "git_commit": {
                    "sideEffects": true,
                    "args": { "repo": ["write-history"] }
                }
            }
        }));
        annotations.validate().unwrap();
    }

    #[test]
    fn attached_roles_are_deduplicated() {
        let annotations = annotations_from(json!({
            "fs": {
                "copy": {
                    "sideEffects": true,
                    "args": {
                        "from": ["read-path"],
                        "to": ["write-path"],
                        "backup": ["write-path"]
                    }
                }
            }
        }));
        let annotation = annotations.lookup("fs", "copy").unwrap();
        assert_eq!(
            annotation.attached_roles(),
            vec![ArgumentRole::ReadPath, ArgumentRole::WritePath]
        );
        assert!(annotation.has_resource_arguments());
    }
}
