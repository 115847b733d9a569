use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::lists::ListType;
use crate::roles::ArgumentRole;

/// What a compiled rule may decide. Rules can never deny; `deny` only arises
/// from structural invariants or default-deny fallthrough, which keeps every
/// deny in the system attributable to either a hardcoded invariant or the
/// absence of a matching rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Escalate,
}

/// Final classification of a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
    Escalate,
}

impl Decision {
    /// Worst-case folding order: `deny > escalate > allow`.
    pub(crate) fn severity(self) -> u8 {
        match self {
            Decision::Allow => 0,
            Decision::Escalate => 1,
            Decision::Deny => 2,
        }
    }
}

impl From<RuleAction> for Decision {
    fn from(action: RuleAction) -> Self {
        match action {
            RuleAction::Allow => Decision::Allow,
            RuleAction::Escalate => Decision::Escalate,
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Decision::Allow => "allow",
            Decision::Deny => "deny",
            Decision::Escalate => "escalate",
        };
        f.write_str(s)
    }
}

/// The engine's verdict for one tool call. `rule` names the compiled rule or
/// structural invariant that produced the decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub decision: Decision,
    pub rule: String,
    pub reason: String,
}

/// One rule of `compiled-policy.json`, in file order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledRule {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub principle: String,
    #[serde(rename = "if")]
    pub condition: Condition,
    pub then: RuleAction,
    #[serde(default)]
    pub reason: String,
}

/// Conjunction of optional predicates. An absent predicate is universally
/// true for its dimension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_effects: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<PathsPredicate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domains: Option<DomainsPredicate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lists: Option<Vec<ListPredicate>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

impl Condition {
    /// True when the condition has no resource-role-bearing predicate at all,
    /// making the rule relevant to every role.
    pub fn is_role_agnostic(&self) -> bool {
        self.paths.is_none() && self.domains.is_none() && self.lists.is_none()
    }

    /// True when some predicate of this condition ranges over `role`.
    pub fn mentions_role(&self, role: ArgumentRole) -> bool {
        if let Some(paths) = &self.paths {
            if paths.roles.contains(&role) {
                return true;
            }
        }
        if let Some(domains) = &self.domains {
            if domains.roles.contains(&role) {
                return true;
            }
        }
        if let Some(lists) = &self.lists {
            if lists.iter().any(|l| l.roles.contains(&role)) {
                return true;
            }
        }
        false
    }
}

/// Every argument bearing one of `roles` must canonicalize to a path that is
/// `within` or a descendant of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathsPredicate {
    pub roles: Vec<ArgumentRole>,
    pub within: PathBuf,
}

/// Every argument bearing one of `roles` must have a hostname matching one of
/// `allowed` (patterns or `@list` references, expanded at construction).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainsPredicate {
    pub roles: Vec<ArgumentRole>,
    pub allowed: Vec<String>,
}

/// Every argument bearing one of `roles` must equal one of `allowed` under
/// the named matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPredicate {
    pub roles: Vec<ArgumentRole>,
    pub allowed: Vec<String>,
    pub match_type: ListType,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn deny_is_unrepresentable_as_a_rule_action() {
        assert!(serde_json::from_value::<RuleAction>(json!("deny")).is_err());
        assert_eq!(
            serde_json::from_value::<RuleAction>(json!("escalate")).unwrap(),
            RuleAction::Escalate
        );
    }

    #[test]
    fn rules_parse_from_the_artifact_layout() {
        let rule: CompiledRule = serde_json::from_value(json!({
            "name": "allow-reads-in-project",
            "description": "Reads under the project tree are safe",
            "principle": "least-privilege",
            "if": {
                "sideEffects": false,
                "paths": { "roles": ["read-path"], "within": "/home/user/project" }
            },
            "then": "allow",
            "reason": "read inside the project tree"
        }))
        .unwrap();
        assert_eq!(rule.then, RuleAction::Allow);
        assert_eq!(rule.condition.side_effects, Some(false));
        assert!(rule.condition.mentions_role(ArgumentRole::ReadPath));
        assert!(!rule.condition.mentions_role(ArgumentRole::WritePath));
        assert!(!rule.condition.is_role_agnostic());
    }

    #[test]
    fn role_agnostic_means_no_resource_predicates() {
        let condition: Condition = serde_json::from_value(json!({
            "toolName": "git_status",
            "sideEffects": false
        }))
        .unwrap();
        assert!(condition.is_role_agnostic());
        assert!(!condition.mentions_role(ArgumentRole::ReadPath));
    }

    #[test]
    fn worst_case_ordering() {
        assert!(Decision::Deny.severity() > Decision::Escalate.severity());
        assert!(Decision::Escalate.severity() > Decision::Allow.severity());
    }
}
