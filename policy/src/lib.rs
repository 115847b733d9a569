//! Policy evaluation for mediated tool calls.
//!
//! The engine classifies each tool call into `allow | deny | escalate` in two
//! phases: hardcoded structural invariants first (unknown tools, protected
//! paths, per-server domain allowlists, sandbox containment), then compiled
//! rules evaluated per argument role with worst-case folding. Everything here
//! is synchronous and infallible at evaluation time; all fallible work
//! (artifact parsing, `@list` expansion, validation) happens at construction.

mod annotations;
mod domains;
mod engine;
mod error;
mod fs_paths;
mod lists;
mod roles;
mod rules;

pub use annotations::ToolAnnotation;
pub use annotations::ToolAnnotations;
pub use domains::domain_matches_pattern;
pub use domains::domain_of_url;
pub use domains::is_ip_literal;
pub use engine::PolicyEngine;
pub use engine::PolicyRequest;
pub use engine::RULE_DEFAULT_DENY;
pub use engine::RULE_STRUCTURAL_DOMAIN_NOT_ALLOWLISTED;
pub use engine::RULE_STRUCTURAL_PROTECTED_PATH;
pub use engine::RULE_STRUCTURAL_SANDBOX_ALLOW;
pub use engine::RULE_STRUCTURAL_SIDE_EFFECT_FREE;
pub use engine::RULE_STRUCTURAL_UNKNOWN_TOOL;
pub use error::PolicyError;
pub use fs_paths::canonicalize_path;
pub use fs_paths::is_contained_within;
pub use lists::ListType;
pub use lists::ResolvedList;
pub use lists::ResolvedLists;
pub use roles::ArgumentRole;
pub use roles::RoleCategory;
pub use rules::CompiledRule;
pub use rules::Condition;
pub use rules::Decision;
pub use rules::DomainsPredicate;
pub use rules::ListPredicate;
pub use rules::PathsPredicate;
pub use rules::PolicyDecision;
pub use rules::RuleAction;
