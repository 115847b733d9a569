use std::collections::BTreeSet;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use serde_json::Value;

use crate::annotations::ToolAnnotation;
use crate::annotations::ToolAnnotations;
use crate::domains::domain_matches_pattern;
use crate::domains::domain_of_url;
use crate::error::PolicyError;
use crate::fs_paths::canonicalize_path;
use crate::fs_paths::is_contained_within;
use crate::lists::ListType;
use crate::lists::ResolvedLists;
use crate::lists::list_reference;
use crate::roles::ArgumentRole;
use crate::roles::RoleCategory;
use crate::rules::CompiledRule;
use crate::rules::Decision;
use crate::rules::ListPredicate;
use crate::rules::PolicyDecision;

pub const RULE_STRUCTURAL_UNKNOWN_TOOL: &str = "structural-unknown-tool";
pub const RULE_STRUCTURAL_PROTECTED_PATH: &str = "structural-protected-path";
pub const RULE_STRUCTURAL_DOMAIN_NOT_ALLOWLISTED: &str = "structural-domain-not-allowlisted";
pub const RULE_STRUCTURAL_SIDE_EFFECT_FREE: &str = "structural-side-effect-free";
pub const RULE_STRUCTURAL_SANDBOX_ALLOW: &str = "structural-sandbox-allow";
pub const RULE_DEFAULT_DENY: &str = "default-deny";

/// The slice of a tool call the engine inspects. Paths in `arguments` should
/// already be absolute (the proxy resolves relative paths against the session
/// sandbox before evaluation).
pub struct PolicyRequest<'a> {
    pub server: &'a str,
    pub tool: &'a str,
    pub arguments: &'a serde_json::Map<String, Value>,
}

/// Two-phase, default-deny policy evaluator. Immutable after construction;
/// `evaluate` is deterministic, never blocks and never fails.
#[derive(Debug)]
pub struct PolicyEngine {
    annotations: ToolAnnotations,
    rules: Vec<CompiledRule>,
    protected_paths: Vec<PathBuf>,
    sandbox_dir: Option<PathBuf>,
    server_allowed_domains: HashMap<String, Vec<String>>,
}

impl PolicyEngine {
    /// Build an engine from the loaded artifacts. All `@list` references are
    /// expanded here; an unresolved reference or a list/predicate type
    /// mismatch aborts construction.
    pub fn new(
        annotations: ToolAnnotations,
        rules: Vec<CompiledRule>,
        lists: &ResolvedLists,
        protected_paths: &[PathBuf],
        sandbox_dir: Option<&Path>,
        server_allowed_domains: HashMap<String, Vec<String>>,
    ) -> Result<Self, PolicyError> {
        annotations.validate()?;
        let rules = expand_rules(rules, lists)?;
        let protected_paths = protected_paths
            .iter()
            .map(|p| canonicalize_path(&p.to_string_lossy()))
            .collect();
        let sandbox_dir = sandbox_dir.map(|p| canonicalize_path(&p.to_string_lossy()));
        Ok(Self {
            annotations,
            rules,
            protected_paths,
            sandbox_dir,
            server_allowed_domains,
        })
    }

    pub fn annotations(&self) -> &ToolAnnotations {
        &self.annotations
    }

    pub fn sandbox_dir(&self) -> Option<&Path> {
        self.sandbox_dir.as_deref()
    }

    /// Classify one tool call. Phase 1 applies the structural invariants in
    /// order; phase 2 folds compiled rules per argument role, worst case
    /// winning, with default-deny when nothing matches.
    pub fn evaluate(&self, request: &PolicyRequest) -> PolicyDecision {
        let Some(annotation) = self.annotations.lookup(request.server, request.tool) else {
            return PolicyDecision {
                decision: Decision::Deny,
                rule: RULE_STRUCTURAL_UNKNOWN_TOOL.to_string(),
                reason: format!(
                    "tool `{}/{}` is not covered by the annotation map",
                    request.server, request.tool
                ),
            };
        };

        let collected = collect_role_arguments(annotation, request.arguments);

        if let Some(decision) = self.check_protected_paths(&collected) {
            return decision;
        }
        if let Some(decision) = self.check_server_domains(request.server, &collected) {
            return decision;
        }
        if !annotation.side_effects && !annotation.has_resource_arguments() {
            return PolicyDecision {
                decision: Decision::Allow,
                rule: RULE_STRUCTURAL_SIDE_EFFECT_FREE.to_string(),
                reason: "side-effect-free tool with no resource arguments".to_string(),
            };
        }
        if let Some(decision) = self.check_sandbox_allow(annotation, &collected) {
            return decision;
        }

        self.evaluate_compiled_rules(request, annotation, &collected)
    }

    /// S2: any path-category argument that resolves to (or under) a protected
    /// path is denied before any rule is consulted.
    fn check_protected_paths(&self, collected: &CollectedArguments) -> Option<PolicyDecision> {
        for arg in &collected.args {
            if arg.role.category() != RoleCategory::Path {
                continue;
            }
            let canonical = canonicalize_path(&arg.value);
            for protected in &self.protected_paths {
                if is_contained_within(&canonical, protected) {
                    return Some(PolicyDecision {
                        decision: Decision::Deny,
                        rule: RULE_STRUCTURAL_PROTECTED_PATH.to_string(),
                        reason: format!("{} is a protected path", canonical.display()),
                    });
                }
            }
        }
        None
    }

    /// S3: servers with a configured domain allowlist have every URL argument
    /// checked here. IP literals only pass on an exact allowlist entry.
    fn check_server_domains(
        &self,
        server: &str,
        collected: &CollectedArguments,
    ) -> Option<PolicyDecision> {
        let allowed = self.server_allowed_domains.get(server)?;
        for arg in &collected.args {
            if arg.role.category() != RoleCategory::Url {
                continue;
            }
            let domain = domain_of_url(&arg.value);
            let matched = match &domain {
                Some(domain) => allowed
                    .iter()
                    .any(|pattern| domain_matches_pattern(domain, pattern)),
                None => false,
            };
            if !matched {
                return Some(PolicyDecision {
                    decision: Decision::Escalate,
                    rule: RULE_STRUCTURAL_DOMAIN_NOT_ALLOWLISTED.to_string(),
                    reason: format!(
                        "`{}` is not in the allowed domains for server `{server}`",
                        domain.unwrap_or_else(|| arg.value.clone()),
                    ),
                });
            }
        }
        None
    }

    /// S5: every resource argument carries a sandbox-safe path role and every
    /// provided value resolves inside the session sandbox. Requires at least
    /// one provided resource value so that a call with none cannot slip
    /// through vacuously.
    fn check_sandbox_allow(
        &self,
        annotation: &ToolAnnotation,
        collected: &CollectedArguments,
    ) -> Option<PolicyDecision> {
        let sandbox = self.sandbox_dir.as_ref()?;
        if !collected.malformed_roles.is_empty() {
            return None;
        }
        let attached: Vec<ArgumentRole> = annotation
            .attached_roles()
            .into_iter()
            .filter(|role| role.is_resource_identifier())
            .collect();
        if attached.is_empty() || !attached.iter().all(|role| role.is_sandbox_safe()) {
            return None;
        }
        let resource_values: Vec<&RoleArgument> = collected
            .args
            .iter()
            .filter(|arg| arg.role.is_resource_identifier())
            .collect();
        if resource_values.is_empty() {
            return None;
        }
        for arg in resource_values {
            let canonical = canonicalize_path(&arg.value);
            if !is_contained_within(&canonical, sandbox) {
                return None;
            }
        }
        Some(PolicyDecision {
            decision: Decision::Allow,
            rule: RULE_STRUCTURAL_SANDBOX_ALLOW.to_string(),
            reason: "all resource paths are inside the session sandbox".to_string(),
        })
    }

    /// Phase 2: per-role relevance filtering, then worst-case folding within
    /// and across roles. Ties at the winning decision go to the first rule in
    /// file order.
    fn evaluate_compiled_rules(
        &self,
        request: &PolicyRequest,
        annotation: &ToolAnnotation,
        collected: &CollectedArguments,
    ) -> PolicyDecision {
        // `none` is not a resource identifier and is ignored by the engine.
        let attached: Vec<ArgumentRole> = annotation
            .attached_roles()
            .into_iter()
            .filter(|role| role.is_resource_identifier())
            .collect();

        let mut worst = Decision::Allow;
        let mut worst_set = false;
        let mut champion: Option<(usize, &CompiledRule)> = None;

        let mut fold_group = |relevant_for: Option<ArgumentRole>| {
            let mut group_decision: Option<Decision> = None;
            let mut group_champion: Option<(usize, &CompiledRule)> = None;
            for (index, rule) in self.rules.iter().enumerate() {
                let relevant = match relevant_for {
                    Some(role) => {
                        rule.condition.mentions_role(role) || rule.condition.is_role_agnostic()
                    }
                    None => rule.condition.is_role_agnostic(),
                };
                if !relevant || !rule_matches(rule, request, annotation, collected) {
                    continue;
                }
                let decision = Decision::from(rule.then);
                match group_decision {
                    Some(current) if decision.severity() <= current.severity() => {}
                    _ => {
                        group_decision = Some(decision);
                        group_champion = Some((index, rule));
                    }
                }
            }
            // No matching rule for this group: default-deny.
            let decision = group_decision.unwrap_or(Decision::Deny);
            let replace = !worst_set
                || decision.severity() > worst.severity()
                || (decision.severity() == worst.severity()
                    && match (group_champion, champion) {
                        (Some((new_index, _)), Some((old_index, _))) => new_index < old_index,
                        (Some(_), None) => false,
                        _ => false,
                    });
            if replace {
                worst = decision;
                worst_set = true;
                champion = if decision == Decision::Deny {
                    None
                } else {
                    group_champion
                };
            }
        };

        if attached.is_empty() {
            fold_group(None);
        } else {
            for role in attached {
                fold_group(Some(role));
            }
        }

        match champion {
            Some((_, rule)) if worst != Decision::Deny => PolicyDecision {
                decision: worst,
                rule: rule.name.clone(),
                reason: rule_reason(rule),
            },
            _ => PolicyDecision {
                decision: Decision::Deny,
                rule: RULE_DEFAULT_DENY.to_string(),
                reason: "no policy rule allows this call".to_string(),
            },
        }
    }
}

fn rule_reason(rule: &CompiledRule) -> String {
    if !rule.reason.is_empty() {
        rule.reason.clone()
    } else if !rule.description.is_empty() {
        rule.description.clone()
    } else {
        rule.name.clone()
    }
}

/// One provided argument value paired with one of its annotated roles.
struct RoleArgument {
    role: ArgumentRole,
    value: String,
}

struct CollectedArguments {
    args: Vec<RoleArgument>,
    /// Roles whose argument values were not strings (or arrays of strings).
    /// Predicates ranging over these roles can never match.
    malformed_roles: BTreeSet<ArgumentRole>,
}

fn collect_role_arguments(
    annotation: &ToolAnnotation,
    arguments: &serde_json::Map<String, Value>,
) -> CollectedArguments {
    let mut args = Vec::new();
    let mut malformed_roles = BTreeSet::new();
    for (name, roles) in &annotation.args {
        let Some(value) = arguments.get(name) else {
            continue;
        };
        let values: Option<Vec<String>> = match value {
            Value::String(s) => Some(vec![s.clone()]),
            Value::Array(items) => items
                .iter()
                .map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => None,
        };
        match values {
            Some(values) => {
                for role in roles {
                    for value in &values {
                        args.push(RoleArgument {
                            role: *role,
                            value: value.clone(),
                        });
                    }
                }
            }
            None => {
                for role in roles {
                    if role.is_resource_identifier() {
                        malformed_roles.insert(*role);
                    }
                }
            }
        }
    }
    CollectedArguments {
        args,
        malformed_roles,
    }
}

/// A rule matches iff every predicate of its condition is satisfied. Each
/// multi-role predicate quantifies universally over the provided argument
/// values bearing one of its roles.
fn rule_matches(
    rule: &CompiledRule,
    request: &PolicyRequest,
    annotation: &ToolAnnotation,
    collected: &CollectedArguments,
) -> bool {
    let condition = &rule.condition;

    if let Some(side_effects) = condition.side_effects {
        if annotation.side_effects != side_effects {
            return false;
        }
    }
    if let Some(tool_name) = &condition.tool_name {
        if tool_name != request.tool {
            return false;
        }
    }
    if let Some(server_name) = &condition.server_name {
        if server_name != request.server {
            return false;
        }
    }

    if let Some(paths) = &condition.paths {
        if paths
            .roles
            .iter()
            .any(|role| collected.malformed_roles.contains(role))
        {
            return false;
        }
        for arg in &collected.args {
            if !paths.roles.contains(&arg.role) {
                continue;
            }
            let canonical = canonicalize_path(&arg.value);
            if !is_contained_within(&canonical, &paths.within) {
                return false;
            }
        }
    }

    if let Some(domains) = &condition.domains {
        if domains
            .roles
            .iter()
            .any(|role| collected.malformed_roles.contains(role))
        {
            return false;
        }
        for arg in &collected.args {
            if !domains.roles.contains(&arg.role) {
                continue;
            }
            let Some(domain) = domain_of_url(&arg.value) else {
                return false;
            };
            if !domains
                .allowed
                .iter()
                .any(|pattern| domain_matches_pattern(&domain, pattern))
            {
                return false;
            }
        }
    }

    if let Some(list_predicates) = &condition.lists {
        for predicate in list_predicates {
            if !list_predicate_matches(predicate, collected) {
                return false;
            }
        }
    }

    true
}

fn list_predicate_matches(predicate: &ListPredicate, collected: &CollectedArguments) -> bool {
    if predicate
        .roles
        .iter()
        .any(|role| collected.malformed_roles.contains(role))
    {
        return false;
    }
    for arg in &collected.args {
        if !predicate.roles.contains(&arg.role) {
            continue;
        }
        let matched = match predicate.match_type {
            ListType::Emails => predicate
                .allowed
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(&arg.value)),
            ListType::Identifiers => predicate.allowed.iter().any(|allowed| allowed == &arg.value),
            ListType::Domains => {
                let domain = domain_of_url(&arg.value)
                    .unwrap_or_else(|| arg.value.trim().to_ascii_lowercase());
                predicate
                    .allowed
                    .iter()
                    .any(|pattern| domain_matches_pattern(&domain, pattern))
            }
        };
        if !matched {
            return false;
        }
    }
    true
}

/// Inline every `@list` reference into concrete allow values and resolve rule
/// `within` paths, so evaluation never consults the list table.
fn expand_rules(
    rules: Vec<CompiledRule>,
    lists: &ResolvedLists,
) -> Result<Vec<CompiledRule>, PolicyError> {
    let mut expanded = Vec::with_capacity(rules.len());
    for mut rule in rules {
        if let Some(domains) = &mut rule.condition.domains {
            domains.allowed =
                expand_values(&rule.name, &domains.allowed, lists, ListType::Domains)?;
        }
        if let Some(list_predicates) = &mut rule.condition.lists {
            for predicate in list_predicates.iter_mut() {
                predicate.allowed =
                    expand_values(&rule.name, &predicate.allowed, lists, predicate.match_type)?;
            }
        }
        if let Some(paths) = &mut rule.condition.paths {
            paths.within = canonicalize_path(&paths.within.to_string_lossy());
        }
        expanded.push(rule);
    }
    Ok(expanded)
}

fn expand_values(
    rule_name: &str,
    values: &[String],
    lists: &ResolvedLists,
    expected: ListType,
) -> Result<Vec<String>, PolicyError> {
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        match list_reference(value) {
            Some(name) => {
                let list = lists
                    .get(name)
                    .ok_or_else(|| PolicyError::UnresolvedListReference {
                        rule: rule_name.to_string(),
                        list: name.to_string(),
                    })?;
                if list.r#type != expected {
                    return Err(PolicyError::ListTypeMismatch {
                        rule: rule_name.to_string(),
                        list: name.to_string(),
                        actual: list.r#type.to_string(),
                        expected: expected.to_string(),
                    });
                }
                out.extend(list.effective());
            }
            None => out.push(value.clone()),
        }
    }
    Ok(out)
}
