use thiserror::Error;

/// Construction-time policy failures. `PolicyEngine::evaluate` itself never
/// returns an error; anything that could go wrong is caught while the engine
/// is being built so startup fails loudly instead of requests failing open.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("rule `{rule}` references unknown list `@{list}`")]
    UnresolvedListReference { rule: String, list: String },

    #[error("rule `{rule}` references list `@{list}` of type `{actual}`, expected `{expected}`")]
    ListTypeMismatch {
        rule: String,
        list: String,
        actual: String,
        expected: String,
    },

    #[error(
        "tool `{server}/{tool}` argument `{arg}` carries role `{role}`, which is only valid for servers {allowed:?}"
    )]
    RoleServerMismatch {
        server: String,
        tool: String,
        arg: String,
        role: String,
        allowed: Vec<String>,
    },
}
