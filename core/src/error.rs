use std::io;

use ironcurtain_policy::PolicyError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyErr>;

#[derive(Error, Debug)]
pub enum ProxyErr {
    /// Required startup environment variable is absent.
    #[error("missing environment variable: `{0}`")]
    MissingEnvVar(String),

    /// Startup environment variable is present but unusable.
    #[error("invalid value for `{var}`: {message}")]
    InvalidEnvVar { var: String, message: String },

    /// Two backing servers exported the same tool name; the flat tool
    /// namespace cannot represent that.
    #[error("tool `{tool}` is provided by both `{first}` and `{second}`")]
    ToolNameCollision {
        tool: String,
        first: String,
        second: String,
    },

    #[error("failed to load `{path}`: {message}")]
    Artifact { path: String, message: String },

    /// `SANDBOX_POLICY=enforce` refuses to run servers that are not started
    /// under OS-level sandboxing.
    #[error("server `{0}` is not sandboxed and SANDBOX_POLICY is `enforce`")]
    SandboxRequired(String),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
