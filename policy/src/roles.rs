use serde::Deserialize;
use serde::Serialize;

use crate::fs_paths::canonicalize_path;

/// What kind of resource an argument identifies. The set is closed: the
/// annotation pipeline may only emit these values, and every role has a fixed
/// category, normalization and sandbox classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArgumentRole {
    /// Filesystem read target.
    ReadPath,
    /// Filesystem write target.
    WritePath,
    /// Destructive filesystem target.
    DeletePath,
    /// Git working tree that will be mutated.
    WriteHistory,
    /// Git working tree that may be destructively mutated.
    DeleteHistory,
    /// Outbound HTTP fetch URL.
    FetchUrl,
    /// Remote repository URL.
    GitRemoteUrl,
    /// Not a resource identifier; ignored by the engine.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleCategory {
    Path,
    Url,
    Opaque,
}

impl ArgumentRole {
    pub fn category(self) -> RoleCategory {
        match self {
            ArgumentRole::ReadPath
            | ArgumentRole::WritePath
            | ArgumentRole::DeletePath
            | ArgumentRole::WriteHistory
            | ArgumentRole::DeleteHistory => RoleCategory::Path,
            ArgumentRole::FetchUrl | ArgumentRole::GitRemoteUrl => RoleCategory::Url,
            ArgumentRole::None => RoleCategory::Opaque,
        }
    }

    pub fn is_resource_identifier(self) -> bool {
        self != ArgumentRole::None
    }

    /// Only plain path roles may bypass compiled rules inside the session
    /// sandbox. The git-history roles are deliberately excluded: a history
    /// rewrite inside the sandbox is still a history rewrite.
    pub fn is_sandbox_safe(self) -> bool {
        matches!(
            self,
            ArgumentRole::ReadPath | ArgumentRole::WritePath | ArgumentRole::DeletePath
        )
    }

    /// Some roles only make sense on particular servers; annotations that
    /// attach them elsewhere are rejected at engine construction.
    pub fn server_restriction(self) -> Option<&'static [&'static str]> {
        match self {
            ArgumentRole::WriteHistory | ArgumentRole::DeleteHistory => Some(&["git"]),
            _ => None,
        }
    }

    /// Total normalization per role: path roles resolve to canonical absolute
    /// paths, URL roles are trimmed (hostname inspection happens separately),
    /// opaque values pass through.
    pub fn canonicalize(self, value: &str) -> String {
        match self.category() {
            RoleCategory::Path => canonicalize_path(value).to_string_lossy().into_owned(),
            RoleCategory::Url => value.trim().to_string(),
            RoleCategory::Opaque => value.to_string(),
        }
    }
}

impl std::fmt::Display for ArgumentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ArgumentRole::ReadPath => "read-path",
            ArgumentRole::WritePath => "write-path",
            ArgumentRole::DeletePath => "delete-path",
            ArgumentRole::WriteHistory => "write-history",
            ArgumentRole::DeleteHistory => "delete-history",
            ArgumentRole::FetchUrl => "fetch-url",
            ArgumentRole::GitRemoteUrl => "git-remote-url",
            ArgumentRole::None => "none",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn serde_uses_kebab_case() {
        let role: ArgumentRole = serde_json::from_str("\"read-path\"").unwrap();
        assert_eq!(role, ArgumentRole::ReadPath);
        let role: ArgumentRole = serde_json::from_str("\"git-remote-url\"").unwrap();
        assert_eq!(role, ArgumentRole::GitRemoteUrl);
        assert_eq!(
            serde_json::to_string(&ArgumentRole::DeleteHistory).unwrap(),
            "\"delete-history\""
        );
    }

    #[test]
    fn sandbox_safe_set_is_exactly_the_plain_path_roles() {
        let safe: Vec<ArgumentRole> = [
            ArgumentRole::ReadPath,
            ArgumentRole::WritePath,
            ArgumentRole::DeletePath,
            ArgumentRole::WriteHistory,
            ArgumentRole::DeleteHistory,
            ArgumentRole::FetchUrl,
            ArgumentRole::GitRemoteUrl,
            ArgumentRole::None,
        ]
        .into_iter()
        .filter(|r| r.is_sandbox_safe())
        .collect();
        assert_eq!(
            safe,
            vec![
                ArgumentRole::ReadPath,
                ArgumentRole::WritePath,
                ArgumentRole::DeletePath
            ]
        );
    }

    #[test]
    fn canonicalize_is_total_per_category() {
        assert_eq!(
            ArgumentRole::FetchUrl.canonicalize("  https://example.com/a  "),
            "https://example.com/a"
        );
        assert_eq!(ArgumentRole::None.canonicalize("free text"), "free text");

        let dir = tempfile::tempdir().unwrap();
        let base = std::fs::canonicalize(dir.path()).unwrap();
        let raw = format!("{}/x/../y.txt", base.display());
        assert_eq!(
            ArgumentRole::WritePath.canonicalize(&raw),
            base.join("y.txt").to_string_lossy()
        );
    }

    #[test]
    fn only_none_is_opaque() {
        assert!(!ArgumentRole::None.is_resource_identifier());
        assert_eq!(ArgumentRole::None.category(), RoleCategory::Opaque);
        assert_eq!(ArgumentRole::FetchUrl.category(), RoleCategory::Url);
        assert_eq!(ArgumentRole::WriteHistory.category(), RoleCategory::Path);
    }
}
