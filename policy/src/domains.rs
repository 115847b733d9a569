use url::Url;

/// Extract the lowercase hostname from a URL string. Returns `None` when the
/// value does not parse as a URL or has no host; callers treat `None` as "no
/// domain", which can never match an allowlist.
pub fn domain_of_url(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    let host = url.host_str()?;
    // `host_str` keeps the brackets around IPv6 literals.
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Some(host.to_ascii_lowercase())
}

/// True for IPv4 dotted-quad literals and anything containing `:` (IPv6).
pub fn is_ip_literal(domain: &str) -> bool {
    domain.parse::<std::net::Ipv4Addr>().is_ok() || domain.contains(':')
}

/// Match a hostname against one allowlist pattern.
///
/// - `*` matches any hostname that is **not** an IP literal. Agents that have
///   been talked into fetching `http://169.254.169.254/` or `http://[::1]/`
///   must not sail through a catch-all wildcard; an IP only passes when the
///   allowlist names it exactly.
/// - `*.suffix` matches `suffix` itself and any subdomain of it.
/// - Anything else is compared for (case-insensitive) equality.
pub fn domain_matches_pattern(domain: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return !is_ip_literal(domain);
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return domain.eq_ignore_ascii_case(suffix)
            || domain
                .to_ascii_lowercase()
                .ends_with(&format!(".{}", suffix.to_ascii_lowercase()));
    }
    domain.eq_ignore_ascii_case(pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_extraction() {
        assert_eq!(
            domain_of_url("https://API.GitHub.com/repos"),
            Some("api.github.com".to_string())
        );
        assert_eq!(
            domain_of_url("http://127.0.0.1:8080/admin"),
            Some("127.0.0.1".to_string())
        );
        assert_eq!(domain_of_url("http://[::1]/x"), Some("::1".to_string()));
        assert_eq!(domain_of_url("not a url"), None);
        assert_eq!(domain_of_url("/just/a/path"), None);
    }

    #[test]
    fn wildcard_never_matches_ip_literals() {
        assert!(domain_matches_pattern("example.com", "*"));
        assert!(!domain_matches_pattern("127.0.0.1", "*"));
        assert!(!domain_matches_pattern("169.254.169.254", "*"));
        assert!(!domain_matches_pattern("::1", "*"));
        assert!(!domain_matches_pattern("fe80::1", "*"));
    }

    #[test]
    fn suffix_patterns_cover_domain_and_subdomains() {
        assert!(domain_matches_pattern("github.com", "*.github.com"));
        assert!(domain_matches_pattern("api.github.com", "*.github.com"));
        assert!(!domain_matches_pattern("notgithub.com", "*.github.com"));
        assert!(!domain_matches_pattern("github.com.evil.io", "*.github.com"));
    }

    #[test]
    fn exact_patterns_are_case_insensitive() {
        assert!(domain_matches_pattern("example.com", "Example.COM"));
        assert!(!domain_matches_pattern("sub.example.com", "example.com"));
        // An explicit IP entry is the only way to allow an IP.
        assert!(domain_matches_pattern("127.0.0.1", "127.0.0.1"));
    }
}
