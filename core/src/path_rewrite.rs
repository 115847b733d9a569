use mcp_types::CallToolResult;
use mcp_types::CallToolResultContent;

/// Container-mode path translation. The agent lives in a container where the
/// session sandbox is bind-mounted at `container_prefix` (e.g. `/workspace`);
/// argument paths are rewritten to the host sandbox before policy evaluation
/// and forwarding, and host paths in text results are rewritten back so the
/// agent only ever sees container paths.
pub struct PathRewriter {
    container_prefix: String,
    host_root: String,
}

impl PathRewriter {
    pub fn new(container_prefix: &str, host_root: &str) -> Self {
        Self {
            container_prefix: container_prefix.trim_end_matches('/').to_string(),
            host_root: host_root.trim_end_matches('/').to_string(),
        }
    }

    /// Inbound: rewrite a value that is the container prefix or a path under
    /// it. `/workspacefoo` shares the string prefix but not the path prefix
    /// and must pass through untouched.
    pub fn rewrite_argument(&self, value: &str) -> String {
        if value == self.container_prefix {
            return self.host_root.clone();
        }
        match value.strip_prefix(&self.container_prefix) {
            Some(rest) if rest.starts_with('/') => format!("{}{rest}", self.host_root),
            _ => value.to_string(),
        }
    }

    /// Outbound: replace host-sandbox occurrences inside text content blocks.
    /// Non-text blocks pass through; the input is never mutated.
    pub fn rewrite_result(&self, result: &CallToolResult) -> CallToolResult {
        let content = result
            .content
            .iter()
            .map(|block| match block {
                CallToolResultContent::TextContent(text) => {
                    let mut rewritten = text.clone();
                    rewritten.text = text.text.replace(&self.host_root, &self.container_prefix);
                    CallToolResultContent::TextContent(rewritten)
                }
                other => other.clone(),
            })
            .collect();
        CallToolResult {
            content,
            is_error: result.is_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_types::TextContent;
    use pretty_assertions::assert_eq;

    fn rewriter() -> PathRewriter {
        PathRewriter::new("/workspace", "/tmp/session-1/sandbox")
    }

    #[test]
    fn inbound_rewrites_only_true_prefix_matches() {
        let r = rewriter();
        assert_eq!(r.rewrite_argument("/workspace"), "/tmp/session-1/sandbox");
        assert_eq!(
            r.rewrite_argument("/workspace/src/main.rs"),
            "/tmp/session-1/sandbox/src/main.rs"
        );
        assert_eq!(r.rewrite_argument("/workspacefoo"), "/workspacefoo");
        assert_eq!(r.rewrite_argument("/elsewhere/x"), "/elsewhere/x");
    }

    #[test]
    fn outbound_rewrites_text_blocks_only() {
        let r = rewriter();
        let result = CallToolResult {
            content: vec![
                CallToolResultContent::TextContent(TextContent {
                    annotations: None,
                    text: "wrote /tmp/session-1/sandbox/out.txt".to_string(),
                    r#type: "text".to_string(),
                }),
                CallToolResultContent::ImageContent(mcp_types::ImageContent {
                    annotations: None,
                    data: "L3RtcC9zZXNzaW9uLTE=".to_string(),
                    mime_type: "image/png".to_string(),
                    r#type: "image".to_string(),
                }),
            ],
            is_error: None,
        };
        let rewritten = r.rewrite_result(&result);
        let CallToolResultContent::TextContent(text) = &rewritten.content[0] else {
            panic!("expected text block");
        };
        assert_eq!(text.text, "wrote /workspace/out.txt");
        assert_eq!(rewritten.content[1], result.content[1]);
        // Original untouched.
        let CallToolResultContent::TextContent(original) = &result.content[0] else {
            panic!("expected text block");
        };
        assert!(original.text.contains("/tmp/session-1/sandbox"));
    }

    #[test]
    fn rewrite_round_trips_for_container_paths() {
        let r = rewriter();
        for value in ["/workspace", "/workspace/a/b.txt", "/workspace/.git"] {
            let host = r.rewrite_argument(value);
            let back = host.replace("/tmp/session-1/sandbox", "/workspace");
            assert_eq!(back, value);
        }
    }
}
