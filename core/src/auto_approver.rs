use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use tracing::warn;

use crate::flags::AUTO_APPROVE_API_BASE;
use crate::flags::AUTO_APPROVE_TIMEOUT_MS;

/// The only two things the auto-approver can say. There is deliberately no
/// deny variant: a convenience layer must not be able to overrule a human by
/// refusing on their behalf, so every failure mode collapses to `Escalate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoApproveVerdict {
    Approve,
    Escalate,
}

/// Optional LLM layer consulted when the policy says `escalate`. It sees the
/// user's latest message, the tool being called, the escalation reason and a
/// sanitized view of the resource arguments, and may wave the call through
/// when the user plainly just asked for it.
pub struct AutoApprover {
    model_id: String,
    api_key: String,
    client: reqwest::Client,
}

const PROMPT_PREAMBLE: &str = "You are reviewing a single tool call that a security policy \
flagged for human approval. Approve it only when the user's own message clearly asked for \
exactly this action; otherwise escalate to the human. Respond with only a JSON object, \
either {\"decision\": \"approve\"} or {\"decision\": \"escalate\"}.";

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct VerdictPayload {
    decision: String,
}

impl AutoApprover {
    pub fn new(model_id: String, api_key: String) -> Self {
        Self {
            model_id,
            api_key,
            client: reqwest::Client::new(),
        }
    }

    /// Review one escalated call. Infallible by construction: any error along
    /// the way (missing user context, HTTP failure, timeout, malformed or
    /// unexpected model output) is an `Escalate`.
    pub async fn review(
        &self,
        user_message: Option<&str>,
        qualified_tool: &str,
        escalation_reason: &str,
        resource_arguments: &[(String, String)],
    ) -> AutoApproveVerdict {
        let Some(user_message) = user_message else {
            debug!("no user context available; escalating");
            return AutoApproveVerdict::Escalate;
        };

        let mut prompt = format!(
            "{PROMPT_PREAMBLE}\n\nUser's most recent message:\n{}\n\nTool call: {qualified_tool}\nPolicy reason: {}\n",
            sanitize(user_message),
            sanitize(escalation_reason),
        );
        if !resource_arguments.is_empty() {
            prompt.push_str("Resource arguments:\n");
            for (name, value) in resource_arguments {
                prompt.push_str(&format!("- {name}: {}\n", sanitize(value)));
            }
        }

        let body = json!({
            "model": self.model_id,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0,
        });
        let request = self
            .client
            .post(format!("{}/chat/completions", *AUTO_APPROVE_API_BASE))
            .bearer_auth(&self.api_key)
            .timeout(*AUTO_APPROVE_TIMEOUT_MS)
            .json(&body);

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("auto-approver request failed: {e}");
                return AutoApproveVerdict::Escalate;
            }
        };
        if !response.status().is_success() {
            warn!("auto-approver got status {}", response.status());
            return AutoApproveVerdict::Escalate;
        }
        let completion: ChatCompletionResponse = match response.json().await {
            Ok(completion) => completion,
            Err(e) => {
                warn!("auto-approver response did not parse: {e}");
                return AutoApproveVerdict::Escalate;
            }
        };
        let content = completion
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_deref())
            .unwrap_or("");
        parse_verdict(content)
    }
}

/// Interpret the model's reply. Only an unambiguous `approve` approves.
fn parse_verdict(content: &str) -> AutoApproveVerdict {
    let trimmed = content.trim();
    let decision = match serde_json::from_str::<VerdictPayload>(trimmed) {
        Ok(payload) => payload.decision,
        Err(_) => trimmed.to_string(),
    };
    match decision.trim().to_ascii_lowercase().as_str() {
        "approve" => AutoApproveVerdict::Approve,
        "escalate" => AutoApproveVerdict::Escalate,
        other => {
            debug!("unexpected auto-approver output {other:?}; escalating");
            AutoApproveVerdict::Escalate
        }
    }
}

/// Strip control characters and truncate to 200 chars so argument values
/// cannot smuggle prompt structure into the review request.
fn sanitize(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_control())
        .take(200)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn only_a_clean_approve_approves() {
        assert_eq!(
            parse_verdict(r#"{"decision": "approve"}"#),
            AutoApproveVerdict::Approve
        );
        assert_eq!(
            parse_verdict(r#"{"decision": "escalate"}"#),
            AutoApproveVerdict::Escalate
        );
        assert_eq!(parse_verdict("approve"), AutoApproveVerdict::Approve);
        assert_eq!(parse_verdict("APPROVE"), AutoApproveVerdict::Approve);
        // Anything the schema does not cover escalates.
        assert_eq!(
            parse_verdict(r#"{"decision": "deny"}"#),
            AutoApproveVerdict::Escalate
        );
        assert_eq!(
            parse_verdict("sure, sounds fine to me"),
            AutoApproveVerdict::Escalate
        );
        assert_eq!(parse_verdict(""), AutoApproveVerdict::Escalate);
    }

    #[test]
    fn sanitize_strips_control_characters_and_truncates() {
        assert_eq!(sanitize("/tmp/a\x1b[31mred\x07.txt"), "/tmp/a[31mred.txt");
        assert_eq!(sanitize("line\nbreak\ttab"), "linebreaktab");
        let long = "x".repeat(500);
        assert_eq!(sanitize(&long).chars().count(), 200);
    }
}
