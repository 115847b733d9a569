use std::time::Duration;

use env_flags::env_flags;

env_flags! {
    /// How often the escalation channel polls for a response file.
    pub ESCALATION_POLL_INTERVAL_MS: Duration = Duration::from_millis(250), |value| {
        value.parse().map(Duration::from_millis)
    };

    /// How long a suspended tool call waits for a human decision. Clamped to
    /// 30s..=600s at channel construction.
    pub ESCALATION_TIMEOUT_MS: Duration = Duration::from_millis(120_000), |value| {
        value.parse().map(Duration::from_millis)
    };

    /// How long to wait for a backing server to acknowledge a roots change
    /// before proceeding without it.
    pub ROOTS_ACK_TIMEOUT_MS: Duration = Duration::from_millis(3_000), |value| {
        value.parse().map(Duration::from_millis)
    };

    /// Wall-clock cap on the auto-approver's LLM call.
    pub AUTO_APPROVE_TIMEOUT_MS: Duration = Duration::from_millis(20_000), |value| {
        value.parse().map(Duration::from_millis)
    };

    /// Chat-completions endpoint used by the auto-approver.
    pub AUTO_APPROVE_API_BASE: &str = "https://api.openai.com/v1";

    /// Sliding window of the call circuit breaker.
    pub CIRCUIT_BREAKER_WINDOW_MS: u64 = 60_000;

    /// Identical calls tolerated within one breaker window.
    pub CIRCUIT_BREAKER_THRESHOLD: usize = 20;
}
