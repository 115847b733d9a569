use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use sha1::Digest;
use sha1::Sha1;

/// Sliding-window rate limiter keyed by `(tool, hash(args))`. A runaway agent
/// retrying the same call in a tight loop gets cut off after `threshold`
/// identical calls within `window`; distinct argument sets are independent.
///
/// Runs after policy evaluation so every call is still evaluated and audited.
pub struct CircuitBreaker {
    window: Duration,
    threshold: usize,
    hits: Mutex<HashMap<String, Vec<Instant>>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BreakerVerdict {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl CircuitBreaker {
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            window,
            threshold,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Record-and-check under one critical section per key. Refused calls are
    /// not recorded, so a tripped key recovers exactly one window after the
    /// call that filled it.
    pub fn check(&self, tool: &str, args: &serde_json::Value) -> BreakerVerdict {
        let key = format!("{tool}:{}", stable_args_hash(args));
        let now = Instant::now();

        #[allow(clippy::unwrap_used)] // lock poisoning means a panicking peer; propagate
        let mut hits = self.hits.lock().unwrap();
        let timestamps = hits.entry(key).or_default();
        timestamps.retain(|t| now.duration_since(*t) < self.window);

        if timestamps.len() >= self.threshold {
            return BreakerVerdict {
                allowed: false,
                reason: Some(format!(
                    "Circuit breaker: `{tool}` was called {} times with identical arguments within {}s. Try a different approach instead of retrying.",
                    self.threshold,
                    self.window.as_secs(),
                )),
            };
        }
        timestamps.push(now);
        BreakerVerdict {
            allowed: true,
            reason: None,
        }
    }
}

/// Hash of the canonical form of `args`: object keys are sorted recursively
/// so two argument maps that differ only in key order collide.
fn stable_args_hash(args: &serde_json::Value) -> String {
    let canonical = canonical_json(args);
    let mut hasher = Sha1::new();
    hasher.update(canonical.to_string().as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn canonical_json(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: std::collections::BTreeMap<&String, serde_json::Value> =
                map.iter().map(|(k, v)| (k, canonical_json(v))).collect();
            serde_json::to_value(sorted).unwrap_or_else(|_| value.clone())
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonical_json).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use serde_json::json;

    #[test]
    fn trips_at_threshold_and_recovers_after_the_window() {
        let breaker = CircuitBreaker::new(Duration::from_millis(100), 3);
        let args = json!({"path": "/tmp/x"});

        for _ in 0..3 {
            assert!(breaker.check("read_file", &args).allowed);
        }
        let verdict = breaker.check("read_file", &args);
        assert!(!verdict.allowed);
        assert!(verdict.reason.unwrap().contains("read_file"));

        std::thread::sleep(Duration::from_millis(120));
        assert!(breaker.check("read_file", &args).allowed);
    }

    #[test]
    fn distinct_arguments_do_not_share_a_window() {
        let breaker = CircuitBreaker::new(Duration::from_secs(60), 2);
        assert!(breaker.check("read_file", &json!({"path": "/a"})).allowed);
        assert!(breaker.check("read_file", &json!({"path": "/a"})).allowed);
        assert!(!breaker.check("read_file", &json!({"path": "/a"})).allowed);
        // Same tool, different args: untouched.
        assert!(breaker.check("read_file", &json!({"path": "/b"})).allowed);
        // Same args, different tool: untouched.
        assert!(breaker.check("stat_file", &json!({"path": "/a"})).allowed);
    }

    #[test]
    fn key_is_stable_under_object_key_order() {
        let a = json!({"a": 1, "b": {"c": 2, "d": 3}});
        let b = json!({"b": {"d": 3, "c": 2}, "a": 1});
        assert_eq!(stable_args_hash(&a), stable_args_hash(&b));
    }

    #[test]
    fn refused_calls_are_not_recorded() {
        let breaker = CircuitBreaker::new(Duration::from_millis(80), 1);
        let args = json!({});
        assert!(breaker.check("t", &args).allowed);
        assert!(!breaker.check("t", &args).allowed);
        assert!(!breaker.check("t", &args).allowed);
        std::thread::sleep(Duration::from_millis(100));
        // Only the first (allowed) call counted toward the window.
        assert!(breaker.check("t", &args).allowed);
    }
}
