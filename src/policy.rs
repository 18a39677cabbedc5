//! Policy gate wrapped around every tool invocation.
//!
//! Enforcement is two-sided: before the guarded call runs, the sliding
//! -window rate limit is checked by counting journal records; after it
//! returns (success, domain error, or denial) an audit event is appended.
//! Counting over the journal instead of an in-memory bucket is deliberate:
//! counts survive restarts and are exact. The read and the append are not
//! atomic with the guarded call; racing invocations can over-limit by one,
//! never under-count.

use serde_json::Value;
use std::sync::Arc;

use crate::config::{PolicyConfig, RateQuota, RateRuleConfig};
use crate::error::CoreError;
use crate::journal::{EventJournal, EventRecord, EventStatus};
use crate::timestamp::UnixTimestamp;

/// Marker substituted for secret values before digesting.
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// JSON keys whose values never reach the journal.
const SENSITIVE_KEYS: &[&str] = &[
    "private_key",
    "mnemonic",
    "passphrase",
    "confirmation_code",
    "secret",
];

/// Rate rules and the audit writer.
pub struct PolicyEngine {
    journal: Arc<EventJournal>,
    default_rule: RateQuota,
    rules: Vec<RateRuleConfig>,
}

impl PolicyEngine {
    pub fn new(journal: Arc<EventJournal>, config: &PolicyConfig) -> Self {
        Self {
            journal,
            default_rule: config.default_rule,
            rules: config.rules.clone(),
        }
    }

    pub fn journal(&self) -> &EventJournal {
        &self.journal
    }

    /// Rule layering: per-tool-and-agent beats per-tool beats the default.
    fn resolve_quota(&self, tool: &str, agent_id: Option<&str>) -> RateQuota {
        let mut tool_rule = None;
        for rule in &self.rules {
            if rule.tool != tool {
                continue;
            }
            match (&rule.agent_id, agent_id) {
                (Some(rule_agent), Some(agent)) if rule_agent == agent => {
                    return rule.quota;
                }
                (None, _) => tool_rule = Some(rule.quota),
                _ => {}
            }
        }
        tool_rule.unwrap_or(self.default_rule)
    }

    /// Denies with `rate_limited` when the window is exhausted. Runs before
    /// any work on the guarded path.
    pub fn check(
        &self,
        tool: &str,
        agent_id: Option<&str>,
        now: UnixTimestamp,
    ) -> Result<(), CoreError> {
        let quota = self.resolve_quota(tool, agent_id);
        let from = now.saturating_sub(quota.window_seconds);
        // Timestamps are whole seconds; the upper bound includes `now` so
        // calls landing within the same second are counted, not missed.
        let count = self.journal.count_window(tool, agent_id, from, now + 1);
        if count >= quota.max_calls as usize {
            return Err(CoreError::RateLimited {
                tool: tool.to_string(),
                max_calls: quota.max_calls,
                window_seconds: quota.window_seconds,
            });
        }
        Ok(())
    }

    /// Appends the audit record for a completed invocation.
    ///
    /// Journal failures are logged at error level and swallowed; the
    /// guarded operation's outcome already belongs to the caller.
    pub fn record(
        &self,
        tool: &str,
        agent_id: Option<&str>,
        status: EventStatus,
        request: &Value,
        response: &Value,
        error_kind: Option<&str>,
        now: UnixTimestamp,
    ) {
        let record = EventRecord {
            occurred_at: now,
            tool_name: tool.to_string(),
            agent_id: agent_id.map(String::from),
            status,
            request_digest: digest_redacted(request),
            response_digest: digest_redacted(response),
            error_kind: error_kind.map(String::from),
        };
        if let Err(e) = self.journal.append(record) {
            tracing::error!(tool, ?agent_id, error = %e, "journal append failed, event lost");
        }
    }
}

/// Replaces the value under every sensitive key, recursively.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, inner)| {
                    if SENSITIVE_KEYS.contains(&key.as_str()) {
                        (key.clone(), Value::String(REDACTION_MARKER.to_string()))
                    } else {
                        (key.clone(), redact(inner))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

/// SHA-256 over the redacted, serialized JSON, as lowercase hex.
pub fn digest_redacted(value: &Value) -> String {
    let redacted = redact(value);
    let serialized = redacted.to_string();
    let hash = ring::digest::digest(&ring::digest::SHA256, serialized.as_bytes());
    hex::encode(hash.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine_with_rules(rules: Vec<RateRuleConfig>, default_rule: RateQuota) -> PolicyEngine {
        let config = PolicyConfig {
            default_rule,
            rules,
            ..PolicyConfig::default()
        };
        PolicyEngine::new(Arc::new(EventJournal::in_memory()), &config)
    }

    fn rule(tool: &str, agent: Option<&str>, max_calls: u32) -> RateRuleConfig {
        RateRuleConfig {
            tool: tool.to_string(),
            agent_id: agent.map(String::from),
            quota: RateQuota {
                max_calls,
                window_seconds: 60,
            },
        }
    }

    #[test]
    fn most_specific_rule_wins() {
        let engine = engine_with_rules(
            vec![
                rule("execute_transfer", None, 10),
                rule("execute_transfer", Some("a1"), 1),
            ],
            RateQuota {
                max_calls: 60,
                window_seconds: 60,
            },
        );
        assert_eq!(
            engine.resolve_quota("execute_transfer", Some("a1")).max_calls,
            1
        );
        assert_eq!(
            engine.resolve_quota("execute_transfer", Some("a2")).max_calls,
            10
        );
        assert_eq!(engine.resolve_quota("query_balance", Some("a1")).max_calls, 60);
    }

    #[test]
    fn rate_limit_denies_third_call_in_window() {
        let engine = engine_with_rules(
            vec![rule("execute_transfer", None, 2)],
            RateQuota {
                max_calls: 60,
                window_seconds: 60,
            },
        );
        let args = json!({"agent_id": "a1"});
        let now = UnixTimestamp(1_000);

        for offset in 0..2 {
            let at = UnixTimestamp(now.0 + offset);
            engine.check("execute_transfer", Some("a1"), at).unwrap();
            engine.record(
                "execute_transfer",
                Some("a1"),
                EventStatus::Ok,
                &args,
                &json!({"tx_hash": "0x00"}),
                None,
                at,
            );
        }

        let err = engine
            .check("execute_transfer", Some("a1"), UnixTimestamp(now.0 + 2))
            .unwrap_err();
        assert_eq!(err.kind(), "rate_limited");

        // Once the window slides past the first two events, calls resume.
        engine
            .check("execute_transfer", Some("a1"), UnixTimestamp(now.0 + 61))
            .unwrap();
    }

    #[test]
    fn denials_are_journaled_and_count_is_exact() {
        let engine = engine_with_rules(vec![], RateQuota {
            max_calls: 60,
            window_seconds: 60,
        });
        let at = UnixTimestamp(500);
        engine.record(
            "export_private_key",
            Some("a1"),
            EventStatus::Denied,
            &json!({"agent_id": "a1", "confirmation_code": "guess"}),
            &Value::Null,
            Some("export_denied"),
            at,
        );
        assert_eq!(
            engine
                .journal()
                .count_window("export_private_key", Some("a1"), UnixTimestamp(0), UnixTimestamp(501)),
            1
        );
        let listed = engine.journal().list_recent(None, None, 1);
        assert_eq!(listed[0].status, EventStatus::Denied);
        assert_eq!(listed[0].error_kind.as_deref(), Some("export_denied"));
    }

    #[test]
    fn redaction_strips_secret_values_recursively() {
        let value = json!({
            "agent_id": "a1",
            "private_key": "0xdeadbeef",
            "nested": {"mnemonic": "abandon abandon", "amount": "0.5"},
            "list": [{"passphrase": "pw", "keep": true}],
            "confirmation_code": "OK-42"
        });
        let redacted = redact(&value);
        assert_eq!(redacted["agent_id"], "a1");
        assert_eq!(redacted["private_key"], REDACTION_MARKER);
        assert_eq!(redacted["nested"]["mnemonic"], REDACTION_MARKER);
        assert_eq!(redacted["nested"]["amount"], "0.5");
        assert_eq!(redacted["list"][0]["passphrase"], REDACTION_MARKER);
        assert_eq!(redacted["list"][0]["keep"], true);
        assert_eq!(redacted["confirmation_code"], REDACTION_MARKER);
    }

    #[test]
    fn digest_is_stable_and_ignores_secret_differences() {
        let a = json!({"agent_id": "a1", "confirmation_code": "first"});
        let b = json!({"agent_id": "a1", "confirmation_code": "second"});
        // Secrets are replaced before hashing, so two requests differing
        // only in secret material digest identically.
        assert_eq!(digest_redacted(&a), digest_redacted(&b));
        let c = json!({"agent_id": "a2", "confirmation_code": "first"});
        assert_ne!(digest_redacted(&a), digest_redacted(&c));
    }
}
