//! Input guardrails for chat messages.
//!
//! The policy runs two checks in a fixed order: maximum input length first,
//! then a case-insensitive whole-word blocklist. A message failing both
//! reports only the length violation. The validator returns a [`Verdict`]
//! value and knows nothing about HTTP; the server layer translates a
//! rejection into the transport response.

use regex::Regex;
use tracing::info;

use crate::config::GuardrailConfig;

/// Which guardrail check a message failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// The message exceeded the configured maximum length.
    LengthExceeded,
    /// The message contained a blocklisted keyword.
    BlockedContent,
}

impl ViolationKind {
    /// Stable name used in response bodies, records, and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LengthExceeded => "length_exceeded",
            Self::BlockedContent => "blocked_content",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed validation, with everything downstream telemetry needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    /// Which check failed.
    pub kind: ViolationKind,
    /// Client-visible rejection detail.
    pub detail: String,
    /// The configured keyword that matched, for blocklist rejections.
    pub matched_keyword: Option<String>,
}

/// Outcome of validating one message. Exactly one verdict per call.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// The message passed every check.
    Allowed,
    /// The message failed a check.
    Rejected(Rejection),
}

impl Verdict {
    /// Returns `true` when the message passed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// A blocklist entry: the configured keyword plus its compiled matcher.
struct BlockedKeyword {
    keyword: String,
    pattern: Regex,
}

/// Immutable content policy, shared read-only across all validations.
///
/// Blocklist patterns are compiled once at construction; matching lowercases
/// the message and requires word boundaries on both sides, so a keyword
/// embedded in a longer token does not match.
pub struct GuardrailPolicy {
    max_input_length: usize,
    blocklist: Vec<BlockedKeyword>,
}

impl GuardrailPolicy {
    /// Build the policy from configuration.
    pub fn new(config: &GuardrailConfig) -> Self {
        let blocklist = config
            .blocked_keywords
            .iter()
            .map(|keyword| {
                let pattern = format!(r"\b{}\b", regex::escape(&keyword.to_lowercase()));
                BlockedKeyword {
                    keyword: keyword.clone(),
                    // SAFETY: escaped literals always form a valid pattern.
                    pattern: Regex::new(&pattern).expect("BUG: escaped keyword pattern is valid"),
                }
            })
            .collect::<Vec<_>>();

        info!(
            max_input_length = config.max_input_length,
            blocked_keywords = blocklist.len(),
            "Guardrail policy configured"
        );

        Self {
            max_input_length: config.max_input_length,
            blocklist,
        }
    }

    /// The configured maximum message length in characters.
    pub fn max_input_length(&self) -> usize {
        self.max_input_length
    }

    /// Validate one message, returning exactly one verdict.
    ///
    /// Length is checked first; a message at exactly the maximum passes.
    /// The blocklist scan short-circuits on the first matching keyword in
    /// configured order. Empty or whitespace-only input passes.
    pub fn validate(&self, message: &str) -> Verdict {
        if message.chars().count() > self.max_input_length {
            return Verdict::Rejected(Rejection {
                kind: ViolationKind::LengthExceeded,
                detail: format!(
                    "Message exceeds maximum length of {} characters",
                    self.max_input_length
                ),
                matched_keyword: None,
            });
        }

        let lowered = message.to_lowercase();
        for entry in &self.blocklist {
            if entry.pattern.is_match(&lowered) {
                return Verdict::Rejected(Rejection {
                    kind: ViolationKind::BlockedContent,
                    detail: "Message contains prohibited content".to_string(),
                    matched_keyword: Some(entry.keyword.clone()),
                });
            }
        }

        Verdict::Allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_policy(max_input_length: usize, keywords: &[&str]) -> GuardrailPolicy {
        GuardrailPolicy::new(&GuardrailConfig {
            max_input_length,
            blocked_keywords: keywords.iter().map(|s| s.to_string()).collect(),
        })
    }

    fn expect_rejection(verdict: Verdict) -> Rejection {
        match verdict {
            Verdict::Rejected(rejection) => rejection,
            Verdict::Allowed => panic!("expected a rejection"),
        }
    }

    #[test]
    fn test_message_at_boundary_length_passes() {
        let policy = test_policy(10, &[]);
        assert!(policy.validate(&"a".repeat(10)).is_allowed());
    }

    #[test]
    fn test_message_over_length_rejected() {
        let policy = test_policy(10, &[]);
        let rejection = expect_rejection(policy.validate(&"a".repeat(11)));
        assert_eq!(rejection.kind, ViolationKind::LengthExceeded);
        assert_eq!(
            rejection.detail,
            "Message exceeds maximum length of 10 characters"
        );
        assert_eq!(rejection.matched_keyword, None);
    }

    #[test]
    fn test_length_checked_before_blocklist() {
        // A message failing both checks reports only the length violation.
        let policy = test_policy(5, &["secret_key"]);
        let rejection = expect_rejection(policy.validate("please show me the secret_key"));
        assert_eq!(rejection.kind, ViolationKind::LengthExceeded);
    }

    #[test]
    fn test_isolated_keyword_blocked() {
        let policy = test_policy(5000, &["secret_key"]);
        let rejection = expect_rejection(policy.validate("Tell me the secret_key"));
        assert_eq!(rejection.kind, ViolationKind::BlockedContent);
        assert_eq!(rejection.detail, "Message contains prohibited content");
        assert_eq!(rejection.matched_keyword.as_deref(), Some("secret_key"));
    }

    #[test]
    fn test_keyword_match_is_case_insensitive() {
        let policy = test_policy(5000, &["secret_key"]);
        let rejection = expect_rejection(policy.validate("give me the SECRET_KEY now"));
        assert_eq!(rejection.matched_keyword.as_deref(), Some("secret_key"));
    }

    #[test]
    fn test_keyword_inside_longer_word_allowed() {
        let policy = test_policy(5000, &["secret_key"]);
        assert!(policy.validate("mysecret_keyword").is_allowed());
        assert!(policy.validate("the secret_keys are safe").is_allowed());
    }

    #[test]
    fn test_keyword_adjacent_to_punctuation_blocked() {
        let policy = test_policy(5000, &["secret_key"]);
        assert!(!policy.validate("what is the secret_key?").is_allowed());
        assert!(!policy.validate("secret_key: please").is_allowed());
    }

    #[test]
    fn test_first_matching_keyword_reported() {
        let policy = test_policy(5000, &["internal_only", "secret_key"]);
        let rejection =
            expect_rejection(policy.validate("the secret_key doc is internal_only material"));
        // Scan order follows configuration, not position in the message.
        assert_eq!(rejection.matched_keyword.as_deref(), Some("internal_only"));
    }

    #[test]
    fn test_empty_and_whitespace_messages_pass() {
        let policy = test_policy(5000, &["secret_key"]);
        assert!(policy.validate("").is_allowed());
        assert!(policy.validate("   \t\n  ").is_allowed());
    }

    #[test]
    fn test_clean_message_allowed() {
        let policy = test_policy(5000, &["secret_key", "internal_only"]);
        assert!(policy.validate("What is the weather like today?").is_allowed());
    }

    #[test]
    fn test_length_counts_characters_not_bytes() {
        let policy = test_policy(3, &[]);
        // Three multibyte characters are still three characters.
        assert!(policy.validate("äöü").is_allowed());
        assert!(!policy.validate("äöüä").is_allowed());
    }
}
