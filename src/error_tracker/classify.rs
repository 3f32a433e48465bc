//! Keyword-driven classification of error reports.

use crate::events::Severity;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Category assigned to a tracked error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Rejected input.
    Validation,
    /// Arithmetic or computation failure.
    Calculation,
    /// Database, file or other persistence failure.
    Storage,
    /// Connectivity failure.
    Network,
    /// An operation exceeded its time budget.
    Timeout,
    /// Missing rights.
    Permission,
    /// Missing or wrong settings.
    Configuration,
    /// A domain rule refused the operation.
    BusinessRule,
    /// Resource exhaustion or runtime failure.
    System,
    /// Nothing matched.
    Unknown,
}

impl ErrorCategory {
    /// Returns a static string representation of the category.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Calculation => "calculation",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Permission => "permission",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::BusinessRule => "business_rule",
            ErrorCategory::System => "system",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Checked in order; the first category with a matching keyword wins.
const CATEGORY_KEYWORDS: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::Validation,
        &["validation", "validate", "invalid", "required", "malformed", "must be", "expected format"],
    ),
    (
        ErrorCategory::Calculation,
        &["calculation", "calculate", "overflow", "underflow", "divide by zero", "division by zero", "nan", "arithmetic"],
    ),
    (
        ErrorCategory::Storage,
        &["database", "storage", "disk", "sql", "constraint", "deadlock", "file", "persist", "write failed"],
    ),
    (
        ErrorCategory::Network,
        &["network", "connection", "connect", "dns", "socket", "unreachable", "refused", "http"],
    ),
    (ErrorCategory::Timeout, &["timeout", "timed out", "deadline", "elapsed"]),
    (
        ErrorCategory::Permission,
        &["permission", "denied", "forbidden", "unauthorized", "unauthorised", "access"],
    ),
    (
        ErrorCategory::Configuration,
        &["configuration", "config", "setting", "missing key", "environment variable"],
    ),
    (
        ErrorCategory::BusinessRule,
        &["business", "rule", "policy", "not allowed", "quota", "limit exceeded", "insufficient"],
    ),
    (
        ErrorCategory::System,
        &["system", "memory", "panic", "resource", "out of", "thread", "stack overflow"],
    ),
];

const CRITICAL_KEYWORDS: &[&str] = &["critical", "fatal", "panic", "corrupt", "data loss", "out of memory", "security"];
const HIGH_KEYWORDS: &[&str] = &["failed", "failure", "unavailable", "denied", "timeout", "timed out", "crash", "lost"];
const LOW_KEYWORDS: &[&str] = &["deprecated", "warning", "retrying", "minor", "skipped", "ignored"];

fn words(text: &str) -> Vec<&str> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
        .collect()
}

/// Multi-word keywords match as substrings, single words as whole words or
/// as the prefix of a word when they are at least five characters long.
fn matches_keyword(lower: &str, tokens: &[&str], keyword: &str) -> bool {
    if keyword.contains(' ') {
        return lower.contains(keyword);
    }
    tokens
        .iter()
        .any(|token| *token == keyword || (keyword.len() >= 5 && token.starts_with(keyword)))
}

fn any_keyword(lower: &str, tokens: &[&str], keywords: &[&str]) -> bool {
    keywords.iter().any(|k| matches_keyword(lower, tokens, k))
}

/// Assigns a category from the error kind and message.
pub fn classify_category(kind: &str, message: &str) -> ErrorCategory {
    let lower = format!("{} {}", kind, message).to_lowercase();
    let tokens = words(&lower);
    if tokens.is_empty() {
        return ErrorCategory::Unknown;
    }
    CATEGORY_KEYWORDS
        .iter()
        .find(|(_, keywords)| any_keyword(&lower, &tokens, keywords))
        .map(|(category, _)| *category)
        .unwrap_or(ErrorCategory::Unknown)
}

/// Assigns a severity from the error kind and message. Defaults to medium.
pub fn classify_severity(kind: &str, message: &str) -> Severity {
    let lower = format!("{} {}", kind, message).to_lowercase();
    let tokens = words(&lower);
    if any_keyword(&lower, &tokens, CRITICAL_KEYWORDS) {
        Severity::Critical
    } else if any_keyword(&lower, &tokens, HIGH_KEYWORDS) {
        Severity::High
    } else if any_keyword(&lower, &tokens, LOW_KEYWORDS) {
        Severity::Low
    } else {
        Severity::Medium
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_first_match_wins() {
        assert_eq!(classify_category("FormError", "title is required"), ErrorCategory::Validation);
        assert_eq!(classify_category("", "division by zero in totals"), ErrorCategory::Calculation);
        assert_eq!(classify_category("DbError", "deadlock detected"), ErrorCategory::Storage);
        assert_eq!(classify_category("", "connection refused"), ErrorCategory::Network);
        assert_eq!(classify_category("", "request timed out"), ErrorCategory::Timeout);
        assert_eq!(classify_category("", "permission denied for page 4"), ErrorCategory::Permission);
        assert_eq!(classify_category("", "missing key smtp_host"), ErrorCategory::Configuration);
        assert_eq!(classify_category("", "quota exceeded for tenant"), ErrorCategory::BusinessRule);
        assert_eq!(classify_category("", "thread pool exhausted"), ErrorCategory::System);
        // Both validation and storage keywords: validation is checked first
        assert_eq!(classify_category("", "invalid file header"), ErrorCategory::Validation);
    }

    #[test]
    fn test_unknown_for_empty_or_unmatched() {
        assert_eq!(classify_category("", ""), ErrorCategory::Unknown);
        assert_eq!(classify_category("Oops", "something odd"), ErrorCategory::Unknown);
        assert_eq!(classify_severity("", ""), Severity::Medium);
    }

    #[test]
    fn test_keywords_match_whole_words() {
        // "nan" must not match inside "maintenance"
        assert_eq!(classify_category("", "scheduled maintenance"), ErrorCategory::Unknown);
    }

    #[test]
    fn test_severity_keywords() {
        assert_eq!(classify_severity("", "fatal: index corrupted"), Severity::Critical);
        assert_eq!(classify_severity("", "upload failed"), Severity::High);
        assert_eq!(classify_severity("", "deprecated field used"), Severity::Low);
        assert_eq!(classify_severity("", "user 42 not found"), Severity::Medium);
    }

    #[test]
    fn test_category_serde() {
        assert_eq!(serde_json::to_string(&ErrorCategory::BusinessRule).unwrap(), "\"business_rule\"");
    }
}
