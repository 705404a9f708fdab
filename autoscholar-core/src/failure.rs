//! Failure classification for the self-modification policy.
//!
//! Categorization is an ordered keyword rule list: the first rule with a
//! keyword contained in the lowercased error text wins, so `timeout` outranks
//! everything below it.

use serde::{Deserialize, Serialize};

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// An operation ran out of time.
    Timeout,
    /// Source failed to parse.
    SyntaxError,
    /// A module or dependency could not be loaded.
    ImportError,
    /// A remote API refused or failed the request.
    ApiError,
    /// Memory, disk or quota exhaustion.
    ResourceError,
    /// Browser automation failed.
    BrowserError,
    /// Nothing matched.
    Unknown,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::Timeout => "timeout",
            FailureKind::SyntaxError => "syntax_error",
            FailureKind::ImportError => "import_error",
            FailureKind::ApiError => "api_error",
            FailureKind::ResourceError => "resource_error",
            FailureKind::BrowserError => "browser_error",
            FailureKind::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Categorization rules, in priority order.
const RULES: &[(FailureKind, &[&str])] = &[
    (FailureKind::Timeout, &["timeout", "timed out", "deadline exceeded"]),
    (
        FailureKind::SyntaxError,
        &["syntax error", "syntaxerror", "invalid syntax", "unexpected token", "parse error"],
    ),
    (
        FailureKind::ImportError,
        &["importerror", "import error", "no module named", "modulenotfound", "unresolved import"],
    ),
    (
        FailureKind::ApiError,
        &["api error", "rate limit", "status 401", "status 403", "status 429", "status 500", "unauthorized"],
    ),
    (
        FailureKind::ResourceError,
        &["out of memory", "memoryerror", "no space left", "disk full", "quota", "resource exhausted"],
    ),
    (
        FailureKind::BrowserError,
        &["browser", "playwright", "selenium", "chromium", "webdriver"],
    ),
];

/// Kinds the ledger may attempt to fix without a human.
pub const SELF_MODIFIABLE: &[FailureKind] = &[
    FailureKind::Timeout,
    FailureKind::SyntaxError,
    FailureKind::ImportError,
    FailureKind::BrowserError,
];

/// Describes a failure handed to the modification ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureDescriptor {
    /// Error text used for categorization.
    pub error: String,
    /// Where the failure happened (session name, task topic...).
    pub origin: String,
    /// Additional detail lines.
    #[serde(default)]
    pub details: Vec<String>,
}

impl FailureDescriptor {
    /// Create a descriptor with no detail lines.
    pub fn new(origin: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            origin: origin.into(),
            details: Vec::new(),
        }
    }

    /// Attach detail lines.
    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = details;
        self
    }
}

/// Classify a failure by its error text.
pub fn categorize_failure(failure: &FailureDescriptor) -> FailureKind {
    let text = failure.error.to_lowercase();
    RULES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| text.contains(k)))
        .map(|(kind, _)| *kind)
        .unwrap_or(FailureKind::Unknown)
}

/// Whether policy allows an automatic fix for this failure.
pub fn can_self_modify(failure: &FailureDescriptor) -> bool {
    SELF_MODIFIABLE.contains(&categorize_failure(failure))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(error: &str) -> FailureDescriptor {
        FailureDescriptor::new("test", error)
    }

    #[test]
    fn test_categorize_each_kind() {
        assert_eq!(categorize_failure(&failure("request timeout after 30s")), FailureKind::Timeout);
        assert_eq!(categorize_failure(&failure("SyntaxError: invalid syntax")), FailureKind::SyntaxError);
        assert_eq!(
            categorize_failure(&failure("No module named 'requests'")),
            FailureKind::ImportError
        );
        assert_eq!(categorize_failure(&failure("hit rate limit")), FailureKind::ApiError);
        assert_eq!(categorize_failure(&failure("No space left on device")), FailureKind::ResourceError);
        assert_eq!(categorize_failure(&failure("Chromium crashed")), FailureKind::BrowserError);
        assert_eq!(categorize_failure(&failure("unrecognized issue")), FailureKind::Unknown);
    }

    #[test]
    fn test_timeout_has_priority() {
        let f = failure("browser navigation timed out with syntax error in page");
        assert_eq!(categorize_failure(&f), FailureKind::Timeout);
    }

    #[test]
    fn test_can_self_modify_policy() {
        assert!(can_self_modify(&failure("operation timeout")));
        assert!(!can_self_modify(&failure("unrecognized issue")));
        assert!(!can_self_modify(&failure("api error: status 500")));
        assert!(!can_self_modify(&failure("out of memory")));
        assert!(can_self_modify(&failure("playwright could not launch")));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(FailureKind::SyntaxError.to_string(), "syntax_error");
        assert_eq!(FailureKind::Unknown.to_string(), "unknown");
    }
}
