//! Change records, patch strategies and the post-change syntax check.
//!
//! A proposed fix is an explicit `Change` record. How (or whether) it is
//! written into a file is decided by a swappable `PatchStrategy`, so textual
//! mutation of source never hides inside the ledger's control flow.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// What sort of fix a change describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Wrap a failing call in error handling.
    ErrorHandling,
    /// Retry a failing call with backoff.
    RetryLogic,
    /// Raise or add a timeout.
    Timeout,
    /// Fix a missing or wrong import.
    ImportFix,
    /// Anything else.
    #[default]
    Other,
}

/// A proposed modification of one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    /// File to modify, relative to the source root.
    pub target_file: PathBuf,
    /// What to change.
    pub change_description: String,
    /// Why the change fixes the failure.
    pub reason: String,
    /// Category of fix.
    #[serde(default)]
    pub kind: ChangeKind,
}

impl Change {
    /// Create a new change record.
    pub fn new(
        target_file: impl Into<PathBuf>,
        kind: ChangeKind,
        change_description: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            target_file: target_file.into(),
            change_description: change_description.into(),
            reason: reason.into(),
            kind,
        }
    }
}

/// Outcome of applying one change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ChangeStatus {
    /// The strategy wrote the change into the file.
    Applied,
    /// The change is recorded for a human to apply.
    ManualRequired,
    /// The target file does not exist.
    FileNotFound,
    /// The target is not covered by the backup taken for this batch.
    NotBackedUp,
    /// The target is absolute or escapes the source root.
    Rejected {
        /// Why it was refused.
        message: String,
    },
    /// The strategy failed.
    Failed {
        /// Why it failed.
        message: String,
    },
}

impl ChangeStatus {
    /// Whether the change counts as successfully handled.
    pub fn is_success(&self) -> bool {
        matches!(self, ChangeStatus::Applied | ChangeStatus::ManualRequired)
    }
}

/// Per-change result recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeResult {
    /// The change that was attempted.
    pub change: Change,
    /// What happened.
    pub status: ChangeStatus,
}

/// Writes a change into a file.
pub trait PatchStrategy: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Apply `change` to the existing file at `path`.
    ///
    /// # Errors
    ///
    /// Any error is recorded as a per-change `Failed` status.
    fn apply(&self, change: &Change, path: &Path) -> Result<ChangeStatus>;
}

/// Leaves files untouched; every change is flagged for manual application.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualPatch;

impl PatchStrategy for ManualPatch {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn apply(&self, _change: &Change, _path: &Path) -> Result<ChangeStatus> {
        Ok(ChangeStatus::ManualRequired)
    }
}

/// Appends a reviewable comment block describing the change to the target.
#[derive(Debug, Clone)]
pub struct AnnotationPatch {
    comment_prefix: String,
}

impl Default for AnnotationPatch {
    fn default() -> Self {
        Self::new("//")
    }
}

impl AnnotationPatch {
    /// Create a strategy using `comment_prefix` for each annotation line.
    pub fn new(comment_prefix: impl Into<String>) -> Self {
        Self {
            comment_prefix: comment_prefix.into(),
        }
    }

    fn error_handling_block(&self, change: &Change) -> Vec<String> {
        vec![
            format!("{} autoscholar: add error handling", self.comment_prefix),
            format!("{}   what: {}", self.comment_prefix, change.change_description),
            format!("{}   why: {}", self.comment_prefix, change.reason),
        ]
    }

    fn retry_block(&self, change: &Change) -> Vec<String> {
        vec![
            format!("{} autoscholar: wrap in retry with backoff", self.comment_prefix),
            format!("{}   call: {}", self.comment_prefix, change.change_description),
            format!("{}   why: {}", self.comment_prefix, change.reason),
        ]
    }

    fn generic_block(&self, change: &Change) -> Vec<String> {
        vec![
            format!(
                "{} autoscholar ({}): {}",
                self.comment_prefix,
                kind_label(change.kind),
                change.change_description
            ),
            format!("{}   why: {}", self.comment_prefix, change.reason),
        ]
    }

    /// The annotation lines for a change.
    pub fn render(&self, change: &Change) -> Vec<String> {
        match change.kind {
            ChangeKind::ErrorHandling => self.error_handling_block(change),
            ChangeKind::RetryLogic => self.retry_block(change),
            ChangeKind::Timeout | ChangeKind::ImportFix | ChangeKind::Other => {
                self.generic_block(change)
            }
        }
    }
}

fn kind_label(kind: ChangeKind) -> &'static str {
    match kind {
        ChangeKind::ErrorHandling => "error handling",
        ChangeKind::RetryLogic => "retry",
        ChangeKind::Timeout => "timeout",
        ChangeKind::ImportFix => "import",
        ChangeKind::Other => "change",
    }
}

impl PatchStrategy for AnnotationPatch {
    fn name(&self) -> &'static str {
        "annotation"
    }

    fn apply(&self, change: &Change, path: &Path) -> Result<ChangeStatus> {
        let storage_err = |source: std::io::Error| Error::Storage {
            path: path.to_path_buf(),
            source,
        };
        let mut file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(storage_err)?;
        let mut block = String::from("\n");
        for line in self.render(change) {
            block.push_str(&line);
            block.push('\n');
        }
        file.write_all(block.as_bytes()).map_err(storage_err)?;
        file.sync_all().map_err(storage_err)?;
        Ok(ChangeStatus::Applied)
    }
}

/// Result of the post-change syntax check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    /// Whether the entry point passed.
    pub success: bool,
    /// Parse error, when it did not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TestResult {
    /// A passing result.
    pub fn passed() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    /// A failing result.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Best-effort syntactic validity check of a source file.
pub trait SyntaxCheck: Send + Sync {
    /// Check `source`, returning a description of the first problem.
    fn check(&self, source: &str) -> std::result::Result<(), String>;
}

/// Checks that `()`, `[]` and `{}` balance outside of comments and string,
/// raw string and char literals.
#[derive(Debug, Clone, Copy, Default)]
pub struct DelimiterCheck;

fn is_ident(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Index just past the closing quote of a string whose body starts at `i`.
fn skip_string(chars: &[char], mut i: usize, line: &mut usize) -> Option<usize> {
    while let Some(&c) = chars.get(i) {
        match c {
            '\\' => {
                if chars.get(i + 1) == Some(&'\n') {
                    *line += 1;
                }
                i += 2;
                continue;
            }
            '"' => return Some(i + 1),
            '\n' => *line += 1,
            _ => {}
        }
        i += 1;
    }
    None
}

/// Number of `#`s when a raw string literal opens with the `r` at `i`.
fn raw_string_hashes(chars: &[char], i: usize) -> Option<usize> {
    let before = |n: usize| i.checked_sub(n).and_then(|p| chars.get(p)).copied();
    let standalone = match before(1) {
        None => true,
        Some('b') => before(2).map_or(true, |c| !is_ident(c)),
        Some(c) => !is_ident(c),
    };
    if !standalone {
        return None;
    }
    let hashes = chars[i + 1..].iter().take_while(|c| **c == '#').count();
    (chars.get(i + 1 + hashes) == Some(&'"')).then_some(hashes)
}

/// Index just past the terminator of a raw string whose body starts at `i`.
fn skip_raw_string(
    chars: &[char],
    mut i: usize,
    hashes: usize,
    line: &mut usize,
) -> Option<usize> {
    while let Some(&c) = chars.get(i) {
        if c == '"' && chars[i + 1..].iter().take(hashes).filter(|c| **c == '#').count() == hashes {
            return Some(i + 1 + hashes);
        }
        if c == '\n' {
            *line += 1;
        }
        i += 1;
    }
    None
}

/// Index just past a (possibly nested) block comment whose body starts at `i`.
fn skip_block_comment(chars: &[char], mut i: usize, line: &mut usize) -> Option<usize> {
    let mut depth = 1;
    while depth > 0 {
        match (chars.get(i).copied(), chars.get(i + 1).copied()) {
            (None, _) => return None,
            (Some('/'), Some('*')) => {
                depth += 1;
                i += 2;
            }
            (Some('*'), Some('/')) => {
                depth -= 1;
                i += 2;
            }
            (Some(c), _) => {
                if c == '\n' {
                    *line += 1;
                }
                i += 1;
            }
        }
    }
    Some(i)
}

/// Length of the char literal opening at `i`, or `None` for a lifetime.
fn char_literal_len(chars: &[char], i: usize) -> Option<usize> {
    match *chars.get(i + 1)? {
        '\\' => chars
            .get(i + 3..)?
            .iter()
            .take(10)
            .position(|c| *c == '\'')
            .map(|p| p + 4),
        '\n' => None,
        _ if chars.get(i + 2) == Some(&'\'') => Some(3),
        _ => None,
    }
}

impl SyntaxCheck for DelimiterCheck {
    fn check(&self, source: &str) -> std::result::Result<(), String> {
        let chars: Vec<char> = source.chars().collect();
        let mut stack: Vec<(char, usize)> = Vec::new();
        let mut line = 1;
        let mut i = 0;

        while let Some(&c) = chars.get(i) {
            let next = chars.get(i + 1).copied();
            match c {
                '\n' => line += 1,
                '/' if next == Some('/') => {
                    while chars.get(i).is_some_and(|c| *c != '\n') {
                        i += 1;
                    }
                    continue;
                }
                '/' if next == Some('*') => {
                    let opened = line;
                    i = skip_block_comment(&chars, i + 2, &mut line)
                        .ok_or_else(|| format!("line {opened}: unclosed block comment"))?;
                    continue;
                }
                '"' => {
                    let opened = line;
                    i = skip_string(&chars, i + 1, &mut line)
                        .ok_or_else(|| format!("line {opened}: unterminated string"))?;
                    continue;
                }
                'r' => {
                    if let Some(hashes) = raw_string_hashes(&chars, i) {
                        let opened = line;
                        i = skip_raw_string(&chars, i + hashes + 2, hashes, &mut line)
                            .ok_or_else(|| format!("line {opened}: unterminated raw string"))?;
                        continue;
                    }
                }
                '\'' => {
                    if let Some(len) = char_literal_len(&chars, i) {
                        i += len;
                        continue;
                    }
                }
                '(' | '[' | '{' => stack.push((c, line)),
                ')' | ']' | '}' => {
                    let expected = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    match stack.pop() {
                        Some((open, _)) if open == expected => {}
                        Some((open, open_line)) => {
                            return Err(format!(
                                "line {line}: '{c}' closes '{open}' opened on line {open_line}"
                            ))
                        }
                        None => return Err(format!("line {line}: unmatched '{c}'")),
                    }
                }
                _ => {}
            }
            i += 1;
        }

        match stack.pop() {
            Some((open, line)) => Err(format!("line {line}: unclosed '{open}'")),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry_change() -> Change {
        Change::new(
            "src/fetch.rs",
            ChangeKind::RetryLogic,
            "fetch_page()",
            "transient timeouts",
        )
    }

    #[test]
    fn test_manual_patch_never_touches_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fetch.rs");
        std::fs::write(&path, "fn main() {}\n").unwrap();

        let status = ManualPatch.apply(&retry_change(), &path).unwrap();
        assert_eq!(status, ChangeStatus::ManualRequired);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "fn main() {}\n");
    }

    #[test]
    fn test_retry_and_error_handling_render_differently() {
        let patch = AnnotationPatch::default();
        let retry = patch.render(&retry_change());
        let mut handling = retry_change();
        handling.kind = ChangeKind::ErrorHandling;
        let handling = patch.render(&handling);

        assert!(retry[0].contains("retry with backoff"));
        assert!(handling[0].contains("error handling"));
        assert_ne!(retry, handling);
    }

    #[test]
    fn test_annotation_patch_appends_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fetch.rs");
        std::fs::write(&path, "fn main() {}\n").unwrap();

        let status = AnnotationPatch::default()
            .apply(&retry_change(), &path)
            .unwrap();
        assert_eq!(status, ChangeStatus::Applied);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("fn main() {}\n"));
        assert!(content.contains("// autoscholar: wrap in retry with backoff"));
        assert!(DelimiterCheck.check(&content).is_ok());
    }

    #[test]
    fn test_delimiter_check_accepts_balanced_source() {
        let source = r#"
fn main() {
    let s = "unbalanced ( in string";
    // a comment with }
    let v = vec![1, 2, (3)];
}
"#;
        assert!(DelimiterCheck.check(source).is_ok());
    }

    #[test]
    fn test_delimiter_check_reports_problems() {
        assert!(DelimiterCheck
            .check("fn main() {\n")
            .unwrap_err()
            .contains("unclosed '{'"));
        assert!(DelimiterCheck
            .check("fn main() { ]\n")
            .unwrap_err()
            .contains("line 1"));
        assert!(DelimiterCheck.check(")").unwrap_err().contains("unmatched"));
    }

    #[test]
    fn test_delimiter_check_skips_char_literals_and_lifetimes() {
        let source = "fn open(c: char) -> bool {\n    matches!(c, '(' | '[' | '{' | '\\'' | '\\\\')\n}\n\
                      fn first<'a>(s: &'a str) -> &'a str {\n    &s[..1]\n}\n";
        assert_eq!(DelimiterCheck.check(source), Ok(()));
    }

    #[test]
    fn test_delimiter_check_strings_span_lines() {
        let multi_line = "fn main() {\n    let s = \"first (\n    second ]\";\n}\n";
        assert_eq!(DelimiterCheck.check(multi_line), Ok(()));

        let continued = "fn main() {\n    let s = \"a { \\\n        b\";\n}\n";
        assert_eq!(DelimiterCheck.check(continued), Ok(()));

        assert!(DelimiterCheck
            .check("fn main() {\n    let s = \"open\n}\n")
            .unwrap_err()
            .contains("unterminated string"));
    }

    #[test]
    fn test_delimiter_check_skips_block_comments() {
        let source = "/* outer { /* inner ( */ still ] */\nfn main() {}\n";
        assert_eq!(DelimiterCheck.check(source), Ok(()));
        assert!(DelimiterCheck
            .check("fn main() {}\n/* never closed")
            .unwrap_err()
            .contains("unclosed block comment"));
    }

    #[test]
    fn test_delimiter_check_skips_raw_strings() {
        let source = "fn main() {\n    let a = r\"( \\\";\n    let b = r#\"} \"quoted\" [\"#;\n    let c = br##\"{\"#\"##;\n}\n";
        assert_eq!(DelimiterCheck.check(source), Ok(()));
        // `r` at the end of an identifier does not open a raw string.
        assert_eq!(DelimiterCheck.check("fn f() { for_each(\"x\") }"), Ok(()));
    }

    #[test]
    fn test_delimiter_check_accepts_own_sources() {
        for (name, source) in [
            ("patch.rs", include_str!("patch.rs")),
            ("command.rs", include_str!("command.rs")),
            ("ledger.rs", include_str!("ledger.rs")),
            ("scheduler.rs", include_str!("scheduler.rs")),
        ] {
            assert_eq!(DelimiterCheck.check(source), Ok(()), "{name}");
        }
    }

    #[test]
    fn test_change_status_success() {
        assert!(ChangeStatus::Applied.is_success());
        assert!(ChangeStatus::ManualRequired.is_success());
        assert!(!ChangeStatus::FileNotFound.is_success());
        assert!(!ChangeStatus::NotBackedUp.is_success());
    }
}
