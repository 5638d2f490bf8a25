//! Helpers for scrubbing data before it leaves the server.
//!
//! Error messages shown to callers and values placed in tracing spans go
//! through here so credentials, card numbers, email addresses and full file
//! paths stay in server-side logs only.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

pub const REDACTED: &str = "[REDACTED]";
pub const EMAIL_TOKEN: &str = "[EMAIL]";
pub const CARD_TOKEN: &str = "[CARD]";

static RE_URL_USERINFO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b([a-z][a-z0-9+.-]*://)[^/\s@]+@").unwrap());

static RE_BEARER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bbearer\s+[a-z0-9._~+/=-]+").unwrap());

static RE_CREDENTIAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\b(password|passwd|pwd|secret|token|api[_-]?key|access[_-]?key|client[_-]?secret)\b(\s*[:=]\s*)("[^"]*"|'[^']*'|[^\s,;&]+)"#,
    )
    .unwrap()
});

static RE_EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b").unwrap()
});

// 13 to 19 digits, optionally grouped by single spaces or dashes.
static RE_CARD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d(?:[ -]?\d){12,18}\b").unwrap());

/// Replaces known sensitive patterns with fixed redaction tokens.
///
/// - `https://user:pw@host/x` → `https://****@host/x`
/// - `password=hunter2` → `password=[REDACTED]`
/// - `Bearer eyJ...` → `Bearer [REDACTED]`
/// - `jane@corp.example` → `[EMAIL]`
/// - `4111 1111 1111 1111` → `[CARD]`
pub fn sanitize_message(message: &str) -> String {
    let s = RE_URL_USERINFO.replace_all(message, "${1}****@");
    let s = RE_BEARER.replace_all(&s, "Bearer [REDACTED]");
    let s = RE_CREDENTIAL.replace_all(&s, "${1}${2}[REDACTED]");
    let s = RE_EMAIL.replace_all(&s, EMAIL_TOKEN);
    let s = RE_CARD.replace_all(&s, CARD_TOKEN);
    s.into_owned()
}

/// Returns only the filename component of a path (no directory).
///
/// Safe for span fields: reveals the file name without exposing the full path.
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}
