//! Error classification for dependency failures.
//!
//! Every failed call is reduced to a category (which drives retries), a
//! severity (which drives notification), a sanitized message for callers and a
//! normalized signature for pattern tracking.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::sanitize::sanitize_message;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Database,
    Validation,
    Authentication,
    Integrity,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Database => "database",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Integrity => "integrity",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Transient failures worth retrying inside a single job attempt.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ErrorCategory::Network | ErrorCategory::Database)
    }

    /// Whether a job that failed with this category may be rescheduled.
    ///
    /// Unknown errors get a conservative second chance at the job level;
    /// bad input and bad credentials never improve by waiting.
    pub fn is_job_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Network | ErrorCategory::Database | ErrorCategory::Unknown
        )
    }

    /// Whether a failure in this category says anything about the health of
    /// the dependency. A rejected request means the dependency answered.
    pub fn counts_against_breaker(&self) -> bool {
        !matches!(self, ErrorCategory::Validation)
    }

    pub fn default_severity(&self) -> Severity {
        match self {
            ErrorCategory::Validation => Severity::Low,
            ErrorCategory::Network => Severity::Medium,
            ErrorCategory::Integrity => Severity::Medium,
            ErrorCategory::Database => Severity::High,
            ErrorCategory::Authentication => Severity::High,
            ErrorCategory::Unknown => Severity::High,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// What a provider knows about its own failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyErrorKind {
    Network,
    Timeout,
    Database,
    Validation,
    Authentication,
    /// Nothing more specific is known; classification falls back to the
    /// status code and message.
    Other,
}

/// An error returned by an external dependency (OCR, rule extraction, storage).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyError {
    pub kind: DependencyErrorKind,
    /// HTTP-style status code, when the dependency speaks HTTP.
    pub status: Option<u16>,
    pub message: String,
    /// Set when the provider knows the failure needs an operator now.
    pub critical: bool,
}

impl DependencyError {
    pub fn new(kind: DependencyErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
            critical: false,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(DependencyErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(DependencyErrorKind::Timeout, message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(DependencyErrorKind::Database, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(DependencyErrorKind::Validation, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(DependencyErrorKind::Authentication, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(DependencyErrorKind::Other, message)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }
}

impl fmt::Display for DependencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (status {})", self.message, status),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for DependencyError {}

impl From<std::io::Error> for DependencyError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match e.kind() {
            ErrorKind::TimedOut => DependencyErrorKind::Timeout,
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe => DependencyErrorKind::Network,
            ErrorKind::InvalidData | ErrorKind::InvalidInput => DependencyErrorKind::Validation,
            ErrorKind::PermissionDenied => DependencyErrorKind::Authentication,
            _ => DependencyErrorKind::Other,
        };
        Self::new(kind, e.to_string())
    }
}

/// The classified form of a dependency error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub recoverable: bool,
    /// Raw message. Server-side logs only.
    #[serde(skip)]
    pub message: String,
    /// Message safe to show to callers.
    pub sanitized: String,
    pub signature: String,
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.category, self.sanitized)
    }
}

static RE_NETWORK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(timed? ?out|timeout|connection (reset|refused|aborted|closed)|unreachable|dns|socket|econn\w*|broken pipe|temporarily unavailable)\b")
        .unwrap()
});

static RE_DATABASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(sqlite|database|deadlock|constraint|(table|database) is locked|sql)\b")
        .unwrap()
});

static RE_AUTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(unauthori[sz]ed|forbidden|invalid (api )?(key|token|credentials)|expired token|access denied)\b")
        .unwrap()
});

static RE_VALIDATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(invalid|malformed|missing required|unsupported|bad request)\b")
        .unwrap()
});

static RE_CRITICAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(corrupt\w*|data loss|disk full|no space left|out of memory)\b")
        .unwrap()
});

pub fn classify(error: &DependencyError) -> ClassifiedError {
    let category = category_of(error);
    let severity = if error.critical || RE_CRITICAL.is_match(&error.message) {
        Severity::Critical
    } else {
        category.default_severity()
    };

    ClassifiedError {
        category,
        severity,
        recoverable: category.is_recoverable(),
        message: error.to_string(),
        sanitized: sanitize_message(&error.message),
        signature: signature(category, &error.message),
    }
}

fn category_of(error: &DependencyError) -> ErrorCategory {
    match error.kind {
        DependencyErrorKind::Network | DependencyErrorKind::Timeout => {
            return ErrorCategory::Network
        }
        DependencyErrorKind::Database => return ErrorCategory::Database,
        DependencyErrorKind::Validation => return ErrorCategory::Validation,
        DependencyErrorKind::Authentication => return ErrorCategory::Authentication,
        DependencyErrorKind::Other => {}
    }

    if let Some(status) = error.status {
        match status {
            401 | 403 => return ErrorCategory::Authentication,
            400 | 404 | 409 | 413 | 415 | 422 => return ErrorCategory::Validation,
            408 | 429 | 502 | 503 | 504 => return ErrorCategory::Network,
            500..=599 => return ErrorCategory::Unknown,
            _ => {}
        }
    }

    let msg = &error.message;
    if RE_AUTH.is_match(msg) {
        ErrorCategory::Authentication
    } else if RE_NETWORK.is_match(msg) {
        ErrorCategory::Network
    } else if RE_DATABASE.is_match(msg) {
        ErrorCategory::Database
    } else if RE_VALIDATION.is_match(msg) {
        ErrorCategory::Validation
    } else {
        ErrorCategory::Unknown
    }
}

static RE_UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b")
        .unwrap()
});

static RE_HEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(0x)?[0-9a-f]{12,}\b").unwrap());

static RE_QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"'[^']*'|"[^"]*""#).unwrap());

static RE_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

static RE_SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

const SIGNATURE_MAX_LEN: usize = 120;

/// Reduces a message to a stable signature so the same failure with
/// different ids, paths or counts groups together.
pub fn signature(category: ErrorCategory, message: &str) -> String {
    let s = RE_UUID.replace_all(message, "<id>");
    let s = sanitize_message(&s);
    let s = RE_HEX.replace_all(&s, "<hex>");
    let s = RE_QUOTED.replace_all(&s, "<str>");
    let s = RE_NUMBER.replace_all(&s, "#");
    let s = RE_SPACE.replace_all(s.trim(), " ");
    let mut normalized = s.to_lowercase();
    if normalized.len() > SIGNATURE_MAX_LEN {
        let mut cut = SIGNATURE_MAX_LEN;
        while !normalized.is_char_boundary(cut) {
            cut -= 1;
        }
        normalized.truncate(cut);
    }
    format!("{}:{}", category.as_str(), normalized)
}
