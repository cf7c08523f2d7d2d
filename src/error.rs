//! Shared error taxonomy.
//!
//! The pipeline is built on `anyhow` end to end. `AppErrorKind` is attached
//! via `.context(...)` at the point an error is classified so the CLI
//! boundary (and tests) can downcast to it without every caller needing a
//! bespoke enum.

use std::fmt;

/// Error-kind taxonomy from the design's error handling table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppErrorKind {
    RateLimit,
    ProviderAuthRevoked,
    ModelUnavailable,
    MalformedModelOutput,
    SchemaViolation,
    ForeignKeyViolation,
    WriteGuardRejected,
    ParserFailure,
}

impl fmt::Display for AppErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AppErrorKind::RateLimit => "rate limited",
            AppErrorKind::ProviderAuthRevoked => "provider auth revoked",
            AppErrorKind::ModelUnavailable => "model unavailable",
            AppErrorKind::MalformedModelOutput => "malformed model output",
            AppErrorKind::SchemaViolation => "schema violation",
            AppErrorKind::ForeignKeyViolation => "foreign key violation",
            AppErrorKind::WriteGuardRejected => "write guard rejected query",
            AppErrorKind::ParserFailure => "parser failure",
        };
        write!(f, "{s}")
    }
}

impl std::error::Error for AppErrorKind {}

/// Find the `AppErrorKind` tag on an anyhow error chain, if one was attached.
pub fn classify(err: &anyhow::Error) -> Option<AppErrorKind> {
    for cause in err.chain() {
        if let Some(kind) = cause.downcast_ref::<AppErrorKind>() {
            return Some(*kind);
        }
    }
    None
}
