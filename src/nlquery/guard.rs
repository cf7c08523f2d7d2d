//! Read-only guard for model-generated SQL. Pure string analysis, no SQL
//! parser dependency — this is a hard safety boundary and is tested
//! independently of the rest of the query engine.

use once_cell::sync::Lazy;
use regex::Regex;

static FORBIDDEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(INSERT|UPDATE|DELETE|DROP|ALTER|CREATE|REPLACE|ATTACH|DETACH|PRAGMA|REINDEX|VACUUM)\b").unwrap()
});

#[derive(Debug, Clone, PartialEq)]
pub enum GuardRejection {
    NotSelectOrWith,
    ForbiddenKeyword(String),
}

impl std::fmt::Display for GuardRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardRejection::NotSelectOrWith => write!(f, "statement must begin with SELECT or WITH"),
            GuardRejection::ForbiddenKeyword(kw) => write!(f, "statement contains forbidden keyword: {kw}"),
        }
    }
}

/// Removes `--` line comments and `/* */` block comments without
/// depending on a SQL tokenizer.
fn strip_comments(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '-' && chars.get(i + 1) == Some(&'-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if chars[i] == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                i += 1;
            }
            i = (i + 2).min(chars.len());
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    out
}

/// (a) the statement must begin with `SELECT` or `WITH` after comment
/// removal, and (b) it must contain no word-boundaried forbidden keyword.
pub fn check_read_only(sql: &str) -> Result<(), GuardRejection> {
    let stripped = strip_comments(sql);
    let trimmed = stripped.trim();
    let upper = trimmed.to_uppercase();

    if !(upper.starts_with("SELECT") || upper.starts_with("WITH")) {
        return Err(GuardRejection::NotSelectOrWith);
    }

    if let Some(m) = FORBIDDEN_RE.find(&stripped) {
        return Err(GuardRejection::ForbiddenKeyword(m.as_str().to_uppercase()));
    }

    Ok(())
}
