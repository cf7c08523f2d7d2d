//! Shared regex-driven extraction helpers used across the deterministic
//! parser tier: direction keywords, bank name table, merchant/account/date
//! patterns, and the common-fields bundle each format parser builds on.

use chrono::{NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::parsing::amount::normalize_amount;
use crate::store::Direction;

static AMOUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:rs\.?|inr|₹)\s*([\d,]+(?:\.\d+)?)|([\d,]+(?:\.\d+)?)\s*(?:rs\.?|inr)").unwrap());

static REFERENCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:ref(?:erence)?\.?\s*(?:no\.?)?|txn\s*id|transaction\s*id)\s*[:\-]?\s*([A-Za-z0-9]+)").unwrap()
});

static MASKED_ACCOUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)a/?c(?:count)?\s*(?:no\.?)?\s*[:\-]?\s*((?:[Xx*]{2,}\d{2,8})|(?:\d{0,4}[Xx*]{2,}\d{2,8}))").unwrap());

static MERCHANT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:paid to|trf to|transfer to|to)\s+([A-Za-z0-9@_.\-' ]{2,40}?)(?:\s+(?:on|via|using|from|dated)\b|[.,]|\n|$)").unwrap()
});

static INLINE_DATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{1,2}[-/]\d{1,2}[-/]\d{2,4}").unwrap());

const CREDIT_KEYWORDS: &[&str] = &["credited", "credit of", "received", "deposited", "refund of"];
const DEBIT_KEYWORDS: &[&str] = &["debited", "debit of", "spent", "paid", "withdrawn", "purchase of"];

const BANK_PATTERNS: &[(&str, &str)] = &[
    ("hdfcbank", "HDFC Bank"),
    ("icicibank", "ICICI Bank"),
    ("axisbank", "Axis Bank"),
    ("onlinesbi", "State Bank of India"),
    ("sbi.co.in", "State Bank of India"),
    ("kotak", "Kotak Mahindra Bank"),
    ("yesbank", "Yes Bank"),
    ("idfcfirstbank", "IDFC First Bank"),
];

/// Credit-class keywords are checked first: they're the more specific
/// signal (a generic "debit" scan would false-positive on "credited").
pub fn detect_direction(text: &str) -> Direction {
    let lower = text.to_lowercase();
    if CREDIT_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Direction::Credit;
    }
    if DEBIT_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Direction::Debit;
    }
    Direction::Debit
}

pub fn detect_bank(from: &str, subject: &str, body: &str) -> Option<String> {
    let haystack = format!("{from} {subject} {body}").to_lowercase();
    BANK_PATTERNS
        .iter()
        .find(|(pattern, _)| haystack.contains(pattern))
        .map(|(_, name)| name.to_string())
}

pub fn extract_masked_account(haystack: &str) -> Option<String> {
    MASKED_ACCOUNT_RE
        .captures(haystack)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn extract_reference(haystack: &str) -> Option<String> {
    REFERENCE_RE
        .captures(haystack)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn extract_merchant(haystack: &str) -> Option<String> {
    MERCHANT_RE
        .captures(haystack)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Tries a short list of common Indian-bank date formats against the first
/// `dd[-/]mm[-/]yy(yy)` token found in the text.
pub fn extract_inline_date(haystack: &str) -> Option<NaiveDate> {
    let raw = INLINE_DATE_RE.find(haystack)?.as_str();
    for fmt in ["%d-%m-%Y", "%d/%m/%Y", "%d-%m-%y", "%d/%m/%y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(date);
        }
    }
    None
}

pub fn parse_email_date(date_str: &str) -> NaiveDate {
    chrono::DateTime::parse_from_rfc3339(date_str)
        .map(|d| d.date_naive())
        .unwrap_or_else(|_| Utc::now().date_naive())
}

#[derive(Debug, Clone)]
pub struct CommonFields {
    pub amount: f64,
    pub direction: Direction,
    pub account: Option<String>,
    pub bank: Option<String>,
    pub reference: Option<String>,
    pub merchant: Option<String>,
    pub date: NaiveDate,
}

/// Runs the shared regex battery over an email's subject + body. `None`
/// when no amount can be extracted — the one field every format needs.
pub fn extract_common(from: &str, subject: &str, body: &str, default_date: NaiveDate) -> Option<CommonFields> {
    let haystack = format!("{subject} {body}");
    let amount_match = AMOUNT_RE.captures(&haystack)?;
    let amount_text = amount_match
        .get(1)
        .or_else(|| amount_match.get(2))
        .map(|m| m.as_str())?;
    let amount = normalize_amount(amount_text)?;

    Some(CommonFields {
        amount,
        direction: detect_direction(&haystack),
        account: extract_masked_account(&haystack),
        bank: detect_bank(from, subject, body),
        reference: extract_reference(&haystack),
        merchant: extract_merchant(&haystack),
        date: extract_inline_date(&haystack).unwrap_or(default_date),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credit_keyword_wins_over_debit_substring() {
        assert_eq!(detect_direction("Your account has been credited"), Direction::Credit);
        assert_eq!(detect_direction("Rs.500 debited from your account"), Direction::Debit);
    }

    #[test]
    fn defaults_to_debit_when_no_keyword_present() {
        assert_eq!(detect_direction("transaction alert"), Direction::Debit);
    }

    #[test]
    fn bank_detection_scans_from_address() {
        assert_eq!(
            detect_bank("alerts@hdfcbank.net", "subject", "body"),
            Some("HDFC Bank".to_string())
        );
    }

    #[test]
    fn extract_common_finds_amount_direction_and_account() {
        let fields = extract_common(
            "alerts@icicibank.com",
            "Transaction alert",
            "Rs.1,500.00 debited from A/c XX1234 on 15-01-2025. Info: UPI-Ref No 123456789012",
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        )
        .unwrap();
        assert_eq!(fields.amount, 1500.0);
        assert_eq!(fields.direction, Direction::Debit);
        assert_eq!(fields.account.as_deref(), Some("XX1234"));
        assert_eq!(fields.bank.as_deref(), Some("ICICI Bank"));
        assert_eq!(fields.date, NaiveDate::from_ymd_opt(2025, 1, 15).unwrap());
    }

    #[test]
    fn extract_common_none_when_no_amount_present() {
        assert!(extract_common("a@b.com", "hello", "no numbers here", Utc::now().date_naive()).is_none());
    }
}
