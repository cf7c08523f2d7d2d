//! Store entity types. Each derives `Debug, Clone, Serialize, Deserialize`
//! so rows round-trip cleanly through JSON at the CLI boundary.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Debit => "debit",
            Direction::Credit => "credit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "debit" => Some(Direction::Debit),
            "credit" => Some(Direction::Credit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Upi,
    CreditCard,
    BankTransfer,
    Sip,
    Loan,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Upi => "upi",
            TransactionType::CreditCard => "credit_card",
            TransactionType::BankTransfer => "bank_transfer",
            TransactionType::Sip => "sip",
            TransactionType::Loan => "loan",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upi" => Some(TransactionType::Upi),
            "credit_card" => Some(TransactionType::CreditCard),
            "bank_transfer" => Some(TransactionType::BankTransfer),
            "sip" => Some(TransactionType::Sip),
            "loan" => Some(TransactionType::Loan),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Regex,
    Ai,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Regex => "regex",
            Source::Ai => "ai",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "regex" => Some(Source::Regex),
            "ai" => Some(Source::Ai),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalVerdict {
    Correct,
    Wrong,
}

impl EvalVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvalVerdict::Correct => "correct",
            EvalVerdict::Wrong => "wrong",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "correct" => Some(EvalVerdict::Correct),
            "wrong" => Some(EvalVerdict::Wrong),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEmail {
    pub message_id: String,
    pub from: String,
    pub subject: String,
    pub date: String,
    pub body_text: String,
    pub body_html: Option<String>,
    pub fetched_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub email_message_id: String,
    pub date: NaiveDate,
    pub amount: f64,
    pub currency: String,
    pub direction: Direction,
    pub r#type: TransactionType,
    pub merchant: String,
    pub account: Option<String>,
    pub bank: Option<String>,
    pub reference: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub source: Source,
    pub confidence: Option<f64>,
    pub needs_review: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl Transaction {
    /// New-transaction constructor: generates a fresh id and derives
    /// `needs_review` from `(source, confidence)` rather than leaving it
    /// for callers to set ad hoc.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        email_message_id: impl Into<String>,
        date: NaiveDate,
        amount: f64,
        currency: impl Into<String>,
        direction: Direction,
        r#type: TransactionType,
        merchant: impl Into<String>,
        account: Option<String>,
        bank: Option<String>,
        reference: Option<String>,
        description: Option<String>,
        source: Source,
        confidence: Option<f64>,
        review_threshold: f64,
    ) -> Self {
        let now = Utc::now().to_rfc3339();
        let needs_review = match source {
            Source::Ai => confidence.map(|c| c < review_threshold).unwrap_or(true),
            Source::Regex => false,
        };
        Transaction {
            id: uuid::Uuid::new_v4().to_string(),
            email_message_id: email_message_id.into(),
            date,
            amount,
            currency: currency.into(),
            direction,
            r#type,
            merchant: merchant.into(),
            account,
            bank,
            reference,
            description,
            category: None,
            source,
            confidence,
            needs_review,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryCorrection {
    pub id: i64,
    pub merchant: String,
    pub description: Option<String>,
    pub original_category: String,
    pub corrected_category: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub id: i64,
    pub kept_transaction_id: String,
    pub duplicate_transaction_id: String,
    pub reason: String,
    pub confidence: Option<f64>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalFlag {
    pub id: i64,
    pub transaction_id: String,
    pub verdict: EvalVerdict,
    pub notes: Option<String>,
    pub created_at: String,
}

/// Filters shared by the read-side of the store.
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub r#type: Option<TransactionType>,
    pub category: Option<String>,
    pub direction: Option<Direction>,
    pub bank: Option<String>,
    pub needs_review: Option<bool>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}
