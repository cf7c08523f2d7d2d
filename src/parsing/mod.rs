//! Parsing pipeline: ordered deterministic parsers with an AI fallback,
//! unified behind one dispatch function that enforces the fallthrough
//! rule described on `dispatch_deterministic`.

pub mod ai;
pub mod amount;
pub mod common;
pub mod parsers;

use tracing::{info, warn};

use crate::llm::LlmGateway;
use crate::store::{RawEmail, Transaction};

pub use parsers::{default_parsers, dispatch_deterministic, ParseContext, Parser};

/// Runs the full pipeline for one email: deterministic parsers first, AI
/// fallback only if none of them produced a non-empty result. Never
/// returns an error — an unparseable email yields an empty `Vec` and is
/// logged, not thrown.
pub async fn parse_email(
    email: &RawEmail,
    parsers: &[Box<dyn Parser>],
    gateway: &LlmGateway,
    ctx: &ParseContext,
    body_truncation_limit: usize,
) -> Vec<Transaction> {
    if let Some(transactions) = dispatch_deterministic(email, parsers, ctx) {
        info!(message_id = %email.message_id, count = transactions.len(), "parsed by deterministic tier");
        return transactions;
    }

    let transactions = ai::parse(email, gateway, ctx, body_truncation_limit).await;
    if transactions.is_empty() {
        warn!(message_id = %email.message_id, "email could not be parsed by any tier");
    } else {
        info!(message_id = %email.message_id, count = transactions.len(), "parsed by ai fallback tier");
    }
    transactions
}
