//! AI fallback parser — invoked when no deterministic parser produces a
//! non-empty result. Builds a bounded prompt, calls the model in JSON
//! mode, and validates/coerces every field rather than trusting the
//! response shape.

use chrono::NaiveDate;
use serde::Deserialize;
use tracing::warn;

use crate::llm::LlmGateway;
use crate::parsing::amount::normalize_amount;
use crate::parsing::common::parse_email_date;
use crate::parsing::parsers::ParseContext;
use crate::store::{Direction, RawEmail, Source, Transaction, TransactionType};

#[derive(Debug, Deserialize)]
struct AiTransactionsResponse {
    transactions: Vec<AiTransactionDraft>,
}

#[derive(Debug, Deserialize)]
struct AiTransactionDraft {
    amount: serde_json::Value,
    direction: Option<String>,
    r#type: Option<String>,
    merchant: Option<String>,
    account: Option<String>,
    bank: Option<String>,
    reference: Option<String>,
    description: Option<String>,
    date: Option<String>,
    confidence: Option<f64>,
}

fn build_prompt(email: &RawEmail, body_truncation_limit: usize) -> String {
    let truncated_body: String = email.body_text.chars().take(body_truncation_limit).collect();
    format!(
        "Extract every financial transaction from this bank notification email.\n\
Subject: {}\nFrom: {}\nDate: {}\nBody:\n{}\n\n\
Respond with JSON only: {{\"transactions\": [{{\"amount\": number, \"direction\": \"debit\"|\"credit\", \
\"type\": \"upi\"|\"credit_card\"|\"bank_transfer\"|\"sip\"|\"loan\", \"merchant\": string, \
\"account\": string|null, \"bank\": string|null, \"reference\": string|null, \"description\": string|null, \
\"date\": \"YYYY-MM-DD\"|null, \"confidence\": number}}]}}",
        email.subject, email.from, email.date, truncated_body,
    )
}

fn coerce_amount(raw: &serde_json::Value) -> Option<f64> {
    match raw {
        serde_json::Value::Number(n) => n.as_f64().filter(|v| *v > 0.0),
        serde_json::Value::String(s) => normalize_amount(s),
        _ => None,
    }
}

fn draft_to_transaction(draft: AiTransactionDraft, email: &RawEmail, ctx: &ParseContext, default_date: NaiveDate) -> Option<Transaction> {
    let amount = coerce_amount(&draft.amount)?;
    let direction = draft.direction.as_deref().and_then(Direction::parse).unwrap_or(Direction::Debit);
    let r#type = draft.r#type.as_deref().and_then(TransactionType::parse).unwrap_or(TransactionType::BankTransfer);
    let confidence = draft.confidence.unwrap_or(0.5).clamp(0.0, 1.0);
    let date = draft
        .date
        .as_deref()
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        .unwrap_or(default_date);
    let merchant = draft.merchant.unwrap_or_else(|| "Unknown".to_string());

    Some(Transaction::new(
        email.message_id.clone(),
        date,
        amount,
        ctx.currency.clone(),
        direction,
        r#type,
        merchant,
        draft.account,
        draft.bank,
        draft.reference,
        draft.description,
        Source::Ai,
        Some(confidence),
        ctx.review_threshold,
    ))
}

/// Never returns an error: a model failure, malformed output, or a wholly
/// invalid response all degrade to an empty result so the caller can log
/// and move on, per the "unparseable is not an exception" contract.
pub async fn parse(
    email: &RawEmail,
    gateway: &LlmGateway,
    ctx: &ParseContext,
    body_truncation_limit: usize,
) -> Vec<Transaction> {
    let prompt = build_prompt(email, body_truncation_limit);
    let response: Option<AiTransactionsResponse> = gateway.run_json(&prompt).await;
    let Some(response) = response else {
        warn!(message_id = %email.message_id, "ai fallback parser produced no usable output");
        return Vec::new();
    };

    let default_date = parse_email_date(&email.date);
    response
        .transactions
        .into_iter()
        .filter_map(|draft| draft_to_transaction(draft, email, ctx, default_date))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ProcessOutput, ProcessRunner};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    struct CannedRunner {
        responses: Mutex<Vec<anyhow::Result<ProcessOutput>>>,
    }

    #[async_trait]
    impl ProcessRunner for CannedRunner {
        async fn run(&self, _args: &[String]) -> anyhow::Result<ProcessOutput> {
            let mut queue = self.responses.lock().unwrap();
            if queue.is_empty() {
                anyhow::bail!("canned queue exhausted");
            }
            queue.remove(0)
        }
    }

    fn ok_output(stdout: &str) -> anyhow::Result<ProcessOutput> {
        Ok(ProcessOutput {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }

    fn email() -> RawEmail {
        RawEmail {
            message_id: "msg-1".to_string(),
            from: "alerts@hdfcbank.net".to_string(),
            subject: "Transaction alert".to_string(),
            date: Utc::now().to_rfc3339(),
            body_text: "some unstructured bank text".to_string(),
            body_html: None,
            fetched_at: Utc::now().to_rfc3339(),
        }
    }

    fn ctx() -> ParseContext {
        ParseContext {
            currency: "INR".to_string(),
            review_threshold: 0.7,
        }
    }

    #[tokio::test]
    async fn high_confidence_result_does_not_need_review() {
        let runner = CannedRunner {
            responses: Mutex::new(vec![ok_output(
                r#"{"transactions": [{"amount": 500, "direction": "debit", "type": "upi", "merchant": "Swiggy", "confidence": 0.95}]}"#,
            )]),
        };
        let gateway = LlmGateway::new(Box::new(runner));
        let txs = parse(&email(), &gateway, &ctx(), 8000).await;
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].source, Source::Ai);
        assert!(!txs[0].needs_review);
    }

    #[tokio::test]
    async fn low_confidence_result_needs_review() {
        let runner = CannedRunner {
            responses: Mutex::new(vec![ok_output(
                r#"{"transactions": [{"amount": 500, "direction": "debit", "type": "upi", "merchant": "Swiggy", "confidence": 0.5}]}"#,
            )]),
        };
        let gateway = LlmGateway::new(Box::new(runner));
        let txs = parse(&email(), &gateway, &ctx(), 8000).await;
        assert!(txs[0].needs_review);
    }

    #[tokio::test]
    async fn invalid_direction_defaults_to_debit() {
        let runner = CannedRunner {
            responses: Mutex::new(vec![ok_output(
                r#"{"transactions": [{"amount": 500, "direction": "sideways", "merchant": "Swiggy"}]}"#,
            )]),
        };
        let gateway = LlmGateway::new(Box::new(runner));
        let txs = parse(&email(), &gateway, &ctx(), 8000).await;
        assert_eq!(txs[0].direction, Direction::Debit);
    }

    #[tokio::test]
    async fn non_positive_amount_entry_is_dropped() {
        let runner = CannedRunner {
            responses: Mutex::new(vec![ok_output(
                r#"{"transactions": [{"amount": -5, "merchant": "Bad"}, {"amount": 500, "merchant": "Good"}]}"#,
            )]),
        };
        let gateway = LlmGateway::new(Box::new(runner));
        let txs = parse(&email(), &gateway, &ctx(), 8000).await;
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].merchant, "Good");
    }

    #[tokio::test]
    async fn model_process_failure_degrades_to_empty_list() {
        let runner = CannedRunner {
            responses: Mutex::new(vec![Ok(ProcessOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "boom".to_string(),
            })]),
        };
        let gateway = LlmGateway::new(Box::new(runner));
        let txs = parse(&email(), &gateway, &ctx(), 8000).await;
        assert!(txs.is_empty());
    }
}
