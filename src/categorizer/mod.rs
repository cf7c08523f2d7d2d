//! Categorizer — assigns one of the closed category labels to a
//! transaction, conditioning the model on the merchant's correction
//! history so adjudications stick.

use serde::Deserialize;

use crate::config::CategoriesConfig;
use crate::llm::LlmGateway;
use crate::store::{CategoryCorrection, Store, Transaction};

pub const FALLBACK_CATEGORY: &str = "Other";

#[derive(Debug, Clone, PartialEq)]
pub struct CategoryResult {
    pub category: String,
    pub confidence: f64,
}

impl CategoryResult {
    fn fallback() -> Self {
        Self {
            category: FALLBACK_CATEGORY.to_string(),
            confidence: 0.0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CategoryResponse {
    category: String,
    confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CategoryBatchResponse {
    categories: Vec<CategoryResponse>,
}

/// Merchant-keyed corrections first, backfilled by overall recency up to
/// a combined cap of 10 — the primary signal the model is told to treat
/// as authoritative.
async fn gather_corrections(store: &Store, merchant: &str) -> Vec<CategoryCorrection> {
    let mut corrections = store.corrections_by_merchant(merchant, 10).await.unwrap_or_default();
    if corrections.len() < 10 {
        let exclude: Vec<i64> = corrections.iter().map(|c| c.id).collect();
        let remaining = 10 - corrections.len();
        if let Ok(backfill) = store.recent_corrections(remaining, &exclude).await {
            corrections.extend(backfill);
        }
    }
    corrections
}

fn categories_block(config: &CategoriesConfig) -> String {
    config
        .list
        .iter()
        .map(|name| {
            let description = config.descriptions.get(name).cloned().unwrap_or_default();
            format!("- {name}: {description}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn corrections_block(corrections: &[CategoryCorrection]) -> String {
    if corrections.is_empty() {
        return String::new();
    }
    let lines = corrections
        .iter()
        .map(|c| format!("- was {} -> corrected to {}", c.original_category, c.corrected_category))
        .collect::<Vec<_>>()
        .join("\n");
    format!("\nPrior corrections for this merchant (treat as authoritative):\n{lines}\n")
}

fn single_prompt(config: &CategoriesConfig, corrections: &[CategoryCorrection], transaction: &Transaction) -> String {
    format!(
        "Categorize this transaction into exactly one of the following categories:\n{}\n{}\n\
Transaction: merchant={}, amount={}, direction={:?}, description={:?}\n\n\
Respond with JSON: {{\"category\": string, \"confidence\": number}}",
        categories_block(config),
        corrections_block(corrections),
        transaction.merchant,
        transaction.amount,
        transaction.direction,
        transaction.description,
    )
}

fn resolve(config: &CategoriesConfig, response: CategoryResponse) -> CategoryResult {
    if config.list.contains(&response.category) {
        CategoryResult {
            category: response.category,
            confidence: response.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
        }
    } else {
        CategoryResult::fallback()
    }
}

pub async fn categorize(
    store: &Store,
    gateway: &LlmGateway,
    config: &CategoriesConfig,
    transaction: &Transaction,
) -> CategoryResult {
    let corrections = gather_corrections(store, &transaction.merchant).await;
    let prompt = single_prompt(config, &corrections, transaction);
    match gateway.run_json::<CategoryResponse>(&prompt).await {
        Some(response) => resolve(config, response),
        None => CategoryResult::fallback(),
    }
}

async fn corrections_note(store: &Store, merchant: &str) -> String {
    let corrections = gather_corrections(store, merchant).await;
    if corrections.is_empty() {
        return String::new();
    }
    let lines = corrections
        .iter()
        .take(3)
        .map(|c| format!("was {} -> {}", c.original_category, c.corrected_category))
        .collect::<Vec<_>>()
        .join("; ");
    format!(" [prior corrections: {lines}]")
}

/// Same prompt structure as `categorize`, but a numbered list and an
/// expected array response. A length mismatch falls through to
/// per-transaction calls rather than guessing an alignment.
pub async fn categorize_batch(
    store: &Store,
    gateway: &LlmGateway,
    config: &CategoriesConfig,
    transactions: &[Transaction],
) -> Vec<CategoryResult> {
    if transactions.is_empty() {
        return Vec::new();
    }

    let mut lines = Vec::with_capacity(transactions.len());
    for (i, t) in transactions.iter().enumerate() {
        let note = corrections_note(store, &t.merchant).await;
        lines.push(format!(
            "{}. merchant={}, amount={}, direction={:?}{}",
            i + 1,
            t.merchant,
            t.amount,
            t.direction,
            note,
        ));
    }

    let prompt = format!(
        "Categorize each of the following {} transactions into exactly one of these categories:\n{}\n\n{}\n\n\
Respond with JSON: {{\"categories\": [{{\"category\": string, \"confidence\": number}}, ...]}} in the same order.",
        transactions.len(),
        categories_block(config),
        lines.join("\n"),
    );

    match gateway.run_json::<CategoryBatchResponse>(&prompt).await {
        Some(response) if response.categories.len() == transactions.len() => {
            response.categories.into_iter().map(|r| resolve(config, r)).collect()
        }
        _ => {
            let mut results = Vec::with_capacity(transactions.len());
            for t in transactions {
                results.push(categorize(store, gateway, config, t).await);
            }
            results
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::llm::{ProcessOutput, ProcessRunner};
    use crate::store::{Direction, Source, TransactionType};
    use async_trait::async_trait;
    use chrono::NaiveDate;
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

    fn transaction(merchant: &str) -> Transaction {
        Transaction::new(
            "msg-1",
            NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            500.0,
            "INR",
            Direction::Debit,
            TransactionType::Upi,
            merchant,
            None,
            None,
            None,
            None,
            Source::Regex,
            None,
            0.7,
        )
    }

    #[tokio::test]
    async fn valid_category_response_is_used_verbatim() {
        let store = Store::open_in_memory().unwrap();
        let config = Config::default();
        let runner = CannedRunner {
            responses: Mutex::new(vec![ok_output(r#"{"category": "Food", "confidence": 0.92}"#)]),
        };
        let gateway = LlmGateway::new(Box::new(runner));

        let result = categorize(&store, &gateway, &config.categories, &transaction("Swiggy")).await;
        assert_eq!(result, CategoryResult { category: "Food".to_string(), confidence: 0.92 });
    }

    #[tokio::test]
    async fn unknown_category_falls_back_to_other() {
        let store = Store::open_in_memory().unwrap();
        let config = Config::default();
        let runner = CannedRunner {
            responses: Mutex::new(vec![ok_output(r#"{"category": "NotARealCategory", "confidence": 0.9}"#)]),
        };
        let gateway = LlmGateway::new(Box::new(runner));

        let result = categorize(&store, &gateway, &config.categories, &transaction("Swiggy")).await;
        assert_eq!(result, CategoryResult::fallback());
    }

    #[tokio::test]
    async fn model_failure_falls_back_to_other() {
        let store = Store::open_in_memory().unwrap();
        let config = Config::default();
        let runner = CannedRunner {
            responses: Mutex::new(vec![Ok(ProcessOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "boom".to_string(),
            })]),
        };
        let gateway = LlmGateway::new(Box::new(runner));

        let result = categorize(&store, &gateway, &config.categories, &transaction("Swiggy")).await;
        assert_eq!(result, CategoryResult::fallback());
    }

    #[tokio::test]
    async fn correction_for_merchant_appears_verbatim_in_subsequent_prompt() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_category_correction("Swiggy", "Other", "Food", None)
            .await
            .unwrap();

        let corrections = gather_corrections(&store, "Swiggy").await;
        assert_eq!(corrections.len(), 1);
        let config = Config::default();
        let prompt = single_prompt(&config.categories, &corrections, &transaction("Swiggy"));
        assert!(prompt.contains("was Other -> corrected to Food"));
    }

    #[tokio::test]
    async fn batch_length_mismatch_falls_through_to_per_transaction_calls() {
        let store = Store::open_in_memory().unwrap();
        let config = Config::default();
        let runner = CannedRunner {
            responses: Mutex::new(vec![
                ok_output(r#"{"categories": [{"category": "Food", "confidence": 0.9}]}"#),
                ok_output(r#"{"category": "Food", "confidence": 0.9}"#),
                ok_output(r#"{"category": "Transport", "confidence": 0.8}"#),
            ]),
        };
        let gateway = LlmGateway::new(Box::new(runner));

        let transactions = vec![transaction("Swiggy"), transaction("Uber")];
        let results = categorize_batch(&store, &gateway, &config.categories, &transactions).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].category, "Food");
        assert_eq!(results[1].category, "Transport");
    }
}
