//! Review queue — transactions flagged `needs_review` by low-confidence
//! AI parsing or duplicate detection. Resolving one clears the flag and,
//! when the adjudication recategorizes, records a correction so the
//! categorizer learns from it on the next prompt for that merchant.

use anyhow::{Context, Result};

use crate::store::{Source, Store, Transaction};

pub async fn list(store: &Store, source: Option<Source>) -> Result<Vec<Transaction>> {
    store.review_queue(source).await
}

pub async fn count(store: &Store) -> Result<i64> {
    store.review_queue_count().await
}

/// Clears `needs_review` on `transaction_id`. If `corrected_category` is
/// given and differs from the transaction's current category, applies it
/// and records a correction keyed by merchant.
pub async fn resolve(store: &Store, transaction_id: &str, corrected_category: Option<&str>) -> Result<Transaction> {
    let transaction = store
        .get_transaction(transaction_id)
        .await?
        .with_context(|| format!("transaction not found: {transaction_id}"))?;

    if let Some(corrected) = corrected_category {
        if transaction.category.as_deref() != Some(corrected) {
            let original = transaction.category.as_deref().unwrap_or("Other");
            store
                .insert_category_correction(&transaction.merchant, original, corrected, transaction.description.as_deref())
                .await?;
            store.update_transaction_category(transaction_id, corrected).await?;
        }
    }

    store.update_transaction_review(transaction_id, false).await?;
    store
        .get_transaction(transaction_id)
        .await?
        .context("transaction vanished after resolve")
}
