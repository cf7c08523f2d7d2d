//! Dedup engine — candidate selection lives in the store (pure SQL, no
//! LLM involvement); this module adds the AI pairwise confirmation step
//! and idempotent group recording.

use serde::Deserialize;
use tracing::info;

use crate::config::DedupConfig;
use crate::llm::LlmGateway;
use crate::store::{Store, Transaction};

#[derive(Debug, Deserialize)]
struct DuplicateJudgment {
    #[serde(rename = "isDuplicate")]
    is_duplicate: bool,
    confidence: Option<f64>,
}

fn build_prompt(a: &Transaction, b: &Transaction) -> String {
    format!(
        "Are these two bank transactions the same real-world event reported twice (e.g. by two \
different notification channels), or are they genuinely distinct?\n\
Transaction A: amount={}, merchant={}, date={}, bank={:?}, reference={:?}, email={}\n\
Transaction B: amount={}, merchant={}, date={}, bank={:?}, reference={:?}, email={}\n\n\
Respond with JSON: {{\"isDuplicate\": bool, \"confidence\": number}}",
        a.amount, a.merchant, a.date, a.bank, a.reference, a.email_message_id,
        b.amount, b.merchant, b.date, b.bank, b.reference, b.email_message_id,
    )
}

#[derive(Debug, Clone, Default)]
pub struct DedupOutcome {
    pub candidates_examined: usize,
    pub duplicates_found: usize,
}

/// Runs candidate selection + AI confirmation over the whole table (or,
/// when `new_ids` is given, over pairs touching at least one new id).
/// Re-running over already-processed data adds no new group records —
/// the `duplicate_transaction_id` uniqueness constraint on the store
/// makes this idempotent by construction.
pub async fn run(
    store: &Store,
    gateway: &LlmGateway,
    config: &DedupConfig,
    new_ids: Option<&[String]>,
) -> anyhow::Result<DedupOutcome> {
    let candidates = store.dedup_candidates(config.date_tolerance_days, new_ids).await?;
    let mut outcome = DedupOutcome {
        candidates_examined: candidates.len(),
        duplicates_found: 0,
    };

    for (a, b) in candidates {
        let prompt = build_prompt(&a, &b);
        let judgment: Option<DuplicateJudgment> = gateway.run_json(&prompt).await;
        let Some(judgment) = judgment else { continue };
        if !judgment.is_duplicate {
            continue;
        }

        let (kept, duplicate) = if a.id < b.id { (&a, &b) } else { (&b, &a) };
        let confidence = judgment.confidence.map(|c| c.clamp(0.0, 1.0));
        let recorded = store
            .mark_as_duplicate(&duplicate.id, &kept.id, "ai pairwise confirmation", confidence)
            .await?;
        if recorded {
            outcome.duplicates_found += 1;
            info!(kept = %kept.id, duplicate = %duplicate.id, "recorded duplicate group");
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ProcessOutput, ProcessRunner};
    use crate::store::{Direction, Source, TransactionType};
    use async_trait::async_trait;
    use chrono::{NaiveDate, Utc};
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

    async fn seed_candidate_pair(store: &Store) {
        use crate::store::RawEmail;
        store
            .insert_raw_email(&RawEmail {
                message_id: "msg-1".to_string(),
                from: "alerts@hdfcbank.net".to_string(),
                subject: "alert".to_string(),
                date: Utc::now().to_rfc3339(),
                body_text: "body".to_string(),
                body_html: None,
                fetched_at: Utc::now().to_rfc3339(),
            })
            .await
            .unwrap();
        store
            .insert_raw_email(&RawEmail {
                message_id: "msg-2".to_string(),
                from: "alerts@hdfcbank.net".to_string(),
                subject: "alert".to_string(),
                date: Utc::now().to_rfc3339(),
                body_text: "body".to_string(),
                body_html: None,
                fetched_at: Utc::now().to_rfc3339(),
            })
            .await
            .unwrap();

        let mut t1 = Transaction::new(
            "msg-1",
            NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            500.0,
            "INR",
            Direction::Debit,
            TransactionType::Upi,
            "Amazon",
            None,
            None,
            None,
            None,
            Source::Regex,
            None,
            0.7,
        );
        t1.id = "tx-1".to_string();
        let mut t2 = t1.clone();
        t2.id = "tx-2".to_string();
        t2.email_message_id = "msg-2".to_string();

        store.insert_transaction(&t1).await.unwrap();
        store.insert_transaction(&t2).await.unwrap();
    }

    #[tokio::test]
    async fn confirmed_duplicate_marks_the_later_id() {
        let store = Store::open_in_memory().unwrap();
        seed_candidate_pair(&store).await;
        let config = DedupConfig { date_tolerance_days: 1 };
        let runner = CannedRunner {
            responses: Mutex::new(vec![ok_output(r#"{"isDuplicate": true, "confidence": 0.95}"#)]),
        };
        let gateway = LlmGateway::new(Box::new(runner));

        let outcome = run(&store, &gateway, &config, None).await.unwrap();
        assert_eq!(outcome.duplicates_found, 1);

        let dup = store.get_transaction("tx-2").await.unwrap().unwrap();
        assert!(dup.needs_review);
    }

    #[tokio::test]
    async fn rerunning_over_processed_data_adds_no_new_groups() {
        let store = Store::open_in_memory().unwrap();
        seed_candidate_pair(&store).await;
        let config = DedupConfig { date_tolerance_days: 1 };

        let runner = CannedRunner {
            responses: Mutex::new(vec![
                ok_output(r#"{"isDuplicate": true, "confidence": 0.95}"#),
                ok_output(r#"{"isDuplicate": true, "confidence": 0.95}"#),
            ]),
        };
        let gateway = LlmGateway::new(Box::new(runner));

        let first = run(&store, &gateway, &config, None).await.unwrap();
        let second = run(&store, &gateway, &config, None).await.unwrap();
        assert_eq!(first.duplicates_found, 1);
        assert_eq!(second.duplicates_found, 0);
    }

    #[tokio::test]
    async fn non_duplicate_judgment_records_nothing() {
        let store = Store::open_in_memory().unwrap();
        seed_candidate_pair(&store).await;
        let config = DedupConfig { date_tolerance_days: 1 };
        let runner = CannedRunner {
            responses: Mutex::new(vec![ok_output(r#"{"isDuplicate": false, "confidence": 0.2}"#)]),
        };
        let gateway = LlmGateway::new(Box::new(runner));

        let outcome = run(&store, &gateway, &config, None).await.unwrap();
        assert_eq!(outcome.duplicates_found, 0);
    }
}
