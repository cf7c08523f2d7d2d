//! Natural-language query engine: generate SQL, guard it, execute it
//! read-only, then interpret the result back into prose. Always yields
//! some response — interpretation failure falls back to the raw table.

pub mod guard;

use serde_json::Value as JsonValue;

use crate::llm::{strip_fences, LlmGateway, OutputFormat};
use crate::store::Store;

const SCHEMA_CONTEXT: &str = "\
Tables:
raw_emails(message_id TEXT PRIMARY KEY, from_addr TEXT, subject TEXT, date TEXT, body_text TEXT, body_html TEXT, fetched_at TEXT)
transactions(id TEXT PRIMARY KEY, email_message_id TEXT, date TEXT 'YYYY-MM-DD', amount REAL, currency TEXT, direction TEXT 'debit'|'credit', type TEXT 'upi'|'credit_card'|'bank_transfer'|'sip'|'loan', merchant TEXT, account TEXT, bank TEXT, reference TEXT, description TEXT, category TEXT, source TEXT 'regex'|'ai', confidence REAL, needs_review INTEGER 0|1, created_at TEXT, updated_at TEXT)
category_corrections(id INTEGER PRIMARY KEY, merchant TEXT, description TEXT, original_category TEXT, corrected_category TEXT, created_at TEXT)
duplicate_groups(id INTEGER PRIMARY KEY, kept_transaction_id TEXT, duplicate_transaction_id TEXT UNIQUE, reason TEXT, confidence REAL, created_at TEXT)
sync_state(key TEXT PRIMARY KEY, value TEXT)
eval_flags(id INTEGER PRIMARY KEY, transaction_id TEXT, verdict TEXT 'correct'|'wrong', notes TEXT, created_at TEXT)";

const CANNOT_ANSWER_SENTINEL: &str = "CANNOT_ANSWER";

#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub answer: String,
    pub sql: Option<String>,
    pub rows: Option<Vec<Vec<JsonValue>>>,
    pub error: Option<String>,
}

pub async fn ask(store: &Store, gateway: &LlmGateway, question: &str) -> QueryResponse {
    let generation_prompt = format!(
        "{SCHEMA_CONTEXT}\n\n\
Write a single SQLite SELECT or WITH statement (no explanation, no markdown fences) that answers \
this question: \"{question}\"\n\
If the question cannot be answered from this schema, respond with exactly: \
SELECT '{CANNOT_ANSWER_SENTINEL}' as error;"
    );

    let generation = gateway.run(&generation_prompt, OutputFormat::Text).await;
    if !generation.ok {
        return QueryResponse {
            answer: "could not generate a query".to_string(),
            sql: None,
            rows: None,
            error: generation.error,
        };
    }

    let sql = strip_fences(&generation.output).trim().to_string();
    if sql.contains(CANNOT_ANSWER_SENTINEL) {
        return QueryResponse {
            answer: "that question can't be answered from the data this tool tracks".to_string(),
            sql: Some(sql),
            rows: None,
            error: None,
        };
    }

    if let Err(rejection) = guard::check_read_only(&sql) {
        return QueryResponse {
            answer: "query rejected: only read-only statements are permitted".to_string(),
            sql: Some(sql),
            rows: None,
            error: Some(rejection.to_string()),
        };
    }

    let (columns, rows) = match store.execute_readonly_query(&sql).await {
        Ok(result) => result,
        Err(e) => {
            return QueryResponse {
                answer: format!("query failed: {e}"),
                sql: Some(sql),
                rows: None,
                error: Some(e.to_string()),
            }
        }
    };

    let table = render_table(&columns, &rows);
    let interpretation_prompt = format!(
        "The user asked: \"{question}\"\nThe query returned this table (showing up to 100 rows):\n{table}\n\n\
Answer the user's question in one or two sentences based on this data."
    );
    let interpretation = gateway.run(&interpretation_prompt, OutputFormat::Text).await;
    let answer = if interpretation.ok && !interpretation.output.trim().is_empty() {
        interpretation.output.trim().to_string()
    } else {
        table.clone()
    };

    QueryResponse {
        answer,
        sql: Some(sql),
        rows: Some(rows),
        error: None,
    }
}

fn render_table(columns: &[String], rows: &[Vec<JsonValue>]) -> String {
    let mut out = columns.join(" | ");
    out.push('\n');
    for row in rows.iter().take(100) {
        let cells: Vec<String> = row
            .iter()
            .map(|v| match v {
                JsonValue::Null => "NULL".to_string(),
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        out.push_str(&cells.join(" | "));
        out.push('\n');
    }
    out
}
