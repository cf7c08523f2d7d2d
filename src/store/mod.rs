//! Store — schema, migrations, CRUD for raw emails, transactions, sync
//! state, corrections, dedup groups, eval flags. Single-writer,
//! `tokio::sync::Mutex<Connection>`, WAL + foreign keys enabled at open
//! time.

pub mod migrations;
pub mod models;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

use crate::error::AppErrorKind;

pub use models::*;

#[derive(Debug, Clone, Default)]
pub struct SyncStateSnapshot {
    pub last_sync_timestamp: Option<String>,
    pub last_message_id: Option<String>,
    pub total_synced_count: i64,
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let mut conn = Connection::open(db_path).context("opening store database")?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enabling WAL journaling")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("enabling foreign key enforcement")?;
        migrations::apply_pending(&mut conn).context("applying migrations")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().context("opening in-memory store")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::apply_pending(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // -- RawEmail writes ---------------------------------------------------

    pub async fn insert_raw_email(&self, email: &RawEmail) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO raw_emails
                 (message_id, from_addr, subject, date, body_text, body_html, fetched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    email.message_id,
                    email.from,
                    email.subject,
                    email.date,
                    email.body_text,
                    email.body_html,
                    email.fetched_at,
                ],
            )
            .context("inserting raw email")?;
        Ok(changed > 0)
    }

    pub async fn insert_raw_emails(&self, batch: &[RawEmail]) -> Result<Vec<String>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().context("starting raw email batch transaction")?;
        let mut inserted = Vec::new();
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO raw_emails
                 (message_id, from_addr, subject, date, body_text, body_html, fetched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for email in batch {
                let changed = stmt.execute(params![
                    email.message_id,
                    email.from,
                    email.subject,
                    email.date,
                    email.body_text,
                    email.body_html,
                    email.fetched_at,
                ])?;
                if changed > 0 {
                    inserted.push(email.message_id.clone());
                }
            }
        }
        tx.commit().context("committing raw email batch")?;
        Ok(inserted)
    }

    // -- Transaction writes --------------------------------------------------

    pub async fn insert_transaction(&self, transaction: &Transaction) -> Result<bool> {
        let conn = self.conn.lock().await;
        Self::insert_transaction_conn(&conn, transaction)
    }

    fn insert_transaction_conn(conn: &Connection, transaction: &Transaction) -> Result<bool> {
        // `OR IGNORE` below swallows the composite-key collision we want
        // silenced, but it would just as happily swallow a missing
        // `email_message_id` — check that ourselves first so a bad write
        // ordering surfaces as a fatal error instead of a quiet no-op.
        let email_exists: bool = conn
            .query_row(
                "SELECT 1 FROM raw_emails WHERE message_id = ?1",
                params![transaction.email_message_id],
                |_| Ok(()),
            )
            .optional()
            .context("checking raw email existence")?
            .is_some();
        if !email_exists {
            return Err(anyhow::anyhow!(
                "transaction {} references unknown email_message_id {}",
                transaction.id,
                transaction.email_message_id
            )
            .context(AppErrorKind::ForeignKeyViolation));
        }

        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO transactions
                 (id, email_message_id, date, amount, currency, direction, type, merchant,
                  account, bank, reference, description, category, source, confidence,
                  needs_review, created_at, updated_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
                params![
                    transaction.id,
                    transaction.email_message_id,
                    transaction.date.to_string(),
                    transaction.amount,
                    transaction.currency,
                    transaction.direction.as_str(),
                    transaction.r#type.as_str(),
                    transaction.merchant,
                    transaction.account,
                    transaction.bank,
                    transaction.reference,
                    transaction.description,
                    transaction.category,
                    transaction.source.as_str(),
                    transaction.confidence,
                    transaction.needs_review as i64,
                    transaction.created_at,
                    transaction.updated_at,
                ],
            )
            .map_err(|e| map_insert_error(e, "transaction"))?;
        Ok(changed > 0)
    }

    pub async fn insert_transactions(&self, batch: &[Transaction]) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .context("starting transaction batch")?;
        let mut count = 0;
        for transaction in batch {
            if Self::insert_transaction_conn(&tx, transaction)? {
                count += 1;
            }
        }
        tx.commit().context("committing transaction batch")?;
        Ok(count)
    }

    pub async fn update_transaction_category(&self, id: &str, category: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE transactions SET category = ?1, updated_at = ?2 WHERE id = ?3",
            params![category, Utc::now().to_rfc3339(), id],
        )
        .context("updating transaction category")?;
        Ok(())
    }

    pub async fn update_transaction_merchant(&self, id: &str, merchant: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE transactions SET merchant = ?1, updated_at = ?2 WHERE id = ?3",
            params![merchant, Utc::now().to_rfc3339(), id],
        )
        .context("updating transaction merchant")?;
        Ok(())
    }

    pub async fn update_transaction_review(&self, id: &str, needs_review: bool) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE transactions SET needs_review = ?1, updated_at = ?2 WHERE id = ?3",
            params![needs_review as i64, Utc::now().to_rfc3339(), id],
        )
        .context("updating transaction review flag")?;
        Ok(())
    }

    pub async fn insert_category_correction(
        &self,
        merchant: &str,
        original_category: &str,
        corrected_category: &str,
        description: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO category_corrections
             (merchant, description, original_category, corrected_category, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                merchant,
                description,
                original_category,
                corrected_category,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("inserting category correction")?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn mark_as_duplicate(
        &self,
        duplicate_transaction_id: &str,
        kept_transaction_id: &str,
        reason: &str,
        confidence: Option<f64>,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO duplicate_groups
                 (kept_transaction_id, duplicate_transaction_id, reason, confidence, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    kept_transaction_id,
                    duplicate_transaction_id,
                    reason,
                    confidence,
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("marking duplicate")?;
        if changed > 0 {
            conn.execute(
                "UPDATE transactions SET needs_review = 1, updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), duplicate_transaction_id],
            )?;
        }
        Ok(changed > 0)
    }

    pub async fn insert_eval_flag(
        &self,
        transaction_id: &str,
        verdict: EvalVerdict,
        notes: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO eval_flags (transaction_id, verdict, notes, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![transaction_id, verdict.as_str(), notes, Utc::now().to_rfc3339()],
        )
        .context("inserting eval flag")?;
        Ok(conn.last_insert_rowid())
    }

    // -- Reads ---------------------------------------------------------------

    /// Raw emails with no matching row in `transactions` — the reparse
    /// backlog.
    pub async fn raw_emails_missing_transactions(&self) -> Result<Vec<RawEmail>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT message_id, from_addr, subject, date, body_text, body_html, fetched_at
             FROM raw_emails
             WHERE message_id NOT IN (SELECT DISTINCT email_message_id FROM transactions)
             ORDER BY fetched_at ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RawEmail {
                    message_id: row.get(0)?,
                    from: row.get(1)?,
                    subject: row.get(2)?,
                    date: row.get(3)?,
                    body_text: row.get(4)?,
                    body_html: row.get(5)?,
                    fetched_at: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub async fn get_raw_email(&self, message_id: &str) -> Result<Option<RawEmail>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT message_id, from_addr, subject, date, body_text, body_html, fetched_at
             FROM raw_emails WHERE message_id = ?1",
            [message_id],
            |row| {
                Ok(RawEmail {
                    message_id: row.get(0)?,
                    from: row.get(1)?,
                    subject: row.get(2)?,
                    date: row.get(3)?,
                    body_text: row.get(4)?,
                    body_html: row.get(5)?,
                    fetched_at: row.get(6)?,
                })
            },
        )
        .optional()
        .context("fetching raw email")
    }

    pub async fn get_transaction(&self, id: &str) -> Result<Option<Transaction>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, email_message_id, date, amount, currency, direction, type, merchant,
                    account, bank, reference, description, category, source, confidence,
                    needs_review, created_at, updated_at
             FROM transactions WHERE id = ?1",
            [id],
            row_to_transaction,
        )
        .optional()
        .context("fetching transaction")
    }

    pub async fn list_transactions(&self, filter: &TransactionFilter) -> Result<Vec<Transaction>> {
        let conn = self.conn.lock().await;
        let (clause, values) = filter_clause(filter);
        let sql = format!(
            "SELECT id, email_message_id, date, amount, currency, direction, type, merchant,
                    account, bank, reference, description, category, source, confidence,
                    needs_review, created_at, updated_at
             FROM transactions {clause} ORDER BY date DESC
             LIMIT {} OFFSET {}",
            filter.limit.unwrap_or(100),
            filter.offset.unwrap_or(0),
        );
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> =
            values.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
        let rows = stmt.query_map(param_refs.as_slice(), row_to_transaction)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn count_transactions(&self, filter: &TransactionFilter) -> Result<i64> {
        let conn = self.conn.lock().await;
        let (clause, values) = filter_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM transactions {clause}");
        let param_refs: Vec<&dyn rusqlite::ToSql> =
            values.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
        let count: i64 = conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))?;
        Ok(count)
    }

    pub async fn review_queue(&self, source: Option<Source>) -> Result<Vec<Transaction>> {
        let conn = self.conn.lock().await;
        let sql = match source {
            Some(_) => {
                "SELECT id, email_message_id, date, amount, currency, direction, type, merchant,
                        account, bank, reference, description, category, source, confidence,
                        needs_review, created_at, updated_at
                 FROM transactions WHERE needs_review = 1 AND source = ?1 ORDER BY date DESC"
            }
            None => {
                "SELECT id, email_message_id, date, amount, currency, direction, type, merchant,
                        account, bank, reference, description, category, source, confidence,
                        needs_review, created_at, updated_at
                 FROM transactions WHERE needs_review = 1 ORDER BY date DESC"
            }
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = match source {
            Some(s) => stmt.query_map([s.as_str()], row_to_transaction)?.collect::<Result<Vec<_>, _>>(),
            None => stmt.query_map([], row_to_transaction)?.collect::<Result<Vec<_>, _>>(),
        }?;
        Ok(rows)
    }

    pub async fn review_queue_count(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM transactions WHERE needs_review = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Up to `limit` corrections for a specific merchant, most recent first.
    pub async fn corrections_by_merchant(
        &self,
        merchant: &str,
        limit: usize,
    ) -> Result<Vec<CategoryCorrection>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, merchant, description, original_category, corrected_category, created_at
             FROM category_corrections WHERE merchant = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![merchant, limit as i64], row_to_correction)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Most recent corrections overall, excluding the given ids.
    pub async fn recent_corrections(
        &self,
        limit: usize,
        exclude_ids: &[i64],
    ) -> Result<Vec<CategoryCorrection>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, merchant, description, original_category, corrected_category, created_at
             FROM category_corrections ORDER BY created_at DESC LIMIT ?1",
        )?;
        // Fetch a wider window than `limit` so excluding ids still leaves enough rows.
        let fetch_n = (limit + exclude_ids.len()) as i64;
        let rows = stmt
            .query_map([fetch_n], row_to_correction)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter(|c| !exclude_ids.contains(&c.id))
            .take(limit)
            .collect())
    }

    // -- Sync state ------------------------------------------------------------

    pub async fn get_sync_state(&self) -> Result<SyncStateSnapshot> {
        let conn = self.conn.lock().await;
        let mut snapshot = SyncStateSnapshot::default();
        let mut stmt = conn.prepare("SELECT key, value FROM sync_state")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (key, value) = row?;
            match key.as_str() {
                "last_sync_timestamp" => snapshot.last_sync_timestamp = Some(value),
                "last_message_id" => snapshot.last_message_id = Some(value),
                "total_synced_count" => snapshot.total_synced_count = value.parse().unwrap_or(0),
                _ => {}
            }
        }
        Ok(snapshot)
    }

    pub async fn record_sync(
        &self,
        sync_timestamp: &str,
        last_message_id: Option<&str>,
        newly_synced: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let current_total: i64 = conn
            .query_row(
                "SELECT value FROM sync_state WHERE key = 'total_synced_count'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        upsert_sync_kv(&conn, "last_sync_timestamp", sync_timestamp)?;
        if let Some(id) = last_message_id {
            upsert_sync_kv(&conn, "last_message_id", id)?;
        }
        upsert_sync_kv(
            &conn,
            "total_synced_count",
            &(current_total + newly_synced).to_string(),
        )?;
        Ok(())
    }

    // -- Dedup candidate selection ----------------------------------------------

    /// Cross-email pairs matching amount/direction within `date_tolerance_days`,
    /// canonically ordered `t1.id < t2.id` so each pair is emitted once. When
    /// `new_ids` is `Some`, at least one side of every returned pair is in it.
    pub async fn dedup_candidates(
        &self,
        date_tolerance_days: i64,
        new_ids: Option<&[String]>,
    ) -> Result<Vec<(Transaction, Transaction)>> {
        let conn = self.conn.lock().await;
        let sql = "SELECT a.id, b.id FROM transactions a JOIN transactions b
             ON a.amount = b.amount
             AND a.direction = b.direction
             AND a.id < b.id
             AND a.email_message_id != b.email_message_id
             AND ABS(julianday(a.date) - julianday(b.date)) <= ?1";
        let mut stmt = conn.prepare(sql)?;
        let mut pairs = Vec::new();
        let rows = stmt.query_map([date_tolerance_days], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (id_a, id_b) = row?;
            if let Some(new_ids) = new_ids {
                if !new_ids.contains(&id_a) && !new_ids.contains(&id_b) {
                    continue;
                }
            }
            pairs.push((id_a, id_b));
        }

        let mut out = Vec::new();
        for (id_a, id_b) in pairs {
            let ta = self.get_transaction_conn(&conn, &id_a)?;
            let tb = self.get_transaction_conn(&conn, &id_b)?;
            if let (Some(a), Some(b)) = (ta, tb) {
                out.push((a, b));
            }
        }
        Ok(out)
    }

    fn get_transaction_conn(&self, conn: &Connection, id: &str) -> Result<Option<Transaction>> {
        conn.query_row(
            "SELECT id, email_message_id, date, amount, currency, direction, type, merchant,
                    account, bank, reference, description, category, source, confidence,
                    needs_review, created_at, updated_at
             FROM transactions WHERE id = ?1",
            [id],
            row_to_transaction,
        )
        .optional()
        .context("fetching transaction for dedup candidate")
    }

    // -- NL query execution -------------------------------------------------

    /// Execute an already-guarded read-only statement, returning column
    /// names and each row's values as JSON.
    pub async fn execute_readonly_query(
        &self,
        sql: &str,
    ) -> Result<(Vec<String>, Vec<Vec<JsonValue>>)> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(sql)?;
        let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let column_count = column_names.len();
        let mut rows_out = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(column_count);
            for i in 0..column_count {
                let value: JsonValue = match row.get_ref(i)? {
                    rusqlite::types::ValueRef::Null => JsonValue::Null,
                    rusqlite::types::ValueRef::Integer(n) => JsonValue::from(n),
                    rusqlite::types::ValueRef::Real(f) => {
                        serde_json::Number::from_f64(f).map(JsonValue::Number).unwrap_or(JsonValue::Null)
                    }
                    rusqlite::types::ValueRef::Text(t) => {
                        JsonValue::String(String::from_utf8_lossy(t).into_owned())
                    }
                    rusqlite::types::ValueRef::Blob(_) => JsonValue::String("<blob>".to_string()),
                };
                values.push(value);
            }
            rows_out.push(values);
        }
        Ok((column_names, rows_out))
    }
}

fn map_insert_error(err: rusqlite::Error, what: &str) -> anyhow::Error {
    if let rusqlite::Error::SqliteFailure(ref sql_err, _) = err {
        if sql_err.code == rusqlite::ErrorCode::ConstraintViolation {
            // Foreign key violations indicate a write-ordering bug; everything
            // else (PK/unique conflicts) is handled by INSERT OR IGNORE and
            // should not reach here for the paths that use it.
            return anyhow::anyhow!(err)
                .context(format!("constraint violation inserting {what}"))
                .context(AppErrorKind::ForeignKeyViolation);
        }
    }
    anyhow::anyhow!(err).context(format!("inserting {what}"))
}

fn upsert_sync_kv(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_state (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

fn filter_clause(filter: &TransactionFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
    let mut clauses = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(start) = filter.start_date {
        clauses.push(format!("date >= ?{}", values.len() + 1));
        values.push(Box::new(start.to_string()));
    }
    if let Some(end) = filter.end_date {
        clauses.push(format!("date <= ?{}", values.len() + 1));
        values.push(Box::new(end.to_string()));
    }
    if let Some(ty) = filter.r#type {
        clauses.push(format!("type = ?{}", values.len() + 1));
        values.push(Box::new(ty.as_str().to_string()));
    }
    if let Some(ref category) = filter.category {
        clauses.push(format!("category = ?{}", values.len() + 1));
        values.push(Box::new(category.clone()));
    }
    if let Some(direction) = filter.direction {
        clauses.push(format!("direction = ?{}", values.len() + 1));
        values.push(Box::new(direction.as_str().to_string()));
    }
    if let Some(ref bank) = filter.bank {
        clauses.push(format!("bank = ?{}", values.len() + 1));
        values.push(Box::new(bank.clone()));
    }
    if let Some(needs_review) = filter.needs_review {
        clauses.push(format!("needs_review = ?{}", values.len() + 1));
        values.push(Box::new(needs_review as i64));
    }

    if clauses.is_empty() {
        (String::new(), values)
    } else {
        (format!("WHERE {}", clauses.join(" AND ")), values)
    }
}

fn row_to_transaction(row: &rusqlite::Row) -> rusqlite::Result<Transaction> {
    let date_str: String = row.get(2)?;
    let direction_str: String = row.get(5)?;
    let type_str: String = row.get(6)?;
    let source_str: String = row.get(13)?;
    Ok(Transaction {
        id: row.get(0)?,
        email_message_id: row.get(1)?,
        date: NaiveDate::parse_from_str(&date_str, "%Y-%m-%d").unwrap_or_default(),
        amount: row.get(3)?,
        currency: row.get(4)?,
        direction: Direction::parse(&direction_str).unwrap_or(Direction::Debit),
        r#type: TransactionType::parse(&type_str).unwrap_or(TransactionType::BankTransfer),
        merchant: row.get(7)?,
        account: row.get(8)?,
        bank: row.get(9)?,
        reference: row.get(10)?,
        description: row.get(11)?,
        category: row.get(12)?,
        source: Source::parse(&source_str).unwrap_or(Source::Regex),
        confidence: row.get(14)?,
        needs_review: row.get::<_, i64>(15)? != 0,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

fn row_to_correction(row: &rusqlite::Row) -> rusqlite::Result<CategoryCorrection> {
    Ok(CategoryCorrection {
        id: row.get(0)?,
        merchant: row.get(1)?,
        description: row.get(2)?,
        original_category: row.get(3)?,
        corrected_category: row.get(4)?,
        created_at: row.get(5)?,
    })
}
