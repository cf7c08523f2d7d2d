//! Numbered SQL migrations. Each file runs inside its own transaction and
//! rolls back atomically on error; a `migrations` table records applied
//! ids so startup application is idempotent.

use anyhow::{Context, Result};
use rusqlite::Connection;

struct Migration {
    id: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        id: 1,
        name: "raw_emails",
        sql: include_str!("../../migrations/0001_raw_emails.sql"),
    },
    Migration {
        id: 2,
        name: "transactions",
        sql: include_str!("../../migrations/0002_transactions.sql"),
    },
    Migration {
        id: 3,
        name: "category_corrections",
        sql: include_str!("../../migrations/0003_category_corrections.sql"),
    },
    Migration {
        id: 4,
        name: "duplicate_groups",
        sql: include_str!("../../migrations/0004_duplicate_groups.sql"),
    },
    Migration {
        id: 5,
        name: "sync_state",
        sql: include_str!("../../migrations/0005_sync_state.sql"),
    },
    Migration {
        id: 6,
        name: "eval_flags",
        sql: include_str!("../../migrations/0006_eval_flags.sql"),
    },
];

pub fn apply_pending(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
        [],
    )
    .context("creating migrations table")?;

    for migration in MIGRATIONS {
        let already_applied: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM migrations WHERE id = ?1)",
                [migration.id],
                |row| row.get(0),
            )
            .context("checking migration status")?;
        if already_applied {
            continue;
        }

        let tx = conn.transaction().context("starting migration transaction")?;
        tx.execute_batch(migration.sql)
            .with_context(|| format!("applying migration {} ({})", migration.id, migration.name))?;
        tx.execute(
            "INSERT INTO migrations (id, name, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![migration.id, migration.name, chrono::Utc::now().to_rfc3339()],
        )?;
        tx.commit().context("committing migration transaction")?;
    }

    Ok(())
}
