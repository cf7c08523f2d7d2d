//! Expense tracker CLI. Argument parsing and tabular printing live here;
//! every command is a thin call into the library crate.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use expense_tracker::config::Config;
use expense_tracker::error::{classify, AppErrorKind};
use expense_tracker::llm::LlmGateway;
use expense_tracker::mail::{self, GmailProvider};
use expense_tracker::parsing::{default_parsers, parse_email, ParseContext};
use expense_tracker::store::{EvalVerdict, Store, Transaction, TransactionFilter};
use expense_tracker::{categorizer, dedup, insights, nlquery, review};

#[derive(Parser, Debug)]
#[command(name = "expense-tracker")]
#[command(about = "Personal expense tracker driven by bank notification emails")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize ~/.expense-tracker (store, default config), checking for
    /// the mail-provider credentials this process expects to already exist.
    Setup,

    /// Fetch new mail and parse/categorize/dedup it.
    Sync {
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        skip_categorize: bool,
    },

    /// List transactions.
    List {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
        #[arg(long = "type")]
        r#type: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        direction: Option<String>,
        #[arg(long)]
        bank: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
        #[arg(long)]
        review: bool,
    },

    /// Print totals and derived insights over a date range.
    Summary {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
        #[arg(long)]
        direction: Option<String>,
    },

    /// Walk the needs_review queue interactively.
    Review,

    /// Recategorize a transaction, recording a correction for the merchant.
    Recategorize { id: String, category: String },

    /// Rename the merchant on a transaction.
    Remerchant { id: String, name: String },

    /// Re-run parsing over raw emails that never produced a transaction.
    Reparse {
        #[arg(long)]
        missing: bool,
        #[arg(long)]
        skip_categorize: bool,
    },

    /// Ask a natural-language question about recorded spending.
    Chat { question: Option<String> },

    /// Record an eval verdict against a parsed/categorized transaction.
    Flag {
        id: String,
        verdict: FlagVerdict,
        #[arg(long)]
        notes: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FlagVerdict {
    Correct,
    Wrong,
}

impl From<FlagVerdict> for EvalVerdict {
    fn from(v: FlagVerdict) -> Self {
        match v {
            FlagVerdict::Correct => EvalVerdict::Correct,
            FlagVerdict::Wrong => EvalVerdict::Wrong,
        }
    }
}

const LLM_BIN_ENV: &str = "EXPENSE_TRACKER_LLM_BIN";
const DEFAULT_LLM_BIN: &str = "llm";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("expense_tracker=info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli.command).await {
        error!("{err:#}");
        if let Some(kind) = classify(&err) {
            eprintln!("error: {kind}");
        } else {
            eprintln!("error: {err}");
        }
        std::process::exit(1);
    }
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Setup => cmd_setup().await,
        Commands::Sync { since, skip_categorize } => cmd_sync(since, skip_categorize).await,
        Commands::List { from, to, r#type, category, direction, bank, limit, offset, review } => {
            cmd_list(from, to, r#type, category, direction, bank, limit, offset, review).await
        }
        Commands::Summary { from, to, direction } => cmd_summary(from, to, direction).await,
        Commands::Review => cmd_review().await,
        Commands::Recategorize { id, category } => cmd_recategorize(id, category).await,
        Commands::Remerchant { id, name } => cmd_remerchant(id, name).await,
        Commands::Reparse { missing, skip_categorize } => cmd_reparse(missing, skip_categorize).await,
        Commands::Chat { question } => cmd_chat(question).await,
        Commands::Flag { id, verdict, notes } => cmd_flag(id, verdict, notes).await,
    }
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid date: {s} (expected YYYY-MM-DD)"))
}

async fn open_store() -> Result<(Config, Store)> {
    let config = Config::load().context("loading config")?;
    let base = Config::base_dir()?;
    let db_path = Config::db_path(&base);
    let store = Store::open(&db_path).context("opening store")?;
    Ok((config, store))
}

fn llm_gateway() -> LlmGateway {
    let bin = std::env::var(LLM_BIN_ENV).unwrap_or_else(|_| DEFAULT_LLM_BIN.to_string());
    LlmGateway::subprocess(bin)
}

// -- setup --------------------------------------------------------------

async fn cmd_setup() -> Result<()> {
    let base = Config::base_dir()?;
    std::fs::create_dir_all(&base).with_context(|| format!("creating {}", base.display()))?;

    let config_path = base.join("config.json");
    if !config_path.exists() {
        let default = serde_json::to_string_pretty(&Config::default())?;
        std::fs::write(&config_path, default).context("writing default config.json")?;
        println!("wrote default config to {}", config_path.display());
    } else {
        println!("config already present at {}", config_path.display());
    }

    let credentials_path = base.join("credentials.json");
    if !credentials_path.exists() {
        println!(
            "no credentials.json found at {} — place your mail-provider OAuth client \
credentials there before running `sync`.",
            credentials_path.display()
        );
    }
    let token_path = base.join("token.json");
    if !token_path.exists() {
        println!(
            "no token.json found at {} — complete the provider's authorization flow to \
produce one before running `sync`.",
            token_path.display()
        );
    }

    let (_config, store) = open_store().await?;
    drop(store);
    println!("store initialized at {}", Config::db_path(&base).display());
    Ok(())
}

fn load_access_token(base: &std::path::Path) -> Result<String> {
    let token_path = base.join("token.json");
    let raw = std::fs::read_to_string(&token_path)
        .with_context(|| format!("reading {} (run `setup` and complete authorization first)", token_path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw).context("parsing token.json")?;
    value
        .get("access_token")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .context("token.json has no access_token field")
        .map_err(|e| e.context(AppErrorKind::ProviderAuthRevoked))
}

// -- sync -----------------------------------------------------------------

async fn cmd_sync(since: Option<String>, skip_categorize: bool) -> Result<()> {
    let (config, store) = open_store().await?;
    let base = Config::base_dir()?;
    let since_override = since.as_deref().map(parse_date).transpose()?;

    let access_token = load_access_token(&base)?;
    let provider = GmailProvider::new(access_token);

    let result = mail::sync(&provider, &store, &config, since_override).await?;
    info!(
        found = result.messages_found,
        stored = result.new_emails_stored,
        "sync complete"
    );
    println!(
        "found {} messages, stored {} new raw emails",
        result.messages_found, result.new_emails_stored
    );

    if result.new_message_ids.is_empty() {
        return Ok(());
    }

    let gateway = llm_gateway();
    let new_ids = process_raw_emails(&store, &gateway, &config, &result.new_message_ids, skip_categorize).await?;

    let dedup_outcome = dedup::run(&store, &gateway, &config.dedup, Some(&new_ids)).await?;
    println!(
        "parsed {} transactions; examined {} dedup candidates, found {} duplicates",
        new_ids.len(),
        dedup_outcome.candidates_examined,
        dedup_outcome.duplicates_found
    );
    Ok(())
}

/// Parses each of `message_ids` into transactions, persists them, and
/// (unless `skip_categorize`) assigns categories. Returns the ids of the
/// transactions that were actually inserted, for the caller's dedup pass.
async fn process_raw_emails(
    store: &Store,
    gateway: &LlmGateway,
    config: &Config,
    message_ids: &[String],
    skip_categorize: bool,
) -> Result<Vec<String>> {
    let parsers = default_parsers();
    let ctx = ParseContext {
        currency: config.currency.code.clone(),
        review_threshold: config.parser.confidence_threshold,
    };

    let mut inserted_ids = Vec::new();
    let mut pending_categorize = Vec::new();

    for message_id in message_ids {
        let Some(email) = store.get_raw_email(message_id).await? else {
            continue;
        };
        let transactions = parse_email(&email, &parsers, gateway, &ctx, config.parser.body_truncation_limit).await;
        for transaction in transactions {
            if store.insert_transaction(&transaction).await? {
                inserted_ids.push(transaction.id.clone());
                pending_categorize.push(transaction);
            }
        }
    }

    if !skip_categorize && !pending_categorize.is_empty() {
        let results = categorizer::categorize_batch(store, gateway, &config.categories, &pending_categorize).await;
        for (transaction, result) in pending_categorize.iter().zip(results) {
            store.update_transaction_category(&transaction.id, &result.category).await?;
        }
    }

    Ok(inserted_ids)
}

// -- list -----------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn cmd_list(
    from: Option<String>,
    to: Option<String>,
    r#type: Option<String>,
    category: Option<String>,
    direction: Option<String>,
    bank: Option<String>,
    limit: i64,
    offset: i64,
    review_only: bool,
) -> Result<()> {
    let (_config, store) = open_store().await?;
    let filter = TransactionFilter {
        start_date: from.as_deref().map(parse_date).transpose()?,
        end_date: to.as_deref().map(parse_date).transpose()?,
        r#type: r#type
            .as_deref()
            .map(|s| {
                expense_tracker::store::TransactionType::parse(s)
                    .with_context(|| format!("unknown type: {s}"))
            })
            .transpose()?,
        category,
        direction: direction
            .as_deref()
            .map(|s| expense_tracker::store::Direction::parse(s).with_context(|| format!("unknown direction: {s}")))
            .transpose()?,
        bank,
        needs_review: if review_only { Some(true) } else { None },
        limit: Some(limit),
        offset: Some(offset),
    };

    let transactions = store.list_transactions(&filter).await?;
    print_transactions(&transactions);
    Ok(())
}

fn print_transactions(transactions: &[Transaction]) {
    if transactions.is_empty() {
        println!("no transactions match that filter");
        return;
    }
    for t in transactions {
        println!(
            "{}  {:>10.2} {}  {:<8} {:<20} {:<15} {}",
            t.date,
            t.amount,
            t.currency,
            t.direction.as_str(),
            t.merchant,
            t.category.as_deref().unwrap_or("-"),
            if t.needs_review { "[needs review]" } else { "" },
        );
    }
}

// -- summary ----------------------------------------------------------------

async fn cmd_summary(from: Option<String>, to: Option<String>, direction: Option<String>) -> Result<()> {
    let (config, store) = open_store().await?;
    let filter = TransactionFilter {
        start_date: from.as_deref().map(parse_date).transpose()?,
        end_date: to.as_deref().map(parse_date).transpose()?,
        direction: direction
            .as_deref()
            .map(|s| expense_tracker::store::Direction::parse(s).with_context(|| format!("unknown direction: {s}")))
            .transpose()?,
        limit: Some(i64::MAX),
        ..Default::default()
    };
    let transactions = store.list_transactions(&filter).await?;
    let total: f64 = transactions.iter().map(|t| t.amount).sum();
    println!("{} transactions, total {:.2}", transactions.len(), total);

    let as_of = chrono::Utc::now().date_naive();
    let report = insights::compute_report(&store, &config.alerts, as_of).await?;
    for entry in &report.category_trend {
        println!(
            "  {:<15} current {:.2} (prev {:.2})",
            entry.category, entry.current, entry.previous
        );
    }
    for alert in &report.alerts {
        println!("  alert: {}", alert.message);
    }
    for suggestion in &report.suggestions {
        println!("  suggestion: {}", suggestion.message);
    }
    Ok(())
}

// -- review -----------------------------------------------------------------

async fn cmd_review() -> Result<()> {
    let (_config, store) = open_store().await?;
    loop {
        let queue = review::list(&store, None).await?;
        let Some(transaction) = queue.first() else {
            println!("review queue is empty");
            break;
        };

        println!(
            "{} | {} | {:.2} {} | category: {}",
            transaction.id,
            transaction.merchant,
            transaction.amount,
            transaction.currency,
            transaction.category.as_deref().unwrap_or("-"),
        );
        println!("[a]ccept  [c] <category> recategorize  [s]kip  [q]uit");

        let mut input = String::new();
        std::io::stdin().read_line(&mut input).context("reading stdin")?;
        let input = input.trim();

        if input == "q" {
            break;
        } else if input == "s" {
            continue;
        } else if input == "a" {
            review::resolve(&store, &transaction.id, None).await?;
        } else if let Some(category) = input.strip_prefix("c ") {
            review::resolve(&store, &transaction.id, Some(category.trim())).await?;
        } else {
            println!("unrecognized input: {input}");
        }
    }
    Ok(())
}

// -- recategorize / remerchant ---------------------------------------------

async fn cmd_recategorize(id: String, category: String) -> Result<()> {
    let (_config, store) = open_store().await?;
    let resolved = review::resolve(&store, &id, Some(&category)).await?;
    println!("{} now categorized as {}", resolved.id, resolved.category.as_deref().unwrap_or("-"));
    Ok(())
}

async fn cmd_remerchant(id: String, name: String) -> Result<()> {
    let (_config, store) = open_store().await?;
    store.update_transaction_merchant(&id, &name).await?;
    println!("{id} merchant renamed to {name}");
    Ok(())
}

// -- reparse ------------------------------------------------------------

async fn cmd_reparse(missing: bool, skip_categorize: bool) -> Result<()> {
    if !missing {
        println!("reparse currently only supports --missing");
        return Ok(());
    }
    let (config, store) = open_store().await?;
    let gateway = llm_gateway();
    let backlog = store.raw_emails_missing_transactions().await?;
    let message_ids: Vec<String> = backlog.iter().map(|e| e.message_id.clone()).collect();

    let inserted_ids = process_raw_emails(&store, &gateway, &config, &message_ids, skip_categorize).await?;
    let dedup_outcome = dedup::run(&store, &gateway, &config.dedup, Some(&inserted_ids)).await?;
    println!(
        "reparsed {} raw emails into {} transactions; found {} duplicates",
        message_ids.len(),
        inserted_ids.len(),
        dedup_outcome.duplicates_found
    );
    Ok(())
}

// -- chat -------------------------------------------------------------------

async fn cmd_chat(question: Option<String>) -> Result<()> {
    let (_config, store) = open_store().await?;
    let gateway = llm_gateway();

    if let Some(question) = question {
        let response = nlquery::ask(&store, &gateway, &question).await;
        println!("{}", response.answer);
        return Ok(());
    }

    println!("ask a question about your spending (blank line to quit):");
    loop {
        let mut input = String::new();
        std::io::stdin().read_line(&mut input).context("reading stdin")?;
        let question = input.trim();
        if question.is_empty() {
            break;
        }
        let response = nlquery::ask(&store, &gateway, question).await;
        println!("{}", response.answer);
    }
    Ok(())
}

// -- flag -------------------------------------------------------------------

async fn cmd_flag(id: String, verdict: FlagVerdict, notes: Option<String>) -> Result<()> {
    let (_config, store) = open_store().await?;
    store
        .get_transaction(&id)
        .await?
        .with_context(|| format!("transaction not found: {id}"))?;
    store.insert_eval_flag(&id, verdict.into(), notes.as_deref()).await?;
    println!("recorded {:?} verdict for {id}", verdict);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_date_rejects_malformed_input() {
        assert!(parse_date("not-a-date").is_err());
        assert!(parse_date("2025-01-15").is_ok());
    }
}
