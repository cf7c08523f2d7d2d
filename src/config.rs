//! Configuration loading and deep-merge.
//!
//! Defaults live in code; `~/.expense-tracker/config.json` is deep-merged on
//! top (arrays replaced wholesale, objects merged key-by-key, scalars
//! overwritten) so a user can shrink an allow-list to fewer entries than the
//! default. Store location can be overridden independently via the
//! `EXPENSE_TRACKER_DB` environment variable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_CATEGORIES: &[&str] = &[
    "Food",
    "Transport",
    "Shopping",
    "Bills",
    "Entertainment",
    "Health",
    "Education",
    "Investment",
    "Transfer",
    "Other",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailConfig {
    pub senders: Vec<String>,
    #[serde(rename = "subjectKeywords")]
    pub subject_keywords: Vec<String>,
    #[serde(rename = "redirectPort")]
    pub redirect_port: u16,
    #[serde(rename = "authTimeoutMs")]
    pub auth_timeout_ms: u64,
    #[serde(rename = "fetchBatchSize")]
    pub fetch_batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrencyConfig {
    pub code: String,
    pub locale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(rename = "spikeThreshold")]
    pub spike_threshold: f64,
    #[serde(rename = "largeTransactionAmount")]
    pub large_transaction_amount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(rename = "defaultLookbackMonths")]
    pub default_lookback_months: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserConfig {
    #[serde(rename = "confidenceThreshold")]
    pub confidence_threshold: f64,
    #[serde(rename = "bodyTruncationLimit")]
    pub body_truncation_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(rename = "maxRetries")]
    pub max_retries: u32,
    #[serde(rename = "initialDelayMs")]
    pub initial_delay_ms: u64,
    #[serde(rename = "maxDelayMs")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(rename = "dateToleranceDays")]
    pub date_tolerance_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoriesConfig {
    pub list: Vec<String>,
    pub descriptions: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub gmail: GmailConfig,
    pub currency: CurrencyConfig,
    pub alerts: AlertsConfig,
    pub sync: SyncConfig,
    pub parser: ParserConfig,
    #[serde(rename = "rateLimit")]
    pub rate_limit: RateLimitConfig,
    pub dedup: DedupConfig,
    pub categories: CategoriesConfig,
}

impl Default for Config {
    fn default() -> Self {
        let mut descriptions = HashMap::new();
        descriptions.insert("Food".into(), "Restaurants, groceries, food delivery".into());
        descriptions.insert("Transport".into(), "Cabs, fuel, public transit, tolls".into());
        descriptions.insert("Shopping".into(), "Retail, e-commerce, general merchandise".into());
        descriptions.insert("Bills".into(), "Utilities, rent, subscriptions, insurance".into());
        descriptions.insert("Entertainment".into(), "Streaming, events, games, hobbies".into());
        descriptions.insert("Health".into(), "Medical, pharmacy, fitness".into());
        descriptions.insert("Education".into(), "Courses, books, tuition".into());
        descriptions.insert("Investment".into(), "SIPs, stocks, mutual funds, deposits".into());
        descriptions.insert("Transfer".into(), "Peer transfers, loan repayments, internal moves".into());
        descriptions.insert("Other".into(), "Anything that genuinely fits nothing else".into());

        Config {
            gmail: GmailConfig {
                senders: vec![
                    "alerts@hdfcbank.net".into(),
                    "alerts@icicibank.com".into(),
                    "noreply@axisbank.com".into(),
                ],
                subject_keywords: vec![
                    "transaction alert".into(),
                    "debited".into(),
                    "credited".into(),
                ],
                redirect_port: 8085,
                auth_timeout_ms: 120_000,
                fetch_batch_size: 50,
            },
            currency: CurrencyConfig {
                code: "INR".into(),
                locale: "en-IN".into(),
            },
            alerts: AlertsConfig {
                spike_threshold: 1.4,
                large_transaction_amount: 10_000.0,
            },
            sync: SyncConfig {
                default_lookback_months: 3,
            },
            parser: ParserConfig {
                confidence_threshold: 0.7,
                body_truncation_limit: 8000,
            },
            rate_limit: RateLimitConfig {
                max_retries: 5,
                initial_delay_ms: 1000,
                max_delay_ms: 32_000,
            },
            dedup: DedupConfig {
                date_tolerance_days: 1,
            },
            categories: CategoriesConfig {
                list: DEFAULT_CATEGORIES.iter().map(|s| s.to_string()).collect(),
                descriptions,
            },
        }
    }
}

impl Config {
    /// Resolve `~/.expense-tracker`, creating it if absent.
    pub fn base_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("could not resolve home directory")?;
        Ok(home.join(".expense-tracker"))
    }

    pub fn db_path(base_dir: &Path) -> PathBuf {
        std::env::var("EXPENSE_TRACKER_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| base_dir.join("data.db"))
    }

    /// Load defaults, deep-merge `config.json` over them if present.
    pub fn load() -> Result<Self> {
        let base = Self::base_dir()?;
        Self::load_from(&base)
    }

    pub fn load_from(base_dir: &Path) -> Result<Self> {
        let default_value = serde_json::to_value(Config::default())?;
        let config_path = base_dir.join("config.json");

        let merged = if config_path.exists() {
            let raw = std::fs::read_to_string(&config_path)
                .with_context(|| format!("reading {}", config_path.display()))?;
            let user_value: Value = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", config_path.display()))?;
            let mut merged = default_value;
            deep_merge(&mut merged, &user_value);
            merged
        } else {
            default_value
        };

        let config: Config =
            serde_json::from_value(merged).context("deserializing merged config")?;
        Ok(config)
    }
}

/// Deep-merge `overlay` into `base`. Objects merge key by key; arrays and
/// scalars are replaced wholesale by whatever `overlay` provides.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_val) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_val) => deep_merge(base_val, overlay_val),
                    None => {
                        base_map.insert(key.clone(), overlay_val.clone());
                    }
                }
            }
        }
        (base_slot, overlay_val) => {
            *base_slot = overlay_val.clone();
        }
    }
}
