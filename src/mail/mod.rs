//! Mail ingestor — query construction, provider abstraction, sync protocol.
//! The provider trait is a thin HTTP client plus one retry-wrapped call per
//! request, with an in-memory stand-in for tests.

use anyhow::{Context, Result};
use base64::Engine;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::{Config, GmailConfig};
use crate::retry::{with_retry, RetryConfig};
use crate::store::{RawEmail, Store};

#[derive(Debug, Clone)]
pub struct MailMessage {
    pub id: String,
    pub from: String,
    pub subject: String,
    pub date: String,
    pub body_text: String,
    pub body_html: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    pub message_ids: Vec<String>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SyncResult {
    pub messages_found: usize,
    pub new_emails_stored: usize,
    pub new_message_ids: Vec<String>,
    pub sync_timestamp: String,
}

#[async_trait::async_trait]
pub trait MailProvider: Send + Sync {
    async fn list_messages(&self, query: &str, cursor: Option<&str>) -> Result<MessagePage>;
    async fn get_message(&self, id: &str) -> Result<MailMessage>;
}

/// Combines the sender and subject-keyword allow-lists: OR within each
/// list, AND across lists, plus an optional `after:` date bound.
pub fn build_query(gmail: &GmailConfig, since: Option<NaiveDate>) -> String {
    let mut clauses = Vec::new();

    if !gmail.senders.is_empty() {
        let senders = gmail
            .senders
            .iter()
            .map(|s| format!("from:{s}"))
            .collect::<Vec<_>>()
            .join(" OR ");
        clauses.push(format!("({senders})"));
    }
    if !gmail.subject_keywords.is_empty() {
        let keywords = gmail
            .subject_keywords
            .iter()
            .map(|k| format!("subject:\"{k}\""))
            .collect::<Vec<_>>()
            .join(" OR ");
        clauses.push(format!("({keywords})"));
    }
    if let Some(date) = since {
        clauses.push(format!("after:{}", date.format("%Y/%m/%d")));
    }

    clauses.join(" ")
}

/// Resolves the effective sync start: an explicit override wins, then the
/// persisted watermark, else a lookback window from now.
pub fn resolve_since(
    since_override: Option<NaiveDate>,
    last_sync_timestamp: Option<&str>,
    default_lookback_months: i64,
) -> NaiveDate {
    if let Some(date) = since_override {
        return date;
    }
    if let Some(ts) = last_sync_timestamp {
        if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(ts) {
            return parsed.date_naive();
        }
    }
    (Utc::now() - ChronoDuration::days(default_lookback_months * 30)).date_naive()
}

pub async fn sync(
    provider: &dyn MailProvider,
    store: &Store,
    config: &Config,
    since_override: Option<NaiveDate>,
) -> Result<SyncResult> {
    let retry_config = RetryConfig::from_config(&config.rate_limit);
    let state = store.get_sync_state().await?;
    let since = resolve_since(
        since_override,
        state.last_sync_timestamp.as_deref(),
        config.sync.default_lookback_months,
    );
    let query = build_query(&config.gmail, Some(since));
    info!(%query, "resolved mail sync query");

    let mut all_ids = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = with_retry(retry_config, is_rate_limit_error, || {
            let cursor = cursor.clone();
            let query = query.clone();
            async move { provider.list_messages(&query, cursor.as_deref()).await }
        })
        .await
        .context("listing mail messages")?;

        all_ids.extend(page.message_ids);
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    let messages_found = all_ids.len();
    let mut fetched = Vec::with_capacity(messages_found);
    for batch in all_ids.chunks(config.gmail.fetch_batch_size.max(1)) {
        let mut futures = FuturesUnordered::new();
        for id in batch {
            let id = id.clone();
            let retry_config = retry_config.clone();
            futures.push(async move {
                with_retry(retry_config, is_rate_limit_error, || {
                    let id = id.clone();
                    async move { provider.get_message(&id).await }
                })
                .await
            });
        }
        while let Some(result) = futures.next().await {
            match result {
                Ok(message) => fetched.push(message),
                Err(e) => warn!(error = %e, "failed to fetch message after retries"),
            }
        }
    }

    let raw_emails: Vec<RawEmail> = fetched
        .iter()
        .map(|m| RawEmail {
            message_id: m.id.clone(),
            from: m.from.clone(),
            subject: m.subject.clone(),
            date: m.date.clone(),
            body_text: m.body_text.clone(),
            body_html: m.body_html.clone(),
            fetched_at: Utc::now().to_rfc3339(),
        })
        .collect();

    let new_message_ids = store.insert_raw_emails(&raw_emails).await?;
    let new_emails_stored = new_message_ids.len();
    let sync_timestamp = Utc::now().to_rfc3339();
    // The first id from list_messages' deterministic pagination, not
    // whichever fetch in the batch happens to finish first.
    let last_message_id = all_ids.first().cloned();

    store
        .record_sync(&sync_timestamp, last_message_id.as_deref(), new_emails_stored as i64)
        .await?;

    Ok(SyncResult {
        messages_found,
        new_emails_stored,
        new_message_ids,
        sync_timestamp,
    })
}

fn is_rate_limit_error(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(reqwest_err) = cause.downcast_ref::<reqwest::Error>() {
            if reqwest_err.status() == Some(reqwest::StatusCode::TOO_MANY_REQUESTS) {
                return true;
            }
        }
        if cause.to_string().contains("429") {
            return true;
        }
    }
    false
}

// -- Production provider: a minimal Gmail REST client ------------------------

#[derive(Debug, Deserialize)]
struct GmailListResponse {
    messages: Option<Vec<GmailMessageRef>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GmailMessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GmailMessageResponse {
    payload: GmailPayload,
    #[serde(rename = "internalDate")]
    internal_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GmailPayload {
    headers: Vec<GmailHeader>,
    #[serde(default)]
    body: Option<GmailBody>,
    #[serde(default)]
    parts: Vec<GmailPayload>,
    #[serde(rename = "mimeType", default)]
    mime_type: String,
}

#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct GmailBody {
    data: Option<String>,
}

pub struct GmailProvider {
    client: reqwest::Client,
    access_token: String,
}

impl GmailProvider {
    /// `access_token` is assumed valid; acquiring and refreshing it via the
    /// loopback OAuth server is a separate concern this adapter only calls
    /// into, not reimplements.
    pub fn new(access_token: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            access_token,
        }
    }
}

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

#[async_trait::async_trait]
impl MailProvider for GmailProvider {
    async fn list_messages(&self, query: &str, cursor: Option<&str>) -> Result<MessagePage> {
        let mut req = self
            .client
            .get(format!("{GMAIL_API_BASE}/messages"))
            .bearer_auth(&self.access_token)
            .query(&[("q", query)]);
        if let Some(token) = cursor {
            req = req.query(&[("pageToken", token)]);
        }
        let response = req.send().await.context("listing gmail messages")?;
        let response = response.error_for_status().context("gmail list returned an error status")?;
        let parsed: GmailListResponse = response.json().await.context("parsing gmail list response")?;
        Ok(MessagePage {
            message_ids: parsed
                .messages
                .unwrap_or_default()
                .into_iter()
                .map(|m| m.id)
                .collect(),
            next_cursor: parsed.next_page_token,
        })
    }

    async fn get_message(&self, id: &str) -> Result<MailMessage> {
        let response = self
            .client
            .get(format!("{GMAIL_API_BASE}/messages/{id}"))
            .query(&[("format", "full")])
            .bearer_auth(&self.access_token)
            .send()
            .await
            .context("fetching gmail message")?;
        let response = response.error_for_status().context("gmail get returned an error status")?;
        let parsed: GmailMessageResponse = response.json().await.context("parsing gmail message")?;

        let header = |name: &str| -> String {
            parsed
                .payload
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
                .map(|h| h.value.clone())
                .unwrap_or_default()
        };

        let (body_text, body_html) = extract_bodies(&parsed.payload);
        let date = header("Date");
        let date = chrono::DateTime::parse_from_rfc2822(&date)
            .map(|d| d.to_rfc3339())
            .unwrap_or_else(|_| parsed.internal_date.unwrap_or_default());

        Ok(MailMessage {
            id: id.to_string(),
            from: header("From"),
            subject: header("Subject"),
            date,
            body_text: body_text.unwrap_or_default(),
            body_html,
        })
    }
}

/// Walks the nested MIME part tree, preferring the first `text/plain` part
/// and falling back to the first `text/html` part.
fn extract_bodies(payload: &GmailPayload) -> (Option<String>, Option<String>) {
    let mut text = None;
    let mut html = None;
    walk_parts(payload, &mut text, &mut html);
    (text, html)
}

fn walk_parts(payload: &GmailPayload, text: &mut Option<String>, html: &mut Option<String>) {
    if text.is_none() && payload.mime_type == "text/plain" {
        if let Some(decoded) = decode_body(&payload.body) {
            *text = Some(decoded);
        }
    }
    if html.is_none() && payload.mime_type == "text/html" {
        if let Some(decoded) = decode_body(&payload.body) {
            *html = Some(decoded);
        }
    }
    for part in &payload.parts {
        if text.is_some() && html.is_some() {
            break;
        }
        walk_parts(part, text, html);
    }
}

fn decode_body(body: &Option<GmailBody>) -> Option<String> {
    let data = body.as_ref()?.data.as_ref()?;
    let normalized = data.replace('-', "+").replace('_', "/");
    base64::engine::general_purpose::STANDARD
        .decode(normalized)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

// -- Test provider ------------------------------------------------------------

#[cfg(test)]
pub struct InMemoryMailProvider {
    pub pages: std::sync::Mutex<Vec<MessagePage>>,
    pub messages: std::collections::HashMap<String, MailMessage>,
}

#[cfg(test)]
#[async_trait::async_trait]
impl MailProvider for InMemoryMailProvider {
    async fn list_messages(&self, _query: &str, _cursor: Option<&str>) -> Result<MessagePage> {
        let mut pages = self.pages.lock().unwrap();
        if pages.is_empty() {
            Ok(MessagePage::default())
        } else {
            Ok(pages.remove(0))
        }
    }

    async fn get_message(&self, id: &str) -> Result<MailMessage> {
        self.messages
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown message id: {id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GmailConfig;

    fn gmail_config() -> GmailConfig {
        GmailConfig {
            senders: vec!["alerts@hdfcbank.net".into(), "alerts@icicibank.com".into()],
            subject_keywords: vec!["debited".into(), "credited".into()],
            redirect_port: 8085,
            auth_timeout_ms: 120_000,
            fetch_batch_size: 50,
        }
    }

    #[test]
    fn query_combines_or_within_and_across_lists() {
        let query = build_query(&gmail_config(), None);
        assert_eq!(
            query,
            "(from:alerts@hdfcbank.net OR from:alerts@icicibank.com) (subject:\"debited\" OR subject:\"credited\")"
        );
    }

    #[test]
    fn query_appends_after_date() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let query = build_query(&gmail_config(), Some(date));
        assert!(query.ends_with("after:2025/03/01"));
    }

    #[test]
    fn since_override_wins_over_stored_watermark() {
        let override_date = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let resolved = resolve_since(Some(override_date), Some("2025-01-01T00:00:00Z"), 3);
        assert_eq!(resolved, override_date);
    }

    #[test]
    fn stored_watermark_wins_over_lookback() {
        let resolved = resolve_since(None, Some("2025-01-01T00:00:00Z"), 3);
        assert_eq!(resolved, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
    }

    #[test]
    fn falls_back_to_lookback_when_nothing_stored() {
        let resolved = resolve_since(None, None, 3);
        let expected = (Utc::now() - ChronoDuration::days(90)).date_naive();
        assert_eq!(resolved, expected);
    }

    #[tokio::test]
    async fn sync_persists_new_messages_and_advances_watermark() {
        let store = Store::open_in_memory().unwrap();
        let config = Config::default();

        let mut messages = std::collections::HashMap::new();
        messages.insert(
            "m1".to_string(),
            MailMessage {
                id: "m1".to_string(),
                from: "alerts@hdfcbank.net".to_string(),
                subject: "Transaction alert".to_string(),
                date: "2025-01-15T10:00:00+00:00".to_string(),
                body_text: "Rs.500 debited".to_string(),
                body_html: None,
            },
        );
        let provider = InMemoryMailProvider {
            pages: std::sync::Mutex::new(vec![MessagePage {
                message_ids: vec!["m1".to_string()],
                next_cursor: None,
            }]),
            messages,
        };

        let result = sync(&provider, &store, &config, None).await.unwrap();
        assert_eq!(result.messages_found, 1);
        assert_eq!(result.new_emails_stored, 1);
        assert_eq!(result.new_message_ids, vec!["m1".to_string()]);

        let state = store.get_sync_state().await.unwrap();
        assert_eq!(state.total_synced_count, 1);
        assert!(state.last_sync_timestamp.is_some());
    }

    #[tokio::test]
    async fn syncing_twice_over_an_unchanged_mailbox_adds_nothing_new() {
        let store = Store::open_in_memory().unwrap();
        let config = Config::default();

        let mut messages = std::collections::HashMap::new();
        messages.insert(
            "m1".to_string(),
            MailMessage {
                id: "m1".to_string(),
                from: "alerts@hdfcbank.net".to_string(),
                subject: "Transaction alert".to_string(),
                date: "2025-01-15T10:00:00+00:00".to_string(),
                body_text: "Rs.500 debited".to_string(),
                body_html: None,
            },
        );
        let page = MessagePage {
            message_ids: vec!["m1".to_string()],
            next_cursor: None,
        };
        let provider = InMemoryMailProvider {
            pages: std::sync::Mutex::new(vec![page.clone(), page]),
            messages,
        };

        let first = sync(&provider, &store, &config, None).await.unwrap();
        let second = sync(&provider, &store, &config, None).await.unwrap();

        assert_eq!(first.new_emails_stored, 1);
        assert_eq!(second.new_emails_stored, 0);

        let state = store.get_sync_state().await.unwrap();
        assert_eq!(state.total_synced_count, 1);
    }
}
