//! Insights engine — pure read-side aggregation over persisted
//! transactions. No model involvement anywhere in this module.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use chrono::{Datelike, Days, NaiveDate};

use crate::config::AlertsConfig;
use crate::store::{Direction, Store, Transaction, TransactionFilter};

#[derive(Debug, Clone, PartialEq)]
pub struct MonthlyTotal {
    pub month: String,
    pub total: f64,
    pub percent_change: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CategoryTrendEntry {
    pub category: String,
    pub current: f64,
    pub previous: f64,
    pub percent_change: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MerchantRecurrence {
    pub merchant: String,
    pub total: f64,
    pub average: f64,
    pub count: i64,
    pub frequency: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    SpendingSpike,
    NewCategory,
    LargeTransaction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub kind: AlertKind,
    pub category: Option<String>,
    pub merchant: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Suggestion {
    pub rule: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct InsightsReport {
    pub month_over_month: Vec<MonthlyTotal>,
    pub category_trend: Vec<CategoryTrendEntry>,
    pub merchant_recurrence: Vec<MerchantRecurrence>,
    pub alerts: Vec<Alert>,
    pub suggestions: Vec<Suggestion>,
}

/// Fetches the whole ledger and runs every derived view against it.
pub async fn compute_report(store: &Store, config: &AlertsConfig, as_of: NaiveDate) -> Result<InsightsReport> {
    let transactions = store.list_transactions(&TransactionFilter {
        limit: Some(i64::MAX),
        ..Default::default()
    }).await?;

    let month_over_month = month_over_month(&transactions);
    let category_trend = category_trend(&transactions, as_of);
    let merchant_recurrence = merchant_recurrence(&transactions);
    let alerts = post_sync_alerts(&transactions, config, as_of);
    let suggestions = suggestions(&month_over_month, &category_trend, &merchant_recurrence, &transactions);

    Ok(InsightsReport {
        month_over_month,
        category_trend,
        merchant_recurrence,
        alerts,
        suggestions,
    })
}

fn month_key(date: NaiveDate) -> String {
    date.format("%Y-%m").to_string()
}

fn percent_change(previous: f64, current: f64) -> Option<f64> {
    if previous == 0.0 {
        return None;
    }
    Some((current - previous) / previous * 100.0)
}

/// Debits only, grouped by calendar month in chronological order. The
/// first month in the series carries no `percent_change`.
pub fn month_over_month(transactions: &[Transaction]) -> Vec<MonthlyTotal> {
    let mut totals: BTreeMap<String, f64> = BTreeMap::new();
    for t in transactions {
        if t.direction != Direction::Debit {
            continue;
        }
        *totals.entry(month_key(t.date)).or_insert(0.0) += t.amount;
    }

    let mut out = Vec::with_capacity(totals.len());
    let mut previous: Option<f64> = None;
    for (month, total) in totals {
        let change = previous.and_then(|prev| percent_change(prev, total));
        out.push(MonthlyTotal { month, total, percent_change: change });
        previous = Some(total);
    }
    out
}

fn month_totals_by_category(transactions: &[Transaction], year: i32, month: u32) -> HashMap<String, f64> {
    let mut totals: HashMap<String, f64> = HashMap::new();
    for t in transactions {
        if t.direction != Direction::Debit {
            continue;
        }
        if t.date.year() != year || t.date.month() != month {
            continue;
        }
        let category = t.category.clone().unwrap_or_else(|| "Uncategorized".to_string());
        *totals.entry(category).or_insert(0.0) += t.amount;
    }
    totals
}

fn previous_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

/// Current vs previous calendar month, per category, sorted by the
/// magnitude of the percentage change (largest swing first).
pub fn category_trend(transactions: &[Transaction], as_of: NaiveDate) -> Vec<CategoryTrendEntry> {
    let (cur_year, cur_month) = (as_of.year(), as_of.month());
    let (prev_year, prev_month) = previous_month(cur_year, cur_month);

    let current = month_totals_by_category(transactions, cur_year, cur_month);
    let previous = month_totals_by_category(transactions, prev_year, prev_month);

    let mut categories: Vec<String> = current.keys().chain(previous.keys()).cloned().collect();
    categories.sort();
    categories.dedup();

    let mut entries: Vec<CategoryTrendEntry> = categories
        .into_iter()
        .map(|category| {
            let cur = *current.get(&category).unwrap_or(&0.0);
            let prev = *previous.get(&category).unwrap_or(&0.0);
            CategoryTrendEntry {
                category,
                current: cur,
                previous: prev,
                percent_change: percent_change(prev, cur),
            }
        })
        .collect();

    entries.sort_by(|a, b| {
        let magnitude = |e: &CategoryTrendEntry| e.percent_change.map(|p| p.abs()).unwrap_or(0.0);
        magnitude(b).partial_cmp(&magnitude(a)).unwrap_or(std::cmp::Ordering::Equal)
    });
    entries
}

/// Groups by merchant (two or more transactions required), and labels the
/// cadence from the mean gap between consecutive transaction dates.
pub fn merchant_recurrence(transactions: &[Transaction]) -> Vec<MerchantRecurrence> {
    let mut by_merchant: HashMap<String, Vec<NaiveDate>> = HashMap::new();
    let mut totals: HashMap<String, f64> = HashMap::new();
    for t in transactions {
        if t.direction != Direction::Debit {
            continue;
        }
        by_merchant.entry(t.merchant.clone()).or_default().push(t.date);
        *totals.entry(t.merchant.clone()).or_insert(0.0) += t.amount;
    }

    let mut out = Vec::new();
    for (merchant, mut dates) in by_merchant {
        let count = dates.len() as i64;
        if count < 2 {
            continue;
        }
        dates.sort();
        let gaps: Vec<i64> = dates.windows(2).map(|w| (w[1] - w[0]).num_days()).collect();
        let mean_gap = gaps.iter().sum::<i64>() as f64 / gaps.len() as f64;
        let frequency = if mean_gap <= 10.0 {
            "weekly"
        } else if mean_gap <= 45.0 {
            "monthly"
        } else {
            "occasional"
        };
        let total = *totals.get(&merchant).unwrap_or(&0.0);
        out.push(MerchantRecurrence {
            merchant,
            total,
            average: total / count as f64,
            count,
            frequency,
        });
    }
    out.sort_by(|a, b| b.total.partial_cmp(&a.total).unwrap_or(std::cmp::Ordering::Equal));
    out
}

fn week_start(date: NaiveDate) -> NaiveDate {
    let offset = date.weekday().num_days_from_monday() as u64;
    date.checked_sub_days(Days::new(offset)).unwrap_or(date)
}

/// Compares the current (partial) ISO week against the mean of the four
/// full weeks immediately preceding it, per category, plus a standalone
/// large-transaction check over the current week's debits.
pub fn post_sync_alerts(transactions: &[Transaction], config: &AlertsConfig, as_of: NaiveDate) -> Vec<Alert> {
    let current_week_start = week_start(as_of);
    let mut current_by_category: HashMap<String, f64> = HashMap::new();
    let mut trailing_by_category: HashMap<String, [f64; 4]> = HashMap::new();

    for t in transactions {
        if t.direction != Direction::Debit {
            continue;
        }
        let category = t.category.clone().unwrap_or_else(|| "Uncategorized".to_string());

        if t.date >= current_week_start && t.date <= as_of {
            *current_by_category.entry(category.clone()).or_insert(0.0) += t.amount;
            continue;
        }

        for week_index in 0..4 {
            let week_end_exclusive = current_week_start - chrono::Duration::days(7 * week_index as i64);
            let week_begin = week_end_exclusive - chrono::Duration::days(7);
            if t.date >= week_begin && t.date < week_end_exclusive {
                trailing_by_category.entry(category.clone()).or_insert([0.0; 4])[week_index] += t.amount;
                break;
            }
        }
    }

    let mut alerts = Vec::new();
    let mut categories: Vec<String> = current_by_category.keys().chain(trailing_by_category.keys()).cloned().collect();
    categories.sort();
    categories.dedup();

    for category in categories {
        let current = *current_by_category.get(&category).unwrap_or(&0.0);
        let weeks = trailing_by_category.get(&category).copied().unwrap_or([0.0; 4]);
        let avg = weeks.iter().sum::<f64>() / 4.0;

        if avg == 0.0 && current > 0.0 {
            alerts.push(Alert {
                kind: AlertKind::NewCategory,
                category: Some(category.clone()),
                merchant: None,
                message: format!("first spending seen this week in a new category: {category}"),
            });
            continue;
        }

        if avg > 0.0 && current > avg * config.spike_threshold {
            let percent = (current - avg) / avg * 100.0;
            alerts.push(Alert {
                kind: AlertKind::SpendingSpike,
                category: Some(category.clone()),
                merchant: None,
                message: format!("{category} spending is up {percent:.0}% over the trailing 4-week average"),
            });
        }
    }

    for t in transactions {
        if t.direction != Direction::Debit {
            continue;
        }
        if t.date < current_week_start || t.date > as_of {
            continue;
        }
        if t.amount >= config.large_transaction_amount {
            alerts.push(Alert {
                kind: AlertKind::LargeTransaction,
                category: t.category.clone(),
                merchant: Some(t.merchant.clone()),
                message: format!("large transaction: {} for {:.2}", t.merchant, t.amount),
            });
        }
    }

    alerts
}

/// Flat, composable suggestion rules over the month-over-month,
/// category-trend, and merchant-recurrence views.
pub fn suggestions(
    month_over_month: &[MonthlyTotal],
    category_trend: &[CategoryTrendEntry],
    merchant_recurrence: &[MerchantRecurrence],
    transactions: &[Transaction],
) -> Vec<Suggestion> {
    let mut out = Vec::new();

    for entry in category_trend {
        if let Some(change) = entry.percent_change {
            if change > 50.0 && entry.current > 500.0 {
                out.push(Suggestion {
                    rule: "category_spike",
                    message: format!(
                        "{} spend is up {change:.0}% month over month and now totals {:.2}",
                        entry.category, entry.current
                    ),
                });
            }
        }
    }

    for merchant in merchant_recurrence {
        if merchant.frequency == "weekly" && merchant.total > 2000.0 {
            out.push(Suggestion {
                rule: "recurring_weekly_merchant",
                message: format!(
                    "{} is a weekly recurring merchant totaling {:.2}",
                    merchant.merchant, merchant.total
                ),
            });
        }
    }

    let merchant_total: f64 = transactions.iter().filter(|t| t.direction == Direction::Debit).map(|t| t.amount).sum();
    if merchant_total > 0.0 {
        if let Some(top) = merchant_recurrence.iter().max_by(|a, b| a.total.partial_cmp(&b.total).unwrap_or(std::cmp::Ordering::Equal)) {
            let share = top.total / merchant_total * 100.0;
            if share > 30.0 {
                out.push(Suggestion {
                    rule: "top_merchant_share",
                    message: format!("{} accounts for {share:.0}% of tracked spending", top.merchant),
                });
            }
        }
    }

    for window in month_over_month.windows(2) {
        let (prev, current) = (&window[0], &window[1]);
        if let Some(change) = current.percent_change {
            if change < -30.0 && prev.total > 1000.0 {
                out.push(Suggestion {
                    rule: "spending_drop",
                    message: format!("spending dropped {:.0}% from {} ({:.2})", change.abs(), prev.month, prev.total),
                });
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Source, TransactionType};

    fn debit(merchant: &str, amount: f64, date: NaiveDate, category: Option<&str>) -> Transaction {
        let mut t = Transaction::new(
            "msg-1",
            date,
            amount,
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
        );
        t.category = category.map(|c| c.to_string());
        t
    }

    #[test]
    fn month_over_month_first_entry_has_no_percent_change() {
        let txns = vec![
            debit("A", 100.0, NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(), None),
            debit("A", 200.0, NaiveDate::from_ymd_opt(2025, 2, 10).unwrap(), None),
        ];
        let result = month_over_month(&txns);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].percent_change, None);
        assert_eq!(result[1].percent_change, Some(100.0));
    }

    #[test]
    fn category_trend_sorts_by_absolute_swing() {
        let txns = vec![
            debit("A", 600.0, NaiveDate::from_ymd_opt(2025, 2, 5).unwrap(), Some("Food")),
            debit("A", 100.0, NaiveDate::from_ymd_opt(2025, 1, 5).unwrap(), Some("Food")),
            debit("B", 50.0, NaiveDate::from_ymd_opt(2025, 2, 5).unwrap(), Some("Transport")),
            debit("B", 100.0, NaiveDate::from_ymd_opt(2025, 1, 5).unwrap(), Some("Transport")),
        ];
        let as_of = NaiveDate::from_ymd_opt(2025, 2, 20).unwrap();
        let result = category_trend(&txns, as_of);
        assert_eq!(result[0].category, "Food");
    }

    #[test]
    fn merchant_recurrence_labels_weekly_cadence() {
        let txns = vec![
            debit("Netflix", 500.0, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(), None),
            debit("Netflix", 500.0, NaiveDate::from_ymd_opt(2025, 1, 8).unwrap(), None),
            debit("Netflix", 500.0, NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(), None),
        ];
        let result = merchant_recurrence(&txns);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].frequency, "weekly");
        assert_eq!(result[0].count, 3);
    }

    #[test]
    fn merchant_recurrence_excludes_single_occurrence() {
        let txns = vec![debit("OneOff", 500.0, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(), None)];
        assert!(merchant_recurrence(&txns).is_empty());
    }

    #[test]
    fn alert_spike_fires_for_category_over_threshold() {
        // Food: 1000/week for 4 trailing weeks, 2000 in the current (partial) week.
        let as_of = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(); // a Monday
        let current_week_start = week_start(as_of);

        let mut txns = vec![debit("Restaurant", 2000.0, current_week_start, Some("Food"))];
        for week_index in 1..=4i64 {
            let d = current_week_start - chrono::Duration::days(7 * week_index - 3);
            txns.push(debit("Restaurant", 1000.0, d, Some("Food")));
        }

        let config = AlertsConfig { spike_threshold: 1.4, large_transaction_amount: 50_000.0 };
        let alerts = post_sync_alerts(&txns, &config, as_of);
        let spikes: Vec<&Alert> = alerts.iter().filter(|a| a.kind == AlertKind::SpendingSpike).collect();
        assert_eq!(spikes.len(), 1);
        assert_eq!(spikes[0].category.as_deref(), Some("Food"));
        assert!(spikes[0].message.contains("100%"));
    }

    #[test]
    fn alert_new_category_fires_when_trailing_average_is_zero() {
        let as_of = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let txns = vec![debit("NewPlace", 100.0, as_of, Some("Health"))];
        let config = AlertsConfig { spike_threshold: 1.4, large_transaction_amount: 50_000.0 };
        let alerts = post_sync_alerts(&txns, &config, as_of);
        assert!(alerts.iter().any(|a| a.kind == AlertKind::NewCategory));
    }

    #[test]
    fn alert_large_transaction_fires_for_current_week_debit() {
        let as_of = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let txns = vec![debit("Electronics", 60_000.0, as_of, Some("Shopping"))];
        let config = AlertsConfig { spike_threshold: 1.4, large_transaction_amount: 50_000.0 };
        let alerts = post_sync_alerts(&txns, &config, as_of);
        assert!(alerts.iter().any(|a| a.kind == AlertKind::LargeTransaction));
    }

    #[test]
    fn suggestion_rules_compose_independently() {
        let month_over_month = vec![
            MonthlyTotal { month: "2025-01".into(), total: 2000.0, percent_change: None },
            MonthlyTotal { month: "2025-02".into(), total: 1200.0, percent_change: Some(-40.0) },
        ];
        let category_trend = vec![CategoryTrendEntry {
            category: "Food".into(),
            current: 600.0,
            previous: 300.0,
            percent_change: Some(100.0),
        }];
        let merchants = vec![MerchantRecurrence {
            merchant: "Netflix".into(),
            total: 2500.0,
            average: 500.0,
            count: 5,
            frequency: "weekly",
        }];
        let suggestions = suggestions(&month_over_month, &category_trend, &merchants, &[]);
        assert!(suggestions.iter().any(|s| s.rule == "category_spike"));
        assert!(suggestions.iter().any(|s| s.rule == "recurring_weekly_merchant"));
        assert!(suggestions.iter().any(|s| s.rule == "spending_drop"));
    }
}
