//! Periodic Aggregation
//!
//! Rolls the ledger entries of a day, ISO week or calendar month into a
//! Merkle root and anchors it. Periods are half-open UTC intervals; keys are
//! `YYYY-MM-DD`, `YYYY-Www` and `YYYY-MM`.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::anchoring::{Anchorer, TimestampAnchor};
use crate::error::{LedgerError, Result};
use crate::ledger::{Ledger, LedgerEntry};
use crate::merkle::MerkleTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationPeriod {
    Daily,
    Weekly,
    Monthly,
}

impl AggregationPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationPeriod::Daily => "daily",
            AggregationPeriod::Weekly => "weekly",
            AggregationPeriod::Monthly => "monthly",
        }
    }

    /// Date inside the most recently completed period before `today`
    pub fn previous(&self, today: NaiveDate) -> Result<NaiveDate> {
        let days_back = match self {
            AggregationPeriod::Daily => 1,
            AggregationPeriod::Weekly => 7,
            AggregationPeriod::Monthly => i64::from(today.day()),
        };
        today
            .checked_sub_signed(ChronoDuration::days(days_back))
            .ok_or_else(|| self.out_of_range(today))
    }

    /// The period containing `date`
    pub fn window(&self, date: NaiveDate) -> Result<PeriodWindow> {
        let (key, start) = match self {
            AggregationPeriod::Daily => (date.format("%Y-%m-%d").to_string(), Some(date)),
            AggregationPeriod::Weekly => {
                let week = date.iso_week();
                let offset = i64::from(date.weekday().num_days_from_monday());
                (
                    format!("{}-W{:02}", week.year(), week.week()),
                    date.checked_sub_signed(ChronoDuration::days(offset)),
                )
            }
            AggregationPeriod::Monthly => (date.format("%Y-%m").to_string(), date.with_day(1)),
        };
        let start = start.ok_or_else(|| self.out_of_range(date))?;

        let end = match self {
            AggregationPeriod::Daily => start.succ_opt(),
            AggregationPeriod::Weekly => start.checked_add_signed(ChronoDuration::days(7)),
            AggregationPeriod::Monthly => start.checked_add_months(Months::new(1)),
        };
        let end = end.ok_or_else(|| self.out_of_range(date))?;

        Ok(PeriodWindow {
            period: *self,
            key,
            start,
            end,
        })
    }

    fn out_of_range(&self, date: NaiveDate) -> LedgerError {
        LedgerError::InvalidPeriod(format!("{} period of {} is out of range", self, date))
    }
}

impl fmt::Display for AggregationPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `[start, end)` in UTC days
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodWindow {
    pub period: AggregationPeriod,
    pub key: String,
    pub start: NaiveDate,
    /// Exclusive
    pub end: NaiveDate,
}

impl PeriodWindow {
    fn epoch_seconds(date: NaiveDate) -> f64 {
        date.and_hms_opt(0, 0, 0)
            .map(|midnight| midnight.and_utc().timestamp() as f64)
            .unwrap_or_default()
    }

    pub fn start_timestamp(&self) -> f64 {
        Self::epoch_seconds(self.start)
    }

    pub fn end_timestamp(&self) -> f64 {
        Self::epoch_seconds(self.end)
    }

    /// Last day inside the window
    pub fn last_day(&self) -> NaiveDate {
        self.end.pred_opt().unwrap_or(self.start)
    }
}

/// Outcome of one aggregation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    pub period: AggregationPeriod,
    pub period_key: String,
    pub start_date: NaiveDate,
    /// Inclusive
    pub end_date: NaiveDate,
    pub entry_count: usize,
    pub session_count: usize,
    pub merkle_root: String,
    pub anchor: TimestampAnchor,
    pub anchored: bool,
    pub timestamped: bool,
    pub created_at: DateTime<Utc>,
}

/// Integrity of one stored anchor record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorVerification {
    pub period_key: String,
    pub verified: bool,
    pub merkle_root: Option<String>,
    pub entry_count: usize,
    pub session_count: usize,
    pub timestamped: bool,
    pub timestamped_at: Option<DateTime<Utc>>,
    /// Timestamp came from an external authority
    pub authoritative: bool,
    pub error: Option<String>,
}

/// Stored anchor compared with a fresh aggregation of current ledger contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodVerification {
    pub period_key: String,
    pub anchored_root: Option<String>,
    pub recomputed_root: String,
    pub anchor_intact: bool,
    pub matches: bool,
}

/// Aggregates ledger periods into anchored Merkle roots
pub struct PeriodicAggregation {
    ledger: Ledger,
    anchorer: Arc<Anchorer>,
    history: RwLock<Vec<AggregationResult>>,
    period_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PeriodicAggregation {
    pub fn new(ledger: Ledger, anchorer: Arc<Anchorer>) -> Self {
        Self {
            ledger,
            anchorer,
            history: RwLock::new(Vec::new()),
            period_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn anchorer(&self) -> &Anchorer {
        &self.anchorer
    }

    /// Aggregate `date` (default: yesterday)
    pub async fn aggregate_daily(&self, date: Option<NaiveDate>) -> Result<AggregationResult> {
        self.aggregate(AggregationPeriod::Daily, date).await
    }

    /// Aggregate the ISO week containing `date` (default: last week)
    pub async fn aggregate_weekly(&self, date: Option<NaiveDate>) -> Result<AggregationResult> {
        self.aggregate(AggregationPeriod::Weekly, date).await
    }

    /// Aggregate the month containing `date` (default: last month)
    pub async fn aggregate_monthly(&self, date: Option<NaiveDate>) -> Result<AggregationResult> {
        self.aggregate(AggregationPeriod::Monthly, date).await
    }

    async fn period_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.period_locks.lock().await;
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Drop our handle and forget the lock once no other run holds or awaits it
    async fn release_period_lock(&self, key: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.period_locks.lock().await;
        drop(lock);
        if locks.get(key).is_some_and(|held| Arc::strong_count(held) == 1) {
            locks.remove(key);
        }
    }

    async fn entries_in(&self, window: &PeriodWindow) -> Vec<LedgerEntry> {
        self.ledger
            .query_by_time_range(window.start_timestamp(), window.end_timestamp())
            .await
    }

    /// Aggregate one period. Runs for the same period key are serialized.
    pub async fn aggregate(
        &self,
        period: AggregationPeriod,
        date: Option<NaiveDate>,
    ) -> Result<AggregationResult> {
        let date = match date {
            Some(date) => date,
            None => period.previous(Utc::now().date_naive())?,
        };
        let window = period.window(date)?;

        let lock = self.period_lock(&window.key).await;
        let result = {
            let _guard = lock.lock().await;
            self.run_period(period, &window).await
        };
        self.release_period_lock(&window.key, lock).await;
        result
    }

    async fn run_period(
        &self,
        period: AggregationPeriod,
        window: &PeriodWindow,
    ) -> Result<AggregationResult> {
        let entries = self.entries_in(window).await;
        let tree = MerkleTree::build_from_entries(&entries)?;
        let merkle_root = tree.root_hash();
        let session_ids: BTreeSet<String> =
            entries.iter().map(|entry| entry.session_id.clone()).collect();

        debug!(
            "Aggregating {} {}: {} entries, {} sessions",
            period,
            window.key,
            entries.len(),
            session_ids.len()
        );

        let session_count = session_ids.len();
        let anchor = self
            .anchorer
            .anchor_root(&merkle_root, &window.key, entries.len(), session_ids)
            .await?;

        if !anchor.is_externally_anchored() {
            warn!("Anchor for {} carries a local, non-authoritative timestamp", window.key);
        }

        let result = AggregationResult {
            period,
            period_key: window.key.clone(),
            start_date: window.start,
            end_date: window.last_day(),
            entry_count: entries.len(),
            session_count,
            merkle_root,
            timestamped: anchor.timestamped_at.is_some(),
            anchor,
            anchored: true,
            created_at: Utc::now(),
        };

        self.history.write().await.push(result.clone());
        info!(
            "Completed {} aggregation for {}: root {} over {} entries",
            period, result.period_key, result.merkle_root, result.entry_count
        );

        Ok(result)
    }

    /// Check that every stored anchor record for `period_key` is unaltered.
    /// Details are reported from the most recent record.
    pub async fn verify_anchor(&self, period_key: &str) -> AnchorVerification {
        let anchors = self.anchorer.anchors_for_period(period_key).await;
        let Some(anchor) = anchors.last() else {
            return AnchorVerification {
                period_key: period_key.to_string(),
                verified: false,
                merkle_root: None,
                entry_count: 0,
                session_count: 0,
                timestamped: false,
                timestamped_at: None,
                authoritative: false,
                error: Some(format!("No anchor found for period {}", period_key)),
            };
        };

        let altered = anchors
            .iter()
            .filter(|record| !self.anchorer.verify_anchor_integrity(record))
            .count();
        let error = (altered > 0).then(|| {
            format!(
                "{} of {} anchor records for {} do not match their anchor hash",
                altered,
                anchors.len(),
                period_key
            )
        });
        if let Some(message) = &error {
            error!("{}", message);
        }

        AnchorVerification {
            period_key: period_key.to_string(),
            verified: altered == 0,
            merkle_root: Some(anchor.merkle_root.clone()),
            entry_count: anchor.entry_count,
            session_count: anchor.session_ids.len(),
            timestamped: anchor.is_timestamped(),
            timestamped_at: anchor.timestamped_at,
            authoritative: anchor.is_externally_anchored(),
            error,
        }
    }

    /// Recompute the period's root from the ledger and compare with its anchor
    pub async fn verify_period_against_ledger(
        &self,
        period: AggregationPeriod,
        date: NaiveDate,
    ) -> Result<PeriodVerification> {
        let window = period.window(date)?;
        let entries = self.entries_in(&window).await;
        let recomputed_root = MerkleTree::build_from_entries(&entries)?.root_hash();

        let anchors = self.anchorer.anchors_for_period(&window.key).await;
        let anchor_intact = !anchors.is_empty() && anchors.iter().all(|a| a.verify_integrity());
        let anchored_root = anchors.last().map(|a| a.merkle_root.clone());
        let matches = anchor_intact && anchored_root.as_deref() == Some(recomputed_root.as_str());

        if !matches {
            warn!(
                "Ledger contents for {} no longer match the anchored root",
                window.key
            );
        }

        Ok(PeriodVerification {
            period_key: window.key,
            anchored_root,
            recomputed_root,
            anchor_intact,
            matches,
        })
    }

    /// Aggregation results in run order, optionally for one period kind
    pub async fn history(&self, period: Option<AggregationPeriod>) -> Vec<AggregationResult> {
        self.history
            .read()
            .await
            .iter()
            .filter(|result| period.map_or(true, |p| result.period == p))
            .cloned()
            .collect()
    }

    pub async fn last_merkle_root(&self, period: AggregationPeriod) -> Option<String> {
        self.history
            .read()
            .await
            .iter()
            .rev()
            .find(|result| result.period == period)
            .map(|result| result.merkle_root.clone())
    }

    pub async fn anchor_for_period(&self, period_key: &str) -> Option<TimestampAnchor> {
        self.anchorer.anchor_for_period(period_key).await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub scheduled: BTreeSet<AggregationPeriod>,
    pub last_run: BTreeMap<AggregationPeriod, DateTime<Utc>>,
}

/// Runs aggregations on demand or on a fixed interval
pub struct AggregationScheduler {
    aggregation: Arc<PeriodicAggregation>,
    status: RwLock<SchedulerStatus>,
}

impl AggregationScheduler {
    pub fn new(aggregation: Arc<PeriodicAggregation>) -> Self {
        Self {
            aggregation,
            status: RwLock::new(SchedulerStatus::default()),
        }
    }

    /// Aggregate the previous `period` now
    pub async fn run(&self, period: AggregationPeriod) -> Result<AggregationResult> {
        let result = self.aggregation.aggregate(period, None).await?;
        self.status.write().await.last_run.insert(period, Utc::now());
        Ok(result)
    }

    pub async fn status(&self) -> SchedulerStatus {
        self.status.read().await.clone()
    }

    /// Run `period` every `every`, starting one interval from now
    pub async fn spawn(self: Arc<Self>, period: AggregationPeriod, every: Duration) -> JoinHandle<()> {
        self.status.write().await.scheduled.insert(period);
        info!("Scheduled {} aggregation every {:?}", period, every);

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + every;
            let mut interval = tokio::time::interval_at(start, every);
            loop {
                interval.tick().await;
                if let Err(e) = self.run(period).await {
                    error!("Scheduled {} aggregation failed: {}", period, e);
                }
            }
        })
    }
}
