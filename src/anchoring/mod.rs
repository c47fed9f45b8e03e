//! Anchoring
//!
//! Binds Merkle roots to an external point in time. Each aggregation run
//! produces a [`TimestampAnchor`]; the [`Anchorer`] obtains a token for it
//! (falling back to a local, non-authoritative token when the configured
//! authority cannot be reached) and keeps the anchor book.

pub mod authority;
pub mod rfc3161;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::canonical::sha256_hex;
use crate::config::AnchoringConfig;
use crate::error::{LedgerError, Result};

pub use authority::{
    message_imprint, LocalTimestampAuthority, TimestampAuthority, TimestampToken, LOCAL_AUTHORITY,
};
pub use rfc3161::Rfc3161Client;

/// Anchor record for one aggregation period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampAnchor {
    pub merkle_root: String,
    pub period_key: String,
    pub created_at: DateTime<Utc>,
    /// Set exactly once by [`Anchorer::apply_timestamp`]
    pub external_timestamp: Option<TimestampToken>,
    pub timestamped_at: Option<DateTime<Utc>>,
    pub entry_count: usize,
    pub session_ids: BTreeSet<String>,
    pub anchor_hash: String,
}

impl TimestampAnchor {
    pub fn is_timestamped(&self) -> bool {
        self.external_timestamp.is_some()
    }

    /// Timestamped by a real authority rather than the local fallback
    pub fn is_externally_anchored(&self) -> bool {
        self.external_timestamp
            .as_ref()
            .map_or(false, |token| token.authoritative)
    }

    /// Whether `anchor_hash` still matches `merkle_root` and `period_key`
    pub fn verify_integrity(&self) -> bool {
        compute_anchor_hash(&self.merkle_root, &self.period_key) == self.anchor_hash
    }
}

/// `H(canonical({merkle_root, period_key}))`
pub fn compute_anchor_hash(merkle_root: &str, period_key: &str) -> String {
    let content = json!({
        "merkle_root": merkle_root,
        "period_key": period_key,
    });
    sha256_hex(content.to_string().as_bytes())
}

/// Requests timestamps and records anchors
pub struct Anchorer {
    authority: Option<Arc<dyn TimestampAuthority>>,
    local: LocalTimestampAuthority,
    timeout: Duration,
    max_retries: u32,
    backoff: Duration,
    anchors: RwLock<Vec<TimestampAnchor>>,
}

impl Anchorer {
    /// Anchorer using `authority` with the default retry policy
    pub fn new(authority: Option<Arc<dyn TimestampAuthority>>) -> Self {
        let defaults = AnchoringConfig::default();
        Self {
            authority,
            local: LocalTimestampAuthority::new(),
            timeout: defaults.timeout(),
            max_retries: defaults.max_retries,
            backoff: defaults.backoff(),
            anchors: RwLock::new(Vec::new()),
        }
    }

    /// Anchorer that only issues local timestamps
    pub fn local_only() -> Self {
        Self::new(None)
    }

    /// Anchorer for the configured TSA, or local-only when none is set
    pub fn from_config(config: &AnchoringConfig) -> Result<Self> {
        let authority: Option<Arc<dyn TimestampAuthority>> = match &config.tsa_url {
            Some(url) => {
                info!("Anchoring against RFC 3161 authority {}", url);
                Some(Arc::new(Rfc3161Client::new(url.clone(), config.timeout())?))
            }
            None => {
                info!("No timestamp authority configured, anchors will carry local timestamps");
                None
            }
        };

        Ok(Self::new(authority).with_retry_policy(
            config.timeout(),
            config.max_retries,
            config.backoff(),
        ))
    }

    /// Per-attempt timeout, retry count and initial backoff
    pub fn with_retry_policy(mut self, timeout: Duration, max_retries: u32, backoff: Duration) -> Self {
        self.timeout = timeout;
        self.max_retries = max_retries;
        self.backoff = backoff;
        self
    }

    /// Replace the fallback authority (fixed clock in tests)
    pub fn with_local_authority(mut self, local: LocalTimestampAuthority) -> Self {
        self.local = local;
        self
    }

    pub fn has_external_authority(&self) -> bool {
        self.authority.is_some()
    }

    /// New anchor for `merkle_root`, not yet timestamped or recorded
    pub fn create_anchor(
        &self,
        merkle_root: &str,
        period_key: &str,
        entry_count: usize,
        session_ids: BTreeSet<String>,
    ) -> TimestampAnchor {
        TimestampAnchor {
            merkle_root: merkle_root.to_string(),
            period_key: period_key.to_string(),
            created_at: Utc::now(),
            external_timestamp: None,
            timestamped_at: None,
            entry_count,
            session_ids,
            anchor_hash: compute_anchor_hash(merkle_root, period_key),
        }
    }

    async fn attempt(&self, authority: &dyn TimestampAuthority, imprint: &[u8; 32]) -> Result<TimestampToken> {
        match tokio::time::timeout(self.timeout, authority.timestamp(imprint)).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::AnchoringUnavailable(format!(
                "{} did not answer within {:?}",
                authority.name(),
                self.timeout
            ))),
        }
    }

    /// Timestamp token over `merkle_root`.
    ///
    /// Never fails: when the external authority is absent or keeps failing
    /// the token comes from the local authority and is non-authoritative.
    pub async fn request_timestamp(&self, merkle_root: &str) -> TimestampToken {
        let imprint = message_imprint(merkle_root);

        if let Some(authority) = &self.authority {
            let attempts = self.max_retries + 1;
            let mut delay = self.backoff;

            for attempt in 1..=attempts {
                match self.attempt(authority.as_ref(), &imprint).await {
                    Ok(token) => return token,
                    Err(e) if e.is_transient() && attempt < attempts => {
                        warn!(
                            "Timestamp attempt {}/{} against {} failed: {}; retrying in {:?}",
                            attempt,
                            attempts,
                            authority.name(),
                            e,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        delay = delay.saturating_mul(2);
                    }
                    Err(e) => {
                        warn!(
                            "Timestamp authority {} unavailable: {}; using local timestamp",
                            authority.name(),
                            e
                        );
                        break;
                    }
                }
            }
        }

        self.local.issue(&imprint)
    }

    /// Attach `token` to `anchor`. An anchor can only be timestamped once.
    pub fn apply_timestamp(&self, anchor: &mut TimestampAnchor, token: TimestampToken) -> Result<()> {
        if anchor.external_timestamp.is_some() {
            return Err(LedgerError::AlreadyTimestamped(anchor.period_key.clone()));
        }

        debug!(
            "Applying {} timestamp {} to anchor {}",
            token.authority,
            token.time_iso(),
            anchor.period_key
        );
        anchor.timestamped_at = Some(token.time);
        anchor.external_timestamp = Some(token);
        Ok(())
    }

    /// Store `anchor` in the anchor book
    pub async fn record(&self, anchor: TimestampAnchor) {
        info!(
            "Recorded anchor for {} (root {}, {} entries)",
            anchor.period_key, anchor.merkle_root, anchor.entry_count
        );
        self.anchors.write().await.push(anchor);
    }

    /// Create, timestamp and record an anchor for `merkle_root`
    pub async fn anchor_root(
        &self,
        merkle_root: &str,
        period_key: &str,
        entry_count: usize,
        session_ids: BTreeSet<String>,
    ) -> Result<TimestampAnchor> {
        let mut anchor = self.create_anchor(merkle_root, period_key, entry_count, session_ids);
        let token = self.request_timestamp(merkle_root).await;
        self.apply_timestamp(&mut anchor, token)?;
        self.record(anchor.clone()).await;
        Ok(anchor)
    }

    /// Whether an unaltered recorded anchor covers exactly `root` for `period_key`
    pub async fn verify_anchored_root(&self, root: &str, period_key: &str) -> bool {
        self.anchors.read().await.iter().any(|anchor| {
            anchor.merkle_root == root && anchor.period_key == period_key && anchor.verify_integrity()
        })
    }

    /// Most recent anchor recorded for `period_key`
    pub async fn anchor_for_period(&self, period_key: &str) -> Option<TimestampAnchor> {
        self.anchors
            .read()
            .await
            .iter()
            .rev()
            .find(|anchor| anchor.period_key == period_key)
            .cloned()
    }

    pub async fn anchors_for_period(&self, period_key: &str) -> Vec<TimestampAnchor> {
        self.anchors
            .read()
            .await
            .iter()
            .filter(|anchor| anchor.period_key == period_key)
            .cloned()
            .collect()
    }

    pub async fn all_anchors(&self) -> Vec<TimestampAnchor> {
        self.anchors.read().await.clone()
    }

    pub fn verify_anchor_integrity(&self, anchor: &TimestampAnchor) -> bool {
        anchor.verify_integrity()
    }

    /// Edit recorded anchors in place. Tests only.
    #[cfg(test)]
    pub(crate) async fn tamper<F>(&self, f: F)
    where
        F: FnOnce(&mut Vec<TimestampAnchor>),
    {
        f(&mut *self.anchors.write().await);
    }
}

impl Default for Anchorer {
    fn default() -> Self {
        Self::local_only()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    const ROOT: &str = "ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12";

    /// Fails `failures` times, then succeeds
    struct FlakyAuthority {
        calls: AtomicU32,
        failures: u32,
    }

    #[async_trait]
    impl TimestampAuthority for FlakyAuthority {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn timestamp(&self, imprint: &[u8; 32]) -> Result<TimestampToken> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(LedgerError::AnchoringUnavailable("connection refused".to_string()));
            }
            Ok(TimestampToken {
                authority: "flaky".to_string(),
                authoritative: true,
                imprint: hex::encode(imprint),
                time: Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap(),
                token: vec![1, 2, 3],
            })
        }
    }

    struct StalledAuthority;

    #[async_trait]
    impl TimestampAuthority for StalledAuthority {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn timestamp(&self, _imprint: &[u8; 32]) -> Result<TimestampToken> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(LedgerError::AnchoringUnavailable("unreachable".to_string()))
        }
    }

    fn flaky(failures: u32) -> Arc<FlakyAuthority> {
        Arc::new(FlakyAuthority {
            calls: AtomicU32::new(0),
            failures,
        })
    }

    #[test]
    fn test_anchor_hash_is_deterministic() {
        let anchorer = Anchorer::local_only();
        let a = anchorer.create_anchor(ROOT, "2025-01-15", 3, BTreeSet::new());
        let b = anchorer.create_anchor(ROOT, "2025-01-15", 3, BTreeSet::new());
        assert_eq!(a.anchor_hash, b.anchor_hash);
        assert_ne!(a.anchor_hash, compute_anchor_hash(ROOT, "2025-01-16"));
        assert!(a.verify_integrity());
        assert!(!a.is_timestamped());
    }

    #[tokio::test]
    async fn test_local_fallback_is_marked() {
        let anchorer = Anchorer::local_only();
        let token = anchorer.request_timestamp(ROOT).await;
        assert!(!token.authoritative);
        assert_eq!(token.authority, LOCAL_AUTHORITY);
        assert_eq!(token.imprint, hex::encode(message_imprint(ROOT)));
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let authority = flaky(2);
        let anchorer = Anchorer::new(Some(authority.clone())).with_retry_policy(
            Duration::from_secs(1),
            3,
            Duration::from_millis(1),
        );

        let token = anchorer.request_timestamp(ROOT).await;
        assert!(token.authoritative);
        assert_eq!(authority.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_falls_back_after_exhausting_retries() {
        let authority = flaky(10);
        let anchorer = Anchorer::new(Some(authority.clone())).with_retry_policy(
            Duration::from_secs(1),
            2,
            Duration::from_millis(1),
        );

        let token = anchorer.request_timestamp(ROOT).await;
        assert!(!token.authoritative);
        assert_eq!(authority.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_falls_back_to_local() {
        let anchorer = Anchorer::new(Some(Arc::new(StalledAuthority))).with_retry_policy(
            Duration::from_millis(20),
            0,
            Duration::from_millis(1),
        );

        let token = anchorer.request_timestamp(ROOT).await;
        assert!(!token.authoritative);
    }

    #[tokio::test]
    async fn test_apply_timestamp_only_once() {
        let time = Utc.with_ymd_and_hms(2025, 1, 16, 0, 5, 0).unwrap();
        let anchorer =
            Anchorer::local_only().with_local_authority(LocalTimestampAuthority::with_fixed_time(time));
        let mut anchor = anchorer.create_anchor(ROOT, "2025-01-15", 0, BTreeSet::new());

        let token = anchorer.request_timestamp(ROOT).await;
        anchorer.apply_timestamp(&mut anchor, token.clone()).unwrap();
        assert_eq!(anchor.timestamped_at, Some(time));
        assert!(anchor.is_timestamped());
        assert!(!anchor.is_externally_anchored());

        let err = anchorer.apply_timestamp(&mut anchor, token).unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyTimestamped(key) if key == "2025-01-15"));
    }

    #[tokio::test]
    async fn test_anchor_book_lookup() {
        let anchorer = Anchorer::local_only();
        let first = anchorer.anchor_root(ROOT, "2025-01-15", 2, BTreeSet::new()).await.unwrap();
        let second = anchorer.anchor_root(ROOT, "2025-01-15", 2, BTreeSet::new()).await.unwrap();

        assert_eq!(first.anchor_hash, second.anchor_hash);
        assert!(anchorer.verify_anchored_root(ROOT, "2025-01-15").await);
        assert!(!anchorer.verify_anchored_root(ROOT, "2025-01-16").await);
        assert!(!anchorer.verify_anchored_root("other", "2025-01-15").await);
        assert_eq!(anchorer.anchors_for_period("2025-01-15").await.len(), 2);
        assert_eq!(anchorer.all_anchors().await.len(), 2);
        assert!(anchorer.anchor_for_period("2025-01-16").await.is_none());
    }

    #[tokio::test]
    async fn test_tampered_anchor_record_fails_integrity() {
        let anchorer = Anchorer::local_only();
        anchorer.anchor_root(ROOT, "2025-01-15", 1, BTreeSet::new()).await.unwrap();

        anchorer
            .tamper(|anchors| anchors[0].merkle_root = "f".repeat(64))
            .await;

        let anchor = anchorer.anchor_for_period("2025-01-15").await.unwrap();
        assert!(!anchorer.verify_anchor_integrity(&anchor));
    }

    #[tokio::test]
    async fn test_edited_record_does_not_anchor_forged_root() {
        let anchorer = Anchorer::local_only();
        anchorer.anchor_root(ROOT, "2025-01-15", 1, BTreeSet::new()).await.unwrap();
        anchorer.anchor_root(ROOT, "2025-01-15", 1, BTreeSet::new()).await.unwrap();

        let forged = "f".repeat(64);
        anchorer.tamper(|anchors| anchors[0].merkle_root = forged.clone()).await;

        assert!(!anchorer.verify_anchored_root(&forged, "2025-01-15").await);
        assert!(anchorer.verify_anchored_root(ROOT, "2025-01-15").await);
    }
}
