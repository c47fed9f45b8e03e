//! Aggregation anchored against a fake RFC 3161 authority

mod common;

use audit_ledger::aggregation::PeriodicAggregation;
use audit_ledger::anchoring::{message_imprint, Anchorer, LOCAL_AUTHORITY};
use audit_ledger::config::AnchoringConfig;
use audit_ledger::merkle::MerkleTree;
use audit_ledger::Ledger;
use chrono::{NaiveDate, TimeZone, Utc};
use common::*;
use std::sync::Arc;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn jan_15() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
}

fn tsa_config(url: String, max_retries: u32) -> AnchoringConfig {
    AnchoringConfig {
        tsa_url: Some(url),
        timeout_secs: 5,
        max_retries,
        backoff_ms: 1,
    }
}

#[tokio::test]
async fn test_daily_root_is_stamped_by_tsa() {
    let ledger = three_event_ledger().await;
    let day = ledger.query_by_time_range(JAN_15, JAN_15 + DAY).await;
    let root = MerkleTree::build_from_entries(&day).unwrap().root_hash();

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/tsr"))
        .and(header("content-type", "application/timestamp-query"))
        .respond_with(GrantingTsa("20250116000500Z"))
        .expect(1)
        .mount(&server)
        .await;

    let anchorer = Anchorer::from_config(&tsa_config(format!("{}/tsr", server.uri()), 2)).unwrap();
    assert!(anchorer.has_external_authority());
    let aggregation = PeriodicAggregation::new(ledger, Arc::new(anchorer));

    let result = aggregation.aggregate_daily(Some(jan_15())).await.unwrap();
    assert_eq!(result.merkle_root, root);
    assert_eq!(result.entry_count, 3);
    assert!(result.timestamped);
    assert!(result.anchor.is_externally_anchored());
    assert_eq!(
        result.anchor.timestamped_at,
        Some(Utc.with_ymd_and_hms(2025, 1, 16, 0, 5, 0).unwrap())
    );

    let token = result.anchor.external_timestamp.as_ref().unwrap();
    assert_eq!(token.authority, format!("{}/tsr", server.uri()));
    assert_eq!(token.time_iso(), "2025-01-16T00:05:00+00:00");

    let report = aggregation.verify_anchor("2025-01-15").await;
    assert!(report.verified);
    assert!(report.authoritative);
}

#[tokio::test]
async fn test_unavailable_tsa_falls_back_to_local_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let anchorer = Anchorer::from_config(&tsa_config(server.uri(), 1)).unwrap();
    let aggregation = PeriodicAggregation::new(Ledger::new(), Arc::new(anchorer));

    let result = aggregation.aggregate_daily(Some(jan_15())).await.unwrap();
    assert!(result.anchored);
    assert!(result.timestamped);
    assert!(!result.anchor.is_externally_anchored());

    let token = result.anchor.external_timestamp.unwrap();
    assert!(!token.authoritative);
    assert_eq!(token.authority, LOCAL_AUTHORITY);
}

#[tokio::test]
async fn test_unconfigured_authority_is_local_only() {
    let anchorer = Anchorer::from_config(&AnchoringConfig::default()).unwrap();
    assert!(!anchorer.has_external_authority());

    let token = anchorer.request_timestamp("deadbeef").await;
    assert!(!token.authoritative);
    assert_eq!(token.imprint, hex::encode(message_imprint("deadbeef")));
}

#[tokio::test]
async fn test_reply_with_foreign_nonce_falls_back_to_local() {
    let root = MerkleTree::build(&["x"]).root_hash();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(granted_tsa_response(
            &message_imprint(&root),
            "20250116000500Z",
            &[0x05],
        )))
        .expect(2)
        .mount(&server)
        .await;

    let anchorer = Anchorer::from_config(&tsa_config(server.uri(), 1)).unwrap();
    let token = anchorer.request_timestamp(&root).await;

    assert!(!token.authoritative);
    assert_eq!(token.authority, LOCAL_AUTHORITY);
}
