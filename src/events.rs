//! Audit Event Model
//!
//! Closed set of event kinds produced by assessment delivery and scoring,
//! each carrying the payload keys it requires. Constructing and validating
//! an event has no side effects; the ledger is the only writer.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{LedgerError, Result};

/// Ordered string → value mapping used for payloads and metadata.
pub type Payload = BTreeMap<String, Value>;

const SCORING_REQUIRED: &[&str] = &[
    "score_run_id",
    "response_snapshot_id",
    "rubric_version",
    "input_hash",
    "output_hash",
];

/// Every kind of event the ledger accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStart,
    SessionEnd,
    ConsentRecorded,
    DiagnosticStart,
    DiagnosticSubmit,
    InterviewStart,
    InterviewSubmit,
    AnswerSubmitted,
    ItemViewed,
    Terminate,
    Timeout,
    ScoringRunCreated,
    ScoringRescore,
}

impl EventKind {
    pub const ALL: [EventKind; 13] = [
        EventKind::SessionStart,
        EventKind::SessionEnd,
        EventKind::ConsentRecorded,
        EventKind::DiagnosticStart,
        EventKind::DiagnosticSubmit,
        EventKind::InterviewStart,
        EventKind::InterviewSubmit,
        EventKind::AnswerSubmitted,
        EventKind::ItemViewed,
        EventKind::Terminate,
        EventKind::Timeout,
        EventKind::ScoringRunCreated,
        EventKind::ScoringRescore,
    ];

    /// Tag used on the wire and inside the hash input
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SessionStart => "session_start",
            EventKind::SessionEnd => "session_end",
            EventKind::ConsentRecorded => "consent_recorded",
            EventKind::DiagnosticStart => "diagnostic_start",
            EventKind::DiagnosticSubmit => "diagnostic_submit",
            EventKind::InterviewStart => "interview_start",
            EventKind::InterviewSubmit => "interview_submit",
            EventKind::AnswerSubmitted => "answer_submitted",
            EventKind::ItemViewed => "item_viewed",
            EventKind::Terminate => "terminate",
            EventKind::Timeout => "timeout",
            EventKind::ScoringRunCreated => "scoring_run_created",
            EventKind::ScoringRescore => "scoring_rescore",
        }
    }

    /// Payload keys that must be present for this kind
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            EventKind::SessionStart => &["ip_address", "user_agent"],
            EventKind::SessionEnd => &["reason"],
            EventKind::ConsentRecorded => &["consent_version", "consent_given"],
            EventKind::DiagnosticStart => &["item_count"],
            EventKind::DiagnosticSubmit => &["items_attempted", "items_correct"],
            EventKind::InterviewStart => &["challenge_ids"],
            EventKind::InterviewSubmit => &["responses_recorded"],
            EventKind::AnswerSubmitted => &["item_id", "response"],
            EventKind::ItemViewed => &["item_id"],
            EventKind::Terminate => &["reason"],
            EventKind::Timeout => &["session_duration"],
            EventKind::ScoringRunCreated | EventKind::ScoringRescore => SCORING_REQUIRED,
        }
    }

    /// Payload keys that are documented but not enforced
    pub fn optional_fields(&self) -> &'static [&'static str] {
        match self {
            EventKind::SessionStart => &["browser_fingerprint", "platform"],
            EventKind::SessionEnd => &["duration_seconds", "events_completed"],
            EventKind::ConsentRecorded => &["ip_address"],
            EventKind::DiagnosticStart => &["time_limit"],
            EventKind::DiagnosticSubmit => &["time_taken_seconds"],
            EventKind::InterviewStart => &["time_limit"],
            EventKind::InterviewSubmit => &["duration_seconds"],
            EventKind::AnswerSubmitted => &["time_taken_seconds", "flagged"],
            EventKind::ItemViewed => &["view_duration_seconds"],
            EventKind::Terminate => &["actor", "notes"],
            EventKind::Timeout => &["last_activity"],
            EventKind::ScoringRunCreated => &["feature_version"],
            EventKind::ScoringRescore => &["feature_version", "reason"],
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| LedgerError::NotFound(format!("unknown event kind: {}", s)))
    }
}

/// A candidate event, not yet chained
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub kind: EventKind,
    pub session_id: String,
    pub candidate_id: String,
    pub actor: String,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
    pub payload: Payload,
    pub metadata: Payload,
}

impl AuditEvent {
    /// Required payload keys absent from this event
    pub fn missing_fields(&self) -> Vec<&'static str> {
        self.kind
            .required_fields()
            .iter()
            .copied()
            .filter(|field| !self.payload.contains_key(*field))
            .collect()
    }

    /// Check required payload keys. Extra keys are allowed.
    pub fn validate(&self) -> Result<()> {
        let missing = self.missing_fields();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(LedgerError::schema_violation(self.kind, missing))
        }
    }

    pub fn is_valid(&self) -> bool {
        self.missing_fields().is_empty()
    }
}

/// Build an event, defaulting metadata to empty and the timestamp to now
pub fn create_event(
    kind: EventKind,
    session_id: impl Into<String>,
    candidate_id: impl Into<String>,
    actor: impl Into<String>,
    payload: Payload,
    metadata: Option<Payload>,
    timestamp: Option<f64>,
) -> AuditEvent {
    AuditEvent {
        kind,
        session_id: session_id.into(),
        candidate_id: candidate_id.into(),
        actor: actor.into(),
        timestamp: timestamp.unwrap_or_else(now_epoch_seconds),
        payload,
        metadata: metadata.unwrap_or_default(),
    }
}

/// Current wall-clock time as fractional seconds since the epoch
pub fn now_epoch_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Build a payload from `(key, value)` pairs
pub fn payload<I, K, V>(pairs: I) -> Payload
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
