//! Ledger Entry
//!
//! One hash-chained record. The hash covers every field except itself,
//! serialized canonically, so any edit to a stored entry is detectable.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::canonical::hash_canonical;
use crate::error::{LedgerError, Result};
use crate::events::{AuditEvent, EventKind, Payload};

/// Chained audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub sequence_id: u64,
    pub timestamp: f64,
    pub session_id: String,
    pub candidate_id: String,
    pub actor: String,
    pub event_type: EventKind,
    pub payload: Payload,
    pub metadata: Payload,
    pub prev_hash: String,
    pub hash: String,
}

/// Hash input: every entry field except `hash`
#[derive(Serialize)]
struct HashedFields<'a> {
    sequence_id: u64,
    timestamp: f64,
    session_id: &'a str,
    candidate_id: &'a str,
    actor: &'a str,
    event_type: EventKind,
    payload: &'a Payload,
    metadata: &'a Payload,
    prev_hash: &'a str,
}

impl LedgerEntry {
    /// Chain `event` after `prev_hash` as entry number `sequence_id`
    pub fn seal(sequence_id: u64, event: AuditEvent, prev_hash: String) -> Result<Self> {
        let mut entry = Self {
            sequence_id,
            timestamp: event.timestamp,
            session_id: event.session_id,
            candidate_id: event.candidate_id,
            actor: event.actor,
            event_type: event.kind,
            payload: event.payload,
            metadata: event.metadata,
            prev_hash,
            hash: String::new(),
        };

        entry.hash = entry.calculate_hash()?;
        Ok(entry)
    }

    /// SHA-256 over the canonical form of the hashed fields
    pub fn calculate_hash(&self) -> Result<String> {
        if !self.timestamp.is_finite() {
            return Err(LedgerError::Serialization(format!(
                "timestamp {} of entry {} is not representable",
                self.timestamp, self.sequence_id
            )));
        }

        hash_canonical(&HashedFields {
            sequence_id: self.sequence_id,
            timestamp: self.timestamp,
            session_id: &self.session_id,
            candidate_id: &self.candidate_id,
            actor: &self.actor,
            event_type: self.event_type,
            payload: &self.payload,
            metadata: &self.metadata,
            prev_hash: &self.prev_hash,
        })
    }

    /// Whether the stored hash matches a recomputation from stored fields
    pub fn verify_hash(&self) -> bool {
        matches!(self.calculate_hash(), Ok(hash) if hash == self.hash)
    }

    /// Entry time as a UTC datetime, if representable
    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        let micros = (self.timestamp * 1_000_000.0).round();
        if !micros.is_finite() {
            return None;
        }
        let micros = micros as i64;
        let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
        Utc.timestamp_opt(micros.div_euclid(1_000_000), nanos).single()
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "#{} {} session={} actor={} hash={}",
            self.sequence_id,
            self.event_type,
            self.session_id,
            self.actor,
            &self.hash[..self.hash.len().min(12)]
        )
    }
}
