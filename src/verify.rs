//! Session Verification
//!
//! Stateless recomputation over the ledger's current contents. Sessions are
//! views over the single global chain, so every link is checked against the
//! entry that precedes it globally, not the session's previous entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::canonical::GENESIS_HASH;
use crate::error::Result;
use crate::ledger::{Ledger, LedgerEntry};
use crate::merkle::MerkleTree;

/// Why an entry failed verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    HashMismatch,
    BrokenLink,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidEntry {
    pub sequence_id: u64,
    pub timestamp: f64,
    pub hash: String,
    pub prev_hash: String,
    pub reason: InvalidReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub session_id: String,
    pub is_valid: bool,
    /// Every session entry links to its global predecessor
    pub chain_valid: bool,
    pub checked_at: DateTime<Utc>,
    pub event_count: usize,
    pub first_event_timestamp: Option<f64>,
    pub last_event_timestamp: Option<f64>,
    pub invalid_entries: Vec<InvalidEntry>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

/// A single finding from [`Verifier::detect_tampering`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TamperIssue {
    /// Sequence ids inside the session's span that are absent from the ledger
    SequenceGap { missing: Vec<u64> },
    HashMismatch { sequence_id: u64 },
    BrokenLink {
        sequence_id: u64,
        expected_prev: String,
        found_prev: String,
    },
    /// First entry of the whole ledger does not start from genesis
    GenesisMismatch { sequence_id: u64, found_prev: String },
}

impl TamperIssue {
    /// Entry the issue is attached to, if any
    pub fn sequence_id(&self) -> Option<u64> {
        match self {
            TamperIssue::SequenceGap { .. } => None,
            TamperIssue::HashMismatch { sequence_id }
            | TamperIssue::BrokenLink { sequence_id, .. }
            | TamperIssue::GenesisMismatch { sequence_id, .. } => Some(*sequence_id),
        }
    }
}

impl fmt::Display for TamperIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TamperIssue::SequenceGap { missing } => write!(f, "Missing sequence ids: {:?}", missing),
            TamperIssue::HashMismatch { sequence_id } => {
                write!(f, "Hash mismatch at entry {}", sequence_id)
            }
            TamperIssue::BrokenLink { sequence_id, .. } => {
                write!(f, "Broken chain at entry {}", sequence_id)
            }
            TamperIssue::GenesisMismatch { sequence_id, .. } => {
                write!(f, "First entry {} does not chain from genesis", sequence_id)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TamperReport {
    pub session_id: String,
    pub tampered: bool,
    pub issues: Vec<TamperIssue>,
}

impl TamperReport {
    /// Sequence ids named by any issue, ascending
    pub fn tampered_sequence_ids(&self) -> Vec<u64> {
        self.issues
            .iter()
            .filter_map(TamperIssue::sequence_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Compliance summary for one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainIntegrityReport {
    pub session_id: String,
    pub genesis_hash: String,
    pub final_hash: String,
    pub event_count: usize,
    pub chain_intact: bool,
    /// Merkle root over the session's entries
    pub merkle_root: String,
    pub generated_at: DateTime<Utc>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub total_verifications: usize,
    pub passed: usize,
    pub failed: usize,
    pub sessions_checked: usize,
}

/// Positions in `entries` that belong to `session_id`
fn session_positions<'a>(
    entries: &'a [LedgerEntry],
    session_id: &'a str,
) -> impl Iterator<Item = usize> + 'a {
    entries
        .iter()
        .enumerate()
        .filter(move |(_, entry)| entry.session_id == session_id)
        .map(|(index, _)| index)
}

fn expected_prev(entries: &[LedgerEntry], position: usize) -> &str {
    match position {
        0 => GENESIS_HASH,
        _ => entries[position - 1].hash.as_str(),
    }
}

/// Runs verification against a ledger and keeps a history of results
pub struct Verifier {
    ledger: Ledger,
    history: RwLock<Vec<VerificationResult>>,
}

impl Verifier {
    pub fn new(ledger: Ledger) -> Self {
        Self {
            ledger,
            history: RwLock::new(Vec::new()),
        }
    }

    /// Recompute hashes and links for one session's entries
    pub async fn verify_session(&self, session_id: &str) -> VerificationResult {
        let entries = self.ledger.snapshot().await;
        let result = Self::check_session(&entries, session_id);

        if result.is_valid {
            debug!("Session {} verified ({} entries)", session_id, result.event_count);
        } else {
            error!(
                "Session {} failed verification: {} invalid entries",
                session_id,
                result.invalid_entries.len()
            );
        }

        self.history.write().await.push(result.clone());
        result
    }

    fn check_session(entries: &[LedgerEntry], session_id: &str) -> VerificationResult {
        let positions: Vec<usize> = session_positions(entries, session_id).collect();
        let mut result = VerificationResult {
            session_id: session_id.to_string(),
            is_valid: true,
            chain_valid: true,
            checked_at: Utc::now(),
            event_count: positions.len(),
            first_event_timestamp: positions.first().map(|&i| entries[i].timestamp),
            last_event_timestamp: positions.last().map(|&i| entries[i].timestamp),
            invalid_entries: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
        };

        if positions.is_empty() {
            result.warnings.push("No events found for session".to_string());
            return result;
        }

        for position in positions {
            let entry = &entries[position];
            let mut flag = |reason: InvalidReason, message: String| {
                result.invalid_entries.push(InvalidEntry {
                    sequence_id: entry.sequence_id,
                    timestamp: entry.timestamp,
                    hash: entry.hash.clone(),
                    prev_hash: entry.prev_hash.clone(),
                    reason,
                });
                result.errors.push(message);
            };

            if !entry.verify_hash() {
                flag(
                    InvalidReason::HashMismatch,
                    format!("Invalid hash at entry {}", entry.sequence_id),
                );
            }

            if entry.prev_hash != expected_prev(entries, position) {
                flag(
                    InvalidReason::BrokenLink,
                    format!("Broken chain at entry {}", entry.sequence_id),
                );
                result.chain_valid = false;
            }
        }

        result.is_valid = result.chain_valid && result.invalid_entries.is_empty();
        result
    }

    /// Verify every session present in the ledger, in session id order
    pub async fn verify_all_sessions(&self) -> Vec<VerificationResult> {
        let entries = self.ledger.snapshot().await;
        let sessions: BTreeSet<&str> = entries.iter().map(|e| e.session_id.as_str()).collect();

        let results: Vec<VerificationResult> = sessions
            .into_iter()
            .map(|session_id| Self::check_session(&entries, session_id))
            .collect();

        info!(
            "Verified {} sessions, {} failed",
            results.len(),
            results.iter().filter(|r| !r.is_valid).count()
        );
        self.history.write().await.extend(results.iter().cloned());
        results
    }

    /// Look for hash mismatches, missing entries and broken links
    pub async fn detect_tampering(&self, session_id: &str) -> TamperReport {
        let entries = self.ledger.snapshot().await;
        let positions: Vec<usize> = session_positions(&entries, session_id).collect();
        let mut issues = Vec::new();

        let ids: Vec<u64> = positions.iter().map(|&i| entries[i].sequence_id).collect();
        if let (Some(&min), Some(&max)) = (ids.iter().min(), ids.iter().max()) {
            let present: HashSet<u64> = entries.iter().map(|e| e.sequence_id).collect();
            let missing: Vec<u64> = (min..=max).filter(|id| !present.contains(id)).collect();
            if !missing.is_empty() {
                issues.push(TamperIssue::SequenceGap { missing });
            }
        }

        for &position in &positions {
            let entry = &entries[position];
            if !entry.verify_hash() {
                issues.push(TamperIssue::HashMismatch {
                    sequence_id: entry.sequence_id,
                });
            }
        }

        for &position in &positions {
            let entry = &entries[position];
            let expected = expected_prev(&entries, position);
            if entry.prev_hash == expected {
                continue;
            }

            issues.push(if position == 0 {
                TamperIssue::GenesisMismatch {
                    sequence_id: entry.sequence_id,
                    found_prev: entry.prev_hash.clone(),
                }
            } else {
                TamperIssue::BrokenLink {
                    sequence_id: entry.sequence_id,
                    expected_prev: expected.to_string(),
                    found_prev: entry.prev_hash.clone(),
                }
            });
        }

        for issue in &issues {
            error!("Tampering in session {}: {}", session_id, issue);
        }

        TamperReport {
            session_id: session_id.to_string(),
            tampered: !issues.is_empty(),
            issues,
        }
    }

    /// Genesis and final hashes, count and intact flag for one session
    pub async fn generate_integrity_report(&self, session_id: &str) -> Result<ChainIntegrityReport> {
        let entries = self.ledger.snapshot().await;
        let result = Self::check_session(&entries, session_id);
        let session: Vec<LedgerEntry> = session_positions(&entries, session_id)
            .map(|i| entries[i].clone())
            .collect();

        let mut warnings = result.warnings;
        if !result.is_valid {
            warnings.push("Chain integrity compromised".to_string());
        }

        Ok(ChainIntegrityReport {
            session_id: session_id.to_string(),
            genesis_hash: GENESIS_HASH.to_string(),
            final_hash: session
                .last()
                .map(|e| e.hash.clone())
                .unwrap_or_else(|| GENESIS_HASH.to_string()),
            event_count: session.len(),
            chain_intact: result.is_valid,
            merkle_root: MerkleTree::build_from_entries(&session)?.root_hash(),
            generated_at: Utc::now(),
            warnings,
        })
    }

    /// Results of every verification run so far
    pub async fn history(&self) -> Vec<VerificationResult> {
        self.history.read().await.clone()
    }

    pub async fn summary(&self) -> VerificationSummary {
        let history = self.history.read().await;
        let passed = history.iter().filter(|r| r.is_valid).count();
        let sessions: HashSet<&str> = history.iter().map(|r| r.session_id.as_str()).collect();

        VerificationSummary {
            total_verifications: history.len(),
            passed,
            failed: history.len() - passed,
            sessions_checked: sessions.len(),
        }
    }
}
