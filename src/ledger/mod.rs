//! Audit Ledger
//!
//! Append-only, globally hash-chained store of audit entries. One chain
//! spans every session; per-session queries, verification and attestation
//! are views over it.
//!
//! Appends take the write lock so sequence assignment, `prev_hash` capture
//! and the last-hash update happen as one step. Reads share the read lock
//! and see a consistent snapshot.

pub mod entry;
pub mod store;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::canonical::GENESIS_HASH;
use crate::config::{StoreBackend, StoreConfig};
use crate::error::{LedgerError, Result};
use crate::events::{AuditEvent, EventKind};

pub use entry::LedgerEntry;
pub use store::{load_entries, FileStore, LedgerStore, MemoryStore};

struct LedgerState {
    store: Box<dyn LedgerStore>,
    next_sequence: u64,
    last_hash: String,
}

/// Shared handle to the ledger. Clones refer to the same chain.
#[derive(Clone)]
pub struct Ledger {
    state: Arc<RwLock<LedgerState>>,
}

/// A single integrity violation found while walking the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainViolation {
    /// Stored hash disagrees with a recomputation from stored fields
    HashMismatch { sequence_id: u64 },
    /// `prev_hash` disagrees with the predecessor's stored hash
    BrokenLink {
        sequence_id: u64,
        expected_prev: String,
        found_prev: String,
    },
}

impl ChainViolation {
    pub fn sequence_id(&self) -> u64 {
        match self {
            ChainViolation::HashMismatch { sequence_id }
            | ChainViolation::BrokenLink { sequence_id, .. } => *sequence_id,
        }
    }
}

impl fmt::Display for ChainViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainViolation::HashMismatch { sequence_id } => {
                write!(f, "Hash mismatch at entry {}", sequence_id)
            }
            ChainViolation::BrokenLink {
                sequence_id,
                expected_prev,
                found_prev,
            } => write!(
                f,
                "Hash chain broken at entry {}: expected prev {}, got {}",
                sequence_id, expected_prev, found_prev
            ),
        }
    }
}

/// Session export for third-party review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttestationBundle {
    pub session_id: String,
    pub event_count: usize,
    pub first_event_timestamp: Option<f64>,
    pub last_event_timestamp: Option<f64>,
    pub genesis_hash: String,
    pub final_hash: String,
    pub events: Vec<LedgerEntry>,
}

/// Walk `entries` from genesis and list every hash or link violation
pub fn chain_violations(entries: &[LedgerEntry]) -> Vec<ChainViolation> {
    let mut violations = Vec::new();
    let mut expected_prev: &str = GENESIS_HASH;

    for entry in entries {
        if entry.prev_hash != expected_prev {
            violations.push(ChainViolation::BrokenLink {
                sequence_id: entry.sequence_id,
                expected_prev: expected_prev.to_string(),
                found_prev: entry.prev_hash.clone(),
            });
        }

        if !entry.verify_hash() {
            violations.push(ChainViolation::HashMismatch {
                sequence_id: entry.sequence_id,
            });
        }

        expected_prev = entry.hash.as_str();
    }

    violations
}

/// True when no entry in `entries` violates the chain
pub fn verify_entries(entries: &[LedgerEntry]) -> bool {
    let mut expected_prev: &str = GENESIS_HASH;

    for entry in entries {
        if entry.prev_hash != expected_prev || !entry.verify_hash() {
            return false;
        }
        expected_prev = entry.hash.as_str();
    }

    true
}

impl Ledger {
    /// In-memory ledger
    pub fn new() -> Self {
        Self::with_store(Box::new(MemoryStore::new()))
    }

    /// Ledger over an existing store, resuming after its last entry
    pub fn with_store(store: Box<dyn LedgerStore>) -> Self {
        let (next_sequence, last_hash) = match store.entries().last() {
            Some(last) => (last.sequence_id + 1, last.hash.clone()),
            None => (1, GENESIS_HASH.to_string()),
        };

        Self {
            state: Arc::new(RwLock::new(LedgerState {
                store,
                next_sequence,
                last_hash,
            })),
        }
    }

    /// Ledger persisted as JSON Lines at `path`
    pub fn open_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::with_store(Box::new(FileStore::open(path)?)))
    }

    /// Ledger backed by the configured store
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        match config.backend {
            StoreBackend::Memory => Ok(Self::new()),
            StoreBackend::File => {
                let path = config.path.as_ref().ok_or_else(|| {
                    LedgerError::Config("file store requires ledger.path".to_string())
                })?;
                Self::open_file(path)
            }
        }
    }

    /// Chain and store `event`.
    ///
    /// Does not check the payload schema; see [`Ledger::append_validated`].
    /// A serialization or storage failure leaves the ledger unchanged.
    pub async fn append(&self, event: AuditEvent) -> Result<LedgerEntry> {
        let mut state = self.state.write().await;

        let entry = LedgerEntry::seal(state.next_sequence, event, state.last_hash.clone())?;
        state.store.append(&entry)?;

        state.next_sequence += 1;
        state.last_hash = entry.hash.clone();

        debug!("Appended ledger entry: {}", entry.summary());
        Ok(entry)
    }

    /// Reject events missing required payload keys, then append
    pub async fn append_validated(&self, event: AuditEvent) -> Result<LedgerEntry> {
        if let Err(e) = event.validate() {
            warn!("Rejected {} event for session {}: {}", event.kind, event.session_id, e);
            return Err(e);
        }
        self.append(event).await
    }

    /// Copy of every entry in append order
    pub async fn snapshot(&self) -> Vec<LedgerEntry> {
        self.state.read().await.store.entries().to_vec()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.store.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.store.is_empty()
    }

    /// Hash the next entry will chain onto
    pub async fn last_hash(&self) -> String {
        self.state.read().await.last_hash.clone()
    }

    async fn filtered<F>(&self, predicate: F) -> Vec<LedgerEntry>
    where
        F: Fn(&LedgerEntry) -> bool,
    {
        let state = self.state.read().await;
        state
            .store
            .entries()
            .iter()
            .filter(|&entry| predicate(entry))
            .cloned()
            .collect()
    }

    pub async fn query_by_session(&self, session_id: &str) -> Vec<LedgerEntry> {
        self.filtered(|entry| entry.session_id == session_id).await
    }

    pub async fn query_by_candidate(&self, candidate_id: &str) -> Vec<LedgerEntry> {
        self.filtered(|entry| entry.candidate_id == candidate_id).await
    }

    pub async fn query_by_type(&self, kind: EventKind) -> Vec<LedgerEntry> {
        self.filtered(|entry| entry.event_type == kind).await
    }

    /// Entries with `start <= timestamp < end`, in append order
    pub async fn query_by_time_range(&self, start: f64, end: f64) -> Vec<LedgerEntry> {
        self.filtered(|entry| entry.timestamp >= start && entry.timestamp < end)
            .await
    }

    /// A session's entries grouped by event kind
    pub async fn events_by_session_grouped(
        &self,
        session_id: &str,
    ) -> BTreeMap<EventKind, Vec<LedgerEntry>> {
        let mut grouped: BTreeMap<EventKind, Vec<LedgerEntry>> = BTreeMap::new();
        for entry in self.query_by_session(session_id).await {
            grouped.entry(entry.event_type).or_default().push(entry);
        }
        grouped
    }

    /// Hash of the session's most recent entry
    pub async fn last_hash_for_session(&self, session_id: &str) -> Option<String> {
        let state = self.state.read().await;
        state
            .store
            .entries()
            .iter()
            .rev()
            .find(|entry| entry.session_id == session_id)
            .map(|entry| entry.hash.clone())
    }

    /// Whether every stored hash and link checks out. Never errors.
    pub async fn verify_chain(&self) -> bool {
        let state = self.state.read().await;
        verify_entries(state.store.entries())
    }

    /// Every violation in the chain, for diagnostics
    pub async fn chain_violations(&self) -> Vec<ChainViolation> {
        let state = self.state.read().await;
        chain_violations(state.store.entries())
    }

    /// Write all entries as JSON Lines in append order. The file is written
    /// from a snapshot, so appends are not held up by the dump.
    pub async fn export(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let entries = self.snapshot().await;

        let file = File::create(path).map_err(|e| {
            LedgerError::Storage(format!("Failed to create export {}: {}", path.display(), e))
        })?;
        let mut writer = BufWriter::new(file);

        for entry in &entries {
            let line = serde_json::to_string(entry)?;
            writeln!(writer, "{}", line)?;
        }
        writer.flush()?;

        info!("Exported {} ledger entries to {}", entries.len(), path.display());
        Ok(entries.len())
    }

    /// Session view of the chain with its first and last hashes
    pub async fn attestation(&self, session_id: &str) -> AttestationBundle {
        let events = self.query_by_session(session_id).await;

        AttestationBundle {
            session_id: session_id.to_string(),
            event_count: events.len(),
            first_event_timestamp: events.first().map(|e| e.timestamp),
            last_event_timestamp: events.last().map(|e| e.timestamp),
            genesis_hash: GENESIS_HASH.to_string(),
            final_hash: events
                .last()
                .map(|e| e.hash.clone())
                .unwrap_or_else(|| GENESIS_HASH.to_string()),
            events,
        }
    }

    /// Write the attestation bundle for one session as a JSON document
    pub async fn export_for_attestation(
        &self,
        session_id: &str,
        path: impl AsRef<Path>,
    ) -> Result<AttestationBundle> {
        let path = path.as_ref();
        let bundle = self.attestation(session_id).await;

        let json = serde_json::to_string_pretty(&bundle)?;
        std::fs::write(path, json).map_err(|e| {
            LedgerError::Storage(format!(
                "Failed to write attestation {}: {}",
                path.display(),
                e
            ))
        })?;

        info!(
            "Exported attestation for session {} ({} events) to {}",
            session_id,
            bundle.event_count,
            path.display()
        );
        Ok(bundle)
    }

    /// Flush the backing store
    pub async fn flush(&self) -> Result<()> {
        self.state.write().await.store.flush()
    }

    /// Edit stored entries in place, bypassing the chain. Tests only.
    #[cfg(test)]
    pub(crate) async fn tamper<F>(&self, f: F)
    where
        F: FnOnce(&mut Vec<LedgerEntry>),
    {
        let mut state = self.state.write().await;
        let entries = state
            .store
            .entries_mut()
            .expect("tamper requires a memory store");
        f(entries);
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}
