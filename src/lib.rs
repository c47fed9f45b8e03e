pub mod aggregation;
pub mod anchoring;
pub mod canonical;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod merkle;
pub mod verify;

pub use aggregation::{AggregationPeriod, AggregationResult, AggregationScheduler, PeriodicAggregation};
pub use anchoring::{Anchorer, TimestampAnchor, TimestampAuthority, TimestampToken};
pub use canonical::GENESIS_HASH;
pub use config::LedgerConfig;
pub use error::{LedgerError, Result};
pub use events::{create_event, AuditEvent, EventKind};
pub use ledger::{Ledger, LedgerEntry};
pub use merkle::{MerkleProof, MerkleTree};
pub use verify::Verifier;
