//! Ledger Storage
//!
//! The ledger writes through an append-only store. Stores never expose a
//! way to edit or remove an entry once appended.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{LedgerError, Result};
use crate::ledger::entry::LedgerEntry;

/// Append-only backing storage for ledger entries.
///
/// Implementations are used under the ledger's write lock, so `append` is
/// never called concurrently.
pub trait LedgerStore: Send + Sync {
    /// Persist one entry after every entry already stored.
    fn append(&mut self, entry: &LedgerEntry) -> Result<()>;

    /// All entries in append order.
    fn entries(&self) -> &[LedgerEntry];

    fn len(&self) -> usize {
        self.entries().len()
    }

    fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Flush anything buffered.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Raw mutable access, for tamper simulations in tests only.
    #[cfg(test)]
    fn entries_mut(&mut self) -> Option<&mut Vec<LedgerEntry>> {
        None
    }
}

/// Entries held in memory only
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Vec<LedgerEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with entries loaded elsewhere.
    pub fn from_entries(entries: Vec<LedgerEntry>) -> Self {
        Self { entries }
    }
}

impl LedgerStore for MemoryStore {
    fn append(&mut self, entry: &LedgerEntry) -> Result<()> {
        self.entries.push(entry.clone());
        Ok(())
    }

    fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    #[cfg(test)]
    fn entries_mut(&mut self) -> Option<&mut Vec<LedgerEntry>> {
        Some(&mut self.entries)
    }
}

/// JSON Lines file, one entry per line, with an in-memory mirror for reads
pub struct FileStore {
    path: PathBuf,
    file: File,
    entries: Vec<LedgerEntry>,
}

impl FileStore {
    /// Open (or create) a ledger file and load any existing entries.
    ///
    /// Existing lines are loaded as-is; whether they still verify is a
    /// question for the verifier, not a reason to refuse the file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    LedgerError::Storage(format!("Failed to create ledger directory: {}", e))
                })?;
            }
        }

        let entries = if path.exists() {
            load_entries(&path)?
        } else {
            Vec::new()
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| LedgerError::Storage(format!("Failed to open ledger file: {}", e)))?;

        info!("Opened ledger file {} with {} entries", path.display(), entries.len());

        Ok(Self {
            path,
            file,
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LedgerStore for FileStore {
    fn append(&mut self, entry: &LedgerEntry) -> Result<()> {
        let json = serde_json::to_string(entry)?;

        writeln!(self.file, "{}", json)
            .map_err(|e| LedgerError::Storage(format!("Failed to write ledger entry: {}", e)))?;
        self.file
            .flush()
            .map_err(|e| LedgerError::Storage(format!("Failed to flush ledger file: {}", e)))?;

        self.entries.push(entry.clone());
        debug!("Persisted entry {} to {}", entry.sequence_id, self.path.display());
        Ok(())
    }

    fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    fn flush(&mut self) -> Result<()> {
        self.file
            .flush()
            .map_err(|e| LedgerError::Storage(format!("Failed to flush ledger file: {}", e)))
    }
}

/// Read a JSON Lines ledger export, skipping blank lines
pub fn load_entries(path: impl AsRef<Path>) -> Result<Vec<LedgerEntry>> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|e| LedgerError::Storage(format!("Failed to open {}: {}", path.display(), e)))?;

    let reader = BufReader::new(file);
    let mut entries = Vec::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| {
            LedgerError::Storage(format!("Failed to read line {}: {}", line_num + 1, e))
        })?;

        if line.trim().is_empty() {
            continue;
        }

        let entry: LedgerEntry = serde_json::from_str(&line).map_err(|e| {
            LedgerError::Serialization(format!(
                "Failed to parse entry at line {}: {}",
                line_num + 1,
                e
            ))
        })?;

        entries.push(entry);
    }

    debug!("Loaded {} entries from {}", entries.len(), path.display());
    Ok(entries)
}
