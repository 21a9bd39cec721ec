//! Tamper-evident journal: hash-chained JSONL event log.
//!
//! Every structural event of a run is appended as one canonical JSON line.
//! Records chain through SHA-256:
//!
//! ```text
//! chain_hash[i] = sha256_hex(chain_prev[i] || canonical(record[i] minus chain fields))
//! chain_prev[0] = "000...0" (64 zeros)
//! chain_prev[i] = chain_hash[i-1]
//! ```
//!
//! Editing any historical record changes its canonical bytes and therefore
//! breaks every subsequent `chain_hash`; [`verify_chain`] walks a log and
//! reports the first break.
//!
//! # Example
//!
//! ```rust,no_run
//! use machina_core::journal::Journal;
//! use machina_core::types::RunHeader;
//!
//! # fn example() -> Result<(), machina_core::journal::JournalError> {
//! let mut journal = Journal::create(&RunHeader::new(), "logs/run_1.jsonl")?;
//! journal.event(0, "menu_built", r#"{"menu_digest":"abc"}"#)?;
//! # Ok(())
//! # }
//! ```

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::canonical::{canonical_string, canonicalize_json_lossy};
use crate::hash::sha256_hex;
use crate::types::RunHeader;

/// `chain_prev` of the first record.
pub const GENESIS_CHAIN: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Errors from journal operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JournalError {
    /// The log file could not be created or written.
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A line in the log is not a JSON object.
    #[error("malformed journal line {line}: {reason}")]
    Malformed {
        /// 0-based line number.
        line: usize,
        /// Why the line was rejected.
        reason: String,
    },
}

/// Append-only hash-chained journal writer for one run.
#[derive(Debug)]
pub struct Journal {
    header: RunHeader,
    path: PathBuf,
    out: File,
    chain_prev: String,
}

impl Journal {
    /// Creates (truncating) the log file and its parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Io`] when the file cannot be created.
    pub fn create(header: &RunHeader, path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let out = File::create(&path)?;
        Ok(Self {
            header: header.clone(),
            path,
            out,
            chain_prev: GENESIS_CHAIN.to_string(),
        })
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one event record.
    ///
    /// The payload is canonicalized (or journaled as an opaque string when it
    /// does not parse), the record canonicalized, chained, and flushed.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Io`] when the line cannot be written. Journal
    /// write failure is fatal for the run: an unjournaled step must not
    /// execute.
    pub fn event(&mut self, step: u32, name: &str, payload_json: &str) -> Result<(), JournalError> {
        let payload: Value = serde_json::from_str(&canonicalize_json_lossy(payload_json))
            .unwrap_or_else(|_| Value::String(payload_json.to_string()));

        let mut record = Map::new();
        record.insert("event".to_string(), json!(name));
        record.insert("payload".to_string(), payload);
        record.insert("profile_id".to_string(), json!(self.header.profile_id));
        if !self.header.request_id.is_empty() {
            record.insert("request_id".to_string(), json!(self.header.request_id));
        }
        record.insert("run_id".to_string(), json!(self.header.run_id));
        record.insert("spec_version".to_string(), json!(self.header.spec_version));
        record.insert("step".to_string(), json!(step));
        record.insert(
            "ts".to_string(),
            json!(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),
        );

        let canonical_record = canonical_string(&Value::Object(record.clone()));
        let chain_hash = sha256_hex(format!("{}{}", self.chain_prev, canonical_record).as_bytes());

        record.insert("chain_hash".to_string(), json!(chain_hash));
        record.insert("chain_prev".to_string(), json!(self.chain_prev));
        let line = canonical_string(&Value::Object(record));

        self.out.write_all(line.as_bytes())?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;

        self.chain_prev = chain_hash;
        Ok(())
    }
}

/// Result of verifying one journal file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    /// Total records examined.
    pub records: usize,
    /// Index of the first record whose recomputed hash mismatches, if any.
    /// Every record at or after this index is tainted.
    pub first_break: Option<usize>,
}

impl ChainReport {
    /// True when every record chains correctly.
    #[must_use]
    pub const fn is_intact(&self) -> bool {
        self.first_break.is_none()
    }
}

/// Recomputes the hash chain of a journal file.
///
/// Each line is parsed, its chain fields removed, the remainder
/// re-canonicalized, and the hash recomputed against the running
/// `chain_prev`. The first mismatch (of either `chain_prev` linkage or
/// `chain_hash` content) is reported; later records cannot be trusted and
/// are not individually classified.
///
/// # Errors
///
/// - [`JournalError::Io`] when the file cannot be read
/// - [`JournalError::Malformed`] when a line is not a JSON object or lacks
///   the chain fields
pub fn verify_chain(path: impl AsRef<Path>) -> Result<ChainReport, JournalError> {
    let file = File::open(path.as_ref())?;
    let reader = BufReader::new(file);

    let mut expected_prev = GENESIS_CHAIN.to_string();
    let mut records = 0usize;
    let mut first_break = None;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let value: Value =
            serde_json::from_str(&line).map_err(|e| JournalError::Malformed {
                line: line_no,
                reason: e.to_string(),
            })?;
        let mut obj = match value {
            Value::Object(obj) => obj,
            _ => {
                return Err(JournalError::Malformed {
                    line: line_no,
                    reason: "not a JSON object".to_string(),
                })
            }
        };

        let chain_hash = take_string(&mut obj, "chain_hash", line_no)?;
        let chain_prev = take_string(&mut obj, "chain_prev", line_no)?;

        records += 1;
        if first_break.is_some() {
            continue;
        }

        let canonical_record = canonical_string(&Value::Object(obj));
        let recomputed = sha256_hex(format!("{chain_prev}{canonical_record}").as_bytes());
        if chain_prev != expected_prev || recomputed != chain_hash {
            first_break = Some(records - 1);
            continue;
        }
        expected_prev = chain_hash;
    }

    Ok(ChainReport {
        records,
        first_break,
    })
}

fn take_string(
    obj: &mut Map<String, Value>,
    key: &str,
    line: usize,
) -> Result<String, JournalError> {
    match obj.remove(key) {
        Some(Value::String(s)) => Ok(s),
        _ => Err(JournalError::Malformed {
            line,
            reason: format!("missing {key}"),
        }),
    }
}
