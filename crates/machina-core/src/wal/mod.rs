//! Write-ahead log with framed checksummed records and segment lifecycle.
//!
//! The queue journals its state transitions here before acting on them, so a
//! crash can be replayed from the last checkpoint. Two on-disk formats:
//!
//! - **Framed** (default): `[len: u32 LE][json bytes][crc32 LE]`, CRC-32
//!   ISO-3309. A torn tail (short length, truncated payload, or CRC
//!   mismatch) stops replay cleanly; earlier records stay valid.
//! - **Plain**: newline-delimited JSON, the legacy alternate.
//!
//! Segments rotate on size or age; rotation renames the active file to
//! `<stem>.<epoch_ms>.jsonl` and fsyncs the parent directory so the rename
//! survives a crash. Retention deletes rotated segments oldest-first until
//! the count and total-byte caps hold. Rotation failure is non-fatal - the
//! writer stays on the current segment.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// The segment file could not be opened or written.
    #[error("wal I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Segment lifecycle policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalPolicy {
    /// Rotate when the active segment reaches this size.
    pub max_segment_bytes: u64,
    /// Rotate when the active segment reaches this age.
    #[serde(with = "humantime_serde")]
    pub max_segment_age: Duration,
    /// Keep at most this many segments (active included).
    pub max_segments: usize,
    /// Keep at most this many bytes across all segments.
    pub max_total_bytes: u64,
}

impl Default for WalPolicy {
    fn default() -> Self {
        Self {
            max_segment_bytes: 16 * 1024 * 1024,
            max_segment_age: Duration::from_secs(3600),
            max_segments: 10,
            max_total_bytes: 256 * 1024 * 1024,
        }
    }
}

#[derive(Debug)]
struct WalInner {
    file: Option<File>,
    segment_opened_at: std::time::Instant,
    current_size: u64,
}

/// Append-only WAL bound to one base path.
#[derive(Debug)]
pub struct Wal {
    path: PathBuf,
    framed: bool,
    fsync: bool,
    policy: WalPolicy,
    inner: Mutex<WalInner>,
}

impl Wal {
    /// Opens (creating parent directories and the file as needed) a WAL at
    /// `path` in framed format.
    ///
    /// # Errors
    ///
    /// Returns [`WalError::Io`] when the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalError> {
        Self::open_with(path, true, false, WalPolicy::default())
    }

    /// Opens a WAL with explicit framing, fsync, and policy settings.
    ///
    /// # Errors
    ///
    /// Returns [`WalError::Io`] when the file cannot be opened.
    pub fn open_with(
        path: impl AsRef<Path>,
        framed: bool,
        fsync: bool,
        policy: WalPolicy,
    ) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_size = file.metadata()?.len();
        Ok(Self {
            path,
            framed,
            fsync,
            policy,
            inner: Mutex::new(WalInner {
                file: Some(file),
                segment_opened_at: std::time::Instant::now(),
                current_size,
            }),
        })
    }

    /// The active segment path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current active-segment size in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.inner.lock().expect("wal lock").current_size
    }

    /// Appends one JSON record, rotating first when the policy requires it.
    ///
    /// # Errors
    ///
    /// Returns [`WalError::Io`] when the record cannot be written. A failed
    /// *rotation* is swallowed (the current segment keeps accepting writes);
    /// a failed *write* is the caller's problem.
    pub fn append(&self, json: &str) -> Result<(), WalError> {
        let mut inner = self.inner.lock().expect("wal lock");

        if self.needs_rotation(&inner) {
            if let Err(err) = self.rotate_locked(&mut inner) {
                tracing::warn!(error = %err, "wal rotation failed; staying on current segment");
            }
        }

        let file = match inner.file.as_mut() {
            Some(f) => f,
            None => {
                // A previous rotation lost the handle; reopen in place.
                let f = OpenOptions::new().create(true).append(true).open(&self.path)?;
                inner.current_size = f.metadata()?.len();
                inner.file = Some(f);
                inner.file.as_mut().expect("just set")
            }
        };

        let written = if self.framed {
            let bytes = json.as_bytes();
            let len = u32::try_from(bytes.len()).map_err(|_| {
                WalError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "wal record exceeds u32 length",
                ))
            })?;
            let crc = crc32fast::hash(bytes);
            file.write_all(&len.to_le_bytes())?;
            file.write_all(bytes)?;
            file.write_all(&crc.to_le_bytes())?;
            8 + bytes.len() as u64
        } else {
            file.write_all(json.as_bytes())?;
            file.write_all(b"\n")?;
            json.len() as u64 + 1
        };

        if self.fsync {
            file.sync_data()?;
        }
        inner.current_size += written;
        Ok(())
    }

    /// Truncates the active segment to empty.
    ///
    /// # Errors
    ///
    /// Returns [`WalError::Io`] on truncation failure.
    pub fn truncate(&self) -> Result<(), WalError> {
        let mut inner = self.inner.lock().expect("wal lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        drop(file);
        inner.file = Some(OpenOptions::new().create(true).append(true).open(&self.path)?);
        inner.current_size = 0;
        inner.segment_opened_at = std::time::Instant::now();
        Ok(())
    }

    /// Forces rotation of the active segment.
    ///
    /// # Errors
    ///
    /// Returns [`WalError::Io`] when the rename or reopen fails.
    pub fn rotate_now(&self) -> Result<(), WalError> {
        let mut inner = self.inner.lock().expect("wal lock");
        self.rotate_locked(&mut inner)
    }

    fn needs_rotation(&self, inner: &WalInner) -> bool {
        if self.policy.max_segment_bytes > 0 && inner.current_size >= self.policy.max_segment_bytes
        {
            return true;
        }
        !self.policy.max_segment_age.is_zero()
            && inner.segment_opened_at.elapsed() >= self.policy.max_segment_age
    }

    fn rotate_locked(&self, inner: &mut WalInner) -> Result<(), WalError> {
        inner.file = None;

        let rotated = self.rotated_name(crate::types::now_ms());
        std::fs::rename(&self.path, &rotated)?;

        // fsync the parent so the rename is durable.
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        inner.file = Some(file);
        inner.current_size = 0;
        inner.segment_opened_at = std::time::Instant::now();
        Ok(())
    }

    fn rotated_name(&self, epoch_ms: i64) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "wal".to_string());
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        parent.join(format!("{stem}.{epoch_ms}.jsonl"))
    }

    /// Lists rotated segments (not the active file), oldest first.
    #[must_use]
    pub fn list_rotated(&self) -> Vec<PathBuf> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let active = self.path.file_name().map(|s| s.to_string_lossy().into_owned());

        let mut out = Vec::new();
        let Ok(entries) = std::fs::read_dir(parent) else {
            return out;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if Some(&name) == active.as_ref() {
                continue;
            }
            if name.starts_with(&format!("{stem}.")) && name.ends_with(".jsonl") {
                out.push(entry.path());
            }
        }
        // Timestamp in the name sorts chronologically.
        out.sort();
        out
    }

    /// Enforces retention over rotated segments, deleting oldest-first until
    /// the segment count (active included) and total-byte caps hold. Returns
    /// the number of segments deleted.
    pub fn enforce_retention(&self) -> usize {
        let current_size = self.size_bytes();
        let mut rotated: Vec<(PathBuf, u64)> = self
            .list_rotated()
            .into_iter()
            .map(|p| {
                let size = std::fs::metadata(&p).map(|m| m.len()).unwrap_or(0);
                (p, size)
            })
            .collect();

        let mut deleted = 0;
        while self.policy.max_segments > 0
            && rotated.len() + 1 > self.policy.max_segments
            && !rotated.is_empty()
        {
            let (path, _) = rotated.remove(0);
            if std::fs::remove_file(&path).is_ok() {
                deleted += 1;
            }
        }

        if self.policy.max_total_bytes > 0 {
            let mut total = current_size + rotated.iter().map(|(_, s)| s).sum::<u64>();
            while total > self.policy.max_total_bytes && !rotated.is_empty() {
                let (path, size) = rotated.remove(0);
                total -= size;
                if std::fs::remove_file(&path).is_ok() {
                    deleted += 1;
                }
            }
        }
        deleted
    }
}

/// Reads records from a framed WAL segment, stopping cleanly at a torn tail.
///
/// A record whose length prefix overruns the file end, whose payload is
/// truncated, or whose CRC mismatches ends the replay; records before it are
/// returned.
///
/// # Errors
///
/// Returns [`WalError::Io`] only when the file itself cannot be read.
pub fn read_framed(path: impl AsRef<Path>) -> Result<Vec<String>, WalError> {
    let mut data = Vec::new();
    File::open(path.as_ref())?.read_to_end(&mut data)?;

    let mut records = Vec::new();
    let mut off = 0usize;
    while off + 8 <= data.len() {
        let len = u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
            as usize;
        let payload_start = off + 4;
        let crc_start = payload_start + len;
        if crc_start + 4 > data.len() {
            break; // torn tail: length overruns file end
        }
        let payload = &data[payload_start..crc_start];
        let stored_crc = u32::from_le_bytes([
            data[crc_start],
            data[crc_start + 1],
            data[crc_start + 2],
            data[crc_start + 3],
        ]);
        if crc32fast::hash(payload) != stored_crc {
            break; // torn tail: corrupt record
        }
        match std::str::from_utf8(payload) {
            Ok(s) => records.push(s.to_string()),
            Err(_) => break,
        }
        off = crc_start + 4;
    }
    Ok(records)
}

/// Reads records from a plain newline-delimited segment.
///
/// # Errors
///
/// Returns [`WalError::Io`] when the file cannot be read.
pub fn read_plain(path: impl AsRef<Path>) -> Result<Vec<String>, WalError> {
    let text = std::fs::read_to_string(path.as_ref())?;
    Ok(text.lines().filter(|l| !l.is_empty()).map(String::from).collect())
}
