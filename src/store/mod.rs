//! Durable, crash-safe storage of maintenance requests.
//!
//! # File Layout
//!
//! ```text
//! <spool>/
//!   .lock             # process-wide advisory lock
//!   maintenance       # marker: present while in maintenance mode
//!   last_run.json     # stats of the last execute() pass
//!   requests/<id>/
//!     request.json    # the durable record
//!     script, ...     # auxiliary activity state
//!   archive/<id>/     # records of finished requests
//! ```
//!
//! # Crash Safety
//!
//! Records are written with the write-to-temp-then-rename pattern: write
//! `request.json.tmp`, fsync it, rename over `request.json`, fsync the
//! directory. Readers always see either the old or new record, never a
//! partial write. Corrupt records found during a scan are quarantined into
//! the archive with the parse error attached, never blocking the rest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::activity::RebootType;
use crate::request::Request;
use crate::types::{RequestId, State};

pub mod fsync;
pub mod lock;

pub use fsync::{fsync_dir, fsync_file};
pub use lock::SpoolLock;

const REQUEST_FILE: &str = "request.json";
const SUMMARY_FILE: &str = "last_run.json";
const MARKER_FILE: &str = "maintenance";
const LOAD_ERROR_FILE: &str = "_load_error";

/// Errors from the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request {0} has no backing directory")]
    NoDirectory(RequestId),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Per-request outcome in the last-run summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSummary {
    pub state: State,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

/// Stats of one `execute()` pass, stored as the companion summary file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub finished_at: DateTime<Utc>,

    /// Total pass runtime in seconds.
    pub runtime: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reboot: Option<RebootType>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<RequestId, RequestSummary>,
}

/// The spool: one durable record per request id, under an active root or
/// an archive root.
#[derive(Debug, Clone)]
pub struct RequestStore {
    spooldir: PathBuf,
}

impl RequestStore {
    /// Opens the store, creating the directory skeleton if necessary.
    pub fn open(spooldir: impl Into<PathBuf>) -> Result<Self> {
        let store = RequestStore {
            spooldir: spooldir.into(),
        };
        for dir in [
            store.spooldir.clone(),
            store.requests_dir(),
            store.archive_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(store)
    }

    pub fn spooldir(&self) -> &Path {
        &self.spooldir
    }

    pub fn requests_dir(&self) -> PathBuf {
        self.spooldir.join("requests")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.spooldir.join("archive")
    }

    /// Scratch/record directory for an active request.
    pub fn request_dir(&self, id: &RequestId) -> PathBuf {
        self.requests_dir().join(id.as_str())
    }

    /// Persists a request record atomically and reattaches its directory.
    pub fn save(&self, request: &mut Request) -> Result<()> {
        let dir = request
            .dir
            .clone()
            .unwrap_or_else(|| self.request_dir(&request.id));
        fs::create_dir_all(&dir)?;
        request.updated_at = Some(Utc::now());
        if request.added_at.is_none() {
            request.added_at = Some(Utc::now());
        }

        let bytes = serde_json::to_vec_pretty(&request)?;
        write_atomic(&dir.join(REQUEST_FILE), &bytes)?;
        request.activity.dump(&dir)?;
        request.dir = Some(dir);
        Ok(())
    }

    /// Loads one record from its directory.
    pub fn load(&self, dir: &Path) -> Result<Request> {
        let bytes = fs::read(dir.join(REQUEST_FILE))?;
        let mut request: Request = serde_json::from_slice(&bytes)?;
        request.dir = Some(dir.to_path_buf());
        request.activity.load(dir)?;
        Ok(request)
    }

    /// Loads all active records.
    ///
    /// Corrupt records are quarantined: the parse error is written next to
    /// the record and the whole directory is moved into the archive. A bad
    /// record never blocks the rest of the spool.
    pub fn scan(&self) -> Result<BTreeMap<RequestId, Request>> {
        let mut requests = BTreeMap::new();
        for entry in fs::read_dir(self.requests_dir())? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match self.load(&path) {
                Ok(request) => {
                    requests.insert(request.id.clone(), request);
                }
                Err(error) => {
                    tracing::error!(
                        record = %path.display(),
                        error = %error,
                        "scan-quarantining-defective-record"
                    );
                    self.quarantine(&path, &error)?;
                }
            }
        }
        Ok(requests)
    }

    /// Lock-free snapshot for status listings.
    ///
    /// Unlike [`RequestStore::scan`] this never mutates the spool: corrupt
    /// records are skipped with a warning instead of being quarantined,
    /// since the reader does not hold the process lock.
    pub fn peek(&self) -> Result<BTreeMap<RequestId, Request>> {
        let mut requests = BTreeMap::new();
        for entry in fs::read_dir(self.requests_dir())? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            match self.load(&path) {
                Ok(request) => {
                    requests.insert(request.id.clone(), request);
                }
                Err(error) => {
                    tracing::warn!(record = %path.display(), error = %error, "peek-skip-defective");
                }
            }
        }
        Ok(requests)
    }

    fn quarantine(&self, dir: &Path, error: &StoreError) -> Result<()> {
        if let Ok(mut file) = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(dir.join(LOAD_ERROR_FILE))
        {
            let _ = writeln!(file, "{error}");
        }
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let dest = self.archive_dir().join(name);
        fs::rename(dir, &dest)?;
        fsync_dir(&self.requests_dir())?;
        fsync_dir(&self.archive_dir())?;
        Ok(())
    }

    /// Atomically relocates a finished request's record to the archive.
    pub fn archive(&self, request: &mut Request) -> Result<()> {
        let dir = request
            .dir
            .clone()
            .ok_or_else(|| StoreError::NoDirectory(request.id.clone()))?;
        let dest = self.archive_dir().join(request.id.as_str());
        fs::rename(&dir, &dest)?;
        fsync_dir(&self.requests_dir())?;
        fsync_dir(&self.archive_dir())?;
        request.dir = Some(dest);
        self.save(request)
    }

    /// Creates the "currently in maintenance" marker.
    pub fn set_maintenance_marker(&self) -> Result<()> {
        let stamp = Utc::now().to_rfc3339();
        write_atomic(&self.spooldir.join(MARKER_FILE), stamp.as_bytes())
    }

    /// Removes the marker; missing is fine (leave is idempotent).
    pub fn clear_maintenance_marker(&self) -> Result<()> {
        match fs::remove_file(self.spooldir.join(MARKER_FILE)) {
            Ok(()) => {
                fsync_dir(&self.spooldir)?;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Timestamp of the marker, when present.
    pub fn maintenance_marker(&self) -> Option<DateTime<Utc>> {
        let raw = fs::read_to_string(self.spooldir.join(MARKER_FILE)).ok()?;
        DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Writes the last-run summary atomically.
    pub fn write_summary(&self, summary: &RunSummary) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(summary)?;
        write_atomic(&self.spooldir.join(SUMMARY_FILE), &bytes)
    }

    /// Reads the last-run summary, if one exists.
    pub fn read_summary(&self) -> Result<Option<RunSummary>> {
        match fs::read(self.spooldir.join(SUMMARY_FILE)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Acquires the process-wide lock for this spool.
    pub fn lock(&self) -> Result<SpoolLock> {
        Ok(SpoolLock::acquire(&self.spooldir)?)
    }
}

/// Write-to-temp-then-rename with fsync on file and directory.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(bytes)?;
        fsync_file(&file)?;
    }
    fs::rename(&tmp_path, path)?;
    if let Some(parent) = path.parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}
