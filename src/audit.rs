/*!
 * Append-only JSON Lines audit trail
 *
 * One record per line: timestamp, event type, message, and a flattened
 * snapshot of the intervention the event concerns (if any).
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

use crate::intervention::InterventionSnapshot;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit log I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to encode audit record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid audit entry at line {line}: {message}")]
    InvalidEntry { line: usize, message: String },
}

/// One line of the audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub ts: DateTime<Utc>,

    /// Event type, e.g. `intervention-requested` or `system-paused`
    pub event: String,

    pub title: String,

    pub message: String,

    #[serde(flatten)]
    pub intervention: Option<InterventionSnapshot>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, serde_json::Value>,
}

/// Append-only audit writer
///
/// # Thread Safety
/// The writer uses internal locking and is cheap to clone; clones share the
/// same file handle.
#[derive(Debug, Clone)]
pub struct AuditWriter {
    path: PathBuf,
    writer: Arc<Mutex<BufWriter<File>>>,
}

impl AuditWriter {
    /// Open or create the audit file in append mode
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| AuditError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;

        Ok(Self {
            path,
            writer: Arc::new(Mutex::new(BufWriter::new(file))),
        })
    }

    /// Append one record and flush it
    pub fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let json = serde_json::to_string(record)?;

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{}", json)
            .and_then(|_| writer.flush())
            .map_err(|source| AuditError::Io {
                path: self.path.clone(),
                source,
            })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse an audit trail back into records
pub fn read_audit_log<P: AsRef<Path>>(path: P) -> Result<Vec<AuditRecord>, AuditError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| AuditError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut records = Vec::new();
    for (line_num, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(line).map_err(|e| AuditError::InvalidEntry {
            line: line_num + 1,
            message: e.to_string(),
        })?;
        records.push(record);
    }

    Ok(records)
}
