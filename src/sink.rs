//! Status files read by other processes.
//!
//! Two representations are kept in lockstep: a plain token (`"55%"` or
//! `"N/A"`) for shell scripts and a JSON record for richer consumers.
//! Writes only happen when the token changes.

use crate::error::SinkError;
use crate::smoothing::{DisplayedValue, StatusRecord};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Mode of the published files.
#[cfg(unix)]
const STATUS_FILE_MODE: u32 = 0o644;

/// What a publish call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The persisted token already matched
    Unchanged,
    Written,
    /// A write failed; it will be retried on the next publish
    Failed,
}

/// Destination for the displayed value.
pub trait StatusSink {
    /// Persist `value` if it differs from what is stored. Never fails loudly.
    fn publish(&mut self, value: DisplayedValue) -> PublishOutcome;

    /// Last persisted percentage, if the stored record marks it present.
    fn load_seed(&self) -> Option<u8>;
}

/// Sink writing the plain and JSON status files.
#[derive(Debug)]
pub struct FileStatusSink {
    text_path: PathBuf,
    json_path: PathBuf,
    writes: u64,
}

impl FileStatusSink {
    pub fn new(text_path: impl Into<PathBuf>, json_path: impl Into<PathBuf>) -> Self {
        Self {
            text_path: text_path.into(),
            json_path: json_path.into(),
            writes: 0,
        }
    }

    pub fn text_path(&self) -> &Path {
        &self.text_path
    }

    pub fn json_path(&self) -> &Path {
        &self.json_path
    }

    /// Number of publishes that actually touched the filesystem.
    pub fn writes(&self) -> u64 {
        self.writes
    }

    fn persisted_token(&self) -> Option<String> {
        fs::read_to_string(&self.text_path)
            .ok()
            .map(|contents| contents.trim().to_string())
    }

    fn write_both(&self, value: DisplayedValue) -> Result<(), SinkError> {
        let json = serde_json::to_string(&StatusRecord::from(value))?;
        // JSON first: the token doubles as the "both written" marker.
        write_atomic(&self.json_path, json.as_bytes())?;
        write_atomic(&self.text_path, value.token().as_bytes())?;
        Ok(())
    }
}

impl StatusSink for FileStatusSink {
    fn publish(&mut self, value: DisplayedValue) -> PublishOutcome {
        let token = value.token();
        if self.persisted_token().as_deref() == Some(token.as_str()) {
            return PublishOutcome::Unchanged;
        }

        match self.write_both(value) {
            Ok(()) => {
                self.writes += 1;
                debug!("Published battery status {}", token);
                PublishOutcome::Written
            }
            Err(e) => {
                warn!("Failed to publish battery status {}: {}", token, e);
                PublishOutcome::Failed
            }
        }
    }

    fn load_seed(&self) -> Option<u8> {
        let contents = fs::read_to_string(&self.json_path).ok()?;
        match serde_json::from_str::<StatusRecord>(&contents) {
            Ok(record) if record.is_present && record.percentage <= 100 => Some(record.percentage),
            Ok(_) => None,
            Err(e) => {
                debug!("Ignoring unreadable status record {:?}: {}", self.json_path, e);
                None
            }
        }
    }
}

/// Replace `path` with `contents` via a fresh temp file and rename.
///
/// The temp file gets a random name and is created exclusively, so nothing
/// planted next to the target is ever opened. The rename replaces a symlink
/// at `path` itself rather than writing through it.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), SinkError> {
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let write_err = |e| SinkError::WriteFailed {
        path: path.display().to_string(),
        source: e,
    };

    let mut temp = tempfile::Builder::new()
        .prefix(".fuhlen-status")
        .tempfile_in(dir)
        .map_err(write_err)?;
    // Other users' status bars read these files.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(fs::Permissions::from_mode(STATUS_FILE_MODE))
            .map_err(write_err)?;
    }
    temp.write_all(contents).map_err(write_err)?;

    temp.persist(path).map_err(|e| SinkError::RenameFailed {
        path: path.display().to_string(),
        source: e.error,
    })?;
    Ok(())
}
