//! Cursor store: last-synced date per export.
//!
//! Layout: a single JSON object mapping export id to an ISO-8601 date,
//! e.g. `{"checking": "2024-01-03"}`, stored at `{output_dir}/.last_links.json`.
//!
//! The file is loaded once at startup, mutated in memory during a run and
//! written once at the end. Writes are atomic: the full mapping goes to
//! `{path}.tmp`, is fsynced, then renamed over the destination. A truncated
//! cursor file would read as "never synced" and trigger a full re-import, so
//! the destination is never written in place.

use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::domain::ExportId;

/// Default cursor file name inside the output directory.
pub const CURSOR_FILE_NAME: &str = ".last_links.json";

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("cursor file {path} is corrupt: {reason} (fix or delete it and re-run)")]
    Corrupt { path: PathBuf, reason: String },

    #[error("cursor file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What `advance` did with the proposed date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// Cursor moved forward (or was set for the first time).
    Advanced,
    /// Proposed date equals the current cursor.
    Unchanged,
    /// Proposed date is before the current cursor; cursor kept.
    Rejected { current: NaiveDate },
}

/// In-memory mapping of export id → last-synced date.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CursorStore {
    cursors: BTreeMap<ExportId, NaiveDate>,
}

impl CursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the cursor file at `path`. A missing file is an empty store; any
    /// other failure is fatal.
    pub fn load(path: &Path) -> Result<Self, CursorError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => {
                return Err(CursorError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Self::from_json(&content).map_err(|reason| CursorError::Corrupt {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Parse the persisted document.
    pub fn from_json(content: &str) -> Result<Self, String> {
        let raw: BTreeMap<String, String> =
            serde_json::from_str(content).map_err(|e| format!("invalid JSON: {e}"))?;

        let mut cursors = BTreeMap::new();
        for (export_id, value) in raw {
            let date = NaiveDate::parse_from_str(&value, "%Y-%m-%d")
                .map_err(|e| format!("export '{export_id}' has invalid date '{value}': {e}"))?;
            // Only the zero-padded form saves back byte for byte.
            if date.format("%Y-%m-%d").to_string() != value {
                return Err(format!("export '{export_id}' has non-ISO date '{value}'"));
            }
            cursors.insert(ExportId(export_id), date);
        }
        Ok(Self { cursors })
    }

    /// Serialize the full mapping. Keys are sorted; output ends with a newline.
    pub fn to_json(&self) -> String {
        let raw: BTreeMap<&str, String> = self
            .cursors
            .iter()
            .map(|(k, v)| (k.as_str(), v.format("%Y-%m-%d").to_string()))
            .collect();
        // BTreeMap<&str, String> cannot fail to serialize.
        let mut json = serde_json::to_string_pretty(&raw).unwrap_or_else(|_| "{}".into());
        json.push('\n');
        json
    }

    pub fn get(&self, export_id: &str) -> Option<NaiveDate> {
        self.cursors.get(export_id).copied()
    }

    /// Move the cursor for `export_id` to `new_date` if it is later than the
    /// current value (or no value exists). Backward moves are rejected and
    /// logged; they are never fatal.
    pub fn advance(&mut self, export_id: &ExportId, new_date: NaiveDate) -> AdvanceOutcome {
        match self.cursors.get(export_id).copied() {
            Some(current) if new_date < current => {
                tracing::warn!(
                    export = %export_id,
                    current = %current,
                    proposed = %new_date,
                    "rejecting backward cursor move"
                );
                AdvanceOutcome::Rejected { current }
            }
            Some(current) if new_date == current => AdvanceOutcome::Unchanged,
            _ => {
                self.cursors.insert(export_id.clone(), new_date);
                AdvanceOutcome::Advanced
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ExportId, &NaiveDate)> {
        self.cursors.iter()
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    /// Atomically persist the mapping to `path`.
    pub fn save(&self, path: &Path) -> Result<(), CursorError> {
        self.stage(path)?.commit()
    }

    /// First half of `save`: write and fsync `{path}.tmp`. The destination is
    /// untouched until [`StagedSave::commit`].
    pub fn stage(&self, path: &Path) -> Result<StagedSave, CursorError> {
        let io_err = |source| CursorError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let tmp_path = tmp_path_for(path);
        let staged = StagedSave {
            tmp_path,
            dest: path.to_path_buf(),
            committed: false,
        };

        let mut file = fs::File::create(&staged.tmp_path).map_err(io_err)?;
        file.write_all(self.to_json().as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        Ok(staged)
    }
}

/// A fully written temporary cursor file awaiting its rename.
///
/// Dropping it without committing removes the temporary file.
#[derive(Debug)]
pub struct StagedSave {
    tmp_path: PathBuf,
    dest: PathBuf,
    committed: bool,
}

impl StagedSave {
    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    /// Rename the temporary file over the destination.
    pub fn commit(mut self) -> Result<(), CursorError> {
        fs::rename(&self.tmp_path, &self.dest).map_err(|e| CursorError::Io {
            path: self.dest.clone(),
            source: e,
        })?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagedSave {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| CURSOR_FILE_NAME.into());
    name.push(".tmp");
    path.with_file_name(name)
}
