//! Append-only CSV ledger files, one per export.
//!
//! Layout: `{output_dir}/{file_name}` (default file name `{export_id}.csv`).
//!
//! Rules:
//! - The header is written once, when the file is created, and is the
//!   authoritative schema from then on. Fields a later record carries that
//!   are not in the header are dropped; missing fields render empty.
//! - Rows are only ever appended. Existing bytes are never rewritten,
//!   truncated or reordered.
//! - A handle is flushed and synced before the caller is told the append
//!   succeeded.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

use crate::domain::{ExportId, Record};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("failed to open ledger {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read header of ledger {path}: {source}")]
    Header {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("failed to append to ledger {path}: {source}")]
    Append {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("failed to flush ledger {path}: {source}")]
    Flush {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("ledger {path} has a blank header")]
    BlankHeader { path: PathBuf },

    #[error("ledger file name '{file_name}' is not a plain file name")]
    InvalidFileName { file_name: String },

    #[error("cannot create ledger for export '{export}' without fieldnames")]
    NoFieldnames { export: ExportId },
}

/// Opens ledger files under one output directory.
#[derive(Debug, Clone)]
pub struct LedgerWriter {
    output_dir: PathBuf,
}

impl LedgerWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Path of the ledger file for `file_name`. The name must be a single
    /// normal path component so the ledger stays inside the output directory.
    pub fn ledger_path(&self, file_name: &str) -> Result<PathBuf, LedgerError> {
        let mut components = Path::new(file_name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.output_dir.join(file_name)),
            _ => Err(LedgerError::InvalidFileName {
                file_name: file_name.to_string(),
            }),
        }
    }

    /// Open the ledger for `export_id`, creating it with `fieldnames` as its
    /// header if it does not exist yet (or is empty).
    ///
    /// For an existing file the on-disk header wins; a differing `fieldnames`
    /// is logged and otherwise ignored.
    pub fn open_or_create(
        &self,
        export_id: &ExportId,
        file_name: &str,
        fieldnames: &[String],
    ) -> Result<LedgerFile, LedgerError> {
        let path = self.ledger_path(file_name)?;
        let open_err = |source| LedgerError::Open {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.output_dir).map_err(open_err)?;

        let existing_len = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(open_err(e)),
        };

        let header = if existing_len > 0 {
            let on_disk = read_header(&path)?;
            // A header of blank names would project every row to empty cells.
            if on_disk.iter().all(|name| name.trim().is_empty()) {
                return Err(LedgerError::BlankHeader { path: path.clone() });
            }
            if !fieldnames.is_empty() && on_disk != fieldnames {
                tracing::warn!(
                    export = %export_id,
                    path = %path.display(),
                    on_disk = ?on_disk,
                    requested = ?fieldnames,
                    "ledger header differs from source fieldnames; keeping on-disk header"
                );
            }
            terminate_last_line(&path).map_err(open_err)?;
            on_disk
        } else {
            if fieldnames.is_empty() {
                return Err(LedgerError::NoFieldnames {
                    export: export_id.clone(),
                });
            }
            fieldnames.to_vec()
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(open_err)?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(file);

        if existing_len == 0 {
            writer
                .write_record(&header)
                .map_err(|source| LedgerError::Append {
                    path: path.clone(),
                    source,
                })?;
            tracing::debug!(export = %export_id, path = %path.display(), "created ledger");
        }

        Ok(LedgerFile {
            export_id: export_id.clone(),
            path,
            fieldnames: header,
            writer: Some(writer),
            rows_appended: 0,
        })
    }

    /// Open, append and close in one scope. The handle is released on every
    /// path, including when the append fails.
    pub fn write_batch(
        &self,
        export_id: &ExportId,
        file_name: &str,
        fieldnames: &[String],
        records: &[Record],
    ) -> Result<usize, LedgerError> {
        let mut ledger = self.open_or_create(export_id, file_name, fieldnames)?;
        ledger.append(records)?;
        let rows = ledger.rows_appended();
        ledger.close()?;
        Ok(rows)
    }
}

/// An open ledger. Dropping it flushes on a best-effort basis; call
/// [`LedgerFile::close`] to observe flush and sync errors.
#[derive(Debug)]
pub struct LedgerFile {
    export_id: ExportId,
    path: PathBuf,
    fieldnames: Vec<String>,
    writer: Option<csv::Writer<File>>,
    rows_appended: usize,
}

impl LedgerFile {
    pub fn export_id(&self) -> &ExportId {
        &self.export_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The authoritative header of this file.
    pub fn fieldnames(&self) -> &[String] {
        &self.fieldnames
    }

    pub fn rows_appended(&self) -> usize {
        self.rows_appended
    }

    /// Append one row per record, projected onto the header.
    pub fn append(&mut self, records: &[Record]) -> Result<(), LedgerError> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(LedgerError::Flush {
                path: self.path.clone(),
                source: io::Error::new(io::ErrorKind::Other, "ledger already closed"),
            });
        };

        for record in records {
            writer
                .write_record(record.to_row(&self.fieldnames))
                .map_err(|source| LedgerError::Append {
                    path: self.path.clone(),
                    source,
                })?;
            self.rows_appended += 1;
        }
        Ok(())
    }

    /// Flush buffered rows and sync the file to disk.
    pub fn close(mut self) -> Result<(), LedgerError> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        let flush_err = |source| LedgerError::Flush {
            path: self.path.clone(),
            source,
        };
        writer.flush().map_err(flush_err)?;
        writer.get_ref().sync_data().map_err(flush_err)?;
        Ok(())
    }
}

impl Drop for LedgerFile {
    fn drop(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                tracing::error!(path = %self.path.display(), error = %e, "failed to flush ledger on drop");
            }
        }
    }
}

/// Derive a header from records when a source supplies none: field names in
/// first-seen order.
pub fn fieldnames_from_records(records: &[Record]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for record in records {
        for name in record.field_names() {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    names
}

fn read_header(path: &Path) -> Result<Vec<String>, LedgerError> {
    let header_err = |source| LedgerError::Header {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(header_err)?;
    let headers = reader.headers().map_err(header_err)?;
    Ok(headers.iter().map(str::to_string).collect())
}

/// Make sure the file ends with a line terminator so the next row starts on
/// its own line.
fn terminate_last_line(path: &Path) -> io::Result<()> {
    let mut file = OpenOptions::new().read(true).append(true).open(path)?;
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    if last[0] != b'\n' {
        file.write_all(b"\n")?;
        file.flush()?;
    }
    Ok(())
}
