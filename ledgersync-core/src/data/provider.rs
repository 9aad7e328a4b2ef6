//! Data source trait and structured error types.
//!
//! The DataSource trait abstracts over upstream systems (marketplace APIs,
//! payroll portals, hosted aggregators, spreadsheets) so the orchestrator can
//! drive every variant the same way and tests can script fake sources.

use chrono::{Days, NaiveDate};
use thiserror::Error;

use crate::cursor::CursorStore;
use crate::domain::{ExportId, Record};

/// Structured error types for a source that could not complete its sync.
///
/// Any of these aborts the whole source: nothing it fetched is written and
/// none of its cursors move.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by upstream (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("hard stop: upstream is refusing requests (circuit breaker open)")]
    CircuitOpen,

    #[error("http client error: {0}")]
    Client(String),
}

/// The records a source retrieved for one export.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportBatch {
    pub export_id: ExportId,
    /// Ledger file name inside the source's output directory.
    pub file_name: String,
    /// Header to use if the ledger file does not exist yet. Empty means
    /// "derive from the records".
    pub fieldnames: Vec<String>,
    /// Records strictly newer than the export's cursor, sorted by date.
    pub records: Vec<Record>,
    /// Latest date reached, or `None` if nothing new was seen.
    pub new_cursor: Option<NaiveDate>,
}

impl ExportBatch {
    pub fn new(export_id: impl Into<ExportId>) -> Self {
        let export_id = export_id.into();
        Self {
            file_name: export_id.default_file_name(),
            export_id,
            fieldnames: Vec::new(),
            records: Vec::new(),
            new_cursor: None,
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    pub fn with_fieldnames<S: Into<String>>(mut self, fieldnames: impl IntoIterator<Item = S>) -> Self {
        self.fieldnames = fieldnames.into_iter().map(Into::into).collect();
        self
    }

    /// Set the records; the new cursor becomes their latest date.
    pub fn with_records(mut self, records: Vec<Record>) -> Self {
        self.new_cursor = records.iter().map(|r| r.date).max();
        self.records = records;
        self
    }

    pub fn with_new_cursor(mut self, new_cursor: Option<NaiveDate>) -> Self {
        self.new_cursor = new_cursor;
        self
    }

    /// True when the source found nothing newer than the cursor.
    pub fn is_up_to_date(&self) -> bool {
        self.records.is_empty()
    }
}

/// What a source gets to see when asked to sync.
#[derive(Debug, Clone, Copy)]
pub struct SyncRequest<'a> {
    cursors: &'a CursorStore,
    today: NaiveDate,
}

impl<'a> SyncRequest<'a> {
    pub fn new(cursors: &'a CursorStore, today: NaiveDate) -> Self {
        Self { cursors, today }
    }

    /// Last-synced date for an export.
    pub fn cursor(&self, export_id: &str) -> Option<NaiveDate> {
        self.cursors.get(export_id)
    }

    /// First date to request for an export: the day after its cursor.
    pub fn start_date(&self, export_id: &str) -> Option<NaiveDate> {
        self.cursor(export_id)
            .and_then(|c| c.checked_add_days(Days::new(1)))
    }

    /// Processing date.
    pub fn today(&self) -> NaiveDate {
        self.today
    }

    /// No new data can exist yet: the next date to request is after today.
    pub fn is_current(&self, export_id: &str) -> bool {
        self.start_date(export_id)
            .is_some_and(|start| start > self.today)
    }
}

/// Keep only records strictly newer than `cursor`.
pub fn newer_than(records: Vec<Record>, cursor: Option<NaiveDate>) -> Vec<Record> {
    match cursor {
        None => records,
        Some(c) => records.into_iter().filter(|r| r.date > c).collect(),
    }
}

/// Trait for data sources (Prosper, ADP, LedgerLinker, Google Sheets).
///
/// Implementations handle the specifics of talking to one upstream system.
/// Ledger files and cursors sit above this trait; sources never write either.
pub trait DataSource: Send {
    /// Configured name of this source.
    fn name(&self) -> &str;

    /// Export ids this source is known to produce before talking to upstream.
    ///
    /// Sources that discover their exports remotely return an empty list.
    fn exports(&self) -> Vec<ExportId> {
        Vec::new()
    }

    /// Retrieve records newer than each export's cursor.
    ///
    /// `Ok` carries one batch per export (an empty batch means "already up to
    /// date"). `Err` means the source failed as a whole.
    fn sync(&mut self, request: &SyncRequest<'_>) -> Result<Vec<ExportBatch>, SourceError>;
}
