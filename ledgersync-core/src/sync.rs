//! Sync orchestrator: drives every configured source against the cursor store
//! and routes what they return into ledger files.
//!
//! Each source walks `Pending → Running → {Committed, Skipped, Failed}`.
//! Sources run one at a time in configuration order. Within a source every
//! export is appended first and only then has its cursor advanced, so a crash
//! between the two steps costs a re-fetch, never lost rows. The cursor store
//! is persisted once, after every source reached a terminal state.

use chrono::NaiveDate;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::{ConfigError, SourceKind};
use crate::cursor::{CursorError, CursorStore};
use crate::data::{newer_than, ConfiguredSource, ExportBatch, SourceError, SyncRequest};
use crate::domain::ExportId;
use crate::ledger::{fieldnames_from_records, LedgerError, LedgerWriter};

/// Errors that stop a run before (or after) any source is processed.
///
/// Per-source failures never surface here; they land in the [`RunSummary`].
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cursor(#[from] CursorError),
}

/// Why one export of an otherwise successful source was not committed.
#[derive(Debug, Error)]
pub enum ExportFailure {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("export '{0}' was already produced earlier in this run")]
    DuplicateExport(ExportId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Pending,
    Running,
    /// Sync succeeded and every export was written.
    Committed,
    /// Every known export is already current for the processing date.
    Skipped,
    /// The source failed, or at least one of its exports could not be written.
    Failed,
}

impl SourceState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SourceState::Committed | SourceState::Skipped | SourceState::Failed
        )
    }
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            SourceState::Pending => "pending",
            SourceState::Running => "running",
            SourceState::Committed => "committed",
            SourceState::Skipped => "skipped",
            SourceState::Failed => "failed",
        })
    }
}

/// Result of one export within a source.
#[derive(Debug)]
pub struct ExportOutcome {
    pub export_id: ExportId,
    pub rows_appended: usize,
    /// Cursor after this export was processed.
    pub cursor: Option<NaiveDate>,
    pub error: Option<ExportFailure>,
}

impl ExportOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Terminal record of one source.
#[derive(Debug)]
pub struct SourceOutcome {
    pub name: String,
    pub kind: SourceKind,
    pub state: SourceState,
    pub exports: Vec<ExportOutcome>,
    /// Set when the source as a whole failed.
    pub error: Option<SourceError>,
}

impl SourceOutcome {
    fn pending(source: &ConfiguredSource) -> Self {
        Self {
            name: source.name.clone(),
            kind: source.kind,
            state: SourceState::Pending,
            exports: Vec::new(),
            error: None,
        }
    }

    pub fn rows_appended(&self) -> usize {
        self.exports.iter().map(|e| e.rows_appended).sum()
    }
}

/// Outcome of a whole run, one entry per source in processing order.
#[derive(Debug)]
pub struct RunSummary {
    pub today: NaiveDate,
    pub sources: Vec<SourceOutcome>,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        self.sources.iter().any(|s| s.state == SourceState::Failed)
    }

    pub fn count(&self, state: SourceState) -> usize {
        self.sources.iter().filter(|s| s.state == state).count()
    }

    pub fn rows_appended(&self) -> usize {
        self.sources.iter().map(SourceOutcome::rows_appended).sum()
    }

    pub fn source(&self, name: &str) -> Option<&SourceOutcome> {
        self.sources.iter().find(|s| s.name == name)
    }
}

/// Progress callback for a sync run.
pub trait SyncProgress: Send {
    /// Called when a source moves to `Running`.
    fn on_source_start(&self, name: &str, index: usize, total: usize);

    /// Called once a source reached its terminal state.
    fn on_source_complete(&self, outcome: &SourceOutcome, index: usize, total: usize);

    /// Called after the cursor store was persisted.
    fn on_run_complete(&self, summary: &RunSummary);
}

/// Progress reporter that reports nothing.
pub struct NoProgress;

impl SyncProgress for NoProgress {
    fn on_source_start(&self, _name: &str, _index: usize, _total: usize) {}
    fn on_source_complete(&self, _outcome: &SourceOutcome, _index: usize, _total: usize) {}
    fn on_run_complete(&self, _summary: &RunSummary) {}
}

/// Owns the cursor store for the duration of a run.
pub struct SyncOrchestrator {
    cursors: CursorStore,
    cursor_path: PathBuf,
}

impl SyncOrchestrator {
    /// Load the cursor store from `cursor_path`. A corrupt file is fatal.
    pub fn open(cursor_path: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let cursor_path = cursor_path.into();
        let cursors = CursorStore::load(&cursor_path)?;
        tracing::debug!(path = %cursor_path.display(), exports = cursors.len(), "loaded cursors");
        Ok(Self::new(cursors, cursor_path))
    }

    pub fn new(cursors: CursorStore, cursor_path: impl Into<PathBuf>) -> Self {
        Self {
            cursors,
            cursor_path: cursor_path.into(),
        }
    }

    pub fn cursors(&self) -> &CursorStore {
        &self.cursors
    }

    pub fn cursor_path(&self) -> &Path {
        &self.cursor_path
    }

    /// Process every source in order, then persist the cursor store once.
    ///
    /// Returns `Err` only when the cursor store cannot be saved; source and
    /// ledger failures are reported in the summary.
    pub fn run(
        &mut self,
        sources: &mut [ConfiguredSource],
        today: NaiveDate,
        progress: &dyn SyncProgress,
    ) -> Result<RunSummary, SyncError> {
        let total = sources.len();
        let mut produced: HashSet<ExportId> = HashSet::new();
        let mut outcomes = Vec::with_capacity(total);

        for (i, source) in sources.iter_mut().enumerate() {
            let mut outcome = SourceOutcome::pending(source);
            outcome.state = SourceState::Running;
            progress.on_source_start(&source.name, i, total);
            tracing::info!(source = %source.name, kind = %source.kind, "syncing source");

            self.run_source(source, today, &mut produced, &mut outcome);

            match outcome.state {
                SourceState::Committed => tracing::info!(
                    source = %outcome.name,
                    exports = outcome.exports.len(),
                    rows = outcome.rows_appended(),
                    "source committed"
                ),
                SourceState::Skipped => {
                    tracing::info!(source = %outcome.name, "source already current; skipped")
                }
                _ => {}
            }
            debug_assert!(outcome.state.is_terminal());
            progress.on_source_complete(&outcome, i, total);
            outcomes.push(outcome);
        }

        self.cursors.save(&self.cursor_path)?;
        tracing::debug!(path = %self.cursor_path.display(), "saved cursors");

        let summary = RunSummary {
            today,
            sources: outcomes,
        };
        progress.on_run_complete(&summary);
        Ok(summary)
    }

    fn run_source(
        &mut self,
        source: &mut ConfiguredSource,
        today: NaiveDate,
        produced: &mut HashSet<ExportId>,
        outcome: &mut SourceOutcome,
    ) {
        if self.is_current(source, today) {
            outcome.state = SourceState::Skipped;
            return;
        }

        let batches = match source.source.sync(&SyncRequest::new(&self.cursors, today)) {
            Ok(batches) => batches,
            Err(e) => {
                tracing::error!(source = %source.name, error = %e, "source failed; cursors and ledgers left untouched");
                outcome.state = SourceState::Failed;
                outcome.error = Some(e);
                return;
            }
        };

        let writer = LedgerWriter::new(&source.output_dir);
        for batch in batches {
            let export = self.commit_batch(&writer, batch, produced);
            if let Some(e) = &export.error {
                tracing::error!(source = %source.name, export = %export.export_id, error = %e, "export not committed");
            }
            outcome.exports.push(export);
        }

        outcome.state = if outcome.exports.iter().all(ExportOutcome::is_ok) {
            SourceState::Committed
        } else {
            SourceState::Failed
        };
    }

    /// Skip rule: the source lists its exports up front and each one's
    /// cursor is already at or after the processing date.
    fn is_current(&self, source: &ConfiguredSource, today: NaiveDate) -> bool {
        let exports = source.source.exports();
        !exports.is_empty()
            && exports
                .iter()
                .all(|id| self.cursors.get(id.as_str()).is_some_and(|c| c >= today))
    }

    /// Truncate, append and advance one export.
    fn commit_batch(
        &mut self,
        writer: &LedgerWriter,
        batch: ExportBatch,
        produced: &mut HashSet<ExportId>,
    ) -> ExportOutcome {
        let ExportBatch {
            export_id,
            file_name,
            fieldnames,
            records,
            new_cursor,
        } = batch;
        let current = self.cursors.get(export_id.as_str());

        if !produced.insert(export_id.clone()) {
            return ExportOutcome {
                error: Some(ExportFailure::DuplicateExport(export_id.clone())),
                export_id,
                rows_appended: 0,
                cursor: current,
            };
        }

        // Checked even for empty batches so a bad name never advances a cursor.
        if let Err(e) = writer.ledger_path(&file_name) {
            return ExportOutcome {
                export_id,
                rows_appended: 0,
                cursor: current,
                error: Some(e.into()),
            };
        }

        let received = records.len();
        let records = newer_than(records, current);
        if records.len() < received {
            tracing::debug!(
                export = %export_id,
                dropped = received - records.len(),
                "dropped records at or before the cursor"
            );
        }
        let latest_kept = records.iter().map(|r| r.date).max();
        let target = new_cursor.max(latest_kept);

        let rows_appended = if records.is_empty() {
            0
        } else {
            let fieldnames = if fieldnames.is_empty() {
                fieldnames_from_records(&records)
            } else {
                fieldnames
            };
            match writer.write_batch(&export_id, &file_name, &fieldnames, &records) {
                Ok(rows) => rows,
                Err(e) => {
                    return ExportOutcome {
                        export_id,
                        rows_appended: 0,
                        cursor: current,
                        error: Some(e.into()),
                    }
                }
            }
        };

        if let Some(date) = target {
            self.cursors.advance(&export_id, date);
        }
        tracing::debug!(export = %export_id, rows = rows_appended, cursor = ?self.cursors.get(export_id.as_str()), "export committed");

        ExportOutcome {
            cursor: self.cursors.get(export_id.as_str()),
            export_id,
            rows_appended,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataSource;
    use crate::domain::Record;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    struct ScriptedSource {
        name: String,
        exports: Vec<ExportId>,
        calls: Arc<AtomicUsize>,
        script: Box<dyn FnMut(&SyncRequest<'_>) -> Result<Vec<ExportBatch>, SourceError> + Send>,
    }

    impl DataSource for ScriptedSource {
        fn name(&self) -> &str {
            &self.name
        }

        fn exports(&self) -> Vec<ExportId> {
            self.exports.clone()
        }

        fn sync(&mut self, request: &SyncRequest<'_>) -> Result<Vec<ExportBatch>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.script)(request)
        }
    }

    fn configured(
        name: &str,
        output_dir: &Path,
        exports: &[&str],
        script: impl FnMut(&SyncRequest<'_>) -> Result<Vec<ExportBatch>, SourceError> + Send + 'static,
    ) -> (ConfiguredSource, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = ScriptedSource {
            name: name.to_string(),
            exports: exports.iter().map(|e| ExportId::new(*e)).collect(),
            calls: Arc::clone(&calls),
            script: Box::new(script),
        };
        (
            ConfiguredSource {
                name: name.to_string(),
                kind: SourceKind::LedgerLinker,
                output_dir: output_dir.to_path_buf(),
                source: Box::new(source),
            },
            calls,
        )
    }

    fn txn(date: NaiveDate, memo: &str) -> Record {
        Record::new(date).with("date", date).with("memo", memo)
    }

    fn batch(export: &str, records: Vec<Record>) -> ExportBatch {
        ExportBatch::new(export)
            .with_fieldnames(["date", "memo"])
            .with_records(records)
    }

    #[test]
    fn failing_source_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path();
        let (first, _) = configured(
            "first",
            out,
            &[],
            |_| Ok(vec![batch("a", vec![txn(d(2024, 1, 1), "one")])]),
        );
        let (second, _) = configured(
            "second",
            out,
            &[],
            |_| Err(SourceError::AuthenticationRequired("expired".into())),
        );
        let (third, _) = configured(
            "third",
            out,
            &[],
            |_| Ok(vec![batch("c", vec![txn(d(2024, 1, 2), "three")])]),
        );
        let mut sources = vec![first, second, third];

        let mut orch = SyncOrchestrator::new(CursorStore::new(), out.join(".last_links.json"));
        let summary = orch.run(&mut sources, d(2024, 2, 1), &NoProgress).unwrap();

        let states: Vec<SourceState> = summary.sources.iter().map(|s| s.state).collect();
        assert_eq!(
            states,
            vec![SourceState::Committed, SourceState::Failed, SourceState::Committed]
        );
        assert!(summary.has_failures());
        assert_eq!(orch.cursors().get("a"), Some(d(2024, 1, 1)));
        assert_eq!(orch.cursors().get("c"), Some(d(2024, 1, 2)));
        assert!(out.join("a.csv").exists());
        assert!(out.join("c.csv").exists());
    }

    #[test]
    fn current_source_is_skipped_without_a_call() {
        let dir = tempfile::tempdir().unwrap();
        let mut cursors = CursorStore::new();
        cursors.advance(&ExportId::new("notes"), d(2024, 3, 10));

        let (source, calls) = configured(
            "notes",
            dir.path(),
            &["notes"],
            |_| panic!("current source must not be synced"),
        );
        let mut sources = vec![source];

        let mut orch = SyncOrchestrator::new(cursors, dir.path().join(".last_links.json"));
        let summary = orch.run(&mut sources, d(2024, 3, 10), &NoProgress).unwrap();

        assert_eq!(summary.sources[0].state, SourceState::Skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!summary.has_failures());
    }

    #[test]
    fn source_with_a_stale_export_is_not_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut cursors = CursorStore::new();
        cursors.advance(&ExportId::new("a"), d(2024, 3, 10));
        cursors.advance(&ExportId::new("b"), d(2024, 3, 1));

        let (source, calls) = configured("pair", dir.path(), &["a", "b"], |_| Ok(Vec::new()));
        let mut sources = vec![source];

        let mut orch = SyncOrchestrator::new(cursors, dir.path().join(".last_links.json"));
        let summary = orch.run(&mut sources, d(2024, 3, 10), &NoProgress).unwrap();

        assert_eq!(summary.sources[0].state, SourceState::Committed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn over_returned_records_are_truncated_at_the_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let mut cursors = CursorStore::new();
        cursors.advance(&ExportId::new("a"), d(2024, 1, 3));

        // Ignores the cursor and returns everything it has.
        let (source, _) = configured(
            "sloppy",
            dir.path(),
            &[],
            |_| {
                Ok(vec![batch(
                    "a",
                    vec![txn(d(2024, 1, 1), "old"), txn(d(2024, 1, 3), "seen"), txn(d(2024, 1, 4), "new")],
                )])
            },
        );
        let mut sources = vec![source];

        let mut orch = SyncOrchestrator::new(cursors, dir.path().join(".last_links.json"));
        let summary = orch.run(&mut sources, d(2024, 2, 1), &NoProgress).unwrap();

        assert_eq!(summary.rows_appended(), 1);
        let content = fs::read_to_string(dir.path().join("a.csv")).unwrap();
        assert_eq!(content, "date,memo\n2024-01-04,new\n");
        assert_eq!(orch.cursors().get("a"), Some(d(2024, 1, 4)));
    }

    #[test]
    fn write_failure_fails_only_that_export() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the ledger file should be makes the open fail.
        fs::create_dir(dir.path().join("broken.csv")).unwrap();

        let (source, _) = configured(
            "bank",
            dir.path(),
            &[],
            |_| {
                Ok(vec![
                    batch("broken", vec![txn(d(2024, 1, 1), "lost")]),
                    batch("fine", vec![txn(d(2024, 1, 2), "kept")]),
                ])
            },
        );
        let mut sources = vec![source];

        let mut orch = SyncOrchestrator::new(CursorStore::new(), dir.path().join(".last_links.json"));
        let summary = orch.run(&mut sources, d(2024, 2, 1), &NoProgress).unwrap();

        let outcome = &summary.sources[0];
        assert_eq!(outcome.state, SourceState::Failed);
        assert!(matches!(outcome.exports[0].error, Some(ExportFailure::Ledger(_))));
        assert!(outcome.exports[1].is_ok());
        assert_eq!(orch.cursors().get("broken"), None);
        assert_eq!(orch.cursors().get("fine"), Some(d(2024, 1, 2)));
    }

    #[test]
    fn export_escaping_the_output_dir_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let (source, _) = configured(
            "aggregator",
            &out,
            &[],
            |_| {
                Ok(vec![
                    batch("../escaped", vec![txn(d(2024, 1, 1), "outside")]),
                    batch("inside", vec![txn(d(2024, 1, 2), "kept")]),
                ])
            },
        );
        let mut sources = vec![source];

        let mut orch = SyncOrchestrator::new(CursorStore::new(), dir.path().join(".last_links.json"));
        let summary = orch.run(&mut sources, d(2024, 2, 1), &NoProgress).unwrap();

        let outcome = &summary.sources[0];
        assert_eq!(outcome.state, SourceState::Failed);
        assert!(matches!(
            outcome.exports[0].error,
            Some(ExportFailure::Ledger(LedgerError::InvalidFileName { .. }))
        ));
        assert!(!dir.path().join("escaped.csv").exists());
        assert_eq!(orch.cursors().get("../escaped"), None);
        assert_eq!(orch.cursors().get("inside"), Some(d(2024, 1, 2)));
        assert!(out.join("inside.csv").exists());
    }

    #[test]
    fn empty_batch_advances_cursor_without_creating_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let (source, _) = configured(
            "bank",
            dir.path(),
            &[],
            |_| Ok(vec![ExportBatch::new("quiet").with_new_cursor(Some(d(2024, 1, 9)))]),
        );
        let mut sources = vec![source];

        let mut orch = SyncOrchestrator::new(CursorStore::new(), dir.path().join(".last_links.json"));
        orch.run(&mut sources, d(2024, 2, 1), &NoProgress).unwrap();

        assert_eq!(orch.cursors().get("quiet"), Some(d(2024, 1, 9)));
        assert!(!dir.path().join("quiet.csv").exists());
    }

    #[test]
    fn duplicate_export_across_sources_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (first, _) = configured(
            "first",
            dir.path(),
            &[],
            |_| Ok(vec![batch("shared", vec![txn(d(2024, 1, 1), "first")])]),
        );
        let (second, _) = configured(
            "second",
            dir.path(),
            &[],
            |_| Ok(vec![batch("shared", vec![txn(d(2024, 1, 5), "second")])]),
        );
        let mut sources = vec![first, second];

        let mut orch = SyncOrchestrator::new(CursorStore::new(), dir.path().join(".last_links.json"));
        let summary = orch.run(&mut sources, d(2024, 2, 1), &NoProgress).unwrap();

        assert_eq!(summary.sources[1].state, SourceState::Failed);
        assert!(matches!(
            summary.sources[1].exports[0].error,
            Some(ExportFailure::DuplicateExport(_))
        ));
        assert_eq!(orch.cursors().get("shared"), Some(d(2024, 1, 1)));
    }

    #[test]
    fn cursors_are_persisted_after_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let cursor_path = dir.path().join(".last_links.json");
        let (source, _) = configured(
            "bank",
            dir.path(),
            &[],
            |_| Ok(vec![batch("a", vec![txn(d(2024, 1, 3), "x")])]),
        );
        let mut sources = vec![source];

        let mut orch = SyncOrchestrator::open(&cursor_path).unwrap();
        orch.run(&mut sources, d(2024, 2, 1), &NoProgress).unwrap();

        let reloaded = CursorStore::load(&cursor_path).unwrap();
        assert_eq!(reloaded.get("a"), Some(d(2024, 1, 3)));
    }

    #[test]
    fn corrupt_cursor_file_stops_the_run_before_any_source() {
        let dir = tempfile::tempdir().unwrap();
        let cursor_path = dir.path().join(".last_links.json");
        fs::write(&cursor_path, "{\"a\": \"2024-13-01\"}").unwrap();

        assert!(matches!(
            SyncOrchestrator::open(&cursor_path),
            Err(SyncError::Cursor(CursorError::Corrupt { .. }))
        ));
    }
}
