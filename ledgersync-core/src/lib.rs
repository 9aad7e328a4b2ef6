//! Ledgersync core: incremental sync of financial records into append-only CSV ledgers.
//!
//! This crate contains the sync engine:
//! - Domain types (records, field values, export ids)
//! - Cursor store with monotonic advances and atomic persistence
//! - Append-only ledger writer with a fixed on-disk header
//! - Data source trait plus the Prosper, ADP, LedgerLinker and Google Sheets sources
//! - Configuration model and source factory
//! - Orchestrator with per-source failure isolation

pub mod config;
pub mod cursor;
pub mod data;
pub mod domain;
pub mod ledger;
pub mod sync;

pub use config::{ConfigError, SourceConfig, SourceKind, SourceOptions, SyncConfig};
pub use cursor::{AdvanceOutcome, CursorError, CursorStore};
pub use data::{ConfiguredSource, DataSource, ExportBatch, SourceError, SyncRequest};
pub use domain::{ExportId, FieldValue, Record};
pub use ledger::{LedgerError, LedgerFile, LedgerWriter};
pub use sync::{
    ExportFailure, ExportOutcome, NoProgress, RunSummary, SourceOutcome, SourceState, SyncError,
    SyncOrchestrator, SyncProgress,
};
