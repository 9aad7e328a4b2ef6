//! Shared in-memory source for the scenario tests.

#![allow(dead_code)]

use chrono::NaiveDate;
use std::path::Path;
use std::sync::{Arc, Mutex};

use ledgersync_core::data::newer_than;
use ledgersync_core::{
    ConfiguredSource, DataSource, ExportBatch, ExportId, Record, SourceError, SourceKind,
    SyncRequest,
};

pub fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

pub fn txn(date: NaiveDate, payee: &str, amount: f64) -> Record {
    Record::new(date)
        .with("date", date)
        .with("payee", payee)
        .with("amount", amount)
}

/// What the fake upstream holds; tests mutate it between runs.
#[derive(Default)]
pub struct Upstream {
    pub records: Vec<Record>,
    pub fail_with: Option<String>,
    /// Return everything regardless of the cursor.
    pub ignore_cursor: bool,
}

pub type SharedUpstream = Arc<Mutex<Upstream>>;

/// A single-export source backed by an [`Upstream`].
pub struct FakeSource {
    name: String,
    export_id: ExportId,
    upstream: SharedUpstream,
}

impl DataSource for FakeSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn exports(&self) -> Vec<ExportId> {
        vec![self.export_id.clone()]
    }

    fn sync(&mut self, request: &SyncRequest<'_>) -> Result<Vec<ExportBatch>, SourceError> {
        let upstream = self.upstream.lock().unwrap();
        if let Some(reason) = &upstream.fail_with {
            return Err(SourceError::NetworkUnreachable(reason.clone()));
        }
        let mut records = upstream.records.clone();
        ledgersync_core::domain::sort_by_date(&mut records);
        let cursor = request.cursor(self.export_id.as_str());
        let records = if upstream.ignore_cursor {
            records
        } else {
            newer_than(records, cursor)
        };
        Ok(vec![ExportBatch::new(self.export_id.clone())
            .with_fieldnames(["date", "payee", "amount"])
            .with_records(records)])
    }
}

pub fn fake_source(name: &str, output_dir: &Path) -> (ConfiguredSource, SharedUpstream) {
    let upstream = SharedUpstream::default();
    let source = FakeSource {
        name: name.to_string(),
        export_id: ExportId::new(name),
        upstream: Arc::clone(&upstream),
    };
    (
        ConfiguredSource {
            name: name.to_string(),
            kind: SourceKind::GoogleSheets,
            output_dir: output_dir.to_path_buf(),
            source: Box::new(source),
        },
        upstream,
    )
}
