//! LedgerLinker hosted-aggregator source.
//!
//! The LedgerLinker service exposes bank and card accounts (aggregated
//! through a paid provider) as "exports". Each export becomes its own ledger
//! file keyed by the export slug. The export endpoint filters server-side
//! with `start_date`, so only the day after the cursor onwards is requested.

use chrono::NaiveDate;
use serde::Deserialize;

use super::http::HttpClient;
use super::provider::{newer_than, DataSource, ExportBatch, SourceError, SyncRequest};
use crate::config::{ConfigError, SourceConfig};
use crate::domain::{sort_by_date, ExportId, FieldValue, Record};

pub const DEFAULT_BASE_URL: &str = "https://app.ledgerlinker.com";
pub const REQUIRED_OPTIONS: &[&str] = &["token"];
const DATE_FIELD: &str = "date";

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ExportInfo {
    slug: String,
    #[serde(default)]
    name: String,
    json_download_url: String,
}

/// The export list arrives either bare or wrapped in a paginated envelope.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExportList {
    Bare(Vec<ExportInfo>),
    Paged { results: Vec<ExportInfo> },
}

impl ExportList {
    fn into_exports(self) -> Vec<ExportInfo> {
        match self {
            ExportList::Bare(exports) | ExportList::Paged { results: exports } => exports,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExportPayload {
    #[serde(default)]
    transactions: Vec<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    fieldnames: Vec<String>,
    latest_transaction: Option<String>,
}

/// LedgerLinker service source.
pub struct LedgerLinkerSource {
    name: String,
    base_url: String,
    token: String,
    desired_exports: Option<Vec<String>>,
    http: HttpClient,
}

impl LedgerLinkerSource {
    pub fn from_config(config: &SourceConfig) -> Result<Self, ConfigError> {
        let name = config.name.as_str();
        let opts = &config.options;
        let token = opts.require_str(name, "token")?;
        let base_url = opts.str_or(name, "base_url", DEFAULT_BASE_URL)?;
        let desired_exports = opts.opt_str_list(name, "exports")?;
        let http = HttpClient::new().map_err(|e| ConfigError::Construct {
            source_name: name.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            desired_exports,
            http,
        })
    }

    fn auth_header(&self) -> String {
        format!("Token {}", self.token)
    }

    fn available_exports(&self) -> Result<Vec<ExportInfo>, SourceError> {
        let url = format!("{}/api/exports/", self.base_url);
        let auth = self.auth_header();
        let list: ExportList = self
            .http
            .get_json(&url, |req| req.header(reqwest::header::AUTHORIZATION, auth.as_str()))?;
        Ok(list.into_exports())
    }

    fn fetch_export(
        &self,
        export: &ExportInfo,
        start_date: Option<NaiveDate>,
    ) -> Result<ExportPayload, SourceError> {
        let auth = self.auth_header();
        let start = start_date.map(|d| d.format("%Y-%m-%d").to_string());
        self.http.get_json(&export.json_download_url, |req| {
            let req = req.header(reqwest::header::AUTHORIZATION, auth.as_str());
            match &start {
                Some(start) => req.query(&[("start_date", start.as_str())]),
                None => req,
            }
        })
    }
}

impl DataSource for LedgerLinkerSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn sync(&mut self, request: &SyncRequest<'_>) -> Result<Vec<ExportBatch>, SourceError> {
        let exports = filter_exports(self.available_exports()?, self.desired_exports.as_deref());

        let mut batches = Vec::with_capacity(exports.len());
        for export in &exports {
            let slug = export.slug.as_str();
            if request.is_current(slug) {
                tracing::info!(source = %self.name, export = slug, "export already up to date");
                batches.push(ExportBatch::new(slug));
                continue;
            }

            tracing::info!(source = %self.name, export = slug, name = %export.name, "fetching export");
            let payload = self.fetch_export(export, request.start_date(slug))?;
            batches.push(payload_to_batch(slug, payload, request.cursor(slug))?);
        }
        Ok(batches)
    }
}

/// Keep the exports named in `desired` (all when `None`), in upstream order.
fn filter_exports(exports: Vec<ExportInfo>, desired: Option<&[String]>) -> Vec<ExportInfo> {
    let Some(desired) = desired else {
        return exports;
    };
    for slug in desired {
        if !exports.iter().any(|e| &e.slug == slug) {
            tracing::warn!(export = %slug, "configured export not offered by the service");
        }
    }
    exports
        .into_iter()
        .filter(|e| desired.contains(&e.slug))
        .collect()
}

fn parse_date(field: &str, raw: &str) -> Result<NaiveDate, SourceError> {
    let day = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .map_err(|e| SourceError::ResponseFormatChanged(format!("invalid {field} '{raw}': {e}")))
}

/// One transaction → one record, fields in the payload's column order first.
fn transaction_to_record(
    txn: &serde_json::Map<String, serde_json::Value>,
    fieldnames: &[String],
) -> Result<Record, SourceError> {
    let raw_date = txn
        .get(DATE_FIELD)
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            SourceError::ResponseFormatChanged("transaction without a date field".into())
        })?;
    let mut record = Record::new(parse_date(DATE_FIELD, raw_date)?);

    for name in fieldnames {
        if let Some(value) = txn.get(name) {
            record.set(name.as_str(), FieldValue::from_json(value));
        }
    }
    for (name, value) in txn {
        if !fieldnames.contains(name) {
            record.set(name.as_str(), FieldValue::from_json(value));
        }
    }
    Ok(record)
}

fn payload_to_batch(
    slug: &str,
    payload: ExportPayload,
    cursor: Option<NaiveDate>,
) -> Result<ExportBatch, SourceError> {
    let mut records = payload
        .transactions
        .iter()
        .map(|txn| transaction_to_record(txn, &payload.fieldnames))
        .collect::<Result<Vec<_>, _>>()?;
    sort_by_date(&mut records);
    let records = newer_than(records, cursor);

    let latest = payload
        .latest_transaction
        .as_deref()
        .map(|raw| parse_date("latest_transaction", raw))
        .transpose()?;

    let batch = ExportBatch::new(ExportId::new(slug))
        .with_fieldnames(payload.fieldnames)
        .with_records(records);
    // An export with nothing new keeps its cursor even when the payload
    // reports a latest transaction.
    let new_cursor = match (batch.new_cursor, latest) {
        (Some(seen), Some(latest)) => Some(seen.max(latest)),
        (seen, _) => seen,
    };
    Ok(batch.with_new_cursor(new_cursor))
}
