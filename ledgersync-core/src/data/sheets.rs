//! Google Sheets source.
//!
//! Reads a range of cell values; the first row is the header. One export per
//! configured source. The values endpoint has no date filter, so rows are
//! filtered locally on the configured date column.

use chrono::format::{Item, StrftimeItems};
use chrono::NaiveDate;
use reqwest::Url;
use serde::Deserialize;

use super::http::HttpClient;
use super::provider::{newer_than, DataSource, ExportBatch, SourceError, SyncRequest};
use crate::config::{ConfigError, SourceConfig};
use crate::domain::{sort_by_date, ExportId, FieldValue, Record};

pub const DEFAULT_BASE_URL: &str = "https://sheets.googleapis.com/v4/spreadsheets";
pub const REQUIRED_OPTIONS: &[&str] = &["spreadsheet_id", "range", "access_token"];

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

/// How rows of the sheet map onto records.
#[derive(Debug, Clone)]
struct SheetLayout {
    date_field: String,
    date_format: String,
    fields: Option<Vec<String>>,
}

pub struct SheetsSource {
    name: String,
    export_id: ExportId,
    values_url: Url,
    access_token: String,
    layout: SheetLayout,
    http: HttpClient,
}

impl SheetsSource {
    pub fn from_config(config: &SourceConfig) -> Result<Self, ConfigError> {
        let name = config.name.as_str();
        let opts = &config.options;
        let invalid = |key: &str, reason: String| ConfigError::InvalidOption {
            source_name: name.to_string(),
            key: key.to_string(),
            reason,
        };

        let spreadsheet_id = opts.require_str(name, "spreadsheet_id")?;
        let range = opts.require_str(name, "range")?;
        let access_token = opts.require_str(name, "access_token")?;
        let base_url = opts.str_or(name, "base_url", DEFAULT_BASE_URL)?;
        let date_format = opts.str_or(name, "date_format", "%Y-%m-%d")?;
        if StrftimeItems::new(&date_format).any(|item| matches!(item, Item::Error)) {
            return Err(invalid("date_format", format!("'{date_format}' is not a date format")));
        }

        let mut values_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| invalid("base_url", e.to_string()))?;
        values_url
            .path_segments_mut()
            .map_err(|_| invalid("base_url", "cannot be a base URL".into()))?
            .push(&spreadsheet_id)
            .push("values")
            .push(&range);

        let http = HttpClient::new().map_err(|e| ConfigError::Construct {
            source_name: name.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            name: name.to_string(),
            export_id: ExportId::new(name),
            values_url,
            access_token,
            layout: SheetLayout {
                date_field: opts.str_or(name, "date_field", "date")?,
                date_format,
                fields: opts.opt_str_list(name, "fields")?,
            },
            http,
        })
    }
}

impl DataSource for SheetsSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn exports(&self) -> Vec<ExportId> {
        vec![self.export_id.clone()]
    }

    fn sync(&mut self, request: &SyncRequest<'_>) -> Result<Vec<ExportBatch>, SourceError> {
        let token = self.access_token.as_str();
        let range: ValueRange = self
            .http
            .get_json(self.values_url.as_str(), |req| req.bearer_auth(token))?;
        tracing::debug!(source = %self.name, rows = range.values.len(), "read sheet values");

        let batch = rows_to_batch(
            &self.export_id,
            &self.layout,
            range.values,
            request.cursor(self.export_id.as_str()),
        )?;
        Ok(vec![batch])
    }
}

fn cell_text(cell: &serde_json::Value) -> String {
    match cell {
        serde_json::Value::String(s) => s.trim().to_string(),
        other => FieldValue::from_json(other).to_cell(),
    }
}

fn rows_to_batch(
    export_id: &ExportId,
    layout: &SheetLayout,
    rows: Vec<Vec<serde_json::Value>>,
    cursor: Option<NaiveDate>,
) -> Result<ExportBatch, SourceError> {
    let mut rows = rows.into_iter();
    let header: Vec<String> = rows
        .next()
        .map(|row| row.iter().map(cell_text).collect())
        .unwrap_or_default();
    if header.is_empty() {
        let fieldnames = layout.fields.clone().unwrap_or_default();
        return Ok(ExportBatch::new(export_id.clone()).with_fieldnames(fieldnames));
    }

    let date_col = header
        .iter()
        .position(|h| *h == layout.date_field)
        .ok_or_else(|| {
            SourceError::ResponseFormatChanged(format!(
                "sheet header has no '{}' column",
                layout.date_field
            ))
        })?;

    let mut records = Vec::new();
    for (offset, row) in rows.enumerate() {
        // +2: one for the header, one for 1-based sheet rows
        let row_number = offset + 2;
        let raw_date = row.get(date_col).map(cell_text).unwrap_or_default();
        let date = match NaiveDate::parse_from_str(&raw_date, &layout.date_format) {
            Ok(date) => date,
            Err(e) => {
                if row.iter().any(|cell| !cell_text(cell).is_empty()) {
                    tracing::warn!(export = %export_id, row = row_number, value = %raw_date, error = %e, "skipping row with unparsable date");
                }
                continue;
            }
        };

        let mut record = Record::new(date);
        for (col, name) in header.iter().enumerate() {
            if col == date_col {
                record.set(name.as_str(), date);
                continue;
            }
            let value = match row.get(col) {
                Some(serde_json::Value::String(s)) => FieldValue::Text(s.clone()),
                Some(other) => FieldValue::from_json(other),
                None => FieldValue::Empty,
            };
            record.set(name.as_str(), value);
        }
        records.push(record);
    }

    sort_by_date(&mut records);
    let records = newer_than(records, cursor);
    let fieldnames = layout.fields.clone().unwrap_or(header);

    Ok(ExportBatch::new(export_id.clone())
        .with_fieldnames(fieldnames)
        .with_records(records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SourceKind, SourceOptions};
    use serde_json::json;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn layout(date_format: &str) -> SheetLayout {
        SheetLayout {
            date_field: "Date".into(),
            date_format: date_format.into(),
            fields: None,
        }
    }

    fn rows() -> Vec<Vec<serde_json::Value>> {
        serde_json::from_value(json!([
            ["Date", "Payee", "Amount"],
            ["01/05/2024", "Landlord", "-1200"],
            ["01/02/2024", "Grocer", "-84.10"],
            ["not a date", "Typo", "1"],
            [],
            ["01/03/2024", "Refund"]
        ]))
        .unwrap()
    }

    #[test]
    fn rows_become_sorted_records_with_iso_dates() {
        let batch = rows_to_batch(&ExportId::new("budget"), &layout("%m/%d/%Y"), rows(), None).unwrap();

        assert_eq!(batch.fieldnames, vec!["Date", "Payee", "Amount"]);
        let dates: Vec<NaiveDate> = batch.records.iter().map(|r| r.date).collect();
        assert_eq!(dates, vec![d(2024, 1, 2), d(2024, 1, 3), d(2024, 1, 5)]);
        assert_eq!(
            batch.records[0].to_row(&batch.fieldnames),
            vec!["2024-01-02", "Grocer", "-84.10"]
        );
        assert_eq!(batch.records[1].get("Amount"), Some(&FieldValue::Empty));
        assert_eq!(batch.new_cursor, Some(d(2024, 1, 5)));
    }

    #[test]
    fn cursor_filters_strictly() {
        let batch = rows_to_batch(
            &ExportId::new("budget"),
            &layout("%m/%d/%Y"),
            rows(),
            Some(d(2024, 1, 3)),
        )
        .unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].date, d(2024, 1, 5));
    }

    #[test]
    fn explicit_fields_fix_the_header() {
        let mut layout = layout("%m/%d/%Y");
        layout.fields = Some(vec!["Date".into(), "Amount".into()]);
        let batch = rows_to_batch(&ExportId::new("budget"), &layout, rows(), None).unwrap();
        assert_eq!(batch.fieldnames, vec!["Date", "Amount"]);
    }

    #[test]
    fn missing_date_column_is_a_format_error() {
        let rows = serde_json::from_value(json!([["When", "Amount"], ["2024-01-01", "1"]])).unwrap();
        assert!(matches!(
            rows_to_batch(&ExportId::new("budget"), &layout("%Y-%m-%d"), rows, None),
            Err(SourceError::ResponseFormatChanged(_))
        ));
    }

    #[test]
    fn empty_sheet_is_up_to_date() {
        let batch = rows_to_batch(&ExportId::new("budget"), &layout("%Y-%m-%d"), Vec::new(), None).unwrap();
        assert!(batch.is_up_to_date());
        assert_eq!(batch.new_cursor, None);
    }

    fn config(options: SourceOptions) -> SourceConfig {
        SourceConfig {
            name: "budget".into(),
            kind: SourceKind::GoogleSheets,
            output_dir: "out".into(),
            options,
        }
    }

    #[test]
    fn range_is_escaped_into_the_values_url() {
        let source = SheetsSource::from_config(&config(
            SourceOptions::new()
                .with("spreadsheet_id", "abc123")
                .with("range", "Budget 2024")
                .with("access_token", "tok"),
        ))
        .unwrap();
        assert_eq!(
            source.values_url.as_str(),
            "https://sheets.googleapis.com/v4/spreadsheets/abc123/values/Budget%202024"
        );
        assert_eq!(source.exports(), vec![ExportId::new("budget")]);
    }

    #[test]
    fn bad_date_format_is_rejected_at_construction() {
        let result = SheetsSource::from_config(&config(
            SourceOptions::new()
                .with("spreadsheet_id", "abc123")
                .with("range", "Sheet1")
                .with("access_token", "tok")
                .with("date_format", "%Q"),
        ));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidOption { key, .. }) if key == "date_format"
        ));
    }
}
