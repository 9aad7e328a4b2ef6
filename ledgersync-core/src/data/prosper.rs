//! Prosper marketplace source.
//!
//! Authenticates with the OAuth password grant, then pages through every note
//! the account owns. The notes endpoint has no date filter, so all notes are
//! fetched and filtered locally to those originated after the cursor.
//! One export per configured source: note purchases.

use chrono::NaiveDate;
use serde::Deserialize;

use super::http::HttpClient;
use super::provider::{newer_than, DataSource, ExportBatch, SourceError, SyncRequest};
use crate::config::{ConfigError, SourceConfig};
use crate::domain::{sort_by_date, ExportId, Record};

pub const DEFAULT_BASE_URL: &str = "https://api.prosper.com/v1";
pub const REQUIRED_OPTIONS: &[&str] = &["client_id", "client_secret", "username", "password"];
const PAGE_SIZE: usize = 25;

pub const FIELDNAMES: [&str; 7] = [
    "date",
    "loan_note_id",
    "note_amount",
    "loan_amount",
    "term",
    "rate",
    "prosper_rating",
];

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct NotesPage {
    result: Vec<Note>,
    total_count: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
struct Note {
    loan_note_id: String,
    origination_date: String,
    amount_borrowed: f64,
    term: i64,
    borrower_rate: f64,
    note_ownership_amount: f64,
    #[serde(default)]
    prosper_rating: Option<String>,
}

#[derive(Debug, Clone)]
struct Credentials {
    client_id: String,
    client_secret: String,
    username: String,
    password: String,
}

/// Prosper notes source.
pub struct ProsperSource {
    name: String,
    export_id: ExportId,
    base_url: String,
    credentials: Credentials,
    http: HttpClient,
}

impl ProsperSource {
    pub fn from_config(config: &SourceConfig) -> Result<Self, ConfigError> {
        let name = config.name.as_str();
        let opts = &config.options;
        let credentials = Credentials {
            client_id: opts.require_str(name, "client_id")?,
            client_secret: opts.require_str(name, "client_secret")?,
            username: opts.require_str(name, "username")?,
            password: opts.require_str(name, "password")?,
        };
        let base_url = opts.str_or(name, "base_url", DEFAULT_BASE_URL)?;
        let http = HttpClient::new().map_err(|e| ConfigError::Construct {
            source_name: name.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            name: name.to_string(),
            export_id: ExportId::new(name),
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            http,
        })
    }

    fn access_token(&self) -> Result<String, SourceError> {
        let url = format!("{}/security/oauth/token", self.base_url);
        let c = &self.credentials;
        let token: TokenResponse = self.http.post_form_json(
            &url,
            &[
                ("grant_type", "password"),
                ("client_id", &c.client_id),
                ("client_secret", &c.client_secret),
                ("username", &c.username),
                ("password", &c.password),
            ],
        )?;
        Ok(token.access_token)
    }

    fn fetch_notes(&self, token: &str) -> Result<Vec<Note>, SourceError> {
        let mut notes = Vec::new();
        let mut offset = 0;
        loop {
            let url = format!("{}/notes/", self.base_url);
            let page: NotesPage = self.http.get_json(&url, |req| {
                req.bearer_auth(token)
                    .header(reqwest::header::ACCEPT, "application/json")
                    .query(&[("offset", offset), ("limit", PAGE_SIZE)])
            })?;

            let fetched = page.result.len();
            notes.extend(page.result);
            offset += fetched;

            let done = match page.total_count {
                Some(total) => offset >= total,
                None => fetched < PAGE_SIZE,
            };
            if done || fetched == 0 {
                break;
            }
        }
        tracing::debug!(source = %self.name, notes = notes.len(), "fetched prosper notes");
        Ok(notes)
    }
}

impl DataSource for ProsperSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn exports(&self) -> Vec<ExportId> {
        vec![self.export_id.clone()]
    }

    fn sync(&mut self, request: &SyncRequest<'_>) -> Result<Vec<ExportBatch>, SourceError> {
        let token = self.access_token()?;
        let notes = self.fetch_notes(&token)?;
        let batch = notes_to_batch(&self.export_id, notes, request.cursor(self.export_id.as_str()))?;
        Ok(vec![batch])
    }
}

fn parse_origination_date(raw: &str) -> Result<NaiveDate, SourceError> {
    // Dates arrive as `YYYY-MM-DD` or with a time suffix.
    let day = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").map_err(|e| {
        SourceError::ResponseFormatChanged(format!("invalid origination_date '{raw}': {e}"))
    })
}

fn note_to_record(note: &Note) -> Result<Record, SourceError> {
    let date = parse_origination_date(&note.origination_date)?;
    let rate = (note.borrower_rate * 100.0 * 100.0).round() / 100.0;
    let mut record = Record::new(date)
        .with("date", date)
        .with("loan_note_id", note.loan_note_id.as_str())
        .with("note_amount", note.note_ownership_amount)
        .with("loan_amount", note.amount_borrowed)
        .with("term", note.term)
        .with("rate", rate);
    if let Some(rating) = &note.prosper_rating {
        record.set("prosper_rating", rating.as_str());
    }
    Ok(record)
}

fn notes_to_batch(
    export_id: &ExportId,
    notes: Vec<Note>,
    cursor: Option<NaiveDate>,
) -> Result<ExportBatch, SourceError> {
    let mut records = notes
        .iter()
        .map(note_to_record)
        .collect::<Result<Vec<_>, _>>()?;
    sort_by_date(&mut records);
    let records = newer_than(records, cursor);

    Ok(ExportBatch::new(export_id.clone())
        .with_fieldnames(FIELDNAMES)
        .with_records(records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SourceKind, SourceOptions};
    use crate::domain::FieldValue;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    const PAGE: &str = r#"{
        "result": [
            {"loan_note_id": "111-2", "origination_date": "2024-01-03", "amount_borrowed": 10000.0,
             "term": 36, "borrower_rate": 0.1234, "note_ownership_amount": 25.0, "prosper_rating": "B"},
            {"loan_note_id": "111-1", "origination_date": "2024-01-01T00:00:00", "amount_borrowed": 5000,
             "term": 60, "borrower_rate": 0.0899, "note_ownership_amount": 50.0, "prosper_rating": "AA"}
        ],
        "result_count": 2,
        "total_count": 2
    }"#;

    fn notes() -> Vec<Note> {
        serde_json::from_str::<NotesPage>(PAGE).unwrap().result
    }

    #[test]
    fn notes_become_sorted_records() {
        let batch = notes_to_batch(&ExportId::new("prosper"), notes(), None).unwrap();

        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.records[0].date, d(2024, 1, 1));
        assert_eq!(batch.records[1].get("rate"), Some(&FieldValue::Number(12.34)));
        assert_eq!(batch.records[0].get("rate"), Some(&FieldValue::Number(8.99)));
        assert_eq!(batch.new_cursor, Some(d(2024, 1, 3)));
        assert_eq!(batch.fieldnames[0], "date");
    }

    #[test]
    fn cursor_filters_strictly() {
        let batch =
            notes_to_batch(&ExportId::new("prosper"), notes(), Some(d(2024, 1, 1))).unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(
            batch.records[0].get("loan_note_id"),
            Some(&FieldValue::Text("111-2".into()))
        );
    }

    #[test]
    fn up_to_date_batch_is_empty() {
        let batch =
            notes_to_batch(&ExportId::new("prosper"), notes(), Some(d(2024, 1, 3))).unwrap();
        assert!(batch.is_up_to_date());
        assert_eq!(batch.new_cursor, None);
    }

    #[test]
    fn bad_date_is_a_format_error() {
        let mut bad = notes();
        bad[0].origination_date = "01/03/2024".into();
        assert!(matches!(
            notes_to_batch(&ExportId::new("prosper"), bad, None),
            Err(SourceError::ResponseFormatChanged(_))
        ));
    }

    #[test]
    fn missing_credentials_fail_construction() {
        let config = SourceConfig {
            name: "prosper".into(),
            kind: SourceKind::Prosper,
            output_dir: "out".into(),
            options: SourceOptions::new().with("client_id", "id"),
        };
        assert!(matches!(
            ProsperSource::from_config(&config),
            Err(ConfigError::MissingOption { key, .. }) if key == "client_secret"
        ));
    }
}
