//! ADP payroll portal source.
//!
//! Uses the browser session cookie (`SMSESSION`) to read the pay statement
//! list, then fetches the detail of each statement paid after the cursor.
//! The list endpoint cannot filter by date, so filtering happens locally
//! before any detail request is made.
//!
//! Each statement becomes one row: pay date, net and gross pay, one column per
//! named deduction, and the statement's detail URL.

use chrono::NaiveDate;
use serde::Deserialize;

use super::http::HttpClient;
use super::provider::{DataSource, ExportBatch, SourceError, SyncRequest};
use crate::config::{ConfigError, SourceConfig};
use crate::domain::{sort_by_date, ExportId, Record};
use crate::ledger::fieldnames_from_records;

pub const DEFAULT_BASE_URL: &str = "https://my.adp.com/myadp_prefix";
pub const REQUIRED_OPTIONS: &[&str] = &["session_cookie"];
const STATEMENT_LIST_PATH: &str =
    "/v1_0/O/A/payStatements?adjustments=yes&numberoflastpaydates=160";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementList {
    #[serde(default)]
    pay_statements: Vec<StatementSummary>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementSummary {
    pay_date: String,
    pay_detail_uri: Link,
}

#[derive(Debug, Clone, Deserialize)]
struct Link {
    href: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementEnvelope {
    pay_statement: StatementDetail,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementDetail {
    pay_date: String,
    net_pay_amount: Amount,
    gross_pay_amount: Amount,
    #[serde(default)]
    deductions: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Amount {
    amount_value: f64,
}

/// ADP pay statement source.
pub struct AdpSource {
    name: String,
    export_id: ExportId,
    base_url: String,
    session_cookie: String,
    fields: Option<Vec<String>>,
    http: HttpClient,
}

impl AdpSource {
    pub fn from_config(config: &SourceConfig) -> Result<Self, ConfigError> {
        let name = config.name.as_str();
        let opts = &config.options;
        let session_cookie = opts.require_str(name, "session_cookie")?;
        let base_url = opts.str_or(name, "base_url", DEFAULT_BASE_URL)?;
        let fields = opts.opt_str_list(name, "fields")?;
        let http = HttpClient::without_redirects().map_err(|e| ConfigError::Construct {
            source_name: name.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            name: name.to_string(),
            export_id: ExportId::new(name),
            base_url: base_url.trim_end_matches('/').to_string(),
            session_cookie,
            fields,
            http,
        })
    }

    fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, SourceError> {
        let url = format!("{}{}", self.base_url, path);
        let cookie = format!("SMSESSION={}", self.session_cookie);
        self.http
            .get_json(&url, |req| req.header(reqwest::header::COOKIE, cookie.as_str()))
            .map_err(session_error)
    }
}

/// The portal answers an expired session with assorted non-200 statuses.
fn session_error(e: SourceError) -> SourceError {
    match e {
        SourceError::HttpStatus { status, url } => SourceError::AuthenticationRequired(format!(
            "HTTP {status} from {url}; the session cookie has probably expired"
        )),
        other => other,
    }
}

impl DataSource for AdpSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn exports(&self) -> Vec<ExportId> {
        vec![self.export_id.clone()]
    }

    fn sync(&mut self, request: &SyncRequest<'_>) -> Result<Vec<ExportBatch>, SourceError> {
        let cursor = request.cursor(self.export_id.as_str());
        let list: StatementList = self.get(STATEMENT_LIST_PATH)?;
        let pending = statements_after(list.pay_statements, cursor)?;

        let mut records = Vec::with_capacity(pending.len());
        for summary in &pending {
            tracing::info!(source = %self.name, pay_date = %summary.pay_date, "downloading pay statement");
            let envelope: StatementEnvelope = self.get(&summary.pay_detail_uri.href)?;
            records.push(statement_to_record(
                &envelope.pay_statement,
                &summary.pay_detail_uri.href,
            )?);
        }

        Ok(vec![build_batch(
            &self.export_id,
            records,
            self.fields.as_deref(),
        )])
    }
}

fn parse_pay_date(raw: &str) -> Result<NaiveDate, SourceError> {
    let day = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .map_err(|e| SourceError::ResponseFormatChanged(format!("invalid payDate '{raw}': {e}")))
}

/// Statements paid strictly after `cursor`, oldest first.
fn statements_after(
    statements: Vec<StatementSummary>,
    cursor: Option<NaiveDate>,
) -> Result<Vec<StatementSummary>, SourceError> {
    let mut dated = Vec::with_capacity(statements.len());
    for statement in statements {
        let date = parse_pay_date(&statement.pay_date)?;
        if cursor.map_or(true, |c| date > c) {
            dated.push((date, statement));
        }
    }
    dated.sort_by_key(|(date, _)| *date);
    Ok(dated.into_iter().map(|(_, s)| s).collect())
}

fn statement_to_record(detail: &StatementDetail, url: &str) -> Result<Record, SourceError> {
    let date = parse_pay_date(&detail.pay_date)?;
    let mut record = Record::new(date)
        .with("payDate", date)
        .with("netPayAmount", detail.net_pay_amount.amount_value)
        .with("grossPayAmount", detail.gross_pay_amount.amount_value);

    for deduction in &detail.deductions {
        let name = deduction
            .get("CodeName")
            .or_else(|| deduction.get("codeName"))
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|n| !n.is_empty());
        let amount = deduction
            .get("deductionAmount")
            .and_then(|a| a.get("amountValue"))
            .and_then(|v| v.as_f64());
        // Deductions without a name or amount are informational lines.
        if let (Some(name), Some(amount)) = (name, amount) {
            record.set(name, amount);
        }
    }

    record.set("url", url);
    Ok(record)
}

fn build_batch(export_id: &ExportId, mut records: Vec<Record>, fields: Option<&[String]>) -> ExportBatch {
    sort_by_date(&mut records);
    let fieldnames = match fields {
        Some(fields) => fields.to_vec(),
        None => {
            let mut names = fieldnames_from_records(&records);
            // keep the statement link as the last column
            if let Some(pos) = names.iter().position(|n| n == "url") {
                let url = names.remove(pos);
                names.push(url);
            }
            names
        }
    };
    ExportBatch::new(export_id.clone())
        .with_fieldnames(fieldnames)
        .with_records(records)
}
