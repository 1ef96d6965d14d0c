//! Range reads and appends against the spreadsheet that backs the site.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::auth::TokenCache;
use crate::error::{Error, Result};

/// One row of untyped cells, in column order.
pub type Row = Vec<Value>;

#[async_trait]
pub trait TabularStore: Send + Sync {
    /// Rows of the A1 range, in sheet order. An empty range yields no rows.
    async fn get_range(&self, range: &str) -> Result<Vec<Row>>;

    /// Appends rows after the table found in `range`, returning how many were written.
    async fn append_rows(&self, range: &str, rows: Vec<Row>) -> Result<usize>;
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Option<Vec<Row>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendResponse {
    #[serde(default)]
    updates: Option<AppendUpdates>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendUpdates {
    #[serde(default)]
    updated_rows: Option<usize>,
}

/// Google Sheets v4 `values` client.
pub struct SheetsClient {
    client: Client,
    api_base: String,
    spreadsheet_id: String,
    tokens: Arc<TokenCache>,
}

impl SheetsClient {
    pub fn new(client: Client, api_base: &str, spreadsheet_id: &str, tokens: Arc<TokenCache>) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            spreadsheet_id: spreadsheet_id.to_string(),
            tokens,
        }
    }

    /// `{base}/v4/spreadsheets/{id}/values/{segment}` with the segment percent-encoded.
    pub fn values_url(&self, segment: &str) -> Result<Url> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|e| Error::Config(format!("invalid api base '{}': {}", self.api_base, e)))?;
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("api base '{}' cannot be a base", self.api_base)))?
            .pop_if_empty()
            .extend(["v4", "spreadsheets", self.spreadsheet_id.as_str(), "values", segment]);
        Ok(url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(Error::RemoteStore { status, body })
    }
}

#[async_trait]
impl TabularStore for SheetsClient {
    async fn get_range(&self, range: &str) -> Result<Vec<Row>> {
        let token = self.tokens.bearer().await?;
        let url = self.values_url(range)?;
        debug!("Reading range {}", range);

        let response = self.client.get(url).bearer_auth(token).send().await?;
        let response = Self::check(response).await?;

        let body: ValueRange = response.json().await?;
        Ok(body.values.unwrap_or_default())
    }

    async fn append_rows(&self, range: &str, rows: Vec<Row>) -> Result<usize> {
        let token = self.tokens.bearer().await?;
        let url = self.values_url(&format!("{}:append", range))?;
        let sent = rows.len();

        let response = self
            .client
            .post(url)
            .query(&[("valueInputOption", "USER_ENTERED")])
            .bearer_auth(token)
            .json(&serde_json::json!({ "values": rows }))
            .send()
            .await?;
        let response = Self::check(response).await?;

        let appended = response
            .json::<AppendResponse>()
            .await
            .ok()
            .and_then(|r| r.updates)
            .and_then(|u| u.updated_rows)
            .unwrap_or(sent);

        info!("Appended {} rows to {}", appended, range);
        Ok(appended)
    }
}

/// A parsed A1 range such as `RAW_NEWS!D2:D`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct A1Range {
    pub sheet: String,
    /// 0-based first column
    pub first_col: usize,
    /// 0-based last column, inclusive
    pub last_col: usize,
    /// 0-based first row
    pub first_row: usize,
}

impl A1Range {
    pub fn parse(range: &str) -> Result<Self> {
        let invalid = || Error::Config(format!("unsupported range '{}'", range));

        let (sheet, cells) = range.split_once('!').ok_or_else(invalid)?;
        let (start, end) = cells.split_once(':').unwrap_or((cells, cells));

        let (first_col, first_row) = split_cell(start).ok_or_else(invalid)?;
        let (last_col, _) = split_cell(end).ok_or_else(invalid)?;

        Ok(Self {
            sheet: sheet.to_string(),
            first_col,
            last_col: last_col.max(first_col),
            first_row: first_row.unwrap_or(0),
        })
    }
}

fn split_cell(cell: &str) -> Option<(usize, Option<usize>)> {
    let letters: String = cell.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    let digits = &cell[letters.len()..];
    if letters.is_empty() {
        return None;
    }

    let col = letters
        .chars()
        .fold(0usize, |acc, c| acc * 26 + (c.to_ascii_uppercase() as usize - 'A' as usize + 1))
        - 1;

    let row = if digits.is_empty() {
        None
    } else {
        Some(digits.parse::<usize>().ok()?.checked_sub(1)?)
    };

    Some((col, row))
}

/// In-process test double with the same range semantics as the remote one. Reads
/// drop trailing empty cells and rows, matching what the Sheets API returns.
///
/// Not meant for serving: the read delay, failure toggle and counters exist so
/// tests can observe and disturb how callers use the store.
#[derive(Default)]
pub struct MemoryStore {
    sheets: Mutex<HashMap<String, Vec<Row>>>,
    reads: AtomicUsize,
    appends: AtomicUsize,
    read_delay: Option<Duration>,
    failing: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every read sleeps this long first, which widens race windows in tests.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// Replaces a sheet's contents. `rows[0]` is the header row.
    pub fn set_sheet(&self, name: &str, rows: Vec<Row>) {
        if let Ok(mut sheets) = self.sheets.lock() {
            sheets.insert(name.to_string(), rows);
        }
    }

    pub fn sheet(&self, name: &str) -> Vec<Row> {
        self.sheets
            .lock()
            .ok()
            .and_then(|s| s.get(name).cloned())
            .unwrap_or_default()
    }

    /// Makes every following operation fail with a 503 until reset.
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut flag) = self.failing.lock() {
            *flag = failing;
        }
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn append_count(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }

    fn check_failing(&self) -> Result<()> {
        let failing = self.failing.lock().map(|f| *f).unwrap_or(false);
        if failing {
            return Err(Error::RemoteStore {
                status: 503,
                body: "backend unavailable".to_string(),
            });
        }
        Ok(())
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

#[async_trait]
impl TabularStore for MemoryStore {
    async fn get_range(&self, range: &str) -> Result<Vec<Row>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }
        self.check_failing()?;

        let a1 = A1Range::parse(range)?;
        let rows = self.sheet(&a1.sheet);

        let mut out: Vec<Row> = rows
            .iter()
            .skip(a1.first_row)
            .map(|row| {
                let mut cells: Row = row
                    .iter()
                    .skip(a1.first_col)
                    .take(a1.last_col - a1.first_col + 1)
                    .cloned()
                    .collect();
                while cells.last().map(is_blank).unwrap_or(false) {
                    cells.pop();
                }
                cells
            })
            .collect();

        while out.last().map(|r| r.is_empty()).unwrap_or(false) {
            out.pop();
        }
        Ok(out)
    }

    async fn append_rows(&self, range: &str, rows: Vec<Row>) -> Result<usize> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        self.check_failing()?;

        let a1 = A1Range::parse(range)?;
        let count = rows.len();
        let mut sheets = self
            .sheets
            .lock()
            .map_err(|_| Error::Config("memory store lock poisoned".into()))?;
        sheets.entry(a1.sheet).or_default().extend(rows);
        Ok(count)
    }
}
