//! Typed views over the untyped sheet rows.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::sheets::Row;

pub const STATUS_NEW: &str = "NEW";

/// Renders a cell the way the sheet displays it. Nested values are rejected.
pub fn cell_string(row_index: usize, value: Option<&Value>) -> Result<String> {
    match value {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Bool(b)) => Ok(if *b { "TRUE" } else { "FALSE" }.to_string()),
        Some(other) => Err(Error::malformed(
            row_index,
            format!("expected a scalar cell, found {}", other),
        )),
    }
}

/// Boolean `true` or the string `TRUE` in any case.
pub fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("TRUE"),
        _ => false,
    }
}

/// A row of the `SOURCES` sheet: `source_id, source_name, feed_url, category, enabled`.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceConfig {
    pub source_name: String,
    pub feed_url: String,
    pub category: String,
    pub enabled: bool,
}

impl SourceConfig {
    pub fn from_row(row_index: usize, row: &[Value]) -> Result<Self> {
        let cell = |i: usize| cell_string(row_index, row.get(i)).map(|s| s.trim().to_string());

        Ok(Self {
            source_name: cell(1)?,
            feed_url: cell(2)?,
            category: cell(3)?,
            enabled: cell(4)?.eq_ignore_ascii_case("TRUE"),
        })
    }
}

/// A row appended to `RAW_NEWS`, columns A through H.
#[derive(Debug, Clone, PartialEq)]
pub struct RawNewsRow {
    pub id: String,
    pub source_name: String,
    pub title: String,
    pub link: String,
    pub content: String,
    pub category: String,
    pub ingested_at: DateTime<Utc>,
    pub status: String,
}

impl RawNewsRow {
    pub fn to_row(&self) -> Row {
        vec![
            Value::from(self.id.as_str()),
            Value::from(self.source_name.as_str()),
            Value::from(self.title.as_str()),
            Value::from(self.link.as_str()),
            Value::from(self.content.as_str()),
            Value::from(self.category.as_str()),
            Value::from(self.ingested_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Value::from(self.status.as_str()),
        ]
    }
}

/// Column positions in the `FINAL_BLOGS` sheet.
pub mod col {
    pub const ID: usize = 0;
    pub const TITLE: usize = 2;
    pub const CONTENT: usize = 4;
    pub const CATEGORY: usize = 6;
    pub const AUTHOR: usize = 7;
    pub const PUBLISHED_AT: usize = 8;
    pub const IS_PUBLISHED: usize = 9;
    pub const IS_FEATURED: usize = 10;
    pub const STATUS: usize = 13;
    pub const AI_CONTENT: usize = 15;
    pub const AI_TITLE: usize = 16;
    pub const COUNT: usize = 17;
}

/// A `FINAL_BLOGS` row with the columns the site reads.
///
/// The Sheets API leaves off trailing empty cells, so short rows are normal and the
/// missing columns read as empty. A row with no cells, no id, more columns than the
/// sheet has, or a nested cell value is malformed.
#[derive(Debug, Clone, PartialEq)]
pub struct PostRow {
    pub id: String,
    pub title: String,
    pub content: String,
    pub category: String,
    pub author: String,
    pub published_at: String,
    pub is_published: bool,
    pub is_featured: bool,
    pub status: String,
    pub ai_title: String,
    pub ai_content: String,
}

impl PostRow {
    pub fn from_row(row_index: usize, row: &[Value]) -> Result<Self> {
        if row.is_empty() {
            return Err(Error::malformed(row_index, "row has no cells"));
        }
        if row.len() > col::COUNT {
            return Err(Error::malformed(
                row_index,
                format!("expected at most {} columns, found {}", col::COUNT, row.len()),
            ));
        }

        let cell = |i: usize| cell_string(row_index, row.get(i));

        let id = cell(col::ID)?.trim().to_string();
        if id.is_empty() {
            return Err(Error::malformed(row_index, "missing id"));
        }

        Ok(Self {
            id,
            title: cell(col::TITLE)?,
            content: cell(col::CONTENT)?,
            category: cell(col::CATEGORY)?,
            author: cell(col::AUTHOR)?,
            published_at: cell(col::PUBLISHED_AT)?,
            is_published: is_truthy(row.get(col::IS_PUBLISHED)),
            is_featured: is_truthy(row.get(col::IS_FEATURED)),
            status: cell(col::STATUS)?.to_uppercase(),
            ai_title: cell(col::AI_TITLE)?,
            ai_content: cell(col::AI_CONTENT)?,
        })
    }
}

/// A post as served to readers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalPost {
    pub id: String,
    pub title: String,
    pub slug: String,
    pub content: String,
    pub category: String,
    pub author: String,
    pub published_at: String,
    pub is_featured: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Category {
    pub name: String,
    pub slug: String,
    pub count: usize,
}
