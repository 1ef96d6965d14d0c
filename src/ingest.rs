use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use feed_rs::parser;
use reqwest::Client;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::SheetsConfig;
use crate::error::{Error, Result};
use crate::model::{cell_string, RawNewsRow, SourceConfig, STATUS_NEW};
use crate::sheets::TabularStore;

pub const MIN_TITLE_LEN: usize = 5;

/// An item pulled out of a feed, before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFeedItem {
    pub title: String,
    pub link: String,
    pub content_snippet: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    ShortTitle,
    BadLink,
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub sources_polled: usize,
    pub sources_failed: usize,
    pub items_seen: usize,
    pub short_titles: usize,
    pub bad_links: usize,
    pub duplicates: usize,
    pub rows_appended: usize,
}

impl IngestReport {
    fn record_drop(&mut self, reason: DropReason) {
        match reason {
            DropReason::ShortTitle => self.short_titles += 1,
            DropReason::BadLink => self.bad_links += 1,
            DropReason::Duplicate => self.duplicates += 1,
        }
    }
}

/// `YYYYMMDD` for the given instant, in UTC.
pub fn day_prefix(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d").to_string()
}

/// Next daily sequence ID. The sequence restarts at `001` when there is no previous
/// ID, the previous one belongs to another day, or its serial cannot be advanced.
pub fn next_id(last_id: Option<&str>, today: &str) -> String {
    let serial = last_id
        .filter(|id| id.starts_with(today))
        .and_then(|id| id.split('-').nth(1))
        .and_then(|s| s.trim().parse::<u32>().ok())
        .and_then(|n| n.checked_add(1))
        .unwrap_or(1);

    format!("{}-{:03}", today, serial)
}

fn title_ok(title: &str) -> bool {
    title.trim().chars().count() >= MIN_TITLE_LEN
}

fn link_ok(link: &str) -> bool {
    link.starts_with("http")
}

/// The hard rules, checked in order.
pub fn check_item(item: &RawFeedItem, seen: &HashSet<String>) -> std::result::Result<(), DropReason> {
    if !title_ok(&item.title) {
        return Err(DropReason::ShortTitle);
    }
    if !link_ok(&item.link) {
        return Err(DropReason::BadLink);
    }
    if seen.contains(&item.link) {
        return Err(DropReason::Duplicate);
    }
    Ok(())
}

/// Last line of defence before the append: nothing with a short title or a non-http
/// link reaches the sheet.
pub fn final_filter(rows: Vec<RawNewsRow>) -> Vec<RawNewsRow> {
    rows.into_iter()
        .filter(|r| title_ok(&r.title) && link_ok(&r.link))
        .collect()
}

/// Strips markup from an HTML fragment, decodes entities and collapses whitespace.
pub fn strip_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;

    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                text.push(' ');
            }
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }

    let decoded = html_escape::decode_html_entities(&text);

    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Title, first link, and a plain-text snippet of the content (falling back to
/// the summary) for each entry.
pub fn extract_items(feed: &feed_rs::model::Feed) -> Vec<RawFeedItem> {
    feed.entries
        .iter()
        .map(|entry| {
            let title = entry
                .title
                .as_ref()
                .map(|t| t.content.trim().to_string())
                .unwrap_or_default();

            let link = entry
                .links
                .first()
                .map(|l| l.href.trim().to_string())
                .unwrap_or_default();

            let body = entry
                .content
                .as_ref()
                .and_then(|c| c.body.as_deref())
                .or_else(|| entry.summary.as_ref().map(|s| s.content.as_str()))
                .unwrap_or("");

            RawFeedItem {
                title,
                link,
                content_snippet: strip_html(body),
            }
        })
        .collect()
}

pub struct Ingestor {
    client: Client,
    store: Arc<dyn TabularStore>,
    sheets: SheetsConfig,
    max_items_per_source: usize,
    /// Held for the length of a run
    running: Arc<Mutex<()>>,
}

impl Ingestor {
    pub fn new(
        client: Client,
        store: Arc<dyn TabularStore>,
        sheets: SheetsConfig,
        max_items_per_source: usize,
    ) -> Self {
        Self {
            client,
            store,
            sheets,
            max_items_per_source,
            running: Arc::new(Mutex::new(())),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    /// Runs one ingestion pass. Returns `None` without touching the store when another
    /// pass is already in flight in this process.
    pub async fn run(&self) -> Result<Option<IngestReport>> {
        self.run_at(Utc::now()).await
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<Option<IngestReport>> {
        let Ok(_guard) = self.running.try_lock() else {
            info!("Ingestion already in progress, skipping");
            return Ok(None);
        };

        self.do_run(now).await.map(Some)
    }

    /// Claims the run guard and starts a pass in the background. Returns `false` when
    /// a pass is already in flight, in which case nothing is started.
    pub fn spawn_run(self: &Arc<Self>) -> bool {
        let Ok(guard) = self.running.clone().try_lock_owned() else {
            info!("Ingestion already in progress, not starting another");
            return false;
        };

        let ingestor = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = ingestor.do_run(Utc::now()).await {
                error!("Ingestion failed: {}", e);
            }
        });
        true
    }

    async fn do_run(&self, now: DateTime<Utc>) -> Result<IngestReport> {
        info!("Ingestion started");
        let mut report = IngestReport::default();

        let sources = self.load_sources().await?;
        let mut seen = self.load_seen_urls().await?;
        let mut last_id = self.load_last_id().await?;
        let today = day_prefix(now);

        let mut batch: Vec<RawNewsRow> = Vec::new();

        for source in sources.iter().filter(|s| s.enabled) {
            report.sources_polled += 1;

            let items = match self.fetch_items(source).await {
                Ok(items) => items,
                Err(e) => {
                    error!("{}", e);
                    report.sources_failed += 1;
                    continue;
                }
            };

            for item in items.into_iter().take(self.max_items_per_source) {
                report.items_seen += 1;

                if let Err(reason) = check_item(&item, &seen) {
                    debug!("Dropping item from '{}' ({:?}): {}", source.source_name, reason, item.link);
                    report.record_drop(reason);
                    continue;
                }

                let id = next_id(last_id.as_deref(), &today);
                last_id = Some(id.clone());
                seen.insert(item.link.clone());

                batch.push(RawNewsRow {
                    id,
                    source_name: source.source_name.clone(),
                    title: item.title,
                    link: item.link,
                    content: item.content_snippet,
                    category: source.category.clone(),
                    ingested_at: Utc::now(),
                    status: STATUS_NEW.to_string(),
                });
            }
        }

        let accepted = batch.len();
        let batch = final_filter(batch);
        if batch.len() < accepted {
            warn!("Final filter removed {} rows", accepted - batch.len());
        }

        if batch.is_empty() {
            info!("No new rows to append");
        } else {
            let rows = batch.iter().map(RawNewsRow::to_row).collect();
            report.rows_appended = self.store.append_rows(&self.sheets.raw_append_range, rows).await?;
        }

        info!(
            "Ingestion finished: {} sources polled ({} failed), {} items seen, {} appended, {} duplicates, {} short titles, {} bad links",
            report.sources_polled,
            report.sources_failed,
            report.items_seen,
            report.rows_appended,
            report.duplicates,
            report.short_titles,
            report.bad_links,
        );
        Ok(report)
    }

    async fn load_sources(&self) -> Result<Vec<SourceConfig>> {
        let rows = self.store.get_range(&self.sheets.sources_range).await?;

        let sources: Vec<SourceConfig> = rows
            .iter()
            .enumerate()
            .filter_map(|(i, row)| match SourceConfig::from_row(i, row) {
                Ok(source) => Some(source),
                Err(e) => {
                    warn!("Skipping source row: {}", e);
                    None
                }
            })
            .collect();

        info!(
            "Loaded {} sources ({} enabled)",
            sources.len(),
            sources.iter().filter(|s| s.enabled).count()
        );
        Ok(sources)
    }

    async fn load_seen_urls(&self) -> Result<HashSet<String>> {
        let rows = self.store.get_range(&self.sheets.raw_urls_range).await?;

        let mut seen = HashSet::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            for cell in row {
                let url = cell_string(i, Some(cell))?;
                seen.insert(url.trim().to_string());
            }
        }
        Ok(seen)
    }

    async fn load_last_id(&self) -> Result<Option<String>> {
        let rows = self.store.get_range(&self.sheets.raw_ids_range).await?;

        match rows.last() {
            Some(row) => {
                let id = cell_string(rows.len() - 1, row.first())?;
                let id = id.trim();
                Ok((!id.is_empty()).then(|| id.to_string()))
            }
            None => Ok(None),
        }
    }

    async fn fetch_items(&self, source: &SourceConfig) -> Result<Vec<RawFeedItem>> {
        info!("Fetching feed: {} ({})", source.source_name, source.feed_url);

        let response = self
            .client
            .get(&source.feed_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::feed_fetch(&source.source_name, e))?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::feed_fetch(&source.source_name, e))?;

        let parsed = parser::parse(&bytes[..]).map_err(|e| Error::feed_fetch(&source.source_name, e))?;
        Ok(extract_items(&parsed))
    }
}

pub async fn start_background_ingest(ingestor: Arc<Ingestor>, interval_minutes: u64) {
    let interval = Duration::from_secs(interval_minutes.max(1) * 60);

    loop {
        info!("Starting scheduled ingestion");
        if let Err(e) = ingestor.run().await {
            error!("Scheduled ingestion failed: {}", e);
        }
        tokio::time::sleep(interval).await;
    }
}
