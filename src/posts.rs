//! Turning `FINAL_BLOGS` rows into the published post list, and the queries served
//! from that list.

use std::cmp::Reverse;
use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use tracing::warn;

use crate::model::{Category, FinalPost, PostRow};
use crate::sheets::Row;

pub const STATUS_LIVE: &str = "LIVE";
pub const STATUS_READY: &str = "READY";
pub const FEATURED_LIMIT: usize = 3;

/// The AI override: a `LIVE` row shows its AI value when one is present, every other
/// row shows the base value.
pub fn resolve_field<'a>(status: &str, base: &'a str, ai: &'a str) -> &'a str {
    let ai = ai.trim();
    if status.eq_ignore_ascii_case(STATUS_LIVE) && !ai.is_empty() {
        ai
    } else {
        base.trim()
    }
}

/// Lowercases and collapses every run of characters outside `[a-z0-9]` into a single
/// hyphen, without leading or trailing hyphens.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_hyphen = false;

    for c in title.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c);
        } else {
            pending_hyphen = true;
        }
    }

    slug
}

/// Category slugs only replace whitespace runs.
pub fn category_slug(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut in_space = false;

    for c in name.to_lowercase().chars() {
        if c.is_whitespace() {
            if !in_space {
                slug.push('-');
            }
            in_space = true;
        } else {
            slug.push(c);
            in_space = false;
        }
    }

    slug
}

pub fn is_eligible(row: &PostRow) -> bool {
    row.is_published && (row.status == STATUS_LIVE || row.status == STATUS_READY)
}

pub fn row_to_post(row: &PostRow, now: DateTime<Utc>) -> FinalPost {
    let title = resolve_field(&row.status, &row.title, &row.ai_title).to_string();
    let content = resolve_field(&row.status, &row.content, &row.ai_content).to_string();

    let published_at = if row.published_at.trim().is_empty() {
        now.to_rfc3339()
    } else {
        row.published_at.clone()
    };

    FinalPost {
        id: row.id.clone(),
        slug: slugify(&title),
        title,
        content,
        category: row.category.clone(),
        author: row.author.clone(),
        published_at,
        is_featured: row.is_featured,
    }
}

/// Best-effort parse of the date formats that show up in the sheet. Dates without a
/// zone are taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.with_timezone(&Utc));
    }

    const DATETIME_FORMATS: [&str; 5] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%m/%d/%Y %H:%M:%S",
        "%m/%d/%Y %H:%M",
    ];
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }

    for format in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        }
    }

    None
}

/// Builds the published list: malformed rows are skipped, ineligible rows are
/// filtered out, and the rest are ordered newest first. Posts whose date cannot be
/// read sort as if published at `now`.
pub fn materialize(rows: &[Row], now: DateTime<Utc>) -> Vec<FinalPost> {
    let mut posts: Vec<FinalPost> = rows
        .iter()
        .enumerate()
        .filter_map(|(index, row)| match PostRow::from_row(index, row) {
            Ok(post_row) => Some(post_row),
            Err(e) => {
                warn!("Skipping post row: {}", e);
                None
            }
        })
        .filter(is_eligible)
        .map(|row| row_to_post(&row, now))
        .collect();

    posts.sort_by_cached_key(|p| Reverse(parse_timestamp(&p.published_at).unwrap_or(now)));
    posts
}

/// 1-indexed page of `limit` posts; a page past the end is empty.
pub fn paginate(posts: &[FinalPost], page: usize, limit: usize) -> Vec<FinalPost> {
    let start = page.max(1).saturating_sub(1).saturating_mul(limit);
    posts.iter().skip(start).take(limit).cloned().collect()
}

pub fn find_by_slug<'a>(posts: &'a [FinalPost], slug: &str) -> Option<&'a FinalPost> {
    posts.iter().find(|p| p.slug == slug)
}

pub fn filter_by_category(posts: &[FinalPost], category: &str) -> Vec<FinalPost> {
    let wanted = category.to_lowercase();
    posts
        .iter()
        .filter(|p| p.category.to_lowercase() == wanted)
        .cloned()
        .collect()
}

/// Post counts per category, in the order categories first appear.
pub fn categories(posts: &[FinalPost]) -> Vec<Category> {
    let mut order: Vec<Category> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for post in posts {
        match index.get(post.category.as_str()) {
            Some(&i) => order[i].count += 1,
            None => {
                index.insert(&post.category, order.len());
                order.push(Category {
                    name: post.category.clone(),
                    slug: category_slug(&post.category),
                    count: 1,
                });
            }
        }
    }

    order
}

pub fn featured(posts: &[FinalPost]) -> Vec<FinalPost> {
    posts
        .iter()
        .filter(|p| p.is_featured)
        .take(FEATURED_LIMIT)
        .cloned()
        .collect()
}

/// Case-insensitive substring match on title, content, category or author. A blank
/// query matches nothing.
pub fn search(posts: &[FinalPost], query: &str) -> Vec<FinalPost> {
    let q = query.trim().to_lowercase();
    if q.is_empty() {
        return Vec::new();
    }

    posts
        .iter()
        .filter(|p| {
            [&p.title, &p.content, &p.category, &p.author]
                .iter()
                .any(|field| field.to_lowercase().contains(&q))
        })
        .cloned()
        .collect()
}
