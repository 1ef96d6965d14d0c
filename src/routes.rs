use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::ingest::Ingestor;
use crate::news::{NewsService, DEFAULT_PAGE_SIZE};

const POSTS_PAGE_SIZE: usize = 18;

const CACHE_SHORT: &str = "public, s-maxage=60, stale-while-revalidate=120";
const CACHE_POST: &str = "public, s-maxage=60, stale-while-revalidate=300";
const CACHE_CATEGORIES: &str = "public, s-maxage=300, stale-while-revalidate=600";
const CACHE_NONE: &str = "no-cache, no-store, must-revalidate";

pub struct AppState {
    pub news: Arc<NewsService>,
    pub ingestor: Arc<Ingestor>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/posts", get(posts))
        .route("/api/news", get(news))
        .route("/api/post", get(post_by_slug))
        .route("/api/categories", get(categories))
        .route("/api/search", get(search))
        .route("/api/breaking", get(breaking))
        .route("/api/health", get(health))
        .route("/api/ingest", post(ingest))
        .route("/api/ingest/status", get(ingest_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Custom error type
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("Request failed: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "Internal Server Error",
                "message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        AppError(err.into())
    }
}

fn cached<T: Serialize>(cache_control: &'static str, body: T) -> Response {
    (
        [(header::CACHE_CONTROL, HeaderValue::from_static(cache_control))],
        Json(body),
    )
        .into_response()
}

/// A positive `limit` parameter truncates a list; anything else leaves it alone.
fn apply_limit<T>(mut items: Vec<T>, limit: Option<&str>) -> Vec<T> {
    if let Some(n) = limit.and_then(|l| l.trim().parse::<i64>().ok()) {
        if n > 0 {
            items.truncate(n as usize);
        }
    }
    items
}

#[derive(Deserialize)]
pub struct PageQuery {
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

pub async fn posts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse, AppError> {
    let page = query.page.unwrap_or(1);
    let limit = query.limit.unwrap_or(POSTS_PAGE_SIZE);
    let posts = state.news.published_posts(page, limit).await?;
    Ok(Json(posts))
}

#[derive(Deserialize)]
pub struct NewsQuery {
    pub category: Option<String>,
    pub limit: Option<String>,
}

pub async fn news(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NewsQuery>,
) -> Result<Response, AppError> {
    let posts = match query.category.as_deref().filter(|c| !c.is_empty()) {
        Some(category) => state.news.posts_by_category(category).await?,
        None => state.news.published_posts(1, DEFAULT_PAGE_SIZE).await?,
    };

    Ok(cached(CACHE_SHORT, apply_limit(posts, query.limit.as_deref())))
}

#[derive(Deserialize)]
pub struct SlugQuery {
    pub slug: Option<String>,
}

pub async fn post_by_slug(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SlugQuery>,
) -> Result<Response, AppError> {
    let Some(slug) = query.slug.filter(|s| !s.is_empty()) else {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Bad Request", "message": "Slug parameter is required" })),
        )
            .into_response());
    };

    match state.news.post_by_slug(&slug).await? {
        Some(post) => Ok(cached(CACHE_POST, post)),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "Not Found",
                "message": format!("Post with slug \"{}\" not found", slug),
            })),
        )
            .into_response()),
    }
}

pub async fn categories(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let categories = state.news.categories().await?;
    Ok(cached(CACHE_CATEGORIES, categories))
}

#[derive(Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
    pub limit: Option<String>,
}

pub async fn search(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Response, AppError> {
    let q = query.q.as_deref().unwrap_or("").trim();
    if q.is_empty() {
        return Ok(Json(Vec::<serde_json::Value>::new()).into_response());
    }

    let results = state.news.search_posts(q).await?;
    Ok(cached(CACHE_SHORT, apply_limit(results, query.limit.as_deref())))
}

pub async fn breaking(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    let post = state.news.breaking_news().await?;
    Ok(Json(post))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub version: String,
}

pub async fn health() -> Response {
    cached(
        CACHE_NONE,
        HealthResponse {
            status: "OK".to_string(),
            timestamp: Utc::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    )
}

pub async fn ingest(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let started = state.ingestor.spawn_run();

    (
        StatusCode::ACCEPTED,
        Json(json!({ "started": started, "running": true })),
    )
}

pub async fn ingest_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "running": state.ingestor.is_running() }))
}
