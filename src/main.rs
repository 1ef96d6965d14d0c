use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sheet_news::auth::{ServiceAccountTokenSource, TokenCache, SCOPE_READONLY, SCOPE_READ_WRITE};
use sheet_news::cache::PostCache;
use sheet_news::config::{check_env, Config, Credentials};
use sheet_news::ingest::{start_background_ingest, Ingestor};
use sheet_news::news::NewsService;
use sheet_news::routes::{self, AppState};
use sheet_news::sheets::{SheetsClient, TabularStore};

const DEFAULT_CONFIG_PATH: &str = "sheet-news.toml";

fn load_config() -> anyhow::Result<Config> {
    let path = std::env::var("SHEET_NEWS_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    let config = if std::path::Path::new(&path).exists() {
        info!("Loading configuration from {}", path);
        Config::load(&path)?
    } else {
        info!("No configuration file at {}, using defaults", path);
        Config::from_str("")?
    };

    config.apply_env()
}

/// A Sheets client whose tokens carry `scope`.
fn sheets_store(client: &Client, config: &Config, credentials: &Credentials, scope: &str) -> Arc<dyn TabularStore> {
    let source = ServiceAccountTokenSource::new(
        client.clone(),
        credentials.clone(),
        scope,
        &config.sheets.token_uri,
    );
    let tokens = Arc::new(TokenCache::new(Arc::new(source)));

    Arc::new(SheetsClient::new(
        client.clone(),
        &config.sheets.api_base,
        &config.sheets.spreadsheet_id,
        tokens,
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sheet_news=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let command = std::env::args().nth(1).unwrap_or_else(|| "serve".to_string());

    if command == "check-env" {
        for (name, present) in check_env() {
            println!("{} exists: {}", name, present);
        }
        return Ok(());
    }

    let config = load_config()?;
    let credentials = Credentials::from_env()?;

    let client = Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_secs))
        .user_agent("SheetNews/1.0 (RSS Ingest)")
        .build()?;

    let ingestor = Arc::new(Ingestor::new(
        client.clone(),
        sheets_store(&client, &config, &credentials, SCOPE_READ_WRITE),
        config.sheets.clone(),
        config.max_items_per_source,
    ));

    match command.as_str() {
        "ingest" => {
            let report = ingestor.run().await?;
            info!("Ingestion report: {:?}", report);
            Ok(())
        }
        "serve" => serve(config, client, credentials, ingestor).await,
        other => {
            error!("Unknown command '{}'", other);
            anyhow::bail!("usage: sheet-news [serve|ingest|check-env]")
        }
    }
}

async fn serve(
    config: Config,
    client: Client,
    credentials: Credentials,
    ingestor: Arc<Ingestor>,
) -> anyhow::Result<()> {
    let store = sheets_store(&client, &config, &credentials, SCOPE_READONLY);
    let cache = Arc::new(PostCache::new(
        store,
        &config.sheets.posts_range,
        Duration::from_secs(config.cache_ttl_secs),
    ));

    // Start scheduled ingestion if configured
    if let Some(minutes) = config.ingest_interval_minutes {
        let bg_ingestor = ingestor.clone();
        tokio::spawn(async move {
            start_background_ingest(bg_ingestor, minutes).await;
        });
        info!("Scheduled ingestion every {} minutes", minutes);
    }

    let state = Arc::new(AppState {
        news: Arc::new(NewsService::new(cache)),
        ingestor,
    });

    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!("Server starting on http://{}", config.listen_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
