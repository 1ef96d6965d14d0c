use serde::Deserialize;
use std::path::Path;

pub const ENV_SERVICE_ACCOUNT_EMAIL: &str = "GOOGLE_SERVICE_ACCOUNT_EMAIL";
pub const ENV_PRIVATE_KEY: &str = "GOOGLE_PRIVATE_KEY";
pub const ENV_SHEET_ID: &str = "GOOGLE_SHEET_ID";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// How long a materialized post list is reused, in seconds
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_max_items_per_source")]
    pub max_items_per_source: usize,
    /// Ingestion interval in minutes; no scheduled ingestion when unset
    #[serde(default)]
    pub ingest_interval_minutes: Option<u64>,
    #[serde(default)]
    pub sheets: SheetsConfig,
}

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_max_items_per_source() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct SheetsConfig {
    #[serde(default)]
    pub spreadsheet_id: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default = "default_sources_range")]
    pub sources_range: String,
    #[serde(default = "default_raw_urls_range")]
    pub raw_urls_range: String,
    #[serde(default = "default_raw_ids_range")]
    pub raw_ids_range: String,
    #[serde(default = "default_raw_append_range")]
    pub raw_append_range: String,
    #[serde(default = "default_posts_range")]
    pub posts_range: String,
}

impl Default for SheetsConfig {
    fn default() -> Self {
        Self {
            spreadsheet_id: String::new(),
            api_base: default_api_base(),
            token_uri: default_token_uri(),
            sources_range: default_sources_range(),
            raw_urls_range: default_raw_urls_range(),
            raw_ids_range: default_raw_ids_range(),
            raw_append_range: default_raw_append_range(),
            posts_range: default_posts_range(),
        }
    }
}

fn default_api_base() -> String {
    "https://sheets.googleapis.com".to_string()
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_sources_range() -> String {
    "SOURCES!A2:E".to_string()
}

fn default_raw_urls_range() -> String {
    "RAW_NEWS!D2:D".to_string()
}

fn default_raw_ids_range() -> String {
    "RAW_NEWS!A2:A".to_string()
}

fn default_raw_append_range() -> String {
    "RAW_NEWS!A:H".to_string()
}

fn default_posts_range() -> String {
    "FINAL_BLOGS!A2:Q".to_string()
}

/// Service-account credentials read from the environment.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub client_email: String,
    pub private_key: String,
}

impl Credentials {
    /// Reads the service-account email and PEM key. Escaped `\n` sequences in the
    /// key are turned into real newlines, the way keys are usually stored in `.env`.
    pub fn from_env() -> anyhow::Result<Self> {
        let client_email = std::env::var(ENV_SERVICE_ACCOUNT_EMAIL)
            .map_err(|_| anyhow::anyhow!("{} is missing", ENV_SERVICE_ACCOUNT_EMAIL))?;
        let private_key = std::env::var(ENV_PRIVATE_KEY)
            .map_err(|_| anyhow::anyhow!("{} is missing", ENV_PRIVATE_KEY))?;

        Ok(Self {
            client_email,
            private_key: unescape_key(&private_key),
        })
    }
}

pub fn unescape_key(raw: &str) -> String {
    raw.replace("\\n", "\n")
}

/// Presence of each required environment variable, never the values.
pub fn check_env() -> Vec<(&'static str, bool)> {
    [ENV_PRIVATE_KEY, ENV_SERVICE_ACCOUNT_EMAIL, ENV_SHEET_ID]
        .into_iter()
        .map(|name| {
            let present = std::env::var(name).map(|v| !v.is_empty()).unwrap_or(false);
            (name, present)
        })
        .collect()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse config from a TOML string (useful for testing)
    pub fn from_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.ingest_interval_minutes == Some(0) {
            anyhow::bail!("ingest_interval_minutes must be at least 1");
        }
        Ok(())
    }

    /// Lets `GOOGLE_SHEET_ID` override the file, then checks a spreadsheet is set.
    pub fn apply_env(mut self) -> anyhow::Result<Self> {
        if let Ok(id) = std::env::var(ENV_SHEET_ID) {
            if !id.trim().is_empty() {
                self.sheets.spreadsheet_id = id.trim().to_string();
            }
        }

        if self.sheets.spreadsheet_id.is_empty() {
            anyhow::bail!("{} is missing", ENV_SHEET_ID);
        }
        Ok(self)
    }
}
