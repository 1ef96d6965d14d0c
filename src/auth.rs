//! Bearer credentials for the remote store.
//!
//! A [`TokenSource`] performs the actual credential exchange; [`TokenCache`] sits in
//! front of it and hands out the cached token until it is close to expiry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::Credentials;
use crate::error::{Error, Result};

pub const SCOPE_READONLY: &str = "https://www.googleapis.com/auth/spreadsheets.readonly";
pub const SCOPE_READ_WRITE: &str = "https://www.googleapis.com/auth/spreadsheets";

/// A cached token is reused only while more than this much lifetime remains.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

const DEFAULT_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now + chrono::Duration::seconds(REFRESH_MARGIN.as_secs() as i64)
    }
}

#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<AccessToken>;
}

pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    cached: Mutex<Option<AccessToken>>,
}

impl TokenCache {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
        }
    }

    /// Returns a bearer token, exchanging for a new one when the cached token is
    /// missing or within [`REFRESH_MARGIN`] of expiry. The lock is held across the
    /// exchange so concurrent callers share a single request.
    pub async fn bearer(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.is_fresh_at(Utc::now()) {
                return Ok(token.token.clone());
            }
        }

        debug!("Access token missing or near expiry, exchanging");
        let fresh = self.source.fetch_token().await?;
        if fresh.token.is_empty() {
            return Err(Error::Auth("credential exchange returned no token".into()));
        }

        let bearer = fresh.token.clone();
        *cached = Some(fresh);
        Ok(bearer)
    }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<i64>,
}

/// OAuth2 JWT-bearer exchange for a service account.
pub struct ServiceAccountTokenSource {
    client: Client,
    credentials: Credentials,
    scope: String,
    token_uri: String,
}

impl ServiceAccountTokenSource {
    pub fn new(client: Client, credentials: Credentials, scope: &str, token_uri: &str) -> Self {
        Self {
            client,
            credentials,
            scope: scope.to_string(),
            token_uri: token_uri.to_string(),
        }
    }

    fn assertion(&self, now: DateTime<Utc>) -> Result<String> {
        let key = EncodingKey::from_rsa_pem(self.credentials.private_key.as_bytes())
            .map_err(|e| Error::Auth(format!("invalid private key: {}", e)))?;

        let iat = now.timestamp();
        let claims = Claims {
            iss: &self.credentials.client_email,
            scope: &self.scope,
            aud: &self.token_uri,
            iat,
            exp: iat + DEFAULT_LIFETIME_SECS,
        };

        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| Error::Auth(format!("failed to sign assertion: {}", e)))
    }
}

#[async_trait]
impl TokenSource for ServiceAccountTokenSource {
    async fn fetch_token(&self) -> Result<AccessToken> {
        let now = Utc::now();
        let assertion = self.assertion(now)?;

        let response = self
            .client
            .post(&self.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::Auth(format!("token request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Auth(format!("token endpoint returned {}: {}", status, body)));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Auth(format!("unreadable token response: {}", e)))?;

        let token = body
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Auth("Failed to obtain access token".into()))?;

        let lifetime = body.expires_in.unwrap_or(DEFAULT_LIFETIME_SECS);
        info!("Obtained access token for {}", self.credentials.client_email);

        Ok(AccessToken {
            token,
            expires_at: now + chrono::Duration::seconds(lifetime),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_KEY: &str = include_str!("../tests/fixtures/service_account_key.pem");

    struct CountingSource {
        calls: AtomicUsize,
        lifetime: chrono::Duration,
    }

    impl CountingSource {
        fn new(lifetime: chrono::Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                lifetime,
            }
        }
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn fetch_token(&self) -> Result<AccessToken> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AccessToken {
                token: format!("tok-{}", n),
                expires_at: Utc::now() + self.lifetime,
            })
        }
    }

    mod token_cache_tests {
        use super::*;

        #[test]
        fn test_freshness_margin() {
            let now = Utc::now();
            let token = AccessToken {
                token: "t".into(),
                expires_at: now + chrono::Duration::minutes(6),
            };
            assert!(token.is_fresh_at(now));

            let token = AccessToken {
                token: "t".into(),
                expires_at: now + chrono::Duration::minutes(4),
            };
            assert!(!token.is_fresh_at(now));
        }

        #[tokio::test]
        async fn test_reuses_token_with_long_lifetime() {
            let source = Arc::new(CountingSource::new(chrono::Duration::hours(1)));
            let cache = TokenCache::new(source.clone());

            assert_eq!(cache.bearer().await.unwrap(), "tok-0");
            assert_eq!(cache.bearer().await.unwrap(), "tok-0");
            assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn test_refetches_token_inside_margin() {
            // Every token is already within the five minute margin
            let source = Arc::new(CountingSource::new(chrono::Duration::minutes(2)));
            let cache = TokenCache::new(source.clone());

            assert_eq!(cache.bearer().await.unwrap(), "tok-0");
            assert_eq!(cache.bearer().await.unwrap(), "tok-1");
            assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        }

        #[tokio::test]
        async fn test_concurrent_callers_share_exchange() {
            let source = Arc::new(CountingSource::new(chrono::Duration::hours(1)));
            let cache = Arc::new(TokenCache::new(source.clone()));

            let (a, b) = tokio::join!(cache.bearer(), cache.bearer());
            assert_eq!(a.unwrap(), b.unwrap());
            assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn test_empty_token_is_auth_error() {
            let cache = TokenCache::new(Arc::new(EmptySource));

            let result = cache.bearer().await;
            assert!(matches!(result, Err(Error::Auth(_))));
        }

        struct EmptySource;

        #[async_trait]
        impl TokenSource for EmptySource {
            async fn fetch_token(&self) -> Result<AccessToken> {
                Ok(AccessToken {
                    token: String::new(),
                    expires_at: Utc::now() + chrono::Duration::hours(1),
                })
            }
        }
    }

    mod service_account_tests {
        use super::*;

        fn credentials(key: &str) -> Credentials {
            Credentials {
                client_email: "ingest@example.iam.gserviceaccount.com".into(),
                private_key: key.into(),
            }
        }

        #[tokio::test]
        async fn test_exchange_success() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/token"))
                .and(body_string_contains("grant-type%3Ajwt-bearer"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "access_token": "ya29.test",
                    "expires_in": 3599,
                    "token_type": "Bearer"
                })))
                .expect(1)
                .mount(&server)
                .await;

            let source = ServiceAccountTokenSource::new(
                Client::new(),
                credentials(TEST_KEY),
                SCOPE_READONLY,
                &format!("{}/token", server.uri()),
            );

            let token = source.fetch_token().await.unwrap();
            assert_eq!(token.token, "ya29.test");
            assert!(token.expires_at > Utc::now() + chrono::Duration::minutes(59));
        }

        #[tokio::test]
        async fn test_missing_expiry_defaults_to_one_hour() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/token"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_json(serde_json::json!({ "access_token": "ya29.noexp" })),
                )
                .mount(&server)
                .await;

            let source = ServiceAccountTokenSource::new(
                Client::new(),
                credentials(TEST_KEY),
                SCOPE_READ_WRITE,
                &format!("{}/token", server.uri()),
            );

            let token = source.fetch_token().await.unwrap();
            let remaining = token.expires_at - Utc::now();
            assert!(remaining > chrono::Duration::minutes(55));
            assert!(remaining <= chrono::Duration::hours(1));
        }

        #[tokio::test]
        async fn test_response_without_token_is_auth_error() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/token"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
                .mount(&server)
                .await;

            let source = ServiceAccountTokenSource::new(
                Client::new(),
                credentials(TEST_KEY),
                SCOPE_READONLY,
                &format!("{}/token", server.uri()),
            );

            let result = source.fetch_token().await;
            assert!(matches!(result, Err(Error::Auth(_))));
        }

        #[tokio::test]
        async fn test_rejected_exchange_is_auth_error() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/token"))
                .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
                .mount(&server)
                .await;

            let source = ServiceAccountTokenSource::new(
                Client::new(),
                credentials(TEST_KEY),
                SCOPE_READONLY,
                &format!("{}/token", server.uri()),
            );

            match source.fetch_token().await {
                Err(Error::Auth(msg)) => assert!(msg.contains("invalid_grant")),
                other => panic!("expected auth error, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_invalid_key_fails_before_network() {
            let source = ServiceAccountTokenSource::new(
                Client::new(),
                credentials("not a pem"),
                SCOPE_READONLY,
                "http://127.0.0.1:9/token",
            );

            let result = source.fetch_token().await;
            assert!(matches!(result, Err(Error::Auth(_))));
        }
    }
}
