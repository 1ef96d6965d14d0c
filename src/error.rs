use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The service-account exchange failed or returned no token.
    #[error("Auth error: {0}")]
    Auth(String),

    /// The store answered a range operation with a non-success status.
    #[error("Remote store error ({status}): {body}")]
    RemoteStore { status: u16, body: String },

    #[error("Failed to fetch feed '{source_name}': {message}")]
    FeedFetch {
        source_name: String,
        message: String,
    },

    /// A post list rebuild failed; shared with callers that waited on it.
    #[error("Post refresh failed: {0}")]
    Refresh(String),

    #[error("Malformed row {row}: {reason}")]
    MalformedRow { row: usize, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn malformed(row: usize, reason: impl Into<String>) -> Self {
        Error::MalformedRow {
            row,
            reason: reason.into(),
        }
    }

    pub fn feed_fetch(source_name: &str, err: impl std::fmt::Display) -> Self {
        Error::FeedFetch {
            source_name: source_name.to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_store_error_carries_body() {
        let err = Error::RemoteStore {
            status: 403,
            body: "PERMISSION_DENIED".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("403"));
        assert!(msg.contains("PERMISSION_DENIED"));
    }

    #[test]
    fn test_malformed_helper() {
        let err = Error::malformed(7, "missing column 13");
        assert!(matches!(err, Error::MalformedRow { row: 7, .. }));
        assert_eq!(err.to_string(), "Malformed row 7: missing column 13");
    }

    #[test]
    fn test_feed_fetch_helper() {
        let err = Error::feed_fetch("Wire", "connection refused");
        assert_eq!(
            err.to_string(),
            "Failed to fetch feed 'Wire': connection refused"
        );
    }
}
