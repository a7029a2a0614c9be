//! Custom error types for replisearch

use thiserror::Error;

/// Main error type for replisearch operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The search index could not be reached (refused, timed out, unavailable).
    #[error("Search index unavailable: {0}")]
    IndexUnavailable(String),

    /// The search index answered but rejected the request.
    #[error("Search index error: {0}")]
    Index(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Table not found in catalog: {0}")]
    TableNotFound(String),

    #[error("No primary key could be resolved for {0}")]
    MissingPrimaryKey(String),

    #[error("Search error: {0}")]
    Search(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when the error means the search index is unreachable rather than
    /// misused. Only these errors trip the index circuit breaker.
    pub fn is_connectivity(&self) -> bool {
        match self {
            Error::IndexUnavailable(_) => true,
            Error::Http(err) => is_transport_error(err),
            _ => false,
        }
    }
}

/// Classify a reqwest error as a transport failure (no usable HTTP answer).
pub fn is_transport_error(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout() || (err.is_request() && err.status().is_none())
}

/// Result type alias for replisearch
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_classification() {
        assert!(Error::IndexUnavailable("refused".into()).is_connectivity());
        assert!(!Error::Index("mapper_parsing_exception".into()).is_connectivity());
        assert!(!Error::Catalog("bad key".into()).is_connectivity());
        assert!(!Error::TableNotFound("main.people".into()).is_connectivity());
    }
}
