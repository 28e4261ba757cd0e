//! Typed errors for the collection library.
//!
//! Uses `thiserror` for library errors (not `anyhow`) to provide
//! strongly-typed, composable error handling.

use thiserror::Error;

/// Errors that can occur while collecting records from a data source.
#[derive(Debug, Error)]
pub enum CollectError {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Invalid URL format
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    /// Upstream returned a non-success status
    #[error("unexpected status {status} from {url}")]
    BadStatus { status: u16, url: String },

    /// The configured data path selected nothing in the response
    #[error("data path not found: {path}")]
    DataPathMissing { path: String },

    /// Source database access failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Only MySQL (3306) and PostgreSQL (5432) ports are dispatched
    #[error("unsupported database port: {port}")]
    UnsupportedDatabasePort { port: u16 },

    /// Headless browser failure
    #[error("browser error: {0}")]
    Browser(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A CSS selector in the source config does not parse
    #[error("invalid selector: {selector}")]
    InvalidSelector { selector: String },

    /// Manually supplied cookies no longer authenticate the session
    #[error("cookies expired for {host}, re-supply cookies")]
    SessionExpired { host: String },

    /// Login action sequence did not reach the logged-in state
    #[error("login failed for {host}: {reason}")]
    LoginFailed { host: String, reason: String },

    /// A required piece of source configuration is absent
    #[error("missing config: {0}")]
    MissingConfig(&'static str),

    /// No collector registered for the requested type tag
    #[error("unsupported collector type: {0}")]
    UnsupportedType(String),

    /// Operation was cancelled
    #[error("collection cancelled")]
    Cancelled,
}

/// Errors that can occur while processing collected records.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Regex rule carries an unparseable pattern
    #[error("invalid pattern in rule {rule}: {source}")]
    Pattern {
        rule: String,
        #[source]
        source: regex::Error,
    },

    /// Date rule could not parse the value with any known format
    #[error("unparseable date: {value}")]
    UnparseableDate { value: String },

    /// Number rule could not parse the value as a float
    #[error("unparseable number: {value}")]
    UnparseableNumber { value: String },

    /// Email rule rejected the value
    #[error("invalid email address: {value}")]
    InvalidEmail { value: String },

    /// Phone rule rejected the value (digit count must be 11)
    #[error("invalid phone number length: {value}")]
    InvalidPhone { value: String },

    /// field_based deduplication requires at least one field
    #[error("field_based deduplication requires fields")]
    NoDedupFields,

    /// Record could not be serialized for fingerprinting
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors that can occur while writing records to a sink.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure in the file sink
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Target database access failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Document store access failed
    #[error("mongodb error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    /// Records could not be converted to BSON documents
    #[error("bson error: {0}")]
    Bson(#[from] bson::ser::Error),

    /// Every row insert failed; nothing was stored
    #[error("all {count} inserts failed")]
    AllInsertsFailed { count: usize },

    /// Records could not be serialized
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// No sink registered for the requested target tag
    #[error("unsupported storage target: {0}")]
    UnsupportedTarget(String),

    /// Operation was cancelled
    #[error("store cancelled")]
    Cancelled,
}

/// Result type alias for collector operations.
pub type CollectResult<T> = std::result::Result<T, CollectError>;

/// Result type alias for processor operations.
pub type ProcessResult<T> = std::result::Result<T, ProcessError>;

/// Result type alias for sink operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
