//! Error types shared across the crate.

/// Errors surfaced by parsing, validation, storage and the crawl pipeline.
///
/// Malformed individual input lines are never represented here: the event
/// parser recovers from them silently (forgiving-parser contract). Soft
/// crawl outcomes (missing or invalid summaries) are counted in the crawl
/// report rather than raised.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Structurally inconsistent summary or ambiguous environment/group
    /// resolution. Blocks the single operation that triggered it.
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// A store read/write failed. The transaction it belonged to was rolled
    /// back; prior state is intact.
    #[error("store error: {message}")]
    Store { message: String },

    /// A schema migration step failed. The backend must not be used.
    #[error("migration failed: {message}")]
    Migration { message: String },

    /// Transport failure or unexpected HTTP status.
    #[error("network error: {message}")]
    Network { message: String },

    /// Remote payload could not be decoded.
    #[error("invalid response: {message}")]
    InvalidResponse { message: String },

    /// A job viewer link was in neither recognized address form.
    #[error("unsupported viewer link: {link}")]
    UnsupportedLink { link: String },

    /// Crawl or store configuration is unusable.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Local file I/O (event stream input, config files).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    pub fn migration(message: impl Into<String>) -> Self {
        Self::Migration {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Network {
            message: err.to_string(),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store {
            message: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Store {
            message: err.to_string(),
        }
    }
}

/// Result type for crate operations.
pub type Result<T> = std::result::Result<T, Error>;
