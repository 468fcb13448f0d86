//! Error types for chatvault.
//!
//! The top-level taxonomy every layer maps onto, with recovery suggestions
//! for user-facing output.

use thiserror::Error;

/// Result type alias using chatvault's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for chatvault.
#[derive(Error, Debug)]
pub enum Error {
    /// Unknown session or message reference
    #[error("Not found: {0}")]
    NotFound(String),

    /// Name collision (e.g. import without overwrite)
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Malformed policy or configuration values
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Malformed or inconsistent checkpoint
    #[error("Validation failed: {0}")]
    Validation(String),

    /// External dependency (e.g. AI summarization) unavailable
    #[error("Dependency failure: {0}")]
    Dependency(String),

    /// Operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Error::NotFound(_) => Some("Use 'chatvault session list' to see available sessions"),
            Error::AlreadyExists(_) => {
                Some("Pass --overwrite to replace it, or --name to import under another name")
            }
            Error::InvalidConfiguration(_) => {
                Some("Check your config file at ~/.config/chatvault/config.toml")
            }
            Error::Validation(_) => {
                Some("Run 'chatvault session validate <file>' to inspect the checkpoint")
            }
            Error::Database(_) => Some("Check that the session database is not locked or corrupt"),
            _ => None,
        }
    }
}

/// Format an error with its recovery suggestion.
pub fn format_error_with_suggestion(error: &Error) -> String {
    let mut output = error.to_string();
    if let Some(suggestion) = error.recovery_suggestion() {
        output.push_str(&format!("\n  Suggestion: {}", suggestion));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_exists_has_suggestion() {
        let err = Error::AlreadyExists("session 'demo'".to_string());
        assert!(err.to_string().contains("demo"));
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_format_with_suggestion() {
        let err = Error::NotFound("session 'missing'".to_string());
        let formatted = format_error_with_suggestion(&err);
        assert!(formatted.contains("missing"));
        assert!(formatted.contains("Suggestion:"));
    }

    #[test]
    fn test_cancelled_has_no_suggestion() {
        assert!(Error::Cancelled.recovery_suggestion().is_none());
    }
}
