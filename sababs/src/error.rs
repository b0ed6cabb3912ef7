//! Error handling for the Audiobookshelf client.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AbsError>;

#[derive(Error, Debug)]
pub enum AbsError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("ABS rejected the API token")]
    AuthExpired,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("ABS API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("ABS error: {0}")]
    Other(String),
}

impl AbsError {
    /// Maps a non-success HTTP status to the matching error kind.
    pub fn from_status(status: u16, context: impl Into<String>) -> Self {
        match status {
            401 | 403 => Self::AuthExpired,
            404 => Self::NotFound(context.into()),
            _ => Self::Api {
                status,
                message: context.into(),
            },
        }
    }

    pub fn is_auth_error(&self) -> bool {
        matches!(self, AbsError::AuthExpired | AbsError::InvalidCredentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert!(matches!(AbsError::from_status(401, "x"), AbsError::AuthExpired));
        assert!(matches!(AbsError::from_status(403, "x"), AbsError::AuthExpired));
        assert!(matches!(AbsError::from_status(404, "x"), AbsError::NotFound(_)));
        assert!(matches!(
            AbsError::from_status(500, "x"),
            AbsError::Api { status: 500, .. }
        ));
    }
}
