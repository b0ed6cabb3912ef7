use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use sababs::AbsError;
use sabcache::CacheError;
use sabcontrol::ControlError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PlayerError>;

#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("No active playback session")]
    NoActiveSession,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Abs(#[from] AbsError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("Database error: {0}")]
    Db(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sabstore::rusqlite::Error> for PlayerError {
    fn from(e: sabstore::rusqlite::Error) -> Self {
        PlayerError::Db(e.to_string())
    }
}

impl IntoResponse for PlayerError {
    fn into_response(self) -> Response {
        let status = match &self {
            PlayerError::NoActiveSession | PlayerError::NotFound(_) => StatusCode::NOT_FOUND,
            PlayerError::UnknownDevice(_) => StatusCode::BAD_REQUEST,
            PlayerError::Abs(AbsError::AuthExpired | AbsError::InvalidCredentials) => {
                StatusCode::UNAUTHORIZED
            }
            PlayerError::Abs(AbsError::NotFound(_)) => StatusCode::NOT_FOUND,
            PlayerError::Control(_) => StatusCode::BAD_GATEWAY,
            PlayerError::Cache(CacheError::Cancelled) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            PlayerError::NoActiveSession.into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            PlayerError::UnknownDevice("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            PlayerError::Abs(AbsError::AuthExpired).into_response().status(),
            StatusCode::UNAUTHORIZED
        );
    }
}
