//! Error type shared by every BuffetApp operation.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PosError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("insufficient stock for product {product}: available {available}, requested {requested}")]
    InsufficientStock {
        product: String,
        available: i64,
        requested: i64,
    },

    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("remote error: {0}")]
    Remote(String),

    #[error("printer error: {0}")]
    Printer(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("lock poisoned: {0}")]
    Lock(String),
}

pub type PosResult<T> = Result<T, PosError>;

impl PosError {
    pub fn validation(msg: impl Into<String>) -> Self {
        PosError::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        PosError::NotFound(what.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        PosError::InvalidState(msg.into())
    }
}

impl<T> From<std::sync::PoisonError<T>> for PosError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        PosError::Lock(err.to_string())
    }
}

impl From<reqwest::Error> for PosError {
    fn from(err: reqwest::Error) -> Self {
        PosError::Remote(err.to_string())
    }
}

impl From<PosError> for String {
    fn from(err: PosError) -> Self {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_converts_to_string() {
        let msg: String = PosError::validation("fondo must be positive").into();
        assert_eq!(msg, "validation failed: fondo must be positive");
    }

    #[test]
    fn test_insufficient_stock_message_names_product() {
        let err = PosError::InsufficientStock {
            product: "Coca".into(),
            available: 1,
            requested: 3,
        };
        assert!(err.to_string().contains("Coca"));
        assert!(err.to_string().contains("requested 3"));
    }
}
