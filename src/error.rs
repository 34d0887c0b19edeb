//! Error taxonomy
//!
//! Configuration errors are fatal at bootstrap, validation errors are fatal to a
//! single query, adapter errors are passed through untouched. A read of an
//! absent key is not an error anywhere in the crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad schema, unknown function, missing primary key on an indexed table.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Unresolved primary key on write, malformed arguments to a set-style operator.
    #[error("validation error: {0}")]
    Validation(String),

    /// Backend I/O failure, never retried by the engine.
    #[error("{0}")]
    Adapter(Box<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Wrap any backend error so it surfaces verbatim.
    pub fn adapter<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error::Adapter(err.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Adapter(Box::new(err))
    }
}
