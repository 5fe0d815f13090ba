use thiserror::Error;

use crate::postgres::decoder::DecodeError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    /// Retryable errors keep the session alive: the operation is re-attempted
    /// with backoff and the ack cursor is held. Everything else tears the
    /// session down and reconnects from the slot position.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Catalog(_) | Error::Persistence(_) | Error::Io(_) | Error::Connection(_)
        )
    }

    /// Protocol violations must never be swallowed: no ack, reconnect.
    pub fn is_protocol_fatal(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::Decode(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
