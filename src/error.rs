//! Error types shared across the pipeline.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Failed to read private key file '{0}': {1}")]
    PrivateKeyFileError(String, String),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration for {0}: {1}")]
    InvalidConfig(String, String),

    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(String),

    #[error("REST request failed with status {status}: {body}")]
    Rest { status: u16, body: String },

    #[error("Message parse error: {0}")]
    Parse(String),

    #[error("Persistence failed after {attempts} attempts: {source}")]
    PersistenceExhausted {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(err))
    }
}
