//! Closed error taxonomy for the ingestion pipeline.
//!
//! Internal boundaries (connection, subscription, price query) return
//! `Result<T, IngestError>` so callers can branch on the failure kind.
//! Task bodies convert everything else into `anyhow::Error` and log-and-continue
//! rather than propagate, per the pipeline's error handling design.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("no active endpoint available")]
    NoEndpoint,

    #[error("circuit breaker open for {program_id}")]
    CircuitOpen { program_id: String },

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    #[error("subscription {0} not found")]
    SubscriptionNotFound(u64),

    #[error("pending request {0} not found")]
    PendingNotFound(u64),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("upstream rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("no price available for {mint}")]
    NoPriceAvailable { mint: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IngestError>;
