//! Error taxonomy.
//!
//! Only [`CcxwError::Config`] is ever surfaced from [`crate::Facade::new`].
//! Everything else is recovered locally: transient network failures are
//! logged and retried by the transport, sequence gaps are resolved by
//! snapshot resync, and auth failures feed into
//! `Facade::is_connections_ok()` once the staleness window elapses. The
//! decode path itself never returns a `Result` to its caller — see
//! `Adapter::decode`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CcxwError>;

#[derive(Debug, Error)]
pub enum CcxwError {
    /// Unsupported exchange/endpoint/interval/symbol, malformed stream list,
    /// an out-of-range bound, or too many streams for the venue. Fatal,
    /// surfaced only from `Facade::new`.
    #[error("configuration error: {0}")]
    Config(String),

    /// A REST call, WebSocket read/write, or JSON decode failed. Logged by
    /// the caller and never propagated to the consumer.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Kucoin bullet-public token issuance failed. Retried internally;
    /// surfaced indirectly via `Facade::is_connections_ok()`.
    #[error("auth/token error: {0}")]
    AuthOrToken(String),

    /// A background worker did not join within its shutdown deadline.
    #[error("worker did not shut down within {0:?}")]
    ShutdownTimeout(std::time::Duration),
}

impl From<reqwest::Error> for CcxwError {
    fn from(err: reqwest::Error) -> Self {
        CcxwError::TransientNetwork(err.to_string())
    }
}

impl From<serde_json::Error> for CcxwError {
    fn from(err: serde_json::Error) -> Self {
        CcxwError::TransientNetwork(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CcxwError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        CcxwError::TransientNetwork(err.to_string())
    }
}
