//! Archiver error abstractions.

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;

/// An error from processing a broker statistics payload.
#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    /// The payload was not valid JSON.
    #[error("malformed statistics payload: {0}")]
    Json(#[from] serde_json::Error),
    /// The payload did not contain the expected `brokers` object.
    #[error("statistics payload has no brokers object")]
    MissingBrokers,
}
