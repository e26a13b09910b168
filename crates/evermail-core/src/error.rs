//! Error types shared across the Evermail workspace.

use thiserror::Error;

/// Workspace-wide result alias.
pub type Result<T> = std::result::Result<T, EvermailError>;

/// Top-level error for engine, store, and config failures.
#[derive(Debug, Error)]
pub enum EvermailError {
    /// Missing or invalid configuration. Fails the whole tick for the
    /// affected schedule — never partially applied.
    #[error("config: {0}")]
    Config(String),

    /// Job store (SQLite or other adapter) failure.
    #[error("store: {0}")]
    Store(String),

    /// Transport-level failure outside a delivery attempt (e.g. building
    /// the SMTP client). Per-attempt failures use [`DeliveryError`].
    #[error("transport: {0}")]
    Transport(String),

    /// Malformed input at an adapter boundary (bad email, unknown
    /// timezone, unknown status string).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Outcome of a single delivery attempt against a provider.
///
/// Transient errors go through retry/backoff up to `max_attempts`;
/// permanent errors suppress the recipient immediately.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Network failure, provider 5xx, or an explicit rate-limit signal.
    #[error("transient: {0}")]
    Transient(String),

    /// Invalid address, synchronous hard bounce, or suppressed recipient.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, DeliveryError::Permanent(_))
    }
}
