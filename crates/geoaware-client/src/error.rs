//! Client error taxonomy.

use thiserror::Error;

/// Errors surfaced to subscribers. Cloneable so one error can be delivered
/// to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// Connection refused, dropped or failed mid-stream
    #[error("Transport error: {0}")]
    Transport(String),
    /// A live message could not be normalized
    #[error("Parse error: {0}")]
    Parse(String),
    /// The one-shot fallback fetch failed
    #[error("Fallback fetch failed: {0}")]
    Fallback(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
}
