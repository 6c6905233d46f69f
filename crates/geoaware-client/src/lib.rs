//! Streaming client for the geoawareness feed: live WebSocket stream with
//! exponential reconnect and a one-shot HTTP fallback.

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod fallback;
pub mod machine;
pub mod transport;

pub use backoff::ReconnectBackoff;
pub use client::{ClientEvent, GeoawarenessClient, Subscription};
pub use config::ClientConfig;
pub use error::ClientError;
pub use machine::{Action, ConnectionMachine, RetryPolicy};
