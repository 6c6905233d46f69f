//! Geoawareness CLI - operator tools for the geoawareness stack.
//!
//! Binaries:
//! - watch_space: follow a space's live feed and print snapshots/telemetry
//! - resolve_denial: classify plan volumes against a denial payload

pub mod report;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the fmt subscriber on stderr. `RUST_LOG` is honored; `directives`
/// are added on top of it.
pub fn init_tracing(directives: &[&str]) -> Result<()> {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in directives {
        filter = filter.add_directive(directive.parse()?);
    }
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()?;
    Ok(())
}
