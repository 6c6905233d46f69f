//! Follow a space's geoawareness feed and print every snapshot and
//! connection change.

use anyhow::Result;
use clap::Parser;
use std::time::Duration;

use geoaware_cli::{init_tracing, report};
use geoaware_client::{ClientConfig, ClientEvent, GeoawarenessClient};

/// Flags override the GEOAWARE_* environment.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Space to watch
    #[arg(long)]
    space: Option<String>,

    /// WebSocket feed URL
    #[arg(long)]
    stream_url: Option<String>,

    /// Zones endpoint used after live retries run out
    #[arg(long)]
    fallback_url: Option<String>,

    /// Bearer token
    #[arg(long)]
    token: Option<String>,

    #[arg(long)]
    max_retries: Option<u32>,

    /// Base reconnect delay in milliseconds
    #[arg(long)]
    base_delay_ms: Option<u64>,

    #[arg(long)]
    no_fallback: bool,

    /// Print snapshots as canonical JSON instead of a summary line
    #[arg(long)]
    json: bool,

    /// Exit after this many snapshots
    #[arg(long)]
    count: Option<usize>,
}

impl Args {
    fn into_config(self) -> ClientConfig {
        let mut config = ClientConfig::from_env();
        if let Some(space) = self.space {
            config.space_id = space;
        }
        if let Some(url) = self.stream_url {
            config.stream_url = url;
        }
        if let Some(url) = self.fallback_url {
            config.fallback_url = url;
        }
        if self.token.is_some() {
            config = config.with_auth_token(self.token);
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
        if let Some(ms) = self.base_delay_ms {
            config.base_delay = Duration::from_millis(ms);
        }
        if self.no_fallback {
            config.fallback_enabled = false;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(&["watch_space=info", "geoaware_client=info"])?;
    let args = Args::parse();
    let json = args.json;
    let limit = args.count;
    let config = args.into_config();

    tracing::info!("Watching space {} on {}", config.space_id, config.stream_url);
    let client = GeoawarenessClient::spawn(config)?;
    let mut events = client.subscribe();
    client.connect();

    let mut snapshots = 0usize;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                match &event {
                    ClientEvent::Snapshot(snapshot) if json => {
                        println!("{}", serde_json::to_string(snapshot.as_ref())?);
                    }
                    _ => println!("{}", report::describe_event(&event)),
                }
                if matches!(event, ClientEvent::Snapshot(_)) {
                    snapshots += 1;
                    if limit.is_some_and(|limit| snapshots >= limit) {
                        break;
                    }
                }
            }
        }
    }

    let telemetry = client.telemetry();
    client.shutdown().await;
    tracing::info!("Stopped: {}", report::describe_telemetry(&telemetry));
    Ok(())
}
