//! Classify a plan's operation volumes against an authorization denial.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use geoaware_cli::{init_tracing, report};
use geoaware_core::{resolve, try_parse_denial};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Denial payload file ("-" for stdin)
    #[arg(long)]
    denial: PathBuf,

    /// Operation volumes: a JSON list or a plan object carrying one
    #[arg(long)]
    volumes: PathBuf,

    /// Last geoawareness snapshot or feed message, used for zone lookup
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Space id assumed when the snapshot file does not carry one
    #[arg(long, default_value = "local")]
    space: String,

    /// Pretty-print the report
    #[arg(long)]
    pretty: bool,
}

fn main() -> Result<()> {
    init_tracing(&["resolve_denial=info", "geoaware_core=warn"])?;
    let args = Args::parse();

    let volumes = report::parse_volumes(&report::read_input(&args.volumes)?)?;
    let snapshot = args
        .snapshot
        .as_deref()
        .map(|path| report::parse_snapshot(&report::read_input(path)?, &args.space))
        .transpose()?;

    let payload = report::read_input(&args.denial)?;
    let denial = try_parse_denial(&payload).unwrap_or_else(|err| {
        tracing::warn!("Denial payload not understood ({}), flagging every volume", err);
        Default::default()
    });

    let report = resolve(&volumes, &denial, snapshot.as_ref());
    tracing::info!(
        "{} of {} volumes conflicting ({:?})",
        report.conflicting_ordinals().len(),
        volumes.len(),
        report.policy
    );

    let document = report::report_document(&report, denial.withdrawn_reason.as_deref());
    let output = if args.pretty {
        serde_json::to_string_pretty(&document)
    } else {
        serde_json::to_string(&document)
    }
    .context("Failed to encode report")?;
    println!("{}", output);
    Ok(())
}
