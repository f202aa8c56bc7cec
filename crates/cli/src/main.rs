//! rtpsrc command line tool
//!
//! Offline companion to the `rtpsrc-core` library:
//! - `resolve`: payload type (+ forced encoding name) to caps
//! - `tables`: dump the static or dynamic payload table
//! - `multicast`: classify an address
//! - `plan`: dry-run a session against the recording backend and print the
//!   resulting topology

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::time::timeout;
use tracing::debug;

use rtpsrc_core::logging::{self, LogFormat, LoggingConfig};
use rtpsrc_core::recording::RecordingBackend;
use rtpsrc_core::registry::{PayloadTypeEntry, DYNAMIC_PAYLOAD_TYPES, STATIC_PAYLOAD_TYPES};
use rtpsrc_core::{is_multicast, resolve, Caps, RtpSource, Settings, SourceEvent, UriHandler};

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect RTP payload types and session topologies", long_about = None)]
struct Args {
    /// Level for rtpsrc's own logs (RUST_LOG replaces the whole filter)
    #[arg(long, global = true, default_value = "warn", env = "RTPSRC_LOG_LEVEL")]
    log_level: String,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Include source file and line in log lines
    #[arg(long, global = true)]
    log_source: bool,

    /// Log span enter and exit
    #[arg(long, global = true)]
    log_spans: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve a payload type to caps
    Resolve {
        /// Payload type, 0-127
        #[arg(value_parser = clap::value_parser!(u8).range(0..128))]
        pt: u8,

        /// Forced encoding name
        #[arg(short, long)]
        encoding_name: Option<String>,
    },

    /// List the payload type tables in lookup order
    Tables {
        /// Show the dynamic (encoding name keyed) table instead
        #[arg(long)]
        dynamic: bool,

        #[arg(long)]
        json: bool,
    },

    /// Check whether an address is multicast
    Multicast { address: String },

    /// Assemble a session against the recording backend and print the topology
    Plan {
        /// rtp://host:port[?key=value...]
        uri: String,

        /// TOML settings applied before the URI
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Simulated branch as SSRC:PT, repeatable
        #[arg(short, long = "branch", value_parser = parse_branch)]
        branches: Vec<(u32, u8)>,

        #[arg(long)]
        json: bool,
    },
}

fn parse_branch(value: &str) -> std::result::Result<(u32, u8), String> {
    let (ssrc, pt) = value
        .split_once(':')
        .ok_or_else(|| format!("expected SSRC:PT, got '{}'", value))?;
    let ssrc = ssrc.parse().map_err(|e| format!("bad SSRC '{}': {}", ssrc, e))?;
    let pt: u8 = pt.parse().map_err(|e| format!("bad payload type '{}': {}", pt, e))?;
    if pt > 127 {
        return Err(format!("payload type {} out of range", pt));
    }
    Ok((ssrc, pt))
}

#[derive(Serialize)]
struct PortSummary {
    name: String,
    target: String,
    caps: Option<String>,
}

#[derive(Serialize)]
struct PlanSummary {
    settings: Settings,
    topology: Vec<String>,
    events: Vec<String>,
    ports: Vec<PortSummary>,
    defaulted_encoding_name: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let mut config = LoggingConfig::for_level(&args.log_level)?;
    if args.log_json {
        config.format = LogFormat::Json;
    }
    config.source_locations = args.log_source;
    config.spans = args.log_spans;
    logging::setup_logging(&config)?;
    debug!("rtpsrc v{} on rtpsrc-core v{}", env!("CARGO_PKG_VERSION"), rtpsrc_core::VERSION);

    match args.command {
        Command::Resolve { pt, encoding_name } => Ok(cmd_resolve(pt, encoding_name.as_deref())),
        Command::Tables { dynamic, json } => {
            cmd_tables(dynamic, json)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Multicast { address } => {
            let kind = if is_multicast(&address) { "multicast" } else { "unicast" };
            println!("{}: {}", address, kind);
            Ok(ExitCode::SUCCESS)
        }
        Command::Plan {
            uri,
            config,
            branches,
            json,
        } => {
            cmd_plan(&uri, config, &branches, json).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn cmd_resolve(pt: u8, encoding_name: Option<&str>) -> ExitCode {
    let resolution = resolve(pt, encoding_name);
    if let Some(name) = resolution.defaulted {
        println!("# no encoding name given, assumed {}", name);
    }
    match resolution.caps {
        Some(caps) => {
            println!("{}", caps);
            ExitCode::SUCCESS
        }
        None => {
            println!("not found");
            ExitCode::from(2)
        }
    }
}

fn cmd_tables(dynamic: bool, json: bool) -> Result<()> {
    let table: &[PayloadTypeEntry] = if dynamic {
        DYNAMIC_PAYLOAD_TYPES
    } else {
        STATIC_PAYLOAD_TYPES
    };

    if json {
        println!("{}", serde_json::to_string_pretty(table)?);
        return Ok(());
    }

    println!("{:>4}  {:<12} {:<6} {:>6}  params", "pt", "encoding", "media", "clock");
    for entry in table {
        let pt = entry
            .payload_type
            .map(|pt| pt.to_string())
            .unwrap_or_else(|| "-".to_string());
        let params: Vec<String> = entry
            .extra_params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        println!(
            "{:>4}  {:<12} {:<6} {:>6}  {}",
            pt,
            entry.encoding_name,
            entry.media.as_str(),
            entry.clock_rate,
            params.join(" ")
        );
    }
    Ok(())
}

async fn cmd_plan(uri: &str, config: Option<PathBuf>, branches: &[(u32, u8)], json: bool) -> Result<()> {
    let settings = match &config {
        Some(path) => Settings::from_toml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Settings::default(),
    };

    let backend = RecordingBackend::new();
    let source = RtpSource::with_settings(Arc::new(backend.clone()), settings);
    source.set_uri(uri).context("setting URI")?;

    let Some(mut events) = source.take_event_receiver() else {
        bail!("event receiver already taken");
    };

    source.start().await.context("starting session")?;

    for (ssrc, pt) in branches {
        let caps = source
            .request_pt_map(0, *pt)
            .unwrap_or_else(|| Caps::rtp().with("payload", i32::from(*pt)));
        backend.emit_media_branch(*ssrc, caps);
    }

    // Started, any defaulting notices, then one routing outcome per branch
    let mut seen = Vec::new();
    let mut routed = 0;
    while routed < branches.len() {
        match timeout(Duration::from_millis(500), events.recv()).await {
            Ok(Some(event)) => {
                if !matches!(
                    event,
                    SourceEvent::Started | SourceEvent::EncodingNameDefaulted { .. }
                ) {
                    routed += 1;
                }
                seen.push(event);
            }
            _ => break,
        }
    }
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }

    let summary = PlanSummary {
        settings: source.settings(),
        topology: backend.journal().iter().map(|e| e.to_string()).collect(),
        events: seen.iter().map(|e| format!("{:?}", e)).collect(),
        ports: source
            .ports()
            .into_iter()
            .map(|p| PortSummary {
                name: p.name,
                target: p.target.to_string(),
                caps: p.caps.map(|c| c.to_string()),
            })
            .collect(),
        defaulted_encoding_name: source.diagnostics().defaulted_encoding_name,
    };

    source.stop().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Topology:");
    for line in &summary.topology {
        println!("  {}", line);
    }
    if !summary.events.is_empty() {
        println!("Events:");
        for line in &summary.events {
            println!("  {}", line);
        }
    }
    println!("Ports:");
    if summary.ports.is_empty() {
        println!("  (none)");
    }
    for port in &summary.ports {
        println!(
            "  {} -> {} [{}]",
            port.name,
            port.target,
            port.caps.as_deref().unwrap_or("no caps")
        );
    }
    if let Some(name) = &summary.defaulted_encoding_name {
        println!("Encoding name defaulted to {}", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_branch() {
        assert_eq!(parse_branch("1234:96").unwrap(), (1234, 96));
        assert!(parse_branch("1234").is_err());
        assert!(parse_branch("x:96").is_err());
        assert!(parse_branch("1:200").is_err());
    }

    #[test]
    fn test_cli_parses() {
        let args = Args::try_parse_from([
            "rtpsrc",
            "--log-level",
            "debug",
            "plan",
            "rtp://239.1.1.1:5004",
            "-b",
            "1:96",
            "--branch",
            "2:96",
        ])
        .unwrap();
        match args.command {
            Command::Plan { branches, json, .. } => {
                assert_eq!(branches, vec![(1, 96), (2, 96)]);
                assert!(!json);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(Args::try_parse_from(["rtpsrc", "resolve", "128"]).is_err());
    }
}
