use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use haltkit_contracts::{HandleRecord, HandleSnapshot, NAMES_REPORT_SCHEMA_VERSION};
use haltkit_names::{build_resolver, Backend, ResolverConfig};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const ENV_LOG: &str = "HALTKIT_LOG";

#[derive(Parser, Debug)]
#[command(name = "haltkit-names")]
#[command(about = "Resolve kernel handle names under a per-lookup deadline.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve handles, one JSON report line per handle.
    Resolve {
        #[arg(long, required_unless_present = "snapshot", requires = "handles")]
        pid: Option<u64>,
        /// Handle value, decimal or 0x-prefixed hex. Repeatable.
        #[arg(long = "handle", value_parser = parse_handle, requires = "pid")]
        handles: Vec<u64>,
        /// JSON handle snapshot (`haltkit.handle-record@1`) instead of --pid/--handle.
        #[arg(long, conflicts_with_all = ["pid", "handles"])]
        snapshot: Option<PathBuf>,
        #[command(flatten)]
        common: CommonArgs,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Print the effective resolver configuration as JSON.
    ShowConfig {
        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(clap::Args, Debug)]
struct CommonArgs {
    /// JSON resolver config; HALTKIT_NAME_* variables still apply on top.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    backend: Option<Backend>,
}

impl CommonArgs {
    fn load(&self) -> Result<ResolverConfig> {
        let mut cfg = match &self.config {
            Some(path) => ResolverConfig::from_json_file(path)?,
            None => ResolverConfig::from_env()?,
        };
        if let Some(backend) = self.backend {
            cfg.backend = backend;
        }
        Ok(cfg)
    }
}

#[derive(Debug, Serialize)]
struct NameReport {
    schema_version: &'static str,
    pid: u64,
    handle: u64,
    name: Option<String>,
    error: Option<String>,
}

fn parse_handle(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| format!("invalid handle value {s:?}"))
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> ExitCode {
    match try_main() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("haltkit-names: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();
    match cli.command {
        Command::Resolve {
            pid,
            handles,
            snapshot,
            common,
            timeout_ms,
        } => {
            let records = match (snapshot, pid) {
                (Some(path), _) => read_snapshot(&path)?,
                (None, Some(pid)) => handles
                    .iter()
                    .map(|&handle| HandleRecord::new(pid, handle))
                    .collect(),
                (None, None) => anyhow::bail!("resolve needs --pid/--handle or --snapshot"),
            };
            let mut cfg = common.load()?;
            if let Some(ms) = timeout_ms {
                cfg.timeout_ms = ms;
            }
            cfg.validate()?;
            cmd_resolve(&cfg, &records)
        }
        Command::ShowConfig { common } => {
            let cfg = common.load()?;
            let mut out = std::io::stdout().lock();
            serde_json::to_writer_pretty(&mut out, &cfg)?;
            writeln!(out)?;
            Ok(())
        }
    }
}

fn read_snapshot(path: &std::path::Path) -> Result<Vec<HandleRecord>> {
    let bytes =
        std::fs::read(path).with_context(|| format!("read snapshot: {}", path.display()))?;
    let snapshot: HandleSnapshot = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse snapshot JSON: {}", path.display()))?;
    snapshot
        .check_schema()
        .with_context(|| format!("snapshot {}", path.display()))?;
    Ok(snapshot.records)
}

fn cmd_resolve(cfg: &ResolverConfig, records: &[HandleRecord]) -> Result<()> {
    let resolver = build_resolver(cfg)?;
    resolver
        .start()
        .with_context(|| format!("start {} name resolver", cfg.backend))?;
    debug!(backend = %cfg.backend, handles = records.len(), "resolver started");

    let timeout = cfg.timeout();
    let mut out = std::io::stdout().lock();
    for record in records {
        let (pid, handle) = (record.owner_pid, record.handle_value);
        let report = match resolver.get_name(record, timeout) {
            Ok(name) => NameReport {
                schema_version: NAMES_REPORT_SCHEMA_VERSION,
                pid,
                handle,
                name,
                error: None,
            },
            Err(err) => NameReport {
                schema_version: NAMES_REPORT_SCHEMA_VERSION,
                pid,
                handle,
                name: None,
                error: Some(err.to_string()),
            },
        };
        serde_json::to_writer(&mut out, &report)?;
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_parse_as_decimal_or_hex() {
        assert_eq!(parse_handle("76"), Ok(76));
        assert_eq!(parse_handle("0x4c"), Ok(76));
        assert_eq!(parse_handle("0X4C"), Ok(76));
        assert!(parse_handle("4c").is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
