//! shardctl: administration tool for hash-slot clusters.
//!
//! Talks RESP over TCP to every node it needs, one command at a time.
//! Cluster-wide operations live in `shardctl-cluster`; this binary parses
//! arguments, resolves configuration, and prints results.

mod cluster;
mod config;
mod connection;
mod driver;
mod format;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use shardctl_cluster::StopSignal;
use tracing::warn;

use crate::cluster::{Command, Context};
use crate::config::AdminConfig;

/// Redis-compatible cluster administration.
#[derive(Parser)]
#[command(name = "shardctl", version, about)]
struct Args {
    /// path to TOML configuration file
    #[arg(long, env = "SHARDCTL_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// password for AUTH
    #[arg(short = 'a', long, env = "SHARDCTL_PASSWORD", global = true)]
    password: Option<String>,

    /// socket timeout in milliseconds
    #[arg(long, env = "SHARDCTL_TIMEOUT", global = true)]
    timeout: Option<u64>,

    /// give up waiting for the cluster to converge after this many seconds
    #[arg(long, env = "SHARDCTL_WAIT_TIMEOUT", global = true)]
    wait_timeout: Option<u64>,

    /// keys fetched per migration round
    #[arg(long, env = "SHARDCTL_BATCH_SIZE", global = true)]
    batch_size: Option<usize>,

    /// fail on the first transport error instead of retrying
    #[arg(long, global = true)]
    no_retry: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

/// Applies CLI overrides to an `AdminConfig`. Only `Some` values take
/// effect, which keeps the order defaults → TOML file → env vars → flags.
fn apply_args(cfg: &mut AdminConfig, args: &Args) {
    if let Some(ref password) = args.password {
        cfg.password = password.clone();
    }
    if let Some(ms) = args.timeout {
        cfg.timeout_ms = ms;
    }
    if let Some(secs) = args.wait_timeout {
        cfg.wait_timeout_secs = secs;
    }
    if let Some(n) = args.batch_size {
        cfg.migration.batch_size = n;
    }
}

fn fail(msg: impl std::fmt::Display) -> ExitCode {
    eprintln!("{}", format::error_line(msg));
    ExitCode::FAILURE
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shardctl=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    if args.config_template {
        return match AdminConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                ExitCode::SUCCESS
            }
            Err(e) => fail(format!("failed to generate config template: {e}")),
        };
    }

    let mut cfg = match &args.config {
        Some(path) => match AdminConfig::from_file(path) {
            Ok(cfg) => cfg,
            Err(e) => return fail(e),
        },
        None => AdminConfig::default(),
    };
    apply_args(&mut cfg, &args);
    if let Err(e) = cfg.validate() {
        return fail(e);
    }

    let Some(command) = args.command else {
        return fail("no command given, see --help");
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => return fail(format!("failed to create runtime: {e}")),
    };

    rt.block_on(async {
        let stop = StopSignal::new();
        let on_interrupt = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping after the current step");
                on_interrupt.request();
            }
        });

        let ctx = Context::new(cfg, !args.no_retry, stop);
        match cluster::run(command, &ctx).await {
            Ok(true) => ExitCode::SUCCESS,
            Ok(false) => ExitCode::FAILURE,
            Err(e) => fail(e),
        }
    })
}
