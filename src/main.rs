#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]

use anyhow::{Context, Result};
use clap::Parser;
use mavrouter_loop::config::Config;
use mavrouter_loop::mainloop::Mainloop;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Single-threaded MAVLink router", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "mavrouter.toml")]
    config: PathBuf,

    /// Accept inbound TCP connections on this port
    #[arg(short = 't', long)]
    tcp_port: Option<u16>,

    /// Record the flight stack's ULog stream into this directory
    #[arg(short = 'l', long)]
    log_dir: Option<PathBuf>,

    /// Log per-endpoint statistics every second
    #[arg(short = 'r', long)]
    report_stats: bool,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.tcp_port {
            config.general.tcp_port = Some(port);
        }
        if let Some(dir) = &self.log_dir {
            config.general.log = Some(dir.clone());
        }
        if self.report_stats {
            config.general.report_stats = true;
        }
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    info!("Starting mavrouter-loop with config: {}", args.config.display());

    let mut config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!("Error loading config: {:#}", e);
            return Err(e.into());
        }
    };
    args.apply(&mut config);
    config.validate().context("invalid configuration")?;

    info!(
        "Loaded configuration with {} endpoints",
        config.endpoint.len()
    );

    let mut mainloop = Mainloop::new();
    mainloop.open().context("failed to open mainloop")?;
    mainloop
        .add_endpoints(&config)
        .context("failed to set up endpoints")?;

    mainloop.run().context("mainloop failed")?;

    info!("Shutdown complete.");
    Ok(())
}
