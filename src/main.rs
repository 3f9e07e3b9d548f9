//! CLI entry point for the spectrum monitor station
//!
//! # Usage
//!
//! Run the station with the operator console on stdin:
//! ```bash
//! spectrum_monitor run --config config/station.toml
//! ```
//!
//! Check a hook script without touching hardware:
//! ```bash
//! spectrum_monitor check-hooks config/hooks.rhai
//! ```
//!
//! Preview an automation schedule:
//! ```bash
//! spectrum_monitor queue --start "2026-10-20 08:00" --end "2026-10-21 08:00" --interval 2h
//! ```

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spectrum_monitor::adapters::VisaOptions;
use spectrum_monitor::automation::ScheduleQueue;
use spectrum_monitor::config::Settings;
use spectrum_monitor::console::{self, parse_interval, parse_local_time};
use spectrum_monitor::instrument::analyzer::identify;
use spectrum_monitor::logging::{self, LogConfig, LogFormat};
use spectrum_monitor::messages::Resource;
use spectrum_monitor::scripting::{HookEngine, HookLimits};
use spectrum_monitor::session::{visa_connector, Session, SessionOptions};
use spectrum_monitor::Station;
use std::path::{Path, PathBuf};
use tokio::io::BufReader;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "spectrum_monitor")]
#[command(about = "Antenna spectrum monitoring station control", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/station.toml, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override application.log_level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Multi-line human-readable logs
    #[arg(long, global = true, conflicts_with = "json_logs")]
    pretty_logs: bool,

    /// JSON log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the station and read operator commands from stdin
    Run {
        /// Do not open the configured addresses at startup
        #[arg(long)]
        no_connect: bool,
    },

    /// Print the identification of the analyzer at ADDRESS
    Identify {
        /// VISA resource string
        address: String,
    },

    /// Compile a hook script and check it defines initSchedule and onSchedule
    CheckHooks {
        /// Path to the .rhai file
        script: PathBuf,
    },

    /// Print the times an automation range would queue
    Queue {
        /// First boundary (YYYY-MM-DD HH:MM[:SS] or HH:MM)
        #[arg(long)]
        start: String,
        /// Last boundary
        #[arg(long)]
        end: String,
        /// Spacing, e.g. 30m or 2h (0 means 24h)
        #[arg(long, default_value = "0")]
        interval: String,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(level) = cli.log_level {
        settings.application.log_level = level;
    }
    let mut log = LogConfig::from(&settings.application);
    if cli.json_logs {
        log.format = LogFormat::Json;
        log.ansi = false;
    } else if cli.pretty_logs {
        log.format = LogFormat::Pretty;
    }
    logging::init(&log)?;

    match cli.command {
        Commands::Run { no_connect } => run(settings, no_connect).await,
        Commands::Identify { address } => identify_at(&settings, &address).await,
        Commands::CheckHooks { script } => check_hooks(&settings, &script).await,
        Commands::Queue {
            start,
            end,
            interval,
        } => preview_queue(&start, &end, &interval),
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

async fn run(settings: Settings, no_connect: bool) -> Result<()> {
    let configured = [
        (Resource::Instrument, settings.instrument.address.is_some()),
        (Resource::Motor, settings.motor.port.is_some()),
        (Resource::Relay, settings.relay.port.is_some()),
    ];
    info!(station = %settings.application.name, "starting station");
    let handle = Station::from_settings(settings).spawn();

    if !no_connect {
        for (resource, _) in configured.iter().filter(|(_, has_address)| *has_address) {
            match handle.connect(*resource, None).await {
                Ok(()) => info!(%resource, "connected"),
                Err(e) => warn!(%resource, error = %e, "connection failed"),
            }
        }
    }

    println!("{}", console::HELP);
    let input = BufReader::new(tokio::io::stdin());
    tokio::select! {
        result = console::run(&handle, input, tokio::io::stdout()) => {
            result.context("Console I/O failed")?;
        }
        _ = signal::ctrl_c() => {
            info!("interrupt received");
        }
    }

    handle.shutdown().await?;
    Ok(())
}

async fn identify_at(settings: &Settings, address: &str) -> Result<()> {
    let session = Session::new(
        Resource::Instrument.as_str(),
        SessionOptions::visa(&settings.instrument),
        visa_connector(VisaOptions::from(&settings.instrument)),
    );
    let mut io = session.lock().await;
    io.open(address).await?;
    let fields = identify(&mut io).await;
    io.close().await?;
    println!("{}", fields?.join(", "));
    Ok(())
}

async fn check_hooks(settings: &Settings, script: &Path) -> Result<()> {
    let text = tokio::fs::read_to_string(script)
        .await
        .with_context(|| format!("Failed to read {}", script.display()))?;
    HookEngine::new(HookLimits::from(&settings.automation)).compile(&text)?;
    println!("{}: ok", script.display());
    Ok(())
}

fn preview_queue(start: &str, end: &str, interval: &str) -> Result<()> {
    let mut queue = ScheduleQueue::new();
    let added = queue.enqueue_range(
        parse_local_time(start)?,
        parse_local_time(end)?,
        parse_interval(interval)?,
    )?;
    for at in queue.times() {
        println!("{}", at.format("%Y-%m-%d %H:%M:%S"));
    }
    println!("{added} times");
    Ok(())
}
