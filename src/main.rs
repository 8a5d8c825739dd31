//! MeshForge gate CLI - inspect and exercise the mesh daemon gate.
//!
//! This is the main binary entry point. See the `meshforge_gate` library
//! for the core functionality.

use anyhow::Result;
use clap::{Parser, Subcommand};
use meshforge_gate::cache::CacheKind;
use meshforge_gate::commands;
use meshforge_gate::{AcquireOptions, Config};
use mimalloc::MiMalloc;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Global flag for signal-triggered shutdown (as Arc for signal-hook compatibility)
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

// CLI
#[derive(Parser)]
#[command(name = "meshforge-gate")]
#[command(version)]
#[command(about = "Single-connection gatekeeper for the mesh radio daemon")]
struct Cli {
    /// Daemon host (overrides config and MESHFORGE_HOST)
    #[arg(long, global = true)]
    host: Option<String>,
    /// Daemon control port (overrides config and MESHFORGE_PORT)
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show this process's gate state and cache ages
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the cached node table
    Nodes,
    /// Print the cached device info
    DeviceInfo,
    /// Check whether the daemon can be reached right now
    Probe {
        /// Seconds to wait for the gate
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Hold the gate until interrupted (use --connect to keep other processes off the daemon)
    Hold {
        /// Holder name shown to other front ends
        #[arg(long)]
        tag: Option<String>,
        /// Keep the daemon connection open; without it only this process is affected
        #[arg(long)]
        connect: bool,
    },
    /// Print the effective configuration
    Config,
}

fn init_logging() {
    // Log to a file so command output on stdout stays clean.
    // Use MESHFORGE_LOG_FILE or <config dir>/meshforge-gate.log, else stderr.
    let log_path = if let Ok(path) = std::env::var("MESHFORGE_LOG_FILE") {
        Some(std::path::PathBuf::from(path))
    } else {
        Config::config_dir()
            .ok()
            .map(|dir| dir.join("meshforge-gate.log"))
    };

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    if let Some(file) = log_path.and_then(|path| std::fs::File::create(path).ok()) {
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
}

fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    match cli.command {
        Commands::Status { json } => {
            commands::status::run(&config.broker(), json)?;
        }
        Commands::Nodes => {
            commands::cache::show(&config.cache(), CacheKind::Nodes)?;
        }
        Commands::DeviceInfo => {
            commands::cache::show(&config.cache(), CacheKind::DeviceInfo)?;
        }
        Commands::Probe { timeout } => {
            let timeout = timeout.map_or_else(|| config.lock_timeout(), Duration::from_secs);
            let outcome = commands::probe::probe(&config.broker(), timeout);
            println!("{}", outcome.message());
            let code = outcome.exit_code();
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Hold { tag, connect } => {
            // Set up signal handlers
            use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
            use signal_hook::flag;
            flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
            flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
            flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;

            let mut opts = AcquireOptions::blocking(config.lock_timeout()).tagged(
                tag.unwrap_or_else(|| format!("meshforge-gate hold (pid {})", std::process::id())),
            );
            if connect {
                opts = opts.establish_connection();
            }

            let broker = config.broker();
            commands::probe::hold(&broker, &opts, &SHUTDOWN_FLAG)?;
        }
        Commands::Config => {
            commands::status::show_config(&config)?;
        }
    }

    Ok(())
}
