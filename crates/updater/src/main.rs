//! Command-line driver for the resource updater.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use res_updater::{
    HttpTransport, Manifest, RecoveryLedger, UpdateEvent, UpdateOrchestrator, UpdaterConfig,
    VersionRecord,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{interval, MissedTickBehavior};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding downloaded resources and update state
    #[arg(short, long)]
    dir: PathBuf,

    /// Enable debug logging
    #[arg(long, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the resource directory up to date with a server
    Update {
        /// Base URL of the resource server
        #[arg(short, long)]
        server: String,
        /// Read-only directory with the resources shipped with the application
        #[arg(long)]
        bundled: Option<PathBuf>,
        /// Seconds a transfer may go without progress
        #[arg(long, default_value_t = 5)]
        timeout: u64,
        /// Verify downloads against their manifest hash as SHA-256
        #[arg(long, default_value_t = false)]
        verify: bool,
        /// Milliseconds between ticks
        #[arg(long, default_value_t = 16)]
        tick_ms: u64,
    },
    /// Show the committed version and any interrupted downloads
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug,res_updater=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Update {
            server,
            bundled,
            timeout,
            verify,
            tick_ms,
        } => {
            let mut config = UpdaterConfig::new(server, &cli.dir)
                .timeout(Duration::from_secs(timeout))
                .verify_sha256(verify);
            if let Some(bundled) = bundled {
                config = config.bundled_dir(bundled);
            }
            run_update(config, Duration::from_millis(tick_ms.max(1))).await
        }
        Commands::Status => {
            print_status(&cli.dir);
            Ok(())
        }
    }
}

async fn run_update(config: UpdaterConfig, tick: Duration) -> Result<()> {
    let transport = HttpTransport::builder().build()?;
    let mut updater = UpdateOrchestrator::new(config, transport, Handle::current());
    let mut events = updater.subscribe();

    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    updater.start_update();
    while updater.is_running() {
        tokio::select! {
            _ = ticker.tick() => updater.tick(),
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, progress is kept for the next run");
                updater.end_update();
                return Ok(());
            }
        }

        while let Ok(event) = events.try_recv() {
            match event {
                UpdateEvent::Progress {
                    path,
                    received,
                    done,
                    ..
                } => {
                    if done {
                        println!("{path}: {received} bytes");
                    }
                }
                UpdateEvent::Failed(failure) => {
                    updater.end_update();
                    bail!("update failed: {failure}");
                }
                UpdateEvent::Finished(outcome) => println!("finished: {outcome:?}"),
            }
        }
    }
    Ok(())
}

fn print_status(dir: &std::path::Path) {
    let config = UpdaterConfig::new(String::new(), dir);
    match VersionRecord::load(&config.version_path(dir)) {
        Some(record) => println!(
            "version {} (manifest {})",
            record.resource_version, record.manifest_hash
        ),
        None => println!("no committed version"),
    }
    println!(
        "{} files tracked",
        Manifest::load(&config.manifest_path(dir)).len()
    );

    let ledger = RecoveryLedger::open(config.ledger_path(dir));
    for entry in ledger.entries() {
        println!(
            "interrupted: {} ({} bytes, {:?})",
            entry.path, entry.bytes_downloaded, entry.state
        );
    }
    for path in ledger.removals() {
        println!("pending removal: {path}");
    }
}
