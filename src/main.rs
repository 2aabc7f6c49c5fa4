//! `auto_z_offset` command-line runner.
//!
//! Loads the module configuration (and the autosave state, if present),
//! assembles the module against the simulated printer and runs the given
//! commands in order.
//!
//! ```text
//! auto_z_offset --config printer.toml --state state.toml AUTO_Z_CALIBRATE AUTO_Z_LOAD_OFFSET
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use auto_z_offset::config::{AutoZConfig, DEFAULT_SECTION};
use auto_z_offset::hardware::mock::{BedModel, SimulatedPrinter};
use auto_z_offset::storage::TomlConfigStore;
use auto_z_offset::{AutoZCommand, AutoZOffset};

/// Dual-sensor Z offset calibration against a simulated printer.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Printer configuration TOML.
    #[arg(long)]
    config: PathBuf,

    /// Autosave state TOML; calibrated values are written here.
    #[arg(long, default_value = "auto_z_offset_state.toml")]
    state: PathBuf,

    /// Config section of the module instance.
    #[arg(long, default_value = DEFAULT_SECTION)]
    section: String,

    /// Simulated bed height at the origin, in mm.
    #[arg(long, default_value_t = 0.0)]
    bed_height: f64,

    /// Seeded per-sample sensor jitter amplitude, in mm.
    #[arg(long, default_value_t = 0.0)]
    jitter: f64,

    /// Print the module status as JSON after the last command.
    #[arg(long)]
    json: bool,

    /// List the available commands and exit.
    #[arg(long)]
    list: bool,

    /// Commands to run, e.g. AUTO_Z_CALIBRATE.
    commands: Vec<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("auto_z_offset=info")),
        )
        .init();

    if let Err(err) = try_main(Args::parse()).await {
        error!("{:#}", err);
        eprintln!("error: {:#}", err);
        std::process::exit(1);
    }
}

async fn try_main(args: Args) -> Result<()> {
    if args.list {
        for cmd in AutoZCommand::ALL {
            println!("{:<26} {}", cmd.name(), cmd.help());
        }
        return Ok(());
    }

    let config = AutoZConfig::load_with_state(&args.config, &args.state, &args.section)
        .with_context(|| format!("loading [{}] from {}", args.section, args.config.display()))?;

    let mut printer = SimulatedPrinter::new();
    if args.jitter > 0.0 {
        printer = printer.with_jitter(0, args.jitter).await;
    }
    printer
        .set_bed(BedModel {
            height: args.bed_height,
            ..Default::default()
        })
        .await;

    let store = Arc::new(TomlConfigStore::new(&args.state));
    let mut module = AutoZOffset::new(config, printer.collaborators(store))
        .context("assembling auto_z_offset")?;

    for line in &args.commands {
        let response = module
            .dispatch_line(line)
            .await
            .with_context(|| format!("running {}", line))?;
        for out in &response.lines {
            println!("{}", out);
        }
    }

    if args.json {
        let status = module.status().await;
        println!(
            "{}",
            serde_json::to_string_pretty(&status).context("encoding status")?
        );
    }
    info!(commands = args.commands.len(), "done");
    Ok(())
}
