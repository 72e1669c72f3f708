//! Protolab CLI - Command Line Interface
//!
//! Headless scenario runner for the protocol simulators. Replays a JSON
//! instruction script against one engine and prints the resulting audit
//! trail and statistics.
//!
//! Key Features:
//! - Scenario replay for every supported protocol
//! - Optional TOML configuration file
//! - Human-readable or JSON output
//! - Protocol catalogue and default configuration dump
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use clap::{Parser, Subcommand};
use protolab_common::{ProtocolKind, ProtolabError, Result, SimulationConfig};
use protolab_engine::{run_scenario, ScenarioReport};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

// =============================================================================
// CLI Arguments
// =============================================================================

#[derive(Parser)]
#[command(name = "protolab")]
#[command(author = "AutomataNexus Development Team")]
#[command(version = "0.1.0")]
#[command(about = "Distributed protocol simulator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a scenario against one protocol engine
    Run {
        /// Protocol name, e.g. raft or two-phase-commit
        #[arg(short, long)]
        protocol: String,

        /// JSON file holding the instruction list
        #[arg(short, long)]
        scenario: PathBuf,

        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },
    /// List supported protocols
    Protocols,
    /// Print the default configuration as TOML
    Config,
}

// =============================================================================
// Commands
// =============================================================================

fn load_config(path: Option<&Path>) -> Result<SimulationConfig> {
    match path {
        Some(path) => {
            tracing::info!("Loading configuration from {}", path.display());
            SimulationConfig::from_file(path)
        }
        None => Ok(SimulationConfig::default()),
    }
}

fn run(protocol: &str, scenario: &Path, config: Option<&Path>, json: bool) -> Result<()> {
    let protocol: ProtocolKind = protocol.parse()?;
    let config = load_config(config)?;
    let source = std::fs::read_to_string(scenario)?;

    tracing::info!("Replaying {} against {}", scenario.display(), protocol.name());
    let report = run_scenario(protocol, &config, &source)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report)?;
    }
    Ok(())
}

fn print_report(report: &ScenarioReport) -> Result<()> {
    println!(
        "{} ({}): {} steps, clock at {} ms",
        report.protocol.name(),
        report.protocol.topic(),
        report.steps,
        report.clock_ms
    );
    println!();
    for event in &report.events {
        println!("[{:>6}] {:<24} {}", event.timestamp, event.kind, event.description);
    }
    println!();
    println!("{}", serde_json::to_string_pretty(&report.stats)?);
    Ok(())
}

fn list_protocols() {
    for protocol in ProtocolKind::ALL {
        println!("{:<20} {}", protocol.name(), protocol.topic());
    }
}

fn print_default_config() -> Result<()> {
    print!("{}", SimulationConfig::default().to_toml_string()?);
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            protocol,
            scenario,
            config,
            json,
        } => run(&protocol, &scenario, config.as_deref(), json),
        Commands::Protocols => {
            list_protocols();
            Ok(())
        }
        Commands::Config => print_default_config(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => report_error(err),
    }
}

fn report_error(err: ProtolabError) -> ExitCode {
    tracing::error!("{}", err);
    eprintln!("error: {}", err);
    ExitCode::from(err.exit_code() as u8)
}
