//! `tuner` runs the shooter tuner.
//!
//! ## Usage
//!
//! ```bash
//! # Tune against the bundled simulated robot for two minutes
//! tuner --simulate --duration 120
//!
//! # Use a configuration file
//! tuner --config tuner.toml --simulate
//!
//! # Print the configuration JSON Schema and exit
//! tuner --schema
//! ```
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json`: structured JSON output
//! - `RUST_LOG=info`: log level filter

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use shooter_tuner::config::{self, loader};
use shooter_tuner::sim::SimulatedRobot;
use shooter_tuner::{init_tracing, metrics, MemoryTable, NullSink, TunerConfig, TunerCoordinator};
use tracing::{info, warn};

/// Parsed CLI arguments.
struct Args {
    /// Configuration file; built-in defaults when absent.
    config: Option<PathBuf>,
    /// Run against the simulated robot.
    simulate: bool,
    /// Stop after this many seconds instead of waiting for Ctrl-C.
    duration_secs: Option<u64>,
    /// Print the configuration schema and exit.
    schema: bool,
}

/// Parse command-line arguments manually.
fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        config: None,
        simulate: false,
        duration_secs: None,
        schema: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                let value = args.get(i).ok_or("--config requires a value")?;
                parsed.config = Some(PathBuf::from(value));
            }
            "--simulate" => parsed.simulate = true,
            "--duration" | "-d" => {
                i += 1;
                let value = args.get(i).ok_or("--duration requires a value")?;
                parsed.duration_secs = Some(
                    value
                        .parse()
                        .map_err(|_| format!("invalid duration: {value}"))?,
                );
            }
            "--schema" => parsed.schema = true,
            "--help" | "-h" => return Err(usage()),
            other => return Err(format!("unknown argument: {other}\n{}", usage())),
        }
        i += 1;
    }
    Ok(parsed)
}

fn usage() -> String {
    [
        "Usage: tuner [OPTIONS]",
        "",
        "Options:",
        "  --config, -c <FILE>     TOML configuration (default: built-in)",
        "  --simulate              Tune against the simulated robot",
        "  --duration, -d <SECS>   Stop after SECS seconds (default: until Ctrl-C)",
        "  --schema                Print the configuration JSON Schema and exit",
        "  --help, -h              Show this help message",
    ]
    .join("\n")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    if args.schema {
        println!("{}", config::export_schema()?);
        return Ok(());
    }

    let _ = init_tracing();
    metrics::init_metrics()?;

    let config = match &args.config {
        Some(path) => loader::load_from_file(path)?.config,
        None => {
            let config = TunerConfig::default();
            for warning in config::validation::validate(&config) {
                warn!(%warning, "configuration warning");
            }
            config
        }
    };

    if !args.simulate {
        eprintln!(
            "No robot transport is bundled; run with --simulate or embed the library \
             with your own TableTransport."
        );
        std::process::exit(2);
    }

    let table = MemoryTable::new();
    let robot = SimulatedRobot::new(table.clone(), &config, config.optimizer.seed);
    let (robot_stop_tx, robot_stop_rx) = tokio::sync::watch::channel(false);
    let robot_task = tokio::spawn(robot.run(Duration::from_millis(250), robot_stop_rx));

    let coordinator = TunerCoordinator::new(config, Arc::new(table), Box::new(NullSink));
    let handle = coordinator.handle();
    coordinator.start();
    info!("tuner running; press Ctrl-C to stop");

    match args.duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }

    coordinator.stop().await;
    let _ = robot_stop_tx.send(true);
    let shots = robot_task.await.unwrap_or(0);

    let status = handle.status();
    info!(
        shots,
        iterations = status.iterations,
        current = ?status.current_coefficient,
        "session finished"
    );
    println!("{}", serde_json::to_string_pretty(&*status)?);
    Ok(())
}
