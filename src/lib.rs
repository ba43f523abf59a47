//! # shooter-tuner
//!
//! Sequential Bayesian tuner for the coefficients of a robot's shooting model.
//!
//! ## Architecture
//!
//! One background task drives the whole system against an unreliable robot
//! peer reachable through a shared key-value table:
//! ```text
//! TableTransport ⇄ RobotLink ⇄ TunerCoordinator ⇄ SequentialOptimizer
//!                                    ▲       │
//!                        TunerCommand│       │Arc<TunerStatus>
//!                                    │       ▼
//!                              presentation layer (dashboard, CLI, GUI)
//! ```
//!
//! The robot publishes each shot (hit/miss plus the firing solution) and the
//! coordinator feeds it to the optimizer. Once a campaign has enough valid
//! shots, the optimizer proposes a new value for the active coefficient,
//! which is clamped, written back and acknowledged through interlock flags.

// ── Lint policy (aerospace-grade) ─────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod coordinator;
pub mod link;
pub mod metrics;
pub mod optimizer;
pub mod session_log;
pub mod sim;
pub mod transport;

// Re-exports for convenience
pub use config::{CoefficientSpec, PolicySetting, TunerConfig};
pub use coordinator::{
    EvaluationSink, Lifecycle, NullSink, TunerCommand, TunerCoordinator, TunerHandle, TunerStatus,
};
pub use link::RobotLink;
pub use optimizer::{Proposal, SequentialOptimizer, ShotDisposition, ShotObservation};
pub use transport::{MemoryTable, TableTransport, TableValue};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: one JSON object per line, for log shippers on the driver station
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=shooter_tuner=debug`).
///
/// # Errors
///
/// Returns [`TunerError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
///
/// # Example
///
/// ```no_run
/// # use shooter_tuner::{init_tracing, TunerError};
/// # fn example() -> Result<(), TunerError> {
/// init_tracing()?;
/// # Ok(()) }
/// ```
pub fn init_tracing() -> Result<(), TunerError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| TunerError::Other(format!("tracing init failed: {e}")))
}

/// Top-level tuner errors.
///
/// Only the calls that are allowed to fail towards their caller (connecting,
/// configuration loading, command submission, campaign navigation) produce
/// these; everything inside the running loop is converted to status instead.
#[derive(Error, Debug)]
pub enum TunerError {
    /// The remote table could not be reached or rejected an operation.
    #[error("transport error: {0}")]
    Transport(#[from] transport::TransportError),

    /// The robot link failed to establish a session.
    #[error("link error: {0}")]
    Link(#[from] link::LinkError),

    /// A campaign navigation request was invalid.
    #[error("optimizer error: {0}")]
    Optimizer(#[from] optimizer::OptimizerError),

    /// Configuration could not be read, parsed or validated.
    #[error("configuration error: {0}")]
    Config(#[from] config::validation::ConfigError),

    /// The coordinator command queue is full; the command was not enqueued.
    #[error("command queue full")]
    CommandQueueFull,

    /// The coordinator is gone and can no longer accept commands.
    #[error("coordinator channel closed")]
    ChannelClosed,

    /// Session log I/O failed.
    #[error("session log error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

/// Wall-clock time as fractional seconds since the Unix epoch.
///
/// Used for heartbeats and journal timestamps, never for rate limiting
/// (which runs on a monotonic clock).
///
/// # Panics
///
/// This function never panics.
pub fn unix_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
