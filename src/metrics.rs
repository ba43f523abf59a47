//! Prometheus metrics for the tuner loop.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup before starting the
//! coordinator. The helper functions (`inc_shot`, `inc_error`, …) are no-ops
//! if `init_metrics` was never called, so the tuner always runs and
//! observability simply degrades.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `tuner_shots_total` | Counter | `outcome` |
//! | `tuner_proposals_total` | Counter | `strategy` |
//! | `tuner_errors_total` | Counter | `category` |
//! | `tuner_iteration_duration_seconds` | Histogram | - |
//! | `tuner_success_rate` | Gauge | `coefficient` |
//! | `tuner_connected` | Gauge | - |

use crate::TunerError;
use prometheus::{
    core::Collector, CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All tuner metrics, stored in a single [`OnceLock`].
pub struct Metrics {
    /// Registry owning every descriptor below.
    pub registry: Registry,
    /// Shots seen by the optimizer, by `accepted` / `rejected`.
    pub shots_total: CounterVec,
    /// Proposals written, by strategy.
    pub proposals_total: CounterVec,
    /// Loop errors by category (`transport`, `validation`, `panic`, `command`).
    pub errors_total: CounterVec,
    /// Wall time of one loop iteration.
    pub iteration_duration: Histogram,
    /// Success rate of each campaign.
    pub success_rate: GaugeVec,
    /// 1 while the robot link is up.
    pub connected: IntGauge,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn register<C: Collector + Clone + 'static>(
    registry: &Registry,
    collector: Result<C, prometheus::Error>,
) -> Result<C, TunerError> {
    let collector =
        collector.map_err(|e| TunerError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| TunerError::Other(format!("metrics registration failed: {e}")))?;
    Ok(collector)
}

fn build(prefix: &str) -> Result<Metrics, TunerError> {
    let registry = Registry::new();
    let shots_total = register(
        &registry,
        CounterVec::new(
            Opts::new(format!("{prefix}_shots_total"), "Shots seen by the optimizer"),
            &["outcome"],
        ),
    )?;
    let proposals_total = register(
        &registry,
        CounterVec::new(
            Opts::new(format!("{prefix}_proposals_total"), "Coefficient proposals"),
            &["strategy"],
        ),
    )?;
    let errors_total = register(
        &registry,
        CounterVec::new(
            Opts::new(format!("{prefix}_errors_total"), "Loop errors by category"),
            &["category"],
        ),
    )?;
    let iteration_duration = register(
        &registry,
        Histogram::with_opts(HistogramOpts::new(
            format!("{prefix}_iteration_duration_seconds"),
            "Duration of one coordinator iteration",
        )),
    )?;
    let success_rate = register(
        &registry,
        GaugeVec::new(
            Opts::new(format!("{prefix}_success_rate"), "Campaign success rate"),
            &["coefficient"],
        ),
    )?;
    let connected = register(
        &registry,
        IntGauge::new(format!("{prefix}_connected"), "Robot link state"),
    )?;
    Ok(Metrics {
        registry,
        shots_total,
        proposals_total,
        errors_total,
        iteration_duration,
        success_rate,
        connected,
    })
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all metrics in a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`TunerError::Other`] if metric construction or registration
/// fails.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), TunerError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    // A racing initialiser builds identical descriptors; first one wins.
    let _ = METRICS.set(build("tuner")?);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count a shot as `accepted` or `rejected`.
pub fn inc_shot(outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.shots_total.get_metric_with_label_values(&[outcome]) {
            c.inc();
        }
    }
}

/// Count a written proposal.
pub fn inc_proposal(strategy: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.proposals_total.get_metric_with_label_values(&[strategy]) {
            c.inc();
        }
    }
}

/// Count a loop error.
///
/// No-op if metrics have not been initialised.
///
/// # Panics
///
/// This function never panics.
pub fn inc_error(category: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.errors_total.get_metric_with_label_values(&[category]) {
            c.inc();
        }
    }
}

/// Record the duration of one loop iteration.
pub fn record_iteration(d: Duration) {
    if let Some(m) = metrics() {
        m.iteration_duration.observe(d.as_secs_f64());
    }
}

/// Set the success-rate gauge of a campaign.
pub fn set_success_rate(coefficient: &str, rate: f64) {
    if let Some(m) = metrics() {
        if let Ok(g) = m.success_rate.get_metric_with_label_values(&[coefficient]) {
            g.set(rate);
        }
    }
}

/// Set the link-state gauge.
pub fn set_connected(connected: bool) {
    if let Some(m) = metrics() {
        m.connected.set(i64::from(connected));
    }
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
///
/// # Panics
///
/// This function never panics.
pub fn gather_metrics() -> String {
    let Some(m) = metrics() else {
        return String::new();
    };
    let families = m.registry.gather();
    let mut buffer = Vec::new();
    if TextEncoder::new().encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Error counts keyed by category, zeroed before [`init_metrics`].
pub fn error_counts() -> HashMap<String, u64> {
    let Some(m) = metrics() else {
        return HashMap::new();
    };
    let mut counts = HashMap::new();
    for family in m.errors_total.collect() {
        for metric in family.get_metric() {
            let category = metric
                .get_label()
                .iter()
                .find(|l| l.get_name() == "category")
                .map_or("unknown", |l| l.get_value());
            counts.insert(
                category.to_string(),
                metric.get_counter().get_value() as u64,
            );
        }
    }
    counts
}
