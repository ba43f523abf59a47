//! Configuration validation engine.
//!
//! ## Responsibility
//! Check semantic constraints on a parsed [`TunerConfig`] that cannot be
//! expressed through the type system alone (bounds ordering, tuning-order
//! consistency, rate ceilings) and report them as human-readable warnings.
//!
//! ## Guarantees
//! - Validation never refuses a config: a robot in the pits must keep running
//!   on a partially wrong file, so every finding is a [`ConfigWarning`]
//! - Every rule has at least one test that triggers it
//! - Validation collects *all* findings before returning (no short-circuit)
//! - Messages include the field path and the offending value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - Disabling defective coefficients (the optimizer consults
//!   [`CoefficientSpec::defect`](super::CoefficientSpec::defect) itself)

use std::collections::HashSet;
use std::fmt;

use super::TunerConfig;

/// Errors arising from configuration parsing or I/O.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// A non-fatal configuration finding.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigWarning {
    /// Dot-separated field path (e.g. `coefficients.kGravity.min_value`).
    pub field: String,
    /// String representation of the offending value.
    pub value: String,
    /// Human-readable explanation.
    pub reason: String,
}

impl ConfigWarning {
    fn new(field: impl Into<String>, value: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Field '{}' has invalid value {}: {}",
            self.field, self.value, self.reason
        )
    }
}

/// Validate all semantic constraints on a [`TunerConfig`].
///
/// # Returns
///
/// Every finding, in a stable order: tuning order, coefficients, physical
/// limits, optimizer, rates, runtime. An empty vector means the config is clean.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &TunerConfig) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    // ── Tuning order ─────────────────────────────────────────────────
    let mut seen = HashSet::new();
    for name in &config.tuning_order {
        if config.coefficient(name).is_none() {
            warnings.push(ConfigWarning::new(
                "tuning_order",
                name,
                "coefficient is listed in tuning_order but not defined",
            ));
        }
        if !seen.insert(name.as_str()) {
            warnings.push(ConfigWarning::new(
                "tuning_order",
                name,
                "coefficient is listed more than once",
            ));
        }
    }

    let mut names = HashSet::new();
    for coeff in &config.coefficients {
        if !names.insert(coeff.name.as_str()) {
            warnings.push(ConfigWarning::new(
                "coefficients",
                &coeff.name,
                "duplicate coefficient name; only the first definition is used",
            ));
        }
        if coeff.enabled && !config.tuning_order.contains(&coeff.name) {
            warnings.push(ConfigWarning::new(
                "tuning_order",
                &coeff.name,
                "enabled coefficient is missing from tuning_order and will never be tuned",
            ));
        }
    }

    // ── Coefficients ─────────────────────────────────────────────────
    for coeff in &config.coefficients {
        let path = |field: &str| format!("coefficients.{}.{field}", coeff.name);

        if coeff.min_value >= coeff.max_value {
            warnings.push(ConfigWarning::new(
                path("min_value"),
                coeff.min_value,
                format!("must be < max_value ({})", coeff.max_value),
            ));
        }
        if !coeff.contains(coeff.default_value) {
            warnings.push(ConfigWarning::new(
                path("default_value"),
                coeff.default_value,
                format!(
                    "outside [{}, {}]; it will be clamped",
                    coeff.min_value, coeff.max_value
                ),
            ));
        }
        if coeff.initial_step_size <= 0.0 || !coeff.initial_step_size.is_finite() {
            warnings.push(ConfigWarning::new(
                path("initial_step_size"),
                coeff.initial_step_size,
                "must be > 0",
            ));
        }
        if !(coeff.step_decay_rate > 0.0 && coeff.step_decay_rate <= 1.0) {
            warnings.push(ConfigWarning::new(
                path("step_decay_rate"),
                coeff.step_decay_rate,
                "must be in (0, 1]",
            ));
        }
        if coeff.enabled {
            if let Some(defect) = coeff.defect() {
                warnings.push(ConfigWarning::new(
                    path("enabled"),
                    true,
                    format!("campaign disabled: {defect}"),
                ));
            }
        }
    }

    // ── Physical limits ──────────────────────────────────────────────
    let p = &config.physical;
    let pairs = [
        ("velocity_mps", p.min_velocity_mps, p.max_velocity_mps),
        ("angle_rad", p.min_angle_rad, p.max_angle_rad),
        ("distance_m", p.min_distance_m, p.max_distance_m),
    ];
    for (name, min, max) in pairs {
        if min >= max {
            warnings.push(ConfigWarning::new(
                format!("physical.min_{name}"),
                min,
                format!("must be < physical.max_{name} ({max})"),
            ));
        }
    }

    // ── Optimizer ────────────────────────────────────────────────────
    let o = &config.optimizer;
    if o.n_initial_points < 1 {
        warnings.push(ConfigWarning::new(
            "optimizer.n_initial_points",
            o.n_initial_points,
            "must be at least 1",
        ));
    }
    if o.n_calls_per_coefficient < o.n_initial_points {
        warnings.push(ConfigWarning::new(
            "optimizer.n_calls_per_coefficient",
            o.n_calls_per_coefficient,
            format!("must be >= n_initial_points ({})", o.n_initial_points),
        ));
    }
    if !(o.min_step_size_ratio > 0.0 && o.min_step_size_ratio <= 1.0) {
        warnings.push(ConfigWarning::new(
            "optimizer.min_step_size_ratio",
            o.min_step_size_ratio,
            "must be in (0, 1]",
        ));
    }
    if !(o.backtrack_step_fraction > 0.0 && o.backtrack_step_fraction <= 1.0) {
        warnings.push(ConfigWarning::new(
            "optimizer.backtrack_step_fraction",
            o.backtrack_step_fraction,
            "must be in (0, 1]",
        ));
    }
    if !(o.abnormal_reading_sigma > 0.0) {
        warnings.push(ConfigWarning::new(
            "optimizer.abnormal_reading_sigma",
            o.abnormal_reading_sigma,
            "must be > 0",
        ));
    }

    // ── Rates ────────────────────────────────────────────────────────
    if !(config.rates.max_write_hz > 0.0) {
        warnings.push(ConfigWarning::new(
            "rates.max_write_hz",
            config.rates.max_write_hz,
            "must be > 0; the default is used",
        ));
    }
    if !(config.rates.max_read_hz > 0.0) {
        warnings.push(ConfigWarning::new(
            "rates.max_read_hz",
            config.rates.max_read_hz,
            "must be > 0; the default is used",
        ));
    }

    // ── Runtime ──────────────────────────────────────────────────────
    if !(config.runtime.update_rate_hz > 0.0) {
        warnings.push(ConfigWarning::new(
            "runtime.update_rate_hz",
            config.runtime.update_rate_hz,
            "must be > 0; the default is used",
        ));
    }
    if config.runtime.command_capacity == 0 {
        warnings.push(ConfigWarning::new(
            "runtime.command_capacity",
            0,
            "must be at least 1; a capacity of 1 is used",
        ));
    }

    warnings
}
