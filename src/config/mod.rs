//! # Stage: Tuner Configuration
//!
//! ## Responsibility
//! Define the typed, immutable [`TunerConfig`] the coordinator is built from:
//! master switches, autotune and auto-advance policies, interlock
//! requirements, the ordered coefficient catalogue, physical safety bounds,
//! transport rate ceilings and session-log location.
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `TunerConfig`
//! - Total: every field has a documented default, an empty file is a valid config
//! - Policy resolution is a pure function (`force_global > override > global`)
//! - [`CoefficientSpec::clamp`] never returns a value outside `[min, max]`
//!   and never returns NaN or infinity
//!
//! ## NOT Responsible For
//! - Reading files (that belongs to `loader`)
//! - Reporting misconfiguration (that belongs to `validation`)
//! - Deciding which values to try (that belongs to `optimizer`)

pub mod loader;
pub mod validation;

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ── Default value functions ──────────────────────────────────────────────

/// Default enabled state: true.
fn default_true() -> bool {
    true
}

/// Default sample size for autotune and auto-advance: 10 shots.
fn default_shot_threshold() -> u32 {
    10
}

/// Default FRC team number used to derive the robot address.
fn default_team_number() -> u16 {
    5892
}

/// Default connect timeout: 5000ms.
fn default_connect_timeout_ms() -> u64 {
    5000
}

/// Default delay between reconnect attempts: 2000ms.
fn default_reconnect_delay_ms() -> u64 {
    2000
}

/// Default minimum spacing between heartbeat writes: 500ms.
fn default_heartbeat_interval_ms() -> u64 {
    500
}

/// Default per-coefficient write ceiling: 50 Hz.
fn default_max_write_hz() -> f64 {
    50.0
}

/// Default shot polling ceiling: 100 Hz.
fn default_max_read_hz() -> f64 {
    100.0
}

/// Default number of bootstrap proposals before the surrogate takes over.
fn default_n_initial_points() -> u32 {
    3
}

/// Default proposal budget per coefficient campaign.
fn default_n_calls_per_coefficient() -> u32 {
    20
}

/// Default step-size floor as a fraction of the initial step.
fn default_min_step_size_ratio() -> f64 {
    0.1
}

/// Default step size after a backtrack, as a fraction of the initial step.
fn default_backtrack_step_fraction() -> f64 {
    0.5
}

/// Default Expected Improvement exploration margin.
fn default_exploration_xi() -> f64 {
    0.01
}

/// Default seed for exploratory sampling.
fn default_seed() -> u64 {
    5892
}

/// Default number of valid shots before a manual optimization is allowed.
fn default_min_valid_shots_before_update() -> u32 {
    3
}

/// Default invalid-shot streak that raises a warning.
fn default_max_consecutive_invalid_shots() -> u32 {
    5
}

/// Default outlier cut-off for shot distance, in standard deviations.
fn default_abnormal_reading_sigma() -> f64 {
    3.0
}

/// Default control loop frequency: 10 Hz.
fn default_update_rate_hz() -> f64 {
    10.0
}

/// Default graceful shutdown budget: 5000ms.
fn default_graceful_shutdown_timeout_ms() -> u64 {
    5000
}

/// Default command queue capacity.
fn default_command_capacity() -> usize {
    256
}

/// Default session log directory.
fn default_log_directory() -> String {
    "./tuner_logs".to_string()
}

/// Default session log file prefix.
fn default_log_filename_prefix() -> String {
    "bayesian_tuner".to_string()
}

fn default_min_velocity_mps() -> f64 {
    5.0
}

fn default_max_velocity_mps() -> f64 {
    30.0
}

fn default_min_angle_rad() -> f64 {
    0.0
}

fn default_max_angle_rad() -> f64 {
    std::f64::consts::FRAC_PI_2
}

fn default_min_distance_m() -> f64 {
    0.5
}

fn default_max_distance_m() -> f64 {
    15.0
}

fn default_step_decay_rate() -> f64 {
    0.9
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a tuner instance.
///
/// Deserialized from TOML and checked by [`validation::validate`] before use.
/// Every field has a documented default.
///
/// # Example
///
/// ```toml
/// enabled = true
/// tuning_order = ["kDragCoefficient", "kShooterRPM"]
///
/// [autotune]
/// enabled = true
/// shot_threshold = 10
///
/// [[coefficients]]
/// name = "kDragCoefficient"
/// default_value = 0.003
/// min_value = 0.001
/// max_value = 0.01
/// initial_step_size = 0.0001
/// ```
///
/// # Panics
///
/// This type never panics during construction or access.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct TunerConfig {
    /// Master switch. When false the loop still runs, heartbeats and
    /// publishes status, but never records shots or writes coefficients.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Automatic optimization after a shot threshold.
    #[serde(default)]
    pub autotune: PolicyConfig,
    /// Automatic progression to the next coefficient on a success streak.
    #[serde(default)]
    pub auto_advance: PolicyConfig,
    /// Handshake flags the robot uses to gate actuation.
    #[serde(default)]
    pub interlocks: InterlockConfig,
    /// Robot address and connection timing.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Read/write ceilings protecting the robot controller's bus.
    #[serde(default)]
    pub rates: RateLimitConfig,
    /// Optimizer strategy parameters.
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    /// Physical plausibility limits for shot data.
    #[serde(default)]
    pub physical: PhysicalLimits,
    /// Control loop timing and pause behaviour.
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Session log location.
    #[serde(default)]
    pub logging: LogConfig,
    /// Campaign sequence, by coefficient name.
    #[serde(default)]
    pub tuning_order: Vec<String>,
    /// Coefficient catalogue.
    #[serde(default)]
    pub coefficients: Vec<CoefficientSpec>,
}

impl Default for TunerConfig {
    /// The coefficient set the robot firing solver exposes. The gravity and
    /// height constants are known well enough to stay disabled.
    fn default() -> Self {
        let coefficients = vec![
            CoefficientSpec::new("kDragCoefficient", 0.003, 0.001, 0.01, 0.0001),
            CoefficientSpec::new("kGravity", 9.81, 9.0, 10.0, 0.01).disabled(),
            CoefficientSpec::new("kShotHeight", 1.0, 0.0, 3.0, 0.01).disabled(),
            CoefficientSpec::new("kTargetHeight", 2.5, 0.0, 5.0, 0.01).disabled(),
            CoefficientSpec::new("kShooterAngle", 45.0, 0.0, 90.0, 1.0).integer(),
            CoefficientSpec::new("kShooterRPM", 3000.0, 0.0, 6000.0, 50.0).integer(),
            CoefficientSpec::new("kExitVelocity", 15.0, 0.0, 30.0, 0.1),
        ];
        Self {
            enabled: true,
            autotune: PolicyConfig::default(),
            auto_advance: PolicyConfig::default(),
            interlocks: InterlockConfig::default(),
            network: NetworkConfig::default(),
            rates: RateLimitConfig::default(),
            optimizer: OptimizerConfig::default(),
            physical: PhysicalLimits::default(),
            runtime: RuntimeConfig::default(),
            logging: LogConfig::default(),
            tuning_order: coefficients.iter().map(|c| c.name.clone()).collect(),
            coefficients,
        }
    }
}

impl TunerConfig {
    /// An empty configuration: defaults everywhere but no coefficients.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn empty() -> Self {
        Self {
            tuning_order: Vec::new(),
            coefficients: Vec::new(),
            ..Self::default()
        }
    }

    /// Look up a coefficient by name.
    pub fn coefficient(&self, name: &str) -> Option<&CoefficientSpec> {
        self.coefficients.iter().find(|c| c.name == name)
    }

    /// Enabled coefficients in tuning order. Names in the order that do not
    /// resolve are skipped.
    pub fn enabled_coefficients_in_order(&self) -> Vec<&CoefficientSpec> {
        self.tuning_order
            .iter()
            .filter_map(|name| self.coefficient(name))
            .filter(|c| c.enabled)
            .collect()
    }
}

// ── Policies ─────────────────────────────────────────────────────────────

/// Resolved policy for one coefficient: whether the behaviour is on and how
/// many shots make up one sample.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct PolicySetting {
    /// Behaviour on/off.
    pub enabled: bool,
    /// Shots per sample.
    #[serde(default = "default_shot_threshold")]
    pub shot_threshold: u32,
}

/// Global policy with the force-global escape hatch.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct PolicyConfig {
    /// Global default on/off.
    #[serde(default)]
    pub enabled: bool,
    /// Global default sample size.
    #[serde(default = "default_shot_threshold")]
    pub shot_threshold: u32,
    /// Ignore every per-coefficient override when set.
    #[serde(default)]
    pub force_global: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            shot_threshold: default_shot_threshold(),
            force_global: false,
        }
    }
}

impl PolicyConfig {
    /// The global setting without the force flag.
    pub fn setting(&self) -> PolicySetting {
        PolicySetting {
            enabled: self.enabled,
            shot_threshold: self.shot_threshold,
        }
    }

    /// Resolve the effective setting for a coefficient.
    ///
    /// Priority: force-global > per-coefficient override > global default.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn resolve(&self, local: Option<PolicySetting>) -> PolicySetting {
        match local {
            Some(local) if !self.force_global => local,
            _ => self.setting(),
        }
    }
}

// ── Interlocks ───────────────────────────────────────────────────────────

/// Which handshake flags the robot must see before actuating.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct InterlockConfig {
    /// Robot waits until the tuner has logged the previous shot.
    #[serde(default)]
    pub require_shot_logged: bool,
    /// Robot waits until the tuner has pushed new coefficients.
    #[serde(default)]
    pub require_coefficients_updated: bool,
}

// ── Network ──────────────────────────────────────────────────────────────

/// Robot address and connection timing.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct NetworkConfig {
    /// FRC team number; the robot lives at `10.TE.AM.2`.
    #[serde(default = "default_team_number")]
    pub team_number: u16,
    /// Explicit server address, overriding the team-derived one.
    #[serde(default)]
    pub server_address: Option<String>,
    /// Upper bound on a single connect attempt.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Minimum spacing between reconnect attempts.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Minimum spacing between heartbeat writes.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            team_number: default_team_number(),
            server_address: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl NetworkConfig {
    /// The address to connect to.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn server_address(&self) -> String {
        match &self.server_address {
            Some(addr) if !addr.trim().is_empty() => addr.clone(),
            _ => format!(
                "10.{}.{}.2",
                self.team_number / 100,
                self.team_number % 100
            ),
        }
    }

    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    /// Reconnect delay as a [`Duration`].
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Heartbeat spacing as a [`Duration`].
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

// ── Rate limits ──────────────────────────────────────────────────────────

/// Read/write ceilings for the table transport.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RateLimitConfig {
    /// Maximum writes per second, per coefficient.
    #[serde(default = "default_max_write_hz")]
    pub max_write_hz: f64,
    /// Maximum shot polls per second.
    #[serde(default = "default_max_read_hz")]
    pub max_read_hz: f64,
    /// Flush once per loop iteration instead of after every write.
    #[serde(default = "default_true")]
    pub batch_writes: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_write_hz: default_max_write_hz(),
            max_read_hz: default_max_read_hz(),
            batch_writes: true,
        }
    }
}

impl RateLimitConfig {
    /// Minimum spacing between two writes of the same coefficient.
    pub fn write_period(&self) -> Duration {
        period_for(self.max_write_hz, default_max_write_hz())
    }

    /// Minimum spacing between two shot polls.
    pub fn read_period(&self) -> Duration {
        period_for(self.max_read_hz, default_max_read_hz())
    }
}

/// `1/hz` as a duration, falling back when `hz` is not a positive finite number.
fn period_for(hz: f64, fallback_hz: f64) -> Duration {
    let hz = if hz.is_finite() && hz > 0.0 {
        hz
    } else {
        fallback_hz
    };
    Duration::from_secs_f64((1.0 / hz).clamp(1e-6, 3600.0))
}

// ── Optimizer ────────────────────────────────────────────────────────────

/// Optimizer strategy and shot validation parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct OptimizerConfig {
    /// Valid evaluations required before the surrogate replaces bootstrap proposals.
    #[serde(default = "default_n_initial_points")]
    pub n_initial_points: u32,
    /// Proposal budget per campaign; exhausting it advances the cursor.
    #[serde(default = "default_n_calls_per_coefficient")]
    pub n_calls_per_coefficient: u32,
    /// Apply `step_decay_rate` after each proposal.
    #[serde(default = "default_true")]
    pub step_decay_enabled: bool,
    /// Step floor as a fraction of `initial_step_size`.
    #[serde(default = "default_min_step_size_ratio")]
    pub min_step_size_ratio: f64,
    /// Step after a backtrack, as a fraction of `initial_step_size`.
    #[serde(default = "default_backtrack_step_fraction")]
    pub backtrack_step_fraction: f64,
    /// Expected Improvement margin; larger explores more.
    #[serde(default = "default_exploration_xi")]
    pub exploration_xi: f64,
    /// Seed for exploratory candidate sampling.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Valid shots needed before a manual optimization request is honoured.
    #[serde(default = "default_min_valid_shots_before_update")]
    pub min_valid_shots_before_update: u32,
    /// Invalid-shot streak that raises a warning status.
    #[serde(default = "default_max_consecutive_invalid_shots")]
    pub max_consecutive_invalid_shots: u32,
    /// Distance outlier threshold in standard deviations.
    #[serde(default = "default_abnormal_reading_sigma")]
    pub abnormal_reading_sigma: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            n_initial_points: default_n_initial_points(),
            n_calls_per_coefficient: default_n_calls_per_coefficient(),
            step_decay_enabled: true,
            min_step_size_ratio: default_min_step_size_ratio(),
            backtrack_step_fraction: default_backtrack_step_fraction(),
            exploration_xi: default_exploration_xi(),
            seed: default_seed(),
            min_valid_shots_before_update: default_min_valid_shots_before_update(),
            max_consecutive_invalid_shots: default_max_consecutive_invalid_shots(),
            abnormal_reading_sigma: default_abnormal_reading_sigma(),
        }
    }
}

// ── Physical limits ──────────────────────────────────────────────────────

/// Plausibility limits for reported shot data. A shot outside them is
/// treated as a sensor glitch and excluded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct PhysicalLimits {
    /// Minimum exit velocity, m/s.
    #[serde(default = "default_min_velocity_mps")]
    pub min_velocity_mps: f64,
    /// Maximum exit velocity, m/s.
    #[serde(default = "default_max_velocity_mps")]
    pub max_velocity_mps: f64,
    /// Minimum launch pitch, radians.
    #[serde(default = "default_min_angle_rad")]
    pub min_angle_rad: f64,
    /// Maximum launch pitch, radians.
    #[serde(default = "default_max_angle_rad")]
    pub max_angle_rad: f64,
    /// Minimum target distance, metres.
    #[serde(default = "default_min_distance_m")]
    pub min_distance_m: f64,
    /// Maximum target distance, metres.
    #[serde(default = "default_max_distance_m")]
    pub max_distance_m: f64,
}

impl Default for PhysicalLimits {
    fn default() -> Self {
        Self {
            min_velocity_mps: default_min_velocity_mps(),
            max_velocity_mps: default_max_velocity_mps(),
            min_angle_rad: default_min_angle_rad(),
            max_angle_rad: default_max_angle_rad(),
            min_distance_m: default_min_distance_m(),
            max_distance_m: default_max_distance_m(),
        }
    }
}

// ── Runtime ──────────────────────────────────────────────────────────────

/// Control loop timing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RuntimeConfig {
    /// Loop frequency.
    #[serde(default = "default_update_rate_hz")]
    pub update_rate_hz: f64,
    /// Upper bound on `stop()` waiting for the loop to drain.
    #[serde(default = "default_graceful_shutdown_timeout_ms")]
    pub graceful_shutdown_timeout_ms: u64,
    /// Command queue capacity.
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
    /// Stop recording shots while the robot reports an official match.
    #[serde(default = "default_true")]
    pub pause_during_match: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            update_rate_hz: default_update_rate_hz(),
            graceful_shutdown_timeout_ms: default_graceful_shutdown_timeout_ms(),
            command_capacity: default_command_capacity(),
            pause_during_match: true,
        }
    }
}

impl RuntimeConfig {
    /// Loop period derived from `update_rate_hz`.
    pub fn update_period(&self) -> Duration {
        period_for(self.update_rate_hz, default_update_rate_hz())
    }

    /// Shutdown budget as a [`Duration`].
    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_timeout_ms)
    }
}

// ── Logging ──────────────────────────────────────────────────────────────

/// Session log location.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct LogConfig {
    /// Directory receiving one JSON-lines file per session.
    #[serde(default = "default_log_directory")]
    pub directory: String,
    /// File name prefix.
    #[serde(default = "default_log_filename_prefix")]
    pub filename_prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: default_log_directory(),
            filename_prefix: default_log_filename_prefix(),
        }
    }
}

// ── Coefficients ─────────────────────────────────────────────────────────

/// One tunable coefficient of the shooting model.
///
/// Immutable once the coordinator has been built.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CoefficientSpec {
    /// Unique name, also the suffix of the default remote key.
    pub name: String,
    /// Value the robot starts with.
    pub default_value: f64,
    /// Lower bound, inclusive.
    pub min_value: f64,
    /// Upper bound, inclusive.
    pub max_value: f64,
    /// Initial local search radius.
    pub initial_step_size: f64,
    /// Geometric step decay per proposal, in `(0, 1]`.
    #[serde(default = "default_step_decay_rate")]
    pub step_decay_rate: f64,
    /// Round every value to a whole number.
    #[serde(default)]
    pub is_integer: bool,
    /// Include this coefficient in the campaign sequence.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Table key; defaults to `/Tuning/<name>`.
    #[serde(default)]
    pub remote_key: Option<String>,
    /// Per-coefficient autotune override.
    #[serde(default)]
    pub autotune: Option<PolicySetting>,
    /// Per-coefficient auto-advance override.
    #[serde(default)]
    pub auto_advance: Option<PolicySetting>,
}

impl CoefficientSpec {
    /// An enabled, real-valued coefficient with default decay and no overrides.
    pub fn new(name: &str, default_value: f64, min: f64, max: f64, step: f64) -> Self {
        Self {
            name: name.to_string(),
            default_value,
            min_value: min,
            max_value: max,
            initial_step_size: step,
            step_decay_rate: default_step_decay_rate(),
            is_integer: false,
            enabled: true,
            remote_key: None,
            autotune: None,
            auto_advance: None,
        }
    }

    /// Builder: mark as integer-valued.
    pub fn integer(mut self) -> Self {
        self.is_integer = true;
        self
    }

    /// Builder: exclude from the campaign sequence.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Builder: set the step decay rate.
    pub fn with_decay(mut self, rate: f64) -> Self {
        self.step_decay_rate = rate;
        self
    }

    /// Table key this coefficient is published under.
    pub fn remote_key(&self) -> String {
        match &self.remote_key {
            Some(key) if !key.is_empty() => key.clone(),
            _ => format!("/Tuning/{}", self.name),
        }
    }

    /// Clamp `value` into `[min, max]`, rounding integer coefficients.
    ///
    /// Non-finite input maps to the clamped default.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn clamp(&self, value: f64) -> f64 {
        let (lo, hi) = (self.min_value, self.max_value);
        let value = if value.is_finite() {
            value
        } else {
            self.default_value
        };
        let mut clamped = value.max(lo).min(hi);
        if !clamped.is_finite() {
            clamped = if lo.is_finite() { lo } else { 0.0 };
        }
        if self.is_integer {
            let (int_lo, int_hi) = (lo.ceil(), hi.floor());
            if int_lo <= int_hi {
                clamped = clamped.round().max(int_lo).min(int_hi);
            }
        }
        clamped
    }

    /// Whether `value` lies inside the declared bounds.
    pub fn contains(&self, value: f64) -> bool {
        value.is_finite() && value >= self.min_value && value <= self.max_value
    }

    /// Floor for the decayed step size.
    pub fn min_step_size(&self, ratio: f64) -> f64 {
        self.initial_step_size * ratio
    }

    /// Why this coefficient cannot be tuned, if it cannot.
    ///
    /// An enabled coefficient that fails this check is disabled by the
    /// optimizer rather than fed garbage proposals.
    pub fn defect(&self) -> Option<String> {
        let numbers = [
            self.default_value,
            self.min_value,
            self.max_value,
            self.initial_step_size,
            self.step_decay_rate,
        ];
        if numbers.iter().any(|v| !v.is_finite()) {
            return Some("contains a non-finite number".to_string());
        }
        if self.min_value >= self.max_value {
            return Some(format!(
                "min_value {} must be < max_value {}",
                self.min_value, self.max_value
            ));
        }
        if self.initial_step_size <= 0.0 {
            return Some(format!(
                "initial_step_size {} must be > 0",
                self.initial_step_size
            ));
        }
        if self.step_decay_rate <= 0.0 || self.step_decay_rate > 1.0 {
            return Some(format!(
                "step_decay_rate {} must be in (0, 1]",
                self.step_decay_rate
            ));
        }
        if self.is_integer && self.min_value.ceil() > self.max_value.floor() {
            return Some("integer coefficient has no whole number in range".to_string());
        }
        None
    }

    /// Effective autotune policy for this coefficient.
    pub fn effective_autotune_settings(&self, global: &PolicyConfig) -> PolicySetting {
        global.resolve(self.autotune)
    }

    /// Effective auto-advance policy for this coefficient.
    pub fn effective_auto_advance_settings(&self, global: &PolicyConfig) -> PolicySetting {
        global.resolve(self.auto_advance)
    }
}

/// Export the JSON Schema for [`TunerConfig`] as a pretty-printed string.
///
/// # Errors
///
/// Returns `Err` if serialization fails (should not happen in practice).
///
/// # Panics
///
/// This function never panics.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(TunerConfig);
    serde_json::to_string_pretty(&schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drag() -> CoefficientSpec {
        CoefficientSpec::new("kDragCoefficient", 0.003, 0.001, 0.01, 0.0001)
    }

    #[test]
    fn test_default_shot_threshold_returns_10() {
        assert_eq!(default_shot_threshold(), 10);
    }

    #[test]
    fn test_default_config_enables_four_coefficients_in_order() {
        let cfg = TunerConfig::default();
        let names: Vec<&str> = cfg
            .enabled_coefficients_in_order()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(
            names,
            vec![
                "kDragCoefficient",
                "kShooterAngle",
                "kShooterRPM",
                "kExitVelocity"
            ]
        );
    }

    #[test]
    fn test_server_address_derived_from_team_number() {
        let net = NetworkConfig::default();
        assert_eq!(net.server_address(), "10.58.92.2");
    }

    #[test]
    fn test_server_address_explicit_overrides_team() {
        let net = NetworkConfig {
            server_address: Some("localhost".into()),
            ..NetworkConfig::default()
        };
        assert_eq!(net.server_address(), "localhost");
    }

    #[test]
    fn test_remote_key_defaults_to_tuning_path() {
        assert_eq!(drag().remote_key(), "/Tuning/kDragCoefficient");
        let custom = CoefficientSpec {
            remote_key: Some("/Shooter/Drag".into()),
            ..drag()
        };
        assert_eq!(custom.remote_key(), "/Shooter/Drag");
    }

    #[test]
    fn test_clamp_real_value_into_bounds() {
        let c = drag();
        assert_eq!(c.clamp(0.5), 0.01);
        assert_eq!(c.clamp(-1.0), 0.001);
        assert_eq!(c.clamp(0.004), 0.004);
    }

    #[test]
    fn test_clamp_non_finite_maps_to_default() {
        let c = drag();
        assert_eq!(c.clamp(f64::NAN), 0.003);
        assert_eq!(c.clamp(f64::INFINITY), 0.003);
    }

    #[test]
    fn test_clamp_integer_rounds_and_stays_in_bounds() {
        let c = CoefficientSpec::new("kWeird", 1.0, 0.5, 2.7, 0.5).integer();
        assert_eq!(c.clamp(2.69), 2.0);
        assert_eq!(c.clamp(0.6), 1.0);
        assert_eq!(c.clamp(1.4), 1.0);
    }

    #[test]
    fn test_defect_detects_inverted_bounds() {
        let c = CoefficientSpec::new("k", 1.0, 2.0, 1.0, 0.1);
        assert!(c.defect().is_some());
    }

    #[test]
    fn test_defect_detects_non_positive_step() {
        let c = CoefficientSpec::new("k", 1.0, 0.0, 2.0, 0.0);
        assert!(c.defect().is_some());
    }

    #[test]
    fn test_defect_detects_decay_out_of_range() {
        assert!(drag().with_decay(0.0).defect().is_some());
        assert!(drag().with_decay(1.5).defect().is_some());
        assert!(drag().with_decay(1.0).defect().is_none());
    }

    #[test]
    fn test_defect_detects_integer_without_whole_number() {
        let c = CoefficientSpec::new("k", 0.5, 0.2, 0.8, 0.1).integer();
        assert!(c.defect().is_some());
    }

    #[test]
    fn test_policy_force_global_ignores_override() {
        let global = PolicyConfig {
            enabled: false,
            shot_threshold: 10,
            force_global: true,
        };
        let c = CoefficientSpec {
            autotune: Some(PolicySetting {
                enabled: true,
                shot_threshold: 3,
            }),
            ..drag()
        };
        assert_eq!(c.effective_autotune_settings(&global), global.setting());
    }

    #[test]
    fn test_policy_override_beats_global_without_force() {
        let global = PolicyConfig::default();
        let local = PolicySetting {
            enabled: true,
            shot_threshold: 4,
        };
        let c = CoefficientSpec {
            auto_advance: Some(local),
            ..drag()
        };
        assert_eq!(c.effective_auto_advance_settings(&global), local);
    }

    #[test]
    fn test_policy_without_override_uses_global() {
        let global = PolicyConfig {
            enabled: true,
            shot_threshold: 7,
            force_global: false,
        };
        assert_eq!(drag().effective_autotune_settings(&global), global.setting());
    }

    #[test]
    fn test_period_for_rejects_non_positive_rate() {
        let rates = RateLimitConfig {
            max_write_hz: 0.0,
            ..RateLimitConfig::default()
        };
        assert!((rates.write_period().as_secs_f64() - 0.02).abs() < 1e-9);
    }

    #[test]
    fn test_update_period_default_100ms() {
        let period = RuntimeConfig::default().update_period();
        assert!((period.as_secs_f64() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_export_schema_produces_valid_json() {
        let schema = export_schema().expect("test: schema export");
        let parsed: serde_json::Value = serde_json::from_str(&schema).expect("test: valid JSON");
        assert!(parsed.is_object());
        assert!(schema.contains("coefficients"));
    }
}
