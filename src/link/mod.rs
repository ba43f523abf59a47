//! # Stage: Robot Link
//!
//! ## Responsibility
//! Typed, rate-limited, staleness-aware bridge between the coordinator and
//! the table transport: shot polling by timestamp change, coefficient
//! read/write, heartbeat, interlock flags and status publication.
//!
//! ## Guarantees
//! - Bounded: `connect` gives up after the configured timeout; every other
//!   call returns immediately
//! - Non-raising: remote failures degrade to `None`, `false` or the
//!   caller's fallback; only [`RobotLink::try_connect`] returns a typed error
//! - Monotonic: [`RobotLink::read_shot_data`] returns a shot only when the
//!   shot timestamp strictly increases
//! - Rate limiting uses governor's monotonic clock, never transport acks
//!
//! ## NOT Responsible For
//! - Deciding what to write (that belongs to `optimizer`)
//! - Scheduling and reconnect pacing (that belongs to `coordinator`)

pub mod keys;

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{CoefficientSpec, TunerConfig};
use crate::optimizer::ShotObservation;
use crate::transport::{TableTransport, TableValue, TransportError};

type DirectLimiter = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Errors from establishing a link session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    /// The transport refused the session.
    #[error("connection failed: {0}")]
    Connection(#[from] TransportError),

    /// The transport did not answer in time.
    #[error("connect to {target} timed out after {after_ms}ms")]
    Timeout {
        /// Address that was dialled.
        target: String,
        /// Timeout that elapsed.
        after_ms: u64,
    },
}

/// Quota allowing `burst` events, refilled one every `period`.
fn spacing_quota(period: Duration, burst: u32) -> Quota {
    let burst = NonZeroU32::new(burst.max(1)).unwrap_or(NonZeroU32::MIN);
    Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(NonZeroU32::MAX))
        .allow_burst(burst)
}

/// Typed view of the robot's table.
///
/// Owned by the coordinator's loop, which is its only caller while running.
pub struct RobotLink {
    transport: Arc<dyn TableTransport>,
    coefficients: HashMap<String, CoefficientSpec>,
    connect_timeout: Duration,
    batch_writes: bool,
    heartbeat_limiter: DirectLimiter,
    read_limiter: DirectLimiter,
    write_quota: Quota,
    write_limiters: DashMap<String, DirectLimiter>,
    published: DashMap<&'static str, TableValue>,
    last_shot_timestamp: Option<f64>,
    last_enable_toggle: Option<bool>,
}

impl RobotLink {
    /// Build a link over `transport` for the coefficients in `config`.
    ///
    /// Duplicate coefficient names keep their first definition.
    pub fn new(transport: Arc<dyn TableTransport>, config: &TunerConfig) -> Self {
        let mut coefficients = HashMap::new();
        for spec in &config.coefficients {
            coefficients
                .entry(spec.name.clone())
                .or_insert_with(|| spec.clone());
        }
        let read_period = config.rates.read_period();
        Self {
            transport,
            coefficients,
            connect_timeout: config.network.connect_timeout(),
            batch_writes: config.rates.batch_writes,
            heartbeat_limiter: GovernorRateLimiter::direct(spacing_quota(
                config.network.heartbeat_interval(),
                1,
            )),
            read_limiter: GovernorRateLimiter::direct(spacing_quota(read_period, 1)),
            write_quota: spacing_quota(config.rates.write_period(), 1),
            write_limiters: DashMap::new(),
            published: DashMap::new(),
            last_shot_timestamp: None,
            last_enable_toggle: None,
        }
    }

    // ─── Connection ──────────────────────────────────────────────────────

    /// Open a session, bounded by the connect timeout.
    ///
    /// # Errors
    ///
    /// - [`LinkError::Timeout`] if the transport does not answer in time.
    /// - [`LinkError::Connection`] if it refuses.
    ///
    /// In both cases the link is left disconnected.
    pub async fn try_connect(&self, target: &str) -> Result<(), LinkError> {
        match tokio::time::timeout(self.connect_timeout, self.transport.connect(target)).await {
            Ok(Ok(())) => {
                // A reconnect may follow a robot reboot that wiped the table.
                self.published.clear();
                info!(target = target, "robot link connected");
                Ok(())
            }
            Ok(Err(e)) => {
                self.transport.disconnect();
                Err(LinkError::Connection(e))
            }
            Err(_) => {
                self.transport.disconnect();
                Err(LinkError::Timeout {
                    target: target.to_string(),
                    after_ms: self.connect_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Open a session; `false` on failure or timeout, never an error.
    pub async fn connect(&self, target: &str) -> bool {
        match self.try_connect(target).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "robot link connect failed");
                false
            }
        }
    }

    /// Last-known transport state.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Publish a final disabled status and release the session.
    pub fn stop(&self) {
        if self.is_connected() {
            let _ = self.put(keys::TUNER_ENABLED, TableValue::Boolean(false));
            let _ = self.transport.flush();
        }
        self.transport.disconnect();
        info!("robot link stopped");
    }

    /// Guard that releases the session when dropped.
    pub fn session_guard(&self) -> SessionGuard {
        SessionGuard {
            transport: Arc::clone(&self.transport),
        }
    }

    /// Push buffered writes. Called once per loop iteration in batch mode.
    pub fn flush(&self) -> bool {
        self.is_connected() && self.transport.flush().is_ok()
    }

    // ─── Heartbeat ───────────────────────────────────────────────────────

    /// Write the current time to the heartbeat key.
    ///
    /// Calls within the heartbeat interval are coalesced: nothing is written
    /// and `false` is returned.
    pub fn publish_heartbeat(&self) -> bool {
        if !self.is_connected() || self.heartbeat_limiter.check().is_err() {
            return false;
        }
        self.put(keys::HEARTBEAT, TableValue::Number(crate::unix_seconds()))
    }

    // ─── Shots ───────────────────────────────────────────────────────────

    /// Poll for a new shot.
    ///
    /// Returns `Some` only when the shot timestamp is strictly greater than
    /// the last one returned. Shot fields are read after the timestamp, which
    /// the robot writes last.
    pub fn read_shot_data(&mut self) -> Option<ShotObservation> {
        if !self.is_connected() || self.read_limiter.check().is_err() {
            return None;
        }
        let timestamp = match self.transport.get_number(keys::SHOT_TIMESTAMP) {
            Ok(Some(ts)) if ts.is_finite() && ts > 0.0 => ts,
            Ok(_) => return None,
            Err(e) => {
                debug!(error = %e, "shot timestamp unreadable");
                return None;
            }
        };
        if self.last_shot_timestamp.is_some_and(|last| timestamp <= last) {
            return None;
        }
        self.last_shot_timestamp = Some(timestamp);

        let hit = match self.transport.get(keys::SHOT_HIT) {
            Ok(Some(TableValue::Boolean(b))) => Some(b),
            Ok(Some(TableValue::Number(n))) if n.is_finite() => Some(n != 0.0),
            _ => None,
        };
        let observation = ShotObservation {
            hit,
            distance: self.number(keys::SHOT_DISTANCE),
            exit_velocity: self.number(keys::SHOT_EXIT_VELOCITY),
            pitch: self.number(keys::SHOT_PITCH),
            timestamp,
            coefficients: self.coefficient_snapshot(),
        };
        debug!(timestamp, hit = ?observation.hit, "new shot");
        Some(observation)
    }

    /// Timestamp of the last shot returned by [`Self::read_shot_data`].
    pub fn last_shot_timestamp(&self) -> Option<f64> {
        self.last_shot_timestamp
    }

    /// Values in effect at shot time: the firing solver's per-shot copy,
    /// then the live coefficient key, then the default.
    fn coefficient_snapshot(&self) -> BTreeMap<String, f64> {
        self.coefficients
            .values()
            .map(|spec| {
                let value = self
                    .number(&keys::shot_coefficient(&spec.name))
                    .or_else(|| self.number(&spec.remote_key()))
                    .unwrap_or(spec.default_value);
                (spec.name.clone(), value)
            })
            .collect()
    }

    fn number(&self, key: &str) -> Option<f64> {
        self.transport.get_number(key).ok().flatten()
    }

    // ─── Coefficients ────────────────────────────────────────────────────

    /// Write a coefficient to its remote key.
    ///
    /// Limited to one write per coefficient per write period unless `force`
    /// is set. Returns `false` when rate limited, disconnected, unknown or
    /// rejected by the transport.
    pub fn write_coefficient(&self, name: &str, value: f64, force: bool) -> bool {
        let Some(spec) = self.coefficients.get(name) else {
            warn!(coefficient = name, "write to unknown coefficient");
            return false;
        };
        if !self.is_connected() {
            return false;
        }
        if !force {
            let allowed = self
                .write_limiters
                .entry(name.to_string())
                .or_insert_with(|| GovernorRateLimiter::direct(self.write_quota))
                .check()
                .is_ok();
            if !allowed {
                debug!(coefficient = name, "coefficient write rate limited");
                return false;
            }
        }
        match self
            .transport
            .put(&spec.remote_key(), TableValue::Number(value))
        {
            Ok(()) => {
                if !self.batch_writes {
                    let _ = self.transport.flush();
                }
                debug!(coefficient = name, value, force, "coefficient written");
                true
            }
            Err(e) => {
                warn!(coefficient = name, error = %e, "coefficient write failed");
                false
            }
        }
    }

    /// Current remote value of a coefficient, or `fallback`.
    pub fn read_coefficient(&self, name: &str, fallback: f64) -> f64 {
        self.coefficients
            .get(name)
            .and_then(|spec| self.number(&spec.remote_key()))
            .unwrap_or(fallback)
    }

    // ─── Interlocks ──────────────────────────────────────────────────────

    /// Tell the robot the last shot has been recorded.
    pub fn signal_shot_logged(&self) -> bool {
        self.put(keys::SHOT_LOGGED, TableValue::Boolean(true))
    }

    /// Tell the robot new coefficients are in place.
    pub fn signal_coefficients_updated(&self) -> bool {
        self.put(keys::COEFFICIENTS_UPDATED, TableValue::Boolean(true))
    }

    /// Publish which interlocks the robot must honour.
    pub fn write_interlock_settings(
        &self,
        require_shot_logged: bool,
        require_coefficients_updated: bool,
    ) -> bool {
        let a = self.publish(
            keys::REQUIRE_SHOT_LOGGED,
            TableValue::Boolean(require_shot_logged),
        );
        let b = self.publish(
            keys::REQUIRE_COEFFICIENTS_UPDATED,
            TableValue::Boolean(require_coefficients_updated),
        );
        a && b
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Publish whether tuning is active and whether it is paused.
    pub fn write_tuner_enabled_status(&self, enabled: bool, paused: bool) {
        self.publish(keys::TUNER_ENABLED, TableValue::Boolean(enabled));
        self.publish(keys::TUNER_PAUSED, TableValue::Boolean(paused));
    }

    /// Publish autotune mode and shot progress.
    pub fn write_autotune_status(&self, autotune_enabled: bool, shot_count: u32, shot_threshold: u32) {
        self.publish(keys::AUTOTUNE_ENABLED, TableValue::Boolean(autotune_enabled));
        self.publish(keys::SHOT_COUNT, TableValue::Number(f64::from(shot_count)));
        self.publish(keys::SHOT_THRESHOLD, TableValue::Number(f64::from(shot_threshold)));
    }

    /// Publish the active coefficient and its effective policies.
    /// `None` publishes an empty name.
    pub fn write_current_coefficient_info(
        &self,
        name: Option<&str>,
        is_autotune: bool,
        shot_threshold: u32,
        auto_advance: bool,
    ) {
        self.publish(
            keys::CURRENT_COEFFICIENT,
            TableValue::Text(name.unwrap_or_default().to_string()),
        );
        self.publish(keys::AUTOTUNE_ENABLED, TableValue::Boolean(is_autotune));
        self.publish(keys::SHOT_THRESHOLD, TableValue::Number(f64::from(shot_threshold)));
        self.publish(keys::AUTO_ADVANCE, TableValue::Boolean(auto_advance));
    }

    /// Publish a free-text runtime status (warnings, "ok").
    pub fn write_runtime_status(&self, text: &str) {
        self.publish(keys::RUNTIME_STATUS, TableValue::Text(text.to_string()));
    }

    // ─── Dashboard inputs ────────────────────────────────────────────────

    /// Consume the dashboard's "run optimization" button.
    pub fn read_run_optimization_request(&self) -> bool {
        match self.transport.get_bool(keys::RUN_OPTIMIZATION) {
            Ok(Some(true)) => {
                let _ = self
                    .transport
                    .put(keys::RUN_OPTIMIZATION, TableValue::Boolean(false));
                true
            }
            _ => false,
        }
    }

    /// The dashboard's enable toggle, reported only when it changes.
    pub fn read_tuner_enabled_toggle(&mut self) -> Option<bool> {
        let value = self
            .transport
            .get_bool(keys::TUNER_ENABLED_TOGGLE)
            .ok()
            .flatten()?;
        if self.last_enable_toggle == Some(value) {
            return None;
        }
        self.last_enable_toggle = Some(value);
        Some(value)
    }

    /// Whether the robot is in an official match (FMS attached).
    pub fn read_match_mode(&self) -> bool {
        self.number(keys::FMS_CONTROL_DATA)
            .filter(|v| v.is_finite() && *v >= 0.0)
            .is_some_and(|v| (v as u32) & keys::FMS_ATTACHED_BIT != 0)
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn put(&self, key: &str, value: TableValue) -> bool {
        if !self.is_connected() {
            return false;
        }
        match self.transport.put(key, value) {
            Ok(()) => {
                if !self.batch_writes {
                    let _ = self.transport.flush();
                }
                true
            }
            Err(e) => {
                debug!(key = key, error = %e, "table write failed");
                false
            }
        }
    }

    /// Write a status key only when its value changed since the last
    /// successful publication on this session.
    fn publish(&self, key: &'static str, value: TableValue) -> bool {
        if self.published.get(key).is_some_and(|prev| *prev == value) {
            return true;
        }
        let ok = self.put(key, value.clone());
        if ok {
            self.published.insert(key, value);
        }
        ok
    }
}

/// Releases the transport session when dropped.
///
/// Held by the coordinator loop so the session is released on every exit
/// path, including task abort and panic unwinding.
pub struct SessionGuard {
    transport: Arc<dyn TableTransport>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.transport.disconnect();
    }
}
