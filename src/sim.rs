//! # Stage: Simulated Robot
//!
//! ## Responsibility
//! Stand in for the robot controller on the far side of a [`MemoryTable`]:
//! read the live coefficient values, shoot with a hit probability that peaks
//! at hidden optimal values, and publish each shot the way the firing solver
//! does (every field first, the timestamp last).
//!
//! ## Guarantees
//! - Shot timestamps strictly increase
//! - When the shot-logged interlock is required, no new shot is published
//!   until the previous one has been acknowledged
//! - Deterministic for a given seed
//!
//! ## NOT Responsible For
//! - Physics beyond a smooth hit-probability surface

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::TunerConfig;
use crate::link::keys;
use crate::transport::MemoryTable;

/// A coefficient the simulated robot is sensitive to.
#[derive(Debug, Clone, PartialEq)]
pub struct SimTarget {
    /// Coefficient name.
    pub name: String,
    /// Key the tuner writes to.
    pub remote_key: String,
    /// Value used when the tuner has written nothing.
    pub default_value: f64,
    /// Value maximising the hit probability.
    pub optimum: f64,
    /// Distance from the optimum at which the hit factor drops to ~0.6.
    pub tolerance: f64,
}

/// Robot peer for demos and tests.
pub struct SimulatedRobot {
    table: MemoryTable,
    targets: Vec<SimTarget>,
    peak_hit_rate: f64,
    rng: StdRng,
    next_timestamp: f64,
    awaiting_ack: bool,
    shots: u64,
    updates_applied: u64,
}

impl SimulatedRobot {
    /// A robot whose optimum for each enabled coefficient sits three initial
    /// steps above its default.
    pub fn new(table: MemoryTable, config: &TunerConfig, seed: u64) -> Self {
        let targets = config
            .enabled_coefficients_in_order()
            .into_iter()
            .filter(|spec| spec.defect().is_none())
            .map(|spec| {
                let range = spec.max_value - spec.min_value;
                SimTarget {
                    name: spec.name.clone(),
                    remote_key: spec.remote_key(),
                    default_value: spec.default_value,
                    optimum: spec.clamp(spec.default_value + 3.0 * spec.initial_step_size),
                    tolerance: (4.0 * spec.initial_step_size).max(0.05 * range),
                }
            })
            .collect();
        Self {
            table,
            targets,
            peak_hit_rate: 0.9,
            rng: StdRng::seed_from_u64(seed),
            next_timestamp: 1.0,
            awaiting_ack: false,
            shots: 0,
            updates_applied: 0,
        }
    }

    /// Override the optimum and tolerance of one coefficient.
    pub fn with_optimum(mut self, name: &str, optimum: f64, tolerance: f64) -> Self {
        if let Some(t) = self.targets.iter_mut().find(|t| t.name == name) {
            t.optimum = optimum;
            t.tolerance = tolerance;
        }
        self
    }

    /// Hit probability at the optimum.
    pub fn with_peak_hit_rate(mut self, rate: f64) -> Self {
        self.peak_hit_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Targets, in tuning order.
    pub fn targets(&self) -> &[SimTarget] {
        &self.targets
    }

    /// Shots published so far.
    pub fn shots(&self) -> u64 {
        self.shots
    }

    /// Coefficient-update handshakes acknowledged so far.
    pub fn updates_applied(&self) -> u64 {
        self.updates_applied
    }

    /// Value the robot is currently using for `target`.
    fn live_value(&self, target: &SimTarget) -> f64 {
        self.table
            .peer_number(&target.remote_key)
            .filter(|v| v.is_finite())
            .unwrap_or(target.default_value)
    }

    /// Hit probability with the coefficients currently on the table.
    pub fn hit_probability(&self) -> f64 {
        self.targets.iter().fold(self.peak_hit_rate, |p, t| {
            let z = (self.live_value(t) - t.optimum) / t.tolerance;
            p * (-0.5 * z * z).exp()
        })
    }

    /// Take one shot. `None` while waiting for the tuner to acknowledge the
    /// previous one.
    pub fn fire(&mut self) -> Option<bool> {
        self.acknowledge_update();
        let require_logged = self
            .table
            .peer_bool(keys::REQUIRE_SHOT_LOGGED)
            .unwrap_or(false);
        if require_logged
            && self.awaiting_ack
            && self.table.peer_bool(keys::SHOT_LOGGED) != Some(true)
        {
            return None;
        }

        let hit = self.rng.gen_bool(self.hit_probability().clamp(0.0, 1.0));
        for t in &self.targets {
            let value = self.live_value(t);
            self.table.peer_put(&keys::shot_coefficient(&t.name), value);
        }
        let distance: f64 = self.rng.gen_range(2.0..6.0);
        self.table.peer_put(keys::SHOT_HIT, hit);
        self.table.peer_put(keys::SHOT_DISTANCE, distance);
        self.table.peer_put(keys::SHOT_PITCH, 0.6 + 0.02 * distance);
        self.table
            .peer_put(keys::SHOT_EXIT_VELOCITY, 10.0 + 1.5 * distance);
        self.table.peer_put(keys::SHOT_LOGGED, false);
        // Timestamp last: the tuner treats it as the commit marker.
        self.table.peer_put(keys::SHOT_TIMESTAMP, self.next_timestamp);

        self.next_timestamp += 1.0;
        self.awaiting_ack = true;
        self.shots += 1;
        debug!(shot = self.shots, hit, distance, "simulated shot");
        Some(hit)
    }

    /// Consume the coefficients-updated flag, as the firing solver does
    /// before reloading its constants.
    fn acknowledge_update(&mut self) {
        if self.table.peer_bool(keys::COEFFICIENTS_UPDATED) == Some(true) {
            self.table.peer_put(keys::COEFFICIENTS_UPDATED, false);
            self.updates_applied += 1;
        }
    }

    /// Shoot every `period` until `shutdown` flips. Returns the shot count.
    pub async fn run(mut self, period: Duration, mut shutdown: watch::Receiver<bool>) -> u64 {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(targets = self.targets.len(), "simulated robot running");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            self.fire();
        }
        info!(shots = self.shots, "simulated robot stopped");
        self.shots
    }
}
