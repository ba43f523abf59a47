//! Per-coefficient campaign state.

use serde::{Deserialize, Serialize};

use super::history::CampaignHistory;
use crate::config::CoefficientSpec;

/// Phase of one coefficient campaign.
///
/// ```text
/// Pending ──► Active ──► Converged | Skipped
///    ▲          │  ▲            │
///    └── jump ──┘  └─ backtrack ┘
/// ```
/// The cursor is "done" when no campaign is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignPhase {
    /// Not reached yet, or left by a jump before finishing.
    Pending,
    /// Collecting shots.
    Active,
    /// Finished by advance or auto-advance.
    Converged,
    /// Finished by a manual skip.
    Skipped,
}

impl CampaignPhase {
    /// Whether the campaign has been finished.
    pub fn is_finished(self) -> bool {
        matches!(self, CampaignPhase::Converged | CampaignPhase::Skipped)
    }
}

/// Mutable state of one coefficient campaign.
#[derive(Debug, Clone)]
pub struct Campaign {
    pub(crate) spec: CoefficientSpec,
    pub(crate) phase: CampaignPhase,
    pub(crate) history: CampaignHistory,
    /// Current search radius.
    pub(crate) step: f64,
    /// Value believed to be in effect on the robot.
    pub(crate) current_value: f64,
    /// Proposals since the campaign was (re)activated.
    pub(crate) proposals: u32,
    /// Bootstrap proposals since the campaign was (re)activated.
    pub(crate) bootstrap_index: u32,
    pub(crate) shots_since_trigger: u32,
    pub(crate) consecutive_invalid: u32,
    pub(crate) pinned: bool,
    /// History index where the current activation started.
    pub(crate) activation_start: usize,
    /// Sign of the next exploratory step.
    pub(crate) direction: f64,
}

impl Campaign {
    pub(crate) fn new(spec: CoefficientSpec, min_step_ratio: f64) -> Self {
        let current_value = spec.clamp(spec.default_value);
        let step = spec
            .initial_step_size
            .max(spec.min_step_size(min_step_ratio));
        Self {
            spec,
            phase: CampaignPhase::Pending,
            history: CampaignHistory::default(),
            step,
            current_value,
            proposals: 0,
            bootstrap_index: 0,
            shots_since_trigger: 0,
            consecutive_invalid: 0,
            pinned: false,
            activation_start: 0,
            direction: 1.0,
        }
    }

    /// Coefficient definition.
    pub fn spec(&self) -> &CoefficientSpec {
        &self.spec
    }

    /// Current phase.
    pub fn phase(&self) -> CampaignPhase {
        self.phase
    }

    /// Recorded shots.
    pub fn history(&self) -> &CampaignHistory {
        &self.history
    }

    /// Current search radius.
    pub fn step(&self) -> f64 {
        self.step
    }

    /// Smallest radius the step may decay to.
    pub(crate) fn step_floor(&self, ratio: f64) -> f64 {
        self.spec.min_step_size(ratio)
    }

    /// Geometric decay, floored.
    pub(crate) fn decay_step(&mut self, ratio: f64) {
        let floor = self.step_floor(ratio);
        self.step = (self.step * self.spec.step_decay_rate).max(floor);
    }

    /// Start collecting shots; counters restart, history is kept.
    pub(crate) fn activate(&mut self) {
        self.phase = CampaignPhase::Active;
        self.shots_since_trigger = 0;
        self.consecutive_invalid = 0;
        self.activation_start = self.history.len();
    }

    /// Fresh local search after returning to a finished campaign.
    pub(crate) fn restart_search(&mut self, fraction: f64, min_step_ratio: f64) {
        let floor = self.step_floor(min_step_ratio);
        self.step = (self.spec.initial_step_size * fraction).max(floor);
        self.proposals = 0;
        self.bootstrap_index = 0;
        self.pinned = false;
    }
}
