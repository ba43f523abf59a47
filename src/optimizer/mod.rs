//! # Stage: Sequential Optimizer
//!
//! ## Responsibility
//! Run one optimization campaign per coefficient, in tuning order: record
//! shots, decide when enough evidence exists, propose the next value for
//! the active coefficient, and move the cursor on advance, skip, jump,
//! backtrack and reset.
//!
//! ## Guarantees
//! - Every proposal is clamped to `[min, max]`, rounded for integer
//!   coefficients, and finite
//! - The step size decays geometrically per proposal but never below
//!   `min_step_size_ratio × initial_step_size`
//! - Invalid shots are never raised: they are kept as excluded records and
//!   counted in the consecutive-invalid streak
//! - Every evaluation, proposal and transition is appended to the journal
//!   exactly once, in order
//! - Coefficients that are disabled or defective never get a campaign
//!
//! ## NOT Responsible For
//! - Writing values to the robot (that belongs to `link`)
//! - Scheduling (that belongs to `coordinator`)
//! - Persisting the journal (that belongs to `session_log`)

pub mod campaign;
pub mod history;
pub mod surrogate;

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{
    CoefficientSpec, OptimizerConfig, PhysicalLimits, PolicyConfig, PolicySetting, TunerConfig,
};
use campaign::{Campaign, CampaignPhase};
use history::{
    CampaignTransition, EvaluationRecord, JournalEntry, ProposalRecord, TransitionCause,
    ValueGroup,
};
use surrogate::{expected_improvement, GaussianProcess};

/// Evenly spaced candidates across the trust region.
const GRID_POINTS: usize = 24;
/// Random candidates across the trust region.
const RANDOM_POINTS: usize = 8;
/// Accepted distances needed before outlier rejection starts.
const MIN_DISTANCE_SAMPLES: usize = 10;
/// Expected Improvement below this is treated as "nothing to gain".
const MIN_EXPECTED_IMPROVEMENT: f64 = 1e-9;

// ─── Types ──────────────────────────────────────────────────────────────────

/// One shot as reported by the robot (or entered by an operator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotObservation {
    /// Outcome; `None` when the robot published no outcome.
    pub hit: Option<bool>,
    /// Distance to target, metres.
    pub distance: Option<f64>,
    /// Exit velocity of the firing solution, m/s.
    pub exit_velocity: Option<f64>,
    /// Launch pitch of the firing solution, radians.
    pub pitch: Option<f64>,
    /// Robot timestamp; strictly increasing per shot.
    pub timestamp: f64,
    /// Every coefficient value in effect at shot time.
    pub coefficients: BTreeMap<String, f64>,
}

impl ShotObservation {
    /// An operator-entered shot without firing-solution data.
    pub fn manual(hit: bool, coefficients: BTreeMap<String, f64>, timestamp: f64) -> Self {
        Self {
            hit: Some(hit),
            distance: None,
            exit_velocity: None,
            pitch: None,
            timestamp,
            coefficients,
        }
    }
}

/// Why a shot was excluded.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    /// The robot published no hit/miss.
    MissingOutcome,
    /// A field is NaN or infinite.
    NonFinite {
        /// Offending field.
        field: String,
    },
    /// A coefficient in the snapshot lies outside its declared bounds.
    CoefficientOutOfBounds {
        /// Coefficient name.
        name: String,
        /// Reported value.
        value: f64,
    },
    /// A firing-solution field lies outside the physical limits.
    PhysicallyImplausible {
        /// Offending field.
        field: &'static str,
        /// Reported value.
        value: f64,
    },
    /// Distance far outside what this campaign has seen.
    AbnormalDistance {
        /// Reported distance.
        distance: f64,
        /// Campaign mean.
        mean: f64,
        /// Campaign standard deviation.
        std_dev: f64,
    },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MissingOutcome => write!(f, "missing hit/miss outcome"),
            RejectReason::NonFinite { field } => write!(f, "{field} is not finite"),
            RejectReason::CoefficientOutOfBounds { name, value } => {
                write!(f, "{name}={value} outside declared bounds")
            }
            RejectReason::PhysicallyImplausible { field, value } => {
                write!(f, "{field}={value} outside physical limits")
            }
            RejectReason::AbnormalDistance {
                distance,
                mean,
                std_dev,
            } => write!(
                f,
                "distance {distance:.2}m is abnormal (mean {mean:.2}m, sd {std_dev:.2}m)"
            ),
        }
    }
}

/// Outcome of [`SequentialOptimizer::record_shot`].
#[derive(Debug, Clone, PartialEq)]
pub enum ShotDisposition {
    /// Recorded as optimizer input.
    Accepted {
        /// Campaign.
        coefficient: String,
        /// Value in effect.
        value: f64,
        /// Campaign success rate including this shot.
        success_rate: f64,
    },
    /// Recorded for audit only.
    Rejected {
        /// Why.
        reason: RejectReason,
        /// Consecutive invalid shots including this one.
        streak: u32,
        /// The streak reached the warning threshold.
        streak_exceeded: bool,
    },
    /// No campaign is active; nothing was recorded.
    NoActiveCampaign,
}

/// How a proposal was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStrategy {
    /// Fixed perturbation around the default while data is scarce.
    Bootstrap,
    /// Maximum Expected Improvement inside the trust region.
    ExpectedImprovement,
    /// Plain step in alternating direction when the surrogate has nothing to offer.
    Exploratory,
}

/// A value the coordinator should write.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    /// Campaign.
    pub coefficient: String,
    /// Clamped, rounded, finite value.
    pub value: f64,
    /// Search radius the value was chosen with.
    pub step: f64,
    /// How it was chosen.
    pub strategy: ProposalStrategy,
    /// 1-based proposal count within the current activation.
    pub index: u32,
}

/// Invalid navigation requests.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizerError {
    /// The name has no campaign (undefined, disabled or defective).
    #[error("'{0}' is not a tunable coefficient")]
    UnknownCoefficient(String),

    /// The campaign is not in a phase that allows the request.
    #[error("cannot {action} '{name}' while it is {phase:?}")]
    InvalidTransition {
        /// Requested action.
        action: &'static str,
        /// Campaign.
        name: String,
        /// Its phase.
        phase: CampaignPhase,
    },
}

/// Read-only snapshot of the campaign cursor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignState {
    /// Index into the campaign sequence; `None` when done.
    pub index: Option<usize>,
    /// Active coefficient.
    pub coefficient: Option<String>,
    /// Active search radius.
    pub step: Option<f64>,
    /// Value believed to be in effect for the active coefficient.
    pub current_value: Option<f64>,
    /// Valid shots since the last optimization.
    pub shots_since_trigger: u32,
    /// Current invalid-shot streak.
    pub consecutive_invalid: u32,
    /// Auto-advance suppressed for the active campaign.
    pub pinned: bool,
    /// Proposals in the current activation.
    pub proposals: u32,
    /// Campaign success rate over accepted shots.
    pub success_rate: f64,
    /// Every campaign with its phase and history length.
    pub campaigns: Vec<CampaignSummary>,
}

/// One line of [`CampaignState::campaigns`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignSummary {
    /// Coefficient.
    pub name: String,
    /// Phase.
    pub phase: CampaignPhase,
    /// Recorded shots, accepted and excluded.
    pub shots: usize,
}

// ─── Optimizer ──────────────────────────────────────────────────────────────

/// Per-coefficient sequential optimizer.
///
/// The coordinator loop is its only writer.
pub struct SequentialOptimizer {
    settings: OptimizerConfig,
    physical: PhysicalLimits,
    autotune: PolicyConfig,
    auto_advance: PolicyConfig,
    campaigns: Vec<Campaign>,
    cursor: Option<usize>,
    journal: Vec<JournalEntry>,
    rng: StdRng,
}

impl SequentialOptimizer {
    /// Build campaigns for the enabled, usable coefficients in tuning order
    /// and activate the first one.
    pub fn new(config: &TunerConfig) -> Self {
        let mut seen = HashSet::new();
        let mut campaigns = Vec::new();
        for spec in config.enabled_coefficients_in_order() {
            if !seen.insert(spec.name.clone()) {
                continue;
            }
            if let Some(defect) = spec.defect() {
                warn!(coefficient = %spec.name, defect = %defect, "coefficient disabled");
                continue;
            }
            campaigns.push(Campaign::new(
                spec.clone(),
                config.optimizer.min_step_size_ratio,
            ));
        }
        let mut optimizer = Self {
            settings: config.optimizer,
            physical: config.physical,
            autotune: config.autotune,
            auto_advance: config.auto_advance,
            campaigns,
            cursor: None,
            journal: Vec::new(),
            rng: StdRng::seed_from_u64(config.optimizer.seed),
        };
        optimizer.activate_first();
        optimizer
    }

    // ─── Queries ────────────────────────────────────────────────────────

    /// Active coefficient, `None` when done or when nothing is tunable.
    pub fn current_coefficient_name(&self) -> Option<&str> {
        self.current().map(|c| c.spec.name.as_str())
    }

    /// Active coefficient definition.
    pub fn current_spec(&self) -> Option<&CoefficientSpec> {
        self.current().map(|c| &c.spec)
    }

    /// Campaign by coefficient name.
    pub fn campaign(&self, name: &str) -> Option<&Campaign> {
        self.campaigns.iter().find(|c| c.spec.name == name)
    }

    /// Names of all campaigns, in order.
    pub fn campaign_names(&self) -> Vec<&str> {
        self.campaigns.iter().map(|c| c.spec.name.as_str()).collect()
    }

    /// Effective autotune policy of the active coefficient.
    pub fn effective_autotune(&self) -> Option<PolicySetting> {
        self.current_spec()
            .map(|s| s.effective_autotune_settings(&self.autotune))
    }

    /// Effective auto-advance policy of the active coefficient.
    pub fn effective_auto_advance(&self) -> Option<PolicySetting> {
        self.current_spec()
            .map(|s| s.effective_auto_advance_settings(&self.auto_advance))
    }

    /// Valid shots since the last optimization trigger.
    pub fn shots_since_trigger(&self) -> u32 {
        self.current().map_or(0, |c| c.shots_since_trigger)
    }

    /// Whether the invalid streak reached its warning threshold.
    pub fn invalid_streak_exceeded(&self) -> bool {
        self.current().is_some_and(|c| {
            c.consecutive_invalid >= self.settings.max_consecutive_invalid_shots.max(1)
        })
    }

    /// Whether the active campaign used its proposal budget.
    pub fn campaign_budget_exhausted(&self) -> bool {
        self.current()
            .is_some_and(|c| c.proposals >= self.settings.n_calls_per_coefficient.max(1))
    }

    /// Whether autotune should run an optimization now.
    pub fn should_trigger_optimization(&self, autotune_enabled: bool, shot_threshold: u32) -> bool {
        autotune_enabled
            && self
                .current()
                .is_some_and(|c| c.shots_since_trigger >= shot_threshold.max(1))
    }

    /// Whether the last `shot_threshold` accepted shots of this activation
    /// were all hits and the campaign is not pinned.
    pub fn should_auto_advance(&self, enabled: bool, shot_threshold: u32) -> bool {
        enabled
            && self.current().is_some_and(|c| {
                !c.pinned
                    && c.history
                        .recent_all_hits(c.activation_start, shot_threshold as usize)
            })
    }

    /// Cursor snapshot for status and persistence.
    pub fn state(&self) -> CampaignState {
        let current = self.current();
        CampaignState {
            index: self.cursor,
            coefficient: current.map(|c| c.spec.name.clone()),
            step: current.map(|c| c.step),
            current_value: current.map(|c| c.current_value),
            shots_since_trigger: current.map_or(0, |c| c.shots_since_trigger),
            consecutive_invalid: current.map_or(0, |c| c.consecutive_invalid),
            pinned: current.is_some_and(|c| c.pinned),
            proposals: current.map_or(0, |c| c.proposals),
            success_rate: current.map_or(0.0, |c| c.history.success_rate_with(None)),
            campaigns: self
                .campaigns
                .iter()
                .map(|c| CampaignSummary {
                    name: c.spec.name.clone(),
                    phase: c.phase,
                    shots: c.history.len(),
                })
                .collect(),
        }
    }

    /// Journal entries from `from` onward.
    pub fn journal_since(&self, from: usize) -> &[JournalEntry] {
        self.journal.get(from..).unwrap_or(&[])
    }

    /// Journal length.
    pub fn journal_len(&self) -> usize {
        self.journal.len()
    }

    // ─── Shots ──────────────────────────────────────────────────────────

    /// Append a shot to the active campaign.
    ///
    /// Invalid shots are stored as excluded records and extend the
    /// consecutive-invalid streak; valid shots reset it and count towards
    /// the optimization threshold.
    pub fn record_shot(&mut self, shot: &ShotObservation) -> ShotDisposition {
        let Some(idx) = self.cursor else {
            warn!(timestamp = shot.timestamp, "shot ignored: no active campaign");
            return ShotDisposition::NoActiveCampaign;
        };
        let verdict = self.validate(idx, shot);
        let max_invalid = self.settings.max_consecutive_invalid_shots.max(1);
        let campaign = &mut self.campaigns[idx];
        let value = shot
            .coefficients
            .get(&campaign.spec.name)
            .copied()
            .filter(|v| v.is_finite())
            .unwrap_or(campaign.current_value);
        let hit = shot.hit.unwrap_or(false);

        let (disposition, record) = match verdict {
            Ok(()) => {
                campaign.shots_since_trigger += 1;
                campaign.consecutive_invalid = 0;
                let success_rate = campaign.history.success_rate_with(Some(hit));
                let record = EvaluationRecord {
                    timestamp: shot.timestamp,
                    coefficient: campaign.spec.name.clone(),
                    value,
                    hit,
                    distance: shot.distance,
                    success_rate_at_time: success_rate,
                    excluded: false,
                    reason: None,
                };
                debug!(coefficient = %record.coefficient, value, hit, success_rate, "shot accepted");
                (
                    ShotDisposition::Accepted {
                        coefficient: campaign.spec.name.clone(),
                        value,
                        success_rate,
                    },
                    record,
                )
            }
            Err(reason) => {
                campaign.consecutive_invalid += 1;
                let streak = campaign.consecutive_invalid;
                let streak_exceeded = streak >= max_invalid;
                if streak_exceeded {
                    warn!(coefficient = %campaign.spec.name, streak, reason = %reason, "invalid shot streak");
                } else {
                    debug!(coefficient = %campaign.spec.name, reason = %reason, "shot rejected");
                }
                let record = EvaluationRecord {
                    timestamp: shot.timestamp,
                    coefficient: campaign.spec.name.clone(),
                    value,
                    hit,
                    distance: shot.distance,
                    success_rate_at_time: campaign.history.success_rate_with(None),
                    excluded: true,
                    reason: Some(reason.to_string()),
                };
                (
                    ShotDisposition::Rejected {
                        reason,
                        streak,
                        streak_exceeded,
                    },
                    record,
                )
            }
        };
        campaign.history.push(record.clone());
        self.journal.push(JournalEntry::Evaluation(record));
        disposition
    }

    fn validate(&self, idx: usize, shot: &ShotObservation) -> Result<(), RejectReason> {
        if shot.hit.is_none() {
            return Err(RejectReason::MissingOutcome);
        }
        if !shot.timestamp.is_finite() {
            return Err(RejectReason::NonFinite {
                field: "timestamp".into(),
            });
        }
        let fields = [
            ("distance", shot.distance),
            ("exit_velocity", shot.exit_velocity),
            ("pitch", shot.pitch),
        ];
        for (field, value) in fields {
            if value.is_some_and(|v| !v.is_finite()) {
                return Err(RejectReason::NonFinite {
                    field: field.into(),
                });
            }
        }
        for c in &self.campaigns {
            if let Some(&value) = shot.coefficients.get(&c.spec.name) {
                if !value.is_finite() {
                    return Err(RejectReason::NonFinite {
                        field: c.spec.name.clone(),
                    });
                }
                let slack = (c.spec.max_value - c.spec.min_value) * 1e-9;
                if value < c.spec.min_value - slack || value > c.spec.max_value + slack {
                    return Err(RejectReason::CoefficientOutOfBounds {
                        name: c.spec.name.clone(),
                        value,
                    });
                }
            }
        }

        let p = &self.physical;
        let limits = [
            ("distance", shot.distance, p.min_distance_m, p.max_distance_m),
            (
                "exit_velocity",
                shot.exit_velocity,
                p.min_velocity_mps,
                p.max_velocity_mps,
            ),
            ("pitch", shot.pitch, p.min_angle_rad, p.max_angle_rad),
        ];
        for (field, value, min, max) in limits {
            if let Some(v) = value {
                if v < min || v > max {
                    return Err(RejectReason::PhysicallyImplausible { field, value: v });
                }
            }
        }

        if let (Some(distance), Some((mean, std_dev, n))) =
            (shot.distance, self.campaigns[idx].history.distance_stats())
        {
            if n >= MIN_DISTANCE_SAMPLES
                && std_dev > 0.0
                && (distance - mean).abs() > self.settings.abnormal_reading_sigma * std_dev
            {
                return Err(RejectReason::AbnormalDistance {
                    distance,
                    mean,
                    std_dev,
                });
            }
        }
        Ok(())
    }

    /// Restart the threshold count after an optimization.
    pub fn reset_shot_counter(&mut self) {
        if let Some(c) = self.current_mut() {
            c.shots_since_trigger = 0;
        }
    }

    /// Record that `value` was written for `name` outside the proposal path.
    pub fn note_value(&mut self, name: &str, value: f64) {
        if let Some(c) = self.campaigns.iter_mut().find(|c| c.spec.name == name) {
            c.current_value = c.spec.clamp(value);
        }
    }

    /// Suppress or re-allow auto-advance for the active campaign.
    pub fn set_pinned(&mut self, pinned: bool) {
        if let Some(c) = self.current_mut() {
            c.pinned = pinned;
        }
    }

    // ─── Proposals ──────────────────────────────────────────────────────

    /// Next value for the active coefficient, `None` when done.
    ///
    /// Bootstrap proposals walk `default, default+step, default-step,
    /// default+2·step, …` until `n_initial_points` valid evaluations exist;
    /// afterwards the value maximising Expected Improvement inside
    /// `incumbent ± step` is chosen.
    pub fn propose_next_value(&mut self) -> Option<Proposal> {
        let idx = self.cursor?;
        let xi = self.settings.exploration_xi.max(0.0);
        let bootstrapping =
            self.campaigns[idx].history.accepted_count() < self.settings.n_initial_points as usize;

        let (raw, strategy) = if bootstrapping {
            let c = &mut self.campaigns[idx];
            let k = c.bootstrap_index;
            c.bootstrap_index += 1;
            let magnitude = f64::from(k.div_ceil(2));
            let sign = if k % 2 == 1 { 1.0 } else { -1.0 };
            (
                c.spec.default_value + sign * magnitude * c.step,
                ProposalStrategy::Bootstrap,
            )
        } else {
            match self.acquire(idx, xi) {
                Some(v) => (v, ProposalStrategy::ExpectedImprovement),
                None => (self.explore(idx), ProposalStrategy::Exploratory),
            }
        };

        let c = &mut self.campaigns[idx];
        let mut value = c.spec.clamp(raw);
        if !value.is_finite() {
            value = c.spec.clamp(c.spec.default_value);
        }
        let step = c.step;
        c.current_value = value;
        c.proposals += 1;
        if self.settings.step_decay_enabled {
            c.decay_step(self.settings.min_step_size_ratio);
        }
        let proposal = Proposal {
            coefficient: c.spec.name.clone(),
            value,
            step,
            strategy,
            index: c.proposals,
        };
        info!(
            coefficient = %proposal.coefficient,
            value,
            step,
            strategy = ?strategy,
            index = proposal.index,
            "proposal"
        );
        self.journal.push(JournalEntry::Proposal(ProposalRecord {
            timestamp: crate::unix_seconds(),
            coefficient: proposal.coefficient.clone(),
            value,
            step,
            strategy,
        }));
        Some(proposal)
    }

    /// Best Expected Improvement candidate around the incumbent, or `None`
    /// when the surrogate has nothing useful to say.
    fn acquire(&mut self, idx: usize, xi: f64) -> Option<f64> {
        let c = &self.campaigns[idx];
        let groups = c.history.groups();
        let incumbent = incumbent(&groups)?;
        let range = c.spec.max_value - c.spec.min_value;
        let length_scale = (2.0 * c.spec.initial_step_size).max(0.02 * range);
        let gp = GaussianProcess::fit(&groups, length_scale)?;
        let best = groups
            .iter()
            .map(|g| gp.predict(g.value).0)
            .fold(f64::NEG_INFINITY, f64::max);

        let center = incumbent.value;
        let radius = c.step;
        let mut candidates: Vec<f64> = (0..=GRID_POINTS)
            .map(|i| center - radius + 2.0 * radius * i as f64 / GRID_POINTS as f64)
            .collect();
        for _ in 0..RANDOM_POINTS {
            let offset: f64 = self.rng.gen_range(-1.0..=1.0);
            candidates.push(center + offset * radius);
        }

        let c = &self.campaigns[idx];
        let mut chosen: Option<(f64, f64)> = None;
        for raw in candidates {
            let x = c.spec.clamp(raw);
            if (x - center).abs() <= f64::EPSILON * center.abs().max(1.0) {
                continue;
            }
            let (mean, std) = gp.predict(x);
            let ei = expected_improvement(mean, std, best, xi);
            if !ei.is_finite() {
                continue;
            }
            if chosen.map_or(true, |(_, best_ei)| ei > best_ei) {
                chosen = Some((x, ei));
            }
        }
        match chosen {
            Some((x, ei)) if ei > MIN_EXPECTED_IMPROVEMENT => Some(x),
            _ => None,
        }
    }

    /// Step away from the incumbent (or current value), alternating
    /// direction, bouncing off the bounds.
    fn explore(&mut self, idx: usize) -> f64 {
        let c = &mut self.campaigns[idx];
        let center = incumbent(&c.history.groups()).map_or(c.current_value, |g| g.value);
        let forward = c.spec.clamp(center + c.direction * c.step);
        let value = if (forward - center).abs() > 0.0 {
            forward
        } else {
            c.spec.clamp(center - c.direction * c.step)
        };
        c.direction = -c.direction;
        value
    }

    // ─── Cursor ─────────────────────────────────────────────────────────

    /// Finish the active campaign and move to the next pending one.
    ///
    /// Returns the new active coefficient, `None` when the order is
    /// exhausted. There is no implicit wrap-around; use [`Self::reset_all`].
    pub fn advance_to_next_coefficient(&mut self) -> Option<&str> {
        self.finish_current(CampaignPhase::Converged, TransitionCause::Advance);
        self.current_coefficient_name()
    }

    /// Like [`Self::advance_to_next_coefficient`], marking the campaign skipped.
    pub fn skip_current(&mut self) -> Option<&str> {
        self.finish_current(CampaignPhase::Skipped, TransitionCause::Skip);
        self.current_coefficient_name()
    }

    /// Advance because the proposal budget is used up.
    pub fn finish_exhausted(&mut self) -> Option<&str> {
        self.finish_current(CampaignPhase::Converged, TransitionCause::BudgetExhausted);
        self.current_coefficient_name()
    }

    /// Reactivate a finished campaign with its history kept and the step
    /// reset to `backtrack_step_fraction × initial_step_size`.
    ///
    /// # Errors
    ///
    /// - [`OptimizerError::UnknownCoefficient`] if `name` has no campaign.
    /// - [`OptimizerError::InvalidTransition`] if it is not finished.
    pub fn backtrack_to(&mut self, name: &str) -> Result<(), OptimizerError> {
        let idx = self.index_of(name)?;
        let phase = self.campaigns[idx].phase;
        if !phase.is_finished() {
            return Err(OptimizerError::InvalidTransition {
                action: "backtrack to",
                name: name.to_string(),
                phase,
            });
        }
        self.switch_to(idx, TransitionCause::Backtrack);
        Ok(())
    }

    /// Activate any campaign. A finished target is restarted as in
    /// [`Self::backtrack_to`]; the campaign being left goes back to pending.
    ///
    /// # Errors
    ///
    /// Returns [`OptimizerError::UnknownCoefficient`] if `name` has no campaign.
    pub fn jump_to(&mut self, name: &str) -> Result<(), OptimizerError> {
        let idx = self.index_of(name)?;
        if self.cursor == Some(idx) {
            return Ok(());
        }
        self.switch_to(idx, TransitionCause::Jump);
        Ok(())
    }

    /// Forget everything and start over at the first campaign.
    pub fn reset_all(&mut self) {
        let ratio = self.settings.min_step_size_ratio;
        for c in &mut self.campaigns {
            let from = c.phase;
            *c = Campaign::new(c.spec.clone(), ratio);
            if from != CampaignPhase::Pending {
                self.journal.push(JournalEntry::Transition(CampaignTransition {
                    timestamp: crate::unix_seconds(),
                    coefficient: c.spec.name.clone(),
                    from,
                    to: CampaignPhase::Pending,
                    cause: TransitionCause::Reset,
                }));
            }
        }
        self.cursor = None;
        self.activate_first();
        info!("optimizer reset");
    }

    // ─── Internals ──────────────────────────────────────────────────────

    fn current(&self) -> Option<&Campaign> {
        self.cursor.and_then(|i| self.campaigns.get(i))
    }

    fn current_mut(&mut self) -> Option<&mut Campaign> {
        self.cursor.and_then(|i| self.campaigns.get_mut(i))
    }

    fn index_of(&self, name: &str) -> Result<usize, OptimizerError> {
        self.campaigns
            .iter()
            .position(|c| c.spec.name == name)
            .ok_or_else(|| OptimizerError::UnknownCoefficient(name.to_string()))
    }

    fn activate_first(&mut self) {
        if self.campaigns.is_empty() {
            warn!("no tunable coefficients");
            return;
        }
        self.activate(0, TransitionCause::Start);
    }

    fn activate(&mut self, idx: usize, cause: TransitionCause) {
        let c = &mut self.campaigns[idx];
        let from = c.phase;
        if from.is_finished() {
            c.restart_search(
                self.settings.backtrack_step_fraction,
                self.settings.min_step_size_ratio,
            );
        }
        c.activate();
        self.cursor = Some(idx);
        info!(coefficient = %c.spec.name, cause = ?cause, "campaign active");
        self.transition(idx, from, CampaignPhase::Active, cause);
    }

    fn transition(&mut self, idx: usize, from: CampaignPhase, to: CampaignPhase, cause: TransitionCause) {
        self.journal.push(JournalEntry::Transition(CampaignTransition {
            timestamp: crate::unix_seconds(),
            coefficient: self.campaigns[idx].spec.name.clone(),
            from,
            to,
            cause,
        }));
    }

    fn finish_current(&mut self, to: CampaignPhase, cause: TransitionCause) {
        let Some(idx) = self.cursor else {
            return;
        };
        self.campaigns[idx].phase = to;
        self.transition(idx, CampaignPhase::Active, to, cause);
        self.cursor = None;
        let next = (idx + 1..self.campaigns.len())
            .find(|&i| self.campaigns[i].phase == CampaignPhase::Pending);
        match next {
            Some(next) => self.activate(next, cause),
            None => info!("tuning order exhausted"),
        }
    }

    fn switch_to(&mut self, idx: usize, cause: TransitionCause) {
        if let Some(current) = self.cursor {
            self.campaigns[current].phase = CampaignPhase::Pending;
            self.transition(current, CampaignPhase::Active, CampaignPhase::Pending, cause);
        }
        self.activate(idx, cause);
    }
}

/// Group with the best hit rate; ties go to the better-sampled value.
fn incumbent(groups: &[ValueGroup]) -> Option<ValueGroup> {
    groups.iter().copied().fold(None, |best, g| match best {
        None => Some(g),
        Some(b) if g.rate() > b.rate() || (g.rate() == b.rate() && g.shots > b.shots) => Some(g),
        keep => keep,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(coefficients: Vec<CoefficientSpec>) -> TunerConfig {
        let mut cfg = TunerConfig::empty();
        cfg.tuning_order = coefficients.iter().map(|c| c.name.clone()).collect();
        cfg.coefficients = coefficients;
        cfg
    }

    fn drag() -> CoefficientSpec {
        CoefficientSpec::new("kDragCoefficient", 0.003, 0.001, 0.01, 0.0001)
    }

    fn shot(name: &str, value: f64, hit: bool, ts: f64) -> ShotObservation {
        let mut coefficients = BTreeMap::new();
        coefficients.insert(name.to_string(), value);
        ShotObservation::manual(hit, coefficients, ts)
    }

    fn three() -> SequentialOptimizer {
        SequentialOptimizer::new(&config_with(vec![
            drag(),
            CoefficientSpec::new("kShooterRPM", 3000.0, 0.0, 6000.0, 50.0).integer(),
            CoefficientSpec::new("kExitVelocity", 15.0, 0.0, 30.0, 0.1),
        ]))
    }

    #[test]
    fn test_new_activates_first_campaign() {
        let opt = three();
        assert_eq!(opt.current_coefficient_name(), Some("kDragCoefficient"));
        assert_eq!(
            opt.campaign("kDragCoefficient").map(|c| c.phase()),
            Some(CampaignPhase::Active)
        );
        assert_eq!(opt.journal_len(), 1);
    }

    #[test]
    fn test_empty_order_is_done() {
        let mut opt = SequentialOptimizer::new(&TunerConfig::empty());
        assert_eq!(opt.current_coefficient_name(), None);
        assert!(opt.propose_next_value().is_none());
        assert_eq!(
            opt.record_shot(&shot("k", 1.0, true, 1.0)),
            ShotDisposition::NoActiveCampaign
        );
    }

    #[test]
    fn test_defective_and_disabled_coefficients_get_no_campaign() {
        let opt = SequentialOptimizer::new(&config_with(vec![
            CoefficientSpec::new("kInverted", 1.0, 2.0, 1.0, 0.1),
            CoefficientSpec::new("kZeroStep", 1.0, 0.0, 2.0, 0.0),
            CoefficientSpec::new("kOff", 1.0, 0.0, 2.0, 0.1).disabled(),
            drag(),
        ]));
        assert_eq!(opt.campaign_names(), vec!["kDragCoefficient"]);
    }

    #[test]
    fn test_record_shot_accepts_and_counts() {
        let mut opt = three();
        let d = opt.record_shot(&shot("kDragCoefficient", 0.003, true, 1.0));
        assert!(matches!(d, ShotDisposition::Accepted { success_rate, .. } if success_rate == 1.0));
        assert_eq!(opt.shots_since_trigger(), 1);
    }

    #[test]
    fn test_record_shot_out_of_bounds_rejected_but_kept() {
        let mut opt = three();
        let d = opt.record_shot(&shot("kDragCoefficient", 0.5, true, 1.0));
        assert!(matches!(
            d,
            ShotDisposition::Rejected {
                reason: RejectReason::CoefficientOutOfBounds { .. },
                streak: 1,
                streak_exceeded: false
            }
        ));
        assert_eq!(opt.shots_since_trigger(), 0);
        let history = opt
            .campaign("kDragCoefficient")
            .map(|c| c.history().records().to_vec())
            .unwrap_or_default();
        assert_eq!(history.len(), 1);
        assert!(history[0].excluded);
        assert!(history[0].reason.is_some());
    }

    #[test]
    fn test_record_shot_missing_outcome_rejected() {
        let mut opt = three();
        let mut s = shot("kDragCoefficient", 0.003, true, 1.0);
        s.hit = None;
        assert!(matches!(
            opt.record_shot(&s),
            ShotDisposition::Rejected {
                reason: RejectReason::MissingOutcome,
                ..
            }
        ));
    }

    #[test]
    fn test_record_shot_physical_limits() {
        let mut opt = three();
        let mut s = shot("kDragCoefficient", 0.003, true, 1.0);
        s.exit_velocity = Some(99.0);
        assert!(matches!(
            opt.record_shot(&s),
            ShotDisposition::Rejected {
                reason: RejectReason::PhysicallyImplausible {
                    field: "exit_velocity",
                    ..
                },
                ..
            }
        ));
        let mut s = shot("kDragCoefficient", 0.003, true, 2.0);
        s.distance = Some(f64::NAN);
        assert!(matches!(
            opt.record_shot(&s),
            ShotDisposition::Rejected {
                reason: RejectReason::NonFinite { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_streak_flags_and_resets() {
        let mut opt = three();
        for i in 0..4 {
            opt.record_shot(&shot("kDragCoefficient", 1.0, true, f64::from(i)));
        }
        assert!(!opt.invalid_streak_exceeded());
        let d = opt.record_shot(&shot("kDragCoefficient", 1.0, true, 5.0));
        assert!(matches!(
            d,
            ShotDisposition::Rejected {
                streak: 5,
                streak_exceeded: true,
                ..
            }
        ));
        assert!(opt.invalid_streak_exceeded());
        opt.record_shot(&shot("kDragCoefficient", 0.003, true, 6.0));
        assert!(!opt.invalid_streak_exceeded());
    }

    #[test]
    fn test_abnormal_distance_rejected_after_enough_samples() {
        let mut opt = three();
        for i in 0..10 {
            let mut s = shot("kDragCoefficient", 0.003, true, f64::from(i));
            s.distance = Some(4.0 + 0.1 * f64::from(i % 3));
            assert!(matches!(opt.record_shot(&s), ShotDisposition::Accepted { .. }));
        }
        let mut s = shot("kDragCoefficient", 0.003, true, 11.0);
        s.distance = Some(12.0);
        assert!(matches!(
            opt.record_shot(&s),
            ShotDisposition::Rejected {
                reason: RejectReason::AbnormalDistance { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_should_trigger_requires_autotune_and_threshold() {
        let mut opt = three();
        for i in 0..3 {
            opt.record_shot(&shot("kDragCoefficient", 0.003, i % 2 == 0, f64::from(i)));
        }
        assert!(opt.should_trigger_optimization(true, 3));
        assert!(!opt.should_trigger_optimization(true, 4));
        assert!(!opt.should_trigger_optimization(false, 3));
        opt.reset_shot_counter();
        assert!(!opt.should_trigger_optimization(true, 3));
    }

    #[test]
    fn test_bootstrap_sequence_default_then_alternating() {
        let mut opt = SequentialOptimizer::new(&config_with(vec![
            CoefficientSpec::new("k", 10.0, 0.0, 20.0, 1.0).with_decay(1.0),
        ]));
        let values: Vec<f64> = (0..5)
            .filter_map(|_| opt.propose_next_value())
            .map(|p| {
                assert_eq!(p.strategy, ProposalStrategy::Bootstrap);
                p.value
            })
            .collect();
        assert_eq!(values, vec![10.0, 11.0, 9.0, 12.0, 8.0]);
    }

    #[test]
    fn test_all_hits_at_default_moves_away() {
        let mut opt = three();
        for i in 0..10 {
            opt.record_shot(&shot("kDragCoefficient", 0.003, true, f64::from(i)));
        }
        assert!(opt.should_trigger_optimization(true, 10));
        let p = opt.propose_next_value().expect("test: proposal");
        assert!((0.001..=0.01).contains(&p.value));
        assert_ne!(p.value, 0.003);
        assert_ne!(p.strategy, ProposalStrategy::Bootstrap);
    }

    #[test]
    fn test_all_misses_still_proposes_in_bounds() {
        let mut opt = three();
        let mut value = 0.003;
        for round in 0..15 {
            for i in 0..4 {
                opt.record_shot(&shot(
                    "kDragCoefficient",
                    value,
                    false,
                    f64::from(round * 10 + i),
                ));
            }
            let p = opt.propose_next_value().expect("test: proposal");
            assert!(p.value.is_finite());
            assert!((0.001..=0.01).contains(&p.value));
            value = p.value;
        }
    }

    #[test]
    fn test_integer_coefficient_proposals_are_whole() {
        let mut opt = three();
        opt.advance_to_next_coefficient();
        assert_eq!(opt.current_coefficient_name(), Some("kShooterRPM"));
        let mut value = 3000.0;
        for round in 0..12 {
            for i in 0..3 {
                opt.record_shot(&shot("kShooterRPM", value, (round + i) % 3 == 0, f64::from(round * 10 + i)));
            }
            let p = opt.propose_next_value().expect("test: proposal");
            assert_eq!(p.value.fract(), 0.0);
            assert!((0.0..=6000.0).contains(&p.value));
            value = p.value;
        }
    }

    #[test]
    fn test_step_never_below_floor() {
        let mut opt = SequentialOptimizer::new(&config_with(vec![
            CoefficientSpec::new("k", 1.0, 0.0, 2.0, 0.2).with_decay(0.5),
        ]));
        for _ in 0..30 {
            let p = opt.propose_next_value().expect("test: proposal");
            assert!(p.step >= 0.02 - 1e-12);
        }
        let step = opt.state().step.expect("test: active step");
        assert!((step - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_advance_past_last_is_done_and_rejects_shots() {
        let mut opt = three();
        assert_eq!(opt.advance_to_next_coefficient(), Some("kShooterRPM"));
        assert_eq!(opt.advance_to_next_coefficient(), Some("kExitVelocity"));
        assert_eq!(opt.advance_to_next_coefficient(), None);
        assert_eq!(opt.current_coefficient_name(), None);
        assert_eq!(
            opt.record_shot(&shot("kExitVelocity", 15.0, true, 1.0)),
            ShotDisposition::NoActiveCampaign
        );
        assert_eq!(opt.advance_to_next_coefficient(), None);
    }

    #[test]
    fn test_skip_marks_skipped() {
        let mut opt = three();
        opt.skip_current();
        assert_eq!(
            opt.campaign("kDragCoefficient").map(|c| c.phase()),
            Some(CampaignPhase::Skipped)
        );
    }

    #[test]
    fn test_backtrack_keeps_history_and_halves_step() {
        let mut opt = three();
        for i in 0..15 {
            opt.record_shot(&shot("kDragCoefficient", 0.003, i % 2 == 0, f64::from(i)));
        }
        opt.propose_next_value();
        opt.advance_to_next_coefficient();
        opt.backtrack_to("kDragCoefficient").expect("test: backtrack");
        assert_eq!(opt.current_coefficient_name(), Some("kDragCoefficient"));
        let c = opt.campaign("kDragCoefficient").expect("test: campaign");
        assert_eq!(c.phase(), CampaignPhase::Active);
        assert_eq!(c.history().len(), 15);
        assert!((c.step() - 0.00005).abs() < 1e-12);
        assert_eq!(
            opt.campaign("kShooterRPM").map(|c| c.phase()),
            Some(CampaignPhase::Pending)
        );
    }

    #[test]
    fn test_backtrack_to_pending_or_unknown_is_error() {
        let mut opt = three();
        assert!(matches!(
            opt.backtrack_to("kShooterRPM"),
            Err(OptimizerError::InvalidTransition { .. })
        ));
        assert!(matches!(
            opt.backtrack_to("kDragCoefficient"),
            Err(OptimizerError::InvalidTransition { .. })
        ));
        assert_eq!(
            opt.backtrack_to("kNope"),
            Err(OptimizerError::UnknownCoefficient("kNope".into()))
        );
    }

    #[test]
    fn test_advance_after_backtrack_resumes_pending_campaign() {
        let mut opt = three();
        opt.advance_to_next_coefficient();
        opt.advance_to_next_coefficient();
        opt.backtrack_to("kDragCoefficient").expect("test: backtrack");
        // kShooterRPM is converged, kExitVelocity was left pending.
        assert_eq!(opt.advance_to_next_coefficient(), Some("kExitVelocity"));
    }

    #[test]
    fn test_jump_forward_and_back() {
        let mut opt = three();
        opt.jump_to("kExitVelocity").expect("test: jump");
        assert_eq!(opt.current_coefficient_name(), Some("kExitVelocity"));
        assert_eq!(
            opt.campaign("kDragCoefficient").map(|c| c.phase()),
            Some(CampaignPhase::Pending)
        );
        opt.jump_to("kExitVelocity").expect("test: jump to self");
        assert!(opt.jump_to("kNope").is_err());
        assert_eq!(opt.advance_to_next_coefficient(), None);
    }

    #[test]
    fn test_auto_advance_requires_streak_of_hits_and_unpinned() {
        let mut opt = three();
        for i in 0..4 {
            opt.record_shot(&shot("kDragCoefficient", 0.003, true, f64::from(i)));
        }
        assert!(opt.should_auto_advance(true, 4));
        assert!(!opt.should_auto_advance(true, 5));
        assert!(!opt.should_auto_advance(false, 4));
        opt.set_pinned(true);
        assert!(!opt.should_auto_advance(true, 4));
        opt.set_pinned(false);
        opt.record_shot(&shot("kDragCoefficient", 0.003, false, 9.0));
        assert!(!opt.should_auto_advance(true, 4));
    }

    #[test]
    fn test_budget_exhaustion() {
        let mut cfg = config_with(vec![drag()]);
        cfg.optimizer.n_calls_per_coefficient = 2;
        let mut opt = SequentialOptimizer::new(&cfg);
        opt.propose_next_value();
        assert!(!opt.campaign_budget_exhausted());
        opt.propose_next_value();
        assert!(opt.campaign_budget_exhausted());
        assert_eq!(opt.finish_exhausted(), None);
    }

    #[test]
    fn test_reset_all_clears_history_and_restarts() {
        let mut opt = three();
        opt.record_shot(&shot("kDragCoefficient", 0.003, true, 1.0));
        opt.advance_to_next_coefficient();
        opt.reset_all();
        assert_eq!(opt.current_coefficient_name(), Some("kDragCoefficient"));
        let state = opt.state();
        assert!(state.campaigns.iter().all(|c| c.shots == 0));
        assert_eq!(state.campaigns[1].phase, CampaignPhase::Pending);
    }

    #[test]
    fn test_effective_policies_follow_precedence() {
        let mut cfg = config_with(vec![CoefficientSpec {
            autotune: Some(PolicySetting {
                enabled: true,
                shot_threshold: 3,
            }),
            ..drag()
        }]);
        let opt = SequentialOptimizer::new(&cfg);
        assert_eq!(
            opt.effective_autotune(),
            Some(PolicySetting {
                enabled: true,
                shot_threshold: 3
            })
        );
        cfg.autotune.force_global = true;
        let opt = SequentialOptimizer::new(&cfg);
        assert_eq!(opt.effective_autotune(), Some(cfg.autotune.setting()));
    }

    #[test]
    fn test_journal_records_everything_in_order() {
        let mut opt = three();
        opt.record_shot(&shot("kDragCoefficient", 0.003, true, 1.0));
        opt.propose_next_value();
        opt.advance_to_next_coefficient();
        let kinds: Vec<&str> = opt
            .journal_since(0)
            .iter()
            .map(|e| match e {
                JournalEntry::Evaluation(_) => "evaluation",
                JournalEntry::Proposal(_) => "proposal",
                JournalEntry::Transition(_) => "transition",
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "transition",
                "evaluation",
                "proposal",
                "transition",
                "transition"
            ]
        );
        assert!(opt.journal_since(100).is_empty());
    }

    #[test]
    fn test_note_value_updates_current_value() {
        let mut opt = three();
        opt.note_value("kDragCoefficient", 0.5);
        assert_eq!(opt.state().current_value, Some(0.01));
    }

    #[test]
    fn test_incumbent_prefers_rate_then_samples() {
        let g = [
            ValueGroup { value: 1.0, hits: 1, shots: 2 },
            ValueGroup { value: 2.0, hits: 2, shots: 4 },
            ValueGroup { value: 3.0, hits: 1, shots: 3 },
        ];
        assert_eq!(incumbent(&g).map(|g| g.value), Some(2.0));
        assert!(incumbent(&[]).is_none());
    }
}
