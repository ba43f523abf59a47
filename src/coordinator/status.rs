//! Status snapshots published by the coordinator loop.

use serde::Serialize;

use crate::optimizer::campaign::CampaignPhase;
use crate::optimizer::CampaignSummary;

/// Coordinator lifecycle.
///
/// ```text
/// Stopped ──start()──► Starting ──► Running ──stop()──► Stopping ──► Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Lifecycle {
    /// No loop task.
    #[default]
    Stopped = 0,
    /// Task spawned, first iteration pending.
    Starting = 1,
    /// Loop iterating.
    Running = 2,
    /// Shutdown signalled, waiting for the loop to drain.
    Stopping = 3,
}

impl Lifecycle {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => Lifecycle::Starting,
            2 => Lifecycle::Running,
            3 => Lifecycle::Stopping,
            _ => Lifecycle::Stopped,
        }
    }
}

/// Loop errors by category since the coordinator was built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ErrorCounts {
    /// Failed connects and lost sessions.
    pub transport: u64,
    /// Rejected shots.
    pub validation: u64,
    /// Commands that could not be applied.
    pub command: u64,
    /// Session log writes that failed.
    pub io: u64,
    /// Iterations aborted by a panic.
    pub panic: u64,
}

/// Snapshot of the tuner, published once per loop iteration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TunerStatus {
    /// Lifecycle at publication time.
    pub lifecycle: Lifecycle,
    /// Robot link state.
    pub connected: bool,
    /// Tuning enabled (configuration switch and runtime start/stop).
    pub enabled: bool,
    /// Paused by command.
    pub paused: bool,
    /// Paused because the robot is in an official match.
    pub match_mode: bool,
    /// Active coefficient, `None` when every campaign is finished.
    pub current_coefficient: Option<String>,
    /// Value believed to be in effect for the active coefficient.
    pub current_value: Option<f64>,
    /// Active search radius.
    pub step_size: Option<f64>,
    /// Valid shots since the last optimization.
    pub shots_since_trigger: u32,
    /// Effective autotune threshold.
    pub shot_threshold: u32,
    /// Effective autotune switch.
    pub autotune: bool,
    /// Effective auto-advance switch.
    pub auto_advance: bool,
    /// Auto-advance suppressed.
    pub pinned: bool,
    /// Active campaign success rate.
    pub success_rate: f64,
    /// Current invalid-shot streak.
    pub consecutive_invalid: u32,
    /// The invalid streak reached its warning threshold.
    pub invalid_streak_warning: bool,
    /// A proposal is waiting to be written.
    pub pending_write: bool,
    /// Last value written for a coefficient.
    pub last_written: Option<(String, f64)>,
    /// Timestamp of the last robot shot seen.
    pub last_shot_timestamp: Option<f64>,
    /// Every campaign with its phase.
    pub campaigns: Vec<CampaignSummary>,
    /// Error counters.
    pub errors: ErrorCounts,
    /// Most recent error message.
    pub last_error: Option<String>,
    /// Completed loop iterations.
    pub iterations: u64,
    /// Free-text status also published to the robot.
    pub runtime_status: String,
}

impl TunerStatus {
    /// Every campaign is finished (or none exist).
    pub fn is_done(&self) -> bool {
        self.current_coefficient.is_none()
    }

    /// Phase of a campaign by name.
    pub fn phase_of(&self, name: &str) -> Option<CampaignPhase> {
        self.campaigns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.phase)
    }
}
