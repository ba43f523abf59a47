//! Table key layout shared with the robot's firing solver.
//!
//! The robot publishes shot fields under [`FIRING_SOLVER`] and writes
//! [`SHOT_TIMESTAMP`] last; the tuner publishes under [`TUNER`].

/// Root of the robot's firing-solver table.
pub const FIRING_SOLVER: &str = "/FiringSolver";

/// Commit signal for a shot; strictly increasing per shot.
pub const SHOT_TIMESTAMP: &str = "/FiringSolver/ShotTimestamp";
/// Shot outcome.
pub const SHOT_HIT: &str = "/FiringSolver/Hit";
/// Distance to target at shot time, metres.
pub const SHOT_DISTANCE: &str = "/FiringSolver/Distance";
/// Launch pitch of the firing solution, radians.
pub const SHOT_PITCH: &str = "/FiringSolver/Solution/pitchRadians";
/// Exit velocity of the firing solution, m/s.
pub const SHOT_EXIT_VELOCITY: &str = "/FiringSolver/Solution/exitVelocity";

/// Robot waits for [`SHOT_LOGGED`] when true.
pub const REQUIRE_SHOT_LOGGED: &str = "/FiringSolver/Interlock/RequireShotLogged";
/// Robot waits for [`COEFFICIENTS_UPDATED`] when true.
pub const REQUIRE_COEFFICIENTS_UPDATED: &str = "/FiringSolver/Interlock/RequireCoefficientsUpdated";
/// Set by the tuner once the last shot is recorded; cleared by the robot.
pub const SHOT_LOGGED: &str = "/FiringSolver/Interlock/ShotLogged";
/// Set by the tuner after a coefficient push; cleared by the robot.
pub const COEFFICIENTS_UPDATED: &str = "/FiringSolver/Interlock/CoefficientsUpdated";

/// Root of the tuner's status table.
pub const TUNER: &str = "/Tuning/BayesianTuner";
/// Wall-clock seconds, refreshed at the heartbeat rate.
pub const HEARTBEAT: &str = "/Tuning/BayesianTuner/Heartbeat";
/// Tuning activity on/off.
pub const TUNER_ENABLED: &str = "/Tuning/BayesianTuner/TunerEnabled";
/// Tuning activity paused.
pub const TUNER_PAUSED: &str = "/Tuning/BayesianTuner/TunerPaused";
/// Free-text warnings (invalid streaks, disconnected peers).
pub const RUNTIME_STATUS: &str = "/Tuning/BayesianTuner/TunerRuntimeStatus";
/// Name of the coefficient being tuned, empty when done.
pub const CURRENT_COEFFICIENT: &str = "/Tuning/BayesianTuner/CurrentCoefficient";
/// Valid shots since the last optimization.
pub const SHOT_COUNT: &str = "/Tuning/BayesianTuner/ShotCount";
/// Shots per sample for the current coefficient.
pub const SHOT_THRESHOLD: &str = "/Tuning/BayesianTuner/ShotThreshold";
/// Effective autotune flag for the current coefficient.
pub const AUTOTUNE_ENABLED: &str = "/Tuning/BayesianTuner/AutotuneEnabled";
/// Effective auto-advance flag for the current coefficient.
pub const AUTO_ADVANCE: &str = "/Tuning/BayesianTuner/AutoAdvance";
/// Dashboard button: run one optimization now. Cleared by the tuner.
pub const RUN_OPTIMIZATION: &str = "/Tuning/BayesianTuner/RunOptimization";
/// Dashboard toggle for tuning activity.
pub const TUNER_ENABLED_TOGGLE: &str = "/Tuning/BayesianTuner/TunerEnabledToggle";

/// Driver-station control word; bit 0x10 means an FMS is attached.
pub const FMS_CONTROL_DATA: &str = "/FMSInfo/FMSControlData";
/// FMS-attached bit of [`FMS_CONTROL_DATA`].
pub const FMS_ATTACHED_BIT: u32 = 0x10;

/// Per-shot copy of a coefficient, published by the firing solver.
pub fn shot_coefficient(name: &str) -> String {
    format!("{FIRING_SOLVER}/{name}")
}
