//! Commands accepted by the coordinator loop.

use std::collections::BTreeMap;

/// A request from the presentation layer, applied at the end of the next
/// loop iteration in submission order.
#[derive(Debug, Clone, PartialEq)]
pub enum TunerCommand {
    /// Resume recording shots and writing coefficients after [`Self::Stop`].
    Start,
    /// Stop recording shots and writing coefficients. The loop keeps
    /// heartbeating and publishing status.
    Stop,
    /// Temporarily ignore shots.
    Pause,
    /// Undo [`Self::Pause`].
    Resume,
    /// Operator-entered shot. Coefficients not listed are taken from the
    /// robot's live values.
    RecordShot {
        /// Outcome.
        hit: bool,
        /// Values in effect, overriding the live snapshot.
        coefficients: BTreeMap<String, f64>,
    },
    /// Mark the active campaign skipped and move on.
    Skip,
    /// Activate any tunable coefficient.
    JumpTo(String),
    /// Return to a finished coefficient.
    Backtrack(String),
    /// Propose and write a new value now, if enough valid shots exist.
    ForceOptimize,
    /// Discard every campaign and start over.
    ResetAll,
    /// Append the journal and a checkpoint to the session log.
    Save,
    /// Write a value directly, bypassing the rate limiter.
    SetCoefficient {
        /// Coefficient.
        name: String,
        /// Value; clamped before writing.
        value: f64,
    },
    /// Suppress (`true`) or allow auto-advance for the active campaign.
    Pin(bool),
}

impl TunerCommand {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            TunerCommand::Start => "start",
            TunerCommand::Stop => "stop",
            TunerCommand::Pause => "pause",
            TunerCommand::Resume => "resume",
            TunerCommand::RecordShot { .. } => "record_shot",
            TunerCommand::Skip => "skip",
            TunerCommand::JumpTo(_) => "jump_to",
            TunerCommand::Backtrack(_) => "backtrack",
            TunerCommand::ForceOptimize => "force_optimize",
            TunerCommand::ResetAll => "reset_all",
            TunerCommand::Save => "save",
            TunerCommand::SetCoefficient { .. } => "set_coefficient",
            TunerCommand::Pin(_) => "pin",
        }
    }
}
