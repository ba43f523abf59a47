//! Evaluation history and the append-only journal.
//!
//! A [`CampaignHistory`] keeps every shot recorded for one coefficient,
//! accepted or excluded, in insertion order. The [`JournalEntry`] stream is
//! what leaves the optimizer: evaluations, proposals and campaign
//! transitions, in the order they happened.

use serde::{Deserialize, Serialize};

use super::campaign::CampaignPhase;
use super::ProposalStrategy;

/// One recorded shot, as seen by one campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    /// Shot timestamp reported by the robot (or wall clock for manual shots).
    pub timestamp: f64,
    /// Campaign the shot was recorded against.
    pub coefficient: String,
    /// Coefficient value in effect for the shot.
    pub value: f64,
    /// Outcome; `false` when the robot reported none.
    pub hit: bool,
    /// Distance to target, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    /// Campaign success rate over accepted shots, including this one if accepted.
    pub success_rate_at_time: f64,
    /// Kept for audit but not used as optimizer input.
    pub excluded: bool,
    /// Why the shot was excluded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Why a campaign changed phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    /// First campaign activated at startup or after a reset.
    Start,
    /// Cursor moved forward after convergence.
    Advance,
    /// Manual skip.
    Skip,
    /// Manual jump to an arbitrary campaign.
    Jump,
    /// Manual return to a finished campaign.
    Backtrack,
    /// Proposal budget used up.
    BudgetExhausted,
    /// Everything cleared.
    Reset,
}

/// A campaign phase change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignTransition {
    /// Wall-clock seconds.
    pub timestamp: f64,
    /// Campaign affected.
    pub coefficient: String,
    /// Phase before.
    pub from: CampaignPhase,
    /// Phase after.
    pub to: CampaignPhase,
    /// Trigger.
    pub cause: TransitionCause,
}

/// A value handed to the coordinator for writing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalRecord {
    /// Wall-clock seconds.
    pub timestamp: f64,
    /// Campaign.
    pub coefficient: String,
    /// Proposed, clamped value.
    pub value: f64,
    /// Search radius used.
    pub step: f64,
    /// How the value was chosen.
    pub strategy: ProposalStrategy,
}

/// Journal stream entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalEntry {
    /// A recorded shot.
    Evaluation(EvaluationRecord),
    /// A proposal.
    Proposal(ProposalRecord),
    /// A campaign phase change.
    Transition(CampaignTransition),
}

/// Insertion-ordered shots for one campaign.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CampaignHistory {
    records: Vec<EvaluationRecord>,
}

/// Accepted shots at one coefficient value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueGroup {
    /// Coefficient value.
    pub value: f64,
    /// Hits at this value.
    pub hits: u32,
    /// Accepted shots at this value.
    pub shots: u32,
}

impl ValueGroup {
    /// Observed hit rate.
    pub fn rate(&self) -> f64 {
        if self.shots == 0 {
            0.0
        } else {
            f64::from(self.hits) / f64::from(self.shots)
        }
    }
}

impl CampaignHistory {
    /// Append a record.
    pub fn push(&mut self, record: EvaluationRecord) {
        self.records.push(record);
    }

    /// All records, accepted and excluded.
    pub fn records(&self) -> &[EvaluationRecord] {
        &self.records
    }

    /// Number of records, accepted and excluded.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Accepted records.
    pub fn accepted(&self) -> impl Iterator<Item = &EvaluationRecord> {
        self.records.iter().filter(|r| !r.excluded)
    }

    /// Number of accepted records.
    pub fn accepted_count(&self) -> usize {
        self.accepted().count()
    }

    /// Hit rate over accepted records, counting one extra pending outcome.
    pub fn success_rate_with(&self, pending_hit: Option<bool>) -> f64 {
        let (mut hits, mut n) = self
            .accepted()
            .fold((0u32, 0u32), |(h, n), r| (h + u32::from(r.hit), n + 1));
        if let Some(hit) = pending_hit {
            hits += u32::from(hit);
            n += 1;
        }
        if n == 0 {
            0.0
        } else {
            f64::from(hits) / f64::from(n)
        }
    }

    /// Accepted shots grouped by exact value, in first-seen order.
    pub fn groups(&self) -> Vec<ValueGroup> {
        let mut groups: Vec<ValueGroup> = Vec::new();
        for r in self.accepted() {
            match groups
                .iter_mut()
                .find(|g| g.value.to_bits() == r.value.to_bits())
            {
                Some(g) => {
                    g.hits += u32::from(r.hit);
                    g.shots += 1;
                }
                None => groups.push(ValueGroup {
                    value: r.value,
                    hits: u32::from(r.hit),
                    shots: 1,
                }),
            }
        }
        groups
    }

    /// Whether the last `n` accepted records from `start` onward are all hits.
    /// `false` when fewer than `n` exist.
    pub fn recent_all_hits(&self, start: usize, n: usize) -> bool {
        if n == 0 {
            return false;
        }
        let recent: Vec<&EvaluationRecord> = self
            .records
            .iter()
            .skip(start)
            .filter(|r| !r.excluded)
            .collect();
        recent.len() >= n && recent[recent.len() - n..].iter().all(|r| r.hit)
    }

    /// Mean and population standard deviation of accepted distances, with
    /// the sample count.
    pub fn distance_stats(&self) -> Option<(f64, f64, usize)> {
        let distances: Vec<f64> = self.accepted().filter_map(|r| r.distance).collect();
        if distances.is_empty() {
            return None;
        }
        let n = distances.len() as f64;
        let mean = distances.iter().sum::<f64>() / n;
        let var = distances.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / n;
        Some((mean, var.sqrt(), distances.len()))
    }
}
