//! Raw status text -> phase / progress / ETA.
//!
//! Classification is table driven: add a row to [`PHASE_TABLE`] to teach the
//! mapper a new stage.  The mapper itself is pure; the per-job
//! [`ProgressTracker`] is what keeps progress from ever going backwards.

use std::time::Duration;

use crate::types::Phase;

/// One row of the phase table.
#[derive(Debug, Clone, Copy)]
pub struct PhaseRule {
    pub keyword: &'static str,
    pub phase: Phase,
    pub progress: f64,
    pub eta_secs: Option<u64>,
}

/// Ordered by progress.  When several keywords match the same status, the
/// row furthest down wins.
pub const PHASE_TABLE: &[PhaseRule] = &[
    PhaseRule {
        keyword: "processing",
        phase: Phase::Processing,
        progress: 0.30,
        eta_secs: Some(240),
    },
    PhaseRule {
        keyword: "generating",
        phase: Phase::Generating,
        progress: 0.60,
        eta_secs: Some(180),
    },
    PhaseRule {
        keyword: "finalizing",
        phase: Phase::Finalizing,
        progress: 0.90,
        eta_secs: Some(60),
    },
    PhaseRule {
        keyword: "complete",
        phase: Phase::Complete,
        progress: 1.00,
        eta_secs: None,
    },
];

/// Whole words only, so "generating (0 errors)" is not a failure.
const FAILURE_WORDS: &[&str] = &["fail", "failed", "failure", "error", "errored"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseReading {
    pub phase: Phase,
    pub progress: f64,
    pub eta: Option<Duration>,
}

impl PhaseReading {
    /// Reading used before any status was recognised.
    pub const PENDING: PhaseReading = PhaseReading {
        phase: Phase::Pending,
        progress: 0.0,
        eta: None,
    };

    fn from_rule(rule: &PhaseRule) -> Self {
        Self {
            phase: rule.phase,
            progress: rule.progress,
            eta: rule.eta_secs.map(Duration::from_secs),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Complete
    }
}

/// Classify a raw status.  `None` when no row matches.
pub fn map(raw: &str) -> Option<PhaseReading> {
    let lowered = raw.to_lowercase();
    PHASE_TABLE
        .iter()
        .rev()
        .find(|rule| lowered.contains(rule.keyword))
        .map(PhaseReading::from_rule)
}

/// Total variant of [`map`]: unrecognised text keeps `previous`.
pub fn map_or(raw: &str, previous: PhaseReading) -> PhaseReading {
    map(raw).unwrap_or(previous)
}

/// True when the raw status reports that the service gave up.
pub fn is_failure(raw: &str) -> bool {
    raw.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .any(|word| FAILURE_WORDS.contains(&word.as_str()))
}

/// Last emitted reading for one job.  Never hands out a lower progress than
/// it already did.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    last: PhaseReading,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            last: PhaseReading::PENDING,
        }
    }

    pub fn last(&self) -> PhaseReading {
        self.last
    }

    /// Feed one raw status, returning the (clamped) reading to publish.
    pub fn observe(&mut self, raw: &str) -> PhaseReading {
        let candidate = map_or(raw, self.last);
        if candidate.progress >= self.last.progress {
            self.last = candidate;
        }
        self.last
    }
}
