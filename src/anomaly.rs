//! Adaptive straggler deadline for a cohort of identical sub-tasks.
//!
//! Once a majority of the cohort has finished, the mean run time of that
//! majority times a tolerance factor becomes the deadline for the rest. The
//! deadline counts from the cohort's start, is armed once and never moves.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep_until};
use tracing::info;

use crate::error::FanoutError;

/// What a run does when stragglers miss the deadline or sub-tasks fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StragglerPolicy {
    /// Cancel the stragglers and merge whatever completed.
    AcceptPartial,
    /// Fail and roll back the whole run.
    FailRun,
}

impl fmt::Display for StragglerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StragglerPolicy::AcceptPartial => write!(f, "accept-partial"),
            StragglerPolicy::FailRun => write!(f, "fail-run"),
        }
    }
}

impl FromStr for StragglerPolicy {
    type Err = FanoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accept-partial" => Ok(StragglerPolicy::AcceptPartial),
            "fail-run" => Ok(StragglerPolicy::FailRun),
            other => Err(FanoutError::Config(format!(
                "unknown straggler policy {other:?} (expected accept-partial or fail-run)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub tolerance_factor: f64,
    pub majority_fraction: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            tolerance_factor: 3.0,
            majority_fraction: 0.8,
        }
    }
}

/// How a cohort ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CohortResolution {
    /// Every sub-task reported before the deadline.
    Complete,
    /// The deadline elapsed with these sub-tasks still outstanding.
    Stragglers {
        indexes: Vec<usize>,
        deadline: Duration,
    },
}

#[derive(Debug, Clone)]
pub struct AnomalyTimeoutDetector {
    cohort: usize,
    config: DetectorConfig,
    finished: BTreeMap<usize, Duration>,
    deadline: Option<Duration>,
}

impl AnomalyTimeoutDetector {
    pub fn new(cohort: usize, config: DetectorConfig) -> Self {
        Self {
            cohort,
            config,
            finished: BTreeMap::new(),
            deadline: None,
        }
    }

    /// `ceil(majority_fraction * cohort)`, clamped to `1..=cohort`.
    pub fn majority_threshold(&self) -> usize {
        // The epsilon keeps 0.8 * 10 from rounding up to 9.
        let raw = (self.config.majority_fraction * self.cohort as f64 - 1e-9).ceil();
        (raw.max(1.0) as usize).min(self.cohort.max(1))
    }

    /// Records a finished sub-task. Returns the deadline when this report is
    /// the one that arms it. Duplicates and out-of-range indexes are ignored.
    pub fn record(&mut self, index: usize, elapsed: Duration) -> Option<Duration> {
        if index >= self.cohort || self.finished.contains_key(&index) {
            return None;
        }
        self.finished.insert(index, elapsed);

        if self.deadline.is_some() || self.finished.len() < self.majority_threshold() {
            return None;
        }
        let total: Duration = self.finished.values().sum();
        let average = total / self.finished.len() as u32;
        let deadline = average.mul_f64(self.config.tolerance_factor);
        info!(
            finished = self.finished.len(),
            cohort = self.cohort,
            average_ms = average.as_millis() as u64,
            deadline_ms = deadline.as_millis() as u64,
            "straggler deadline armed"
        );
        self.deadline = Some(deadline);
        Some(deadline)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    pub fn is_complete(&self) -> bool {
        self.finished.len() >= self.cohort
    }

    /// Indexes that have not reported yet, ascending.
    pub fn pending(&self) -> Vec<usize> {
        (0..self.cohort)
            .filter(|i| !self.finished.contains_key(i))
            .collect()
    }

    /// Resolves once the armed deadline, counted from `start`, has elapsed.
    /// Never resolves while the deadline is unarmed.
    pub async fn expired(&self, start: Instant) {
        match self.deadline {
            Some(deadline) => sleep_until(start + deadline).await,
            None => std::future::pending().await,
        }
    }

    /// Current verdict: complete, or the outstanding sub-tasks as stragglers.
    pub fn resolution(&self) -> CohortResolution {
        if self.is_complete() {
            CohortResolution::Complete
        } else {
            CohortResolution::Stragglers {
                indexes: self.pending(),
                deadline: self.deadline.unwrap_or_default(),
            }
        }
    }
}
