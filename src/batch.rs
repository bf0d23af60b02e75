use std::fmt;
use std::num::NonZeroU32;
use std::path::PathBuf;

use serde::Serialize;

use crate::devicefarm::{RunCounters, RunHandle, RunObservation, UploadHandle};

/// Split `total` iterations into batches of at most `max_batch_size`.
///
/// Every batch is full except possibly the last one, which carries the remainder.
pub fn plan_batches(total: NonZeroU32, max_batch_size: NonZeroU32) -> Vec<u32> {
    let total = total.get();
    let max = max_batch_size.get();
    let count = total.div_ceil(max);
    (0..count)
        .map(|i| max.min(total - i * max))
        .collect()
}

/// Run name for batch `index` of `count`.
pub fn batch_run_name(base: &str, index: usize, count: usize) -> String {
    if count > 1 {
        format!("{base} [{index} / {count}]")
    } else {
        base.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Pending,
    Polling,
    Succeeded,
    RetryScheduling,
    Abandoned,
}

impl BatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchState::Succeeded | BatchState::Abandoned)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchState::Pending => "pending",
            BatchState::Polling => "polling",
            BatchState::Succeeded => "succeeded",
            BatchState::RetryScheduling => "retry_scheduling",
            BatchState::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one batch. Transitions return a new snapshot instead of
/// mutating the one held by the monitor's registry.
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub index: usize,
    pub planned_iterations: u32,
    pub test_spec: UploadHandle,
    pub run_name: String,
    pub attempt: u32,
    pub run: RunHandle,
    pub state: BatchState,
    pub last_status: Option<String>,
    pub result: Option<String>,
    pub counters: Option<RunCounters>,
    pub traces: Vec<PathBuf>,
}

impl Batch {
    pub fn scheduled(
        index: usize,
        planned_iterations: u32,
        test_spec: UploadHandle,
        run_name: String,
        run: RunHandle,
    ) -> Self {
        Self {
            index,
            planned_iterations,
            test_spec,
            run_name,
            attempt: 1,
            run,
            state: BatchState::Pending,
            last_status: None,
            result: None,
            counters: None,
            traces: Vec::new(),
        }
    }

    pub fn with_state(&self, state: BatchState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    pub fn observed(&self, observation: &RunObservation) -> Self {
        Self {
            state: BatchState::Polling,
            last_status: Some(observation.status.clone()),
            result: observation.result.clone(),
            counters: observation.counters.clone(),
            ..self.clone()
        }
    }

    /// Reported result with passed/total tests, e.g. `FAILED 48/50`.
    pub fn outcome(&self) -> Option<String> {
        match (&self.result, &self.counters) {
            (Some(result), Some(counters)) => {
                Some(format!("{result} {}/{}", counters.passed, counters.total))
            }
            (Some(result), None) => Some(result.clone()),
            (None, Some(counters)) => Some(format!("{}/{}", counters.passed, counters.total)),
            (None, None) => None,
        }
    }

    pub fn succeeded(&self, traces: Vec<PathBuf>) -> Self {
        Self {
            state: BatchState::Succeeded,
            traces,
            ..self.clone()
        }
    }

    /// Fresh attempt on a new remote run. The previous run handle is dropped.
    pub fn retried(&self, run: RunHandle) -> Self {
        Self {
            attempt: self.attempt + 1,
            run,
            state: BatchState::Pending,
            last_status: None,
            result: None,
            counters: None,
            traces: Vec::new(),
            ..self.clone()
        }
    }
}
