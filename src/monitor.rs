//! Polling and retry state machine for the batches of one request.
//!
//! Polling is deliberately sequential: one status call per active batch per
//! cycle, in batch order, then a fixed sleep. Retries are scheduled inline.
//! There is one monitor per comparison side, so nothing here needs locking.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use crate::artifacts::download_run_traces;
use crate::batch::{Batch, BatchState};
use crate::devicefarm::TestService;
use crate::events::{EventSink, MonitorEvent};
use crate::interrupt::Interrupt;
use crate::scheduler::{schedule_run, RunContext};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub max_retries: u32,
    pub poll_interval: Duration,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MonitorFailure {
    #[error("batch {batch} produced no traces after {attempts} attempt(s)")]
    RetriesExhausted { batch: usize, attempts: u32 },

    #[error("failed to schedule retry for batch {batch}: {error}")]
    RetryScheduling { batch: usize, error: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MonitorOutcome {
    Completed,
    Failed { failure: MonitorFailure },
    Interrupted,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorReport {
    pub outcome: MonitorOutcome,
    pub traces: Vec<PathBuf>,
    pub batches: Vec<Batch>,
}

impl MonitorReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, MonitorOutcome::Completed)
    }
}

enum Step {
    Continue(Batch),
    Fail(Batch, MonitorFailure),
}

pub struct RunMonitor<'a, S, E> {
    service: &'a S,
    context: &'a RunContext,
    sink: &'a E,
    config: MonitorConfig,
    interrupt: Interrupt,
}

impl<'a, S: TestService, E: EventSink> RunMonitor<'a, S, E> {
    pub fn new(
        service: &'a S,
        context: &'a RunContext,
        sink: &'a E,
        config: MonitorConfig,
        interrupt: Interrupt,
    ) -> Self {
        Self {
            service,
            context,
            sink,
            config,
            interrupt,
        }
    }

    /// Poll `batches` until every one has traces, one exhausts its retries,
    /// a retry cannot be scheduled, or the operator interrupts.
    pub async fn run(&self, batches: Vec<Batch>) -> MonitorReport {
        let started = Instant::now();
        let mut registry: BTreeMap<usize, Batch> =
            batches.into_iter().map(|b| (b.index, b)).collect();
        self.sink.emit(&MonitorEvent::Started {
            batches: registry.len(),
        });

        loop {
            if self.interrupt.is_triggered() {
                let report = report(MonitorOutcome::Interrupted, registry);
                self.sink.emit(&MonitorEvent::Interrupted {
                    traces: report.traces.len(),
                });
                return report;
            }

            if all_succeeded(&registry) {
                return report(MonitorOutcome::Completed, registry);
            }

            let active: Vec<usize> = registry
                .values()
                .filter(|batch| !batch.state.is_terminal())
                .map(|batch| batch.index)
                .collect();

            for index in active {
                let Some(current) = registry.get(&index).cloned() else {
                    continue;
                };
                match self.poll(current, started).await {
                    Step::Continue(next) => {
                        registry.insert(index, next);
                    }
                    Step::Fail(next, failure) => {
                        registry.insert(index, next);
                        self.abandon_remaining(&mut registry);
                        return report(MonitorOutcome::Failed { failure }, registry);
                    }
                }
            }

            if all_succeeded(&registry) {
                return report(MonitorOutcome::Completed, registry);
            }

            self.interrupt.sleep(self.config.poll_interval).await;
        }
    }

    async fn poll(&self, batch: Batch, started: Instant) -> Step {
        let batch = if batch.state == BatchState::Pending {
            self.transition(&batch, BatchState::Polling)
        } else {
            batch
        };

        let observation = match self.service.run_status(&batch.run).await {
            Ok(observation) => observation,
            Err(err) => {
                self.sink.emit(&MonitorEvent::PollFailed {
                    batch: batch.index,
                    attempt: batch.attempt,
                    run: batch.run.clone(),
                    error: format!("{err:#}"),
                });
                return Step::Continue(batch);
            }
        };

        if batch.last_status.as_deref() != Some(observation.status.as_str()) {
            self.sink.emit(&MonitorEvent::StatusChanged {
                batch: batch.index,
                attempt: batch.attempt,
                status: observation.status.clone(),
                elapsed: started.elapsed(),
            });
        }
        let batch = batch.observed(&observation);

        if !observation.phase().is_terminal() {
            return Step::Continue(batch);
        }

        let traces =
            download_run_traces(self.service, &batch.run, &self.config.output_dir).await;
        self.sink.emit(&MonitorEvent::TracesDownloaded {
            batch: batch.index,
            attempt: batch.attempt,
            count: traces.len(),
        });

        if !traces.is_empty() {
            self.emit_transition(&batch, BatchState::Succeeded);
            return Step::Continue(batch.succeeded(traces));
        }

        if batch.attempt > self.config.max_retries {
            let abandoned = self.transition(&batch, BatchState::Abandoned);
            let failure = MonitorFailure::RetriesExhausted {
                batch: abandoned.index,
                attempts: abandoned.attempt,
            };
            return Step::Fail(abandoned, failure);
        }

        let retrying = self.transition(&batch, BatchState::RetryScheduling);
        match schedule_run(
            self.service,
            self.context,
            &retrying.test_spec,
            &retrying.run_name,
        )
        .await
        {
            Ok(run) => {
                let fresh = retrying.retried(run);
                self.sink.emit(&MonitorEvent::RetryScheduled {
                    batch: fresh.index,
                    attempt: fresh.attempt,
                    max_retries: self.config.max_retries,
                    run: fresh.run.clone(),
                });
                self.sink.emit(&MonitorEvent::Transition {
                    batch: fresh.index,
                    attempt: fresh.attempt,
                    run: fresh.run.clone(),
                    from: BatchState::RetryScheduling,
                    to: BatchState::Pending,
                });
                Step::Continue(fresh)
            }
            Err(err) => {
                let failure = MonitorFailure::RetryScheduling {
                    batch: retrying.index,
                    error: format!("{err:#}"),
                };
                Step::Fail(retrying, failure)
            }
        }
    }

    fn transition(&self, batch: &Batch, to: BatchState) -> Batch {
        self.emit_transition(batch, to);
        batch.with_state(to)
    }

    fn emit_transition(&self, batch: &Batch, to: BatchState) {
        self.sink.emit(&MonitorEvent::Transition {
            batch: batch.index,
            attempt: batch.attempt,
            run: batch.run.clone(),
            from: batch.state,
            to,
        });
    }

    fn abandon_remaining(&self, registry: &mut BTreeMap<usize, Batch>) {
        for batch in registry.values_mut() {
            if batch.state != BatchState::Succeeded && batch.state != BatchState::Abandoned {
                *batch = self.transition(batch, BatchState::Abandoned);
            }
        }
    }
}

fn all_succeeded(registry: &BTreeMap<usize, Batch>) -> bool {
    registry
        .values()
        .all(|batch| batch.state == BatchState::Succeeded)
}

fn report(outcome: MonitorOutcome, registry: BTreeMap<usize, Batch>) -> MonitorReport {
    let batches: Vec<Batch> = registry.into_values().collect();
    let traces = batches
        .iter()
        .flat_map(|batch| batch.traces.iter().cloned())
        .collect();
    MonitorReport {
        outcome,
        traces,
        batches,
    }
}
