use std::time::Duration;

use crate::batch::BatchState;
use crate::devicefarm::RunHandle;

/// Something the run monitor wants reported.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Started {
        batches: usize,
    },
    Transition {
        batch: usize,
        attempt: u32,
        run: RunHandle,
        from: BatchState,
        to: BatchState,
    },
    StatusChanged {
        batch: usize,
        attempt: u32,
        status: String,
        elapsed: Duration,
    },
    TracesDownloaded {
        batch: usize,
        attempt: u32,
        count: usize,
    },
    RetryScheduled {
        batch: usize,
        attempt: u32,
        max_retries: u32,
        run: RunHandle,
    },
    PollFailed {
        batch: usize,
        attempt: u32,
        run: RunHandle,
        error: String,
    },
    Interrupted {
        traces: usize,
    },
}

pub trait EventSink {
    fn emit(&self, event: &MonitorEvent);
}

/// Default sink: structured `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &MonitorEvent) {
        match event {
            MonitorEvent::Started { batches } => {
                tracing::info!(batches, "monitoring runs (ctrl-c stops monitoring, runs keep going)");
            }
            MonitorEvent::Transition {
                batch,
                attempt,
                run,
                from,
                to,
            } => match to {
                BatchState::Abandoned => tracing::error!(
                    batch,
                    attempt,
                    run = %run,
                    %from,
                    %to,
                    "batch abandoned: no traces after all retries"
                ),
                _ => tracing::debug!(batch, attempt, run = %run, %from, %to, "batch transition"),
            },
            MonitorEvent::StatusChanged {
                batch,
                attempt,
                status,
                elapsed,
            } => {
                tracing::info!(
                    batch,
                    attempt,
                    status = %status,
                    elapsed_secs = elapsed.as_secs(),
                    "run status"
                );
            }
            MonitorEvent::TracesDownloaded {
                batch,
                attempt,
                count,
            } => {
                if *count == 0 {
                    tracing::warn!(batch, attempt, "run finished without traces");
                } else {
                    tracing::info!(batch, attempt, traces = count, "downloaded traces");
                }
            }
            MonitorEvent::RetryScheduled {
                batch,
                attempt,
                max_retries,
                run,
            } => {
                tracing::warn!(
                    batch,
                    retry = attempt - 1,
                    max_retries,
                    run = %run,
                    "scheduled retry"
                );
            }
            MonitorEvent::PollFailed {
                batch,
                attempt,
                run,
                error,
            } => {
                tracing::warn!(batch, attempt, run = %run.short(), error = %error, "status check failed");
            }
            MonitorEvent::Interrupted { traces } => {
                tracing::warn!(
                    traces,
                    "monitoring stopped by user; scheduled runs are still active"
                );
            }
        }
    }
}
