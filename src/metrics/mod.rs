//! Reducing trace files to startup latency records.
//!
//! A source directory holds one subdirectory per remote run (as written by
//! `perfrun run`), or the traces themselves. Every trace is queried on a
//! bounded blocking pool; per-file problems become a [`SkipReason`] and are
//! reported once in aggregate.

use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;

use crate::artifacts::is_trace_file_name;
use crate::ui::progress_bar;

pub mod cache;
pub mod query;

pub use query::{TraceProcessorShell, TraceQuery};

pub const BIND_APPLICATION: &str = "bindApplication";
pub const RENDER_BEGIN: &str = "android_apps_tab_screen_render_begin";
pub const PAGE_LOAD_COMPLETE: &str = "android_platform_page_load_complete";

const NANOS_PER_MILLI: f64 = 1_000_000.0;

static ITERATION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"iter(\d+)").unwrap());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceMetricsRecord {
    pub trace_file: String,
    pub iteration: u32,
    pub startup_latency_ms: f64,
    pub render_latency_ms: f64,
    pub batch: usize,
    #[serde(alias = "run_arn")]
    pub run_id: String,
}

/// First timestamp (ns) of each marker slice, if present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkerTimestamps {
    pub bind_application: Option<i64>,
    pub render_begin: Option<i64>,
    pub page_load_complete: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SkipReason {
    #[error("no iteration number in file name")]
    NoIteration,
    #[error("missing {0} slice")]
    MissingMarker(&'static str),
    #[error("bindApplication does not precede {0}")]
    OutOfOrder(&'static str),
    #[error("query failed: {0}")]
    Query(String),
}

#[derive(Debug, Clone)]
pub enum TraceOutcome {
    Extracted(TraceMetricsRecord),
    Skipped { trace: PathBuf, reason: SkipReason },
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("directory does not exist: {}", .0.display())]
    DirectoryMissing(PathBuf),
    #[error("no trace files found in {}", .0.display())]
    NoTraceFiles(PathBuf),
    #[error(
        "no valid trace data loaded from {}: {failed} trace(s) failed processing. \
         Check that traces contain the slices android_platform_page_load_complete, \
         bindApplication and android_apps_tab_screen_render_begin",
        .dir.display()
    )]
    NoValidRecords { dir: PathBuf, failed: usize },
}

/// One trace file to query, tagged with the run folder it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceTask {
    pub path: PathBuf,
    pub batch: usize,
    pub run_id: String,
}

/// Startup and render latency in milliseconds, both relative to `bindApplication`.
pub fn compute_latencies(markers: MarkerTimestamps) -> Result<(f64, f64), SkipReason> {
    let bind = markers
        .bind_application
        .ok_or(SkipReason::MissingMarker(BIND_APPLICATION))?;
    let render = markers
        .render_begin
        .ok_or(SkipReason::MissingMarker(RENDER_BEGIN))?;
    let page_load = markers
        .page_load_complete
        .ok_or(SkipReason::MissingMarker(PAGE_LOAD_COMPLETE))?;

    if bind >= render {
        return Err(SkipReason::OutOfOrder(RENDER_BEGIN));
    }
    if bind >= page_load {
        return Err(SkipReason::OutOfOrder(PAGE_LOAD_COMPLETE));
    }

    let startup = (page_load - bind) as f64 / NANOS_PER_MILLI;
    let render = (render - bind) as f64 / NANOS_PER_MILLI;
    Ok((startup, render))
}

pub fn iteration_from_file_name(name: &str) -> Option<u32> {
    ITERATION_RE
        .captures(name)
        .and_then(|captures| captures.get(1))
        .and_then(|digits| digits.as_str().parse().ok())
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

fn folder_name(dir: &Path) -> String {
    dir.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.display().to_string())
}

/// Run folders under `dir` in batch order.
pub fn run_folders(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut folders = Vec::new();
    let mut has_direct_traces = false;

    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_hidden(&name) {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            folders.push(path);
        } else if is_trace_file_name(&name) {
            has_direct_traces = true;
        }
    }

    if folders.is_empty() || has_direct_traces {
        return Ok(vec![dir.to_path_buf()]);
    }
    folders.sort();
    Ok(folders)
}

/// Trace files under `folder`, recursively, skipping anything below a
/// hidden path segment relative to `root`.
pub fn trace_files(root: &Path, folder: &Path) -> Result<Vec<PathBuf>> {
    let pattern = format!(
        "{}/**/*",
        glob::Pattern::escape(&folder.to_string_lossy())
    );
    let mut traces = Vec::new();
    for entry in glob::glob(&pattern).context("invalid trace search pattern")? {
        let path = match entry {
            Ok(path) => path,
            Err(err) => {
                tracing::debug!(error = %err, "skipping unreadable path");
                continue;
            }
        };
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().map(|name| name.to_string_lossy()) else {
            continue;
        };
        if !is_trace_file_name(&name) {
            continue;
        }
        let relative = path.strip_prefix(root).unwrap_or(&path);
        let hidden = relative
            .components()
            .any(|part| is_hidden(&part.as_os_str().to_string_lossy()));
        if !hidden {
            traces.push(path);
        }
    }
    traces.sort();
    Ok(traces)
}

pub fn discover_trace_tasks(dir: &Path) -> Result<Vec<TraceTask>> {
    if !dir.is_dir() {
        return Err(MetricsError::DirectoryMissing(dir.to_path_buf()).into());
    }

    let mut tasks = Vec::new();
    for (offset, folder) in run_folders(dir)?.into_iter().enumerate() {
        let run_id = folder_name(&folder);
        for path in trace_files(dir, &folder)? {
            tasks.push(TraceTask {
                path,
                batch: offset + 1,
                run_id: run_id.clone(),
            });
        }
    }

    if tasks.is_empty() {
        return Err(MetricsError::NoTraceFiles(dir.to_path_buf()).into());
    }
    Ok(tasks)
}

pub fn extract_one(query: &dyn TraceQuery, task: TraceTask) -> TraceOutcome {
    let skipped = |reason| TraceOutcome::Skipped {
        trace: task.path.clone(),
        reason,
    };

    let name = task
        .path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let Some(iteration) = iteration_from_file_name(&name) else {
        return skipped(SkipReason::NoIteration);
    };

    let markers = match query.marker_timestamps(&task.path) {
        Ok(markers) => markers,
        Err(err) => return skipped(SkipReason::Query(format!("{err:#}"))),
    };
    let (startup_latency_ms, render_latency_ms) = match compute_latencies(markers) {
        Ok(latencies) => latencies,
        Err(reason) => return skipped(reason),
    };

    TraceOutcome::Extracted(TraceMetricsRecord {
        trace_file: task.path.display().to_string(),
        iteration,
        startup_latency_ms,
        render_latency_ms,
        batch: task.batch,
        run_id: task.run_id,
    })
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(4)
}

/// Extract one record per valid trace under `dir`. Record order is unspecified.
pub async fn extract_metrics(
    dir: &Path,
    query: Arc<dyn TraceQuery>,
    workers: Option<NonZeroUsize>,
) -> Result<Vec<TraceMetricsRecord>> {
    let tasks = discover_trace_tasks(dir)?;
    query.check()?;

    let worker_count = workers.map(NonZeroUsize::get).unwrap_or_else(default_workers);
    tracing::info!(
        dir = %dir.display(),
        traces = tasks.len(),
        workers = worker_count,
        "processing traces"
    );

    let progress = progress_bar(tasks.len() as u64, "Processing traces");
    let mut outcomes = Vec::with_capacity(tasks.len());
    let mut join_set = JoinSet::new();
    for task in tasks {
        while join_set.len() >= worker_count {
            if let Some(joined) = join_set.join_next().await {
                outcomes.push(joined.context("trace extraction worker join failed")?);
                progress.inc(1);
            }
        }
        let query = Arc::clone(&query);
        join_set.spawn_blocking(move || extract_one(query.as_ref(), task));
    }
    while let Some(joined) = join_set.join_next().await {
        outcomes.push(joined.context("trace extraction worker join failed")?);
        progress.inc(1);
    }
    progress.finish_and_clear();

    let mut records = Vec::with_capacity(outcomes.len());
    let mut failed = 0usize;
    for outcome in outcomes {
        match outcome {
            TraceOutcome::Extracted(record) => records.push(record),
            TraceOutcome::Skipped { trace, reason } => {
                tracing::debug!(trace = %trace.display(), %reason, "skipped trace");
                failed += 1;
            }
        }
    }

    if records.is_empty() {
        return Err(MetricsError::NoValidRecords {
            dir: dir.to_path_buf(),
            failed,
        }
        .into());
    }
    if failed > 0 {
        tracing::warn!(failed, "traces failed to process or had missing markers");
    }
    tracing::info!(records = records.len(), dir = %dir.display(), "processed traces");
    Ok(records)
}
