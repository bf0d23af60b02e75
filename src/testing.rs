//! In-memory stand-ins used by unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};

use crate::artifacts::test_support::zip;
use crate::devicefarm::{
    Artifact, Resource, RunCounters, RunHandle, RunObservation, ScheduleRequest, TestService,
    UploadHandle, UploadKind, UploadStatus, UploadTarget,
};
use crate::interrupt::Interrupt;
use crate::metrics::{MarkerTimestamps, TraceQuery};

/// How one scheduled run behaves: the statuses it reports, poll by poll
/// (the last one repeats), how many trace files its customer-artifact zip
/// holds, and how many traces are attached to its single test.
#[derive(Debug, Clone)]
pub struct RunScript {
    pub statuses: VecDeque<String>,
    pub traces: usize,
    pub test_traces: usize,
}

impl RunScript {
    pub fn new(statuses: &[&str], traces: usize) -> Self {
        Self {
            statuses: statuses.iter().map(|s| s.to_string()).collect(),
            traces,
            test_traces: 0,
        }
    }

    pub fn completes_with(traces: usize) -> Self {
        Self::new(&["PENDING", "RUNNING", "COMPLETED"], traces)
    }

    pub fn with_test_traces(mut self, test_traces: usize) -> Self {
        self.test_traces = test_traces;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ScheduledRun {
    pub app: String,
    pub test_package: String,
    pub test_spec: String,
    pub run_name: String,
    pub run: RunHandle,
}

#[derive(Default)]
struct FakeState {
    next_id: usize,
    uploaded_specs: Vec<String>,
    pending_spec: HashMap<String, UploadKind>,
    upload_failure: Option<String>,
    scheduled: Vec<ScheduledRun>,
    fail_schedule_after: Option<usize>,
    scripts: HashMap<String, VecDeque<RunScript>>,
    active: HashMap<RunHandle, RunScript>,
    status_queries: HashMap<RunHandle, usize>,
    status_errors: HashMap<String, usize>,
    interrupt_after_polls: Option<(usize, Interrupt)>,
    total_polls: usize,
    suite_listing_fails: bool,
}

pub struct FakeService {
    state: Mutex<FakeState>,
}

impl FakeService {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Queue scripts for successive runs scheduled under `run_name`.
    /// Runs without a queued script complete with one trace.
    pub fn script(&self, run_name: &str, scripts: Vec<RunScript>) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert(run_name.to_string(), scripts.into());
    }

    pub fn fail_schedule_after(&self, successes: usize) {
        self.state.lock().unwrap().fail_schedule_after = Some(successes);
    }

    pub fn fail_uploads_with(&self, reason: &str) {
        self.state.lock().unwrap().upload_failure = Some(reason.to_string());
    }

    pub fn fail_status_polls(&self, run_name: &str, times: usize) {
        self.state
            .lock()
            .unwrap()
            .status_errors
            .insert(run_name.to_string(), times);
    }

    pub fn fail_suite_listing(&self) {
        self.state.lock().unwrap().suite_listing_fails = true;
    }

    /// Register a run directly, bypassing scheduling.
    pub fn start_run(&self, run_name: &str, script: RunScript) -> RunHandle {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let run = RunHandle::from(format!("arn:run:proj/run-{}", state.next_id));
        state.active.insert(run.clone(), script);
        state.scheduled.push(ScheduledRun {
            app: String::new(),
            test_package: String::new(),
            test_spec: String::new(),
            run_name: run_name.to_string(),
            run: run.clone(),
        });
        run
    }

    fn script_for(&self, run: &str) -> Option<RunScript> {
        self.state
            .lock()
            .unwrap()
            .active
            .get(&RunHandle::from(run))
            .cloned()
    }

    pub fn interrupt_after_polls(&self, polls: usize, interrupt: Interrupt) {
        self.state.lock().unwrap().interrupt_after_polls = Some((polls, interrupt));
    }

    pub fn uploaded_specs(&self) -> Vec<String> {
        self.state.lock().unwrap().uploaded_specs.clone()
    }

    pub fn scheduled(&self) -> Vec<ScheduledRun> {
        self.state.lock().unwrap().scheduled.clone()
    }

    pub fn scheduled_named(&self, run_name: &str) -> usize {
        self.scheduled()
            .iter()
            .filter(|s| s.run_name == run_name)
            .count()
    }

    pub fn status_queries(&self, run: &RunHandle) -> usize {
        self.state
            .lock()
            .unwrap()
            .status_queries
            .get(run)
            .copied()
            .unwrap_or(0)
    }
}

impl TestService for FakeService {
    async fn create_upload(&self, name: &str, kind: UploadKind) -> Result<UploadTarget> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let handle = format!("upload-{}-{name}", state.next_id);
        state.pending_spec.insert(handle.clone(), kind);
        Ok(UploadTarget {
            handle: UploadHandle::from(handle.clone()),
            url: format!("put://{handle}"),
        })
    }

    async fn put_bytes(&self, target: &UploadTarget, content: Vec<u8>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.pending_spec.get(target.handle.as_str()) == Some(&UploadKind::InstrumentationTestSpec)
        {
            state
                .uploaded_specs
                .push(String::from_utf8_lossy(&content).into_owned());
        }
        Ok(())
    }

    async fn upload_status(&self, _handle: &UploadHandle) -> Result<UploadStatus> {
        let state = self.state.lock().unwrap();
        Ok(match &state.upload_failure {
            Some(reason) => UploadStatus::Failed(reason.clone()),
            None => UploadStatus::Ready,
        })
    }

    async fn schedule_run(&self, request: ScheduleRequest<'_>) -> Result<RunHandle> {
        let mut state = self.state.lock().unwrap();
        if let Some(limit) = state.fail_schedule_after {
            if state.scheduled.len() >= limit {
                bail!("ScheduleRun: service unavailable");
            }
        }
        state.next_id += 1;
        let run = RunHandle::from(format!("arn:run:proj/run-{}", state.next_id));
        let script = state
            .scripts
            .get_mut(request.run_name)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| RunScript::completes_with(1));
        state.active.insert(run.clone(), script);
        state.scheduled.push(ScheduledRun {
            app: request.app.to_string(),
            test_package: request.test_package.to_string(),
            test_spec: request.test_spec.to_string(),
            run_name: request.run_name.to_string(),
            run: run.clone(),
        });
        Ok(run)
    }

    async fn run_status(&self, run: &RunHandle) -> Result<RunObservation> {
        let mut state = self.state.lock().unwrap();
        state.total_polls += 1;
        if let Some((after, interrupt)) = &state.interrupt_after_polls {
            if state.total_polls >= *after {
                interrupt.trigger();
            }
        }
        *state.status_queries.entry(run.clone()).or_default() += 1;

        let run_name = state
            .scheduled
            .iter()
            .find(|s| &s.run == run)
            .map(|s| s.run_name.clone())
            .unwrap_or_default();
        if let Some(remaining) = state.status_errors.get_mut(&run_name) {
            if *remaining > 0 {
                *remaining -= 1;
                bail!("GetRun: throttled");
            }
        }

        let script = state
            .active
            .get_mut(run)
            .ok_or_else(|| anyhow!("unknown run {run}"))?;
        let status = if script.statuses.len() > 1 {
            script.statuses.pop_front().unwrap_or_default()
        } else {
            script.statuses.front().cloned().unwrap_or_default()
        };
        let observation = RunObservation {
            status,
            result: None,
            counters: None,
        };
        if !observation.phase().is_terminal() {
            return Ok(observation);
        }
        // One test per trace, each passing.
        let total = (script.traces + script.test_traces) as u32;
        Ok(RunObservation {
            result: Some(if total > 0 { "PASSED" } else { "ERRORED" }.to_string()),
            counters: Some(RunCounters {
                total,
                passed: total,
                ..RunCounters::default()
            }),
            ..observation
        })
    }

    async fn list_jobs(&self, run: &RunHandle) -> Result<Vec<Resource>> {
        Ok(vec![Resource {
            arn: format!("job|{run}"),
            name: Some("Pixel 8".to_string()),
        }])
    }

    async fn list_suites(&self, job_arn: &str) -> Result<Vec<Resource>> {
        if self.state.lock().unwrap().suite_listing_fails {
            bail!("ListSuites: throttled");
        }
        let run = job_arn.strip_prefix("job|").unwrap_or(job_arn);
        Ok(vec![Resource {
            arn: format!("suite|{run}"),
            name: Some("Instrumentation".to_string()),
        }])
    }

    async fn list_tests(&self, suite_arn: &str) -> Result<Vec<Resource>> {
        let run = suite_arn.strip_prefix("suite|").unwrap_or(suite_arn);
        Ok(vec![Resource {
            arn: format!("test|{run}"),
            name: Some("coldStartup".to_string()),
        }])
    }

    async fn list_artifacts(&self, arn: &str) -> Result<Vec<Artifact>> {
        if let Some(run) = arn.strip_prefix("job|") {
            return Ok(vec![Artifact {
                name: "Customer Artifacts".to_string(),
                kind: "CUSTOMER_ARTIFACT".to_string(),
                extension: "zip".to_string(),
                url: format!("zip|{run}"),
            }]);
        }
        let Some(run) = arn.strip_prefix("test|") else {
            return Ok(Vec::new());
        };
        let test_traces = self.script_for(run).map_or(0, |script| script.test_traces);
        let mut artifacts: Vec<Artifact> = (1..=test_traces)
            .map(|i| {
                let name = format!("warmStartup_iter{i}.perfetto-trace");
                Artifact {
                    url: format!("file|{run}|{name}"),
                    name,
                    kind: "TRACE".to_string(),
                    extension: "perfetto-trace".to_string(),
                }
            })
            .collect();
        artifacts.push(Artifact {
            name: "Logcat".to_string(),
            kind: "DEVICE_LOG".to_string(),
            extension: "txt".to_string(),
            url: format!("file|{run}|logcat.txt"),
        });
        Ok(artifacts)
    }

    async fn fetch_artifact(&self, url: &str) -> Result<Vec<u8>> {
        if url.starts_with("file|") {
            return Ok(b"trace".to_vec());
        }
        let run = url
            .strip_prefix("zip|")
            .ok_or_else(|| anyhow!("unexpected url {url}"))?;
        let traces = self.script_for(run).map_or(0, |script| script.traces);
        let names: Vec<String> = (1..=traces)
            .map(|i| format!("coldStartup_iter{i}.perfetto-trace"))
            .collect();
        let mut files: Vec<(&str, &[u8])> = names
            .iter()
            .map(|name| (name.as_str(), &b"trace"[..]))
            .collect();
        files.push(("device.log", &b"log"[..]));
        Ok(zip(&files))
    }
}

/// Marker backend keyed by trace file name. Unknown files report
/// bind/render/page-load at 0, 2 ms and 5 ms.
#[derive(Default)]
pub struct FakeTraceQuery {
    markers: HashMap<String, MarkerTimestamps>,
    failing: HashSet<String>,
    calls: AtomicUsize,
}

impl FakeTraceQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_markers(mut self, file_name: &str, markers: MarkerTimestamps) -> Self {
        self.markers.insert(file_name.to_string(), markers);
        self
    }

    pub fn failing(mut self, file_name: &str) -> Self {
        self.failing.insert(file_name.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TraceQuery for FakeTraceQuery {
    fn marker_timestamps(&self, trace: &Path) -> Result<MarkerTimestamps> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let name = trace
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.failing.contains(&name) {
            bail!("trace processor crashed on {name}");
        }
        Ok(self
            .markers
            .get(&name)
            .copied()
            .unwrap_or(MarkerTimestamps {
                bind_application: Some(0),
                render_begin: Some(2_000_000),
                page_load_complete: Some(5_000_000),
            }))
    }
}
