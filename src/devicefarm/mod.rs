//! Remote device-test service boundary.
//!
//! The orchestrator only talks to the service through [`TestService`]; the
//! HTTP gateway client lives in [`http`] and tests substitute in-memory fakes.

use std::fmt;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub mod http;
mod upload;

pub use http::ApiClient;
pub use upload::{upload_bytes, UploadError, UploadPolicy};

macro_rules! handle_type {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

handle_type!(UploadHandle);
handle_type!(RunHandle);
handle_type!(DevicePoolHandle);

impl RunHandle {
    /// Folder name for this run's traces; `:` and `/` are not filesystem safe.
    pub fn folder_name(&self) -> String {
        self.0.replace([':', '/'], "_")
    }

    /// Last few characters, for compact log lines.
    pub fn short(&self) -> &str {
        let start = self.0.len().saturating_sub(8);
        self.0.get(start..).unwrap_or(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    AndroidApp,
    InstrumentationTestPackage,
    InstrumentationTestSpec,
}

impl UploadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadKind::AndroidApp => "ANDROID_APP",
            UploadKind::InstrumentationTestPackage => "INSTRUMENTATION_TEST_PACKAGE",
            UploadKind::InstrumentationTestSpec => "INSTRUMENTATION_TEST_SPEC",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadTarget {
    pub handle: UploadHandle,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStatus {
    Processing,
    Ready,
    Failed(String),
}

impl UploadStatus {
    pub fn from_service(status: &str, metadata: Option<&str>) -> Self {
        match status {
            "SUCCEEDED" => UploadStatus::Ready,
            "FAILED" => UploadStatus::Failed(metadata.unwrap_or("Unknown error").to_string()),
            _ => UploadStatus::Processing,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleRequest<'a> {
    pub app: &'a UploadHandle,
    pub test_package: &'a UploadHandle,
    pub device_pool: &'a DevicePoolHandle,
    pub test_spec: &'a UploadHandle,
    pub test_class: &'a str,
    pub run_name: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Queued,
    Running,
    Completed,
    Stopped,
}

impl RunPhase {
    pub fn from_service(status: &str) -> Self {
        match status {
            "COMPLETED" => RunPhase::Completed,
            "STOPPED" => RunPhase::Stopped,
            "PREPARING" | "RUNNING" | "PROCESSING" | "STOPPING" => RunPhase::Running,
            _ => RunPhase::Queued,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::Stopped)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RunCounters {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub warned: u32,
    pub errored: u32,
    pub stopped: u32,
    pub skipped: u32,
}

/// One poll of a remote run.
#[derive(Debug, Clone)]
pub struct RunObservation {
    pub status: String,
    pub result: Option<String>,
    pub counters: Option<RunCounters>,
}

impl RunObservation {
    pub fn phase(&self) -> RunPhase {
        RunPhase::from_service(&self.status)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Resource {
    pub arn: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Artifact {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub extension: String,
    #[serde(default)]
    pub url: String,
}

/// Operations the orchestrator needs from the remote test-execution service.
#[allow(async_fn_in_trait)]
pub trait TestService {
    async fn create_upload(&self, name: &str, kind: UploadKind) -> Result<UploadTarget>;
    async fn put_bytes(&self, target: &UploadTarget, content: Vec<u8>) -> Result<()>;
    async fn upload_status(&self, handle: &UploadHandle) -> Result<UploadStatus>;
    async fn schedule_run(&self, request: ScheduleRequest<'_>) -> Result<RunHandle>;
    async fn run_status(&self, run: &RunHandle) -> Result<RunObservation>;
    async fn list_jobs(&self, run: &RunHandle) -> Result<Vec<Resource>>;
    async fn list_suites(&self, job_arn: &str) -> Result<Vec<Resource>>;
    async fn list_tests(&self, suite_arn: &str) -> Result<Vec<Resource>>;
    async fn list_artifacts(&self, arn: &str) -> Result<Vec<Artifact>>;
    async fn fetch_artifact(&self, url: &str) -> Result<Vec<u8>>;
}

pub const UPLOAD_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const UPLOAD_READY_CEILING: Duration = Duration::from_secs(300);
