use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use backoff::future::retry;
use backoff::{Error as BackoffError, ExponentialBackoffBuilder};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use urlencoding::encode;

use super::{
    Artifact, Resource, RunCounters, RunHandle, RunObservation, ScheduleRequest, TestService,
    UploadHandle, UploadKind, UploadStatus, UploadTarget,
};

const MAX_ATTEMPTS: usize = 5;
const RETRY_BASE_DELAY_MS: u64 = 300;
const MAX_BACKOFF_SECS: u64 = 8;
const JOB_TIMEOUT_MINUTES: u32 = 60;

pub const API_KEY_ENV: &str = "PERFRUN_API_KEY";

#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    api_key: String,
    project: String,
}

#[derive(Debug, Deserialize)]
struct UploadEnvelope {
    upload: UploadBody,
}

#[derive(Debug, Deserialize)]
struct UploadBody {
    arn: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    metadata: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunEnvelope {
    run: RunBody,
}

#[derive(Debug, Deserialize)]
struct RunBody {
    arn: String,
    status: String,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    counters: Option<RunCounters>,
}

#[derive(Debug, Deserialize)]
struct JobsResponse {
    #[serde(default)]
    jobs: Vec<Resource>,
}

#[derive(Debug, Deserialize)]
struct SuitesResponse {
    #[serde(default)]
    suites: Vec<Resource>,
}

#[derive(Debug, Deserialize)]
struct TestsResponse {
    #[serde(default)]
    tests: Vec<Resource>,
}

#[derive(Debug, Deserialize)]
struct ArtifactsResponse {
    #[serde(default)]
    artifacts: Vec<Artifact>,
}

impl ApiClient {
    pub fn new(base_url: &str, api_key: &str, project: &str) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            bail!("api_url is not configured (set it with `perfrun config set api_url <url>`)");
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            api_key: api_key.to_string(),
            project: project.to_string(),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let response = self
            .send_with_retry(|| self.authorized(Method::GET, &url))
            .await?;
        response
            .json::<T>()
            .await
            .with_context(|| format!("failed to parse response from GET {path}"))
    }

    /// POSTs here create uploads and runs, so a lost response must not be
    /// replayed. They are sent once and failures surface to the caller.
    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.url(path);
        let response = self
            .send_once(self.authorized(Method::POST, &url).json(body))
            .await
            .with_context(|| format!("POST {path} failed"))?;
        response
            .json::<T>()
            .await
            .with_context(|| format!("failed to parse response from POST {path}"))
    }

    fn authorized(&self, method: Method, url: &str) -> RequestBuilder {
        let request = self.http.request(method, url);
        if self.api_key.is_empty() {
            request
        } else {
            request.bearer_auth(&self.api_key)
        }
    }

    async fn send_once(&self, request: RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|err| anyhow!("service request failed: {err}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("service request failed ({status}): {body}");
        }
        Ok(response)
    }

    /// Send a request, retrying server errors and network failures with exponential backoff.
    async fn send_with_retry<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let attempt_counter = Arc::new(AtomicUsize::new(0));
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(RETRY_BASE_DELAY_MS))
            .with_multiplier(2.0)
            .with_randomization_factor(0.2)
            .with_max_interval(Duration::from_secs(MAX_BACKOFF_SECS))
            .with_max_elapsed_time(None)
            .build();

        let result = retry(backoff, || {
            let request = build();
            let attempt_counter = Arc::clone(&attempt_counter);
            async move {
                let attempt = attempt_counter.fetch_add(1, Ordering::Relaxed) + 1;
                match request.send().await {
                    Ok(response) => {
                        let status = response.status();
                        if status.is_success() {
                            return Ok(response);
                        }
                        let body = response.text().await.unwrap_or_default();
                        let should_retry = status.is_server_error() || status.as_u16() == 429;
                        if should_retry && attempt < MAX_ATTEMPTS {
                            tracing::debug!(attempt, %status, "retrying service request");
                            Err(BackoffError::transient(anyhow!(
                                "service returned {status} on attempt {attempt}/{MAX_ATTEMPTS}: {body}"
                            )))
                        } else {
                            Err(BackoffError::permanent(anyhow!(
                                "service request failed ({status}): {body}"
                            )))
                        }
                    }
                    Err(err) if attempt < MAX_ATTEMPTS => {
                        tracing::debug!(attempt, error = %err, "retrying service request");
                        Err(BackoffError::transient(anyhow!(
                            "network error on attempt {attempt}/{MAX_ATTEMPTS}: {err}"
                        )))
                    }
                    Err(err) => Err(BackoffError::permanent(anyhow!(
                        "service request failed: {err}"
                    ))),
                }
            }
        })
        .await;

        result.map_err(|err| {
            let attempts = attempt_counter.load(Ordering::Relaxed).max(1);
            err.context(format!("request failed after {attempts} attempt(s)"))
        })
    }
}

impl TestService for ApiClient {
    async fn create_upload(&self, name: &str, kind: UploadKind) -> Result<UploadTarget> {
        let path = format!("/v1/projects/{}/uploads", encode(&self.project));
        let envelope: UploadEnvelope = self
            .post(&path, &json!({ "name": name, "type": kind.as_str() }))
            .await?;
        let url = envelope
            .upload
            .url
            .ok_or_else(|| anyhow!("service returned no upload URL for {name}"))?;
        Ok(UploadTarget {
            handle: UploadHandle::from(envelope.upload.arn),
            url,
        })
    }

    async fn put_bytes(&self, target: &UploadTarget, content: Vec<u8>) -> Result<()> {
        // Pre-signed upload URLs carry their own authorization.
        let response = self
            .http
            .put(&target.url)
            .header("content-type", "application/octet-stream")
            .body(content)
            .send()
            .await
            .with_context(|| format!("failed to upload bytes for {}", target.handle))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("upload for {} rejected ({status}): {body}", target.handle);
        }
        Ok(())
    }

    async fn upload_status(&self, handle: &UploadHandle) -> Result<UploadStatus> {
        let path = format!("/v1/uploads/{}", encode(handle.as_str()));
        let envelope: UploadEnvelope = self.get(&path).await?;
        let status = envelope.upload.status.unwrap_or_default();
        Ok(UploadStatus::from_service(
            &status,
            envelope.upload.metadata.as_deref(),
        ))
    }

    async fn schedule_run(&self, request: ScheduleRequest<'_>) -> Result<RunHandle> {
        let path = format!("/v1/projects/{}/runs", encode(&self.project));
        let body = json!({
            "name": request.run_name,
            "appArn": request.app.as_str(),
            "devicePoolArn": request.device_pool.as_str(),
            "test": {
                "type": "INSTRUMENTATION",
                "testPackageArn": request.test_package.as_str(),
                "testSpecArn": request.test_spec.as_str(),
                "parameters": { "TEST_CLASS": request.test_class },
            },
            "executionConfiguration": {
                "jobTimeoutMinutes": JOB_TIMEOUT_MINUTES,
                "accountsCleanup": true,
                "appPackagesCleanup": true,
            },
        });
        let envelope: RunEnvelope = self.post(&path, &body).await?;
        tracing::debug!(run = %envelope.run.arn, status = %envelope.run.status, "run scheduled");
        Ok(RunHandle::from(envelope.run.arn))
    }

    async fn run_status(&self, run: &RunHandle) -> Result<RunObservation> {
        let path = format!("/v1/runs/{}", encode(run.as_str()));
        let envelope: RunEnvelope = self.get(&path).await?;
        Ok(RunObservation {
            status: envelope.run.status,
            result: envelope.run.result,
            counters: envelope.run.counters,
        })
    }

    async fn list_jobs(&self, run: &RunHandle) -> Result<Vec<Resource>> {
        let path = format!("/v1/runs/{}/jobs", encode(run.as_str()));
        let list: JobsResponse = self.get(&path).await?;
        Ok(list.jobs)
    }

    async fn list_suites(&self, job_arn: &str) -> Result<Vec<Resource>> {
        let path = format!("/v1/jobs/{}/suites", encode(job_arn));
        let list: SuitesResponse = self.get(&path).await?;
        Ok(list.suites)
    }

    async fn list_tests(&self, suite_arn: &str) -> Result<Vec<Resource>> {
        let path = format!("/v1/suites/{}/tests", encode(suite_arn));
        let list: TestsResponse = self.get(&path).await?;
        Ok(list.tests)
    }

    async fn list_artifacts(&self, arn: &str) -> Result<Vec<Artifact>> {
        let path = format!("/v1/artifacts?arn={}&type=FILE", encode(arn));
        let list: ArtifactsResponse = self.get(&path).await?;
        Ok(list.artifacts)
    }

    async fn fetch_artifact(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .send_with_retry(|| self.http.get(url))
            .await
            .context("failed to download artifact")?;
        let bytes = response
            .bytes()
            .await
            .context("failed to read artifact body")?;
        Ok(bytes.to_vec())
    }
}
