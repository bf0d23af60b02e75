use std::num::NonZeroU32;

use anyhow::{Context, Result};

use crate::batch::{batch_run_name, plan_batches, Batch};
use crate::devicefarm::{
    upload_bytes, DevicePoolHandle, RunHandle, ScheduleRequest, TestService, UploadHandle,
    UploadKind, UploadPolicy,
};

pub const TEST_SELECTOR_PLACEHOLDER: &str = "{{TEST_SELECTOR}}";
pub const ITERATIONS_PLACEHOLDER: &str = "{{NUM_ITERATIONS}}";

/// Handles shared by every batch of one request. Created once, never mutated.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub app: UploadHandle,
    pub test_package: UploadHandle,
    pub device_pool: DevicePoolHandle,
    pub test_class: String,
}

impl RunContext {
    pub fn schedule_request<'a>(
        &'a self,
        test_spec: &'a UploadHandle,
        run_name: &'a str,
    ) -> ScheduleRequest<'a> {
        ScheduleRequest {
            app: &self.app,
            test_package: &self.test_package,
            device_pool: &self.device_pool,
            test_spec,
            test_class: &self.test_class,
            run_name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PackageFile {
    pub name: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct BatchRequest<'a> {
    pub base_name: &'a str,
    pub test_name: &'a str,
    pub total_iterations: NonZeroU32,
    pub max_batch_size: NonZeroU32,
    pub spec_template: &'a str,
}

pub fn test_selector(test_class: &str) -> String {
    format!("-e class {test_class}")
}

pub fn render_test_spec(template: &str, selector: &str, iterations: u32) -> String {
    template
        .replace(TEST_SELECTOR_PLACEHOLDER, selector)
        .replace(ITERATIONS_PLACEHOLDER, &iterations.to_string())
}

/// `name` with everything but ASCII alphanumerics, `-` and `_` replaced by `_`.
pub fn file_safe_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn spec_file_name(base_name: &str, test_name: &str, index: usize) -> String {
    format!(
        "{}_{}_batch{index}_testspec.yml",
        file_safe_name(base_name),
        file_safe_name(test_name)
    )
}

/// Upload the app and test packages once; every batch reuses the handles.
pub async fn upload_packages<S: TestService>(
    service: &S,
    app: PackageFile,
    test_package: PackageFile,
    device_pool: DevicePoolHandle,
    test_class: &str,
    policy: UploadPolicy,
) -> Result<RunContext> {
    tracing::info!(file = %app.name, "uploading app package");
    let app = upload_bytes(service, &app.name, UploadKind::AndroidApp, app.content, policy)
        .await
        .context("failed to upload app package")?;
    tracing::info!(file = %test_package.name, "uploading test package");
    let test_package = upload_bytes(
        service,
        &test_package.name,
        UploadKind::InstrumentationTestPackage,
        test_package.content,
        policy,
    )
    .await
    .context("failed to upload test package")?;

    Ok(RunContext {
        app,
        test_package,
        device_pool,
        test_class: test_class.to_string(),
    })
}

/// Plan, upload a test spec for, and schedule every batch of `request`.
///
/// The first failure aborts the whole request. Runs that were already scheduled
/// keep running remotely; their handles are logged so they can be found.
pub async fn schedule_batches<S: TestService>(
    service: &S,
    context: &RunContext,
    request: &BatchRequest<'_>,
    policy: UploadPolicy,
) -> Result<Vec<Batch>> {
    let plan = plan_batches(request.total_iterations, request.max_batch_size);
    let count = plan.len();
    if count > 1 {
        tracing::info!(
            iterations = request.total_iterations.get(),
            batches = count,
            "splitting request into batches"
        );
    }

    let selector = test_selector(&context.test_class);
    let mut batches = Vec::with_capacity(count);
    for (offset, iterations) in plan.into_iter().enumerate() {
        let index = offset + 1;
        match schedule_one(service, context, request, &selector, index, count, iterations, policy)
            .await
        {
            Ok(batch) => batches.push(batch),
            Err(err) => {
                for scheduled in &batches {
                    tracing::warn!(
                        batch = scheduled.index,
                        run = %scheduled.run,
                        "run left active after scheduling failure"
                    );
                }
                return Err(err.context(format!("failed to schedule batch {index}/{count}")));
            }
        }
    }

    tracing::info!(batches = count, name = request.base_name, "scheduled runs");
    Ok(batches)
}

#[allow(clippy::too_many_arguments)]
async fn schedule_one<S: TestService>(
    service: &S,
    context: &RunContext,
    request: &BatchRequest<'_>,
    selector: &str,
    index: usize,
    count: usize,
    iterations: u32,
    policy: UploadPolicy,
) -> Result<Batch> {
    let spec = render_test_spec(request.spec_template, selector, iterations);
    let spec_name = spec_file_name(request.base_name, request.test_name, index);
    let test_spec = upload_bytes(
        service,
        &spec_name,
        UploadKind::InstrumentationTestSpec,
        spec.into_bytes(),
        policy,
    )
    .await
    .context("failed to upload test spec")?;

    let run_name = batch_run_name(request.base_name, index, count);
    let run = schedule_run(service, context, &test_spec, &run_name).await?;
    tracing::info!(batch = index, iterations, run = %run, name = %run_name, "run scheduled");
    Ok(Batch::scheduled(index, iterations, test_spec, run_name, run))
}

pub async fn schedule_run<S: TestService>(
    service: &S,
    context: &RunContext,
    test_spec: &UploadHandle,
    run_name: &str,
) -> Result<RunHandle> {
    service
        .schedule_run(context.schedule_request(test_spec, run_name))
        .await
        .with_context(|| format!("failed to schedule run {run_name}"))
}
