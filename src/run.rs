use std::fs;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Local;
use clap::Args;
use comfy_table::{Cell, Table};

use crate::args::BaseArgs;
use crate::batch::Batch;
use crate::config::Settings;
use crate::devicefarm::http::API_KEY_ENV;
use crate::devicefarm::{ApiClient, DevicePoolHandle, UploadPolicy};
use crate::events::TracingSink;
use crate::interrupt::Interrupt;
use crate::monitor::{MonitorConfig, MonitorOutcome, MonitorReport, RunMonitor};
use crate::scheduler::{
    file_safe_name, schedule_batches, upload_packages, BatchRequest, PackageFile,
};
use crate::ui::{count_cell, print_command_status, styled_table, with_spinner, CommandStatus};
use crate::utils::counted;

const DEFAULT_NAME_FORMAT: &str = "Performance Test - %Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// App package (.apk) under test
    #[arg(long, value_name = "APK")]
    app: PathBuf,

    /// Instrumentation test package (.apk)
    #[arg(long, value_name = "APK")]
    test_package: PathBuf,

    /// Fully qualified test to run, e.g. com.example.Startup#coldStartup
    #[arg(long, value_name = "CLASS")]
    test_class: String,

    /// Short test name used in file names (defaults to the method name)
    #[arg(long)]
    test_name: Option<String>,

    /// Total iterations to run across all batches
    #[arg(long, short = 'n')]
    iterations: NonZeroU32,

    /// Base run name (defaults to "Performance Test - <timestamp>")
    #[arg(long)]
    name: Option<String>,

    /// Test spec template with {{TEST_SELECTOR}} and {{NUM_ITERATIONS}} placeholders
    #[arg(long, value_name = "PATH")]
    template: Option<PathBuf>,

    /// Largest number of iterations in one remote run
    #[arg(long)]
    max_batch_size: Option<NonZeroU32>,

    /// Retries for a batch whose run finishes without traces
    #[arg(long)]
    max_retries: Option<u32>,

    /// Seconds between status polls
    #[arg(long, value_name = "SECS")]
    poll_interval: Option<u64>,

    /// Where trace files are written (defaults to <output_dir>/<name>/traces/<test name>)
    #[arg(long, value_name = "DIR")]
    traces_dir: Option<PathBuf>,
}

impl RunArgs {
    fn test_name(&self) -> String {
        self.test_name
            .clone()
            .unwrap_or_else(|| default_test_name(&self.test_class))
    }
}

/// `com.example.Startup#coldStartup` -> `coldStartup`, `com.example.Startup` -> `Startup`.
pub fn default_test_name(test_class: &str) -> String {
    match test_class.rsplit_once('#') {
        Some((_, method)) if !method.is_empty() => method.to_string(),
        _ => test_class
            .rsplit('.')
            .next()
            .unwrap_or(test_class)
            .to_string(),
    }
}

fn read_package(path: &Path) -> Result<PackageFile> {
    let content =
        fs::read(path).with_context(|| format!("failed to read package {}", path.display()))?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("package path has no file name: {}", path.display()))?;
    Ok(PackageFile { name, content })
}

fn required(value: Option<String>, key: &str) -> Result<String> {
    value.filter(|v| !v.trim().is_empty()).ok_or_else(|| {
        anyhow!(
            "{key} is not configured (pass --{} or run `perfrun config set {key} <value>`)",
            key.replace('_', "-")
        )
    })
}

pub async fn run(base: BaseArgs, args: RunArgs) -> Result<()> {
    let settings = Settings::load(&base)?;
    let api_url = required(settings.api_url.clone(), "api_url")?;
    let project = required(settings.project.clone(), "project")?;
    let device_pool = required(settings.device_pool.clone(), "device_pool")?;

    let template_path = args
        .template
        .clone()
        .or_else(|| settings.test_spec_template.clone())
        .ok_or_else(|| {
            anyhow!("no test spec template (pass --template or set test_spec_template)")
        })?;
    let template = fs::read_to_string(&template_path)
        .with_context(|| format!("failed to read template {}", template_path.display()))?;

    let app = read_package(&args.app)?;
    let test_package = read_package(&args.test_package)?;

    let base_name = args
        .name
        .clone()
        .unwrap_or_else(|| Local::now().format(DEFAULT_NAME_FORMAT).to_string());
    let test_name = args.test_name();
    let traces_dir = args.traces_dir.clone().unwrap_or_else(|| {
        settings
            .output_dir
            .join(file_safe_name(&base_name))
            .join("traces")
            .join(&test_name)
    });

    let api_key = std::env::var(API_KEY_ENV).unwrap_or_default();
    let client = ApiClient::new(&api_url, &api_key, &project)?;
    let policy = UploadPolicy::default();

    let context = with_spinner(
        "Uploading packages...",
        upload_packages(
            &client,
            app,
            test_package,
            DevicePoolHandle::from(device_pool),
            &args.test_class,
            policy,
        ),
    )
    .await?;

    let request = BatchRequest {
        base_name: &base_name,
        test_name: &test_name,
        total_iterations: args.iterations,
        max_batch_size: args.max_batch_size.unwrap_or(settings.max_batch_size),
        spec_template: &template,
    };
    let batches = schedule_batches(&client, &context, &request, policy).await?;
    print_command_status(
        CommandStatus::Success,
        &format!(
            "Scheduled {} for {} iterations",
            counted(batches.len(), "run", None),
            args.iterations
        ),
    );

    let config = MonitorConfig {
        max_retries: args.max_retries.unwrap_or(settings.max_retries),
        poll_interval: args
            .poll_interval
            .map(Duration::from_secs)
            .unwrap_or(settings.poll_interval),
        output_dir: traces_dir.clone(),
    };
    let interrupt = Interrupt::new();
    let listener = interrupt.listen_for_ctrl_c();
    let sink = TracingSink;
    let report = RunMonitor::new(&client, &context, &sink, config, interrupt)
        .run(batches)
        .await;
    listener.abort();

    if base.json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        println!("{}", batch_table(&report.batches));
    }
    finish(&report, &traces_dir)
}

fn finish(report: &MonitorReport, traces_dir: &Path) -> Result<()> {
    let traces = report.traces.len();
    match &report.outcome {
        MonitorOutcome::Completed => {
            print_command_status(
                CommandStatus::Success,
                &format!(
                    "Collected {} in {}",
                    counted(traces, "trace", None),
                    traces_dir.display()
                ),
            );
            Ok(())
        }
        MonitorOutcome::Failed { failure } => {
            print_command_status(
                CommandStatus::Error,
                &format!(
                    "{} kept in {}",
                    counted(traces, "trace", None),
                    traces_dir.display()
                ),
            );
            bail!("{failure}")
        }
        MonitorOutcome::Interrupted => {
            print_command_status(
                CommandStatus::Warning,
                &format!(
                    "Interrupted with {} in {}; remote runs are still active",
                    counted(traces, "trace", None),
                    traces_dir.display()
                ),
            );
            bail!("monitoring interrupted")
        }
    }
}

pub fn batch_table(batches: &[Batch]) -> Table {
    let mut table = styled_table(&[
        "Batch",
        "Iterations",
        "Attempts",
        "State",
        "Status",
        "Result",
        "Traces",
        "Run",
    ]);
    for batch in batches {
        table.add_row(vec![
            count_cell(batch.index),
            count_cell(batch.planned_iterations),
            count_cell(batch.attempt),
            Cell::new(batch.state),
            Cell::new(batch.last_status.as_deref().unwrap_or("-")),
            Cell::new(batch.outcome().as_deref().unwrap_or("-")),
            count_cell(batch.traces.len()),
            Cell::new(batch.run.short()),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchState;
    use crate::devicefarm::{RunCounters, RunHandle, RunObservation, UploadHandle};

    #[test]
    fn test_name_defaults_to_method() {
        assert_eq!(default_test_name("com.example.Startup#coldStartup"), "coldStartup");
        assert_eq!(default_test_name("com.example.Startup"), "Startup");
        assert_eq!(default_test_name("Startup#"), "Startup#");
    }

    #[test]
    fn missing_settings_name_the_flag() {
        let err = required(None, "device_pool").unwrap_err();
        assert!(err.to_string().contains("--device-pool"));
        assert!(required(Some("  ".into()), "project").is_err());
        assert_eq!(required(Some("p".into()), "project").unwrap(), "p");
    }

    #[test]
    fn table_shows_each_batch() {
        let batch = Batch::scheduled(
            1,
            50,
            UploadHandle::from("spec"),
            "main".into(),
            RunHandle::from("arn:aws:devicefarm:us-west-2:1:run:p/abcdef123456"),
        )
        .observed(&RunObservation {
            status: "COMPLETED".to_string(),
            result: Some("WARNED".to_string()),
            counters: Some(RunCounters {
                total: 50,
                passed: 49,
                warned: 1,
                ..RunCounters::default()
            }),
        })
        .succeeded(vec![PathBuf::from("a_iter1.perfetto-trace")]);
        let rendered = batch_table(&[batch]).to_string();
        assert!(rendered.contains(BatchState::Succeeded.as_str()));
        assert!(rendered.contains("WARNED 49/50"));
        assert!(rendered.contains("ef123456"));
    }
}
