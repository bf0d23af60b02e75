use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use crate::args::BaseArgs;
use crate::compare::{batch_table, compare, comparison_table, Comparison};
use crate::config::Settings;
use crate::metrics::cache::{load_or_extract, LoadedMetrics};
use crate::metrics::{TraceMetricsRecord, TraceProcessorShell, TraceQuery};
use crate::ui::{print_command_status, CommandStatus};
use crate::utils::{counted, write_json_atomic};

#[derive(Debug, Clone, Args)]
pub struct AnalyzeArgs {
    /// Directory with the baseline traces
    #[arg(value_name = "BASE_DIR")]
    base_dir: PathBuf,

    /// Directory with the traces to compare against the baseline
    #[arg(value_name = "TEST_DIR")]
    test_dir: PathBuf,

    /// Ignore and do not write .metrics_cache.json snapshots
    #[arg(long)]
    no_cache: bool,

    /// Parallel trace queries (defaults to the number of CPUs)
    #[arg(long)]
    workers: Option<NonZeroUsize>,

    /// trace_processor_shell binary (overrides trace_processor_path)
    #[arg(long, value_name = "PATH")]
    trace_processor: Option<PathBuf>,

    /// Write base/test records and the comparison as JSON into this directory
    #[arg(long, value_name = "DIR")]
    export: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct SideReport<'a> {
    dir: &'a Path,
    records: usize,
    from_cache: bool,
}

#[derive(Debug, Serialize)]
struct AnalyzeReport<'a> {
    base: SideReport<'a>,
    test: SideReport<'a>,
    comparison: &'a Comparison,
}

async fn load_side(
    label: &str,
    dir: &Path,
    args: &AnalyzeArgs,
    query: &Arc<dyn TraceQuery>,
) -> Result<LoadedMetrics> {
    tracing::info!(side = label, dir = %dir.display(), "loading traces");
    load_or_extract(dir, !args.no_cache, Arc::clone(query), args.workers)
        .await
        .with_context(|| format!("failed to process {label} traces"))
}

pub fn export(
    dir: &Path,
    base: &[TraceMetricsRecord],
    test: &[TraceMetricsRecord],
    comparison: &Comparison,
) -> Result<()> {
    write_json_atomic(&dir.join("base_metrics.json"), base)?;
    write_json_atomic(&dir.join("test_metrics.json"), test)?;
    write_json_atomic(&dir.join("comparison.json"), comparison)?;
    Ok(())
}

pub async fn run(base: BaseArgs, args: AnalyzeArgs) -> Result<()> {
    let settings = Settings::load(&base)?;
    let binary = args
        .trace_processor
        .clone()
        .unwrap_or_else(|| settings.trace_processor_path.clone());
    let query: Arc<dyn TraceQuery> = Arc::new(TraceProcessorShell::new(binary));

    let base_side = load_side("base", &args.base_dir, &args, &query).await?;
    let test_side = load_side("test", &args.test_dir, &args, &query).await?;
    let comparison =
        compare(&base_side.records, &test_side.records).context("cannot compare traces")?;

    if let Some(dir) = &args.export {
        export(dir, &base_side.records, &test_side.records, &comparison)?;
        print_command_status(
            CommandStatus::Success,
            &format!("Exported metrics to {}", dir.display()),
        );
    }

    if base.json {
        let report = AnalyzeReport {
            base: SideReport {
                dir: &args.base_dir,
                records: base_side.records.len(),
                from_cache: base_side.from_cache,
            },
            test: SideReport {
                dir: &args.test_dir,
                records: test_side.records.len(),
                from_cache: test_side.from_cache,
            },
            comparison: &comparison,
        };
        println!("{}", serde_json::to_string(&report)?);
        return Ok(());
    }

    let base_count = base_side.records.len();
    let test_count = test_side.records.len();
    print_command_status(
        CommandStatus::Success,
        &format!(
            "Compared {} with {}",
            counted(base_count, "base trace", None),
            counted(test_count, "test trace", None)
        ),
    );
    println!("{}", comparison_table(&comparison));
    println!();
    println!("{}", batch_table("base", &comparison.base_batches));
    println!();
    println!("{}", batch_table("test", &comparison.test_batches));
    Ok(())
}
