use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, bail, Context, Result};

use super::{MarkerTimestamps, BIND_APPLICATION, PAGE_LOAD_COMPLETE, RENDER_BEGIN};

/// Backend that reads the first timestamp of each startup marker from a trace.
pub trait TraceQuery: Send + Sync {
    fn marker_timestamps(&self, trace: &Path) -> Result<MarkerTimestamps>;

    /// Fail fast before any work is spawned.
    fn check(&self) -> Result<()> {
        Ok(())
    }
}

const BIND_COLUMN: &str = "bind_app_ts";
const RENDER_COLUMN: &str = "render_ts";
const PAGE_LOAD_COLUMN: &str = "page_load_ts";
const NULL_CELL: &str = "[NULL]";

pub fn marker_query() -> String {
    format!(
        "SELECT\n  \
         (SELECT MIN(ts) FROM slice WHERE name = '{BIND_APPLICATION}') AS {BIND_COLUMN},\n  \
         (SELECT MIN(ts) FROM slice WHERE name = '{RENDER_BEGIN}') AS {RENDER_COLUMN},\n  \
         (SELECT MIN(ts) FROM slice WHERE name = '{PAGE_LOAD_COMPLETE}') AS {PAGE_LOAD_COLUMN};\n"
    )
}

/// Runs the Perfetto `trace_processor_shell` binary once per trace.
#[derive(Debug, Clone)]
pub struct TraceProcessorShell {
    binary: PathBuf,
}

impl TraceProcessorShell {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl TraceQuery for TraceProcessorShell {
    fn check(&self) -> Result<()> {
        if !self.binary.is_file() {
            bail!(
                "trace processor not found at {} (set trace_processor_path or pass --trace-processor)",
                self.binary.display()
            );
        }
        Ok(())
    }

    fn marker_timestamps(&self, trace: &Path) -> Result<MarkerTimestamps> {
        let mut sql = tempfile::Builder::new()
            .prefix("perfrun-markers")
            .suffix(".sql")
            .tempfile()
            .context("failed to create query file")?;
        sql.write_all(marker_query().as_bytes())
            .context("failed to write query file")?;

        let output = Command::new(&self.binary)
            .arg("--query-file")
            .arg(sql.path())
            .arg(trace)
            .output()
            .with_context(|| format!("failed to run {}", self.binary.display()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "trace processor exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }

        parse_marker_csv(&String::from_utf8_lossy(&output.stdout))
    }
}

fn split_row(line: &str) -> Vec<&str> {
    line.split(',')
        .map(|cell| cell.trim().trim_matches('"'))
        .collect()
}

fn parse_cell(cell: &str) -> Result<Option<i64>> {
    if cell.is_empty() || cell == NULL_CELL {
        return Ok(None);
    }
    if let Ok(value) = cell.parse::<i64>() {
        return Ok(Some(value));
    }
    // Some builds print integral columns as floats.
    let value: f64 = cell
        .parse()
        .map_err(|_| anyhow!("unexpected timestamp value {cell:?}"))?;
    Ok(Some(value as i64))
}

/// Parse the CSV printed by `trace_processor_shell`: a header row naming the
/// marker columns followed by exactly one value row. Other lines are ignored.
pub fn parse_marker_csv(output: &str) -> Result<MarkerTimestamps> {
    let mut lines = output.lines().map(str::trim).filter(|line| !line.is_empty());
    let header = lines
        .by_ref()
        .map(split_row)
        .find(|cells| cells.contains(&BIND_COLUMN))
        .ok_or_else(|| anyhow!("trace processor output has no {BIND_COLUMN} column"))?;
    let values = lines
        .next()
        .map(split_row)
        .ok_or_else(|| anyhow!("trace processor returned no rows"))?;

    let column = |name: &str| -> Result<Option<i64>> {
        let index = header
            .iter()
            .position(|cell| *cell == name)
            .ok_or_else(|| anyhow!("trace processor output has no {name} column"))?;
        match values.get(index) {
            Some(cell) => parse_cell(cell),
            None => Ok(None),
        }
    };

    Ok(MarkerTimestamps {
        bind_application: column(BIND_COLUMN)?,
        render_begin: column(RENDER_COLUMN)?,
        page_load_complete: column(PAGE_LOAD_COLUMN)?,
    })
}
