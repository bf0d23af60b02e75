//! Summary statistics for a base and a test record set, and how they differ.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use comfy_table::{Cell, Table};
use serde::Serialize;

use crate::metrics::TraceMetricsRecord;
use crate::ui::{count_cell, millis_cell, styled_table};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Startup,
    Render,
}

impl Metric {
    pub const ALL: [Metric; 2] = [Metric::Startup, Metric::Render];

    pub fn label(self) -> &'static str {
        match self {
            Metric::Startup => "startup latency",
            Metric::Render => "render latency",
        }
    }

    pub fn value(self, record: &TraceMetricsRecord) -> f64 {
        match self {
            Metric::Startup => record.startup_latency_ms,
            Metric::Render => record.render_latency_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub p90: f64,
    pub min: f64,
    pub max: f64,
    pub stddev: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricComparison {
    pub metric: Metric,
    pub base: Summary,
    pub test: Summary,
    pub delta_ms: f64,
    pub delta_pct: Option<f64>,
}

/// Mean latencies of one run folder, used to spot a noisy batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchMean {
    pub batch: usize,
    pub run_id: String,
    pub count: usize,
    pub startup_mean_ms: f64,
    pub render_mean_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Comparison {
    pub metrics: Vec<MetricComparison>,
    pub base_batches: Vec<BatchMean>,
    pub test_batches: Vec<BatchMean>,
}

/// Linear interpolation between closest ranks. `sorted` must be non-empty.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = p * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    sorted[lower] + (sorted[upper] - sorted[lower]) * (rank - lower as f64)
}

pub fn summarize(values: &[f64]) -> Option<Summary> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let count = sorted.len();
    let mean = sorted.iter().sum::<f64>() / count as f64;
    let stddev = if count > 1 {
        let variance =
            sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64;
        variance.sqrt()
    } else {
        0.0
    };

    Some(Summary {
        count,
        mean,
        median: percentile(&sorted, 0.5),
        p90: percentile(&sorted, 0.9),
        min: sorted[0],
        max: sorted[count - 1],
        stddev,
    })
}

pub fn batch_means(records: &[TraceMetricsRecord]) -> Vec<BatchMean> {
    let mut grouped: BTreeMap<(usize, &str), Vec<&TraceMetricsRecord>> = BTreeMap::new();
    for record in records {
        grouped
            .entry((record.batch, record.run_id.as_str()))
            .or_default()
            .push(record);
    }
    grouped
        .into_iter()
        .map(|((batch, run_id), group)| {
            let count = group.len();
            let mean = |metric: Metric| {
                group.iter().map(|r| metric.value(r)).sum::<f64>() / count as f64
            };
            BatchMean {
                batch,
                run_id: run_id.to_string(),
                count,
                startup_mean_ms: mean(Metric::Startup),
                render_mean_ms: mean(Metric::Render),
            }
        })
        .collect()
}

pub fn compare(base: &[TraceMetricsRecord], test: &[TraceMetricsRecord]) -> Result<Comparison> {
    if base.is_empty() || test.is_empty() {
        bail!("both sides need at least one record to compare");
    }

    let mut metrics = Vec::with_capacity(Metric::ALL.len());
    for metric in Metric::ALL {
        let side = |records: &[TraceMetricsRecord]| {
            let values: Vec<f64> = records.iter().map(|r| metric.value(r)).collect();
            summarize(&values)
        };
        let (Some(base_summary), Some(test_summary)) = (side(base), side(test)) else {
            bail!("no values for {}", metric.label());
        };
        let delta_ms = test_summary.mean - base_summary.mean;
        let delta_pct = (base_summary.mean != 0.0).then(|| delta_ms / base_summary.mean * 100.0);
        metrics.push(MetricComparison {
            metric,
            base: base_summary,
            test: test_summary,
            delta_ms,
            delta_pct,
        });
    }

    Ok(Comparison {
        metrics,
        base_batches: batch_means(base),
        test_batches: batch_means(test),
    })
}

fn signed(value: f64, suffix: &str) -> String {
    format!("{value:+.2}{suffix}")
}

pub fn comparison_table(comparison: &Comparison) -> Table {
    let mut table = styled_table(&[
        "Metric", "Side", "N", "Mean", "Median", "P90", "Min", "Max", "Stddev", "Delta",
    ]);

    for entry in &comparison.metrics {
        for (side, summary) in [("base", &entry.base), ("test", &entry.test)] {
            let delta = if side == "test" {
                match entry.delta_pct {
                    Some(pct) => format!("{} ({})", signed(entry.delta_ms, " ms"), signed(pct, "%")),
                    None => signed(entry.delta_ms, " ms"),
                }
            } else {
                String::new()
            };
            table.add_row(vec![
                Cell::new(if side == "base" { entry.metric.label() } else { "" }),
                Cell::new(side),
                count_cell(summary.count),
                millis_cell(summary.mean),
                millis_cell(summary.median),
                millis_cell(summary.p90),
                millis_cell(summary.min),
                millis_cell(summary.max),
                millis_cell(summary.stddev),
                Cell::new(delta),
            ]);
        }
    }
    table
}

pub fn batch_table(side: &str, batches: &[BatchMean]) -> Table {
    let mut table = styled_table(&["Side", "Batch", "Run", "N", "Startup mean", "Render mean"]);
    for batch in batches {
        table.add_row(vec![
            Cell::new(side),
            count_cell(batch.batch),
            Cell::new(&batch.run_id),
            count_cell(batch.count),
            millis_cell(batch.startup_mean_ms),
            millis_cell(batch.render_mean_ms),
        ]);
    }
    table
}
