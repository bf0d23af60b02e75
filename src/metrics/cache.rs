use std::fs;
use std::io::ErrorKind;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::utils::write_json_atomic;

use super::{extract_metrics, MetricsError, TraceMetricsRecord, TraceQuery};

pub const CACHE_FILE_NAME: &str = ".metrics_cache.json";

#[derive(Debug, Clone)]
pub struct LoadedMetrics {
    pub records: Vec<TraceMetricsRecord>,
    pub from_cache: bool,
}

pub fn cache_path(dir: &Path) -> PathBuf {
    dir.join(CACHE_FILE_NAME)
}

/// Cached records for `dir`, or `None` when there is no usable snapshot.
pub fn read_snapshot(dir: &Path) -> Option<Vec<TraceMetricsRecord>> {
    let path = cache_path(dir);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return None,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable metrics cache");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(records) => Some(records),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ignoring malformed metrics cache");
            None
        }
    }
}

fn write_snapshot(dir: &Path, records: &[TraceMetricsRecord]) -> Result<()> {
    write_json_atomic(&cache_path(dir), records)
}

/// Records for `dir`, from the snapshot when `use_cache` allows, otherwise by
/// extraction. A successful extraction replaces the snapshot when `use_cache`.
pub async fn load_or_extract(
    dir: &Path,
    use_cache: bool,
    query: Arc<dyn TraceQuery>,
    workers: Option<NonZeroUsize>,
) -> Result<LoadedMetrics> {
    if !dir.is_dir() {
        return Err(MetricsError::DirectoryMissing(dir.to_path_buf()).into());
    }

    if use_cache {
        if let Some(records) = read_snapshot(dir) {
            tracing::info!(
                path = %cache_path(dir).display(),
                records = records.len(),
                "using cached metrics"
            );
            return Ok(LoadedMetrics {
                records,
                from_cache: true,
            });
        }
    }

    let records = extract_metrics(dir, query, workers).await?;

    if use_cache {
        match write_snapshot(dir, &records) {
            Ok(()) => tracing::debug!(path = %cache_path(dir).display(), "cached metrics"),
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "failed to cache metrics");
            }
        }
    }

    Ok(LoadedMetrics {
        records,
        from_cache: false,
    })
}

/// Remove the snapshot for `dir`. Returns whether one existed.
pub fn clear(dir: &Path) -> Result<bool> {
    let path = cache_path(dir);
    match fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(anyhow!(err).context(format!("failed to remove {}", path.display()))),
    }
}
