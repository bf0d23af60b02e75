//! Turning a finished run's artifacts into trace files on disk.

use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;

use crate::devicefarm::{RunHandle, TestService};

const TRACE_MARKER: &str = ".perfetto-trace";
const TRACE_SUFFIX: &str = ".trace";
const TRACE_BUNDLE_SUFFIX: &str = "traces.tar.gz";
const CUSTOMER_ARTIFACT: &str = "CUSTOMER_ARTIFACT";

pub fn is_trace_file_name(name: &str) -> bool {
    name.contains(TRACE_MARKER) || name.ends_with(TRACE_SUFFIX)
}

fn basename(entry_name: &str) -> Option<&str> {
    entry_name
        .rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
}

fn write_flat(output_dir: &Path, entry_name: &str, bytes: &[u8]) -> Result<Option<PathBuf>> {
    let Some(name) = basename(entry_name) else {
        return Ok(None);
    };
    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    let path = output_dir.join(name);
    fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(Some(path))
}

/// Extract trace files from a customer-artifact zip into `output_dir`.
///
/// Entries ending in `traces.tar.gz` are opened and every trace inside is
/// extracted; trace entries sitting directly in the zip are extracted as-is.
/// Directory structure is discarded. Anything else is ignored.
///
/// Only an unreadable archive is an error. A damaged entry is logged and
/// skipped, and traces already written are still returned.
pub fn extract_traces_from_zip(zip_bytes: &[u8], output_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(zip_bytes)).context("artifact is not a valid zip")?;
    let mut extracted = Vec::new();

    for index in 0..archive.len() {
        let mut entry = match archive.by_index(index) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(index, error = %err, "skipping unreadable zip entry");
                continue;
            }
        };
        if entry.is_dir() {
            continue;
        }
        let entry_name = entry.name().to_string();
        let is_bundle = entry_name.ends_with(TRACE_BUNDLE_SUFFIX);
        if !is_bundle && !is_trace_file_name(&entry_name) {
            continue;
        }

        let mut bytes = Vec::new();
        if let Err(err) = entry.read_to_end(&mut bytes) {
            tracing::warn!(entry = %entry_name, error = %err, "skipping unreadable zip entry");
            continue;
        }
        if is_bundle {
            tracing::debug!(entry = %entry_name, "found compressed trace bundle");
            extracted.extend(extract_traces_from_tar_gz(&bytes, output_dir));
        } else {
            extracted.extend(save_trace(output_dir, &entry_name, &bytes));
        }
    }

    Ok(extracted)
}

/// Extract trace files from a gzip tarball into `output_dir`, stopping at the
/// first corrupt entry and keeping what was written before it.
fn extract_traces_from_tar_gz(bundle: &[u8], output_dir: &Path) -> Vec<PathBuf> {
    let mut archive = tar::Archive::new(GzDecoder::new(bundle));
    let mut extracted = Vec::new();

    let entries = match archive.entries() {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(error = %err, "trace bundle is not a gzip tarball");
            return extracted;
        }
    };
    for entry in entries {
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(
                    extracted = extracted.len(),
                    error = %err,
                    "trace bundle is truncated or corrupt"
                );
                break;
            }
        };
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let entry_name = match entry.path() {
            Ok(path) => path.to_string_lossy().into_owned(),
            Err(err) => {
                tracing::warn!(error = %err, "skipping bundle entry with an invalid path");
                continue;
            }
        };
        if !is_trace_file_name(&entry_name) {
            continue;
        }
        let mut bytes = Vec::new();
        if let Err(err) = entry.read_to_end(&mut bytes) {
            tracing::warn!(entry = %entry_name, error = %err, "trace bundle is truncated or corrupt");
            break;
        }
        extracted.extend(save_trace(output_dir, &entry_name, &bytes));
    }

    extracted
}

fn save_trace(output_dir: &Path, entry_name: &str, bytes: &[u8]) -> Option<PathBuf> {
    match write_flat(output_dir, entry_name, bytes) {
        Ok(Some(path)) => {
            tracing::debug!(path = %path.display(), "extracted trace");
            Some(path)
        }
        Ok(None) => None,
        Err(err) => {
            tracing::warn!(entry = %entry_name, error = %format!("{err:#}"), "skipping trace");
            None
        }
    }
}

/// Download every trace produced by `run` into `<output_dir>/<run folder>/`.
///
/// Failures on individual listings and artifacts are logged and skipped, so
/// traces saved before a failure are always returned. An empty result means
/// the run produced no usable traces.
pub async fn download_run_traces<S: TestService>(
    service: &S,
    run: &RunHandle,
    output_dir: &Path,
) -> Vec<PathBuf> {
    let run_dir = output_dir.join(run.folder_name());
    let mut downloaded = Vec::new();

    for job in listed("jobs", run.as_str(), service.list_jobs(run).await) {
        for artifact in listed("artifacts", &job.arn, service.list_artifacts(&job.arn).await) {
            if artifact.kind != CUSTOMER_ARTIFACT || artifact.extension != "zip" {
                continue;
            }
            let extracted = match service.fetch_artifact(&artifact.url).await {
                Ok(bytes) => extract_traces_from_zip(&bytes, &run_dir),
                Err(err) => Err(err),
            };
            match extracted {
                Ok(paths) => downloaded.extend(paths),
                Err(err) => {
                    tracing::warn!(artifact = %artifact.name, error = %format!("{err:#}"), "skipping artifact");
                }
            }
        }

        for suite in listed("suites", &job.arn, service.list_suites(&job.arn).await) {
            for test in listed("tests", &suite.arn, service.list_tests(&suite.arn).await) {
                let artifacts = listed("artifacts", &test.arn, service.list_artifacts(&test.arn).await);
                for artifact in artifacts {
                    if !is_trace_file_name(&artifact.name) {
                        continue;
                    }
                    match service.fetch_artifact(&artifact.url).await {
                        Ok(bytes) => downloaded.extend(save_trace(&run_dir, &artifact.name, &bytes)),
                        Err(err) => {
                            tracing::warn!(artifact = %artifact.name, error = %format!("{err:#}"), "skipping artifact");
                        }
                    }
                }
            }
        }
    }

    if downloaded.is_empty() {
        remove_if_empty(&run_dir);
    }
    downloaded
}

fn listed<T>(what: &str, parent: &str, listing: Result<Vec<T>>) -> Vec<T> {
    listing.unwrap_or_else(|err| {
        tracing::warn!(parent, error = %format!("{err:#}"), "could not list {what}");
        Vec::new()
    })
}

fn remove_if_empty(dir: &Path) {
    let is_empty = fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false);
    if is_empty {
        let _ = fs::remove_dir(dir);
    }
}
