use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::time::Instant;

use super::{TestService, UploadHandle, UploadKind, UploadStatus};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload of {name} failed: {reason}")]
    Failed { name: String, reason: String },

    #[error("upload of {name} was not ready after {}s", .waited.as_secs())]
    TimedOut { name: String, waited: Duration },
}

#[derive(Debug, Clone, Copy)]
pub struct UploadPolicy {
    pub poll_interval: Duration,
    pub ready_ceiling: Duration,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            poll_interval: super::UPLOAD_POLL_INTERVAL,
            ready_ceiling: super::UPLOAD_READY_CEILING,
        }
    }
}

/// Create an upload, push `content` to it and wait until the service has processed it.
pub async fn upload_bytes<S: TestService>(
    service: &S,
    name: &str,
    kind: UploadKind,
    content: Vec<u8>,
    policy: UploadPolicy,
) -> Result<UploadHandle> {
    tracing::debug!(name, kind = kind.as_str(), bytes = content.len(), "creating upload");
    let target = service
        .create_upload(name, kind)
        .await
        .with_context(|| format!("failed to create upload for {name}"))?;
    service
        .put_bytes(&target, content)
        .await
        .with_context(|| format!("failed to upload {name}"))?;

    let started = Instant::now();
    loop {
        let status = service
            .upload_status(&target.handle)
            .await
            .with_context(|| format!("failed to check upload status of {name}"))?;
        match status {
            UploadStatus::Ready => {
                tracing::info!(name, upload = %target.handle, "upload ready");
                return Ok(target.handle);
            }
            UploadStatus::Failed(reason) => {
                return Err(UploadError::Failed {
                    name: name.to_string(),
                    reason,
                }
                .into());
            }
            UploadStatus::Processing => {}
        }

        if started.elapsed() >= policy.ready_ceiling {
            return Err(UploadError::TimedOut {
                name: name.to_string(),
                waited: policy.ready_ceiling,
            }
            .into());
        }
        tokio::time::sleep(policy.poll_interval).await;
    }
}
