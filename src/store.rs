//! Persistence for finished attempts and their per-step screenshots.
//!
//! Disk layout:
//! ```text
//! <base>/summary.json
//! <base>/<model>/<task>/trajectory.json
//! <base>/<model>/<task>/step_000.png
//! ```

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs as async_fs;
use tracing::debug;

use crate::agent::TaskAttemptResult;
use crate::scheduler::RunSummary;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("b64 decode: {0}")]
    Image(#[from] base64::DecodeError),
}

#[async_trait]
pub trait TrajectorySink: Send + Sync {
    async fn record_screenshot(
        &self,
        _model: &str,
        _task: &str,
        _step: usize,
        _png_b64: &str,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn write_result(&self, result: &TaskAttemptResult) -> Result<(), StoreError>;

    async fn write_summary(&self, _summary: &RunSummary) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NullTrajectoryStore;

#[async_trait]
impl TrajectorySink for NullTrajectoryStore {
    async fn write_result(&self, _result: &TaskAttemptResult) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct DiskTrajectoryStore {
    base_dir: PathBuf,
}

impl DiskTrajectoryStore {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self { base_dir: base.as_ref().to_path_buf() }
    }

    pub fn attempt_dir(&self, model: &str, task: &str) -> PathBuf {
        self.base_dir.join(sanitize(model)).join(sanitize(task))
    }
}

/// Keeps ids usable as a single path component.
fn sanitize(component: &str) -> String {
    let s: String = component
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    match s.trim_matches('.') {
        "" => "_".to_string(),
        _ => s,
    }
}

#[async_trait]
impl TrajectorySink for DiskTrajectoryStore {
    async fn record_screenshot(
        &self,
        model: &str,
        task: &str,
        step: usize,
        png_b64: &str,
    ) -> Result<(), StoreError> {
        let dir = self.attempt_dir(model, task);
        async_fs::create_dir_all(&dir).await?;
        let png = B64.decode(png_b64)?;
        async_fs::write(dir.join(format!("step_{step:03}.png")), &png).await?;
        Ok(())
    }

    async fn write_result(&self, result: &TaskAttemptResult) -> Result<(), StoreError> {
        let dir = self.attempt_dir(&result.model, &result.task_id);
        async_fs::create_dir_all(&dir).await?;
        let path = dir.join("trajectory.json");
        async_fs::write(&path, serde_json::to_vec_pretty(result)?).await?;
        debug!(path = %path.display(), "wrote attempt result");
        Ok(())
    }

    async fn write_summary(&self, summary: &RunSummary) -> Result<(), StoreError> {
        async_fs::create_dir_all(&self.base_dir).await?;
        let path = self.base_dir.join("summary.json");
        async_fs::write(&path, serde_json::to_vec_pretty(summary)?).await?;
        debug!(path = %path.display(), "wrote run summary");
        Ok(())
    }
}
