//! Media duration probing through `ffprobe`
//!
//! Only container metadata is read; the media is never decoded.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::ports::DurationProbe;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("No duration reported for {0}")]
    UnknownDuration(PathBuf),
}

/// Duration probe that asks `ffprobe` for the container's duration
#[derive(Debug, Clone)]
pub struct FfprobeDurationProbe {
    program: String,
}

impl Default for FfprobeDurationProbe {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

impl FfprobeDurationProbe {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl DurationProbe for FfprobeDurationProbe {
    #[instrument(level = "debug", skip(self))]
    async fn probe(&self, path: &Path) -> Result<Duration, ProbeError> {
        let output = Command::new(&self.program)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ProbeError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProbeError::Failed {
                program: self.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let duration = parse_duration(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| ProbeError::UnknownDuration(path.to_path_buf()))?;
        debug!(millis = duration.as_millis() as u64, "Probed media duration");
        Ok(duration)
    }
}

/// Parse ffprobe's `format=duration` output (fractional seconds, or `N/A`)
fn parse_duration(output: &str) -> Option<Duration> {
    let seconds: f64 = output.lines().next()?.trim().parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(Duration::from_millis((seconds * 1000.0).round() as u64))
}
