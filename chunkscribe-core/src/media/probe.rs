//! Media duration probing

use super::command::run_tool;
use crate::error::{Result, TranscribeError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::debug;

/// What the pipeline needs to know about a media file
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    /// Duration in seconds
    pub duration_secs: f64,
}

/// Reads the duration of a media file.
///
/// Failures are [`TranscribeError::MediaProbe`] and are never retried.
pub trait MediaProber: Send + Sync {
    fn probe(&self, path: &Path) -> impl Future<Output = Result<MediaInfo>> + Send;
}

/// [`MediaProber`] backed by the `ffprobe` executable
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    program: PathBuf,
}

impl FfprobeProber {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn args(path: &Path) -> Vec<std::ffi::OsString> {
        let mut args: Vec<std::ffi::OsString> = [
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ]
        .into_iter()
        .map(Into::into)
        .collect();
        args.push(path.as_os_str().to_owned());
        args
    }
}

impl Default for FfprobeProber {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

impl MediaProber for FfprobeProber {
    async fn probe(&self, path: &Path) -> Result<MediaInfo> {
        let stdout = run_tool(&self.program, Self::args(path))
            .await
            .map_err(TranscribeError::MediaProbe)?;
        let duration_secs = parse_duration(&String::from_utf8_lossy(&stdout))?;
        debug!(path = %path.display(), duration_secs, "probed media");
        Ok(MediaInfo { duration_secs })
    }
}

/// Parse ffprobe's bare duration output into seconds
pub fn parse_duration(output: &str) -> Result<f64> {
    let trimmed = output.trim();
    let duration: f64 = trimmed.parse().map_err(|_| {
        TranscribeError::MediaProbe(format!("Unparsable duration: {:?}", trimmed))
    })?;
    if !duration.is_finite() || duration < 0.0 {
        return Err(TranscribeError::MediaProbe(format!(
            "Invalid duration: {}",
            trimmed
        )));
    }
    Ok(duration)
}
