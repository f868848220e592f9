//! Normalizing media and cutting time ranges out of it

use super::command::run_tool;
use crate::error::{Result, TranscribeError};
use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};

/// Writes media files through an external tool.
///
/// Both operations overwrite `output`, which already exists as an empty
/// scratch file. Failures are [`TranscribeError::MediaExtraction`].
pub trait MediaTranscoder: Send + Sync {
    /// Re-encode `input` into the single mono audio stream sent to the backend
    fn normalize(&self, input: &Path, output: &Path) -> impl Future<Output = Result<()>> + Send;

    /// Copy `[start_secs, end_secs]` of `input` to `output` without re-encoding.
    ///
    /// `end_secs` is an absolute position in `input`, not a duration.
    fn extract(
        &self,
        input: &Path,
        start_secs: f64,
        end_secs: f64,
        output: &Path,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// [`MediaTranscoder`] backed by the `ffmpeg` executable
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn base_args(input: &Path) -> Vec<OsString> {
        vec![
            "-nostdin".into(),
            "-y".into(),
            "-i".into(),
            input.as_os_str().to_owned(),
        ]
    }

    pub(crate) fn normalize_args(input: &Path, output: &Path) -> Vec<OsString> {
        let mut args = Self::base_args(input);
        args.extend(
            ["-vn", "-ac", "1", "-ar", "16000", "-b:a", "64k"]
                .into_iter()
                .map(OsString::from),
        );
        args.push(output.as_os_str().to_owned());
        args
    }

    pub(crate) fn extract_args(
        input: &Path,
        start_secs: f64,
        end_secs: f64,
        output: &Path,
    ) -> Vec<OsString> {
        let mut args = Self::base_args(input);
        args.extend([
            "-ss".into(),
            start_secs.to_string().into(),
            "-to".into(),
            end_secs.to_string().into(),
            "-c".into(),
            "copy".into(),
        ]);
        args.push(output.as_os_str().to_owned());
        args
    }
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl MediaTranscoder for FfmpegTranscoder {
    async fn normalize(&self, input: &Path, output: &Path) -> Result<()> {
        run_tool(&self.program, Self::normalize_args(input, output))
            .await
            .map(drop)
            .map_err(TranscribeError::MediaExtraction)
    }

    async fn extract(
        &self,
        input: &Path,
        start_secs: f64,
        end_secs: f64,
        output: &Path,
    ) -> Result<()> {
        run_tool(
            &self.program,
            Self::extract_args(input, start_secs, end_secs, output),
        )
        .await
        .map(drop)
        .map_err(TranscribeError::MediaExtraction)
    }
}
