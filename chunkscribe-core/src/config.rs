//! Configuration options for the transcription pipeline

use crate::error::{Result, TranscribeError};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upload limit of the OpenAI audio endpoints
pub const DEFAULT_MAX_CHUNK_BYTES: u64 = 25 * 1024 * 1024;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Configuration shared by every task the pipeline runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// ffmpeg executable, looked up on `PATH` when not absolute
    pub ffmpeg_path: PathBuf,

    /// ffprobe executable, looked up on `PATH` when not absolute
    pub ffprobe_path: PathBuf,

    /// Directory for intermediate audio, chunk files and downloads
    pub scratch_dir: PathBuf,

    /// Largest audio payload sent to the backend in one request
    pub max_chunk_bytes: u64,

    /// Number of tasks allowed to run at once (1 = strictly sequential)
    pub workers: usize,

    /// Transcription backend settings
    pub backend: BackendConfig,
}

/// Settings for the OpenAI-compatible transcription backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// API root, e.g. `https://api.openai.com/v1` or a local compatible server
    pub base_url: String,

    /// Bearer token; tasks may override it
    pub api_key: Option<String>,

    /// Per-request timeout in seconds. No timeout if not set
    pub request_timeout_secs: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            scratch_dir: std::env::temp_dir().join("chunkscribe"),
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            workers: 1,
            backend: BackendConfig::default(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            request_timeout_secs: None,
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

impl PipelineConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Where the configuration file lives when no explicit path is given
    pub fn default_path() -> Result<PathBuf> {
        let project_dirs = ProjectDirs::from("dev", "chunkscribe", "chunkscribe").ok_or_else(
            || TranscribeError::Configuration("Failed to get XDG directories".to_string()),
        )?;
        Ok(project_dirs.config_dir().join("config.json"))
    }

    /// Read a JSON configuration file. Missing keys take their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TranscribeError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            TranscribeError::Configuration(format!("Invalid config {}: {}", path.display(), e))
        })
    }

    /// Load the file at `path`, or the default location if `path` is `None`.
    ///
    /// A missing default file is not an error; a missing explicit one is.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default = Self::default_path()?;
                if default.exists() {
                    Self::from_file(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn with_ffmpeg_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.ffmpeg_path = path.into();
        self
    }

    pub fn with_ffprobe_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.ffprobe_path = path.into();
        self
    }

    pub fn with_scratch_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn with_max_chunk_bytes(mut self, bytes: u64) -> Self {
        self.max_chunk_bytes = bytes;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_base_url<S: Into<String>>(mut self, url: S) -> Self {
        self.backend.base_url = url.into();
        self
    }

    pub fn with_api_key<S: Into<String>>(mut self, key: S) -> Self {
        self.backend.api_key = Some(key.into());
        self
    }

    pub fn with_request_timeout(mut self, secs: u64) -> Self {
        self.backend.request_timeout_secs = Some(secs);
        self
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_chunk_bytes == 0 {
            return Err(TranscribeError::Configuration(
                "max_chunk_bytes must be greater than zero".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(TranscribeError::Configuration(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.backend.base_url.trim().is_empty() {
            return Err(TranscribeError::Configuration(
                "backend.base_url is empty".to_string(),
            ));
        }
        Ok(())
    }
}
