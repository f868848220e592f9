//! Error types for the chunkscribe-core library

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for transcription pipeline operations
#[derive(Error, Debug)]
pub enum TranscribeError {
    /// The media tool could not read the input, or its duration output was unusable.
    #[error("Media probe error: {0}")]
    MediaProbe(String),

    /// Transcoding the input or cutting a chunk out of it failed.
    #[error("Media extraction error: {0}")]
    MediaExtraction(String),

    /// The backend rejected (or was never given) a credential.
    #[error("Backend authentication error: {0}")]
    BackendAuth(String),

    #[error("Backend error{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Backend {
        status: Option<u16>,
        message: String,
    },

    /// Cooperative exit after a cancellation request. Not a failure.
    #[error("Transcription cancelled")]
    Cancelled,

    #[error("Input file not found: {}", .0.display())]
    InputNotFound(PathBuf),

    #[error("Download error: {0}")]
    Download(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The queue worker has exited and accepts no more commands.
    #[error("Task queue is closed")]
    QueueClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, TranscribeError>;

impl TranscribeError {
    pub fn backend(status: Option<u16>, message: impl Into<String>) -> Self {
        TranscribeError::Backend {
            status,
            message: message.into(),
        }
    }

    pub const fn is_cancellation(&self) -> bool {
        matches!(self, TranscribeError::Cancelled)
    }
}

impl From<reqwest::Error> for TranscribeError {
    fn from(err: reqwest::Error) -> Self {
        TranscribeError::Backend {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

impl PartialEq for TranscribeError {
    fn eq(&self, other: &Self) -> bool {
        match self {
            TranscribeError::MediaProbe(msg) => {
                matches!(other, TranscribeError::MediaProbe(o) if msg == o)
            }
            TranscribeError::MediaExtraction(msg) => {
                matches!(other, TranscribeError::MediaExtraction(o) if msg == o)
            }
            TranscribeError::BackendAuth(msg) => {
                matches!(other, TranscribeError::BackendAuth(o) if msg == o)
            }
            TranscribeError::Backend { status, message } => matches!(
                other,
                TranscribeError::Backend { status: s, message: m } if status == s && message == m
            ),
            TranscribeError::Cancelled => matches!(other, TranscribeError::Cancelled),
            TranscribeError::InputNotFound(path) => {
                matches!(other, TranscribeError::InputNotFound(o) if path == o)
            }
            TranscribeError::Download(msg) => {
                matches!(other, TranscribeError::Download(o) if msg == o)
            }
            TranscribeError::Configuration(msg) => {
                matches!(other, TranscribeError::Configuration(o) if msg == o)
            }
            TranscribeError::QueueClosed => matches!(other, TranscribeError::QueueClosed),
            TranscribeError::Io(err) => {
                matches!(other, TranscribeError::Io(e) if err.to_string() == e.to_string())
            }
        }
    }
}
