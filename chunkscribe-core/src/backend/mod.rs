//! Transcription backends

mod openai;

pub use openai::OpenAiBackend;

use crate::error::Result;
use crate::task::TranscriptionOptions;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;

/// A segment as reported by a backend: seconds relative to the submitted audio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Sends one audio file to a transcription engine.
///
/// Returns [`TranscribeError::BackendAuth`](crate::TranscribeError::BackendAuth)
/// for credential problems and
/// [`TranscribeError::Backend`](crate::TranscribeError::Backend) for every
/// other request failure. Neither is retried.
pub trait TranscriptionBackend: Send + Sync {
    fn transcribe(
        &self,
        audio: &Path,
        options: &TranscriptionOptions,
    ) -> impl Future<Output = Result<Vec<BackendSegment>>> + Send;
}
