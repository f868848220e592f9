//! Chunkscribe Core Library
//!
//! Transcribes audio and video files through an OpenAI-compatible speech API.
//! Inputs are normalized with ffmpeg, split into size-bounded chunks when the
//! backend's upload limit requires it, and the per-chunk segments are merged
//! back into one ordered transcript. A task queue runs many files with
//! cancellation and progress events.

pub mod backend;
pub mod config;
pub mod download;
pub mod error;
pub mod export;
pub mod media;
pub mod queue;
pub mod scratch;
pub mod task;
pub mod transcriber;

pub use backend::{BackendSegment, OpenAiBackend, TranscriptionBackend};
pub use config::{BackendConfig, PipelineConfig};
pub use error::{Result, TranscribeError};
pub use export::ExportFormat;
pub use media::{ChunkPlan, ChunkSpan, MediaChunker, MediaInfo, MediaProber, MediaTranscoder};
pub use queue::{
    Concurrency, ProgressReporter, QueueEvent, QueueHandle, TaskRunner, TranscriptionTaskQueue,
};
pub use scratch::ScratchDir;
pub use task::{
    FileTranscriptionTask, ProgressEvent, Segment, TaskId, TaskInput, TaskKind, TaskSource,
    TaskStatus, TranscriptionOptions,
};
pub use tokio_util::sync::CancellationToken;
pub use transcriber::{ChunkedFileTranscriber, DefaultTranscriber};

/// Queue backed by the default pipeline, sized by `config.workers`.
///
/// The returned queue must be driven with [`TranscriptionTaskQueue::run`].
pub fn build_queue(
    config: &PipelineConfig,
) -> Result<(TranscriptionTaskQueue<DefaultTranscriber>, QueueHandle)> {
    let transcriber = DefaultTranscriber::from_config(config)?;
    Ok(TranscriptionTaskQueue::new(
        transcriber,
        Concurrency::workers(config.workers),
    ))
}
