//! Chunked file transcription: normalize, probe, chunk, transcribe, merge

use crate::backend::{BackendSegment, OpenAiBackend, TranscriptionBackend};
use crate::config::PipelineConfig;
use crate::download::download_to_scratch;
use crate::error::{Result, TranscribeError};
use crate::media::{
    secs_to_ms, Chunk, ChunkSpan, FfmpegTranscoder, FfprobeProber, MediaChunker, MediaProber,
    MediaTranscoder,
};
use crate::queue::{ProgressReporter, TaskRunner};
use crate::scratch::ScratchDir;
use crate::task::{FileTranscriptionTask, ProgressEvent, Segment, TaskInput};
use std::path::Path;
use tempfile::TempPath;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// The pipeline wired to ffprobe, ffmpeg and the OpenAI-compatible API
pub type DefaultTranscriber = ChunkedFileTranscriber<FfprobeProber, FfmpegTranscoder, OpenAiBackend>;

/// Runs one task from input media to an ordered transcript.
///
/// Chunks are processed strictly one after another. The first error of any
/// kind aborts the task and discards segments gathered so far; every temp
/// file the run created is gone by the time it returns.
pub struct ChunkedFileTranscriber<P, T, B> {
    prober: P,
    chunker: MediaChunker<T>,
    backend: B,
    http: reqwest::Client,
}

impl DefaultTranscriber {
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        config.validate()?;
        let chunker = MediaChunker::new(
            FfmpegTranscoder::new(&config.ffmpeg_path),
            ScratchDir::new(&config.scratch_dir),
            config.max_chunk_bytes,
        );
        Ok(Self::new(
            FfprobeProber::new(&config.ffprobe_path),
            chunker,
            OpenAiBackend::new(&config.backend)?,
        ))
    }
}

impl<P, T, B> ChunkedFileTranscriber<P, T, B>
where
    P: MediaProber,
    T: MediaTranscoder,
    B: TranscriptionBackend,
{
    pub fn new(prober: P, chunker: MediaChunker<T>, backend: B) -> Self {
        Self {
            prober,
            chunker,
            backend,
            http: reqwest::Client::new(),
        }
    }

    /// Transcribe `task`, calling `on_progress` once per finished chunk.
    ///
    /// `cancel` is honoured between steps: a backend call already in flight
    /// completes, but no further chunk starts and
    /// [`TranscribeError::Cancelled`] is returned.
    pub async fn run<F>(
        &self,
        task: &FileTranscriptionTask,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<Vec<Segment>>
    where
        F: FnMut(ProgressEvent) + Send,
    {
        check_cancelled(cancel)?;
        info!(task_id = %task.id, input = %task.input, task = %task.options.task, "starting transcription");

        let source = self.fetch_input(task, cancel).await?;
        check_cancelled(cancel)?;

        let audio = self.chunker.normalize(source.path()).await?;
        drop(source);
        check_cancelled(cancel)?;

        let info = self.prober.probe(audio.path()).await?;
        check_cancelled(cancel)?;

        let chunks = self.chunker.split(&audio, info.duration_secs).await?;
        let total = chunks.len();
        info!(
            task_id = %task.id,
            duration_secs = info.duration_secs,
            size_bytes = audio.size_bytes(),
            chunks = total,
            split = chunks.iter().any(Chunk::is_extracted),
            "planned chunks"
        );

        let mut segments = Vec::new();
        for chunk in chunks {
            check_cancelled(cancel)?;

            let span = chunk.span();
            let reported = self.backend.transcribe(chunk.path(), &task.options).await?;
            debug!(
                task_id = %task.id,
                chunk = span.index,
                size_bytes = chunk.size_bytes(),
                segments = reported.len(),
                "chunk transcribed"
            );
            drop(chunk);

            segments.extend(shift_segments(reported, &span));
            on_progress(ProgressEvent::new(span.index + 1, total));
        }

        info!(task_id = %task.id, segments = segments.len(), "transcription finished");
        Ok(segments)
    }
}

impl<P, T, B> ChunkedFileTranscriber<P, T, B>
where
    P: MediaProber,
    T: MediaTranscoder,
    B: TranscriptionBackend,
{
    async fn fetch_input<'a>(
        &self,
        task: &'a FileTranscriptionTask,
        cancel: &CancellationToken,
    ) -> Result<SourceMedia<'a>> {
        match &task.input {
            TaskInput::File(path) if path.exists() => Ok(SourceMedia::Local(path)),
            TaskInput::File(path) => Err(TranscribeError::InputNotFound(path.clone())),
            TaskInput::Url(url) => {
                download_to_scratch(&self.http, url, self.chunker.scratch(), cancel)
                    .await
                    .map(SourceMedia::Downloaded)
            }
        }
    }
}

/// The media a run starts from; a downloaded copy is removed on drop
enum SourceMedia<'a> {
    Local(&'a Path),
    Downloaded(TempPath),
}

impl SourceMedia<'_> {
    fn path(&self) -> &Path {
        match self {
            SourceMedia::Local(path) => path,
            SourceMedia::Downloaded(path) => path,
        }
    }
}

impl<P, T, B> TaskRunner for ChunkedFileTranscriber<P, T, B>
where
    P: MediaProber + 'static,
    T: MediaTranscoder + 'static,
    B: TranscriptionBackend + 'static,
{
    async fn run_task(
        &self,
        task: FileTranscriptionTask,
        cancel: CancellationToken,
        progress: ProgressReporter,
    ) -> Result<Vec<Segment>> {
        self.run(&task, &cancel, |event| progress.report(event)).await
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(TranscribeError::Cancelled)
    } else {
        Ok(())
    }
}

/// Move backend segments from chunk-relative seconds to source milliseconds.
///
/// Results are kept inside the chunk's window (when it has one) and sorted
/// by start time.
pub fn shift_segments(reported: Vec<BackendSegment>, span: &ChunkSpan) -> Vec<Segment> {
    let offset_ms = span.start_ms();
    let window_end_ms = span.end_ms();
    let bounded = window_end_ms > offset_ms;

    let mut segments: Vec<Segment> = reported
        .into_iter()
        .map(|s| {
            let mut start_ms = offset_ms + secs_to_ms(s.start);
            let mut end_ms = offset_ms + secs_to_ms(s.end);
            if bounded {
                start_ms = start_ms.min(window_end_ms);
                end_ms = end_ms.min(window_end_ms);
            }
            Segment::new(start_ms, end_ms, s.text)
        })
        .collect();
    segments.sort_by_key(|s| s.start_ms);
    segments
}
