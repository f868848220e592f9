//! Splitting normalized audio into size-bounded chunks

use super::transcode::MediaTranscoder;
use crate::error::Result;
use crate::scratch::ScratchDir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tracing::debug;

/// Extension of the normalized audio and of every chunk cut from it
const AUDIO_SUFFIX: &str = ".mp3";

/// Time range of one chunk inside the intermediate audio, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkSpan {
    pub index: usize,
    pub start_secs: f64,
    pub end_secs: f64,
}

impl ChunkSpan {
    pub fn start_ms(&self) -> u64 {
        secs_to_ms(self.start_secs)
    }

    pub fn end_ms(&self) -> u64 {
        secs_to_ms(self.end_secs)
    }
}

/// Seconds to whole milliseconds, rounded to nearest
pub fn secs_to_ms(secs: f64) -> u64 {
    if secs.is_finite() && secs > 0.0 {
        (secs * 1000.0).round() as u64
    } else {
        0
    }
}

/// How the intermediate audio will be sent to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "spans")]
pub enum ChunkPlan {
    /// Small enough to upload as-is; nothing is cut
    Whole(ChunkSpan),
    /// Equal-duration slices, each cut into its own file
    Split(Vec<ChunkSpan>),
}

impl ChunkPlan {
    pub fn spans(&self) -> &[ChunkSpan] {
        match self {
            ChunkPlan::Whole(span) => std::slice::from_ref(span),
            ChunkPlan::Split(spans) => spans,
        }
    }

    pub fn len(&self) -> usize {
        self.spans().len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans().is_empty()
    }

    pub const fn is_split(&self) -> bool {
        matches!(self, ChunkPlan::Split(_))
    }
}

/// Decide the chunk boundaries for audio of `total_bytes` lasting `duration_secs`.
///
/// Below `max_chunk_bytes` the whole file is one chunk. Otherwise the
/// duration is cut into `ceil(total_bytes / max_chunk_bytes)` equal slices,
/// assuming a roughly constant bit-rate. Slices share their boundaries and
/// the last one ends exactly at `duration_secs`.
pub fn plan_chunks(total_bytes: u64, duration_secs: f64, max_chunk_bytes: u64) -> ChunkPlan {
    let duration_secs = if duration_secs.is_finite() {
        duration_secs.max(0.0)
    } else {
        0.0
    };
    let whole = ChunkSpan {
        index: 0,
        start_secs: 0.0,
        end_secs: duration_secs,
    };

    let max_chunk_bytes = max_chunk_bytes.max(1);
    if total_bytes < max_chunk_bytes || duration_secs == 0.0 {
        return ChunkPlan::Whole(whole);
    }

    let num_chunks = total_bytes.div_ceil(max_chunk_bytes) as usize;
    let chunk_duration = duration_secs / num_chunks as f64;

    let spans = (0..num_chunks)
        .map(|i| {
            let start_secs = i as f64 * chunk_duration;
            let end_secs = if i + 1 == num_chunks {
                duration_secs
            } else {
                ((i + 1) as f64 * chunk_duration).min(duration_secs)
            };
            ChunkSpan {
                index: i,
                start_secs,
                end_secs,
            }
        })
        .collect();

    ChunkPlan::Split(spans)
}

/// The normalized whole-file audio. Removed when dropped.
#[derive(Debug)]
pub struct IntermediateAudio {
    path: TempPath,
    size_bytes: u64,
}

impl IntermediateAudio {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

#[derive(Debug)]
enum ChunkFile {
    /// The intermediate file itself, owned elsewhere
    Whole(PathBuf),
    /// A cut of the intermediate file, removed with the chunk
    Extracted(TempPath),
}

/// One piece of audio ready for the backend
#[derive(Debug)]
pub struct Chunk {
    span: ChunkSpan,
    file: ChunkFile,
    size_bytes: u64,
}

impl Chunk {
    pub fn span(&self) -> ChunkSpan {
        self.span
    }

    pub fn path(&self) -> &Path {
        match &self.file {
            ChunkFile::Whole(path) => path.as_path(),
            ChunkFile::Extracted(path) => &**path,
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Whether dropping this chunk removes its file
    pub fn is_extracted(&self) -> bool {
        matches!(self.file, ChunkFile::Extracted(_))
    }
}

/// Turns an input file into backend-sized chunks of normalized audio
#[derive(Debug, Clone)]
pub struct MediaChunker<T> {
    transcoder: T,
    scratch: ScratchDir,
    max_chunk_bytes: u64,
}

impl<T: MediaTranscoder> MediaChunker<T> {
    pub fn new(transcoder: T, scratch: ScratchDir, max_chunk_bytes: u64) -> Self {
        Self {
            transcoder,
            scratch,
            max_chunk_bytes,
        }
    }

    pub fn scratch(&self) -> &ScratchDir {
        &self.scratch
    }

    /// Transcode `input` into a single mono audio file in the scratch directory
    pub async fn normalize(&self, input: &Path) -> Result<IntermediateAudio> {
        let path = self.scratch.create_temp(AUDIO_SUFFIX)?;
        self.transcoder.normalize(input, &path).await?;
        let size_bytes = tokio::fs::metadata(&path).await?.len();
        debug!(
            input = %input.display(),
            intermediate = %path.display(),
            size_bytes,
            "normalized input audio"
        );
        Ok(IntermediateAudio { path, size_bytes })
    }

    pub fn plan(&self, audio: &IntermediateAudio, duration_secs: f64) -> ChunkPlan {
        plan_chunks(audio.size_bytes, duration_secs, self.max_chunk_bytes)
    }

    /// The intermediate file as a single chunk, without cutting anything
    fn whole(&self, audio: &IntermediateAudio, span: ChunkSpan) -> Chunk {
        Chunk {
            span,
            file: ChunkFile::Whole(audio.path.to_path_buf()),
            size_bytes: audio.size_bytes,
        }
    }

    /// Cut `span` out of the intermediate audio into its own scratch file
    async fn extract(&self, audio: &IntermediateAudio, span: ChunkSpan) -> Result<Chunk> {
        let path = self.scratch.create_temp(AUDIO_SUFFIX)?;
        self.transcoder
            .extract(audio.path(), span.start_secs, span.end_secs, &path)
            .await?;
        let size_bytes = tokio::fs::metadata(&path).await?.len();
        debug!(
            chunk = span.index,
            start_secs = span.start_secs,
            end_secs = span.end_secs,
            size_bytes,
            path = %path.display(),
            "created chunk file"
        );
        Ok(Chunk {
            span,
            file: ChunkFile::Extracted(path),
            size_bytes,
        })
    }

    /// Materialize every chunk of the plan, in order.
    ///
    /// Below the size limit the single chunk is the intermediate file itself.
    /// Chunks already cut are removed again if a later cut fails.
    pub async fn split(&self, audio: &IntermediateAudio, duration_secs: f64) -> Result<Vec<Chunk>> {
        match self.plan(audio, duration_secs) {
            ChunkPlan::Whole(span) => Ok(vec![self.whole(audio, span)]),
            ChunkPlan::Split(spans) => {
                let mut chunks = Vec::with_capacity(spans.len());
                for span in spans {
                    chunks.push(self.extract(audio, span).await?);
                }
                Ok(chunks)
            }
        }
    }
}
