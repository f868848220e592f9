//! External media tool integration: probing, normalizing and chunking

mod command;
pub mod chunker;
pub mod probe;
pub mod transcode;

pub use chunker::{
    plan_chunks, secs_to_ms, Chunk, ChunkPlan, ChunkSpan, IntermediateAudio, MediaChunker,
};
pub use probe::{FfprobeProber, MediaInfo, MediaProber};
pub use transcode::{FfmpegTranscoder, MediaTranscoder};
