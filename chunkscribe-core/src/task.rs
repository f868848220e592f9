//! Transcription tasks, segments and progress

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Identity of a task, stable across resubmissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which backend operation to run on the audio
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskKind {
    /// Text in the spoken language
    #[default]
    Transcribe,
    /// Text in English regardless of the spoken language
    Translate,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

/// How the task entered the system
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskSource {
    FileImport,
    UrlImport,
}

/// Where the media comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskInput {
    File(PathBuf),
    Url(String),
}

impl TaskInput {
    /// Name used for output files: the file stem, or the last URL path segment
    pub fn display_name(&self) -> String {
        match self {
            TaskInput::File(path) => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            TaskInput::Url(url) => {
                let trimmed = url.split(['?', '#']).next().unwrap_or(url);
                let last = trimmed.trim_end_matches('/').rsplit('/').next().unwrap_or(trimmed);
                match last.rsplit_once('.') {
                    Some((stem, _)) if !stem.is_empty() => stem.to_string(),
                    _ => last.to_string(),
                }
            }
        }
    }
}

impl fmt::Display for TaskInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskInput::File(path) => write!(f, "{}", path.display()),
            TaskInput::Url(url) => f.write_str(url),
        }
    }
}

/// Per-task transcription options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionOptions {
    /// Transcribe or translate
    pub task: TaskKind,

    /// Language code (e.g., "en", "es", "fr"). Auto-detect if `None`
    pub language: Option<String>,

    /// Backend model identifier
    pub model: String,

    /// Overrides the backend-level API key for this task only
    #[serde(skip_serializing, default)]
    pub api_key: Option<String>,
}

impl Default for TranscriptionOptions {
    fn default() -> Self {
        Self {
            task: TaskKind::Transcribe,
            language: None,
            model: "whisper-1".to_string(),
            api_key: None,
        }
    }
}

impl TranscriptionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task(mut self, task: TaskKind) -> Self {
        self.task = task;
        self
    }

    pub fn with_language<S: Into<String>>(mut self, language: S) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_model<S: Into<String>>(mut self, model: S) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_api_key<S: Into<String>>(mut self, api_key: S) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

/// A timed span of transcribed text, in milliseconds from the start of the source media
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

impl Segment {
    pub fn new(start_ms: u64, end_ms: u64, text: impl Into<String>) -> Self {
        Self {
            start_ms,
            end_ms: end_ms.max(start_ms),
            text: text.into(),
        }
    }
}

/// Chunks done out of the chunks planned for a running task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub completed: usize,
    pub total: usize,
}

impl ProgressEvent {
    pub const fn new(completed: usize, total: usize) -> Self {
        Self { completed, total }
    }
}

/// One source file or URL on its way to a transcript.
///
/// Only the queue worker changes `status`, `segments`, `error` and the
/// timestamps; collaborators hold copies delivered through queue events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTranscriptionTask {
    pub id: TaskId,
    pub input: TaskInput,
    pub source: TaskSource,
    pub options: TranscriptionOptions,
    pub status: TaskStatus,
    /// Ordered transcript, filled once the task is completed
    pub segments: Vec<Segment>,
    /// Failure message when the task is FAILED
    pub error: Option<String>,
    pub output_directory: Option<PathBuf>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl FileTranscriptionTask {
    fn new(input: TaskInput, source: TaskSource, options: TranscriptionOptions) -> Self {
        Self {
            id: TaskId::new(),
            input,
            source,
            options,
            status: TaskStatus::Queued,
            segments: Vec::new(),
            error: None,
            output_directory: None,
            queued_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn from_file<P: Into<PathBuf>>(path: P, options: TranscriptionOptions) -> Self {
        Self::new(TaskInput::File(path.into()), TaskSource::FileImport, options)
    }

    pub fn from_url<S: Into<String>>(url: S, options: TranscriptionOptions) -> Self {
        Self::new(TaskInput::Url(url.into()), TaskSource::UrlImport, options)
    }

    pub fn with_output_directory<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.output_directory = Some(dir.into());
        self
    }

    /// Plain transcript text, segments joined by single spaces
    pub fn text(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Back to a fresh QUEUED record, as when a task is resubmitted
    pub(crate) fn reset(&mut self) {
        self.status = TaskStatus::Queued;
        self.segments.clear();
        self.error = None;
        self.queued_at = Some(Utc::now());
        self.started_at = None;
        self.completed_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::str::FromStr;

    #[test]
    fn task_kind_parses_lowercase() {
        assert_eq!(TaskKind::from_str("translate"), Ok(TaskKind::Translate));
        assert_eq!(TaskKind::Transcribe.to_string(), "transcribe");
        assert!(TaskKind::from_str("summarize").is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Canceled.is_terminal());
        assert_eq!(TaskStatus::InProgress.to_string(), "in_progress");
    }

    #[test]
    fn constructors_set_provenance() {
        let file = FileTranscriptionTask::from_file("a.mp4", TranscriptionOptions::new());
        assert_eq!(file.source, TaskSource::FileImport);
        assert_eq!(file.status, TaskStatus::Queued);

        let url = FileTranscriptionTask::from_url("https://x.test/a.mp3", TranscriptionOptions::new());
        assert_eq!(url.source, TaskSource::UrlImport);
        assert_ne!(file.id, url.id);
    }

    #[rstest]
    #[case(TaskInput::File("/media/talk.final.mp4".into()), "talk.final")]
    #[case(TaskInput::Url("https://x.test/pod/ep12.mp3?sig=abc".into()), "ep12")]
    #[case(TaskInput::Url("https://x.test/watch/".into()), "watch")]
    fn display_names(#[case] input: TaskInput, #[case] expected: &str) {
        assert_eq!(input.display_name(), expected);
    }

    #[test]
    fn api_key_is_not_serialized() {
        let options = TranscriptionOptions::new().with_api_key("sk-secret");
        let json = serde_json::to_string(&options).unwrap();
        assert!(!json.contains("sk-secret"));

        let back: TranscriptionOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.api_key, None);
    }

    #[test]
    fn reset_clears_outcome() {
        let mut task = FileTranscriptionTask::from_file("a.wav", TranscriptionOptions::new());
        task.status = TaskStatus::Failed;
        task.error = Some("boom".into());
        task.segments.push(Segment::new(0, 10, "x"));
        task.reset();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.error.is_none());
        assert!(task.segments.is_empty());
        assert!(task.queued_at.is_some());
    }
}
