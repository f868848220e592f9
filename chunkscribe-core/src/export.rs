//! Transcript rendering: plain text, timestamped text, SRT, WebVTT and JSON

use crate::error::Result;
use crate::task::{FileTranscriptionTask, Segment};
use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use tracing::info;

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
pub enum ExportFormat {
    /// One `[start --> end] text` line per segment
    #[default]
    Text,
    /// Transcript text only
    Txt,
    Srt,
    Vtt,
    /// The whole task record, segments included
    Json,
}

impl ExportFormat {
    pub const fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Text | ExportFormat::Txt => "txt",
            ExportFormat::Srt => "srt",
            ExportFormat::Vtt => "vtt",
            ExportFormat::Json => "json",
        }
    }
}

/// Render a task's transcript in `format`
pub fn render(task: &FileTranscriptionTask, format: ExportFormat) -> Result<String> {
    Ok(match format {
        ExportFormat::Text => timestamped_text(&task.segments),
        ExportFormat::Txt => {
            let mut text = task.text();
            text.push('\n');
            text
        }
        ExportFormat::Srt => to_srt(&task.segments),
        ExportFormat::Vtt => to_vtt(&task.segments),
        ExportFormat::Json => serde_json::to_string_pretty(task).map_err(std::io::Error::from)?,
    })
}

pub fn timestamped_text(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|s| {
            format!(
                "[{} --> {}] {}\n",
                format_timestamp(s.start_ms, '.'),
                format_timestamp(s.end_ms, '.'),
                s.text.trim()
            )
        })
        .collect()
}

pub fn to_srt(segments: &[Segment]) -> String {
    segments
        .iter()
        .enumerate()
        .map(|(i, s)| {
            format!(
                "{}\n{} --> {}\n{}\n\n",
                i + 1,
                format_timestamp(s.start_ms, ','),
                format_timestamp(s.end_ms, ','),
                s.text.trim()
            )
        })
        .collect()
}

pub fn to_vtt(segments: &[Segment]) -> String {
    let mut out = String::from("WEBVTT\n\n");
    for s in segments {
        out.push_str(&format!(
            "{} --> {}\n{}\n\n",
            format_timestamp(s.start_ms, '.'),
            format_timestamp(s.end_ms, '.'),
            s.text.trim()
        ));
    }
    out
}

/// `HH:MM:SS<sep>mmm`
fn format_timestamp(ms: u64, separator: char) -> String {
    let hours = ms / 3_600_000;
    let mins = (ms % 3_600_000) / 60_000;
    let secs = (ms % 60_000) / 1_000;
    let millis = ms % 1_000;
    format!("{:02}:{:02}:{:02}{}{:03}", hours, mins, secs, separator, millis)
}

/// `"<input name> (<task>d on <date time>).<ext>"`, e.g.
/// `talk (transcribed on 16-Oct-2026 14-02-11).srt`
pub fn output_file_name<Tz>(
    task: &FileTranscriptionTask,
    format: ExportFormat,
    at: &DateTime<Tz>,
) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    format!(
        "{} ({}d on {}).{}",
        task.input.display_name(),
        task.options.task,
        at.format("%d-%b-%Y %H-%M-%S"),
        format.extension()
    )
}

/// Render `task` and write it into `dir` under [`output_file_name`]
pub async fn write_export<Tz>(
    task: &FileTranscriptionTask,
    format: ExportFormat,
    dir: &Path,
    at: &DateTime<Tz>,
) -> Result<PathBuf>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let contents = render(task, format)?;
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(output_file_name(task, format, at));
    tokio::fs::write(&path, contents).await?;
    info!(path = %path.display(), format = %format, "wrote transcript");
    Ok(path)
}
