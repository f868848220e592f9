//! OpenAI-compatible audio API backend (OpenAI, or any local server speaking the same API)

use super::{BackendSegment, TranscriptionBackend};
use crate::config::BackendConfig;
use crate::error::{Result, TranscribeError};
use crate::task::{TaskKind, TranscriptionOptions};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

/// Body of a `verbose_json` response; only the segments are used
#[derive(Debug, Deserialize)]
struct VerboseTranscription {
    #[serde(default)]
    segments: Vec<BackendSegment>,
}

#[derive(Debug, Clone)]
pub struct OpenAiBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.request_timeout() {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|e| {
            TranscribeError::Configuration(format!("Failed to build HTTP client: {}", e))
        })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim().trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    /// The translations endpoint always produces English
    fn endpoint(&self, task: TaskKind) -> String {
        let operation = match task {
            TaskKind::Transcribe => "transcriptions",
            TaskKind::Translate => "translations",
        };
        format!("{}/audio/{}", self.base_url, operation)
    }

    /// Task-level key first, then the backend's own
    fn api_key<'a>(&'a self, options: &'a TranscriptionOptions) -> Result<&'a str> {
        options
            .api_key
            .as_deref()
            .or(self.api_key.as_deref())
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| TranscribeError::BackendAuth("No API key configured".to_string()))
    }

    fn form(audio: &Path, bytes: Vec<u8>, options: &TranscriptionOptions) -> Result<Form> {
        let file_name = audio
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio.mp3")
            .to_string();

        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime_for(audio))
            .map_err(|e| TranscribeError::backend(None, e.to_string()))?;

        let mut form = Form::new()
            .part("file", part)
            .text("model", options.model.clone())
            .text("response_format", "verbose_json");

        if options.task == TaskKind::Transcribe {
            if let Some(language) = options.language.as_deref().filter(|l| !l.is_empty()) {
                form = form.text("language", language.to_string());
            }
        }

        Ok(form)
    }
}

impl TranscriptionBackend for OpenAiBackend {
    async fn transcribe(
        &self,
        audio: &Path,
        options: &TranscriptionOptions,
    ) -> Result<Vec<BackendSegment>> {
        let api_key = self.api_key(options)?;
        let bytes = tokio::fs::read(audio).await?;
        let url = self.endpoint(options.task);

        debug!(url = %url, bytes = bytes.len(), model = %options.model, "sending audio to backend");

        let form = Self::form(audio, bytes, options)?;
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let transcription: VerboseTranscription = response.json().await?;
        debug!(segments = transcription.segments.len(), "backend responded");
        Ok(transcription.segments)
    }
}

/// Map a non-2xx response to the error the pipeline reports
fn status_error(status: StatusCode, body: String) -> TranscribeError {
    let message = if body.trim().is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        body.trim().to_string()
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TranscribeError::BackendAuth(message),
        _ => TranscribeError::backend(Some(status.as_u16()), message),
    }
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("m4a") => "audio/mp4",
        Some("ogg") => "audio/ogg",
        Some("flac") => "audio/flac",
        Some("webm") => "audio/webm",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn backend(base_url: &str, api_key: Option<&str>) -> OpenAiBackend {
        let mut config = BackendConfig {
            base_url: base_url.to_string(),
            ..BackendConfig::default()
        };
        config.api_key = api_key.map(str::to_string);
        OpenAiBackend::new(&config).unwrap()
    }

    /// Serve exactly one HTTP request, answering with `status` and `body`,
    /// and hand back the raw request text.
    async fn serve_once(status: u16, body: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 8192];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if request_complete(&request) {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = tx.send(String::from_utf8_lossy(&request).into_owned());
        });

        (format!("http://{}/v1", addr), rx)
    }

    fn request_complete(request: &[u8]) -> bool {
        let Some(header_end) = request.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let headers = String::from_utf8_lossy(&request[..header_end]).to_ascii_lowercase();
        let body_len = request.len() - header_end - 4;
        match headers
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            Some(expected) => body_len >= expected,
            None => request.ends_with(b"0\r\n\r\n"),
        }
    }

    fn audio_file(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("chunk.mp3");
        std::fs::write(&path, b"ID3 fake mp3 bytes").unwrap();
        path
    }

    #[test]
    fn endpoints_follow_task_kind() {
        let backend = backend("https://api.example.test/v1/", Some("k"));
        assert_eq!(
            backend.endpoint(TaskKind::Transcribe),
            "https://api.example.test/v1/audio/transcriptions"
        );
        assert_eq!(
            backend.endpoint(TaskKind::Translate),
            "https://api.example.test/v1/audio/translations"
        );
    }

    #[test]
    fn auth_statuses_are_auth_errors() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, "bad key".into()),
            TranscribeError::BackendAuth(m) if m == "bad key"
        ));
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, String::new()),
            TranscribeError::BackendAuth(m) if m == "Forbidden"
        ));
        assert_eq!(
            status_error(StatusCode::BAD_GATEWAY, " upstream down ".into()),
            TranscribeError::backend(Some(502), "upstream down")
        );
    }

    #[test]
    fn parses_verbose_segments() {
        let body = r#"{"task":"transcribe","duration":3.0,"text":"hi there",
            "segments":[{"id":0,"start":1.5,"end":3.0,"text":" hi there","avg_logprob":-0.2}]}"#;
        let parsed: VerboseTranscription = serde_json::from_str(body).unwrap();
        assert_eq!(
            parsed.segments,
            vec![BackendSegment {
                start: 1.5,
                end: 3.0,
                text: " hi there".to_string()
            }]
        );

        let empty: VerboseTranscription = serde_json::from_str(r#"{"text":""}"#).unwrap();
        assert!(empty.segments.is_empty());
    }

    #[tokio::test]
    async fn missing_key_fails_before_any_request() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend("http://127.0.0.1:9", None);
        let err = backend
            .transcribe(&audio_file(&dir), &TranscriptionOptions::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TranscribeError::BackendAuth("No API key configured".to_string())
        );
    }

    #[tokio::test]
    async fn translate_request_shape() {
        let dir = tempfile::tempdir().unwrap();
        let (base_url, request) =
            serve_once(200, r#"{"segments":[{"start":0.0,"end":1.25,"text":"Hello"}]}"#).await;

        let options = TranscriptionOptions::new()
            .with_task(TaskKind::Translate)
            .with_language("fr")
            .with_api_key("sk-task");
        let segments = backend(&base_url, Some("sk-default"))
            .transcribe(&audio_file(&dir), &options)
            .await
            .unwrap();

        assert_eq!(
            segments,
            vec![BackendSegment {
                start: 0.0,
                end: 1.25,
                text: "Hello".to_string()
            }]
        );

        let request = request.await.unwrap();
        assert!(request.starts_with("POST /v1/audio/translations "));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer sk-task"));
        assert!(request.contains("name=\"response_format\"\r\n\r\nverbose_json"));
        assert!(request.contains("name=\"model\"\r\n\r\nwhisper-1"));
        assert!(request.contains("filename=\"chunk.mp3\""));
        assert!(!request.contains("name=\"language\""));
    }

    #[tokio::test]
    async fn transcribe_sends_language() {
        let dir = tempfile::tempdir().unwrap();
        let (base_url, request) = serve_once(200, r#"{"segments":[]}"#).await;

        let options = TranscriptionOptions::new().with_language("de");
        let segments = backend(&base_url, Some("sk"))
            .transcribe(&audio_file(&dir), &options)
            .await
            .unwrap();
        assert!(segments.is_empty());

        let request = request.await.unwrap();
        assert!(request.starts_with("POST /v1/audio/transcriptions "));
        assert!(request.contains("name=\"language\"\r\n\r\nde"));
    }

    #[tokio::test]
    async fn rejected_key_is_an_auth_error() {
        let dir = tempfile::tempdir().unwrap();
        let (base_url, _request) =
            serve_once(401, r#"{"error":{"message":"Incorrect API key provided"}}"#).await;

        let err = backend(&base_url, Some("sk-wrong"))
            .transcribe(&audio_file(&dir), &TranscriptionOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TranscribeError::BackendAuth(m) if m.contains("Incorrect API key")));
    }

    #[tokio::test]
    async fn server_error_keeps_status() {
        let dir = tempfile::tempdir().unwrap();
        let (base_url, _request) = serve_once(500, "oops").await;

        let err = backend(&base_url, Some("sk"))
            .transcribe(&audio_file(&dir), &TranscriptionOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err, TranscribeError::backend(Some(500), "oops"));
    }
}
