//! Running the external media tools

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Run `program args...` to completion and return its stdout.
///
/// A launch failure or a non-zero exit is returned as a message; for the
/// latter the message is the tool's own stderr.
pub(crate) async fn run_tool<I, S>(program: &Path, args: I) -> std::result::Result<Vec<u8>, String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(command = ?command.as_std(), "running media tool");

    let output = command
        .output()
        .await
        .map_err(|e| format!("Failed to launch {}: {}", program.display(), e))?;

    if output.status.success() {
        return Ok(output.stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(if stderr.is_empty() {
        format!("{} exited with {}", program.display(), output.status)
    } else {
        stderr
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_on_success() {
        let out = run_tool(Path::new("sh"), ["-c", "printf 12.5"]).await.unwrap();
        assert_eq!(out, b"12.5");
    }

    #[tokio::test]
    async fn stderr_becomes_the_error_message() {
        let err = run_tool(Path::new("sh"), ["-c", "echo 'Invalid data found' >&2; exit 1"])
            .await
            .unwrap_err();
        assert_eq!(err, "Invalid data found");
    }

    #[tokio::test]
    async fn missing_program_is_reported() {
        let err = run_tool(Path::new("definitely-not-a-media-tool"), ["-version"])
            .await
            .unwrap_err();
        assert!(err.starts_with("Failed to launch definitely-not-a-media-tool"));
    }
}
