//! Fetching URL inputs into the scratch directory

use crate::error::{Result, TranscribeError};
use crate::scratch::ScratchDir;
use futures::StreamExt;
use tempfile::TempPath;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Stream the body at `url` into a new scratch file.
///
/// The file is removed again on failure or cancellation.
pub async fn download_to_scratch(
    client: &reqwest::Client,
    url: &str,
    scratch: &ScratchDir,
    cancel: &CancellationToken,
) -> Result<TempPath> {
    debug!(url, "downloading input");

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| TranscribeError::Download(format!("Failed to fetch {}: {}", url, e)))?;

    if !response.status().is_success() {
        return Err(TranscribeError::Download(format!(
            "Failed to fetch {}: HTTP {}",
            url,
            response.status()
        )));
    }

    let path = scratch.create_temp(&suffix_for(url))?;
    let mut file = fs::File::create(&path).await?;

    let mut stream = response.bytes_stream();
    let mut downloaded = 0u64;

    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            return Err(TranscribeError::Cancelled);
        }
        let chunk = chunk.map_err(|e| {
            TranscribeError::Download(format!("Failed to read download body: {}", e))
        })?;
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
    }

    file.flush().await?;
    drop(file);

    debug!(url, bytes = downloaded, path = %path.display(), "downloaded input");
    Ok(path)
}

/// Keep the URL's extension so the media tool can sniff the container
fn suffix_for(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last = path.rsplit('/').next().unwrap_or(path);
    match last.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= 5
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            format!(".{}", ext.to_ascii_lowercase())
        }
        _ => ".media".to_string(),
    }
}
