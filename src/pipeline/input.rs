//! Upload sources for the CLI trigger: a local path or an HTTP(S) URL.
//!
//! Bytes are read fully into memory; the caller puts them into the upload
//! bucket and hands intake an [`crate::pipeline::intake::Upload`] pointing at
//! them. Missing `%PDF` magic is only logged: intake's page counter degrades
//! to an estimate rather than refusing the document.

use crate::error::PipelineError;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// An upload read from its source.
#[derive(Debug, Clone)]
pub struct LoadedUpload {
    pub filename: String,
    pub bytes: Vec<u8>,
    /// The path or URL it came from.
    pub origin: String,
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Read `input` from disk or download it.
pub async fn load_upload(input: &str, timeout_secs: u64) -> Result<LoadedUpload, PipelineError> {
    let upload = if is_url(input) {
        download_url(input, timeout_secs).await?
    } else {
        read_local(input).await?
    };
    if !upload.bytes.starts_with(b"%PDF") {
        warn!("{} does not start with %PDF magic bytes", upload.origin);
    }
    Ok(upload)
}

async fn read_local(path_str: &str) -> Result<LoadedUpload, PipelineError> {
    let path = PathBuf::from(path_str);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|source| PipelineError::UploadReadFailed {
            path: path.clone(),
            source,
        })?;
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document.pdf")
        .to_string();
    debug!("Read local upload {} ({} bytes)", path.display(), bytes.len());
    Ok(LoadedUpload {
        filename,
        bytes,
        origin: path_str.to_string(),
    })
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<LoadedUpload, PipelineError> {
    info!("Downloading upload from: {}", url);
    let failed = |reason: String| PipelineError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            failed(format!("timed out after {timeout_secs}s"))
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| failed(e.to_string()))?
        .to_vec();

    info!("Downloaded {} bytes", bytes.len());
    Ok(LoadedUpload {
        filename: filename_from_url(url),
        bytes,
        origin: url.to_string(),
    })
}

/// Last path segment of the URL if it looks like a file name.
pub fn filename_from_url(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }
    "downloaded.pdf".to_string()
}
