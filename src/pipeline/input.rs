//! Input resolution: a user-supplied path or URL → validated PDF bytes.
//!
//! Ingestion works on bytes, not paths: the orchestrator copies them into
//! the blob store first and rasterises from that copy. Magic bytes are
//! checked here so a non-PDF fails with [`IngestError::NotAPdf`] before
//! anything is persisted.

use crate::error::IngestError;
use std::path::PathBuf;
use tracing::{debug, info};

const PDF_MAGIC: &[u8; 4] = b"%PDF";

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Reject byte buffers that do not start with `%PDF`.
pub fn validate_pdf_bytes(bytes: &[u8]) -> Result<(), IngestError> {
    if bytes.len() < PDF_MAGIC.len() || &bytes[..PDF_MAGIC.len()] != PDF_MAGIC {
        return Err(IngestError::NotAPdf {
            magic: bytes.iter().take(PDF_MAGIC.len()).copied().collect(),
        });
    }
    Ok(())
}

/// Load a PDF from a local path or an `http(s)` URL.
pub async fn load_pdf_bytes(input: &str, timeout_secs: u64) -> Result<Vec<u8>, IngestError> {
    let bytes = if is_url(input) {
        download_url(input, timeout_secs).await?
    } else {
        read_local(input).await?
    };
    validate_pdf_bytes(&bytes)?;
    Ok(bytes)
}

async fn read_local(path_str: &str) -> Result<Vec<u8>, IngestError> {
    let path = PathBuf::from(path_str);
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            debug!("Read {} bytes from {}", bytes.len(), path.display());
            Ok(bytes)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(IngestError::FileNotFound { path })
        }
        Err(e) => Err(IngestError::InputInvalid(format!(
            "cannot read '{}': {}",
            path.display(),
            e
        ))),
    }
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<Vec<u8>, IngestError> {
    info!("Downloading PDF from: {}", url);

    let failed = |reason: String| IngestError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            failed(format!("timed out after {}s", timeout_secs))
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
    info!("Downloaded {} bytes", bytes.len());
    Ok(bytes.to_vec())
}
