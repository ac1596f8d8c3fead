//! On-disk blob artifacts keyed by store ids.
//!
//! ```text
//! <storage_dir>/pdfs/<manual_id>.pdf
//! <storage_dir>/pages/<manual_id>_<page>.png
//! <storage_dir>/crops/<image_id>.png
//! ```
//!
//! Writes go through a temp file in the target directory and are renamed
//! into place, so a reader never sees a half-written PNG. Reads of missing
//! artifacts return `Ok(None)`.

use crate::error::IngestError;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// PDF bytes parked on disk until the manual row exists.
#[derive(Debug)]
pub struct StagedPdf {
    file: tempfile::NamedTempFile,
}

impl StagedPdf {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pdf_path(&self, manual_id: i64) -> PathBuf {
        self.root.join("pdfs").join(format!("{manual_id}.pdf"))
    }

    pub fn page_raster_path(&self, manual_id: i64, page: u32) -> PathBuf {
        self.root.join("pages").join(format!("{manual_id}_{page}.png"))
    }

    pub fn crop_path(&self, image_id: i64) -> PathBuf {
        self.root.join("crops").join(format!("{image_id}.png"))
    }

    pub async fn put_pdf(&self, manual_id: i64, bytes: &[u8]) -> Result<PathBuf, IngestError> {
        let path = self.pdf_path(manual_id);
        write_atomic(&path, bytes).await?;
        Ok(path)
    }

    /// Write `bytes` to an anonymous file next to the PDFs so they can be
    /// inspected before any manual id exists. Dropping the result deletes it.
    pub async fn stage_pdf(&self, bytes: &[u8]) -> Result<StagedPdf, IngestError> {
        let dir = self.root.join("pdfs");
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || {
            let io_err = |source: std::io::Error| IngestError::ArtifactWrite {
                path: dir.clone(),
                source,
            };
            std::fs::create_dir_all(&dir).map_err(io_err)?;
            let mut file = tempfile::NamedTempFile::new_in(&dir).map_err(io_err)?;
            file.write_all(&bytes).map_err(io_err)?;
            file.flush().map_err(io_err)?;
            Ok(StagedPdf { file })
        })
        .await
        .map_err(|e| IngestError::Internal(format!("Staging task panicked: {}", e)))?
    }

    /// Move a staged PDF to its final `<manual_id>.pdf` name.
    pub async fn commit_pdf(&self, staged: StagedPdf, manual_id: i64) -> Result<PathBuf, IngestError> {
        let path = self.pdf_path(manual_id);
        let target = path.clone();
        tokio::task::spawn_blocking(move || {
            staged
                .file
                .persist(&target)
                .map_err(|e| IngestError::ArtifactWrite {
                    path: target.clone(),
                    source: e.error,
                })
        })
        .await
        .map_err(|e| IngestError::Internal(format!("Commit task panicked: {}", e)))??;
        debug!("Committed PDF → {}", path.display());
        Ok(path)
    }

    pub async fn has_pdf(&self, manual_id: i64) -> bool {
        tokio::fs::try_exists(self.pdf_path(manual_id)).await.unwrap_or(false)
    }

    pub async fn put_page_raster(&self, manual_id: i64, page: u32, png: &[u8]) -> Result<(), IngestError> {
        write_atomic(&self.page_raster_path(manual_id, page), png).await
    }

    pub async fn get_page_raster(&self, manual_id: i64, page: u32) -> Result<Option<Vec<u8>>, IngestError> {
        read_optional(&self.page_raster_path(manual_id, page)).await
    }

    pub async fn put_crop(&self, image_id: i64, png: &[u8]) -> Result<(), IngestError> {
        write_atomic(&self.crop_path(image_id), png).await
    }

    pub async fn get_crop(&self, image_id: i64) -> Result<Option<Vec<u8>>, IngestError> {
        read_optional(&self.crop_path(image_id)).await
    }

    pub async fn has_crop(&self, image_id: i64) -> bool {
        tokio::fs::try_exists(self.crop_path(image_id)).await.unwrap_or(false)
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), IngestError> {
    let target = path.to_path_buf();
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || write_atomic_blocking(&target, &bytes))
        .await
        .map_err(|e| IngestError::Internal(format!("Artifact write task panicked: {}", e)))?
}

fn write_atomic_blocking(path: &Path, bytes: &[u8]) -> Result<(), IngestError> {
    let io_err = |source: std::io::Error| IngestError::ArtifactWrite {
        path: path.to_path_buf(),
        source,
    };

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(io_err)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;

    debug!("Wrote {} bytes → {}", bytes.len(), path.display());
    Ok(())
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, IngestError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(IngestError::Internal(format!(
            "Failed to read '{}': {}",
            path.display(),
            e
        ))),
    }
}
