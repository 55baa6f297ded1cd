// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Blob storage for uploaded file bytes.

use crate::error::AppError;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), AppError>;

    async fn read(&self, path: &str) -> Result<Vec<u8>, AppError>;

    /// Remove a blob. Missing blobs are not an error.
    async fn delete(&self, path: &str) -> Result<(), AppError>;
}

/// Blob path for an uploaded file.
pub fn blob_path(actor_id: &str, file_id: &str, extension: &str) -> String {
    format!("fitness/{}/{}.{}", actor_id, file_id, extension)
}

/// Blobs stored as files under a root directory.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, AppError> {
        let relative = Path::new(path);
        let is_plain = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if path.is_empty() || !is_plain {
            return Err(AppError::BadRequest(format!("Invalid blob path: {}", path)));
        }
        Ok(self.root.join(relative))
    }
}

fn io_error(e: std::io::Error) -> AppError {
    AppError::Internal(anyhow::anyhow!("blob storage: {}", e))
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), AppError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        tokio::fs::write(&full, bytes).await.map_err(io_error)
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, AppError> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AppError::NotFound(format!("Blob {}", path)))
            }
            Err(e) => Err(io_error(e)),
        }
    }

    async fn delete(&self, path: &str) -> Result<(), AppError> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(e)),
        }
    }
}
