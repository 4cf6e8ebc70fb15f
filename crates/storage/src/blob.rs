use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use pipeline::{BlobStore, InfrastructureError};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Rejects names that would escape their bucket on a filesystem.
fn check_name(kind: &str, name: &str) -> Result<(), InfrastructureError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(InfrastructureError::BlobStore(format!(
            "invalid {kind} name '{name}'"
        )));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, bucket: &str, object: &str) -> Result<Option<Vec<u8>>, InfrastructureError> {
        Ok(self
            .objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(bucket.to_string(), object.to_string()))
            .cloned())
    }

    async fn put(&self, bucket: &str, object: &str, data: Vec<u8>) -> Result<(), InfrastructureError> {
        check_name("bucket", bucket)?;
        check_name("object", object)?;
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((bucket.to_string(), object.to_string()), data);
        Ok(())
    }
}

/// Stores each object as a file under `<root>/<bucket>/<object>`.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, bucket: &str, object: &str) -> Result<PathBuf, InfrastructureError> {
        check_name("bucket", bucket)?;
        check_name("object", object)?;
        Ok(self.root.join(bucket).join(object))
    }
}

fn io_error(action: &str, path: &Path, error: io::Error) -> InfrastructureError {
    InfrastructureError::BlobStore(format!("{action} {}: {error}", path.display()))
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, bucket: &str, object: &str) -> Result<Option<Vec<u8>>, InfrastructureError> {
        let path = self.path(bucket, object)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read", &path, e)),
        }
    }

    async fn put(&self, bucket: &str, object: &str, data: Vec<u8>) -> Result<(), InfrastructureError> {
        let path = self.path(bucket, object)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("create", parent, e))?;
        }

        let mut file = fs::File::create(&path)
            .await
            .map_err(|e| io_error("create", &path, e))?;
        file.write_all(&data)
            .await
            .map_err(|e| io_error("write", &path, e))?;
        file.flush().await.map_err(|e| io_error("flush", &path, e))?;

        debug!(bucket, object, bytes = data.len(), "Stored blob");
        Ok(())
    }
}
