//! What every built-in handler knows about its own stage.

use std::sync::Arc;

use pipeline::{BlobStore, ResourceLocator, StageError, StageInfo, StageName, TaskId};

/// Scheme of locators that address the blob store.
pub const DEFAULT_BLOB_SCHEME: &str = "minio";

#[derive(Clone)]
pub struct StageContext {
    pub stage: StageName,
    pub bucket_name: String,
    pub object_name: String,
    pub blob_scheme: String,
    pub blobs: Arc<dyn BlobStore>,
}

impl StageContext {
    pub fn new(
        stage: StageName,
        info: &StageInfo,
        blob_scheme: impl Into<String>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            stage,
            bucket_name: info.bucket_name.clone(),
            object_name: info.object_name.clone(),
            blob_scheme: blob_scheme.into(),
            blobs,
        }
    }

    /// Blob locator of this stage's output for `task_id`, keeping the
    /// input's host: `{scheme}://{host}/{bucket}/{task_id}_{object}`.
    pub fn output_locator(
        &self,
        task_id: &TaskId,
        input: &ResourceLocator,
    ) -> Result<ResourceLocator, StageError> {
        ResourceLocator::blob(
            self.blob_scheme.as_str(),
            input.host(),
            self.bucket_name.as_str(),
            format!("{}_{}", task_id, self.object_name),
        )
        .map_err(|e| StageError::handler(&self.stage, format!("cannot build output locator: {e}")))
    }

    /// Loads the upstream object a blob locator points at.
    ///
    /// A foreign scheme or a non `bucket/object` path is a resource error; a
    /// missing object is a handler error.
    pub async fn read_input(&self, locator: &ResourceLocator) -> Result<Vec<u8>, StageError> {
        if locator.scheme() != self.blob_scheme {
            return Err(StageError::resource_invalid(
                locator,
                format!(
                    "unsupported scheme '{}', expected '{}'",
                    locator.scheme(),
                    self.blob_scheme
                ),
            ));
        }
        let (bucket, object) = locator
            .bucket_object()
            .map_err(|e| StageError::resource_invalid(locator, e))?;

        self.blobs
            .get(bucket, object)
            .await?
            .ok_or_else(|| StageError::handler(&self.stage, format!("resource not found: {locator}")))
    }

    /// Decodes upstream bytes as UTF-8 text.
    pub fn text(&self, bytes: Vec<u8>) -> Result<String, StageError> {
        String::from_utf8(bytes)
            .map_err(|e| StageError::handler(&self.stage, format!("input is not UTF-8: {e}")))
    }
}
