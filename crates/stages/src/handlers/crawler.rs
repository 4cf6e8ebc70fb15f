use std::sync::Arc;

use async_trait::async_trait;
use pipeline::{ResourceLocator, StageError, StageHandler, StageOutput, TaskId};
use serde_json::json;
use tracing::info;

use crate::context::StageContext;
use crate::source::DocumentSource;

/// Scheme of locators that address an external document source.
pub const WEB_SCHEME: &str = "web";

/// Parses a `limit` query value; anything but a positive integer is 1.
fn parse_limit(raw: Option<&str>) -> usize {
    raw.and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|limit| *limit > 0)
        .unwrap_or(1)
}

/// Queries a [`DocumentSource`] and emits `{"docs": [...]}`.
pub struct CrawlerHandler {
    context: StageContext,
    source: Arc<dyn DocumentSource>,
}

impl CrawlerHandler {
    pub fn new(context: StageContext, source: Arc<dyn DocumentSource>) -> Self {
        Self { context, source }
    }
}

#[async_trait]
impl StageHandler for CrawlerHandler {
    async fn handle(
        &self,
        task_id: &TaskId,
        locator: &ResourceLocator,
    ) -> Result<StageOutput, StageError> {
        if !locator.is_from(WEB_SCHEME, self.source.name()) {
            return Err(StageError::resource_invalid(
                locator,
                format!(
                    "unsupported resource scheme and host: {}, {}",
                    locator.scheme(),
                    locator.host()
                ),
            ));
        }
        let query = locator
            .query_value("query")
            .ok_or_else(|| StageError::resource_invalid(locator, "query parameter is required"))?;
        let limit = parse_limit(locator.query_value("limit"));

        let docs = self
            .source
            .search(query, limit)
            .await
            .map_err(|e| StageError::handler(&self.context.stage, e))?;
        info!(task_id = %task_id, query, limit, found = docs.len(), "Crawled documents");

        let payload = serde_json::to_vec(&json!({ "docs": docs }))
            .map_err(|e| StageError::handler(&self.context.stage, e))?;
        Ok(StageOutput {
            payload,
            locator: self.context.output_locator(task_id, locator)?,
        })
    }
}
