//! Document sources queried by the crawler stage.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

/// A crawled document: a flat JSON object such as
/// `{"title": .., "authors": [..], "summary": .., "content": ..}`.
pub type Document = Map<String, Value>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read corpus {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corpus is not a JSON array of objects: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// External search backend, addressed by locators `web://<name>?query=..&limit=..`.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Host name locators use for this source.
    fn name(&self) -> &str;

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Document>, SourceError>;
}

/// Fixed set of documents searched by case-insensitive substring match.
#[derive(Debug, Clone)]
pub struct CorpusSource {
    name: String,
    documents: Vec<Document>,
}

impl CorpusSource {
    pub fn new(name: impl Into<String>, documents: Vec<Document>) -> Self {
        Self {
            name: name.into(),
            documents,
        }
    }

    /// Loads a JSON array of document objects.
    pub async fn from_file(name: impl Into<String>, path: &Path) -> Result<Self, SourceError> {
        let raw = tokio::fs::read(path).await.map_err(|source| SourceError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let documents: Vec<Document> = serde_json::from_slice(&raw)?;
        Ok(Self::new(name, documents))
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

fn mentions(document: &Document, needle: &str) -> bool {
    document.values().any(|value| match value {
        Value::String(s) => s.to_lowercase().contains(needle),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .any(|s| s.to_lowercase().contains(needle)),
        _ => false,
    })
}

#[async_trait]
impl DocumentSource for CorpusSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Document>, SourceError> {
        let needle = query.replace('+', " ").trim().to_lowercase();
        Ok(self
            .documents
            .iter()
            .filter(|document| needle.is_empty() || mentions(document, &needle))
            .take(limit)
            .cloned()
            .collect())
    }
}
