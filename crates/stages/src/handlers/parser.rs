use async_trait::async_trait;
use pipeline::{ResourceLocator, StageError, StageHandler, StageOutput, TaskId};
use serde::Deserialize;
use serde_json::Value;

use crate::context::StageContext;
use crate::source::Document;

/// Separator used when a stage sets no `separator` argument.
pub const DEFAULT_SEPARATOR: &str = "\n\n";

/// Fields rendered, in this order, for every document.
const HEADERS: [&str; 6] = ["content", "title", "authors", "summary", "published", "url"];

#[derive(Deserialize)]
struct Crawled {
    #[serde(default)]
    docs: Vec<Document>,
}

fn render_value(value: &Value) -> Option<String> {
    let rendered = match value {
        Value::Null => return None,
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    };
    (!rendered.is_empty()).then_some(rendered)
}

fn capitalize(header: &str) -> String {
    let mut chars = header.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Renders one document as `Header: value` lines.
pub fn format_document(document: &Document) -> String {
    let mut text = String::new();
    for header in HEADERS {
        if let Some(value) = document.get(header).and_then(render_value) {
            text.push_str(&format!("{}: {}\n", capitalize(header), value));
        }
    }
    text.trim().to_string()
}

/// Turns crawled `{"docs": [...]}` into text blocks joined by `separator`.
pub struct ParserHandler {
    context: StageContext,
    separator: String,
}

impl ParserHandler {
    pub fn new(context: StageContext, separator: impl Into<String>) -> Self {
        Self {
            context,
            separator: separator.into(),
        }
    }
}

#[async_trait]
impl StageHandler for ParserHandler {
    async fn handle(
        &self,
        task_id: &TaskId,
        locator: &ResourceLocator,
    ) -> Result<StageOutput, StageError> {
        let raw = self.context.read_input(locator).await?;
        let crawled: Crawled = serde_json::from_slice(&raw)
            .map_err(|e| StageError::handler(&self.context.stage, format!("invalid JSON format: {e}")))?;
        if crawled.docs.is_empty() {
            return Err(StageError::handler(
                &self.context.stage,
                format!("no documents found in resource: {locator}"),
            ));
        }

        let blocks: Vec<String> = crawled.docs.iter().map(format_document).collect();
        Ok(StageOutput {
            payload: blocks.join(&self.separator).into_bytes(),
            locator: self.context.output_locator(task_id, locator)?,
        })
    }
}
