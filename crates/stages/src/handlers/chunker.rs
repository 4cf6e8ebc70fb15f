use async_trait::async_trait;
use pipeline::{ResourceLocator, StageError, StageHandler, StageOutput, TaskId};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::context::StageContext;

/// Splits `text` into trimmed sentences ending at `.`, `!` or `?` followed by
/// whitespace. Trailing text without a terminator is its own sentence.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        let at_boundary = matches!(c, '.' | '!' | '?')
            && chars.peek().map_or(true, |next| next.is_whitespace());
        if at_boundary || c == '\n' {
            let sentence = current.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            current.clear();
        }
    }
    let rest = current.trim();
    if !rest.is_empty() {
        sentences.push(rest.to_string());
    }
    sentences
}

/// Splits parsed text into sentence chunks, emitting `{"<uuid>": "<sentence>", ...}`.
pub struct ChunkerHandler {
    context: StageContext,
    separator: String,
}

impl ChunkerHandler {
    pub fn new(context: StageContext, separator: impl Into<String>) -> Self {
        Self {
            context,
            separator: separator.into(),
        }
    }
}

#[async_trait]
impl StageHandler for ChunkerHandler {
    async fn handle(
        &self,
        task_id: &TaskId,
        locator: &ResourceLocator,
    ) -> Result<StageOutput, StageError> {
        let raw = self.context.read_input(locator).await?;
        let text = self.context.text(raw)?;

        let mut chunks = Map::new();
        for block in text.split(self.separator.as_str()) {
            for sentence in split_sentences(block) {
                chunks.insert(Uuid::new_v4().to_string(), Value::String(sentence));
            }
        }
        if chunks.is_empty() {
            return Err(StageError::handler(
                &self.context.stage,
                format!("no documents found in resource: {locator}"),
            ));
        }

        let payload = serde_json::to_vec(&chunks)
            .map_err(|e| StageError::handler(&self.context.stage, e))?;
        Ok(StageOutput {
            payload,
            locator: self.context.output_locator(task_id, locator)?,
        })
    }
}
