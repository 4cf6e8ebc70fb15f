use std::collections::BTreeMap;

use async_trait::async_trait;
use pipeline::{
    ChunkNode, EntityNode, GraphDocument, ResourceLocator, StageError, StageHandler, StageOutput,
    TaskId,
};

use crate::context::StageContext;

const DATE: Label = ("DATE", "Absolute or relative dates or periods");
const ORG: Label = ("ORG", "Companies, agencies, institutions, etc.");
const NAME: Label = ("NAME", "Capitalized names of people, places or things");

/// Words that are capitalized only because they open a sentence or a field.
const STOPWORDS: [&str; 14] = [
    "A", "An", "The", "This", "That", "These", "We", "Our", "In", "On", "Of", "For", "It", "And",
];

/// Entity type and its description.
type Label = (&'static str, &'static str);

/// Records the pending run of capitalized words, minus leading stopwords.
fn flush(run: &mut Vec<&str>, found: &mut BTreeMap<String, Label>) {
    while run.first().is_some_and(|w| STOPWORDS.contains(w)) {
        run.remove(0);
    }
    if !run.is_empty() {
        found.entry(run.join(" ")).or_insert(NAME);
    }
    run.clear();
}

fn clean(word: &str) -> &str {
    word.trim_matches(|c: char| !c.is_alphanumeric())
}

fn is_year(word: &str) -> bool {
    word.len() == 4
        && word.chars().all(|c| c.is_ascii_digit())
        && matches!(word.as_bytes()[0], b'1' | b'2')
}

fn is_acronym(word: &str) -> bool {
    word.chars().count() >= 2
        && word.chars().any(|c| c.is_ascii_uppercase())
        && word
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

fn is_capitalized(word: &str) -> bool {
    let mut chars = word.chars();
    matches!(chars.next(), Some(c) if c.is_uppercase()) && chars.any(|c| c.is_lowercase())
}

/// Heuristic entity recognition: years, acronyms, and runs of capitalized
/// words. A header such as `Title:` at the start of the text is skipped.
pub fn extract_entities(chunk_id: &str, text: &str) -> Vec<EntityNode> {
    let body = match text.split_once(": ") {
        Some((header, rest)) if !header.contains(' ') => rest,
        _ => text,
    };

    let mut found: BTreeMap<String, Label> = BTreeMap::new();
    let mut run: Vec<&str> = Vec::new();
    for raw in body.split_whitespace() {
        let word = clean(raw);
        if word.is_empty() {
            flush(&mut run, &mut found);
            continue;
        }
        if is_year(word) {
            flush(&mut run, &mut found);
            found.insert(word.to_string(), DATE);
        } else if is_acronym(word) {
            flush(&mut run, &mut found);
            found.insert(word.to_string(), ORG);
        } else if is_capitalized(word) {
            run.push(word);
        } else {
            flush(&mut run, &mut found);
        }
        // Punctuation after a word ends the run.
        if raw.ends_with([',', '.', ';', ':', '!', '?', ')']) {
            flush(&mut run, &mut found);
        }
    }
    flush(&mut run, &mut found);

    found
        .into_iter()
        .map(|(name, (entity_type, description))| EntityNode {
            chunk_id: chunk_id.to_string(),
            name,
            entity_type: entity_type.to_string(),
            description: description.to_string(),
        })
        .collect()
}

/// Reads `{"<chunk id>": "<text>"}` and emits a [`GraphDocument`].
pub struct ExtractorHandler {
    context: StageContext,
}

impl ExtractorHandler {
    pub fn new(context: StageContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl StageHandler for ExtractorHandler {
    async fn handle(
        &self,
        task_id: &TaskId,
        locator: &ResourceLocator,
    ) -> Result<StageOutput, StageError> {
        let raw = self.context.read_input(locator).await?;
        let chunks: BTreeMap<String, String> = serde_json::from_slice(&raw).map_err(|e| {
            StageError::handler(&self.context.stage, format!("invalid JSON format: {e}"))
        })?;
        if chunks.is_empty() {
            return Err(StageError::handler(
                &self.context.stage,
                format!("no documents found in resource: {locator}"),
            ));
        }

        let mut document = GraphDocument::default();
        for (id, text) in chunks {
            let text = text.trim();
            if !text.is_empty() {
                document.entities.extend(extract_entities(&id, text));
            }
            document.chunks.push(ChunkNode {
                id,
                text: text.to_string(),
            });
        }

        let payload = serde_json::to_vec(&document)
            .map_err(|e| StageError::handler(&self.context.stage, e))?;
        Ok(StageOutput {
            payload,
            locator: self.context.output_locator(task_id, locator)?,
        })
    }
}
