//! Static handler table: maps handler ids named in the pipeline definition
//! to the built-in implementations and fills a [`HandlerRegistry`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use pipeline::{
    BlobStore, HandlerId, HandlerRegistry, PipelineDefinition, RegistryError, StageHandler,
    StageName,
};
use thiserror::Error;
use tracing::info;

use crate::context::{StageContext, DEFAULT_BLOB_SCHEME};
use crate::handlers::{
    ChunkerHandler, CrawlerHandler, ExtractorHandler, ParserHandler, DEFAULT_SEPARATOR,
};
use crate::source::DocumentSource;

/// The closed set of built-in handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Crawler,
    Parser,
    Chunker,
    Extractor,
}

impl HandlerKind {
    pub const ALL: [HandlerKind; 4] = [
        HandlerKind::Crawler,
        HandlerKind::Parser,
        HandlerKind::Chunker,
        HandlerKind::Extractor,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Crawler => "crawler",
            Self::Parser => "parser",
            Self::Chunker => "chunker",
            Self::Extractor => "extractor",
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HandlerKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or(())
    }
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("stage '{stage}' names unknown handler '{handler}'")]
    UnknownHandler { stage: StageName, handler: HandlerId },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Shared resources handed to every handler.
#[derive(Clone)]
pub struct HandlerDeps {
    pub blobs: Arc<dyn BlobStore>,
    pub source: Arc<dyn DocumentSource>,
    pub blob_scheme: String,
}

impl HandlerDeps {
    pub fn new(blobs: Arc<dyn BlobStore>, source: Arc<dyn DocumentSource>) -> Self {
        Self {
            blobs,
            source,
            blob_scheme: DEFAULT_BLOB_SCHEME.to_string(),
        }
    }

    pub fn with_blob_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.blob_scheme = scheme.into();
        self
    }
}

/// Registers one handler per stage of `definition`.
///
/// Fails on the first stage whose handler id is not a built-in.
pub fn build_registry(
    definition: &PipelineDefinition,
    deps: &HandlerDeps,
) -> Result<HandlerRegistry, SetupError> {
    let mut registry = HandlerRegistry::new();
    for (stage, info) in definition.stages() {
        let kind: HandlerKind =
            info.handler
                .as_str()
                .parse()
                .map_err(|()| SetupError::UnknownHandler {
                    stage: stage.clone(),
                    handler: info.handler.clone(),
                })?;
        let context = StageContext::new(
            stage.clone(),
            info,
            deps.blob_scheme.as_str(),
            Arc::clone(&deps.blobs),
        );
        let separator = info.arg_str("separator").unwrap_or(DEFAULT_SEPARATOR);

        let handler: Arc<dyn StageHandler> = match kind {
            HandlerKind::Crawler => Arc::new(CrawlerHandler::new(context, Arc::clone(&deps.source))),
            HandlerKind::Parser => Arc::new(ParserHandler::new(context, separator)),
            HandlerKind::Chunker => Arc::new(ChunkerHandler::new(context, separator)),
            HandlerKind::Extractor => Arc::new(ExtractorHandler::new(context)),
        };
        registry.register(stage.clone(), handler)?;
        info!(stage = %stage, handler = %kind, "Registered stage handler");
    }
    Ok(registry)
}
