//! Orchestration for the indexing pipeline.
//!
//! Wires the port traits of the [`pipeline`] crate into the three roles a
//! process can play:
//!
//! - **worker**: [`Processor`] consumes the backlog queue, runs the stage
//!   handler named by each envelope, stores its output, publishes the next
//!   envelope and records progress;
//! - **builder**: [`BuilderProcessor`] consumes the builder queue and
//!   materialises the extracted graph through [`GraphBuilder`];
//! - **entry**: [`TaskSubmitter`] creates a task and publishes its first
//!   envelope.
//!
//! Stage behaviour comes from the built-in [`handlers`], selected per stage by
//! the static table in [`build_registry`].
//!
//! ## Architectural Layer
//!
//! **Orchestration.** Sequences calls between the domain types and the
//! infrastructure traits; adds no storage or transport code of its own.

mod builder;
mod context;
pub mod handlers;
mod processor;
mod source;
mod submit;
mod table;

#[cfg(test)]
mod test_support;

pub use builder::{BuildError, BuildReport, BuilderProcessor, GraphBuilder};
pub use context::{StageContext, DEFAULT_BLOB_SCHEME};
pub use processor::{ProcessError, ProcessingState, Processor};
pub use source::{CorpusSource, Document, DocumentSource, SourceError};
pub use submit::TaskSubmitter;
pub use table::{build_registry, HandlerDeps, HandlerKind, SetupError};
