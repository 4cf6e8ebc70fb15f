//! Storage backends for the pipeline's blob and graph ports.
//!
//! | Type | Port | Notes |
//! |------|------|-------|
//! | [`MemoryBlobStore`] | [`pipeline::BlobStore`] | Process-local, for tests and single-process runs |
//! | [`FsBlobStore`] | [`pipeline::BlobStore`] | Objects at `<root>/<bucket>/<object>` |
//! | [`MemoryGraphStore`] | [`pipeline::GraphStore`] | Merge semantics over chunk and entity nodes |

mod blob;
mod graph;

pub use blob::{FsBlobStore, MemoryBlobStore};
pub use graph::MemoryGraphStore;
