//! Core domain for the indexing pipeline.
//!
//! This crate contains the values exchanged between pipeline stages, the
//! static pipeline definition, task status records and their projection, the
//! handler registry, and the port traits the rest of the workspace implements.
//! Infrastructure crates implement the traits defined here; they never add
//! domain rules.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no I/O dependencies.
//! It defines *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`TaskId`, `StageName`, `RoutingKey`, ...) |
//! | [`locator`] | `ResourceLocator` and its textual form |
//! | [`envelope`] | `TaskEnvelope` bus message |
//! | [`definition`] | `PipelineDefinition`, `StageInfo`, validation |
//! | [`status`] | Status records, progress projection, `StatusPoller` |
//! | [`registry`] | `HandlerRegistry` |
//! | [`ports`] | Capability traits (`StageHandler`, `BlobStore`, ...) |
//! | [`types`] | `Timestamp` and the graph payload types |
//! | [`errors`] | Error taxonomy and `FailureKind` |

pub mod definition;
pub mod envelope;
pub mod errors;
pub mod identifiers;
pub mod locator;
pub mod ports;
pub mod registry;
pub mod status;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use definition::{DefinitionSpec, PipelineDefinition, StageInfo, StageRoute};
pub use envelope::{Metadata, TaskEnvelope};
pub use errors::{
    DefinitionError, EnvelopeError, FailureKind, InfrastructureError, LocatorError,
    RegistryError, StageError,
};
pub use identifiers::{
    ExchangeName, HandlerId, QueueName, RoutingKey, StageName, TaskId, TERMINAL_STAGE,
};
pub use locator::{LocatorTarget, ResourceLocator};
pub use ports::{
    BlobStore, DeliveryHandler, Disposition, GraphStore, MessagePublisher, StageHandler,
    StageOutput, TaskStatusStore,
};
pub use registry::HandlerRegistry;
pub use status::{
    project, StageProgress, StageStatus, StatusPoller, TaskCreate, TaskProgressReport,
    TaskStatus, TaskStatusRecord, TaskUpdate,
};
pub use types::{ChunkNode, EntityNode, GraphDocument, Timestamp};
