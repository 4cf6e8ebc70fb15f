//! Error taxonomy for the pipeline domain.
//!
//! Value-level errors ([`LocatorError`], [`EnvelopeError`], [`DefinitionError`],
//! [`RegistryError`]) are produced while constructing domain values.
//! [`StageError`] is the closed hierarchy a stage handler returns; the control
//! loop matches on it (via [`StageError::kind`]) instead of inspecting error
//! text. [`InfrastructureError`] is what every port implementation returns.

use std::fmt;

use thiserror::Error;

use crate::{StageName, TaskId};

// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

/// How a failed delivery is classified in logs.
///
/// Every kind ends in the message being rejected without requeue; kinds other
/// than [`FailureKind::Decode`] are attributable to a task and mark it `FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The message body could not be decoded into an envelope.
    Decode,
    /// The envelope is structurally valid but cannot be processed (no
    /// locator, no handler for the stage).
    Validation,
    /// The locator does not match what the stage expects.
    ResourceInvalid,
    /// The stage rejected the payload content.
    Handler,
    /// The bus, blob store, status store or graph store failed.
    Infrastructure,
}

impl FailureKind {
    /// Stable identifier used as a structured log field.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::Validation => "validation",
            Self::ResourceInvalid => "resource_invalid",
            Self::Handler => "handler",
            Self::Infrastructure => "infrastructure",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Value construction errors
// ---------------------------------------------------------------------------

/// A resource locator could not be parsed or constructed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocatorError {
    /// No `://` between scheme and the rest.
    #[error("locator '{0}' has no '://' scheme separator")]
    MissingScheme(String),

    /// Scheme is empty or has characters outside ASCII alphanumerics and `+-.`.
    #[error("invalid locator scheme '{0}'")]
    InvalidScheme(String),

    /// Host is empty or contains `/`, `?`, `&` or `=`.
    #[error("invalid locator host '{0}'")]
    InvalidHost(String),

    /// A path segment is empty or contains `/` or `?`.
    #[error("invalid locator path segment '{0}'")]
    InvalidSegment(String),

    /// A query pair lacks `=`, has an empty key, or embeds a separator.
    #[error("invalid locator query pair '{0}'")]
    InvalidQueryPair(String),

    /// A query locator was built without any pairs.
    #[error("locator query has no pairs")]
    EmptyQuery,

    /// Blob addresses need exactly `bucket/object`.
    #[error("expected a bucket/object path, found {segments} segment(s)")]
    NotBlobAddress { segments: usize },
}

/// A bus message could not be turned into a [`crate::TaskEnvelope`].
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The body is not a well-formed envelope; the task cannot be identified.
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The envelope names a task and stage but carries an unparsable locator.
    ///
    /// Unlike [`EnvelopeError::Malformed`] this failure is attributable.
    #[error("task '{task_id}' at stage '{stage}' carries invalid locator '{raw}': {source}")]
    InvalidLocator {
        task_id: TaskId,
        stage: StageName,
        raw: String,
        #[source]
        source: LocatorError,
    },
}

/// The pipeline definition violates a structural invariant.
///
/// Produced at load time; a worker never starts with an invalid definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    /// The `stages` list is empty.
    #[error("pipeline has no stages")]
    Empty,

    /// The exchange, backlog queue or builder queue name is blank.
    #[error("pipeline '{field}' must not be empty")]
    EmptyName { field: &'static str },

    /// Zero or several stages are flagged `is_first`.
    #[error("pipeline must have exactly one first stage, found {found}")]
    FirstStageCount { found: usize },

    /// A non-terminal stage without `next_stage`.
    #[error("stage '{stage}' is not last but has no next stage")]
    MissingNextStage { stage: StageName },

    /// `next_stage` names a stage that is not defined.
    #[error("stage '{stage}' points at unknown next stage '{next}'")]
    UnknownNextStage { stage: StageName, next: StageName },

    /// Following `next_stage` links revisits a stage.
    #[error("stage '{stage}' is reached twice while walking the pipeline")]
    Cycle { stage: StageName },

    /// A defined stage the walk from the first stage never visits.
    #[error("stage '{stage}' is not reachable from the first stage")]
    Unreachable { stage: StageName },

    /// A user stage is named like the builder.
    #[error("stage name '{stage}' is reserved for the terminal builder")]
    ReservedName { stage: StageName },

    /// A stage's handler, routing key, bucket or object name is blank.
    #[error("stage '{stage}' has an empty '{field}'")]
    EmptyField {
        stage: StageName,
        field: &'static str,
    },
}

/// Registration into the handler registry failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("a handler for stage '{0}' is already registered")]
    DuplicateStage(StageName),
}

// ---------------------------------------------------------------------------
// Runtime errors
// ---------------------------------------------------------------------------

/// An external collaborator (bus, blob store, status store, graph store) failed.
///
/// The core never retries these; the message is rejected and recovery is
/// external.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InfrastructureError {
    /// Publish, declare or acknowledge failed on the bus.
    #[error("message bus failure: {0}")]
    Bus(String),

    /// Reading or writing a blob failed.
    #[error("blob store failure: {0}")]
    BlobStore(String),

    /// The status store rejected or could not serve a query.
    #[error("status store failure: {0}")]
    StatusStore(String),

    /// An update addressed a task that was never created.
    #[error("no status record exists for task '{0}'")]
    TaskNotFound(TaskId),

    /// Writing chunks, entities or relationships failed.
    #[error("graph store failure: {0}")]
    GraphStore(String),
}

/// Error returned by a stage handler or by the builder.
#[derive(Debug, Error)]
pub enum StageError {
    /// The locator's scheme, host or shape is not what the stage expects.
    #[error("resource '{locator}' is invalid: {reason}")]
    ResourceInvalid { locator: String, reason: String },

    /// Content-level failure: missing upstream object, malformed payload,
    /// unexpected item counts.
    #[error("stage '{stage}' failed: {message}")]
    Handler { stage: StageName, message: String },

    #[error(transparent)]
    Infrastructure(#[from] InfrastructureError),
}

impl StageError {
    /// Shorthand for [`StageError::ResourceInvalid`].
    pub fn resource_invalid(locator: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::ResourceInvalid {
            locator: locator.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for [`StageError::Handler`].
    pub fn handler(stage: &StageName, message: impl fmt::Display) -> Self {
        Self::Handler {
            stage: stage.clone(),
            message: message.to_string(),
        }
    }

    /// Classifies this error for logging.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::ResourceInvalid { .. } => FailureKind::ResourceInvalid,
            Self::Handler { .. } => FailureKind::Handler,
            Self::Infrastructure(_) => FailureKind::Infrastructure,
        }
    }
}
