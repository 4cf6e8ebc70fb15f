//! The task envelope exchanged over the message bus.

use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::EnvelopeError;
use crate::{ResourceLocator, StageName, TaskId};

/// Free-form metadata carried unchanged from stage to stage.
pub type Metadata = Map<String, Value>;

/// One hand-off between stages: which task, which stage should run next, and
/// where that stage finds its input.
///
/// `resource_locator` is `None` only on malformed traffic; every producer in
/// this workspace sets it, and a worker treats its absence as a terminal
/// per-message failure.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEnvelope {
    pub task_id: TaskId,
    pub stage_name: StageName,
    pub resource_locator: Option<ResourceLocator>,
    pub metadata: Metadata,
}

/// Flat wire record. Field aliases accept the names used by older producers.
#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(alias = "id")]
    task_id: TaskId,
    #[serde(alias = "task_name")]
    stage_name: StageName,
    #[serde(
        default,
        alias = "resource_url",
        skip_serializing_if = "Option::is_none"
    )]
    resource_locator: Option<String>,
    #[serde(default)]
    metadata: Metadata,
}

impl TaskEnvelope {
    /// Creates an envelope with empty metadata.
    pub fn new(task_id: TaskId, stage_name: StageName, locator: ResourceLocator) -> Self {
        Self {
            task_id,
            stage_name,
            resource_locator: Some(locator),
            metadata: Metadata::new(),
        }
    }

    /// Replaces the metadata bag.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Builds the envelope for the following stage: same task and metadata,
    /// new stage name and locator.
    pub fn forward(&self, stage_name: StageName, locator: ResourceLocator) -> Self {
        Self {
            task_id: self.task_id.clone(),
            stage_name,
            resource_locator: Some(locator),
            metadata: self.metadata.clone(),
        }
    }

    /// Decodes a bus message body.
    pub fn decode(body: &[u8]) -> Result<Self, EnvelopeError> {
        let wire: WireEnvelope = serde_json::from_slice(body)?;
        if wire.task_id.as_str().is_empty() || wire.stage_name.as_str().is_empty() {
            return Err(EnvelopeError::Malformed(serde_json::Error::custom(
                "task_id and stage_name must not be empty",
            )));
        }
        let resource_locator = match wire.resource_locator {
            None => None,
            Some(raw) => match raw.parse::<ResourceLocator>() {
                Ok(locator) => Some(locator),
                Err(source) => {
                    return Err(EnvelopeError::InvalidLocator {
                        task_id: wire.task_id,
                        stage: wire.stage_name,
                        raw,
                        source,
                    })
                }
            },
        };
        Ok(Self {
            task_id: wire.task_id,
            stage_name: wire.stage_name,
            resource_locator,
            metadata: wire.metadata,
        })
    }

    /// Encodes this envelope as a bus message body.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&WireEnvelope {
            task_id: self.task_id.clone(),
            stage_name: self.stage_name.clone(),
            resource_locator: self.resource_locator.as_ref().map(ToString::to_string),
            metadata: self.metadata.clone(),
        })
    }
}
