//! Static pipeline configuration.
//!
//! A [`PipelineDefinition`] is loaded once per process (from the control
//! endpoint or a file) and shared read-only by the control loop, the
//! registry builder and the status projector. It can only be obtained through
//! validation, so every holder may rely on its invariants:
//!
//! - exactly one stage is marked first;
//! - following `next_stage_name` from the first stage visits every stage
//!   exactly once and ends on a stage marked last;
//! - no stage is named after the terminal marker.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::DefinitionError;
use crate::{ExchangeName, HandlerId, QueueName, RoutingKey, StageName};

/// Configuration of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInfo {
    /// Which built-in handler runs this stage.
    #[serde(alias = "handler_id")]
    pub handler: HandlerId,

    /// Stage that consumes this stage's output. Ignored on the last stage.
    #[serde(
        default,
        alias = "next_task_name",
        skip_serializing_if = "Option::is_none"
    )]
    pub next_stage_name: Option<StageName>,

    #[serde(default, alias = "first")]
    pub is_first: bool,

    #[serde(default, alias = "last")]
    pub is_last: bool,

    /// Routing key this stage's output is published under.
    pub routing_key: RoutingKey,

    /// Bucket the stage's output is written to.
    pub bucket_name: String,

    /// Object-name suffix; the stored key is `{task_id}_{object_name}`.
    pub object_name: String,

    /// Handler-specific arguments.
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl StageInfo {
    /// Blob object key for this stage's output of `task_id`.
    pub fn object_key(&self, task_id: &crate::TaskId) -> String {
        format!("{}_{}", task_id, self.object_name)
    }

    /// Reads a string argument.
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }
}

/// Unvalidated wire form of a pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionSpec {
    #[serde(alias = "pipeline")]
    pub stages: BTreeMap<StageName, StageInfo>,
    pub exchange_name: ExchangeName,
    pub backlog_queue_name: QueueName,
    pub builder_queue_name: QueueName,
}

/// Where a stage's output envelope is routed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageRoute {
    pub exchange: ExchangeName,
    pub routing_key: RoutingKey,
    pub queue: QueueName,
}

/// A validated pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DefinitionSpec", into = "DefinitionSpec")]
pub struct PipelineDefinition {
    spec: DefinitionSpec,
    order: Vec<StageName>,
}

impl TryFrom<DefinitionSpec> for PipelineDefinition {
    type Error = DefinitionError;

    fn try_from(spec: DefinitionSpec) -> Result<Self, Self::Error> {
        let order = validate(&spec)?;
        Ok(Self { spec, order })
    }
}

impl From<PipelineDefinition> for DefinitionSpec {
    fn from(definition: PipelineDefinition) -> Self {
        definition.spec
    }
}

impl PipelineDefinition {
    /// Validates `spec` and computes the stage order.
    pub fn new(spec: DefinitionSpec) -> Result<Self, DefinitionError> {
        Self::try_from(spec)
    }

    /// Looks up a stage by name.
    pub fn stage(&self, name: &str) -> Option<&StageInfo> {
        self.spec.stages.get(name)
    }

    /// The unique first stage.
    pub fn first_stage(&self) -> (&StageName, &StageInfo) {
        let name = &self.order[0];
        (name, &self.spec.stages[name])
    }

    /// Stage names in execution order (first to last).
    pub fn ordered_stages(&self) -> &[StageName] {
        &self.order
    }

    /// Iterates `(name, info)` in execution order.
    pub fn stages(&self) -> impl Iterator<Item = (&StageName, &StageInfo)> {
        self.order.iter().map(|name| (name, &self.spec.stages[name]))
    }

    /// Stage names in execution order followed by the terminal marker.
    pub fn progress_stages(&self) -> Vec<StageName> {
        let mut stages = self.order.clone();
        stages.push(StageName::terminal());
        stages
    }

    pub fn exchange_name(&self) -> &ExchangeName {
        &self.spec.exchange_name
    }

    pub fn backlog_queue_name(&self) -> &QueueName {
        &self.spec.backlog_queue_name
    }

    pub fn builder_queue_name(&self) -> &QueueName {
        &self.spec.builder_queue_name
    }

    /// Stage name carried by the envelope a stage publishes.
    pub fn next_stage_name(&self, info: &StageInfo) -> StageName {
        match (&info.next_stage_name, info.is_last) {
            (Some(next), false) => next.clone(),
            _ => StageName::terminal(),
        }
    }

    /// Route for a stage's output: last stages always go to the builder queue.
    pub fn route(&self, info: &StageInfo) -> StageRoute {
        let queue = if info.is_last {
            &self.spec.builder_queue_name
        } else {
            &self.spec.backlog_queue_name
        };
        StageRoute {
            exchange: self.spec.exchange_name.clone(),
            routing_key: info.routing_key.clone(),
            queue: queue.clone(),
        }
    }

    /// Distinct routes for every stage, in execution order.
    pub fn routes(&self) -> Vec<StageRoute> {
        let mut seen = HashSet::new();
        self.stages()
            .map(|(_, info)| self.route(info))
            .filter(|route| seen.insert(route.clone()))
            .collect()
    }
}

fn validate(spec: &DefinitionSpec) -> Result<Vec<StageName>, DefinitionError> {
    if spec.stages.is_empty() {
        return Err(DefinitionError::Empty);
    }
    for (field, value) in [
        ("exchange_name", spec.exchange_name.as_str()),
        ("backlog_queue_name", spec.backlog_queue_name.as_str()),
        ("builder_queue_name", spec.builder_queue_name.as_str()),
    ] {
        if value.is_empty() {
            return Err(DefinitionError::EmptyName { field });
        }
    }

    for (name, info) in &spec.stages {
        if name.is_terminal() {
            return Err(DefinitionError::ReservedName {
                stage: name.clone(),
            });
        }
        for (field, value) in [
            ("handler", info.handler.as_str()),
            ("routing_key", info.routing_key.as_str()),
            ("bucket_name", info.bucket_name.as_str()),
            ("object_name", info.object_name.as_str()),
        ] {
            if value.is_empty() {
                return Err(DefinitionError::EmptyField {
                    stage: name.clone(),
                    field,
                });
            }
        }
        if info.is_last {
            continue;
        }
        match &info.next_stage_name {
            None => {
                return Err(DefinitionError::MissingNextStage {
                    stage: name.clone(),
                })
            }
            Some(next) if !spec.stages.contains_key(next) => {
                return Err(DefinitionError::UnknownNextStage {
                    stage: name.clone(),
                    next: next.clone(),
                })
            }
            Some(_) => {}
        }
    }

    let firsts: Vec<&StageName> = spec
        .stages
        .iter()
        .filter(|(_, info)| info.is_first)
        .map(|(name, _)| name)
        .collect();
    let [first] = firsts.as_slice() else {
        return Err(DefinitionError::FirstStageCount {
            found: firsts.len(),
        });
    };

    let mut order = Vec::with_capacity(spec.stages.len());
    let mut visited = HashSet::new();
    let mut current = (*first).clone();
    loop {
        if !visited.insert(current.clone()) {
            return Err(DefinitionError::Cycle { stage: current });
        }
        let info = &spec.stages[&current];
        order.push(current.clone());
        match (&info.next_stage_name, info.is_last) {
            (Some(next), false) => current = next.clone(),
            _ => break,
        }
    }

    if let Some(orphan) = spec.stages.keys().find(|name| !visited.contains(*name)) {
        return Err(DefinitionError::Unreachable {
            stage: orphan.clone(),
        });
    }
    Ok(order)
}
