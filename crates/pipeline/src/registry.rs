//! Stage-name → handler mapping, built once at worker start-up.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::errors::RegistryError;
use crate::ports::StageHandler;
use crate::StageName;

/// Handlers keyed by the stage name carried in envelopes.
///
/// Populated during start-up, then shared read-only (typically behind an
/// `Arc`) by the control loop.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<StageName, Arc<dyn StageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `stage`. A stage can only be registered once.
    pub fn register(
        &mut self,
        stage: StageName,
        handler: Arc<dyn StageHandler>,
    ) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&stage) {
            return Err(RegistryError::DuplicateStage(stage));
        }
        self.handlers.insert(stage, handler);
        Ok(())
    }

    /// Returns the handler for `stage`, if one is registered.
    pub fn resolve(&self, stage: &str) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(stage).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut stages: Vec<&str> = self.handlers.keys().map(StageName::as_str).collect();
        stages.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("stages", &stages)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StageError;
    use crate::ports::StageOutput;
    use crate::{ResourceLocator, TaskId};
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl StageHandler for Echo {
        async fn handle(
            &self,
            _task_id: &TaskId,
            locator: &ResourceLocator,
        ) -> Result<StageOutput, StageError> {
            Ok(StageOutput {
                payload: Vec::new(),
                locator: locator.clone(),
            })
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        let stage = StageName::new("parser").unwrap();
        registry.register(stage.clone(), Arc::new(Echo)).unwrap();

        let error = registry.register(stage.clone(), Arc::new(Echo)).unwrap_err();
        assert_eq!(error, RegistryError::DuplicateStage(stage));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_stage_resolves_to_none() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(StageName::new("parser").unwrap(), Arc::new(Echo))
            .unwrap();
        assert!(registry.resolve("parser").is_some());
        assert!(registry.resolve("chunker").is_none());
    }
}
