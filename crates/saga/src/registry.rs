//! Saga definitions known to an orchestrator.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::definition::SagaDefinition;
use crate::error::ValidationError;

static GLOBAL: OnceLock<Arc<SagaRegistry>> = OnceLock::new();

/// Definitions by name.
///
/// Filled at startup and shared read-only afterwards: an orchestrator takes
/// the registry by value, so nothing can register once it is running.
#[derive(Debug, Clone, Default)]
pub struct SagaRegistry {
    definitions: HashMap<String, Arc<SagaDefinition>>,
}

impl SagaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a definition. Names must be unique.
    pub fn register(&mut self, definition: SagaDefinition) -> Result<(), ValidationError> {
        let name = definition.name().to_string();
        if self.definitions.contains_key(&name) {
            return Err(ValidationError::DuplicateDefinition(name));
        }
        self.definitions.insert(name, Arc::new(definition));
        Ok(())
    }

    /// Builder-style [`SagaRegistry::register`].
    pub fn with(mut self, definition: SagaDefinition) -> Result<Self, ValidationError> {
        self.register(definition)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<Arc<SagaDefinition>> {
        self.definitions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    /// Registered definition names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.definitions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Installs the registry process-wide. Fails if one is already installed.
    pub fn install_global(self) -> Result<Arc<SagaRegistry>, SagaRegistry> {
        let registry = Arc::new(self);
        match GLOBAL.set(registry.clone()) {
            Ok(()) => Ok(registry),
            Err(rejected) => Err(Arc::unwrap_or_clone(rejected)),
        }
    }

    /// The process-wide registry, if one was installed.
    pub fn global() -> Option<Arc<SagaRegistry>> {
        GLOBAL.get().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StepError;
    use crate::step::{SagaStep, StepContext, StepOutput};
    use async_trait::async_trait;
    use common::SagaContext;

    struct Noop;

    #[async_trait]
    impl SagaStep for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        async fn forward(
            &self,
            _ctx: &StepContext,
            _data: &SagaContext,
        ) -> Result<StepOutput, StepError> {
            Ok(StepOutput::empty())
        }

        async fn compensate(
            &self,
            _ctx: &StepContext,
            _data: &SagaContext,
        ) -> Result<(), StepError> {
            Ok(())
        }
    }

    fn definition(name: &str) -> SagaDefinition {
        SagaDefinition::builder(name).step(Noop).build().unwrap()
    }

    #[test]
    fn register_and_lookup() {
        let registry = SagaRegistry::new()
            .with(definition("B"))
            .unwrap()
            .with(definition("A"))
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), ["A", "B"]);
        assert_eq!(registry.get("A").unwrap().name(), "A");
        assert!(registry.get("C").is_none());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = SagaRegistry::new();
        registry.register(definition("A")).unwrap();
        assert_eq!(
            registry.register(definition("A")),
            Err(ValidationError::DuplicateDefinition("A".into()))
        );
    }

    #[test]
    fn global_install_happens_once() {
        let installed = SagaRegistry::new()
            .with(definition("Global"))
            .unwrap()
            .install_global()
            .unwrap();
        assert!(installed.contains("Global"));
        assert!(SagaRegistry::global().unwrap().contains("Global"));

        let rejected = SagaRegistry::new().install_global().unwrap_err();
        assert!(rejected.is_empty());
    }
}
