//! Registry

use crate::task::handler::TaskHandler;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Collects handlers before the processor starts
#[derive(Default)]
pub struct RegistryBuilder {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl RegistryBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `task_type`.
    ///
    /// A second registration under the same type is a configuration error.
    pub fn register<H>(mut self, task_type: impl Into<String>, handler: H) -> crate::Result<Self>
    where
        H: TaskHandler + 'static,
    {
        let task_type = task_type.into();
        if self.handlers.contains_key(&task_type) {
            return Err(crate::TaskQueueError::DuplicateHandler(task_type));
        }
        debug!("Registered handler for {}", task_type);
        self.handlers.insert(task_type, Arc::new(handler));
        Ok(self)
    }

    /// Freeze the registrations
    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: self.handlers,
        }
    }
}

/// Immutable mapping from task type to handler, shared by all workers
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Start building a registry
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Handler registered for `task_type`, if any
    pub fn resolve(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    /// Whether `task_type` has a handler
    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Registered task types, sorted
    pub fn task_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}
