//! Handler registry for entity-type dispatch
//!
//! Maps the `entity_type` string on a queue entry to the handler that knows
//! how to synchronize it.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::definition::{EntityHandler, HandlerError, SyncOutcome};
use crate::persistence::OperationType;

/// Adapter that turns an async closure into an [`EntityHandler`]
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EntityHandler for FnHandler<F>
where
    F: Fn(serde_json::Value, OperationType) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<SyncOutcome, HandlerError>> + Send + 'static,
{
    async fn sync(
        &self,
        payload: &serde_json::Value,
        operation: OperationType,
    ) -> Result<SyncOutcome, HandlerError> {
        (self.f)(payload.clone(), operation).await
    }
}

/// Registry of entity handlers
///
/// Built once at startup and shared read-only between workers.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EntityHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an entity type, replacing any previous one
    pub fn register(&mut self, entity_type: impl Into<String>, handler: Arc<dyn EntityHandler>) {
        self.handlers.insert(entity_type.into(), handler);
    }

    /// Register an async closure as the handler for an entity type
    pub fn register_fn<F, Fut>(&mut self, entity_type: impl Into<String>, f: F)
    where
        F: Fn(serde_json::Value, OperationType) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<SyncOutcome, HandlerError>> + Send + 'static,
    {
        self.register(entity_type, Arc::new(FnHandler { f }));
    }

    /// Builder-style registration
    pub fn with_handler(
        mut self,
        entity_type: impl Into<String>,
        handler: Arc<dyn EntityHandler>,
    ) -> Self {
        self.register(entity_type, handler);
        self
    }

    /// Look up the handler for an entity type
    pub fn get(&self, entity_type: &str) -> Option<Arc<dyn EntityHandler>> {
        self.handlers.get(entity_type).cloned()
    }

    /// Check if an entity type has a handler
    pub fn contains(&self, entity_type: &str) -> bool {
        self.handlers.contains_key(entity_type)
    }

    /// Registered entity types, sorted
    pub fn entity_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
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
        f.debug_struct("HandlerRegistry")
            .field("entity_types", &self.entity_types())
            .finish()
    }
}
