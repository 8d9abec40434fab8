//! Aggregate type → handler routing.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::handler::AggregateHandler;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Two handlers claim the same aggregate type. Fatal at startup.
    #[error("a handler for aggregate type '{0}' is already registered")]
    DuplicateAggregateType(String),

    #[error("handler declares an empty aggregate type")]
    EmptyAggregateType,

    /// No handler matches; a deployment/config mismatch, never fixed by retrying.
    #[error("no handler registered for aggregate type '{0}'")]
    UnknownAggregateType(String),
}

/// Maps each aggregate type to exactly one handler.
///
/// Built once at startup and then shared read-only with the relay.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn AggregateHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn AggregateHandler>) -> Result<(), RegistryError> {
        let aggregate_type = handler.aggregate_type().to_string();
        if aggregate_type.trim().is_empty() {
            return Err(RegistryError::EmptyAggregateType);
        }
        if self.handlers.contains_key(&aggregate_type) {
            return Err(RegistryError::DuplicateAggregateType(aggregate_type));
        }

        tracing::info!(aggregate_type = %aggregate_type, "outbox handler registered");
        self.handlers.insert(aggregate_type, handler);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, handler: Arc<dyn AggregateHandler>) -> Result<Self, RegistryError> {
        self.register(handler)?;
        Ok(self)
    }

    pub fn resolve(&self, aggregate_type: &str) -> Result<Arc<dyn AggregateHandler>, RegistryError> {
        self.handlers
            .get(aggregate_type)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownAggregateType(aggregate_type.to_string()))
    }

    /// Registered aggregate types, sorted.
    pub fn aggregate_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
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

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("aggregate_types", &self.aggregate_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::HandlerError;

    struct Named(&'static str);

    #[async_trait]
    impl AggregateHandler for Named {
        fn aggregate_type(&self) -> &str {
            self.0
        }

        async fn handle(&self, _payload: &str) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn resolves_registered_handler() {
        let registry = HandlerRegistry::new()
            .with(Arc::new(Named("User")))
            .unwrap()
            .with(Arc::new(Named("Payment")))
            .unwrap();

        assert_eq!(registry.resolve("Payment").unwrap().aggregate_type(), "Payment");
        assert_eq!(registry.aggregate_types(), vec!["Payment", "User"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(Named("User"))).unwrap();

        let err = registry.register(Arc::new(Named("User"))).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateAggregateType("User".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_aggregate_type_is_reported() {
        let registry = HandlerRegistry::new();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.resolve("Auction"),
            Err(RegistryError::UnknownAggregateType(t)) if t == "Auction"
        ));
    }

    #[test]
    fn lookup_is_case_sensitive() {
        let registry = HandlerRegistry::new().with(Arc::new(Named("User"))).unwrap();
        assert!(registry.resolve("user").is_err());
    }

    #[test]
    fn empty_aggregate_type_is_rejected() {
        let mut registry = HandlerRegistry::new();
        assert_eq!(
            registry.register(Arc::new(Named(""))).unwrap_err(),
            RegistryError::EmptyAggregateType
        );
    }
}
