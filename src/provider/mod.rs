//! Provider boundary: one async provider per resource kind.
//!
//! Providers receive fully bound properties (every reference already
//! replaced by a concrete output value) and classify their own failures as
//! transient or permanent.

pub mod memory;

use crate::core::error::ProviderError;
use crate::core::types::{Outputs, Properties, ResourceKind};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Result of creating (or finding) a provider resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    pub provider_id: String,
    pub outputs: Outputs,
}

/// Control-plane operations for one resource kind.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn create(&self, properties: &Properties) -> Result<Created, ProviderError>;

    async fn update(
        &self,
        provider_id: &str,
        properties: &Properties,
    ) -> Result<Outputs, ProviderError>;

    async fn delete(&self, provider_id: &str) -> Result<(), ProviderError>;

    /// Find an existing resource matching `properties`.
    async fn lookup(&self, _properties: &Properties) -> Result<Option<Created>, ProviderError> {
        Ok(None)
    }
}

/// Providers keyed by the kind they manage.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: FxHashMap<ResourceKind, Arc<dyn ResourceProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ResourceKind, provider: Arc<dyn ResourceProvider>) {
        self.providers.insert(kind, provider);
    }

    /// Register (builder style).
    pub fn with(mut self, kind: ResourceKind, provider: Arc<dyn ResourceProvider>) -> Self {
        self.register(kind, provider);
        self
    }

    pub fn get(&self, kind: &ResourceKind) -> Option<Arc<dyn ResourceProvider>> {
        self.providers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &ResourceKind) -> bool {
        self.providers.contains_key(kind)
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<String> = self.providers.keys().map(ToString::to_string).collect();
        kinds.sort();
        f.debug_struct("ProviderRegistry").field("kinds", &kinds).finish()
    }
}
