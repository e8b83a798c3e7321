//! In-memory provider that simulates a cloud control plane.
//!
//! Used by tests and demos. Outputs echo the bound properties plus `id`,
//! `arn` and any extra attributes configured with `with_attributes`.
//! Faults can be queued per provider and are consumed one per call.

use super::{Created, ResourceProvider};
use crate::core::error::ProviderError;
use crate::core::types::{Outputs, Properties, ResourceKind};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Provider call type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Create,
    Update,
    Delete,
    Lookup,
}

/// One provider call as observed by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub kind: ResourceKind,
    pub call: CallKind,
    /// `name` property when present, otherwise the provider id
    pub subject: String,
    pub ok: bool,
}

/// Shared, ordered log of provider calls across providers.
#[derive(Debug, Clone, Default)]
pub struct CallJournal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl CallJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, entry: JournalEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Subjects of calls of one type, in call order.
    pub fn subjects(&self, call: CallKind) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.call == call)
            .map(|e| e.subject)
            .collect()
    }

    pub fn count(&self, call: CallKind) -> usize {
        self.entries().iter().filter(|e| e.call == call).count()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Simulated provider for one resource kind.
#[derive(Debug)]
pub struct MemoryProvider {
    kind: ResourceKind,
    journal: CallJournal,
    attributes: Vec<String>,
    latency: Option<Duration>,
    faults: Mutex<VecDeque<ProviderError>>,
    resources: Mutex<BTreeMap<String, Properties>>,
    next_id: AtomicU64,
}

impl MemoryProvider {
    pub fn new(kind: ResourceKind, journal: CallJournal) -> Self {
        Self {
            kind,
            journal,
            attributes: Vec::new(),
            latency: None,
            faults: Mutex::new(VecDeque::new()),
            resources: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Extra output attributes, each rendered as `<attr>:<provider id>`.
    pub fn with_attributes(mut self, attributes: &[&str]) -> Self {
        self.attributes = attributes.iter().map(|a| a.to_string()).collect();
        self
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next call with `error`. Queued faults are consumed in order.
    pub fn fail_next(&self, error: ProviderError) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
    }

    /// Pre-existing resource discoverable by `lookup` on its `name`.
    pub fn seed(&self, name: &str) -> String {
        let id = self.allocate_id();
        let mut props = Properties::new();
        props.insert("name".to_string(), serde_json::Value::String(name.to_string()));
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), props);
        id
    }

    pub fn contains(&self, provider_id: &str) -> bool {
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(provider_id)
    }

    /// Number of live resources.
    pub fn live(&self) -> usize {
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn properties_of(&self, provider_id: &str) -> Option<Properties> {
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider_id)
            .cloned()
    }

    fn allocate_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("{}-{:04}", self.kind, n)
    }

    fn outputs(&self, provider_id: &str, properties: &Properties) -> Outputs {
        let mut outputs = properties.clone();
        outputs.insert("id".to_string(), provider_id.into());
        outputs.insert(
            "arn".to_string(),
            format!("arn:strata:{}:{}", self.kind, provider_id).into(),
        );
        for attr in &self.attributes {
            outputs.insert(attr.clone(), format!("{}:{}", attr, provider_id).into());
        }
        outputs
    }

    /// Simulate latency, then consume a queued fault if any.
    async fn enter(&self, call: CallKind, subject: &str) -> Result<(), ProviderError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let fault = self
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        self.journal.push(JournalEntry {
            kind: self.kind.clone(),
            call,
            subject: subject.to_string(),
            ok: fault.is_none(),
        });
        match fault {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn name_of(properties: &Properties) -> Option<&str> {
    properties.get("name").and_then(|v| v.as_str())
}

#[async_trait]
impl ResourceProvider for MemoryProvider {
    async fn create(&self, properties: &Properties) -> Result<Created, ProviderError> {
        let id = self.allocate_id();
        self.enter(CallKind::Create, name_of(properties).unwrap_or(&id))
            .await?;
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), properties.clone());
        tracing::debug!(kind = %self.kind, provider_id = %id, "created");
        Ok(Created {
            outputs: self.outputs(&id, properties),
            provider_id: id,
        })
    }

    async fn update(
        &self,
        provider_id: &str,
        properties: &Properties,
    ) -> Result<Outputs, ProviderError> {
        self.enter(CallKind::Update, name_of(properties).unwrap_or(provider_id))
            .await?;
        let mut resources = self.resources.lock().unwrap_or_else(PoisonError::into_inner);
        match resources.get_mut(provider_id) {
            Some(props) => {
                *props = properties.clone();
                Ok(self.outputs(provider_id, properties))
            }
            None => Err(ProviderError::Permanent(format!(
                "{} '{}' does not exist",
                self.kind, provider_id
            ))),
        }
    }

    async fn delete(&self, provider_id: &str) -> Result<(), ProviderError> {
        self.enter(CallKind::Delete, provider_id).await?;
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(provider_id);
        Ok(())
    }

    async fn lookup(&self, properties: &Properties) -> Result<Option<Created>, ProviderError> {
        let name = name_of(properties).unwrap_or_default();
        self.enter(CallKind::Lookup, name).await?;
        let found = self
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(_, p)| name_of(p) == Some(name))
            .map(|(id, _)| id.clone());
        Ok(found.map(|id| Created {
            outputs: self.outputs(&id, properties),
            provider_id: id,
        }))
    }
}
