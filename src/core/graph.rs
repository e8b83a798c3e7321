//! Dependency graph construction.
//!
//! An edge `A -> B` means "A depends on B". Edges come from typed
//! references in A's properties and from A's explicit `depends_on`.
//! References into imported stacks add no edge (those resources are
//! already deployed) but must resolve against the imported stack's
//! recorded outputs.

use super::error::PlanError;
use super::resolver::OutputIndex;
use super::types::*;
use crate::state::StateStore;
use crate::core::error::StateError;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};

/// Deployed outputs of the stacks a stack imports.
#[derive(Debug, Clone, Default)]
pub struct ImportedStacks {
    stacks: FxHashMap<String, BTreeMap<String, Outputs>>,
}

impl ImportedStacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a stack as imported, even if it has no records yet.
    pub fn declare(&mut self, stack: impl Into<String>) {
        self.stacks.entry(stack.into()).or_default();
    }

    pub fn insert(&mut self, stack: impl Into<String>, logical_id: impl Into<String>, outputs: Outputs) {
        self.stacks
            .entry(stack.into())
            .or_default()
            .insert(logical_id.into(), outputs);
    }

    /// Build from already-loaded stack states.
    pub fn from_states<'a>(states: impl IntoIterator<Item = &'a StackState>) -> Self {
        let mut imports = Self::new();
        for state in states {
            imports.declare(state.stack.clone());
            for (id, record) in &state.records {
                imports.insert(state.stack.clone(), id.clone(), record.outputs.clone());
            }
        }
        imports
    }

    /// Load every named stack from a state store.
    pub fn load(store: &dyn StateStore, names: &[String]) -> Result<Self, StateError> {
        let states = names
            .iter()
            .map(|n| store.load(n))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_states(&states))
    }

    pub fn is_imported(&self, stack: &str) -> bool {
        self.stacks.contains_key(stack)
    }

    pub fn outputs(&self, stack: &str, logical_id: &str) -> Option<&Outputs> {
        self.stacks.get(stack).and_then(|s| s.get(logical_id))
    }

    /// Outputs keyed as `stack::Resource`, ready for reference binding.
    pub fn output_index(&self) -> OutputIndex {
        let mut index = OutputIndex::default();
        for (stack, resources) in &self.stacks {
            for (id, outputs) in resources {
                index.insert(format!("{}::{}", stack, id), outputs.clone());
            }
        }
        index
    }
}

/// Directed dependency graph over logical ids.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    dependencies: FxHashMap<String, BTreeSet<String>>,
    dependents: FxHashMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Logical ids in declaration order.
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn contains(&self, id: &str) -> bool {
        self.dependencies.contains_key(id)
    }

    /// Direct dependencies of `id`, ascending.
    pub fn dependencies_of(&self, id: &str) -> impl Iterator<Item = &str> + '_ {
        self.dependencies
            .get(id)
            .into_iter()
            .flat_map(|s| s.iter().map(String::as_str))
    }

    /// Direct dependents of `id`, ascending.
    pub fn dependents_of(&self, id: &str) -> impl Iterator<Item = &str> + '_ {
        self.dependents
            .get(id)
            .into_iter()
            .flat_map(|s| s.iter().map(String::as_str))
    }

    pub fn edge_count(&self) -> usize {
        self.dependencies.values().map(BTreeSet::len).sum()
    }

    fn add_node(&mut self, id: &str) {
        self.nodes.push(id.to_string());
        self.dependencies.insert(id.to_string(), BTreeSet::new());
        self.dependents.insert(id.to_string(), BTreeSet::new());
    }

    fn add_edge(&mut self, from: &str, to: &str) {
        if let Some(deps) = self.dependencies.get_mut(from) {
            deps.insert(to.to_string());
        }
        if let Some(rdeps) = self.dependents.get_mut(to) {
            rdeps.insert(from.to_string());
        }
    }
}

/// Build the dependency graph for a set of resources.
///
/// Fails on the first duplicate id or unresolvable reference, scanning in
/// input order.
pub fn build_graph(
    resources: &[Resource],
    imports: &ImportedStacks,
) -> Result<DependencyGraph, PlanError> {
    let mut graph = DependencyGraph::default();
    for resource in resources {
        if graph.contains(&resource.id) {
            return Err(PlanError::DuplicateLogicalId(resource.id.clone()));
        }
        graph.add_node(&resource.id);
    }

    for resource in resources {
        for reference in resource.references() {
            match &reference.stack {
                None => {
                    if !graph.contains(&reference.resource) {
                        return Err(PlanError::UnresolvedReference {
                            resource: resource.id.clone(),
                            missing: reference.resource.clone(),
                        });
                    }
                    graph.add_edge(&resource.id, &reference.resource);
                }
                Some(stack) => check_imported(resource, reference, stack, imports)?,
            }
        }

        for dep in &resource.depends_on {
            if !graph.contains(dep) {
                return Err(PlanError::UnresolvedReference {
                    resource: resource.id.clone(),
                    missing: dep.clone(),
                });
            }
            graph.add_edge(&resource.id, dep);
        }
    }

    tracing::debug!(
        nodes = graph.nodes.len(),
        edges = graph.edge_count(),
        "dependency graph built"
    );
    Ok(graph)
}

fn check_imported(
    resource: &Resource,
    reference: &OutputRef,
    stack: &str,
    imports: &ImportedStacks,
) -> Result<(), PlanError> {
    if !imports.is_imported(stack) {
        return Err(PlanError::UnknownImport {
            resource: resource.id.clone(),
            stack: stack.to_string(),
        });
    }
    let outputs = imports
        .outputs(stack, &reference.resource)
        .ok_or_else(|| PlanError::UnresolvedReference {
            resource: resource.id.clone(),
            missing: reference.target_key(),
        })?;
    if !outputs.contains_key(&reference.attribute) {
        return Err(PlanError::MissingImportedOutput {
            resource: resource.id.clone(),
            reference: reference.to_string(),
        });
    }
    Ok(())
}
