//! Plan generation: topological ordering plus diff against deployed state.
//!
//! Creates, updates, lookups and no-ops come first in dependency order
//! (Kahn's algorithm, ties broken by ascending logical id). Deletes follow
//! in reverse dependency order.

use super::diff::{diff_resources, ResourceDiff};
use super::error::PlanError;
use super::graph::{build_graph, DependencyGraph, ImportedStacks};
use super::resolver::resolve_stack_templates;
use super::types::*;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Dependencies keyed by node; every dependency must itself be a key.
type DepMap<'a> = BTreeMap<&'a str, BTreeSet<&'a str>>;

/// Topologically sort the graph: dependencies before dependents.
pub fn topological_order(graph: &DependencyGraph) -> Result<Vec<String>, PlanError> {
    let deps: DepMap = graph
        .nodes()
        .iter()
        .map(|n| (n.as_str(), graph.dependencies_of(n).collect()))
        .collect();
    kahn(&deps)
}

/// Kahn's algorithm over a dependency map.
fn kahn(deps: &DepMap<'_>) -> Result<Vec<String>, PlanError> {
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (&node, node_deps) in deps {
        in_degree.insert(node, node_deps.len());
        for &dep in node_deps {
            dependents.entry(dep).or_default().push(node);
        }
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut order = Vec::with_capacity(deps.len());

    while let Some(node) = ready.pop_first() {
        order.push(node.to_string());
        for &dependent in dependents.get(node).map(Vec::as_slice).unwrap_or_default() {
            if let Some(d) = in_degree.get_mut(dependent) {
                *d -= 1;
                if *d == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if order.len() == deps.len() {
        return Ok(order);
    }

    let placed: FxHashSet<&str> = order.iter().map(String::as_str).collect();
    let remaining: BTreeSet<&str> = deps
        .keys()
        .copied()
        .filter(|n| !placed.contains(n))
        .collect();
    Err(PlanError::CyclicDependency {
        cycle: minimal_cycle(deps, &remaining),
    })
}

/// Shortest cycle among the nodes Kahn could not place.
///
/// Breadth-first search from each remaining node along dependency edges;
/// the shortest closed walk wins, ties going to the smallest start id.
/// Returned as `[a, b, ..., a]`, read "a depends on b depends on ... a".
fn minimal_cycle(deps: &DepMap<'_>, remaining: &BTreeSet<&str>) -> Vec<String> {
    let mut best: Option<Vec<String>> = None;
    for &start in remaining {
        if let Some(cycle) = shortest_cycle_through(deps, start, remaining) {
            let shorter = match &best {
                Some(b) => cycle.len() < b.len(),
                None => true,
            };
            if shorter {
                best = Some(cycle);
            }
        }
    }
    best.unwrap_or_else(|| remaining.iter().map(|s| s.to_string()).collect())
}

fn shortest_cycle_through<'a>(
    deps: &DepMap<'a>,
    start: &'a str,
    remaining: &BTreeSet<&str>,
) -> Option<Vec<String>> {
    let mut parent: FxHashMap<&str, &str> = FxHashMap::default();
    let mut visited: FxHashSet<&str> = FxHashSet::default();
    let mut queue = VecDeque::from([start]);
    visited.insert(start);

    while let Some(node) = queue.pop_front() {
        let Some(node_deps) = deps.get(node) else {
            continue;
        };
        for &next in node_deps {
            if !remaining.contains(next) {
                continue;
            }
            if next == start {
                let mut path = vec![node];
                let mut cur = node;
                while cur != start {
                    match parent.get(cur) {
                        Some(&p) => {
                            path.push(p);
                            cur = p;
                        }
                        None => break,
                    }
                }
                path.reverse();
                path.push(start);
                return Some(path.into_iter().map(str::to_string).collect());
            }
            if visited.insert(next) {
                parent.insert(next, node);
                queue.push_back(next);
            }
        }
    }
    None
}

/// Compute the plan for a resolved stack.
///
/// `stack` must already have its templates resolved and `graph` must have
/// been built from the same resources.
pub fn plan(
    stack: &Stack,
    graph: &DependencyGraph,
    state: &StackState,
) -> Result<Plan, PlanError> {
    let order = topological_order(graph)?;
    let diffs: FxHashMap<String, ResourceDiff> = diff_resources(&stack.resources, &state.records)
        .into_iter()
        .map(|d| (d.logical_id.clone(), d))
        .collect();

    let present: FxHashSet<&str> = stack
        .resources
        .iter()
        .filter(|r| r.is_present())
        .map(|r| r.id.as_str())
        .collect();
    let deletes: BTreeSet<&str> = diffs
        .values()
        .filter(|d| d.operation == Operation::Delete)
        .map(|d| d.logical_id.as_str())
        .collect();

    check_delete_blockers(graph, &present, &deletes)?;

    let mut steps = Vec::with_capacity(diffs.len());
    for id in &order {
        let Some(diff) = diffs.get(id) else { continue };
        if diff.operation == Operation::Delete {
            continue;
        }
        let waits_on: Vec<String> = graph.dependencies_of(id).map(str::to_string).collect();
        if present.contains(id.as_str()) {
            if let Some(gone) = waits_on.iter().find(|d| !present.contains(d.as_str())) {
                return Err(PlanError::UnresolvedReference {
                    resource: id.clone(),
                    missing: gone.clone(),
                });
            }
        }
        steps.push(PlannedStep {
            logical_id: id.clone(),
            kind: diff.kind.clone(),
            operation: diff.operation,
            changed_keys: diff.changed_keys.clone(),
            waits_on: if present.contains(id.as_str()) {
                waits_on
            } else {
                Vec::new()
            },
        });
    }

    steps.extend(delete_steps(stack, graph, state, &diffs, &deletes)?);

    let plan = Plan {
        stack: stack.name.clone(),
        base_version: state.version,
        steps,
    };
    tracing::info!(
        stack = %plan.stack,
        base_version = plan.base_version,
        create = plan.count(Operation::Create),
        lookup = plan.count(Operation::Lookup),
        update = plan.count(Operation::Update),
        delete = plan.count(Operation::Delete),
        unchanged = plan.count(Operation::NoOp),
        "plan computed"
    );
    Ok(plan)
}

/// Reject deleting any resource a surviving declaration still references.
fn check_delete_blockers(
    graph: &DependencyGraph,
    present: &FxHashSet<&str>,
    deletes: &BTreeSet<&str>,
) -> Result<(), PlanError> {
    for id in deletes {
        let survivors: Vec<String> = graph
            .dependents_of(id)
            .filter(|d| present.contains(d))
            .map(str::to_string)
            .collect();
        if !survivors.is_empty() {
            return Err(PlanError::DeleteBlocked {
                resource: id.to_string(),
                dependents: survivors,
            });
        }
    }
    Ok(())
}

/// Delete steps in reverse dependency order.
///
/// A declared-absent resource's dependencies come from the graph, an
/// orphan's from its record. Each delete waits on the deletes of its
/// dependents, and on surviving resources whose recorded dependencies
/// still name it (those are being updated away from it).
fn delete_steps(
    stack: &Stack,
    graph: &DependencyGraph,
    state: &StackState,
    diffs: &FxHashMap<String, ResourceDiff>,
    deletes: &BTreeSet<&str>,
) -> Result<Vec<PlannedStep>, PlanError> {
    let mut deps: DepMap = BTreeMap::new();
    for &id in deletes {
        let node_deps: BTreeSet<&str> = if graph.contains(id) {
            graph.dependencies_of(id).filter(|d| deletes.contains(d)).collect()
        } else {
            state
                .records
                .get(id)
                .map(|r| {
                    r.dependencies
                        .iter()
                        .map(String::as_str)
                        .filter(|d| deletes.contains(d) && *d != id)
                        .collect()
                })
                .unwrap_or_default()
        };
        deps.insert(id, node_deps);
    }

    let mut order = kahn(&deps)?;
    order.reverse();

    let mut steps = Vec::with_capacity(order.len());
    for id in order {
        let mut waits_on: BTreeSet<String> = deps
            .iter()
            .filter(|(_, d)| d.contains(id.as_str()))
            .map(|(n, _)| n.to_string())
            .collect();
        for record in state.records.values() {
            let survives = stack
                .resource(&record.logical_id)
                .is_some_and(Resource::is_present);
            if survives && record.dependencies.iter().any(|d| *d == id) {
                waits_on.insert(record.logical_id.clone());
            }
        }
        let kind = diffs
            .get(&id)
            .map(|d| d.kind.clone())
            .or_else(|| state.records.get(&id).map(|r| r.kind.clone()))
            .unwrap_or(ResourceKind::Lookup);
        steps.push(PlannedStep {
            logical_id: id,
            kind,
            operation: Operation::Delete,
            changed_keys: Vec::new(),
            waits_on: waits_on.into_iter().collect(),
        });
    }
    Ok(steps)
}

/// A stack ready to apply: resolved declaration, graph and plan.
#[derive(Debug, Clone)]
pub struct PreparedStack {
    /// Stack with every template resolved
    pub stack: Stack,
    pub graph: DependencyGraph,
    pub plan: Plan,
}

/// Resolve templates, build the graph and plan against `state`.
///
/// Imported references must name a stack listed in `stack.imports`,
/// whatever `imports` happens to hold.
pub fn plan_stack(
    stack: &Stack,
    state: &StackState,
    imports: &ImportedStacks,
) -> Result<PreparedStack, PlanError> {
    check_references(stack)?;
    let resolved = resolve_stack_templates(stack)?;
    let graph = build_graph(&resolved.resources, imports)?;
    let plan = plan(&resolved, &graph, state)?;
    Ok(PreparedStack {
        stack: resolved,
        graph,
        plan,
    })
}

fn check_references(stack: &Stack) -> Result<(), PlanError> {
    for resource in &stack.resources {
        if let Some((key, _)) = resource
            .properties
            .iter()
            .find(|(_, v)| v.has_malformed_ref())
        {
            return Err(PlanError::MalformedReference {
                resource: resource.id.clone(),
                property: key.clone(),
            });
        }
        for reference in resource.references() {
            if let Some(other) = &reference.stack {
                if !stack.imports.contains(other) {
                    return Err(PlanError::UnknownImport {
                        resource: resource.id.clone(),
                        stack: other.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}
