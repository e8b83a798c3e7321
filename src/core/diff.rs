//! Diff engine: desired resources against deployed state records.
//!
//! Hashes are taken over the symbolic property mapping (references render
//! as `{"ref": "Res.attr"}`), so a change in an upstream output never shows
//! up as a change in the referencing resource.

use super::types::*;
use crate::provenance::hasher;
use std::collections::BTreeMap;

/// Overall and per-key digests of a resource's desired properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub hash: String,
    pub key_hashes: BTreeMap<String, String>,
}

/// Compute the fingerprint of a resource.
///
/// The provider kind and whether the resource is a lookup are mixed into
/// the overall hash, so switching either is reported as an update.
pub fn fingerprint(resource: &Resource) -> Fingerprint {
    let kind = format!("kind:{}", resource.provider_kind());
    let mode = if resource.kind == ResourceKind::Lookup {
        "mode:lookup"
    } else {
        "mode:managed"
    };
    let (hash, key_hashes) = hasher::hash_mapping(
        &[&kind, mode],
        resource
            .properties
            .iter()
            .map(|(k, v)| (k, v.to_symbolic_json())),
    );
    Fingerprint { hash, key_hashes }
}

/// Classification of one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDiff {
    pub logical_id: String,
    /// Kind the provider call targets
    pub kind: ResourceKind,
    pub operation: Operation,
    pub changed_keys: Vec<String>,
}

/// Classify a single resource against its record, if any.
pub fn diff_resource(resource: &Resource, record: Option<&DeployedRecord>) -> ResourceDiff {
    let kind = resource.provider_kind().clone();
    let (operation, changed_keys) = match (resource.ensure, record) {
        (Ensure::Absent, Some(_)) => (Operation::Delete, Vec::new()),
        (Ensure::Absent, None) => (Operation::NoOp, Vec::new()),
        (Ensure::Present, None) if resource.kind == ResourceKind::Lookup => {
            (Operation::Lookup, Vec::new())
        }
        (Ensure::Present, None) => (Operation::Create, Vec::new()),
        (Ensure::Present, Some(record)) => {
            let fp = fingerprint(resource);
            if fp.hash == record.property_hash {
                (Operation::NoOp, Vec::new())
            } else {
                (Operation::Update, changed_keys(&fp, record, &kind))
            }
        }
    };
    ResourceDiff {
        logical_id: resource.id.clone(),
        kind,
        operation,
        changed_keys,
    }
}

/// Property keys whose digest differs between desired and recorded state.
///
/// Added and removed keys both count. `kind` is reported when the provider
/// kind moved, `of` when only the lookup mode flipped.
fn changed_keys(fp: &Fingerprint, record: &DeployedRecord, kind: &ResourceKind) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    if record.kind != *kind {
        keys.push("kind".to_string());
    }
    for (key, hash) in &fp.key_hashes {
        if record.key_hashes.get(key) != Some(hash) {
            keys.push(key.clone());
        }
    }
    for key in record.key_hashes.keys() {
        if !fp.key_hashes.contains_key(key) {
            keys.push(key.clone());
        }
    }
    if keys.is_empty() {
        keys.push("of".to_string());
    }
    keys.sort();
    keys
}

/// Classify every desired resource, then every orphaned record.
///
/// Desired resources come first in declaration order; records with no
/// declaration follow in ascending id order, each as a `Delete`.
pub fn diff_resources(
    desired: &[Resource],
    records: &BTreeMap<String, DeployedRecord>,
) -> Vec<ResourceDiff> {
    let mut diffs: Vec<ResourceDiff> = desired
        .iter()
        .map(|r| diff_resource(r, records.get(&r.id)))
        .collect();

    for (id, record) in records {
        if !desired.iter().any(|r| &r.id == id) {
            diffs.push(ResourceDiff {
                logical_id: id.clone(),
                kind: record.kind.clone(),
                operation: Operation::Delete,
                changed_keys: Vec::new(),
            });
        }
    }
    diffs
}
