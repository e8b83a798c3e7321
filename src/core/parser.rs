//! Stack YAML parsing and validation.
//!
//! Parses a stack definition and validates structural constraints:
//! - Version must be "1"
//! - Logical ids must be unique and well-formed
//! - Lookups must name a target kind
//! - Cross-stack references must name an imported stack
//! - Policy values must be usable

use super::error::ParseError;
use super::types::*;
use rustc_hash::FxHashSet;
use std::path::Path;

/// Validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl ValidationError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Parse a stack file from disk.
pub fn parse_stack_file(path: &Path) -> Result<Stack, ParseError> {
    let content = std::fs::read_to_string(path).map_err(|source| ParseError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_stack(&content)
}

/// Parse a stack from a YAML string.
pub fn parse_stack(yaml: &str) -> Result<Stack, ParseError> {
    Ok(serde_yaml_ng::from_str(yaml)?)
}

/// Parse and validate in one step.
pub fn load_stack(path: &Path) -> Result<Stack, ParseError> {
    let stack = parse_stack_file(path)?;
    let errors = validate_stack(&stack);
    if errors.is_empty() {
        tracing::debug!(stack = %stack.name, resources = stack.resources.len(), "stack loaded");
        Ok(stack)
    } else {
        Err(ParseError::Invalid(errors))
    }
}

/// Validate a parsed stack. Returns a list of errors (empty = valid).
pub fn validate_stack(stack: &Stack) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if stack.version != "1" {
        errors.push(ValidationError::new(format!(
            "version must be \"1\", got \"{}\"",
            stack.version
        )));
    }

    if stack.name.is_empty() {
        errors.push(ValidationError::new("name must not be empty"));
    } else if !is_valid_id(&stack.name) {
        errors.push(ValidationError::new(format!(
            "stack name '{}' may only contain letters, digits, '-' and '_'",
            stack.name
        )));
    }

    validate_policy(&stack.policy, &mut errors);

    let mut seen = FxHashSet::default();
    for resource in &stack.resources {
        let id = &resource.id;
        if id.is_empty() {
            errors.push(ValidationError::new("resource with empty id"));
            continue;
        }
        if !is_valid_id(id) {
            errors.push(ValidationError::new(format!(
                "resource id '{}' may only contain letters, digits, '-' and '_'",
                id
            )));
        }
        if !seen.insert(id.as_str()) {
            errors.push(ValidationError::new(format!("duplicate resource id '{}'", id)));
        }

        for dep in &resource.depends_on {
            if dep == id {
                errors.push(ValidationError::new(format!(
                    "resource '{}' depends on itself",
                    id
                )));
            }
        }

        match (&resource.kind, &resource.of) {
            (ResourceKind::Lookup, None) => errors.push(ValidationError::new(format!(
                "resource '{}' (lookup) has no 'of' target kind",
                id
            ))),
            (ResourceKind::Lookup, Some(ResourceKind::Lookup)) => {
                errors.push(ValidationError::new(format!(
                    "resource '{}' (lookup) cannot look up another lookup",
                    id
                )))
            }
            (kind, Some(_)) if *kind != ResourceKind::Lookup => {
                errors.push(ValidationError::new(format!(
                    "resource '{}' ({}) sets 'of' but is not a lookup",
                    id, kind
                )))
            }
            _ => {}
        }

        for reference in resource.references() {
            if let Some(ref other) = reference.stack {
                if !stack.imports.iter().any(|i| i == other) {
                    errors.push(ValidationError::new(format!(
                        "resource '{}' references '{}' but stack '{}' is not imported",
                        id, reference, other
                    )));
                }
            }
        }

        // A `ref` mapping that failed to parse would otherwise pass as data.
        for (key, value) in &resource.properties {
            if value.has_malformed_ref() {
                errors.push(ValidationError::new(format!(
                    "resource '{}' property '{}' has a malformed reference (expected Resource.attribute)",
                    id, key
                )));
            }
        }
    }

    errors
}

fn validate_policy(policy: &Policy, errors: &mut Vec<ValidationError>) {
    if policy.max_in_flight == 0 {
        errors.push(ValidationError::new("policy.max_in_flight must be at least 1"));
    }
    if policy.retry.max_attempts == 0 {
        errors.push(ValidationError::new(
            "policy.retry.max_attempts must be at least 1",
        ));
    }
    if policy.operation_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "policy.operation_timeout_secs must be at least 1",
        ));
    }
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
