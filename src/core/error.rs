//! Error taxonomy, one enum per layer.
//!
//! Plan-time errors abort before any provider call. Execution errors are
//! localized to a step and surface through the apply report; `ExecError`
//! is only returned directly for pre-flight and state failures.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading a stack definition.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("{} validation error(s): {}", .0.len(), join_messages(.0))]
    Invalid(Vec<super::parser::ValidationError>),
}

fn join_messages(errors: &[super::parser::ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Graph construction and planning errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("resource '{resource}' references unknown resource '{missing}'")]
    UnresolvedReference { resource: String, missing: String },

    #[error("resource '{resource}' references stack '{stack}' which is not imported")]
    UnknownImport { resource: String, stack: String },

    #[error("resource '{resource}' references '{reference}' but that output does not exist")]
    MissingImportedOutput { resource: String, reference: String },

    #[error("resource '{resource}' property '{property}' has a malformed reference")]
    MalformedReference { resource: String, property: String },

    #[error("duplicate logical id '{0}'")]
    DuplicateLogicalId(String),

    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("cannot delete '{resource}': still referenced by {}", .dependents.join(", "))]
    DeleteBlocked {
        resource: String,
        dependents: Vec<String>,
    },

    #[error("template error in resource '{resource}': {message}")]
    Template { resource: String, message: String },
}

/// Classified failure reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Worth retrying (throttling, propagation delay, timeouts).
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Retrying cannot help (validation failure, permission denial).
    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Execution errors.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("operation on '{resource}' failed after {attempts} attempt(s): {last}")]
    OperationFailed {
        resource: String,
        attempts: u32,
        last: ProviderError,
    },

    #[error("operation on '{resource}' rejected: {source}")]
    Provider {
        resource: String,
        #[source]
        source: ProviderError,
    },

    #[error("resource '{resource}' needs output '{reference}' which was never reported")]
    MissingOutput { resource: String, reference: String },

    #[error("no provider registered for kind '{kind}' (needed by '{resource}')")]
    MissingProvider { kind: String, resource: String },

    #[error("plan references '{0}' which is not declared and has no state record")]
    UnknownStep(String),

    #[error("plan was computed against state version {planned}, store is at {actual}")]
    StalePlan { planned: u64, actual: u64 },

    #[error(transparent)]
    State(#[from] StateError),
}

/// State store errors.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("concurrent apply on stack '{stack}': {detail}")]
    ConcurrentApply { stack: String, detail: String },

    #[error("state lock {} is held by another process", .path.display())]
    Lock { path: PathBuf },

    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("state JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("state database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StateError {
    /// Another writer holds the stack, in this process or another.
    pub fn is_concurrent_apply(&self) -> bool {
        matches!(self, Self::ConcurrentApply { .. } | Self::Lock { .. })
    }
}
