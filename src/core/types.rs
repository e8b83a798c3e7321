//! Resource model: stacks, resources, plans and deployed state records.
//!
//! Every type that crosses the YAML or state-store boundary derives
//! Serialize/Deserialize. Resource order inside a stack is preserved but
//! carries no meaning beyond diagnostics.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Outputs reported by a provider (e.g. `id`, `arn`, `dns_name`).
pub type Outputs = BTreeMap<String, serde_json::Value>;

/// Property mapping after every reference has been bound to a concrete value.
pub type Properties = BTreeMap<String, serde_json::Value>;

// ============================================================================
// Stack
// ============================================================================

/// A named collection of resources plus stack-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stack {
    /// Schema version (must be "1")
    pub version: String,

    /// Stack name, also the state store key
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Target region
    #[serde(default)]
    pub region: Option<String>,

    /// Target account
    #[serde(default)]
    pub account: Option<String>,

    /// Naming prefix applied through `{{stack.prefix}}`
    #[serde(default)]
    pub prefix: Option<String>,

    /// Free-form parameters (templatable via `{{params.key}}`)
    #[serde(default)]
    pub params: IndexMap<String, serde_json::Value>,

    /// Other stacks whose outputs may be referenced as `stack::Resource.attr`
    #[serde(default)]
    pub imports: Vec<String>,

    /// Resource declarations
    #[serde(default)]
    pub resources: Vec<Resource>,

    /// Execution policy
    #[serde(default)]
    pub policy: Policy,
}

impl Stack {
    /// Create an empty stack with default policy.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            version: "1".to_string(),
            name: name.into(),
            description: None,
            region: None,
            account: None,
            prefix: None,
            params: IndexMap::new(),
            imports: Vec::new(),
            resources: Vec::new(),
            policy: Policy::default(),
        }
    }

    /// Append a resource (builder style).
    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resources.push(resource);
        self
    }

    /// Find a resource by logical id.
    pub fn resource(&self, logical_id: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.id == logical_id)
    }
}

// ============================================================================
// Resources
// ============================================================================

/// A single declared cloud resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Logical id, unique within the stack
    pub id: String,

    /// Resource kind
    pub kind: ResourceKind,

    /// Target kind of a `lookup` resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub of: Option<ResourceKind>,

    /// Desired presence
    #[serde(default)]
    pub ensure: Ensure,

    /// What deleting this resource means at the provider
    #[serde(default)]
    pub removal_policy: RemovalPolicy,

    /// Explicit dependencies (logical ids applied first)
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Property bag of literals and typed references
    #[serde(default)]
    pub properties: IndexMap<String, PropertyValue>,
}

impl Resource {
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            of: None,
            ensure: Ensure::Present,
            removal_policy: RemovalPolicy::Destroy,
            depends_on: Vec::new(),
            properties: IndexMap::new(),
        }
    }

    /// A get-or-create lookup of an existing resource of `target` kind.
    pub fn lookup(id: impl Into<String>, target: ResourceKind) -> Self {
        let mut r = Self::new(id, ResourceKind::Lookup);
        r.of = Some(target);
        r
    }

    /// Set a property (builder style).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Set a property to a reference to `resource.attribute`.
    pub fn with_ref(
        self,
        key: impl Into<String>,
        resource: impl Into<String>,
        attribute: impl Into<String>,
    ) -> Self {
        self.with(key, PropertyValue::Ref(OutputRef::local(resource, attribute)))
    }

    /// Add an explicit dependency (builder style).
    pub fn depends_on(mut self, logical_id: impl Into<String>) -> Self {
        self.depends_on.push(logical_id.into());
        self
    }

    /// Mark the resource absent (builder style).
    pub fn absent(mut self) -> Self {
        self.ensure = Ensure::Absent;
        self
    }

    /// Retain at the provider on delete (builder style).
    pub fn retained(mut self) -> Self {
        self.removal_policy = RemovalPolicy::Retain;
        self
    }

    /// Kind of the provider that handles this resource.
    ///
    /// Lookups are served by the provider of their target kind.
    pub fn provider_kind(&self) -> &ResourceKind {
        match (&self.kind, &self.of) {
            (ResourceKind::Lookup, Some(target)) => target,
            (kind, _) => kind,
        }
    }

    /// All output references in the property bag, in declaration order.
    pub fn references(&self) -> Vec<&OutputRef> {
        let mut refs = Vec::new();
        for value in self.properties.values() {
            value.collect_refs(&mut refs);
        }
        refs
    }

    pub fn is_present(&self) -> bool {
        self.ensure == Ensure::Present
    }
}

/// Resource kind enum.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Network,
    Cluster,
    Service,
    LoadBalancer,
    Repository,
    Bucket,
    Table,
    Database,
    BuildProject,
    Pipeline,
    Distribution,
    Lookup,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Cluster => write!(f, "cluster"),
            Self::Service => write!(f, "service"),
            Self::LoadBalancer => write!(f, "load_balancer"),
            Self::Repository => write!(f, "repository"),
            Self::Bucket => write!(f, "bucket"),
            Self::Table => write!(f, "table"),
            Self::Database => write!(f, "database"),
            Self::BuildProject => write!(f, "build_project"),
            Self::Pipeline => write!(f, "pipeline"),
            Self::Distribution => write!(f, "distribution"),
            Self::Lookup => write!(f, "lookup"),
        }
    }
}

/// Desired presence of a resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ensure {
    #[default]
    Present,
    Absent,
}

/// Provider-side effect of deleting a resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalPolicy {
    #[default]
    Destroy,
    /// Forget the state record, leave the provider resource alone.
    Retain,
}

// ============================================================================
// Property values and references
// ============================================================================

/// A property value: a typed reference, a nested list/map, or a literal.
///
/// Untagged: `{ ref: "Vpc.id" }` is a reference, any other mapping is a map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Ref(OutputRef),
    List(Vec<PropertyValue>),
    Map(IndexMap<String, PropertyValue>),
    Literal(serde_json::Value),
}

impl PropertyValue {
    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a OutputRef>) {
        match self {
            Self::Ref(r) => out.push(r),
            Self::List(items) => items.iter().for_each(|v| v.collect_refs(out)),
            Self::Map(map) => map.values().for_each(|v| v.collect_refs(out)),
            Self::Literal(_) => {}
        }
    }

    /// A mapping with a `ref` key that did not parse as a reference.
    pub fn has_malformed_ref(&self) -> bool {
        match self {
            Self::Map(map) => map.contains_key("ref") || map.values().any(Self::has_malformed_ref),
            Self::List(items) => items.iter().any(Self::has_malformed_ref),
            Self::Ref(_) | Self::Literal(_) => false,
        }
    }

    /// Symbolic JSON form: references render as `{"ref": "..."}`.
    ///
    /// This is what the diff engine hashes, so it must not depend on any
    /// provider-assigned value.
    pub fn to_symbolic_json(&self) -> serde_json::Value {
        match self {
            Self::Ref(r) => serde_json::json!({ "ref": r.to_string() }),
            Self::List(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_symbolic_json).collect())
            }
            Self::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_symbolic_json()))
                    .collect(),
            ),
            Self::Literal(v) => v.clone(),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        Self::Literal(serde_json::Value::String(s.to_string()))
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        Self::Literal(serde_json::Value::String(s))
    }
}

impl From<serde_json::Value> for PropertyValue {
    fn from(v: serde_json::Value) -> Self {
        Self::Literal(v)
    }
}

impl From<OutputRef> for PropertyValue {
    fn from(r: OutputRef) -> Self {
        Self::Ref(r)
    }
}

impl From<i32> for PropertyValue {
    fn from(n: i32) -> Self {
        Self::Literal(serde_json::Value::from(n))
    }
}

impl From<i64> for PropertyValue {
    fn from(n: i64) -> Self {
        Self::Literal(serde_json::Value::from(n))
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        Self::Literal(serde_json::Value::Bool(b))
    }
}

/// A typed reference to another resource's output attribute.
///
/// Written `Resource.attribute`, or `stack::Resource.attribute` for an
/// imported stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawRef", into = "RawRef")]
pub struct OutputRef {
    pub stack: Option<String>,
    pub resource: String,
    pub attribute: String,
}

impl OutputRef {
    pub fn local(resource: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            stack: None,
            resource: resource.into(),
            attribute: attribute.into(),
        }
    }

    pub fn imported(
        stack: impl Into<String>,
        resource: impl Into<String>,
        attribute: impl Into<String>,
    ) -> Self {
        Self {
            stack: Some(stack.into()),
            resource: resource.into(),
            attribute: attribute.into(),
        }
    }

    /// Parse `Resource.attr` or `stack::Resource.attr`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let (stack, rest) = match s.split_once("::") {
            Some((stack, rest)) => (Some(stack.trim()), rest),
            None => (None, s),
        };
        let (resource, attribute) = rest
            .split_once('.')
            .ok_or_else(|| format!("reference '{}' must be Resource.attribute", s))?;
        let (resource, attribute) = (resource.trim(), attribute.trim());
        if resource.is_empty() || attribute.is_empty() || stack.is_some_and(str::is_empty) {
            return Err(format!("reference '{}' has an empty segment", s));
        }
        Ok(Self {
            stack: stack.map(str::to_string),
            resource: resource.to_string(),
            attribute: attribute.to_string(),
        })
    }

    pub fn is_local(&self) -> bool {
        self.stack.is_none()
    }

    /// Key into an output index: `Resource` or `stack::Resource`.
    pub fn target_key(&self) -> String {
        match &self.stack {
            Some(stack) => format!("{}::{}", stack, self.resource),
            None => self.resource.clone(),
        }
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.stack {
            Some(stack) => write!(f, "{}::{}.{}", stack, self.resource, self.attribute),
            None => write!(f, "{}.{}", self.resource, self.attribute),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRef {
    #[serde(rename = "ref")]
    target: String,
}

impl TryFrom<RawRef> for OutputRef {
    type Error = String;

    fn try_from(raw: RawRef) -> Result<Self, Self::Error> {
        Self::parse(&raw.target)
    }
}

impl From<OutputRef> for RawRef {
    fn from(r: OutputRef) -> Self {
        Self {
            target: r.to_string(),
        }
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Execution policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Maximum concurrent provider operations
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Failure handling
    #[serde(default)]
    pub failure: FailurePolicy,

    /// Retry/backoff for transient provider errors
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Per-attempt timeout; a timeout counts as a transient failure
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,

    /// Append provenance events to `<state>/<stack>/events.jsonl`
    #[serde(default = "default_true")]
    pub event_log: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            failure: FailurePolicy::default(),
            retry: RetryPolicy::default(),
            operation_timeout_secs: default_operation_timeout(),
            event_log: true,
        }
    }
}

fn default_max_in_flight() -> usize {
    5
}

fn default_operation_timeout() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

/// Failure handling strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Keep dispatching branches that do not depend on the failure.
    #[default]
    ContinueIndependent,
    /// Stop all new dispatch after the first failure.
    StopOnFirst,
}

/// Exponential backoff settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_attempts() -> u32 {
    4
}

fn default_initial_backoff() -> u64 {
    200
}

fn default_max_backoff() -> u64 {
    10_000
}

// ============================================================================
// Plan
// ============================================================================

/// Operation planned for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
    NoOp,
    /// Bind an existing provider resource, or create it if none exists.
    Lookup,
}

impl Operation {
    /// Whether the operation changes anything at the provider or in state.
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::NoOp)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Delete => write!(f, "DELETE"),
            Self::NoOp => write!(f, "NO-OP"),
            Self::Lookup => write!(f, "LOOKUP"),
        }
    }
}

/// A single planned step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub logical_id: String,

    /// Kind handled by the provider (lookup target for lookups)
    pub kind: ResourceKind,

    pub operation: Operation,

    /// Property keys whose digest changed (updates only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_keys: Vec<String>,

    /// Steps that must succeed before this one is dispatched
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub waits_on: Vec<String>,
}

/// Machine-readable plan line for review before apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub logical_id: String,
    pub operation: Operation,
    #[serde(default)]
    pub changed_keys: Vec<String>,
}

/// Full deployment plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Stack name
    pub stack: String,

    /// State version the plan was computed against
    pub base_version: u64,

    /// Creates/updates in dependency order, then deletes in reverse order
    pub steps: Vec<PlannedStep>,
}

impl Plan {
    pub fn step(&self, logical_id: &str) -> Option<&PlannedStep> {
        self.steps.iter().find(|s| s.logical_id == logical_id)
    }

    /// Logical ids in plan order.
    pub fn order(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.logical_id.as_str()).collect()
    }

    pub fn entries(&self) -> Vec<PlanEntry> {
        self.steps
            .iter()
            .map(|s| PlanEntry {
                logical_id: s.logical_id.clone(),
                operation: s.operation,
                changed_keys: s.changed_keys.clone(),
            })
            .collect()
    }

    pub fn count(&self, operation: Operation) -> usize {
        self.steps.iter().filter(|s| s.operation == operation).count()
    }

    pub fn has_changes(&self) -> bool {
        self.steps.iter().any(|s| s.operation.is_change())
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Planning: {} ({} resources)", self.stack, self.steps.len())?;
        writeln!(f)?;
        for step in &self.steps {
            let symbol = match step.operation {
                Operation::Create => "+",
                Operation::Update => "~",
                Operation::Delete => "-",
                Operation::Lookup => "?",
                Operation::NoOp => " ",
            };
            write!(f, "  {} {} ({})", symbol, step.logical_id, step.kind)?;
            if !step.changed_keys.is_empty() {
                write!(f, " [{}]", step.changed_keys.join(", "))?;
            }
            writeln!(f)?;
        }
        writeln!(f)?;
        write!(
            f,
            "Plan: {} to add, {} to look up, {} to change, {} to destroy, {} unchanged.",
            self.count(Operation::Create),
            self.count(Operation::Lookup),
            self.count(Operation::Update),
            self.count(Operation::Delete),
            self.count(Operation::NoOp)
        )
    }
}

// ============================================================================
// Deployed state
// ============================================================================

/// Last-known deployed state of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployedRecord {
    pub stack: String,
    pub logical_id: String,

    /// Kind that was applied (lookup target for adopted resources)
    pub kind: ResourceKind,

    /// Provider-assigned identifier
    pub provider_id: String,

    /// BLAKE3 of the canonical property mapping used at apply time
    pub property_hash: String,

    /// Per-key digests, for changed-key reporting
    #[serde(default)]
    pub key_hashes: BTreeMap<String, String>,

    #[serde(default)]
    pub outputs: Outputs,

    /// Logical ids this resource depended on when applied
    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub removal_policy: RemovalPolicy,

    /// Bound through a lookup instead of created by this engine
    #[serde(default)]
    pub adopted: bool,

    pub applied_at: String,
}

impl DeployedRecord {
    /// Whether deleting this record must call the provider.
    pub fn owned_by_provider_delete(&self) -> bool {
        !self.adopted && self.removal_policy == RemovalPolicy::Destroy
    }
}

/// All records of one stack plus its optimistic-concurrency version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackState {
    pub stack: String,

    /// Bumped on every committed write
    #[serde(default)]
    pub version: u64,

    /// Token of the apply currently holding the stack
    #[serde(default)]
    pub lease: Option<String>,

    #[serde(default)]
    pub records: BTreeMap<String, DeployedRecord>,
}

impl StackState {
    pub fn empty(stack: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            ..Self::default()
        }
    }
}

// ============================================================================
// Apply report
// ============================================================================

/// Why a step never ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// An upstream step failed or was itself skipped.
    DependencyFailed { dependency: String },
    /// The apply was cancelled before this step was dispatched.
    Cancelled,
    /// `stop_on_first` halted dispatch after a failure elsewhere.
    Stopped,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DependencyFailed { dependency } => {
                write!(f, "skipped-due-to-dependency-failure ({})", dependency)
            }
            Self::Cancelled => write!(f, "cancelled"),
            Self::Stopped => write!(f, "stopped after failure"),
        }
    }
}

/// Final status of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed { error: String },
    Skipped { reason: SkipReason },
}

/// Outcome of one planned step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub logical_id: String,
    pub operation: Operation,
    pub status: StepStatus,

    /// Provider calls made (0 for no-ops and skipped steps)
    pub attempts: u32,

    pub duration_seconds: f64,
}

/// Result of one apply run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReport {
    pub stack: String,
    pub run_id: String,
    /// One outcome per plan step, in plan order
    pub outcomes: Vec<StepOutcome>,
    pub total_seconds: f64,
}

impl ApplyReport {
    pub fn outcome(&self, logical_id: &str) -> Option<&StepOutcome> {
        self.outcomes.iter().find(|o| o.logical_id == logical_id)
    }

    pub fn succeeded(&self) -> Vec<&str> {
        self.ids_where(|s| matches!(s, StepStatus::Succeeded))
    }

    pub fn failed(&self) -> Vec<&str> {
        self.ids_where(|s| matches!(s, StepStatus::Failed { .. }))
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.ids_where(|s| matches!(s, StepStatus::Skipped { .. }))
    }

    /// True only when every step succeeded.
    pub fn is_success(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| matches!(o.status, StepStatus::Succeeded))
    }

    fn ids_where(&self, pred: impl Fn(&StepStatus) -> bool) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| pred(&o.status))
            .map(|o| o.logical_id.as_str())
            .collect()
    }
}

// ============================================================================
// Provenance events
// ============================================================================

/// Provenance event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    ApplyStarted {
        stack: String,
        run_id: String,
        base_version: u64,
        strata_version: String,
    },
    OperationStarted {
        stack: String,
        resource: String,
        operation: Operation,
    },
    OperationRetried {
        stack: String,
        resource: String,
        attempt: u32,
        backoff_ms: u64,
        error: String,
    },
    OperationSucceeded {
        stack: String,
        resource: String,
        operation: Operation,
        attempts: u32,
        duration_seconds: f64,
        hash: String,
    },
    OperationFailed {
        stack: String,
        resource: String,
        attempts: u32,
        error: String,
    },
    OperationSkipped {
        stack: String,
        resource: String,
        reason: SkipReason,
    },
    ApplyCompleted {
        stack: String,
        run_id: String,
        succeeded: u32,
        failed: u32,
        skipped: u32,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

// ============================================================================
// Template helper
// ============================================================================

/// Render a parameter value for template substitution.
pub fn value_to_template_string(val: &serde_json::Value) -> String {
    match val {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
