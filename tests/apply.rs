//! End-to-end apply scenarios against in-memory providers and every state backend.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strata::core::error::{ExecError, PlanError, ProviderError};
use strata::core::executor::{apply, ApplyOptions, CancelToken};
use strata::core::graph::ImportedStacks;
use strata::core::parser;
use strata::core::planner::plan_stack;
use strata::core::types::*;
use strata::provenance::eventlog;
use strata::provider::memory::{CallJournal, CallKind, MemoryProvider};
use strata::provider::{Created, ProviderRegistry, ResourceProvider};
use strata::state::{FileStateStore, MemoryStateStore, SqliteStateStore, StateStore};

const ATTRIBUTES: &[&str] = &["uri", "dns_name", "domain", "task_role"];

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Fixture {
    journal: CallJournal,
    providers: ProviderRegistry,
    memory: BTreeMap<ResourceKind, Arc<MemoryProvider>>,
}

impl Fixture {
    fn new(kinds: &[ResourceKind]) -> Self {
        init_tracing();
        let journal = CallJournal::new();
        let mut providers = ProviderRegistry::new();
        let mut memory = BTreeMap::new();
        for kind in kinds {
            let provider = Arc::new(
                MemoryProvider::new(kind.clone(), journal.clone()).with_attributes(ATTRIBUTES),
            );
            providers.register(kind.clone(), provider.clone());
            memory.insert(kind.clone(), provider);
        }
        Self {
            journal,
            providers,
            memory,
        }
    }

    fn provider(&self, kind: ResourceKind) -> &MemoryProvider {
        &self.memory[&kind]
    }
}

fn options() -> ApplyOptions {
    let mut options = ApplyOptions::default();
    options.retry = RetryPolicy {
        max_attempts: 4,
        initial_backoff_ms: 1,
        max_backoff_ms: 4,
    };
    options
}

async fn plan_and_apply(
    stack: &Stack,
    store: &dyn StateStore,
    providers: &ProviderRegistry,
    options: &ApplyOptions,
) -> ApplyReport {
    let state = store.load(&stack.name).unwrap();
    let imports = ImportedStacks::new();
    let prepared = plan_stack(stack, &state, &imports).unwrap();
    apply(&prepared, &imports, providers, store, options)
        .await
        .unwrap()
}

fn chain() -> Stack {
    Stack::new("s")
        .with_resource(Resource::new("Vpc", ResourceKind::Network).with("name", "vpc"))
        .with_resource(
            Resource::new("Cluster", ResourceKind::Cluster)
                .with("name", "cluster")
                .with_ref("vpc", "Vpc", "id"),
        )
        .with_resource(
            Resource::new("Service", ResourceKind::Service)
                .with("name", "service")
                .with_ref("cluster", "Cluster", "arn"),
        )
}

const CHAIN_KINDS: &[ResourceKind] = &[
    ResourceKind::Network,
    ResourceKind::Cluster,
    ResourceKind::Service,
];

fn status<'a>(report: &'a ApplyReport, id: &str) -> &'a StepStatus {
    &report.outcome(id).unwrap().status
}

// ---------------------------------------------------------------------------
// Ordering and concurrency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_apply_single_slot_runs_in_dependency_order() {
    let fx = Fixture::new(CHAIN_KINDS);
    let store = MemoryStateStore::new();
    let mut opts = options();
    opts.max_in_flight = 1;

    let report = plan_and_apply(&chain(), &store, &fx.providers, &opts).await;
    assert!(report.is_success());
    assert_eq!(
        fx.journal.subjects(CallKind::Create),
        vec!["vpc", "cluster", "service"]
    );
    let service = &store.load("s").unwrap().records["Service"];
    assert_eq!(
        service.outputs["cluster"],
        serde_json::json!("arn:strata:cluster:cluster-0001")
    );
}

/// Creates block on a shared barrier, so they only finish if dispatched together.
struct BarrierProvider {
    barrier: tokio::sync::Barrier,
    next: AtomicU64,
}

#[async_trait]
impl ResourceProvider for BarrierProvider {
    async fn create(&self, _properties: &Properties) -> Result<Created, ProviderError> {
        self.barrier.wait().await;
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        Ok(Created {
            provider_id: format!("b-{n}"),
            outputs: Outputs::new(),
        })
    }

    async fn update(&self, _id: &str, _properties: &Properties) -> Result<Outputs, ProviderError> {
        Ok(Outputs::new())
    }

    async fn delete(&self, _id: &str) -> Result<(), ProviderError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_apply_independent_roots_run_concurrently() {
    init_tracing();
    let provider = Arc::new(BarrierProvider {
        barrier: tokio::sync::Barrier::new(2),
        next: AtomicU64::new(0),
    });
    let providers = ProviderRegistry::new().with(ResourceKind::Bucket, provider);
    let stack = Stack::new("s")
        .with_resource(Resource::new("Left", ResourceKind::Bucket))
        .with_resource(Resource::new("Right", ResourceKind::Bucket));
    let store = MemoryStateStore::new();

    let opts = options();
    let run = plan_and_apply(&stack, &store, &providers, &opts);
    let report = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("both roots must be in flight at once");
    assert!(report.is_success());
}

/// Tracks how many creates are in flight at once.
#[derive(Default)]
struct GaugeProvider {
    current: AtomicUsize,
    peak: AtomicUsize,
    next: AtomicU64,
}

#[async_trait]
impl ResourceProvider for GaugeProvider {
    async fn create(&self, _properties: &Properties) -> Result<Created, ProviderError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        Ok(Created {
            provider_id: format!("g-{n}"),
            outputs: Outputs::new(),
        })
    }

    async fn update(&self, _id: &str, _properties: &Properties) -> Result<Outputs, ProviderError> {
        Ok(Outputs::new())
    }

    async fn delete(&self, _id: &str) -> Result<(), ProviderError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_apply_respects_max_in_flight() {
    init_tracing();
    let gauge = Arc::new(GaugeProvider::default());
    let providers = ProviderRegistry::new().with(ResourceKind::Bucket, gauge.clone());
    let mut stack = Stack::new("s");
    for i in 0..6 {
        stack = stack.with_resource(Resource::new(format!("B{i}"), ResourceKind::Bucket));
    }
    let mut opts = options();
    opts.max_in_flight = 2;

    let report = plan_and_apply(&stack, &MemoryStateStore::new(), &providers, &opts).await;
    assert!(report.is_success());
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
}

// ---------------------------------------------------------------------------
// Failures, retries and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_apply_transient_errors_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let fx = Fixture::new(&[ResourceKind::Network]);
    let network = fx.provider(ResourceKind::Network);
    network.fail_next(ProviderError::Transient("throttled".into()));
    network.fail_next(ProviderError::Transient("throttled".into()));
    let stack = Stack::new("s").with_resource(Resource::new("Vpc", ResourceKind::Network));

    let opts = options().with_event_log(dir.path());
    let report = plan_and_apply(&stack, &MemoryStateStore::new(), &fx.providers, &opts).await;
    assert!(report.is_success());
    assert_eq!(report.outcome("Vpc").unwrap().attempts, 3);
    assert_eq!(network.live(), 1);

    let retried = eventlog::read_events(dir.path(), "s")
        .unwrap()
        .into_iter()
        .filter(|e| matches!(e.event, ProvenanceEvent::OperationRetried { .. }))
        .count();
    assert_eq!(retried, 2);
}

#[tokio::test]
async fn test_apply_exhausted_retries_fail_the_step() {
    let fx = Fixture::new(&[ResourceKind::Network]);
    for _ in 0..4 {
        fx.provider(ResourceKind::Network)
            .fail_next(ProviderError::Transient("throttled".into()));
    }
    let stack = Stack::new("s").with_resource(Resource::new("Vpc", ResourceKind::Network));
    let store = MemoryStateStore::new();

    let report = plan_and_apply(&stack, &store, &fx.providers, &options()).await;
    let outcome = report.outcome("Vpc").unwrap();
    assert_eq!(outcome.attempts, 4);
    match &outcome.status {
        StepStatus::Failed { error } => assert!(error.contains("after 4 attempt(s)"), "{error}"),
        other => panic!("unexpected {other:?}"),
    }
    let state = store.load("s").unwrap();
    assert!(state.records.is_empty());
    assert!(state.lease.is_none());
}

#[tokio::test]
async fn test_apply_permanent_failure_skips_dependents_only() {
    let mut kinds = CHAIN_KINDS.to_vec();
    kinds.push(ResourceKind::Bucket);
    let fx = Fixture::new(&kinds);
    fx.provider(ResourceKind::Network)
        .fail_next(ProviderError::Permanent("quota exceeded".into()));
    let stack = chain().with_resource(Resource::new("Bucket", ResourceKind::Bucket));
    let store = MemoryStateStore::new();

    let report = plan_and_apply(&stack, &store, &fx.providers, &options()).await;
    assert_eq!(report.outcome("Vpc").unwrap().attempts, 1);
    assert!(matches!(status(&report, "Vpc"), StepStatus::Failed { error } if error.contains("quota exceeded")));
    assert_eq!(
        status(&report, "Cluster"),
        &StepStatus::Skipped {
            reason: SkipReason::DependencyFailed {
                dependency: "Vpc".into()
            }
        }
    );
    assert_eq!(
        status(&report, "Service"),
        &StepStatus::Skipped {
            reason: SkipReason::DependencyFailed {
                dependency: "Cluster".into()
            }
        }
    );
    assert_eq!(report.succeeded(), vec!["Bucket"]);
    assert_eq!(fx.journal.count(CallKind::Create), 2);

    let records = store.load("s").unwrap().records;
    assert_eq!(records.keys().collect::<Vec<_>>(), vec!["Bucket"]);
}

#[tokio::test]
async fn test_apply_stop_on_first_halts_dispatch() {
    let fx = Fixture::new(&[ResourceKind::Bucket]);
    fx.provider(ResourceKind::Bucket)
        .fail_next(ProviderError::Permanent("denied".into()));
    let stack = Stack::new("s")
        .with_resource(Resource::new("A", ResourceKind::Bucket))
        .with_resource(Resource::new("B", ResourceKind::Bucket))
        .with_resource(Resource::new("C", ResourceKind::Bucket));
    let mut opts = options();
    opts.max_in_flight = 1;
    opts.failure = FailurePolicy::StopOnFirst;

    let report = plan_and_apply(&stack, &MemoryStateStore::new(), &fx.providers, &opts).await;
    assert_eq!(report.failed(), vec!["A"]);
    for id in ["B", "C"] {
        assert_eq!(
            status(&report, id),
            &StepStatus::Skipped {
                reason: SkipReason::Stopped
            }
        );
    }
    assert_eq!(fx.journal.len(), 1);
}

#[tokio::test]
async fn test_apply_stop_on_first_keeps_skip_causes_apart() {
    let fx = Fixture::new(&[ResourceKind::Bucket]);
    fx.provider(ResourceKind::Bucket)
        .fail_next(ProviderError::Permanent("denied".into()));
    let stack = Stack::new("s")
        .with_resource(Resource::new("A", ResourceKind::Bucket))
        .with_resource(Resource::new("B", ResourceKind::Bucket))
        .with_resource(Resource::new("C", ResourceKind::Bucket).depends_on("B"))
        .with_resource(Resource::new("D", ResourceKind::Bucket).depends_on("A"));
    let mut opts = options();
    opts.max_in_flight = 1;
    opts.failure = FailurePolicy::StopOnFirst;

    let report = plan_and_apply(&stack, &MemoryStateStore::new(), &fx.providers, &opts).await;
    assert_eq!(report.failed(), vec!["A"]);
    assert_eq!(
        status(&report, "D"),
        &StepStatus::Skipped {
            reason: SkipReason::DependencyFailed {
                dependency: "A".into()
            }
        }
    );
    for id in ["B", "C"] {
        assert_eq!(
            status(&report, id),
            &StepStatus::Skipped {
                reason: SkipReason::Stopped
            },
            "{id}"
        );
    }
    assert_eq!(fx.journal.len(), 1);
}

#[tokio::test]
async fn test_apply_cancelled_before_start_skips_everything() {
    let fx = Fixture::new(CHAIN_KINDS);
    let cancel = CancelToken::new();
    cancel.cancel();
    let opts = options().with_cancel(cancel);

    let store = MemoryStateStore::new();
    let report = plan_and_apply(&chain(), &store, &fx.providers, &opts).await;
    assert_eq!(report.skipped().len(), 3);
    assert!(report.outcomes.iter().all(|o| o.status
        == StepStatus::Skipped {
            reason: SkipReason::Cancelled
        }));
    assert!(fx.journal.is_empty());
    assert!(store.load("s").unwrap().lease.is_none());
}

/// Cancels the apply from inside its first create.
struct CancellingProvider {
    inner: MemoryProvider,
    cancel: CancelToken,
}

#[async_trait]
impl ResourceProvider for CancellingProvider {
    async fn create(&self, properties: &Properties) -> Result<Created, ProviderError> {
        self.cancel.cancel();
        self.inner.create(properties).await
    }

    async fn update(&self, id: &str, properties: &Properties) -> Result<Outputs, ProviderError> {
        self.inner.update(id, properties).await
    }

    async fn delete(&self, id: &str) -> Result<(), ProviderError> {
        self.inner.delete(id).await
    }
}

#[tokio::test]
async fn test_apply_cancel_lets_in_flight_finish() {
    init_tracing();
    let journal = CallJournal::new();
    let cancel = CancelToken::new();
    let provider = CancellingProvider {
        inner: MemoryProvider::new(ResourceKind::Bucket, journal.clone()),
        cancel: cancel.clone(),
    };
    let providers = ProviderRegistry::new().with(ResourceKind::Bucket, Arc::new(provider));
    let stack = Stack::new("s")
        .with_resource(Resource::new("A", ResourceKind::Bucket))
        .with_resource(Resource::new("B", ResourceKind::Bucket));
    let mut opts = options().with_cancel(cancel);
    opts.max_in_flight = 1;

    let store = MemoryStateStore::new();
    let report = plan_and_apply(&stack, &store, &providers, &opts).await;
    assert_eq!(report.succeeded(), vec!["A"]);
    assert_eq!(
        status(&report, "B"),
        &StepStatus::Skipped {
            reason: SkipReason::Cancelled
        }
    );
    assert!(store.load("s").unwrap().records.contains_key("A"));
}

// ---------------------------------------------------------------------------
// Re-apply, updates and deletes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_apply_twice_is_idempotent() {
    let fx = Fixture::new(CHAIN_KINDS);
    let store = MemoryStateStore::new();
    plan_and_apply(&chain(), &store, &fx.providers, &options()).await;
    let calls = fx.journal.len();
    let version = store.load("s").unwrap().version;

    let state = store.load("s").unwrap();
    let prepared = plan_stack(&chain(), &state, &ImportedStacks::new()).unwrap();
    assert!(!prepared.plan.has_changes());

    let report = plan_and_apply(&chain(), &store, &fx.providers, &options()).await;
    assert!(report.is_success());
    assert!(report.outcomes.iter().all(|o| o.attempts == 0));
    assert_eq!(fx.journal.len(), calls);
    assert_eq!(store.load("s").unwrap().version, version);
}

#[tokio::test]
async fn test_apply_update_keeps_provider_id() {
    let fx = Fixture::new(CHAIN_KINDS);
    let store = MemoryStateStore::new();
    plan_and_apply(&chain(), &store, &fx.providers, &options()).await;
    let before = store.load("s").unwrap().records["Cluster"].clone();

    let mut changed = chain();
    changed.resources[1] = Resource::new("Cluster", ResourceKind::Cluster)
        .with("name", "cluster-v2")
        .with_ref("vpc", "Vpc", "id");
    let state = store.load("s").unwrap();
    let prepared = plan_stack(&changed, &state, &ImportedStacks::new()).unwrap();
    let step = prepared.plan.step("Cluster").unwrap();
    assert_eq!(step.operation, Operation::Update);
    assert_eq!(step.changed_keys, vec!["name"]);

    let report = apply(
        &prepared,
        &ImportedStacks::new(),
        &fx.providers,
        &store,
        &options(),
    )
    .await
    .unwrap();
    assert!(report.is_success());
    assert_eq!(fx.journal.subjects(CallKind::Update), vec!["cluster-v2"]);

    let after = &store.load("s").unwrap().records["Cluster"];
    assert_eq!(after.provider_id, before.provider_id);
    assert_eq!(after.outputs["name"], serde_json::json!("cluster-v2"));
    assert_ne!(after.property_hash, before.property_hash);
}

#[tokio::test]
async fn test_apply_orphans_deleted_in_reverse_order() {
    let fx = Fixture::new(CHAIN_KINDS);
    let store = MemoryStateStore::new();
    plan_and_apply(&chain(), &store, &fx.providers, &options()).await;

    let report = plan_and_apply(&Stack::new("s"), &store, &fx.providers, &options()).await;
    assert!(report.is_success());
    assert_eq!(
        fx.journal.subjects(CallKind::Delete),
        vec!["service-0001", "cluster-0001", "network-0001"]
    );
    assert!(store.load("s").unwrap().records.is_empty());
    for kind in CHAIN_KINDS {
        assert_eq!(fx.provider(kind.clone()).live(), 0);
    }
}

#[tokio::test]
async fn test_apply_deletes_wait_for_creates() {
    let fx = Fixture::new(&[ResourceKind::Bucket, ResourceKind::Table]);
    let store = MemoryStateStore::new();
    let first = Stack::new("s").with_resource(Resource::new("Old", ResourceKind::Bucket).with("name", "old"));
    plan_and_apply(&first, &store, &fx.providers, &options()).await;

    let second = Stack::new("s").with_resource(Resource::new("New", ResourceKind::Table).with("name", "new"));
    let report = plan_and_apply(&second, &store, &fx.providers, &options()).await;
    assert!(report.is_success());
    let calls: Vec<CallKind> = fx.journal.entries().iter().map(|e| e.call).collect();
    assert_eq!(calls, vec![CallKind::Create, CallKind::Create, CallKind::Delete]);
}

#[tokio::test]
async fn test_apply_ensure_absent_blocked_then_allowed() {
    let fx = Fixture::new(CHAIN_KINDS);
    let store = MemoryStateStore::new();
    let two = Stack::new("s")
        .with_resource(Resource::new("Vpc", ResourceKind::Network))
        .with_resource(Resource::new("Cluster", ResourceKind::Cluster).with_ref("vpc", "Vpc", "id"));
    plan_and_apply(&two, &store, &fx.providers, &options()).await;
    let state = store.load("s").unwrap();

    let blocked = Stack::new("s")
        .with_resource(Resource::new("Vpc", ResourceKind::Network).absent())
        .with_resource(Resource::new("Cluster", ResourceKind::Cluster).with_ref("vpc", "Vpc", "id"));
    let err = plan_stack(&blocked, &state, &ImportedStacks::new()).unwrap_err();
    assert!(matches!(err, PlanError::DeleteBlocked { ref resource, .. } if resource == "Vpc"));

    let allowed = Stack::new("s")
        .with_resource(Resource::new("Vpc", ResourceKind::Network).absent())
        .with_resource(
            Resource::new("Cluster", ResourceKind::Cluster)
                .with_ref("vpc", "Vpc", "id")
                .absent(),
        );
    let report = plan_and_apply(&allowed, &store, &fx.providers, &options()).await;
    assert!(report.is_success());
    assert_eq!(
        fx.journal.subjects(CallKind::Delete),
        vec!["cluster-0001", "network-0001"]
    );
    assert!(store.load("s").unwrap().records.is_empty());
}

#[tokio::test]
async fn test_apply_retained_delete_only_forgets() {
    let fx = Fixture::new(&[ResourceKind::Bucket]);
    let store = MemoryStateStore::new();
    let stack = Stack::new("s").with_resource(
        Resource::new("WebBucket", ResourceKind::Bucket)
            .with("name", "web")
            .retained(),
    );
    plan_and_apply(&stack, &store, &fx.providers, &options()).await;
    let provider_id = store.load("s").unwrap().records["WebBucket"].provider_id.clone();

    // no bucket provider needed to forget a retained record
    let report = plan_and_apply(&Stack::new("s"), &store, &ProviderRegistry::new(), &options()).await;
    assert!(report.is_success());
    assert_eq!(fx.journal.count(CallKind::Delete), 0);
    assert!(fx.provider(ResourceKind::Bucket).contains(&provider_id));
    assert!(store.load("s").unwrap().records.is_empty());
}

// ---------------------------------------------------------------------------
// Lookups
// ---------------------------------------------------------------------------

fn repo_lookup() -> Stack {
    Stack::new("s").with_resource(
        Resource::lookup("Repository", ResourceKind::Repository).with("name", "simpletodo"),
    )
}

#[tokio::test]
async fn test_apply_lookup_adopts_existing() {
    let fx = Fixture::new(&[ResourceKind::Repository]);
    let seeded = fx.provider(ResourceKind::Repository).seed("simpletodo");
    let store = MemoryStateStore::new();

    let report = plan_and_apply(&repo_lookup(), &store, &fx.providers, &options()).await;
    assert!(report.is_success());
    assert_eq!(report.outcome("Repository").unwrap().operation, Operation::Lookup);
    let record = &store.load("s").unwrap().records["Repository"];
    assert!(record.adopted);
    assert_eq!(record.provider_id, seeded);
    assert_eq!(record.kind, ResourceKind::Repository);
    assert_eq!(fx.journal.count(CallKind::Create), 0);

    // adopted resources are never deleted at the provider
    plan_and_apply(&Stack::new("s"), &store, &fx.providers, &options()).await;
    assert_eq!(fx.journal.count(CallKind::Delete), 0);
    assert!(fx.provider(ResourceKind::Repository).contains(&seeded));
}

#[tokio::test]
async fn test_apply_lookup_creates_when_missing() {
    let fx = Fixture::new(&[ResourceKind::Repository]);
    let store = MemoryStateStore::new();

    let report = plan_and_apply(&repo_lookup(), &store, &fx.providers, &options()).await;
    assert!(report.is_success());
    assert_eq!(report.outcome("Repository").unwrap().attempts, 2);
    let record = &store.load("s").unwrap().records["Repository"];
    assert!(!record.adopted);
    assert_eq!(fx.journal.subjects(CallKind::Lookup), vec!["simpletodo"]);
    assert_eq!(fx.journal.subjects(CallKind::Create), vec!["simpletodo"]);
}

// ---------------------------------------------------------------------------
// State exclusivity and backends
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_apply_rejected_while_lease_held() {
    let fx = Fixture::new(CHAIN_KINDS);
    let store = MemoryStateStore::new();
    let held = store.begin_apply("s", 0).unwrap();

    let state = store.load("s").unwrap();
    let prepared = plan_stack(&chain(), &state, &ImportedStacks::new()).unwrap();
    let err = apply(&prepared, &ImportedStacks::new(), &fx.providers, &store, &options())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::State(ref e) if e.is_concurrent_apply()));
    assert!(fx.journal.is_empty());
    store.finish_apply(held).unwrap();
}

#[tokio::test]
async fn test_apply_stale_plan_rejected() {
    let fx = Fixture::new(CHAIN_KINDS);
    let store = MemoryStateStore::new();
    let state = store.load("s").unwrap();
    let stale = plan_stack(&chain(), &state, &ImportedStacks::new()).unwrap();
    plan_and_apply(&chain(), &store, &fx.providers, &options()).await;

    let err = apply(&stale, &ImportedStacks::new(), &fx.providers, &store, &options())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::StalePlan { planned: 0, actual: 3 }));
}

#[tokio::test]
async fn test_apply_missing_provider_rejected_up_front() {
    let fx = Fixture::new(&[ResourceKind::Network]);
    let store = MemoryStateStore::new();
    let state = store.load("s").unwrap();
    let prepared = plan_stack(&chain(), &state, &ImportedStacks::new()).unwrap();
    let err = apply(&prepared, &ImportedStacks::new(), &fx.providers, &store, &options())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::MissingProvider { ref kind, .. } if kind == "cluster"));
    assert!(fx.journal.is_empty());
}

async fn check_backend(store: &dyn StateStore) {
    let fx = Fixture::new(CHAIN_KINDS);
    let report = plan_and_apply(&chain(), store, &fx.providers, &options()).await;
    assert!(report.is_success());

    let state = store.load("s").unwrap();
    assert_eq!(state.version, 3);
    assert!(state.lease.is_none());
    assert_eq!(state.records["Service"].dependencies, vec!["Cluster"]);

    let prepared = plan_stack(&chain(), &state, &ImportedStacks::new()).unwrap();
    assert!(!prepared.plan.has_changes());
}

#[tokio::test]
async fn test_apply_with_file_store() {
    let dir = tempfile::tempdir().unwrap();
    check_backend(&FileStateStore::new(dir.path())).await;
    let reopened = FileStateStore::new(dir.path());
    assert_eq!(reopened.load("s").unwrap().records.len(), 3);
}

#[tokio::test]
async fn test_apply_with_sqlite_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("strata.db");
    check_backend(&SqliteStateStore::open(&path).unwrap()).await;
    let reopened = SqliteStateStore::open(&path).unwrap();
    assert_eq!(reopened.load("s").unwrap().records.len(), 3);
}

// ---------------------------------------------------------------------------
// Cross-stack imports
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_apply_binds_imported_outputs() {
    let fx = Fixture::new(CHAIN_KINDS);
    let store = MemoryStateStore::new();
    let network = Stack::new("network").with_resource(Resource::new("Vpc", ResourceKind::Network));
    plan_and_apply(&network, &store, &fx.providers, &options()).await;

    let mut app = Stack::new("app").with_resource(Resource::new("Cluster", ResourceKind::Cluster).with(
        "vpc",
        PropertyValue::Ref(OutputRef::imported("network", "Vpc", "id")),
    ));
    app.imports = vec!["network".to_string()];

    let imports = ImportedStacks::load(&store, &app.imports).unwrap();
    let state = store.load("app").unwrap();
    let prepared = plan_stack(&app, &state, &imports).unwrap();
    let report = apply(&prepared, &imports, &fx.providers, &store, &options())
        .await
        .unwrap();
    assert!(report.is_success());
    let cluster = &store.load("app").unwrap().records["Cluster"];
    assert_eq!(cluster.outputs["vpc"], serde_json::json!("network-0001"));
}

// ---------------------------------------------------------------------------
// Demo stack
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_apply_simple_todo_demo() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/simple-todo.yaml");
    let stack = parser::load_stack(&path).unwrap();
    let fx = Fixture::new(&[
        ResourceKind::Network,
        ResourceKind::Cluster,
        ResourceKind::Service,
        ResourceKind::LoadBalancer,
        ResourceKind::Repository,
        ResourceKind::Bucket,
        ResourceKind::Table,
        ResourceKind::BuildProject,
        ResourceKind::Pipeline,
        ResourceKind::Distribution,
    ]);
    let dir = tempfile::tempdir().unwrap();
    let store = FileStateStore::new(dir.path());
    let opts = ApplyOptions::from_policy(&stack.policy).with_event_log(dir.path());

    let report = plan_and_apply(&stack, &store, &fx.providers, &opts).await;
    assert!(report.is_success(), "{:?}", report.outcomes);
    assert_eq!(report.outcomes.len(), 12);

    let state = store.load(&stack.name).unwrap();
    assert_eq!(state.records.len(), 12);
    let service = &state.records["Service"];
    assert_eq!(service.outputs["name"], serde_json::json!("SimpleTodo-api"));
    assert_eq!(
        service.outputs["container"]["image"],
        serde_json::json!("uri:repository-0001")
    );
    let cdn = &state.records["Distribution"];
    assert_eq!(
        cdn.outputs["behaviors"]["/api/*"]["origin"],
        serde_json::json!("dns_name:load_balancer-0001")
    );

    let again = plan_stack(&stack, &state, &ImportedStacks::new()).unwrap();
    assert!(!again.plan.has_changes());

    let events = eventlog::read_events(dir.path(), &stack.name).unwrap();
    assert!(matches!(events.first().map(|e| &e.event), Some(ProvenanceEvent::ApplyStarted { .. })));
    assert!(matches!(events.last().map(|e| &e.event), Some(ProvenanceEvent::ApplyCompleted { succeeded: 12, .. })));
}
