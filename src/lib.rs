//! Strata: declarative resource provisioning engine.
//!
//! A stack declares resources and the outputs they consume from each other.
//! Strata builds the dependency graph, diffs it against the last deployed
//! state, computes a deterministic plan and applies it with bounded
//! concurrency through pluggable async providers.
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use strata::core::{executor, graph::ImportedStacks, parser, planner};
//! use strata::provider::ProviderRegistry;
//! use strata::state::{FileStateStore, StateStore};
//!
//! let stack = parser::load_stack(std::path::Path::new("stack.yaml"))?;
//! let store = FileStateStore::new("state");
//! let imports = ImportedStacks::load(&store, &stack.imports)?;
//! let state = store.load(&stack.name)?;
//! let prepared = planner::plan_stack(&stack, &state, &imports)?;
//! println!("{}", prepared.plan);
//!
//! let providers = ProviderRegistry::new();
//! let options = executor::ApplyOptions::from_policy(&stack.policy);
//! let report = executor::apply(&prepared, &imports, &providers, &store, &options).await?;
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod provenance;
pub mod provider;
pub mod state;

pub use crate::core::error::{ExecError, ParseError, PlanError, ProviderError, StateError};
pub use crate::core::executor::{apply, dry_run, ApplyOptions, CancelToken};
pub use crate::core::planner::{plan_stack, PreparedStack};
pub use crate::core::types::{ApplyReport, Plan, Resource, Stack};
