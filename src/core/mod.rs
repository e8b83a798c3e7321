//! Core engine: resource model, graph, diff, planning and execution.

pub mod diff;
pub mod error;
pub mod executor;
pub mod graph;
pub mod parser;
pub mod planner;
pub mod resolver;
pub mod retry;
pub mod types;
