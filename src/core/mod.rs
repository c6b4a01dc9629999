//! Core pipeline logic — definitions, configuration, naming, graph, planning, execution.

pub mod config;
pub mod error;
pub mod eventlog;
pub mod executor;
pub mod graph;
pub mod naming;
pub mod parser;
pub mod planner;
pub mod runner;
pub mod store;
pub mod template;
pub mod types;
