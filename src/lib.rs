//! qtlflow — declarative QTL analysis pipelines.
//!
//! Tasks declared in YAML, parameters from layered INI/TOML files,
//! make-style freshness from file timestamps, results loaded into SQLite.

pub mod cli;
pub mod core;
pub mod transport;
