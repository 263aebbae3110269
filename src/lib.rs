//! Multi-ecosystem dependency tree resolution and scan orchestration.
//!
//! Detection ([`detector`]) finds the working directories of every supported
//! package manager. An adapter per technology ([`technologies`]) rebuilds the
//! full dependency trees, [`graph`] flattens them for the remote scanner
//! ([`scan`]) and maps findings back onto the trees as impact paths.
//! [`orchestrator`] ties the steps together per (technology, directory) pair.

pub mod command;
pub mod config;
pub mod curation;
pub mod detector;
pub mod error;
pub mod graph;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod report;
pub mod resolver;
pub mod scan;
pub mod technologies;
