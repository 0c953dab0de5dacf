//! depsync core library.
//!
//! This crate provides the engine that keeps git-sourced `pub` dependencies
//! in sync with upstream: project discovery, lock parsing, remote ref
//! queries, staleness detection, manifest backups, dependency installation
//! with conflict classification, and the step-driven sync engine.

pub mod backup;
pub mod config;
pub mod conflict;
pub mod errors;
pub mod git;
pub mod installer;
pub mod lock;
pub mod models;
pub mod process;
pub mod project;
pub mod service;
pub mod staleness;
pub mod sync_engine;

// Re-exports for convenience.
pub use config::DepsyncConfig;
pub use models::{ActionResult, BackupRecord, GitDependency, PackageSpec};
pub use project::Project;
pub use service::DepSync;
pub use sync_engine::SyncEngine;
