//! Dependency conflict classification and resolution.
//!
//! The conflict subsystem is responsible for:
//! 1. **Analysis** -- recognizing conflict signatures in build tool output.
//! 2. **Resolution** -- applying a caller-chosen strategy to a conflicting install.

pub mod analyzer;
pub mod resolver;

pub use analyzer::{ConflictAnalysis, ConflictAnalyzer, ConflictMatcher, ConflictType, FailureKind, PubConflictMatcher};
pub use resolver::{add_dependency, ConflictResolver, Resolution};
