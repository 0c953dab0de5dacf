//! Git operations for depsync.

pub mod client;
pub mod remote;

pub use client::{DiscoveredPackage, SourceCheckout};
pub use remote::{Git2Oracle, GitCliOracle, RemoteOracle};
