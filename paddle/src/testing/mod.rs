//! Testing utilities for paddle.
//!
//! This module provides:
//! - A scripted in-memory cluster
//! - An object store wrapper that injects failures
//! - A fixed-text manifest renderer
//! - Pipeline fixtures

mod cluster;
mod fixtures;
mod renderer;
mod store;

pub use cluster::{ClusterCall, FakeCluster};
pub use fixtures::{pipeline, step, step_with_storage};
pub use renderer::StaticRenderer;
pub use store::FlakyObjectStore;
