//! # Paddle
//!
//! Runs data pipeline steps as pods on a cluster, with versioned staging of
//! step inputs and outputs in an object store.
//!
//! Two engines make up the crate:
//!
//! - **Step orchestration**: reconcile any previous pod, provision a volume,
//!   submit the pod, watch it, tail its logs and classify the outcome
//! - **Staged transfer**: fetch a snapshot by resolving a `HEAD` pointer and
//!   commit a directory as a new snapshot, with bounded concurrency and
//!   retries
//!
//! Both talk to the outside world through capability traits
//! ([`cluster::ClusterClient`], [`store::ObjectStore`]) so that the
//! [`testing`] fakes can stand in for real services.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use paddle::prelude::*;
//!
//! let pipeline = PipelineDefinition::from_yaml_file("pipeline.yml")?;
//! let steps = StepRunner::new(cluster, renderer, WatchConfig::default(), RunConfig::default());
//! let report = PipelineRunner::new(steps)
//!     .run(&pipeline, |message| eprintln!("{message}"))
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod cluster;
pub mod config;
pub mod definition;
pub mod errors;
pub mod events;
pub mod observability;
pub mod orchestrator;
pub mod retry;
pub mod store;
pub mod testing;
pub mod transfer;
pub mod watch;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{CancellationToken, TaskGroup};
    pub use crate::cluster::{ClusterClient, DeletePolicy, PodPhase, PodSnapshot, RawPodEvent};
    pub use crate::config::{PaddleConfig, RunConfig, TransferConfig, WatchConfig};
    pub use crate::definition::{
        sanitize_name, JsonManifestRenderer, ManifestRenderer, PipelineDefinition, PodDefinition,
        Step, StepInput,
    };
    pub use crate::errors::{
        ClusterError, PaddleError, Result, StepError, StepFailure, StoreError, TransferError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::observability::{init_logging, LogFormat};
    pub use crate::orchestrator::{PipelineRunner, RunReport, StepRunner};
    pub use crate::retry::{BackoffStrategy, RetryPolicy};
    pub use crate::store::{InMemoryObjectStore, ObjectStore};
    pub use crate::transfer::{Transfer, TransferTarget};
    pub use crate::watch::{PodWatcher, WatchEvent, WatchEventKind};
}
