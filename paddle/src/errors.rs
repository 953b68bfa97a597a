//! Error types for paddle.
//!
//! Every failure the engine can surface is one of a small number of
//! categories: object-store failures, transfer failures, cluster API
//! failures and step lifecycle failures. Conditions that reconciliation
//! treats as benign (a delete that finds nothing) are classified here but
//! recovered by the caller, never surfaced.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for paddle operations.
#[derive(Debug, Error)]
pub enum PaddleError {
    /// A staged transfer failed.
    #[error("{0}")]
    Transfer(#[from] TransferError),

    /// A cluster API call failed.
    #[error("{0}")]
    Cluster(#[from] ClusterError),

    /// A pipeline step failed.
    #[error("{0}")]
    Step(#[from] StepError),

    /// A manifest could not be rendered or decoded.
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_yaml::Error> for PaddleError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Manifest(err.to_string())
    }
}

/// Errors returned by an object store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The requested object does not exist.
    #[error("Object not found: s3://{bucket}/{key}")]
    NotFound {
        /// The bucket.
        bucket: String,
        /// The key.
        key: String,
    },

    /// The store rejected or failed the request.
    #[error("Object store request failed for s3://{bucket}/{key}: {message}")]
    Request {
        /// The bucket.
        bucket: String,
        /// The key or prefix.
        key: String,
        /// The underlying message.
        message: String,
    },

    /// Reading an object body failed mid-stream.
    #[error("Error reading s3://{bucket}/{key}: {message}")]
    Read {
        /// The bucket.
        bucket: String,
        /// The key.
        key: String,
        /// The underlying message.
        message: String,
    },
}

impl StoreError {
    /// Creates a request error.
    #[must_use]
    pub fn request(bucket: impl Into<String>, key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Request {
            bucket: bucket.into(),
            key: key.into(),
            message: message.into(),
        }
    }

    /// Creates a not found error.
    #[must_use]
    pub fn not_found(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

/// Errors raised by the staged transfer engine.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Explicitly requested keys are absent from the listing.
    #[error("Keys not found under {prefix}: {}", keys.join(", "))]
    MissingKeys {
        /// The resolved prefix that was listed.
        prefix: String,
        /// Every requested key that was absent.
        keys: Vec<String>,
    },

    /// The HEAD pointer could not be read.
    #[error("Error reading HEAD at s3://{bucket}/{path}: {source}")]
    Head {
        /// The bucket.
        bucket: String,
        /// The HEAD path.
        path: String,
        /// The underlying store error.
        #[source]
        source: StoreError,
    },

    /// A store operation failed after retries were exhausted.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Writing or reading a local file failed.
    #[error("Local file error at {}: {source}", path.display())]
    Local {
        /// The local path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A remote key does not map to a file under the destination.
    #[error("Key {key} escapes the destination directory")]
    UnsafeKey {
        /// The offending remote key.
        key: String,
    },

    /// The commit source is missing or not a directory.
    #[error("Path {} must be an existing directory", .0.display())]
    NotADirectory(PathBuf),

    /// The transfer was cancelled before it finished.
    #[error("Transfer cancelled: {0}")]
    Cancelled(String),

    /// A transfer task panicked or was aborted.
    #[error("Transfer task failed: {0}")]
    Task(String),
}

impl TransferError {
    /// Returns true for failures worth another attempt: store requests
    /// and body reads. Local file, key and cancellation errors are final.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Head { .. })
    }

    /// Wraps an IO error with the path it happened at.
    #[must_use]
    pub fn local(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Local {
            path: path.into(),
            source,
        }
    }
}

/// Errors returned by the cluster API.
#[derive(Debug, Clone, Error)]
pub enum ClusterError {
    /// The resource does not exist.
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind (e.g. "pod").
        kind: String,
        /// Resource name.
        name: String,
    },

    /// The API refused access to the resource.
    #[error("{kind} {name} forbidden: {message}")]
    Forbidden {
        /// Resource kind.
        kind: String,
        /// Resource name.
        name: String,
        /// The API message.
        message: String,
    },

    /// Any other API failure.
    #[error("Cluster API error ({code}): {message}")]
    Api {
        /// HTTP-like status code, 0 when unknown.
        code: u16,
        /// The API message.
        message: String,
    },

    /// A watch or log stream could not be opened or broke.
    #[error("Stream error: {0}")]
    Stream(String),
}

impl ClusterError {
    /// Creates a not found error.
    #[must_use]
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Creates a forbidden error.
    #[must_use]
    pub fn forbidden(kind: impl Into<String>, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Forbidden {
            kind: kind.into(),
            name: name.into(),
            message: message.into(),
        }
    }

    /// Creates a generic API error.
    #[must_use]
    pub fn api(code: u16, message: impl Into<String>) -> Self {
        Self::Api {
            code,
            message: message.into(),
        }
    }

    /// Returns true for a "not found" outcome.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true for a "forbidden" outcome.
    #[must_use]
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Forbidden { .. })
    }
}

/// Why a step failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepFailure {
    /// A container exited with a non-zero code.
    #[error("container exited with error: {message}")]
    ContainerFailed {
        /// The termination message.
        message: String,
    },

    /// The pod reached the Failed phase without container attribution.
    #[error("pod failed")]
    PodFailed,

    /// The pod disappeared while the step was running.
    #[error("pod was deleted unexpectedly")]
    DeletedExternally,

    /// No container started before the start timeout.
    #[error("timed out waiting for pod to start, cluster might not have sufficient resources{}", detail.as_ref().map(|d| format!(" ({d})")).unwrap_or_default())]
    StartTimeout {
        /// Waiting reason reported by the cluster, if any.
        detail: Option<String>,
    },

    /// The watch ended before any terminal event.
    #[error("pod event channel closed unexpectedly")]
    WatchClosed,

    /// A container's log stream could not be opened.
    #[error("error opening log stream: {0}")]
    LogStream(String),

    /// The previous pod could not be removed in time.
    #[error("timed out after {seconds}s waiting for previous pod to be deleted")]
    ReconcileTimeout {
        /// The configured timeout.
        seconds: u64,
    },

    /// The step was cancelled from outside.
    #[error("step cancelled: {0}")]
    Cancelled(String),
}

/// A failed step, naming the step, the container (if any) and the cause.
#[derive(Debug, Clone, Error)]
#[error("step {step} failed{}: {failure}", container.as_ref().map(|c| format!(" in container {c}")).unwrap_or_default())]
pub struct StepError {
    /// The step name.
    pub step: String,
    /// The pod running the step.
    pub pod: String,
    /// The container responsible, if known.
    pub container: Option<String>,
    /// The failure cause.
    pub failure: StepFailure,
}

impl StepError {
    /// Creates a step error without container attribution.
    #[must_use]
    pub fn new(step: impl Into<String>, pod: impl Into<String>, failure: StepFailure) -> Self {
        Self {
            step: step.into(),
            pod: pod.into(),
            container: None,
            failure,
        }
    }

    /// Attributes the failure to a container.
    #[must_use]
    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = PaddleError> = std::result::Result<T, E>;
