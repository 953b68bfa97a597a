//! Configuration types for transfers, pod watching and step runs.
//!
//! Every field has a serde default so a partial YAML document (or none at
//! all) yields a working configuration. Durations are expressed in seconds.

use crate::errors::{PaddleError, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for the staged transfer engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Maximum concurrent in-flight object transfers.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Retry policy for single-object fetches.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_concurrency() -> usize {
    100
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            retry: RetryPolicy::default(),
        }
    }
}

impl TransferConfig {
    /// Creates a new transfer configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the admission gate size.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Configuration for the pod event watcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Interval of the fallback status poll, in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: f64,
    /// Capacity of the watcher's output channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_poll_interval() -> f64 {
    30.0
}

fn default_channel_capacity() -> usize {
    64
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl WatchConfig {
    /// Creates a new watch configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_secs = interval.as_secs_f64();
        self
    }

    /// Returns the poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        secs(self.poll_interval_secs)
    }
}

/// Configuration for running pipeline steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Interval between delete attempts while reconciling, in seconds.
    #[serde(default = "default_delete_poll_interval")]
    pub delete_poll_interval_secs: f64,
    /// Maximum time to wait for a previous pod to disappear, in seconds.
    #[serde(default = "default_delete_timeout")]
    pub delete_timeout_secs: f64,
    /// Maximum time for the first container to start, in seconds.
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: f64,
    /// Grace period for trailing logs after a failure, in seconds.
    #[serde(default = "default_failure_log_grace")]
    pub failure_log_grace_secs: f64,
    /// Whether container logs are tailed.
    #[serde(default = "default_tail_logs")]
    pub tail_logs: bool,
    /// Run only the step with this name.
    #[serde(default)]
    pub step: Option<String>,
    /// Override the pipeline's default bucket.
    #[serde(default)]
    pub bucket: Option<String>,
    /// Override every step's image tag.
    #[serde(default)]
    pub image_tag: Option<String>,
    /// Branch the run is launched from; selects `global_env` entries.
    #[serde(default)]
    pub current_branch: Option<String>,
    /// Override every step's branch.
    #[serde(default)]
    pub step_branch: Option<String>,
    /// Override every step's version.
    #[serde(default)]
    pub step_version: Option<String>,
    /// Cascade branch/version overrides onto step inputs.
    #[serde(default)]
    pub override_inputs: bool,
}

fn default_delete_poll_interval() -> f64 {
    2.0
}

fn default_delete_timeout() -> f64 {
    120.0
}

fn default_start_timeout() -> f64 {
    600.0
}

fn default_failure_log_grace() -> f64 {
    3.0
}

fn default_tail_logs() -> bool {
    true
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            delete_poll_interval_secs: default_delete_poll_interval(),
            delete_timeout_secs: default_delete_timeout(),
            start_timeout_secs: default_start_timeout(),
            failure_log_grace_secs: default_failure_log_grace(),
            tail_logs: default_tail_logs(),
            step: None,
            bucket: None,
            image_tag: None,
            current_branch: None,
            step_branch: None,
            step_version: None,
            override_inputs: false,
        }
    }
}

impl RunConfig {
    /// Creates a new run configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the run to a single step.
    #[must_use]
    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    /// Overrides the pipeline bucket.
    #[must_use]
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Enables or disables log tailing.
    #[must_use]
    pub fn with_tail_logs(mut self, tail_logs: bool) -> Self {
        self.tail_logs = tail_logs;
        self
    }

    /// Sets the start timeout.
    #[must_use]
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout_secs = timeout.as_secs_f64();
        self
    }

    /// Sets the reconciliation poll interval and timeout.
    #[must_use]
    pub fn with_delete_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.delete_poll_interval_secs = interval.as_secs_f64();
        self.delete_timeout_secs = timeout.as_secs_f64();
        self
    }

    /// Sets the post-failure log grace period.
    #[must_use]
    pub fn with_failure_log_grace(mut self, grace: Duration) -> Self {
        self.failure_log_grace_secs = grace.as_secs_f64();
        self
    }

    /// Sets the image tag override.
    #[must_use]
    pub fn with_image_tag(mut self, tag: impl Into<String>) -> Self {
        self.image_tag = Some(tag.into());
        self
    }

    /// Sets the branch the run is launched from.
    #[must_use]
    pub fn with_current_branch(mut self, branch: impl Into<String>) -> Self {
        self.current_branch = Some(branch.into());
        self
    }

    /// Returns the branch used to select `global_env` entries: the
    /// launch branch, else the branch override.
    #[must_use]
    pub fn env_branch(&self) -> &str {
        self.current_branch
            .as_deref()
            .or(self.step_branch.as_deref())
            .unwrap_or_default()
    }

    /// Sets the branch override.
    #[must_use]
    pub fn with_step_branch(mut self, branch: impl Into<String>) -> Self {
        self.step_branch = Some(branch.into());
        self
    }

    /// Sets the version override.
    #[must_use]
    pub fn with_step_version(mut self, version: impl Into<String>) -> Self {
        self.step_version = Some(version.into());
        self
    }

    /// Sets whether overrides cascade onto inputs.
    #[must_use]
    pub fn with_override_inputs(mut self, override_inputs: bool) -> Self {
        self.override_inputs = override_inputs;
        self
    }

    /// Returns the reconciliation poll interval.
    #[must_use]
    pub fn delete_poll_interval(&self) -> Duration {
        secs(self.delete_poll_interval_secs)
    }

    /// Returns the reconciliation timeout.
    #[must_use]
    pub fn delete_timeout(&self) -> Duration {
        secs(self.delete_timeout_secs)
    }

    /// Returns the start timeout.
    #[must_use]
    pub fn start_timeout(&self) -> Duration {
        secs(self.start_timeout_secs)
    }

    /// Returns the post-failure log grace period.
    #[must_use]
    pub fn failure_log_grace(&self) -> Duration {
        secs(self.failure_log_grace_secs)
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaddleConfig {
    /// Transfer settings.
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Watcher settings.
    #[serde(default)]
    pub watch: WatchConfig,
    /// Run settings.
    #[serde(default)]
    pub run: RunConfig,
}

impl PaddleConfig {
    /// Parses a YAML configuration document.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| PaddleError::Config(e.to_string()))
    }

    /// Loads a YAML configuration file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| PaddleError::Config(format!("{}: {e}", path.display())))?;
        Self::from_yaml_str(&content)
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}
