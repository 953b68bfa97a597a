//! Logical store locations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved path segment naming a pointer to the latest snapshot.
pub const HEAD: &str = "HEAD";

/// A bucket and a logical path inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferTarget {
    /// The bucket name.
    pub bucket: String,
    /// The logical path, `/`-separated.
    pub path: String,
}

impl TransferTarget {
    /// Creates a target.
    #[must_use]
    pub fn new(bucket: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            path: path.into(),
        }
    }

    /// Returns the last path segment.
    #[must_use]
    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }

    /// Returns everything before the last path segment.
    #[must_use]
    pub fn dirname(&self) -> &str {
        self.path.rsplit_once('/').map_or("", |(dir, _)| dir)
    }

    /// Returns true if the path names a HEAD pointer.
    #[must_use]
    pub fn is_head(&self) -> bool {
        self.basename() == HEAD
    }

    /// Returns the path as a listing prefix, with a trailing separator.
    #[must_use]
    pub fn as_prefix(&self) -> String {
        if self.path.ends_with('/') {
            self.path.clone()
        } else {
            format!("{}/", self.path)
        }
    }

    /// Returns the key of the HEAD pointer below this path.
    #[must_use]
    pub fn head_key(&self) -> String {
        format!("{}/{HEAD}", self.path.trim_end_matches('/'))
    }

    /// Returns a copy pointing at `path` in the same bucket.
    #[must_use]
    pub fn with_path(&self, path: impl Into<String>) -> Self {
        Self::new(self.bucket.clone(), path)
    }
}

impl fmt::Display for TransferTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.path)
    }
}
