//! Committing a local directory as a new versioned snapshot.

use super::{Transfer, TransferTarget};
use crate::errors::TransferError;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

impl Transfer {
    /// Uploads every file under `source` to a fresh snapshot below
    /// `destination`, then points `destination/HEAD` at it.
    ///
    /// HEAD is written only once every upload has succeeded, so readers
    /// following it never observe a partial snapshot. Returns the snapshot
    /// key.
    pub async fn commit(
        &self,
        source: &Path,
        destination: &TransferTarget,
    ) -> Result<String, TransferError> {
        let metadata = tokio::fs::metadata(source)
            .await
            .map_err(|_| TransferError::NotADirectory(source.to_path_buf()))?;
        if !metadata.is_dir() {
            return Err(TransferError::NotADirectory(source.to_path_buf()));
        }

        let files = list_files(source.to_path_buf()).await?;
        let suffix = hex::encode(rand::random::<[u8; 8]>());
        let snapshot = commit_key(&destination.path, Utc::now(), &suffix);
        info!(
            bucket = %destination.bucket,
            snapshot = %snapshot,
            files = files.len(),
            "Committing directory"
        );

        let bucket = destination.bucket.clone();
        self.admit_all(files, |(path, relative), abort| {
            let transfer = self.clone();
            let bucket = bucket.clone();
            let key = format!("{snapshot}/{relative}");
            async move {
                let body = tokio::fs::read(&path)
                    .await
                    .map_err(|e| TransferError::local(&path, e))?;
                transfer
                    .retrying(&abort, &key, || {
                        let body = body.clone();
                        let store = transfer.store.clone();
                        let bucket = bucket.clone();
                        let key = key.clone();
                        async move { Ok(store.put_object(&bucket, &key, body).await?) }
                    })
                    .await?;
                debug!(file = %path.display(), key = %key, "File uploaded");
                Ok(())
            }
        })
        .await?;

        let head = destination.head_key();
        self.retrying(&self.cancel_token, &head, || {
            let store = self.store.clone();
            let bucket = bucket.clone();
            let head = head.clone();
            let body = snapshot.clone().into_bytes();
            async move { Ok(store.put_object(&bucket, &head, body).await?) }
        })
        .await?;

        info!(bucket = %destination.bucket, head = %head, snapshot = %snapshot, "HEAD updated");
        Ok(snapshot)
    }
}

/// Builds the snapshot key `{path}/{yyyy}/{mm}/{dd}/{HHMM}_{suffix}`.
#[must_use]
pub fn commit_key(path: &str, now: DateTime<Utc>, suffix: &str) -> String {
    format!(
        "{}/{}_{suffix}",
        path.trim_end_matches('/'),
        now.format("%Y/%m/%d/%H%M")
    )
}

/// Lists regular files below `root` with their `/`-separated relative paths.
async fn list_files(root: PathBuf) -> Result<Vec<(PathBuf, String)>, TransferError> {
    let walk_root = root.clone();
    tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        for entry in WalkDir::new(&walk_root) {
            let entry = entry.map_err(|e| {
                let path = e.path().map_or_else(|| walk_root.clone(), Path::to_path_buf);
                TransferError::local(path, e.into())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&walk_root)
                .unwrap_or_else(|_| entry.path())
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            files.push((entry.into_path(), relative));
        }
        Ok(files)
    })
    .await
    .map_err(|e| TransferError::Task(format!("listing {}: {e}", root.display())))?
}
