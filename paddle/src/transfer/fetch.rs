//! Fetching a versioned path into a local directory.

use super::{Transfer, TransferTarget};
use crate::errors::{StoreError, TransferError};
use crate::store::{list_all, ObjectStore, ObjectSummary};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

const COPY_CHUNK: usize = 64 * 1024;

impl Transfer {
    /// Downloads every object under `source` into `destination`.
    ///
    /// A `HEAD` path is dereferenced once before listing. When `keys` is
    /// non-empty only `prefix + key` objects are fetched, and the whole
    /// operation fails without downloading anything if any of them is
    /// absent. Returns the local files written.
    pub async fn fetch(
        &self,
        source: &TransferTarget,
        keys: &[String],
        destination: &Path,
    ) -> Result<Vec<PathBuf>, TransferError> {
        let resolved = self.resolve(source).await?;
        let prefix = resolved.as_prefix();
        info!(
            bucket = %resolved.bucket,
            prefix = %prefix,
            destination = %destination.display(),
            "Copying objects"
        );

        let listing = list_all(self.store.as_ref(), &resolved.bucket, &prefix).await?;
        let selected = select_objects(&prefix, listing, keys)?;
        debug!(prefix = %prefix, count = selected.len(), "Objects selected");

        let planned = selected
            .into_iter()
            .map(|object| Ok((local_path(&prefix, &object.key, destination)?, object)))
            .collect::<Result<Vec<_>, TransferError>>()?;
        let bucket = resolved.bucket;

        self.admit_all(planned, |(target, object), abort| {
            let transfer = self.clone();
            let bucket = bucket.clone();
            async move {
                let bytes = transfer
                    .retrying(&abort, &object.key, || {
                        download(transfer.store.as_ref(), &bucket, &object.key, &target)
                    })
                    .await?;
                debug!(key = %object.key, file = %target.display(), bytes, "Object copied");
                Ok(target)
            }
        })
        .await
    }

    /// Dereferences a HEAD path; other paths are returned unchanged.
    pub async fn resolve(&self, source: &TransferTarget) -> Result<TransferTarget, TransferError> {
        if !source.is_head() {
            return Ok(source.clone());
        }

        let pointer = self
            .retrying(&self.cancel_token, &source.path, || {
                read_text(self.store.as_ref(), &source.bucket, &source.path)
            })
            .await
            .map_err(|e| match e {
                TransferError::Store(store_error) => TransferError::Head {
                    bucket: source.bucket.clone(),
                    path: source.path.clone(),
                    source: store_error,
                },
                other => other,
            })?;

        debug!(head = %source, resolved = %pointer, "HEAD resolved");
        Ok(source.with_path(pointer))
    }
}

/// Chooses which listed objects to fetch.
///
/// With no `keys`, every object except directory markers is selected.
/// Otherwise exactly the objects named `prefix + key` are selected, in the
/// order requested; any absent key fails the selection and every missing
/// key is named in the error.
pub fn select_objects(
    prefix: &str,
    listing: Vec<ObjectSummary>,
    keys: &[String],
) -> Result<Vec<ObjectSummary>, TransferError> {
    if keys.is_empty() {
        return Ok(listing
            .into_iter()
            .filter(|o| !o.is_directory_marker())
            .collect());
    }

    let mut by_key: HashMap<String, ObjectSummary> =
        listing.into_iter().map(|o| (o.key.clone(), o)).collect();
    let mut seen = HashSet::new();
    let mut selected = Vec::with_capacity(keys.len());
    let mut missing = Vec::new();

    for key in keys {
        if !seen.insert(key.as_str()) {
            continue;
        }
        let full_key = format!("{prefix}{key}");
        match by_key.remove(&full_key) {
            Some(object) if object.is_directory_marker() => {}
            Some(object) => selected.push(object),
            None => missing.push(key.clone()),
        }
    }

    if missing.is_empty() {
        Ok(selected)
    } else {
        Err(TransferError::MissingKeys {
            prefix: prefix.to_string(),
            keys: missing,
        })
    }
}

/// Maps a remote key to its local file under `destination`.
///
/// Empty segments are dropped. Any `.`, `..` or root segment fails with
/// [`TransferError::UnsafeKey`], so the file always lands inside
/// `destination`.
pub fn local_path(prefix: &str, key: &str, destination: &Path) -> Result<PathBuf, TransferError> {
    let relative = key.strip_prefix(prefix).unwrap_or(key);
    let mut path = destination.to_path_buf();
    for segment in relative.split('/').filter(|segment| !segment.is_empty()) {
        let mut components = Path::new(segment).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) if part == segment => path.push(part),
            _ => {
                return Err(TransferError::UnsafeKey {
                    key: key.to_string(),
                })
            }
        }
    }
    if path == destination {
        return Err(TransferError::UnsafeKey {
            key: key.to_string(),
        });
    }
    Ok(path)
}

async fn read_text(store: &dyn ObjectStore, bucket: &str, key: &str) -> Result<String, TransferError> {
    let mut body = store.get_object(bucket, key).await?;
    let mut buffer = Vec::new();
    body.read_to_end(&mut buffer)
        .await
        .map_err(|e| read_error(bucket, key, &e))?;
    String::from_utf8(buffer).map_err(|e| TransferError::Store(read_error(bucket, key, &e)))
}

/// Streams one object into `target`, recreating the file on every call.
///
/// Body read failures are store errors and may be retried; local create
/// and write failures are not.
async fn download(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    target: &Path,
) -> Result<u64, TransferError> {
    let mut body = store.get_object(bucket, key).await?;

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TransferError::local(parent, e))?;
    }
    let mut file = tokio::fs::File::create(target)
        .await
        .map_err(|e| TransferError::local(target, e))?;

    let mut buffer = vec![0u8; COPY_CHUNK];
    let mut bytes = 0u64;
    loop {
        let read = body
            .read(&mut buffer)
            .await
            .map_err(|e| read_error(bucket, key, &e))?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read])
            .await
            .map_err(|e| TransferError::local(target, e))?;
        bytes += read as u64;
    }
    file.flush()
        .await
        .map_err(|e| TransferError::local(target, e))?;
    Ok(bytes)
}

fn read_error(bucket: &str, key: &str, err: &dyn std::fmt::Display) -> StoreError {
    StoreError::Read {
        bucket: bucket.to_string(),
        key: key.to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;
    use crate::retry::RetryPolicy;
    use crate::store::{InMemoryObjectStore, MockObjectStore};
    use crate::testing::FlakyObjectStore;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    fn seeded_store() -> Arc<InMemoryObjectStore> {
        let store = InMemoryObjectStore::new().with_page_size(2);
        store.insert("bucket", "model/v1/master/HEAD", "model/v1/master/2024/01/02/1200_abcd");
        store.insert("bucket", "model/v1/master/2024/01/02/1200_abcd/", "");
        store.insert("bucket", "model/v1/master/2024/01/02/1200_abcd/a.csv", "a");
        store.insert("bucket", "model/v1/master/2024/01/02/1200_abcd/b.csv", "bb");
        store.insert("bucket", "model/v1/master/2024/01/02/1200_abcd/nested/c.bin", "ccc");
        store.insert("bucket", "model/v1/master/2023/12/31/0900_ffff/old.csv", "old");
        Arc::new(store)
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[test]
    fn test_select_all_skips_directory_markers() {
        let listing = vec![
            ObjectSummary::new("p/", 0),
            ObjectSummary::new("p/a", 1),
            ObjectSummary::new("p/d/", 0),
            ObjectSummary::new("p/d/b", 1),
        ];
        let selected = select_objects("p/", listing, &[]).unwrap();
        let selected: Vec<_> = selected.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(selected, vec!["p/a", "p/d/b"]);
    }

    #[test]
    fn test_select_explicit_keys_names_all_missing() {
        let listing = vec![ObjectSummary::new("p/a", 1), ObjectSummary::new("p/b", 1)];

        let selected = select_objects("p/", listing.clone(), &keys(&["b", "a", "b"])).unwrap();
        let selected: Vec<_> = selected.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(selected, vec!["p/b", "p/a"]);

        match select_objects("p/", listing, &keys(&["a", "x", "y"])) {
            Err(TransferError::MissingKeys { prefix, keys }) => {
                assert_eq!(prefix, "p/");
                assert_eq!(keys, vec!["x".to_string(), "y".to_string()]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_local_path_rerooting() {
        let dest = Path::new("/tmp/in");
        assert_eq!(
            local_path("p/", "p/a/b.csv", dest).unwrap(),
            dest.join("a").join("b.csv")
        );
        assert_eq!(local_path("p/", "p//x", dest).unwrap(), dest.join("x"));
    }

    #[test]
    fn test_local_path_rejects_escaping_keys() {
        let dest = Path::new("/tmp/in");
        for key in ["p/../../escaped.txt", "p/a/./b", "p/a/..", "p/"] {
            assert!(
                matches!(local_path("p/", key, dest), Err(TransferError::UnsafeKey { .. })),
                "{key} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_fetch_refuses_keys_outside_destination() {
        let root = tempfile::tempdir().unwrap();
        let destination = root.path().join("dest");
        let store = InMemoryObjectStore::new();
        store.insert("b", "data/ok.txt", "fine");
        store.insert("b", "data/../../escaped.txt", "escaped");
        let transfer = Transfer::new(Arc::new(store), TransferConfig::new());

        let err = transfer
            .fetch(&TransferTarget::new("b", "data"), &[], &destination)
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::UnsafeKey { ref key } if key == "data/../../escaped.txt"));
        assert!(!root.path().join("escaped.txt").exists());
        assert!(!destination.join("ok.txt").exists());
    }

    #[tokio::test]
    async fn test_fetch_head_downloads_latest_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let transfer = Transfer::new(seeded_store(), TransferConfig::new().with_concurrency(2));

        let files = transfer
            .fetch(&TransferTarget::new("bucket", "model/v1/master/HEAD"), &[], dir.path())
            .await
            .unwrap();

        assert_eq!(files.len(), 3);
        assert_eq!(read(&dir.path().join("a.csv")), "a");
        assert_eq!(read(&dir.path().join("b.csv")), "bb");
        assert_eq!(read(&dir.path().join("nested/c.bin")), "ccc");
        assert!(!dir.path().join("old.csv").exists());
    }

    #[tokio::test]
    async fn test_fetch_explicit_keys() {
        let dir = tempfile::tempdir().unwrap();
        let transfer = Transfer::new(seeded_store(), TransferConfig::new());

        let files = transfer
            .fetch(
                &TransferTarget::new("bucket", "model/v1/master/HEAD"),
                &keys(&["a.csv", "nested/c.bin"]),
                dir.path(),
            )
            .await
            .unwrap();

        assert_eq!(files.len(), 2);
        assert!(dir.path().join("a.csv").exists());
        assert!(!dir.path().join("b.csv").exists());
    }

    #[tokio::test]
    async fn test_fetch_missing_key_downloads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let transfer = Transfer::new(seeded_store(), TransferConfig::new());

        let err = transfer
            .fetch(
                &TransferTarget::new("bucket", "model/v1/master/HEAD"),
                &keys(&["a.csv", "missing.csv"]),
                dir.path(),
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("missing.csv"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_plain_path_is_not_dereferenced() {
        let dir = tempfile::tempdir().unwrap();
        let transfer = Transfer::new(seeded_store(), TransferConfig::new());

        let files = transfer
            .fetch(
                &TransferTarget::new("bucket", "model/v1/master/2023/12/31/0900_ffff"),
                &[],
                dir.path(),
            )
            .await
            .unwrap();

        assert_eq!(files, vec![dir.path().join("old.csv")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_produce_identical_files() {
        let dir = tempfile::tempdir().unwrap();
        let flaky = Arc::new(FlakyObjectStore::new(seeded_store(), 3));
        let transfer = Transfer::new(
            flaky.clone(),
            TransferConfig::new().with_retry(RetryPolicy::new().with_delay(Duration::from_secs(10))),
        );

        transfer
            .fetch(&TransferTarget::new("bucket", "model/v1/master/HEAD"), &[], dir.path())
            .await
            .unwrap();

        assert_eq!(read(&dir.path().join("b.csv")), "bb");
        assert_eq!(read(&dir.path().join("nested/c.bin")), "ccc");
        assert!(flaky.failures() >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_the_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MockObjectStore::new();
        store.expect_list_objects().returning(|_, prefix, _| {
            Ok(crate::store::ListPage {
                objects: vec![ObjectSummary::new(format!("{prefix}a"), 1)],
                next_continuation_token: None,
            })
        });
        store
            .expect_get_object()
            .times(3)
            .returning(|b, k| Err(StoreError::request(b, k, "503 slow down")));

        let transfer = Transfer::new(
            Arc::new(store),
            TransferConfig::new().with_retry(RetryPolicy::new().with_max_attempts(3)),
        );
        let err = transfer
            .fetch(&TransferTarget::new("bucket", "data"), &[], dir.path())
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Store(StoreError::Request { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_write_failure_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();

        let mut store = MockObjectStore::new();
        store.expect_list_objects().returning(|_, prefix, _| {
            Ok(crate::store::ListPage {
                objects: vec![ObjectSummary::new(format!("{prefix}a"), 1)],
                next_continuation_token: None,
            })
        });
        store
            .expect_get_object()
            .times(1)
            .returning(|_, _| Ok(Box::pin(std::io::Cursor::new(b"a".to_vec()))));

        let transfer = Transfer::new(Arc::new(store), TransferConfig::new());
        let started = tokio::time::Instant::now();
        let err = transfer
            .fetch(&TransferTarget::new("bucket", "data"), &[], &blocker.join("dest"))
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Local { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_head_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let transfer = Transfer::new(
            Arc::new(InMemoryObjectStore::new()),
            TransferConfig::new().with_retry(RetryPolicy::new().with_max_attempts(2)),
        );

        let err = transfer
            .fetch(&TransferTarget::new("bucket", "model/v1/master/HEAD"), &[], dir.path())
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Head { .. }));
    }
}
