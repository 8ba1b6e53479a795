//! `PUT`-body staging and background uploads.
//!
//! A request body is streamed to `<cache_dir>/<key>` before any remote call
//! is made. The spool file doubles as the in-flight sentinel: a second `PUT`
//! for the same key while the file exists is reported as already staging. A
//! global pending-byte budget bounds how much staged data may be uploading
//! at once, and the whole tree is purged at startup and shutdown.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::breaker::{self, CircuitBreaker};
use crate::storage::{ObjectStore, StoreError};

// ---------------------------------------------------------------------------
// Staging outcome
// ---------------------------------------------------------------------------

pub enum StageOutcome {
    Staged(StagedBody),
    /// A spool file for the key already exists; an upload is in flight.
    AlreadyStaging,
}

pub struct StagedBody {
    pub path: PathBuf,
    pub size: u64,
    /// Body bytes retained in memory when the body stayed small enough for
    /// cache admission, so the router need not re-read the file.
    pub inline: Option<Bytes>,
}

// ---------------------------------------------------------------------------
// Spooler
// ---------------------------------------------------------------------------

pub struct UploadSpooler {
    root: PathBuf,
    max_pending_bytes: u64,
    pending: Mutex<u64>,
}

impl UploadSpooler {
    pub fn new(root: impl Into<PathBuf>, max_pending_upload_mb: u64) -> Self {
        Self {
            root: root.into(),
            max_pending_bytes: max_pending_upload_mb * 1024 * 1024,
            pending: Mutex::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The canonical spool path for a key. Key separators become directory
    /// separators under the spool root.
    pub fn spool_path(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }

    pub async fn ensure_root(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    /// Delete the entire spool tree. Called at startup (leftovers from a
    /// previous run are stale) and at shutdown.
    pub async fn purge_all(&self) -> std::io::Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    /// Stream a request body into the spool file for `key`.
    ///
    /// Bodies no larger than `inline_cap` are also accumulated in memory.
    /// On any error the partial spool file has already been removed.
    pub async fn stage<S, E>(
        &self,
        key: &str,
        mut body: S,
        inline_cap: u64,
    ) -> std::io::Result<StageOutcome>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        let path = self.spool_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // create_new makes the existence check and the claim atomic.
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Ok(StageOutcome::AlreadyStaging)
            }
            Err(e) => return Err(e),
        };

        let mut written: u64 = 0;
        let mut inline = if inline_cap > 0 {
            Some(BytesMut::new())
        } else {
            None
        };

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.discard(&path).await;
                    return Err(std::io::Error::other(format!(
                        "request body read failed: {e}"
                    )));
                }
            };
            if let Err(e) = file.write_all(&chunk).await {
                self.discard(&path).await;
                return Err(e);
            }
            written += chunk.len() as u64;
            match inline.as_mut() {
                Some(buf) if written <= inline_cap => buf.extend_from_slice(&chunk),
                _ => inline = None,
            }
        }
        if let Err(e) = file.flush().await {
            self.discard(&path).await;
            return Err(e);
        }
        drop(file);

        // The upload size comes from a fresh stat of the closed file.
        let size = match fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                self.discard(&path).await;
                return Err(e);
            }
        };

        debug!(%key, size, path = %path.display(), "request body spooled");
        Ok(StageOutcome::Staged(StagedBody {
            path,
            size,
            inline: inline.map(BytesMut::freeze),
        }))
    }

    /// Admit `size` bytes to the pending-upload budget. The check and the
    /// increment happen under one lock.
    pub fn try_admit(&self, size: u64) -> bool {
        let mut pending = self.lock();
        if *pending + size > self.max_pending_bytes {
            false
        } else {
            *pending += size;
            true
        }
    }

    /// Return `size` bytes to the budget; paired with a prior [`try_admit`].
    ///
    /// [`try_admit`]: UploadSpooler::try_admit
    pub fn release(&self, size: u64) {
        let mut pending = self.lock();
        *pending = pending.saturating_sub(size);
    }

    pub fn pending_bytes(&self) -> u64 {
        *self.lock()
    }

    /// Remove a spool file, tolerating its absence.
    pub async fn discard(&self, path: &Path) {
        if let Err(e) = fs::remove_file(path).await {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to remove spool file");
            }
        }
    }

    /// Run the remote transfer for an admitted upload. The outcome is
    /// reported to the breaker exactly once; the budget is released and the
    /// spool file unlinked whichever way the transfer ends.
    pub async fn upload(
        &self,
        store: &dyn ObjectStore,
        circuit: &CircuitBreaker,
        key: &str,
        path: &Path,
        size: u64,
    ) -> Result<(), StoreError> {
        let result = store.put_object(key, path).await;
        breaker::observe(circuit, &result);
        self.release(size);
        self.discard(path).await;
        match &result {
            Ok(()) => debug!(%key, size, "upload complete"),
            Err(e) => debug!(%key, size, error = %e, "upload failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn body_of(chunks: &[&'static [u8]]) -> impl Stream<Item = Result<Bytes, Infallible>> + Unpin {
        futures::stream::iter(
            chunks
                .iter()
                .map(|c| Ok(Bytes::from_static(c)))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn stage_writes_the_spool_file() {
        let dir = tempfile::tempdir().unwrap();
        let spooler = UploadSpooler::new(dir.path(), 10);

        let outcome = spooler
            .stage("a/b/c", body_of(&[b"HEL", b"LO"]), 1024)
            .await
            .unwrap();
        let StageOutcome::Staged(staged) = outcome else {
            panic!("expected staged body");
        };

        assert_eq!(staged.size, 5);
        assert_eq!(staged.path, dir.path().join("a/b/c"));
        assert_eq!(staged.inline.as_deref(), Some(b"HELLO".as_slice()));
        assert_eq!(std::fs::read(&staged.path).unwrap(), b"HELLO");
    }

    #[tokio::test]
    async fn second_stage_for_same_key_reports_already_staging() {
        let dir = tempfile::tempdir().unwrap();
        let spooler = UploadSpooler::new(dir.path(), 10);

        let first = spooler.stage("k", body_of(&[b"one"]), 1024).await.unwrap();
        assert!(matches!(first, StageOutcome::Staged(_)));

        let second = spooler.stage("k", body_of(&[b"two"]), 1024).await.unwrap();
        assert!(matches!(second, StageOutcome::AlreadyStaging));
        assert_eq!(std::fs::read(spooler.spool_path("k")).unwrap(), b"one");
    }

    #[tokio::test]
    async fn bodies_above_the_inline_cap_are_not_kept_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let spooler = UploadSpooler::new(dir.path(), 10);

        let outcome = spooler
            .stage("big", body_of(&[b"0123456789"]), 4)
            .await
            .unwrap();
        let StageOutcome::Staged(staged) = outcome else {
            panic!("expected staged body");
        };
        assert_eq!(staged.size, 10);
        assert!(staged.inline.is_none());
    }

    #[test]
    fn budget_admission_is_paired_with_release() {
        let spooler = UploadSpooler::new("/tmp/unused", 1);

        assert!(spooler.try_admit(512 * 1024));
        assert!(spooler.try_admit(512 * 1024));
        assert!(!spooler.try_admit(1));
        assert_eq!(spooler.pending_bytes(), 1024 * 1024);

        spooler.release(512 * 1024);
        assert!(spooler.try_admit(512 * 1024));
    }

    #[tokio::test]
    async fn purge_all_removes_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("spool");
        let spooler = UploadSpooler::new(&root, 10);

        spooler.ensure_root().await.unwrap();
        spooler
            .stage("a/b", body_of(&[b"x"]), 0)
            .await
            .unwrap();
        assert!(root.join("a/b").exists());

        spooler.purge_all().await.unwrap();
        assert!(!root.exists());
        // Purging an absent tree is fine too.
        spooler.purge_all().await.unwrap();
    }
}
