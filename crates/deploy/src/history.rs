//! Load-once, write-wholesale access to a release history document.

use std::sync::Arc;

use tern_core::{ReleaseHistory, ReleaseStatus};
use tern_persist::{HistoryStore, StoreError};
use tracing::{debug, warn};

use crate::error::{DeployError, DeployResult};

pub struct HistoryHandle {
    store: Arc<dyn HistoryStore>,
    namespace: String,
    name: String,
    /// Token from the last read or write; `None` while the document does not exist.
    version: Option<String>,
    pub history: ReleaseHistory,
}

impl HistoryHandle {
    pub async fn load(store: Arc<dyn HistoryStore>, namespace: &str, name: &str) -> DeployResult<Self> {
        let stored = store.get(namespace, name).await?;
        let (history, version) = match stored {
            Some(s) => {
                let h = ReleaseHistory::deserialize(&s.blob).map_err(|e| DeployError::Internal(format!("{:#}", e)))?;
                (h, Some(s.version))
            }
            None => (ReleaseHistory::new(), None),
        };
        debug!(ns = %namespace, release = %name, entries = history.len(), "history loaded");
        Ok(Self { store, namespace: namespace.to_string(), name: name.to_string(), version, history })
    }

    pub fn exists(&self) -> bool { self.version.is_some() }

    /// Write the whole document back, guarded by the token from the previous read/write.
    pub async fn checkpoint(&mut self) -> DeployResult<()> {
        let blob = self.history.serialize().map_err(|e| DeployError::Internal(format!("{:#}", e)))?;
        let v = self.store.put(&self.namespace, &self.name, &blob, self.version.as_deref()).await?;
        debug!(ns = %self.namespace, release = %self.name, version = %v, "history checkpoint");
        self.version = Some(v);
        Ok(())
    }

    /// Record `number` as Succeeded. A backend error is retried once; a conflict
    /// is not, since another writer owns the document now.
    pub async fn mark_succeeded(&mut self, number: u32) -> DeployResult<()> {
        if let Some(rel) = self.history.get_mut(number) {
            rel.status = ReleaseStatus::Succeeded;
        }
        let res = match self.checkpoint().await {
            Err(DeployError::History(StoreError::Backend(e))) => {
                warn!(release = %self.name, number, error = %format!("{:#}", e), "history write failed, retrying");
                self.checkpoint().await
            }
            other => other,
        };
        if let Err(e) = &res {
            warn!(release = %self.name, number, error = %e, "could not persist succeeded release");
        }
        res
    }

    /// On a failed run, force the created release into `Failed` and persist it.
    /// The original error is returned unchanged; a failed write is only logged.
    pub async fn settle<T>(&mut self, created: Option<u32>, res: DeployResult<T>) -> DeployResult<T> {
        if res.is_ok() {
            return res;
        }
        let Some(number) = created else { return res };
        if let Some(rel) = self.history.get_mut(number) {
            if !rel.status.is_terminal() {
                rel.status = ReleaseStatus::Failed;
            }
        }
        if let Err(e) = self.checkpoint().await {
            warn!(release = %self.name, number, error = %e, "could not persist failed release");
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_persist::MemoryStore;

    #[tokio::test]
    async fn checkpoint_roundtrips_and_detects_concurrent_writer() {
        let store = Arc::new(MemoryStore::new());
        let mut a = HistoryHandle::load(store.clone(), "ns", "rel").await.unwrap();
        assert!(!a.exists());
        a.history.create_release(vec![]);
        a.checkpoint().await.unwrap();

        let mut b = HistoryHandle::load(store.clone(), "ns", "rel").await.unwrap();
        assert_eq!(b.history.len(), 1);
        b.history.create_release(vec![]);
        b.checkpoint().await.unwrap();

        a.history.create_release(vec![]);
        let err = a.checkpoint().await.unwrap_err();
        assert!(matches!(err, DeployError::History(_)), "err={}", err);
    }

    /// Fails the first `failures` writes with a backend error.
    struct FlakyStore {
        inner: MemoryStore,
        failures: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl HistoryStore for FlakyStore {
        async fn get(&self, namespace: &str, name: &str) -> tern_persist::StoreResult<Option<tern_persist::StoredHistory>> {
            self.inner.get(namespace, name).await
        }

        async fn put(&self, namespace: &str, name: &str, blob: &str, expected: Option<&str>) -> tern_persist::StoreResult<String> {
            use std::sync::atomic::Ordering;
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Backend(anyhow::anyhow!("connection reset")));
            }
            self.inner.put(namespace, name, blob, expected).await
        }
    }

    fn flaky(failures: usize) -> Arc<FlakyStore> {
        Arc::new(FlakyStore { inner: MemoryStore::new(), failures: std::sync::atomic::AtomicUsize::new(failures) })
    }

    #[tokio::test]
    async fn success_write_retries_one_backend_error() {
        let store = flaky(0);
        let mut h = HistoryHandle::load(store.clone(), "ns", "rel").await.unwrap();
        let n = h.history.create_release(vec![]).number;
        h.checkpoint().await.unwrap();

        store.failures.store(1, std::sync::atomic::Ordering::SeqCst);
        h.mark_succeeded(n).await.unwrap();
        let reloaded = HistoryHandle::load(store.clone(), "ns", "rel").await.unwrap();
        assert_eq!(reloaded.history.get(n).map(|r| r.status), Some(ReleaseStatus::Succeeded));

        let n2 = h.history.create_release(vec![]).number;
        h.checkpoint().await.unwrap();
        store.failures.store(2, std::sync::atomic::Ordering::SeqCst);
        let err = h.mark_succeeded(n2).await.unwrap_err();
        assert!(matches!(err, DeployError::History(StoreError::Backend(_))), "err={}", err);
    }

    #[tokio::test]
    async fn settle_marks_created_release_failed() {
        let store = Arc::new(MemoryStore::new());
        let mut h = HistoryHandle::load(store.clone(), "ns", "rel").await.unwrap();
        let n = h.history.create_release(vec![]).number;
        h.checkpoint().await.unwrap();
        let res: DeployResult<()> = h.settle(Some(n), Err(DeployError::SteadyState)).await;
        assert!(res.is_err());
        let reloaded = HistoryHandle::load(store, "ns", "rel").await.unwrap();
        assert_eq!(reloaded.history.get(n).map(|r| r.status), Some(ReleaseStatus::Failed));
    }
}
