//! In-process implementation of the coordination store contract.
//!
//! Backs the integration tests and the demo binary: several monitors in one
//! process sharing a clone of the same service behave like a multi-host
//! cluster sharing one coordination service.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{Category, CoordinationError, CoordinationService, LockHandle, NodeLock};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Unlocked,
    Exclusive,
    Shared(u32),
}

#[derive(Default)]
struct Inner {
    /// Node payloads, ordered so listings are deterministic.
    nodes: Mutex<HashMap<Category, BTreeMap<String, Vec<u8>>>>,
    /// Advisory lock table, independent of node existence.
    locks: Mutex<HashMap<(Category, String), LockState>>,
}

/// A shared in-memory coordination service. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryCoordinationService {
    inner: Arc<Inner>,
}

impl InMemoryCoordinationService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a node with an empty payload if it does not already exist.
    /// Used to register newly discovered manifests ahead of claiming.
    pub fn ensure_node(&self, category: Category, path: &str) {
        let mut nodes = self.inner.nodes.lock().expect("coordination state poisoned");
        nodes
            .entry(category)
            .or_default()
            .entry(path.to_string())
            .or_default();
    }

    fn try_acquire(&self, category: Category, path: &str, exclusive: bool) -> bool {
        let mut locks = self.inner.locks.lock().expect("lock table poisoned");
        let state = locks
            .entry((category, path.to_string()))
            .or_insert(LockState::Unlocked);
        match (*state, exclusive) {
            (LockState::Unlocked, true) => {
                *state = LockState::Exclusive;
                true
            }
            (LockState::Unlocked, false) => {
                *state = LockState::Shared(1);
                true
            }
            (LockState::Shared(n), false) => {
                *state = LockState::Shared(n + 1);
                true
            }
            _ => false,
        }
    }

    async fn try_lock(
        &self,
        category: Category,
        path: &str,
        timeout: Duration,
        exclusive: bool,
    ) -> Result<Option<NodeLock>, CoordinationError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_acquire(category, path, exclusive) {
                let handle = MemoryLockHandle {
                    inner: Arc::clone(&self.inner),
                    key: (category, path.to_string()),
                    exclusive,
                };
                return Ok(Some(NodeLock::new(Box::new(handle))));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL.min(timeout)).await;
        }
    }
}

struct MemoryLockHandle {
    inner: Arc<Inner>,
    key: (Category, String),
    exclusive: bool,
}

impl LockHandle for MemoryLockHandle {
    fn release(&mut self) {
        let mut locks = self.inner.locks.lock().expect("lock table poisoned");
        if let Some(state) = locks.get_mut(&self.key) {
            *state = match (*state, self.exclusive) {
                (LockState::Shared(n), false) if n > 1 => LockState::Shared(n - 1),
                _ => LockState::Unlocked,
            };
        }
    }
}

#[async_trait]
impl CoordinationService for InMemoryCoordinationService {
    async fn list_nodes(&self, category: Category) -> Result<Vec<String>, CoordinationError> {
        let nodes = self.inner.nodes.lock().expect("coordination state poisoned");
        Ok(nodes
            .get(&category)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_node_data(
        &self,
        category: Category,
        path: &str,
    ) -> Result<Option<Vec<u8>>, CoordinationError> {
        let nodes = self.inner.nodes.lock().expect("coordination state poisoned");
        Ok(nodes.get(&category).and_then(|m| m.get(path)).cloned())
    }

    async fn set_node_data(
        &self,
        category: Category,
        path: &str,
        data: Vec<u8>,
    ) -> Result<(), CoordinationError> {
        let mut nodes = self.inner.nodes.lock().expect("coordination state poisoned");
        nodes
            .entry(category)
            .or_default()
            .insert(path.to_string(), data);
        Ok(())
    }

    async fn delete_node(
        &self,
        category: Category,
        path: &str,
    ) -> Result<(), CoordinationError> {
        let mut nodes = self.inner.nodes.lock().expect("coordination state poisoned");
        if let Some(m) = nodes.get_mut(&category) {
            m.remove(path);
        }
        Ok(())
    }

    async fn try_exclusive_lock(
        &self,
        category: Category,
        path: &str,
        timeout: Duration,
    ) -> Result<Option<NodeLock>, CoordinationError> {
        self.try_lock(category, path, timeout, true).await
    }

    async fn try_shared_lock(
        &self,
        category: Category,
        path: &str,
        timeout: Duration,
    ) -> Result<Option<NodeLock>, CoordinationError> {
        self.try_lock(category, path, timeout, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_node_data_set_get_delete() {
        let store = InMemoryCoordinationService::new();
        assert!(store
            .get_node_data(Category::Manifests, "/m1")
            .await
            .unwrap()
            .is_none());

        store
            .set_node_data(Category::Manifests, "/m1", vec![1, 2, 3])
            .await
            .unwrap();
        assert_eq!(
            store
                .get_node_data(Category::Manifests, "/m1")
                .await
                .unwrap(),
            Some(vec![1, 2, 3])
        );

        store.delete_node(Category::Manifests, "/m1").await.unwrap();
        assert!(store
            .get_node_data(Category::Manifests, "/m1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_list_nodes_is_sorted_and_scoped_to_category() {
        let store = InMemoryCoordinationService::new();
        store
            .set_node_data(Category::Manifests, "/b", vec![])
            .await
            .unwrap();
        store
            .set_node_data(Category::Manifests, "/a", vec![])
            .await
            .unwrap();
        store
            .set_node_data(Category::Cases, "/c", vec![])
            .await
            .unwrap();

        let listed = store.list_nodes(Category::Manifests).await.unwrap();
        assert_eq!(listed, vec!["/a".to_string(), "/b".to_string()]);
    }

    #[tokio::test]
    async fn test_exclusive_lock_excludes_everyone() {
        let store = InMemoryCoordinationService::new();
        let lock = store
            .try_exclusive_lock(Category::Manifests, "/m1", Duration::ZERO)
            .await
            .unwrap()
            .expect("first lock should succeed");

        assert!(store
            .try_exclusive_lock(Category::Manifests, "/m1", Duration::ZERO)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .try_shared_lock(Category::Manifests, "/m1", Duration::ZERO)
            .await
            .unwrap()
            .is_none());

        lock.release();
        assert!(store
            .try_exclusive_lock(Category::Manifests, "/m1", Duration::ZERO)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_shared_locks_coexist() {
        let store = InMemoryCoordinationService::new();
        let s1 = store
            .try_shared_lock(Category::Cases, "/log", Duration::ZERO)
            .await
            .unwrap()
            .expect("shared lock");
        let s2 = store
            .try_shared_lock(Category::Cases, "/log", Duration::ZERO)
            .await
            .unwrap()
            .expect("second shared lock");

        assert!(store
            .try_exclusive_lock(Category::Cases, "/log", Duration::ZERO)
            .await
            .unwrap()
            .is_none());

        drop(s1);
        // One reader still holds it.
        assert!(store
            .try_exclusive_lock(Category::Cases, "/log", Duration::ZERO)
            .await
            .unwrap()
            .is_none());
        drop(s2);
        assert!(store
            .try_exclusive_lock(Category::Cases, "/log", Duration::ZERO)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_lock_released_on_drop() {
        let store = InMemoryCoordinationService::new();
        {
            let _lock = store
                .try_exclusive_lock(Category::Manifests, "/m1", Duration::ZERO)
                .await
                .unwrap()
                .unwrap();
        }
        assert!(store
            .try_exclusive_lock(Category::Manifests, "/m1", Duration::ZERO)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_lock_wait_with_timeout() {
        let store = InMemoryCoordinationService::new();
        let lock = store
            .try_exclusive_lock(Category::Manifests, "/m1", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let store2 = store.clone();
        let waiter = tokio::spawn(async move {
            store2
                .try_exclusive_lock(Category::Manifests, "/m1", Duration::from_secs(2))
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        lock.release();

        let acquired = waiter.await.unwrap();
        assert!(acquired.is_some());
    }
}
