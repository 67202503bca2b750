//! Facade over the distributed coordination service.
//!
//! The store provides hierarchical byte-blob nodes grouped into categories,
//! plus advisory exclusive/shared locks. It is the single source of truth
//! for job state across the cluster; everything in-process is a cache.
//!
//! `None` from a try-lock call means "held elsewhere", never an error.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::InMemoryCoordinationService;

#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("Coordination service unavailable: {0}")]
    Unavailable(String),

    #[error("Coordination service internal error: {0}")]
    Internal(String),
}

/// Top-level namespaces in the coordination store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Manifests,
    Cases,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Manifests => write!(f, "manifests"),
            Category::Cases => write!(f, "cases"),
        }
    }
}

/// Backend-specific state behind a held advisory lock.
pub trait LockHandle: Send {
    /// Releases the lock. Called at most once.
    fn release(&mut self);
}

/// A held advisory lock on a coordination node.
///
/// Released explicitly via [`NodeLock::release`] or implicitly on drop, so
/// every exit path gives the lock back.
pub struct NodeLock {
    handle: Option<Box<dyn LockHandle>>,
}

impl NodeLock {
    pub fn new(handle: Box<dyn LockHandle>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    pub fn release(mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.release();
        }
    }
}

impl Drop for NodeLock {
    fn drop(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.release();
        }
    }
}

impl std::fmt::Debug for NodeLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeLock")
            .field("held", &self.handle.is_some())
            .finish()
    }
}

/// Contract required of the coordination store backend.
///
/// Reads are lock-free and may be slightly stale; every write that affects
/// the job state machine happens while the caller holds the node's exclusive
/// lock.
#[async_trait]
pub trait CoordinationService: Send + Sync {
    /// Lists the node paths under a category.
    async fn list_nodes(&self, category: Category) -> Result<Vec<String>, CoordinationError>;

    /// Gets a node's byte payload. `None` if the node does not exist; an
    /// existing node may have an empty payload, which callers treat the same.
    async fn get_node_data(
        &self,
        category: Category,
        path: &str,
    ) -> Result<Option<Vec<u8>>, CoordinationError>;

    /// Sets a node's byte payload, creating the node if needed.
    async fn set_node_data(
        &self,
        category: Category,
        path: &str,
        data: Vec<u8>,
    ) -> Result<(), CoordinationError>;

    /// Deletes a node and its payload.
    async fn delete_node(&self, category: Category, path: &str)
        -> Result<(), CoordinationError>;

    /// Attempts to take the exclusive lock on a node, waiting up to
    /// `timeout`. `Ok(None)` means the lock is held elsewhere.
    async fn try_exclusive_lock(
        &self,
        category: Category,
        path: &str,
        timeout: Duration,
    ) -> Result<Option<NodeLock>, CoordinationError>;

    /// Attempts to take a shared lock on a node, waiting up to `timeout`.
    /// `Ok(None)` means an exclusive lock is held elsewhere.
    async fn try_shared_lock(
        &self,
        category: Category,
        path: &str,
        timeout: Duration,
    ) -> Result<Option<NodeLock>, CoordinationError>;
}
