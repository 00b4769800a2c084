//! In-process dedup registries.
//!
//! A [`DedupGuard`] holds the set of identifiers currently being processed.
//! Acquisition is a single check-and-insert under one lock, so of any number
//! of concurrent callers for the same id exactly one wins.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

#[derive(Debug)]
pub struct DedupGuard {
    name: &'static str,
    held: Mutex<HashSet<String>>,
}

impl DedupGuard {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            held: Mutex::new(HashSet::new()),
        }
    }

    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        // the set stays consistent even if a holder panicked
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `id`. Returns false if it is already held.
    pub fn try_acquire(&self, id: &str) -> bool {
        let acquired = self.held().insert(id.to_string());
        trace!(guard = self.name, id = %id, acquired, "Dedup acquire");
        acquired
    }

    /// Unregister `id`. Releasing an id that is not held is a no-op.
    pub fn release(&self, id: &str) {
        self.held().remove(id);
    }

    pub fn is_held(&self, id: &str) -> bool {
        self.held().contains(id)
    }

    /// Acquire `id` for the lifetime of the returned permit.
    pub fn try_lock(&self, id: &str) -> Option<DedupPermit<'_>> {
        self.try_acquire(id).then(|| DedupPermit {
            guard: self,
            id: id.to_string(),
        })
    }
}

/// Releases its id when dropped.
#[derive(Debug)]
pub struct DedupPermit<'a> {
    guard: &'a DedupGuard,
    id: String,
}

impl DedupPermit<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for DedupPermit<'_> {
    fn drop(&mut self) {
        self.guard.release(&self.id);
    }
}

/// The three registries the engine coordinates through. Keyspaces are disjoint.
#[derive(Debug)]
pub struct DedupGuards {
    /// `"{token_id}:{root_strategy_id}"` while an open is in flight
    pub open: DedupGuard,
    /// Exchange order id while a close is in flight
    pub close: DedupGuard,
    /// `"{order_id}:{target_id}"` while a target crossing is handled
    pub target: DedupGuard,
}

impl DedupGuards {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            open: DedupGuard::new("open"),
            close: DedupGuard::new("close"),
            target: DedupGuard::new("target"),
        })
    }
}

pub fn open_key(token_id: i64, root_strategy_id: i64) -> String {
    format!("{}:{}", token_id, root_strategy_id)
}

pub fn target_key(order_id: &str, target_id: i64) -> String {
    format!("{}:{}", order_id, target_id)
}
