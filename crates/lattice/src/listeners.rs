//! Callback registries with O(1) disposal.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Handle returned at registration time; calling [`Disposer::dispose`]
/// removes the registration. Dropping without disposing leaves the
/// registration in place.
pub struct Disposer {
    f: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Disposer {
    pub fn new(f: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self { f: Some(Box::new(f)) }
    }

    /// Remove the registration backing this handle.
    pub fn dispose(mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Disposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disposer")
            .field("active", &self.f.is_some())
            .finish()
    }
}

/// A set of callbacks keyed by a monotonically increasing id.
///
/// `emit` snapshots the set before invoking, so a callback may register or
/// dispose listeners without deadlocking the registry.
pub(crate) struct Listeners<T: ?Sized + 'static> {
    entries: Arc<DashMap<u64, Arc<dyn Fn(&T) + Send + Sync>>>,
    next_id: Arc<AtomicU64>,
}

impl<T: ?Sized + 'static> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<T: ?Sized + 'static> Listeners<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn add(&self, f: impl Fn(&T) + Send + Sync + 'static) -> Disposer {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(id, Arc::new(f));
        let entries = Arc::clone(&self.entries);
        Disposer::new(move || {
            entries.remove(&id);
        })
    }

    pub fn emit(&self, value: &T) {
        let snapshot: Vec<_> = self.entries.iter().map(|e| Arc::clone(e.value())).collect();
        for f in snapshot {
            f(value);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
