//! A host binding for tests. Roots are a plain list the test edits, and
//! background work optionally goes through a [`DeferredThreadService`] so a
//! test decides exactly when it runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::recycler::CollectionStats;
use crate::scheduler::{DeferredThreadService, ThreadService};
use crate::util::Address;
use crate::vm::{HostBinding, ObjectTracer};

#[derive(Default)]
pub struct MockHost {
    roots: Mutex<Vec<Address>>,
    service: Option<Arc<DeferredThreadService>>,
    collections: AtomicUsize,
    last_freed_bytes: AtomicUsize,
}

impl MockHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_service(service: Arc<DeferredThreadService>) -> Arc<Self> {
        Arc::new(MockHost {
            service: Some(service),
            ..Default::default()
        })
    }

    pub fn add_root(&self, object: Address) {
        self.roots.lock().unwrap().push(object);
    }

    /// Drop one occurrence of `object` from the root list.
    pub fn remove_root(&self, object: Address) {
        let mut roots = self.roots.lock().unwrap();
        if let Some(index) = roots.iter().position(|r| *r == object) {
            roots.swap_remove(index);
        }
    }

    pub fn clear_roots(&self) {
        self.roots.lock().unwrap().clear();
    }

    /// Collections that reached their post-collection callback.
    pub fn collections(&self) -> usize {
        self.collections.load(Ordering::SeqCst)
    }

    pub fn last_freed_bytes(&self) -> usize {
        self.last_freed_bytes.load(Ordering::SeqCst)
    }
}

impl HostBinding for MockHost {
    fn scan_external_roots(&self, tracer: &mut dyn ObjectTracer) {
        for root in self.roots.lock().unwrap().iter() {
            tracer.trace_candidate(*root);
        }
    }

    fn thread_service(&self) -> Option<Arc<dyn ThreadService>> {
        self.service
            .clone()
            .map(|service| service as Arc<dyn ThreadService>)
    }

    fn post_collection(&self, stats: &CollectionStats) {
        self.collections.fetch_add(1, Ordering::SeqCst);
        self.last_freed_bytes.store(stats.freed_bytes, Ordering::SeqCst);
    }
}
