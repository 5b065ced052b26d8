//! Event source
//!
//! Watches the Declaration kind and every owned kind, and turns each change
//! into a reconcile request for the Declaration concerned. Owned objects are
//! never reconciled directly; their events are mapped to the controlling
//! Declaration through the [`OwnerIndex`].

use crate::backoff::ExponentialBackoff;
use crate::error::StoreError;
use crate::object::{LabelSelector, ReconcileKey, ResourceKey};
use crate::owner_index::OwnerIndex;
use crate::queue::WorkQueue;
use crate::store::{ObjectStore, WatchEvent, WatchEventType};
use futures::StreamExt;
use kube::core::GroupVersionKind;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Translates store notifications into work-queue keys.
pub struct EventSource {
    store: Arc<dyn ObjectStore>,
    queue: WorkQueue<ReconcileKey>,
    index: Arc<OwnerIndex>,
    watched_kind: GroupVersionKind,
    owned_kinds: Vec<GroupVersionKind>,
    namespace: Option<String>,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl fmt::Debug for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSource")
            .field("watched_kind", &self.watched_kind)
            .field("owned_kinds", &self.owned_kinds)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl EventSource {
    /// Creates an event source feeding `queue`.
    #[must_use]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        queue: WorkQueue<ReconcileKey>,
        index: Arc<OwnerIndex>,
        watched_kind: GroupVersionKind,
        owned_kinds: Vec<GroupVersionKind>,
        namespace: Option<String>,
    ) -> Self {
        Self {
            store,
            queue,
            index,
            watched_kind,
            owned_kinds,
            namespace,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }

    /// Sets the delays used when re-opening a broken watch.
    #[must_use]
    pub fn with_watch_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    /// Routes one notification for `gvk`.
    pub fn handle_event(&self, gvk: &GroupVersionKind, event: &WatchEvent) {
        if *gvk == self.watched_kind {
            self.handle_declaration_event(event);
        } else {
            self.handle_owned_event(gvk, event);
        }
    }

    /// Any change to a Declaration, deletes included, schedules it.
    pub fn handle_declaration_event(&self, event: &WatchEvent) {
        if let Some(key) = ReconcileKey::from_object(&event.object) {
            trace!(%key, event = ?event.event_type, "Declaration changed");
            self.queue.add(key);
        }
    }

    /// A change to an owned object schedules its controlling Declaration.
    ///
    /// When an object changes owner, the previous owner is scheduled too so it
    /// notices the loss.
    pub fn handle_owned_event(&self, gvk: &GroupVersionKind, event: &WatchEvent) {
        let obj = &event.object;
        let owner = match event.event_type {
            WatchEventType::Deleted => self
                .index
                .forget(gvk, obj)
                .or_else(|| self.index.resolve_owner(obj)),
            WatchEventType::Added | WatchEventType::Modified => {
                let previous = ResourceKey::of(gvk, obj).and_then(|key| self.index.owner_of(&key));
                let current = self.index.observe(gvk, obj);
                if let Some(previous) = previous.filter(|previous| Some(previous) != current.as_ref()) {
                    self.queue.add(previous);
                }
                current
            }
        };
        if let Some(owner) = owner {
            trace!(%owner, kind = %gvk.kind, event = ?event.event_type, "Owned object changed");
            self.queue.add(owner);
        }
    }

    /// Lists every object of `gvk` and handles it as added.
    pub async fn resync(&self, gvk: &GroupVersionKind) -> Result<usize, StoreError> {
        let objects = self
            .store
            .list(gvk, self.namespace.as_deref(), &LabelSelector::new())
            .await?;
        let count = objects.len();
        for object in objects {
            self.handle_event(gvk, &WatchEvent::new(WatchEventType::Added, object));
        }
        Ok(count)
    }

    /// Watches every kind until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut watchers = JoinSet::new();
        let kinds = std::iter::once(self.watched_kind.clone()).chain(self.owned_kinds.iter().cloned());
        for gvk in kinds {
            watchers.spawn(Arc::clone(&self).watch_kind(gvk, cancel.clone()));
        }
        while let Some(result) = watchers.join_next().await {
            if let Err(e) = result {
                warn!("Watcher task failed: {}", e);
            }
        }
        debug!("Event source stopped");
    }

    async fn watch_kind(self: Arc<Self>, gvk: GroupVersionKind, cancel: CancellationToken) {
        let mut backoff = ExponentialBackoff::new(self.base_backoff, self.max_backoff);
        info!(kind = %gvk.kind, namespace = ?self.namespace, "Starting watch");

        loop {
            if cancel.is_cancelled() {
                return;
            }

            // Open the watch before listing so nothing between the two is missed.
            let mut stream = self.store.watch(&gvk, self.namespace.as_deref());
            match self.resync(&gvk).await {
                Ok(count) => {
                    debug!(kind = %gvk.kind, count, "Resynced");
                    backoff.reset();
                    loop {
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            next = stream.next() => match next {
                                Some(Ok(event)) => self.handle_event(&gvk, &event),
                                Some(Err(e)) => {
                                    warn!(kind = %gvk.kind, "Watch error: {}", e);
                                    break;
                                }
                                None => {
                                    debug!(kind = %gvk.kind, "Watch stream ended");
                                    break;
                                }
                            },
                        }
                    }
                }
                Err(e) => warn!(kind = %gvk.kind, "Resync failed: {}", e),
            }

            let delay = backoff.next_backoff();
            debug!(kind = %gvk.kind, ?delay, "Re-opening watch");
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}
