//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the event source,
//! work queue and a fixed pool of workers around one [`Reconciler`], and runs
//! them until a cancellation token fires.

use crate::config::{ConfigError, ControllerConfig};
use crate::error::{ErrorClass, ReconcileError};
use crate::event_source::EventSource;
use crate::events::EventRecorder;
use crate::object::ReconcileKey;
use crate::owner_index::OwnerIndex;
use crate::queue::WorkQueue;
use crate::reconciler::{Action, Reconciler};
use crate::render::DesiredStateRenderer;
use crate::store::ObjectStore;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Reconcile engine for one Declaration kind.
pub struct Controller {
    config: ControllerConfig,
    store: Arc<dyn ObjectStore>,
    reconciler: Arc<Reconciler>,
    queue: WorkQueue<ReconcileKey>,
    index: Arc<OwnerIndex>,
    contested: ContestedKeys,
}

/// Keys whose last run failed with a conflict. Their next run applies with
/// force so the requeued value wins.
#[derive(Debug, Clone, Default)]
struct ContestedKeys(Arc<Mutex<HashSet<ReconcileKey>>>);

impl ContestedKeys {
    fn mark(&self, key: &ReconcileKey) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
    }

    fn take(&self, key: &ReconcileKey) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a controller instance.
    pub fn new(
        config: ControllerConfig,
        store: Arc<dyn ObjectStore>,
        renderer: Arc<dyn DesiredStateRenderer>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let reconciler = Arc::new(Reconciler::new(
            &config,
            Arc::clone(&store),
            renderer,
            recorder,
        ));
        Ok(Self {
            queue: WorkQueue::new(config.base_backoff, config.max_backoff),
            index: Arc::new(OwnerIndex::new(config.watched_kind.clone())),
            contested: ContestedKeys::default(),
            config,
            store,
            reconciler,
        })
    }

    /// The work queue feeding the workers.
    #[must_use]
    pub fn queue(&self) -> &WorkQueue<ReconcileKey> {
        &self.queue
    }

    /// The owned-object index maintained by the event source.
    #[must_use]
    pub fn owner_index(&self) -> &Arc<OwnerIndex> {
        &self.index
    }

    /// The reconciler run by the workers.
    #[must_use]
    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Event source wired to this controller's queue and index.
    #[must_use]
    pub fn event_source(&self) -> EventSource {
        EventSource::new(
            Arc::clone(&self.store),
            self.queue.clone(),
            Arc::clone(&self.index),
            self.config.watched_kind.clone(),
            self.config.owned_kinds.clone(),
            self.config.namespace.clone(),
        )
        .with_watch_backoff(self.config.base_backoff, self.config.max_backoff)
    }

    /// Takes one key off the queue and processes it to completion. Returns
    /// `false` once the queue is shut down.
    pub async fn process_next(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let result = run_once(&self.reconciler, &self.contested, &key).await;
        handle_result(&self.queue, &self.contested, &key, result);
        self.queue.done(&key);
        true
    }

    /// Runs the event source and workers until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            kind = %self.config.watched_kind.kind,
            workers = self.config.workers,
            field_manager = %self.config.field_manager,
            namespace = self.config.namespace.as_deref().unwrap_or("all namespaces"),
            "Starting controller"
        );

        let source = Arc::new(self.event_source());
        let source_task = tokio::spawn(source.run(cancel.clone()));

        let mut workers = JoinSet::new();
        for id in 0..self.config.workers {
            workers.spawn(worker(
                id,
                Arc::clone(&self.reconciler),
                self.queue.clone(),
                self.contested.clone(),
                cancel.clone(),
            ));
        }

        cancel.cancelled().await;
        info!("Shutdown requested, draining workers");
        self.queue.shut_down();

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!("Worker task failed: {}", e);
            }
        }
        if let Err(e) = source_task.await {
            error!("Event source task failed: {}", e);
        }
        info!("Controller stopped");
    }
}

/// Runs `key`, forcing the apply when its previous run hit a conflict.
async fn run_once(
    reconciler: &Reconciler,
    contested: &ContestedKeys,
    key: &ReconcileKey,
) -> Result<Action, ReconcileError> {
    if contested.take(key) {
        debug!(declaration = %key, "Retrying contested apply with force");
        reconciler.reconcile_with(key, true).await
    } else {
        reconciler.reconcile(key).await
    }
}

async fn worker(
    id: usize,
    reconciler: Arc<Reconciler>,
    queue: WorkQueue<ReconcileKey>,
    contested: ContestedKeys,
    cancel: CancellationToken,
) {
    debug!(worker = id, "Worker started");
    while let Some(key) = queue.get().await {
        if cancel.is_cancelled() {
            queue.done(&key);
            break;
        }
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ReconcileError::Cancelled),
            result = run_once(&reconciler, &contested, &key) => result,
        };
        handle_result(&queue, &contested, &key, result);
        queue.done(&key);
    }
    debug!(worker = id, "Worker stopped");
}

fn handle_result(
    queue: &WorkQueue<ReconcileKey>,
    contested: &ContestedKeys,
    key: &ReconcileKey,
    result: Result<Action, ReconcileError>,
) {
    match result {
        Ok(Action::AwaitChange) => queue.forget(key),
        Ok(Action::Requeue(delay)) => {
            queue.forget(key);
            queue.add_after(key.clone(), delay);
        }
        Err(ReconcileError::Cancelled) => {
            debug!(declaration = %key, "Reconcile cancelled");
        }
        Err(e) => {
            let retries = queue.num_requeues(key);
            match e.class() {
                ErrorClass::Conflict => {
                    info!(declaration = %key, retries, "Conflict, retrying with force: {}", e);
                    contested.mark(key);
                }
                ErrorClass::Invalid => {
                    warn!(declaration = %key, retries, "Declaration needs user attention: {}", e);
                }
                ErrorClass::Ambiguous => {
                    error!(declaration = %key, retries, "Refusing to pick between owned objects: {}", e);
                }
                ErrorClass::Transient => {
                    warn!(declaration = %key, retries, "Reconcile failed, retrying: {}", e);
                }
            }
            queue.add_rate_limited(key.clone());
        }
    }
}
