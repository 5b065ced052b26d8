//! Reconciler
//!
//! One reconcile run for one Declaration key:
//!
//! 1. fetch the Declaration (gone means done, no requeue)
//! 2. render the desired owned objects and stamp the controller reference
//! 3. apply each of them
//! 4. list the owned objects actually present
//! 5. aggregate status from what was observed
//! 6. write status through the status subresource
//!
//! The run holds no state between invocations; everything is re-read from the
//! store, so running it twice with no external change is a no-op the second
//! time.

use crate::apply::ApplyEngine;
use crate::config::ControllerConfig;
use crate::error::ReconcileError;
use crate::events::{EventRecorder, EventType, reasons};
use crate::object::{
    LabelSelector, ReconcileKey, controller_reference, gvk_of, is_controlled_by, owner_label_key,
};
use crate::render::{DesiredStateRenderer, stamp_owner};
use crate::status::{ObservedKind, aggregate_status, current_status};
use crate::store::ObjectStore;
use kube::core::{DynamicObject, GroupVersionKind};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// What the scheduler should do after a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing until the next change event
    AwaitChange,
    /// Run again after the given delay
    Requeue(Duration),
}

impl Action {
    /// Wait for the next change event.
    #[must_use]
    pub fn await_change() -> Self {
        Self::AwaitChange
    }

    /// Run again after `delay`.
    #[must_use]
    pub fn requeue(delay: Duration) -> Self {
        Self::Requeue(delay)
    }
}

/// Drives a Declaration's owned objects toward its spec.
pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    renderer: Arc<dyn DesiredStateRenderer>,
    recorder: Arc<dyn EventRecorder>,
    apply: ApplyEngine,
    watched_kind: GroupVersionKind,
    owned_kinds: Vec<GroupVersionKind>,
    label_key: String,
    resync_period: Option<Duration>,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("apply", &self.apply)
            .field("watched_kind", &self.watched_kind)
            .field("owned_kinds", &self.owned_kinds)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a reconciler. Collaborators are fixed for its lifetime.
    #[must_use]
    pub fn new(
        config: &ControllerConfig,
        store: Arc<dyn ObjectStore>,
        renderer: Arc<dyn DesiredStateRenderer>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            apply: ApplyEngine::new(
                Arc::clone(&store),
                config.field_manager.clone(),
                config.force_apply,
            )
            .with_mode(config.apply_mode),
            store,
            renderer,
            recorder,
            label_key: owner_label_key(&config.watched_kind),
            watched_kind: config.watched_kind.clone(),
            owned_kinds: config.owned_kinds.clone(),
            resync_period: config.resync_period,
        }
    }

    /// Label key stamped on owned objects.
    #[must_use]
    pub fn label_key(&self) -> &str {
        &self.label_key
    }

    /// Runs one reconcile for `key`.
    pub async fn reconcile(&self, key: &ReconcileKey) -> Result<Action, ReconcileError> {
        self.reconcile_with(key, self.apply.force()).await
    }

    /// Runs one reconcile for `key`, applying with `force` regardless of the
    /// configured default. Used for the retry after a field conflict.
    #[instrument(skip(self), fields(declaration = %key))]
    pub async fn reconcile_with(
        &self,
        key: &ReconcileKey,
        force: bool,
    ) -> Result<Action, ReconcileError> {
        let Some(declaration) = self
            .store
            .get(&self.watched_kind, Some(&key.namespace), &key.name)
            .await?
        else {
            debug!("Declaration not found, nothing to do");
            return Ok(Action::await_change());
        };
        if declaration.metadata.deletion_timestamp.is_some() {
            debug!("Declaration is being deleted, leaving owned objects to garbage collection");
            return Ok(Action::await_change());
        }

        let desired = match self.render(&declaration) {
            Ok(desired) => desired,
            Err(e) => {
                warn!("Cannot render desired state: {}", e);
                self.recorder
                    .publish(&declaration, EventType::Warning, reasons::INVALID_SPEC, &e.to_string())
                    .await;
                return Err(e);
            }
        };

        for obj in &desired {
            if let Err(e) = self.apply.apply_with(obj, force).await {
                let note = format!(
                    "Applying {} {}: {}",
                    obj.types.as_ref().map_or("object", |types| types.kind.as_str()),
                    obj.metadata.name.as_deref().unwrap_or_default(),
                    e
                );
                self.recorder
                    .publish(&declaration, EventType::Warning, reasons::APPLY_FAILED, &note)
                    .await;
                return Err(e.into());
            }
        }
        debug!(count = desired.len(), "Applied desired objects");

        let observed = self.observe(&declaration).await?;
        let status = match aggregate_status(&declaration, &observed, |obj| {
            self.renderer.is_ready(obj)
        }) {
            Ok(status) => status,
            Err(e) => {
                if matches!(e, ReconcileError::AmbiguousOwnership { .. }) {
                    self.recorder
                        .publish(
                            &declaration,
                            EventType::Warning,
                            reasons::AMBIGUOUS_OWNERSHIP,
                            &e.to_string(),
                        )
                        .await;
                }
                return Err(e);
            }
        };

        let previous = current_status(&declaration);
        if previous.as_ref() == Some(&status) {
            debug!(state = %status.state, "Status unchanged");
            return Ok(self.next_action());
        }

        let value = serde_json::to_value(&status)?;
        self.store
            .update_status(
                &self.watched_kind,
                Some(&key.namespace),
                &key.name,
                &value,
                declaration.metadata.resource_version.as_deref(),
            )
            .await?;
        info!(state = %status.state, "Updated status");

        if previous.map(|previous| previous.state) != Some(status.state) {
            self.recorder
                .publish(
                    &declaration,
                    EventType::Normal,
                    reasons::STATUS_CHANGED,
                    &format!("Declaration is {}", status.state),
                )
                .await;
        }
        Ok(self.next_action())
    }

    fn next_action(&self) -> Action {
        self.resync_period
            .map_or_else(Action::await_change, Action::requeue)
    }

    fn render(&self, declaration: &DynamicObject) -> Result<Vec<DynamicObject>, ReconcileError> {
        let owner = controller_reference(declaration, &self.watched_kind)?;
        let mut objects = self.renderer.render(declaration)?;
        for obj in &mut objects {
            let gvk = gvk_of(obj).ok_or_else(|| {
                ReconcileError::Render("rendered object has no apiVersion/kind".to_string())
            })?;
            if !self.owned_kinds.contains(&gvk) {
                return Err(ReconcileError::Render(format!(
                    "rendered {} is not a managed kind",
                    gvk.kind
                )));
            }
            stamp_owner(
                obj,
                &owner,
                &self.label_key,
                declaration.metadata.namespace.as_deref(),
            );
        }
        Ok(objects)
    }

    async fn observe(&self, declaration: &DynamicObject) -> Result<Vec<ObservedKind>, ReconcileError> {
        let name = declaration.metadata.name.as_deref().unwrap_or_default();
        let uid = declaration.metadata.uid.as_deref().unwrap_or_default();
        let selector = LabelSelector::new().with(self.label_key.as_str(), name);

        let mut observed = Vec::with_capacity(self.owned_kinds.len());
        for gvk in &self.owned_kinds {
            let objects: Vec<DynamicObject> = self
                .store
                .list(gvk, declaration.metadata.namespace.as_deref(), &selector)
                .await?
                .into_iter()
                .filter(|obj| is_controlled_by(obj, uid))
                .collect();
            debug!(kind = %gvk.kind, count = objects.len(), "Observed owned objects");
            observed.push(ObservedKind {
                gvk: gvk.clone(),
                objects,
            });
        }
        Ok(observed)
    }
}
