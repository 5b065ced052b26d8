//! User-visible events about reconciled objects.

use async_trait::async_trait;
use kube::core::DynamicObject;
use std::fmt;

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Informational
    Normal,
    /// Something the user should look at
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("Normal"),
            Self::Warning => f.write_str("Warning"),
        }
    }
}

/// Publishes events. Publishing is best effort; implementations log failures
/// instead of returning them so a broken event sink never fails a reconcile.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Records `reason`/`note` against `regarding`.
    async fn publish(
        &self,
        regarding: &DynamicObject,
        event_type: EventType,
        reason: &str,
        note: &str,
    );
}

/// Recorder that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecorder;

#[async_trait]
impl EventRecorder for NoopRecorder {
    async fn publish(&self, _: &DynamicObject, _: EventType, _: &str, _: &str) {}
}

/// Event reasons emitted by the reconciler.
pub mod reasons {
    /// Declaration state changed
    pub const STATUS_CHANGED: &str = "StatusChanged";
    /// Applying a rendered object failed
    pub const APPLY_FAILED: &str = "ApplyFailed";
    /// The spec could not be rendered
    pub const INVALID_SPEC: &str = "InvalidSpec";
    /// More than one owned object of a kind matched
    pub const AMBIGUOUS_OWNERSHIP: &str = "AmbiguousOwnership";
}
