//! Event recorder that keeps events in memory.

use crate::events::{EventRecorder, EventType};
use async_trait::async_trait;
use kube::core::DynamicObject;
use std::sync::{Arc, Mutex, PoisonError};

/// One published event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// `namespace/name` of the object the event is about
    pub regarding: String,
    /// Severity
    pub event_type: EventType,
    /// Machine-readable reason
    pub reason: String,
    /// Human-readable note
    pub note: String,
}

/// Recorder collecting every published event.
#[derive(Debug, Clone, Default)]
pub struct MockRecorder {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl MockRecorder {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events published so far, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reasons of the events published so far.
    #[must_use]
    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|event| event.reason).collect()
    }
}

#[async_trait]
impl EventRecorder for MockRecorder {
    async fn publish(
        &self,
        regarding: &DynamicObject,
        event_type: EventType,
        reason: &str,
        note: &str,
    ) {
        let regarding = format!(
            "{}/{}",
            regarding.metadata.namespace.as_deref().unwrap_or_default(),
            regarding.metadata.name.as_deref().unwrap_or_default()
        );
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedEvent {
                regarding,
                event_type,
                reason: reason.to_string(),
                note: note.to_string(),
            });
    }
}
