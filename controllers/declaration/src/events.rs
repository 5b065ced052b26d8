//! Kubernetes Event recording.
//!
//! Events are fire-and-forget: a failed publish is logged and never fails the
//! reconcile that emitted it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::core::DynamicObject;
use kube::runtime::events::{self, Recorder, Reporter};
use reconcile_core::{EventRecorder, EventType};
use tracing::warn;

/// Action recorded on every event.
const RECONCILE_ACTION: &str = "Reconcile";

/// Publishes engine events as core Kubernetes Events.
pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl std::fmt::Debug for KubeEventRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEventRecorder").finish_non_exhaustive()
    }
}

impl KubeEventRecorder {
    /// Creates a recorder reporting as `controller_name`.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

fn object_reference(obj: &DynamicObject) -> ObjectReference {
    ObjectReference {
        api_version: obj.types.as_ref().map(|t| t.api_version.clone()),
        kind: obj.types.as_ref().map(|t| t.kind.clone()),
        name: obj.metadata.name.clone(),
        namespace: obj.metadata.namespace.clone(),
        uid: obj.metadata.uid.clone(),
        resource_version: obj.metadata.resource_version.clone(),
        ..ObjectReference::default()
    }
}

fn event_type(event_type: EventType) -> events::EventType {
    match event_type {
        EventType::Normal => events::EventType::Normal,
        EventType::Warning => events::EventType::Warning,
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(
        &self,
        regarding: &DynamicObject,
        kind: EventType,
        reason: &str,
        note: &str,
    ) {
        let event = events::Event {
            type_: event_type(kind),
            reason: reason.to_string(),
            note: Some(note.to_string()),
            action: RECONCILE_ACTION.to_string(),
            secondary: None,
        };
        if let Err(e) = self
            .recorder
            .publish(&event, &object_reference(regarding))
            .await
        {
            warn!(reason, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::{ApiResource, GroupVersionKind};

    #[test]
    fn test_object_reference() {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk(
            "mygroup.example.com",
            "v1alpha1",
            "Declaration",
        ));
        let mut obj = DynamicObject::new("nginx", &ar).within("default");
        obj.metadata.uid = Some("uid-1".to_string());

        let reference = object_reference(&obj);
        assert_eq!(
            reference.api_version.as_deref(),
            Some("mygroup.example.com/v1alpha1")
        );
        assert_eq!(reference.kind.as_deref(), Some("Declaration"));
        assert_eq!(reference.name.as_deref(), Some("nginx"));
        assert_eq!(reference.namespace.as_deref(), Some("default"));
        assert_eq!(reference.uid.as_deref(), Some("uid-1"));
    }

    #[test]
    fn test_event_type() {
        assert!(matches!(
            event_type(EventType::Normal),
            events::EventType::Normal
        ));
        assert!(matches!(
            event_type(EventType::Warning),
            events::EventType::Warning
        ));
    }
}
