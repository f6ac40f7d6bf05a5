//! Status events emitted for every attach and detach outcome.
//!
//! Recording never blocks a pass: the Kubernetes sink buffers events in a
//! bounded channel drained by a background task and drops events when the
//! buffer is full.

use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    Client, Resource,
    runtime::events::{Event, EventType, Recorder, Reporter},
};
use pod_identity_crds::v1::{assigned::BindingRef, binding::AzureIdentityBinding};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::{debug, warn};

pub mod reasons {
    pub const BINDING_APPLIED: &str = "binding applied";
    pub const BINDING_APPLY_ERROR: &str = "binding apply error";
    pub const BINDING_REMOVED: &str = "binding removed";
    pub const BINDING_REMOVE_ERROR: &str = "binding remove error";
}

const ACTION: &str = "Reconcile";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Normal => write!(f, "Normal"),
            Severity::Warning => write!(f, "Warning"),
        }
    }
}

impl From<Severity> for EventType {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Normal => EventType::Normal,
            Severity::Warning => EventType::Warning,
        }
    }
}

/// Fire-and-forget event recording. Implementations must return promptly.
pub trait EventSink: Send + Sync {
    fn record(
        &self,
        regarding: &ObjectReference,
        severity: Severity,
        reason: &str,
        message: String,
    );
}

impl<T: EventSink> EventSink for std::sync::Arc<T> {
    fn record(
        &self,
        regarding: &ObjectReference,
        severity: Severity,
        reason: &str,
        message: String,
    ) {
        (**self).record(regarding, severity, reason, message)
    }
}

pub fn applied_message(binding: &str, node: &str, key: &str) -> String {
    format!("Binding {binding} applied on node {node} for pod {key}")
}

pub fn apply_error_message(
    binding: &str,
    node: &str,
    key: &str,
    error: &dyn fmt::Display,
) -> String {
    format!("Applying binding {binding} node {node} for pod {key} resulted in error {error}")
}

pub fn removed_message(binding: &str, node: &str, pod: &str) -> String {
    format!("Binding {binding} removed from node {node} for pod {pod}")
}

pub fn remove_error_message(
    binding: &str,
    node: &str,
    pod: &str,
    error: &dyn fmt::Display,
) -> String {
    format!("Binding {binding} removal from node {node} for pod {pod} resulted in error {error}")
}

/// Reference to the binding an event is about.
pub fn binding_reference(binding: &BindingRef) -> ObjectReference {
    ObjectReference {
        api_version: Some(AzureIdentityBinding::api_version(&()).into_owned()),
        kind: Some(AzureIdentityBinding::kind(&()).into_owned()),
        name: Some(binding.name.clone()),
        namespace: Some(binding.namespace.clone()),
        ..Default::default()
    }
}

struct PendingEvent {
    regarding: ObjectReference,
    event: Event,
}

/// Publishes events as Kubernetes Events through a bounded buffer.
pub struct KubeEventRecorder {
    tx: mpsc::Sender<PendingEvent>,
}

impl KubeEventRecorder {
    /// Spawns the publishing task. It publishes everything still buffered
    /// and stops once every recorder handle is dropped.
    pub fn start(client: Client, controller_name: &str, capacity: usize) -> (Self, JoinHandle<()>) {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        let recorder = Arc::new(Recorder::new(client, reporter));
        let (tx, rx) = mpsc::channel::<PendingEvent>(capacity.max(1));

        let handle = tokio::spawn(publish_all(rx, move |pending: PendingEvent| {
            let recorder = recorder.clone();
            async move {
                if let Err(e) = recorder.publish(&pending.event, &pending.regarding).await {
                    warn!(
                        reason = %pending.event.reason,
                        error = %e,
                        "failed to publish kubernetes event"
                    );
                }
            }
        }));

        (Self { tx }, handle)
    }
}

async fn publish_all<F, Fut>(mut rx: mpsc::Receiver<PendingEvent>, mut publish: F)
where
    F: FnMut(PendingEvent) -> Fut,
    Fut: Future<Output = ()>,
{
    while let Some(pending) = rx.recv().await {
        publish(pending).await;
    }
    debug!("event recorder stopped");
}

impl EventSink for KubeEventRecorder {
    fn record(
        &self,
        regarding: &ObjectReference,
        severity: Severity,
        reason: &str,
        message: String,
    ) {
        let pending = PendingEvent {
            regarding: regarding.clone(),
            event: Event {
                type_: severity.into(),
                reason: reason.to_string(),
                note: Some(message),
                action: ACTION.to_string(),
                secondary: None,
            },
        };
        match self.tx.try_send(pending) {
            Ok(()) => {}
            Err(TrySendError::Full(pending)) => {
                warn!(reason = %pending.event.reason, "event buffer full, dropping event")
            }
            Err(TrySendError::Closed(_)) => debug!("event recorder closed, dropping event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use pod_identity_crds::v1::assigned::BindingRef;

    use super::*;

    #[tokio::test]
    async fn buffered_events_are_published_after_recorder_is_dropped() {
        let (tx, rx) = mpsc::channel(8);
        let recorder = KubeEventRecorder { tx };
        let regarding = binding_reference(&BindingRef {
            name: "testbinding".into(),
            namespace: "default".into(),
        });
        for reason in [reasons::BINDING_APPLIED, reasons::BINDING_REMOVED] {
            recorder.record(&regarding, Severity::Normal, reason, "message".into());
        }
        drop(recorder);

        let published = Arc::new(Mutex::new(Vec::new()));
        let sink = published.clone();
        publish_all(rx, move |pending: PendingEvent| {
            let sink = sink.clone();
            async move { sink.lock().unwrap().push(pending.event.reason) }
        })
        .await;

        assert_eq!(
            *published.lock().unwrap(),
            [reasons::BINDING_APPLIED, reasons::BINDING_REMOVED]
        );
    }

    #[test]
    fn messages_follow_event_formats() {
        assert_eq!(
            applied_message("testbinding", "test-node", "test-pod-default-test-id"),
            "Binding testbinding applied on node test-node for pod test-pod-default-test-id"
        );
        assert_eq!(
            apply_error_message(
                "testbinding",
                "test-node",
                "test-pod-default-test-id",
                &"error returned from cloud provider"
            ),
            "Applying binding testbinding node test-node for pod test-pod-default-test-id resulted in error error returned from cloud provider"
        );
        assert_eq!(
            removed_message("testbinding", "test-node", "test-pod"),
            "Binding testbinding removed from node test-node for pod test-pod"
        );
        assert_eq!(
            remove_error_message(
                "testbinding",
                "test-node",
                "test-pod",
                &"remove error returned from cloud provider"
            ),
            "Binding testbinding removal from node test-node for pod test-pod resulted in error remove error returned from cloud provider"
        );
    }

    #[test]
    fn binding_reference_points_at_binding_crd() {
        let reference = binding_reference(&BindingRef {
            name: "testbinding".into(),
            namespace: "custom-app-ns".into(),
        });
        assert_eq!(reference.kind.as_deref(), Some("AzureIdentityBinding"));
        assert_eq!(
            reference.api_version.as_deref(),
            Some("aadpodidentity.k8s.io/v1")
        );
        assert_eq!(reference.name.as_deref(), Some("testbinding"));
        assert_eq!(reference.namespace.as_deref(), Some("custom-app-ns"));
    }

    #[test]
    fn severity_maps_to_event_type() {
        assert!(matches!(EventType::from(Severity::Normal), EventType::Normal));
        assert!(matches!(
            EventType::from(Severity::Warning),
            EventType::Warning
        ));
    }
}
