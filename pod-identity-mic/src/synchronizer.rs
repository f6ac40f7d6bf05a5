use pod_identity_crds::v1::assigned::AzureAssignedIdentity;
use tracing::{debug, error, info, warn};

use crate::{
    assignment::AssignmentStore,
    cloud::{CloudError, CloudProvider},
    desired::Snapshot,
    events::{
        EventSink, Severity, apply_error_message, applied_message, binding_reference, reasons,
        remove_error_message, removed_message,
    },
    source::CrdSource,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Attach,
    Detach,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Attach => "attach",
            Operation::Detach => "detach",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Cloud and store both reflect the change.
    Done,
    /// The cloud call failed; nothing was written.
    CloudFailed(String),
    /// The cloud call succeeded but the record could not be written.
    StoreFailed(String),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Done => "success",
            Outcome::CloudFailed(_) => "cloud_error",
            Outcome::StoreFailed(_) => "store_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemResult {
    pub key: String,
    pub operation: Operation,
    pub outcome: Outcome,
}

/// Runs attach and detach work items. Each item reports its own outcome and
/// events; a failing item never affects its siblings.
pub struct CloudSynchronizer<'a, S, C, E> {
    cloud: &'a C,
    store: AssignmentStore<'a, S>,
    events: &'a E,
    snapshot: &'a Snapshot,
}

impl<'a, S, C, E> CloudSynchronizer<'a, S, C, E>
where
    S: CrdSource,
    C: CloudProvider,
    E: EventSink,
{
    pub fn new(cloud: &'a C, source: &'a S, events: &'a E, snapshot: &'a Snapshot) -> Self {
        Self {
            cloud,
            store: AssignmentStore::new(source),
            events,
            snapshot,
        }
    }

    /// Attaches the identity and writes the record. With `already_attached`
    /// the cloud call is skipped because an earlier pass attached the
    /// identity but failed to write the record.
    pub async fn apply(
        &self,
        record: &AzureAssignedIdentity,
        already_attached: bool,
    ) -> ItemResult {
        let key = record.key();
        let spec = &record.spec;
        let regarding = binding_reference(&spec.binding_ref);
        let result = |outcome| ItemResult {
            key: key.clone(),
            operation: Operation::Attach,
            outcome,
        };

        if !already_attached {
            let attached = match self.snapshot.node(&spec.node_name) {
                Some(node) => self.cloud.attach(&spec.identity_ref, node).await,
                None => Err(CloudError::Other(format!(
                    "node {} not found",
                    spec.node_name
                ))),
            };
            if let Err(e) = attached {
                warn!(
                    "failed to attach identity {} to node {} for {}: {}",
                    spec.identity_ref.name, spec.node_name, key, e
                );
                self.events.record(
                    &regarding,
                    Severity::Warning,
                    reasons::BINDING_APPLY_ERROR,
                    apply_error_message(&spec.binding_ref.name, &spec.node_name, &key, &e),
                );
                return result(Outcome::CloudFailed(e.to_string()));
            }
        }

        if let Err(e) = self.store.create(record).await {
            error!(
                "identity attached but assigned identity {} not recorded: {}",
                key, e
            );
            self.events.record(
                &regarding,
                Severity::Warning,
                reasons::BINDING_APPLY_ERROR,
                apply_error_message(&spec.binding_ref.name, &spec.node_name, &key, &e),
            );
            return result(Outcome::StoreFailed(e.to_string()));
        }

        info!(
            "applied binding {} on node {} for {}",
            spec.binding_ref.name, spec.node_name, key
        );
        self.events.record(
            &regarding,
            Severity::Normal,
            reasons::BINDING_APPLIED,
            applied_message(&spec.binding_ref.name, &spec.node_name, &key),
        );
        result(Outcome::Done)
    }

    /// Detaches the identity and deletes the record. `recorded` is false for
    /// an attachment whose record was never written. Without `detach` the
    /// identity stays on the node because another assignment still uses it.
    /// When the node no longer exists the identity left with it and only the
    /// record is removed.
    pub async fn remove(
        &self,
        record: &AzureAssignedIdentity,
        recorded: bool,
        detach: bool,
    ) -> ItemResult {
        let key = record.key();
        let spec = &record.spec;
        let regarding = binding_reference(&spec.binding_ref);
        let result = |outcome| ItemResult {
            key: key.clone(),
            operation: Operation::Detach,
            outcome,
        };

        match self.snapshot.node(&spec.node_name) {
            Some(_) if !detach => debug!(
                "identity {} still in use on node {}, keeping it attached for {}",
                spec.identity_ref.name, spec.node_name, key
            ),
            Some(node) => {
                if let Err(e) = self.cloud.detach(&spec.identity_ref, node).await {
                    warn!(
                        "failed to detach identity {} from node {} for {}: {}",
                        spec.identity_ref.name, spec.node_name, key, e
                    );
                    self.events.record(
                        &regarding,
                        Severity::Warning,
                        reasons::BINDING_REMOVE_ERROR,
                        remove_error_message(
                            &spec.binding_ref.name,
                            &spec.node_name,
                            &spec.pod,
                            &e,
                        ),
                    );
                    return result(Outcome::CloudFailed(e.to_string()));
                }
            }
            None => debug!(
                "node {} not found, skipping detach for {}",
                spec.node_name, key
            ),
        }

        if recorded && let Err(e) = self.store.delete(&key).await {
            error!(
                "identity detached but assigned identity {} not deleted: {}",
                key, e
            );
            self.events.record(
                &regarding,
                Severity::Warning,
                reasons::BINDING_REMOVE_ERROR,
                remove_error_message(&spec.binding_ref.name, &spec.node_name, &spec.pod, &e),
            );
            return result(Outcome::StoreFailed(e.to_string()));
        }

        info!(
            "removed binding {} from node {} for {}",
            spec.binding_ref.name, spec.node_name, key
        );
        self.events.record(
            &regarding,
            Severity::Normal,
            reasons::BINDING_REMOVED,
            removed_message(&spec.binding_ref.name, &spec.node_name, &spec.pod),
        );
        result(Outcome::Done)
    }
}
