//! In-memory collaborators. They hold cluster and cloud state behind mutexes
//! so a test can mutate the world between passes and inspect what the
//! controller did.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use k8s_openapi::api::core::v1::{Node, NodeSpec, ObjectReference, Pod, PodSpec};
use kube::{ResourceExt, api::ObjectMeta};
use pod_identity_crds::v1::{
    assigned::{AzureAssignedIdentity, IdentityRef},
    binding::{AzureIdentityBinding, AzureIdentityBindingSpec, BINDING_LABEL},
    identity::{AzureIdentity, AzureIdentitySpec, IdentityType},
};
use tokio::sync::watch;

use crate::{
    Error, Result,
    cloud::{CloudError, CloudProvider},
    events::{EventSink, Severity},
    source::{CrdSource, NodeSource, PodSource},
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A pod labelled for `selector` and scheduled on `node_name` (unscheduled
/// when empty).
pub fn make_pod(name: &str, namespace: &str, node_name: &str, selector: &str) -> Pod {
    let mut labels = BTreeMap::new();
    labels.insert(BINDING_LABEL.to_string(), selector.to_string());
    Pod {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: (!node_name.is_empty()).then(|| node_name.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn make_node(name: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.into()),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            provider_id: Some(format!(
                "azure:///subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines/{name}"
            )),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn make_identity(
    name: &str,
    namespace: &str,
    identity_type: IdentityType,
    resource_id: &str,
    client_id: &str,
) -> AzureIdentity {
    let mut identity = AzureIdentity::new(
        name,
        AzureIdentitySpec {
            identity_type,
            resource_id: resource_id.into(),
            client_id: client_id.into(),
        },
    );
    identity.metadata.namespace = Some(namespace.into());
    identity
}

pub fn make_binding(
    name: &str,
    namespace: &str,
    identity: &str,
    selector: &str,
) -> AzureIdentityBinding {
    let mut binding = AzureIdentityBinding::new(
        name,
        AzureIdentityBindingSpec {
            azure_identity: identity.into(),
            selector: selector.into(),
            pod_selector: None,
        },
    );
    binding.metadata.namespace = Some(namespace.into());
    binding
}

#[derive(Default)]
struct ClusterState {
    pods: Vec<Arc<Pod>>,
    nodes: Vec<Arc<Node>>,
    identities: Vec<Arc<AzureIdentity>>,
    bindings: Vec<Arc<AzureIdentityBinding>>,
    assigned: BTreeMap<String, AzureAssignedIdentity>,
    listing_error: Option<String>,
    write_error: Option<String>,
}

impl ClusterState {
    fn check_listing(&self, resource: &'static str) -> Result<()> {
        match &self.listing_error {
            Some(reason) => Err(Error::Snapshot {
                resource,
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn check_write(&self) -> Result<()> {
        match &self.write_error {
            Some(reason) => Err(Error::Store(reason.clone())),
            None => Ok(()),
        }
    }
}

/// Pods, nodes and identity CRDs held in memory.
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<ClusterState>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pod(&self, name: &str, namespace: &str, node_name: &str, selector: &str) {
        self.apply_pod(make_pod(name, namespace, node_name, selector));
    }

    /// Inserts `pod`, replacing any pod with the same namespace and name.
    pub fn apply_pod(&self, pod: Pod) {
        let mut state = lock(&self.state);
        state
            .pods
            .retain(|p| !(p.name_any() == pod.name_any() && p.namespace() == pod.namespace()));
        state.pods.push(Arc::new(pod));
    }

    pub fn delete_pod(&self, name: &str, namespace: &str) {
        lock(&self.state)
            .pods
            .retain(|p| !(p.name_any() == name && p.namespace().as_deref() == Some(namespace)));
    }

    pub fn add_node(&self, name: &str) {
        let mut state = lock(&self.state);
        state.nodes.retain(|n| n.name_any() != name);
        state.nodes.push(Arc::new(make_node(name)));
    }

    pub fn delete_node(&self, name: &str) {
        lock(&self.state).nodes.retain(|n| n.name_any() != name);
    }

    pub fn add_identity(
        &self,
        name: &str,
        namespace: &str,
        identity_type: IdentityType,
        resource_id: &str,
        client_id: &str,
    ) {
        lock(&self.state).identities.push(Arc::new(make_identity(
            name,
            namespace,
            identity_type,
            resource_id,
            client_id,
        )));
    }

    pub fn add_binding(&self, name: &str, namespace: &str, identity: &str, selector: &str) {
        lock(&self.state)
            .bindings
            .push(Arc::new(make_binding(name, namespace, identity, selector)));
    }

    pub fn delete_binding(&self, name: &str, namespace: &str) {
        lock(&self.state)
            .bindings
            .retain(|b| !(b.name_any() == name && b.namespace().as_deref() == Some(namespace)));
    }

    pub fn insert_assigned_identity(&self, record: AzureAssignedIdentity) {
        lock(&self.state).assigned.insert(record.key(), record);
    }

    pub fn assigned_identities(&self) -> Vec<AzureAssignedIdentity> {
        lock(&self.state).assigned.values().cloned().collect()
    }

    pub fn assigned_identity(&self, key: &str) -> Option<AzureAssignedIdentity> {
        lock(&self.state).assigned.get(key).cloned()
    }

    /// Makes every listing fail with `reason` until cleared with `None`.
    pub fn set_listing_error(&self, reason: Option<&str>) {
        lock(&self.state).listing_error = reason.map(str::to_string);
    }

    /// Makes assigned identity creates and deletes fail until cleared.
    pub fn set_write_error(&self, reason: Option<&str>) {
        lock(&self.state).write_error = reason.map(str::to_string);
    }
}

impl PodSource for MemoryCluster {
    async fn list_pods(&self) -> Result<Vec<Arc<Pod>>> {
        let state = lock(&self.state);
        state.check_listing("pods")?;
        Ok(state.pods.clone())
    }
}

impl NodeSource for MemoryCluster {
    async fn list_nodes(&self) -> Result<Vec<Arc<Node>>> {
        let state = lock(&self.state);
        state.check_listing("nodes")?;
        Ok(state.nodes.clone())
    }
}

impl CrdSource for MemoryCluster {
    async fn list_identities(&self) -> Result<Vec<Arc<AzureIdentity>>> {
        let state = lock(&self.state);
        state.check_listing("identities")?;
        Ok(state.identities.clone())
    }

    async fn list_bindings(&self) -> Result<Vec<Arc<AzureIdentityBinding>>> {
        let state = lock(&self.state);
        state.check_listing("bindings")?;
        Ok(state.bindings.clone())
    }

    async fn list_assigned_identities(&self) -> Result<Vec<AzureAssignedIdentity>> {
        let state = lock(&self.state);
        state.check_listing("assigned identities")?;
        Ok(state.assigned.values().cloned().collect())
    }

    async fn create_assigned_identity(&self, record: &AzureAssignedIdentity) -> Result<()> {
        let mut state = lock(&self.state);
        state.check_write()?;
        state
            .assigned
            .entry(record.key())
            .or_insert_with(|| record.clone());
        Ok(())
    }

    async fn delete_assigned_identity(&self, key: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.check_write()?;
        state.assigned.remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudCall {
    Attach { identity: String, node: String },
    Detach { identity: String, node: String },
}

#[derive(Default)]
struct CloudState {
    error: Option<String>,
    failing: BTreeMap<String, String>,
    /// Node name to the shared target it runs on.
    targets: BTreeMap<String, String>,
    /// (placement, identity resource id)
    attached: BTreeSet<(String, String)>,
    calls: Vec<CloudCall>,
    in_flight: BTreeMap<String, usize>,
    overlapping: usize,
}

impl CloudState {
    fn failure(&self, identity: &IdentityRef) -> Option<CloudError> {
        self.error
            .as_ref()
            .or_else(|| self.failing.get(&identity.resource_id))
            .map(|message| CloudError::Other(message.clone()))
    }

    fn placement(&self, node: &str) -> String {
        self.targets
            .get(node)
            .cloned()
            .unwrap_or_else(|| node.to_string())
    }
}

/// Cloud provider keeping the set of identities attached to each placement.
pub struct MemoryCloud {
    state: Mutex<CloudState>,
    /// Operations wait while this is false.
    gate: watch::Sender<bool>,
}

impl Default for MemoryCloud {
    fn default() -> Self {
        Self {
            state: Mutex::default(),
            gate: watch::Sender::new(true),
        }
    }
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every operation with `message` until [`MemoryCloud::unset_error`].
    pub fn set_error(&self, message: &str) {
        lock(&self.state).error = Some(message.to_string());
    }

    pub fn unset_error(&self) {
        lock(&self.state).error = None;
    }

    /// Fails operations on the identity with `resource_id` only.
    pub fn fail_identity(&self, resource_id: &str, message: &str) {
        lock(&self.state)
            .failing
            .insert(resource_id.to_string(), message.to_string());
    }

    /// Runs `node` on `target` together with every other node sharing it, the
    /// way scale set instances share identities.
    pub fn share_target(&self, node: &str, target: &str) {
        lock(&self.state)
            .targets
            .insert(node.to_string(), target.to_string());
    }

    /// Holds every attach and detach until [`MemoryCloud::resume`].
    pub fn pause(&self) {
        self.gate.send_replace(false);
    }

    pub fn resume(&self) {
        self.gate.send_replace(true);
    }

    pub fn calls(&self) -> Vec<CloudCall> {
        lock(&self.state).calls.clone()
    }

    /// Number of operations started while another one on the same placement
    /// was still running.
    pub fn overlapping_calls(&self) -> usize {
        lock(&self.state).overlapping
    }

    pub fn is_attached(&self, node: &str, resource_id: &str) -> bool {
        let state = lock(&self.state);
        state
            .attached
            .contains(&(state.placement(node), resource_id.to_string()))
    }

    /// Marks an operation on `node`'s placement as running, then yields so
    /// that other operations polled alongside it get to start first.
    async fn begin(&self, node: &Node) -> String {
        let placement = {
            let mut state = lock(&self.state);
            let placement = state.placement(&node.name_any());
            let running = state.in_flight.entry(placement.clone()).or_default();
            *running += 1;
            if *running > 1 {
                state.overlapping += 1;
            }
            placement
        };
        let mut open = self.gate.subscribe();
        let _ = open.wait_for(|open| *open).await;
        tokio::task::yield_now().await;
        placement
    }
}

impl CloudProvider for MemoryCloud {
    fn placement(&self, node: &Node) -> String {
        lock(&self.state).placement(&node.name_any())
    }

    async fn attach(&self, identity: &IdentityRef, node: &Node) -> Result<(), CloudError> {
        let placement = self.begin(node).await;
        let mut state = lock(&self.state);
        if let Some(running) = state.in_flight.get_mut(&placement) {
            *running -= 1;
        }
        state.calls.push(CloudCall::Attach {
            identity: identity.resource_id.clone(),
            node: node.name_any(),
        });
        if let Some(err) = state.failure(identity) {
            return Err(err);
        }
        state
            .attached
            .insert((placement, identity.resource_id.clone()));
        Ok(())
    }

    async fn detach(&self, identity: &IdentityRef, node: &Node) -> Result<(), CloudError> {
        let placement = self.begin(node).await;
        let mut state = lock(&self.state);
        if let Some(running) = state.in_flight.get_mut(&placement) {
            *running -= 1;
        }
        state.calls.push(CloudCall::Detach {
            identity: identity.resource_id.clone(),
            node: node.name_any(),
        });
        if let Some(err) = state.failure(identity) {
            return Err(err);
        }
        state
            .attached
            .remove(&(placement, identity.resource_id.clone()));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub severity: Severity,
    pub reason: String,
    pub message: String,
    pub regarding: Option<String>,
}

/// Event sink that keeps every event in order.
#[derive(Default)]
pub struct MemoryEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<RecordedEvent> {
        lock(&self.events).clone()
    }

    pub fn last(&self) -> Option<RecordedEvent> {
        lock(&self.events).last().cloned()
    }

    pub fn with_reason(&self, reason: &str) -> Vec<RecordedEvent> {
        lock(&self.events)
            .iter()
            .filter(|e| e.reason == reason)
            .cloned()
            .collect()
    }

    /// True if an event with exactly this severity, reason and message was
    /// recorded.
    pub fn contains(&self, severity: Severity, reason: &str, message: &str) -> bool {
        lock(&self.events)
            .iter()
            .any(|e| e.severity == severity && e.reason == reason && e.message == message)
    }
}

impl EventSink for MemoryEvents {
    fn record(
        &self,
        regarding: &ObjectReference,
        severity: Severity,
        reason: &str,
        message: String,
    ) {
        lock(&self.events).push(RecordedEvent {
            severity,
            reason: reason.to_string(),
            message,
            regarding: regarding.name.clone(),
        });
    }
}
