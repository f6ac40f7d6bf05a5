use std::collections::{BTreeMap, HashMap, btree_map::Entry};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use pod_identity_crds::v1::{
    assigned::{AzureAssignedIdentity, AzureAssignedIdentitySpec, BindingRef, IdentityRef},
    binding::AzureIdentityBinding,
    identity::AzureIdentity,
};
use tracing::{debug, warn};

use crate::{
    index::IdentityIndex,
    scope::{binding_resolves_identity, binding_selects_pod},
};

/// Cluster state listed at the start of a pass. It is never mutated while
/// the pass runs.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub pods: Vec<Arc<Pod>>,
    pub bindings: Vec<Arc<AzureIdentityBinding>>,
    pub identities: Vec<Arc<AzureIdentity>>,
    nodes: HashMap<String, Arc<Node>>,
}

impl Snapshot {
    pub fn new(
        pods: Vec<Arc<Pod>>,
        nodes: Vec<Arc<Node>>,
        bindings: Vec<Arc<AzureIdentityBinding>>,
        identities: Vec<Arc<AzureIdentity>>,
    ) -> Self {
        let nodes = nodes.into_iter().map(|n| (n.name_any(), n)).collect();
        Self {
            pods,
            bindings,
            identities,
            nodes,
        }
    }

    pub fn node(&self, name: &str) -> Option<&Arc<Node>> {
        self.nodes.get(name)
    }
}

#[derive(Debug, Default)]
pub struct DesiredState {
    /// Assignments by key.
    pub assignments: BTreeMap<String, AzureAssignedIdentity>,
    pub duplicate_identities: Vec<String>,
    /// Keys claimed by more than one binding; the first binding listed wins.
    pub shadowed_keys: Vec<String>,
}

/// Computes every assignment the snapshot entitles pods to. Records are
/// placed in `assignment_namespace`.
pub fn build_desired_state(snapshot: &Snapshot, assignment_namespace: &str) -> DesiredState {
    let index = IdentityIndex::build(&snapshot.identities);
    for name in index.duplicates() {
        warn!(identity = %name, "duplicate identity name, using the last one listed");
    }

    let mut assignments = BTreeMap::new();
    let mut shadowed_keys = Vec::new();
    for pod in &snapshot.pods {
        let Some(node_name) = scheduled_node(pod) else {
            continue;
        };
        if snapshot.node(node_name).is_none() {
            debug!(
                "node {} of pod {}/{} not found",
                node_name,
                pod.namespace().unwrap_or_default(),
                pod.name_any()
            );
            continue;
        }

        for binding in &snapshot.bindings {
            if !binding_selects_pod(binding, pod) {
                continue;
            }
            let Some(identity) = index.get(&binding.spec.azure_identity) else {
                debug!(
                    "binding {}/{} references unknown identity {}",
                    binding.namespace().unwrap_or_default(),
                    binding.name_any(),
                    binding.spec.azure_identity
                );
                continue;
            };
            if !binding_resolves_identity(binding, identity) {
                continue;
            }

            let record = AzureAssignedIdentity::assign(
                assignment_namespace,
                AzureAssignedIdentitySpec {
                    pod: pod.name_any(),
                    pod_namespace: pod.namespace().unwrap_or_default(),
                    node_name: node_name.to_string(),
                    binding_ref: BindingRef::from(binding.as_ref()),
                    identity_ref: IdentityRef::from(identity.as_ref()),
                },
            );
            match assignments.entry(record.key()) {
                Entry::Vacant(entry) => {
                    entry.insert(record);
                }
                Entry::Occupied(entry) => {
                    warn!(
                        key = %entry.key(),
                        "binding {}/{} resolves to an assignment already claimed by binding {}",
                        binding.namespace().unwrap_or_default(),
                        binding.name_any(),
                        entry.get().spec.binding_ref.name
                    );
                    shadowed_keys.push(entry.key().clone());
                }
            }
        }
    }

    DesiredState {
        assignments,
        duplicate_identities: index.duplicates().to_vec(),
        shadowed_keys,
    }
}

/// Node a running pod is scheduled on. Terminated pods have no node.
fn scheduled_node(pod: &Pod) -> Option<&str> {
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    if matches!(phase, Some("Succeeded") | Some("Failed")) {
        return None;
    }
    pod.spec
        .as_ref()?
        .node_name
        .as_deref()
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use k8s_openapi::api::core::v1::PodStatus;
    use pod_identity_crds::v1::identity::IdentityType;

    use super::*;
    use crate::memory::{make_binding, make_identity, make_node, make_pod};

    fn snapshot(
        pods: Vec<Pod>,
        nodes: &[&str],
        bindings: Vec<AzureIdentityBinding>,
        identities: Vec<AzureIdentity>,
    ) -> Snapshot {
        Snapshot::new(
            pods.into_iter().map(Arc::new).collect(),
            nodes.iter().map(|n| Arc::new(make_node(n))).collect(),
            bindings.into_iter().map(Arc::new).collect(),
            identities.into_iter().map(Arc::new).collect(),
        )
    }

    fn user_identity(name: &str, namespace: &str) -> AzureIdentity {
        make_identity(
            name,
            namespace,
            IdentityType::UserAssigned,
            &format!("{name}-resourceid"),
            &format!("{name}-clientid"),
        )
    }

    #[test]
    fn matching_pod_yields_keyed_assignment() {
        let snapshot = snapshot(
            vec![make_pod("test-pod", "custom-app-ns", "test-node", "test-select")],
            &["test-node"],
            vec![make_binding("testbinding", "custom-app-ns", "test-id", "test-select")],
            vec![user_identity("test-id", "custom-app-ns")],
        );

        let desired = build_desired_state(&snapshot, "default");

        let record = desired
            .assignments
            .get("test-pod-custom-app-ns-test-id")
            .expect("assignment");
        assert_eq!(desired.assignments.len(), 1);
        assert_eq!(record.namespace().as_deref(), Some("default"));
        assert_eq!(record.spec.pod, "test-pod");
        assert_eq!(record.spec.pod_namespace, "custom-app-ns");
        assert_eq!(record.spec.node_name, "test-node");
        assert_eq!(record.spec.binding_ref.name, "testbinding");
        assert_eq!(record.spec.identity_ref.name, "test-id");
        assert_eq!(record.spec.identity_ref.resource_id, "test-id-resourceid");
    }

    #[test]
    fn unscheduled_pod_yields_nothing() {
        let snapshot = snapshot(
            vec![make_pod("test-pod", "default", "", "test-select")],
            &["test-node"],
            vec![make_binding("testbinding", "default", "test-id", "test-select")],
            vec![user_identity("test-id", "default")],
        );

        assert!(build_desired_state(&snapshot, "default").assignments.is_empty());
    }

    #[test]
    fn pod_on_unknown_node_yields_nothing() {
        let snapshot = snapshot(
            vec![make_pod("test-pod", "default", "gone-node", "test-select")],
            &["test-node"],
            vec![make_binding("testbinding", "default", "test-id", "test-select")],
            vec![user_identity("test-id", "default")],
        );

        assert!(build_desired_state(&snapshot, "default").assignments.is_empty());
    }

    #[test]
    fn terminated_pod_yields_nothing() {
        let mut pod = make_pod("test-pod", "default", "test-node", "test-select");
        pod.status = Some(PodStatus {
            phase: Some("Succeeded".into()),
            ..Default::default()
        });
        let snapshot = snapshot(
            vec![pod],
            &["test-node"],
            vec![make_binding("testbinding", "default", "test-id", "test-select")],
            vec![user_identity("test-id", "default")],
        );

        assert!(build_desired_state(&snapshot, "default").assignments.is_empty());
    }

    #[test]
    fn unknown_identity_is_skipped() {
        let snapshot = snapshot(
            vec![make_pod("test-pod", "default", "test-node", "test-select")],
            &["test-node"],
            vec![make_binding("testbinding", "default", "missing-id", "test-select")],
            vec![user_identity("test-id", "default")],
        );

        assert!(build_desired_state(&snapshot, "default").assignments.is_empty());
    }

    #[test]
    fn out_of_scope_identity_is_skipped() {
        let snapshot = snapshot(
            vec![make_pod("test-pod", "custom-app1-ns", "test-node", "test-select")],
            &["test-node"],
            vec![make_binding("testbinding", "default", "test-id", "test-select")],
            vec![user_identity("test-id", "custom-app2-ns")],
        );

        assert!(build_desired_state(&snapshot, "default").assignments.is_empty());
    }

    #[test]
    fn every_matching_binding_produces_an_assignment() {
        let snapshot = snapshot(
            vec![make_pod("test-pod", "custom-app-ns", "test-node", "test-select")],
            &["test-node"],
            vec![
                make_binding("binding-a", "custom-app-ns", "id-a", "test-select"),
                make_binding("binding-b", "default", "id-b", "test-select"),
            ],
            vec![
                user_identity("id-a", "custom-app-ns"),
                user_identity("id-b", "default"),
            ],
        );

        let desired = build_desired_state(&snapshot, "default");

        assert!(desired.shadowed_keys.is_empty());
        let keys: Vec<&str> = desired.assignments.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            ["test-pod-custom-app-ns-id-a", "test-pod-custom-app-ns-id-b"]
        );
    }

    #[test]
    fn bindings_to_the_same_identity_collapse_to_one_key() {
        let snapshot = snapshot(
            vec![make_pod("test-pod", "default", "test-node", "test-select")],
            &["test-node"],
            vec![
                make_binding("binding-a", "default", "test-id", "test-select"),
                make_binding("binding-b", "default", "test-id", "test-select"),
            ],
            vec![user_identity("test-id", "default")],
        );

        let desired = build_desired_state(&snapshot, "default");

        assert_eq!(desired.assignments.len(), 1);
        assert_eq!(
            desired.assignments["test-pod-default-test-id"].spec.binding_ref.name,
            "binding-a"
        );
        assert_eq!(desired.shadowed_keys, ["test-pod-default-test-id".to_string()]);
    }

    #[test]
    fn duplicate_identity_names_are_reported() {
        let snapshot = snapshot(
            vec![make_pod("test-pod", "default", "test-node", "test-select")],
            &["test-node"],
            vec![make_binding("testbinding", "default", "x", "test-select")],
            vec![user_identity("x", "default"), user_identity("x", "default")],
        );

        let desired = build_desired_state(&snapshot, "default");

        assert_eq!(desired.duplicate_identities, ["x".to_string()]);
        assert_eq!(desired.assignments.len(), 1);
    }
}
