use kube::{CustomResource, KubeSchema, ResourceExt};
use serde::{Deserialize, Serialize};

use crate::v1::{
    binding::AzureIdentityBinding,
    identity::{AzureIdentity, IdentityType},
};

/// Durable record that an identity is attached to a node on behalf of a pod.
///
/// The object name is the assignment key, see [`assigned_identity_key`].
#[derive(
    CustomResource, KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug,
)]
#[kube(
    group = "aadpodidentity.k8s.io",
    version = "v1",
    kind = "AzureAssignedIdentity",
    plural = "azureassignedidentities",
    derive = "Default",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AzureAssignedIdentitySpec {
    pub pod: String,
    pub pod_namespace: String,
    pub node_name: String,
    pub binding_ref: BindingRef,
    pub identity_ref: IdentityRef,
}

#[derive(KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug)]
pub struct BindingRef {
    pub name: String,
    pub namespace: String,
}

/// Identity coordinates copied at assignment time so the identity can be
/// detached after its `AzureIdentity` is gone.
#[derive(KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRef {
    pub name: String,
    pub namespace: String,
    #[serde(rename = "type")]
    pub identity_type: IdentityType,
    pub resource_id: String,
    #[serde(default)]
    pub client_id: String,
}

pub fn assigned_identity_key(pod: &str, pod_namespace: &str, identity: &str) -> String {
    format!("{pod}-{pod_namespace}-{identity}")
}

impl From<&AzureIdentityBinding> for BindingRef {
    fn from(binding: &AzureIdentityBinding) -> Self {
        Self {
            name: binding.name_any(),
            namespace: binding.namespace().unwrap_or_default(),
        }
    }
}

impl From<&AzureIdentity> for IdentityRef {
    fn from(identity: &AzureIdentity) -> Self {
        Self {
            name: identity.name_any(),
            namespace: identity.namespace().unwrap_or_default(),
            identity_type: identity.spec.identity_type,
            resource_id: identity.spec.resource_id.clone(),
            client_id: identity.spec.client_id.clone(),
        }
    }
}

impl AzureAssignedIdentity {
    /// Builds a record named by its assignment key inside `namespace`.
    pub fn assign(namespace: &str, spec: AzureAssignedIdentitySpec) -> Self {
        let key = assigned_identity_key(&spec.pod, &spec.pod_namespace, &spec.identity_ref.name);
        let mut assigned = Self::new(&key, spec);
        assigned.metadata.namespace = Some(namespace.to_string());
        assigned
    }

    pub fn key(&self) -> String {
        self.name_any()
    }
}
