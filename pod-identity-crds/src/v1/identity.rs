use kube::{CustomResource, KubeSchema};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A cloud managed identity that can be attached to cluster nodes.
#[derive(
    CustomResource, KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug,
)]
#[kube(
    group = "aadpodidentity.k8s.io",
    version = "v1",
    kind = "AzureIdentity",
    plural = "azureidentities",
    derive = "Default",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AzureIdentitySpec {
    #[serde(rename = "type")]
    pub identity_type: IdentityType,
    pub resource_id: String,
    #[serde(default)]
    pub client_id: String,
}

#[derive(JsonSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Copy, Debug)]
pub enum IdentityType {
    #[default]
    UserAssigned,
    SystemAssigned,
}
