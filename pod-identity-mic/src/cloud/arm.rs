use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use pod_identity_crds::v1::{assigned::IdentityRef, identity::IdentityType};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{CloudError, CloudProvider};

pub const DEFAULT_ENDPOINT: &str = "https://management.azure.com";
pub const DEFAULT_API_VERSION: &str = "2022-03-01";

const PROVIDER_ID_PREFIX: &str = "azure://";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ArmConfig {
    pub endpoint: String,
    pub api_version: String,
    /// File holding a bearer token for the management API. Read on every
    /// request so a rotated token is picked up.
    pub token_file: PathBuf,
    pub request_timeout: Duration,
}

impl ArmConfig {
    pub fn new(token_file: impl Into<PathBuf>) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.into(),
            api_version: DEFAULT_API_VERSION.into(),
            token_file: token_file.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Compute resource whose identity list is changed for a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeTarget {
    VirtualMachine(String),
    /// Scale set instances share the identities of their scale set.
    ScaleSet(String),
}

impl ComputeTarget {
    pub fn resource_id(&self) -> &str {
        match self {
            ComputeTarget::VirtualMachine(id) | ComputeTarget::ScaleSet(id) => id,
        }
    }
}

/// Parses a node provider id such as
/// `azure:///subscriptions/<sub>/resourceGroups/<rg>/providers/Microsoft.Compute/virtualMachines/<vm>`.
pub fn parse_provider_id(provider_id: &str) -> Option<ComputeTarget> {
    let path = provider_id.strip_prefix(PROVIDER_ID_PREFIX)?;
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let is = |index: usize, expected: &str| {
        segments
            .get(index)
            .is_some_and(|s| s.eq_ignore_ascii_case(expected))
    };
    if !(is(0, "subscriptions")
        && is(2, "resourceGroups")
        && is(4, "providers")
        && is(5, "Microsoft.Compute"))
    {
        return None;
    }
    let (subscription, group) = (segments[1], segments[3]);

    match segments.len() {
        8 if is(6, "virtualMachines") => Some(ComputeTarget::VirtualMachine(format!(
            "/subscriptions/{subscription}/resourceGroups/{group}/providers/Microsoft.Compute/virtualMachines/{}",
            segments[7]
        ))),
        10 if is(6, "virtualMachineScaleSets") && is(8, "virtualMachines") => {
            Some(ComputeTarget::ScaleSet(format!(
                "/subscriptions/{subscription}/resourceGroups/{group}/providers/Microsoft.Compute/virtualMachineScaleSets/{}",
                segments[7]
            )))
        }
        _ => None,
    }
}

pub fn node_target(node: &Node) -> Result<ComputeTarget, CloudError> {
    node.spec
        .as_ref()
        .and_then(|spec| spec.provider_id.as_deref())
        .and_then(parse_provider_id)
        .ok_or_else(|| CloudError::InvalidProviderId(node.name_any()))
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceIdentity {
    #[serde(rename = "type", default)]
    pub identity_type: Option<String>,
    #[serde(default)]
    pub user_assigned_identities: Option<BTreeMap<String, Value>>,
}

impl ResourceIdentity {
    fn has_system(&self) -> bool {
        self.identity_type
            .as_deref()
            .is_some_and(|t| t.split(',').any(|p| p.trim() == "SystemAssigned"))
    }

    fn user_identities(&self) -> impl Iterator<Item = &str> {
        self.user_assigned_identities
            .iter()
            .flat_map(|ids| ids.keys().map(String::as_str))
    }

    fn has_user(&self, resource_id: &str) -> bool {
        self.user_identities()
            .any(|id| id.eq_ignore_ascii_case(resource_id))
    }
}

#[derive(Debug, Default, Deserialize)]
struct ComputeResource {
    #[serde(default)]
    identity: Option<ResourceIdentity>,
}

fn identity_type(system: bool, user: bool) -> &'static str {
    match (system, user) {
        (true, true) => "SystemAssigned, UserAssigned",
        (true, false) => "SystemAssigned",
        (false, true) => "UserAssigned",
        (false, false) => "None",
    }
}

/// PATCH body adding `identity`, or `None` when it is already present.
pub fn attach_patch(current: &ResourceIdentity, identity: &IdentityRef) -> Option<Value> {
    let system = current.has_system();
    let users = current.user_identities().next().is_some();
    match identity.identity_type {
        IdentityType::SystemAssigned if system => None,
        IdentityType::SystemAssigned => Some(json!({
            "identity": { "type": identity_type(true, users) }
        })),
        IdentityType::UserAssigned if current.has_user(&identity.resource_id) => None,
        IdentityType::UserAssigned => Some(json!({
            "identity": {
                "type": identity_type(system, true),
                "userAssignedIdentities": { identity.resource_id.as_str(): {} },
            }
        })),
    }
}

/// PATCH body removing `identity`, or `None` when nothing changes. A system
/// assigned identity is never removed; other workloads may rely on it.
pub fn detach_patch(current: &ResourceIdentity, identity: &IdentityRef) -> Option<Value> {
    if identity.identity_type == IdentityType::SystemAssigned
        || !current.has_user(&identity.resource_id)
    {
        return None;
    }
    let system = current.has_system();
    let remaining = current
        .user_identities()
        .any(|id| !id.eq_ignore_ascii_case(&identity.resource_id));
    if !remaining {
        return Some(json!({ "identity": { "type": identity_type(system, false) } }));
    }
    // The stored key may differ in case from the identity's resource id.
    let removed: BTreeMap<&str, Value> = current
        .user_identities()
        .filter(|id| id.eq_ignore_ascii_case(&identity.resource_id))
        .map(|id| (id, Value::Null))
        .collect();
    Some(json!({
        "identity": {
            "type": identity_type(system, true),
            "userAssignedIdentities": removed,
        }
    }))
}

/// Attaches identities by patching the node's virtual machine or scale set
/// through Azure Resource Manager.
pub struct ArmCloudProvider {
    client: reqwest::Client,
    config: ArmConfig,
}

impl ArmCloudProvider {
    pub fn new(config: ArmConfig) -> Result<Self, CloudError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn url(&self, target: &ComputeTarget) -> String {
        format!(
            "{}{}?api-version={}",
            self.config.endpoint.trim_end_matches('/'),
            target.resource_id(),
            self.config.api_version
        )
    }

    async fn token(&self) -> Result<String, CloudError> {
        let token = tokio::fs::read_to_string(&self.config.token_file).await?;
        Ok(token.trim().to_string())
    }

    async fn current_identity(
        &self,
        target: &ComputeTarget,
    ) -> Result<ResourceIdentity, CloudError> {
        let response = self
            .client
            .get(self.url(target))
            .bearer_auth(self.token().await?)
            .send()
            .await?;
        let response = check_status(response).await?;
        let resource = response.json::<ComputeResource>().await?;
        Ok(resource.identity.unwrap_or_default())
    }

    async fn patch(&self, target: &ComputeTarget, body: &Value) -> Result<(), CloudError> {
        let response = self
            .client
            .patch(self.url(target))
            .bearer_auth(self.token().await?)
            .json(body)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn update(
        &self,
        identity: &IdentityRef,
        node: &Node,
        patch_for: fn(&ResourceIdentity, &IdentityRef) -> Option<Value>,
    ) -> Result<(), CloudError> {
        let target = node_target(node)?;
        let current = self.current_identity(&target).await?;
        match patch_for(&current, identity) {
            Some(body) => self.patch(&target, &body).await,
            None => {
                debug!(
                    "identity {} already in desired state on {}",
                    identity.name,
                    target.resource_id()
                );
                Ok(())
            }
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, CloudError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(CloudError::Status {
        status: status.as_u16(),
        body,
    })
}

impl CloudProvider for ArmCloudProvider {
    /// Scale set instances share the scale set's identities.
    fn placement(&self, node: &Node) -> String {
        node_target(node)
            .map(|target| target.resource_id().to_ascii_lowercase())
            .unwrap_or_else(|_| node.name_any())
    }

    async fn attach(&self, identity: &IdentityRef, node: &Node) -> Result<(), CloudError> {
        self.update(identity, node, attach_patch).await
    }

    async fn detach(&self, identity: &IdentityRef, node: &Node) -> Result<(), CloudError> {
        self.update(identity, node, detach_patch).await
    }
}
