use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{
    Api, ResourceExt,
    api::{DeleteParams, ListParams, PostParams},
    runtime::reflector::Store,
};
use pod_identity_crds::v1::{
    assigned::AzureAssignedIdentity, binding::AzureIdentityBinding, identity::AzureIdentity,
};
use tracing::debug;

use crate::{
    Error, Result,
    source::{CrdSource, NodeSource, PodSource},
};

/// Cluster access backed by reflector stores for the watched resources and
/// the API server for assigned identities, which are always read live.
pub struct KubeSource {
    pods: Store<Pod>,
    nodes: Store<Node>,
    identities: Store<AzureIdentity>,
    bindings: Store<AzureIdentityBinding>,
    assigned: Api<AzureAssignedIdentity>,
}

impl KubeSource {
    pub fn new(
        pods: Store<Pod>,
        nodes: Store<Node>,
        identities: Store<AzureIdentity>,
        bindings: Store<AzureIdentityBinding>,
        assigned: Api<AzureAssignedIdentity>,
    ) -> Self {
        Self {
            pods,
            nodes,
            identities,
            bindings,
            assigned,
        }
    }
}

impl PodSource for KubeSource {
    async fn list_pods(&self) -> Result<Vec<Arc<Pod>>> {
        Ok(self.pods.state())
    }
}

impl NodeSource for KubeSource {
    async fn list_nodes(&self) -> Result<Vec<Arc<Node>>> {
        Ok(self.nodes.state())
    }
}

impl CrdSource for KubeSource {
    async fn list_identities(&self) -> Result<Vec<Arc<AzureIdentity>>> {
        Ok(self.identities.state())
    }

    async fn list_bindings(&self) -> Result<Vec<Arc<AzureIdentityBinding>>> {
        Ok(self.bindings.state())
    }

    async fn list_assigned_identities(&self) -> Result<Vec<AzureAssignedIdentity>> {
        let list = self
            .assigned
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::Snapshot {
                resource: "assigned identities",
                reason: e.to_string(),
            })?;
        Ok(list.items)
    }

    async fn create_assigned_identity(&self, record: &AzureAssignedIdentity) -> Result<()> {
        match self.assigned.create(&PostParams::default(), record).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!("assigned identity {} already exists", record.name_any());
                Ok(())
            }
            Err(e) => Err(Error::Store(e.to_string())),
        }
    }

    async fn delete_assigned_identity(&self, key: &str) -> Result<()> {
        match self.assigned.delete(key, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!("assigned identity {key} already deleted");
                Ok(())
            }
            Err(e) => Err(Error::Store(e.to_string())),
        }
    }
}
