use std::future::Future;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Pod};
use pod_identity_crds::v1::{
    assigned::AzureAssignedIdentity, binding::AzureIdentityBinding, identity::AzureIdentity,
};

use crate::Result;

pub trait PodSource: Send + Sync {
    fn list_pods(&self) -> impl Future<Output = Result<Vec<Arc<Pod>>>> + Send;
}

pub trait NodeSource: Send + Sync {
    fn list_nodes(&self) -> impl Future<Output = Result<Vec<Arc<Node>>>> + Send;
}

/// Access to the identity CRDs, including the assigned identity collection
/// the controller owns.
pub trait CrdSource: Send + Sync {
    fn list_identities(&self) -> impl Future<Output = Result<Vec<Arc<AzureIdentity>>>> + Send;

    fn list_bindings(&self) -> impl Future<Output = Result<Vec<Arc<AzureIdentityBinding>>>> + Send;

    fn list_assigned_identities(
        &self,
    ) -> impl Future<Output = Result<Vec<AzureAssignedIdentity>>> + Send;

    /// Creating a record that already exists succeeds.
    fn create_assigned_identity(
        &self,
        record: &AzureAssignedIdentity,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Deleting a record that does not exist succeeds.
    fn delete_assigned_identity(&self, key: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Everything a pass reads from or writes to the cluster.
pub trait ClusterSource: PodSource + NodeSource + CrdSource {}

impl<T: PodSource + NodeSource + CrdSource> ClusterSource for T {}

impl<T: PodSource> PodSource for Arc<T> {
    fn list_pods(&self) -> impl Future<Output = Result<Vec<Arc<Pod>>>> + Send {
        (**self).list_pods()
    }
}

impl<T: NodeSource> NodeSource for Arc<T> {
    fn list_nodes(&self) -> impl Future<Output = Result<Vec<Arc<Node>>>> + Send {
        (**self).list_nodes()
    }
}

impl<T: CrdSource> CrdSource for Arc<T> {
    fn list_identities(&self) -> impl Future<Output = Result<Vec<Arc<AzureIdentity>>>> + Send {
        (**self).list_identities()
    }

    fn list_bindings(&self) -> impl Future<Output = Result<Vec<Arc<AzureIdentityBinding>>>> + Send {
        (**self).list_bindings()
    }

    fn list_assigned_identities(
        &self,
    ) -> impl Future<Output = Result<Vec<AzureAssignedIdentity>>> + Send {
        (**self).list_assigned_identities()
    }

    fn create_assigned_identity(
        &self,
        record: &AzureAssignedIdentity,
    ) -> impl Future<Output = Result<()>> + Send {
        (**self).create_assigned_identity(record)
    }

    fn delete_assigned_identity(&self, key: &str) -> impl Future<Output = Result<()>> + Send {
        (**self).delete_assigned_identity(key)
    }
}
