pub mod arm;

use std::future::Future;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use pod_identity_crds::v1::assigned::IdentityRef;
use thiserror::Error;

/// Failure of a single attach or detach. Only its message is surfaced, inside
/// Warning events; the controller never inspects it for retryability.
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("cloud provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("node {0} has no usable provider id")]
    InvalidProviderId(String),

    #[error("failed to read access token: {0}")]
    Token(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub trait CloudProvider: Send + Sync {
    /// Names the cloud resource carrying `node`'s identities. Nodes with the
    /// same placement share attached identities, and the controller never
    /// runs two operations on one placement at the same time.
    fn placement(&self, node: &Node) -> String {
        node.name_any()
    }

    /// Makes `identity` available on `node`. Attaching an identity that is
    /// already present succeeds.
    fn attach(
        &self,
        identity: &IdentityRef,
        node: &Node,
    ) -> impl Future<Output = Result<(), CloudError>> + Send;

    /// Removes `identity` from `node`. Detaching an absent identity succeeds.
    fn detach(
        &self,
        identity: &IdentityRef,
        node: &Node,
    ) -> impl Future<Output = Result<(), CloudError>> + Send;
}

impl<T: CloudProvider> CloudProvider for std::sync::Arc<T> {
    fn placement(&self, node: &Node) -> String {
        (**self).placement(node)
    }

    fn attach(
        &self,
        identity: &IdentityRef,
        node: &Node,
    ) -> impl Future<Output = Result<(), CloudError>> + Send {
        (**self).attach(identity, node)
    }

    fn detach(
        &self,
        identity: &IdentityRef,
        node: &Node,
    ) -> impl Future<Output = Result<(), CloudError>> + Send {
        (**self).detach(identity, node)
    }
}
