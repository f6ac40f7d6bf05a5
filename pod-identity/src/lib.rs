pub mod config;
pub mod controller;
pub mod http;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("mic error: {0}")]
    Mic(#[from] pod_identity_mic::Error),

    #[error("cloud provider error: {0}")]
    Cloud(#[from] pod_identity_mic::cloud::CloudError),

    #[error("failed to generate crds: {0}")]
    Crd(#[from] pod_identity_crds::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
