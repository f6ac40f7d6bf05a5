use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("kube utils error: {0}")]
    KubeUtils(#[from] pod_identity_k8s_utils::Error),

    #[error("failed to list {resource}: {reason}")]
    Snapshot {
        resource: &'static str,
        reason: String,
    },

    #[error("assigned identity store error: {0}")]
    Store(String),
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::KubeError(_) => "kube".into(),
            Error::KubeUtils(_) => "kube_utils".into(),
            Error::Snapshot { resource, .. } => format!("snapshot_{resource}"),
            Error::Store(_) => "store".into(),
        }
    }
}
