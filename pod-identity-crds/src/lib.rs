use thiserror::Error;

pub mod v1;

use kube::CustomResourceExt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("yaml error: {0}")]
    YamlError(#[from] serde_yaml::Error),
}

pub fn crd_gen_all() -> Result<()> {
    let crds = vec![
        v1::identity::AzureIdentity::crd(),
        v1::binding::AzureIdentityBinding::crd(),
        v1::assigned::AzureAssignedIdentity::crd(),
    ];
    for crd in crds {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
