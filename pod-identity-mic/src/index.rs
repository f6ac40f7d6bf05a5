use std::collections::HashMap;
use std::sync::Arc;

use kube::ResourceExt;
use pod_identity_crds::v1::identity::AzureIdentity;

/// Indexes `items` by object name. Later entries replace earlier ones; every
/// name seen more than once is reported in the returned list, once per extra
/// occurrence.
pub fn index_by_name<K: ResourceExt>(items: &[Arc<K>]) -> (HashMap<String, Arc<K>>, Vec<String>) {
    let mut by_name = HashMap::with_capacity(items.len());
    let mut duplicates = Vec::new();
    for item in items {
        let name = item.name_any();
        if by_name.insert(name.clone(), item.clone()).is_some() {
            duplicates.push(name);
        }
    }
    (by_name, duplicates)
}

/// Name lookup over the identities listed for one pass.
#[derive(Debug, Default)]
pub struct IdentityIndex {
    by_name: HashMap<String, Arc<AzureIdentity>>,
    duplicates: Vec<String>,
}

impl IdentityIndex {
    pub fn build(identities: &[Arc<AzureIdentity>]) -> Self {
        let (by_name, duplicates) = index_by_name(identities);
        Self {
            by_name,
            duplicates,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<AzureIdentity>> {
        self.by_name.get(name)
    }

    /// Names that appeared more than once in the input.
    pub fn duplicates(&self) -> &[String] {
        &self.duplicates
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
