use std::collections::BTreeMap;

use pod_identity_crds::v1::assigned::AzureAssignedIdentity;
use tracing::debug;

use crate::{Result, diff::by_key, source::CrdSource};

/// Mutations of the persisted assigned identity collection.
pub struct AssignmentStore<'a, S> {
    source: &'a S,
}

impl<'a, S: CrdSource> AssignmentStore<'a, S> {
    pub fn new(source: &'a S) -> Self {
        Self { source }
    }

    pub async fn list(&self) -> Result<BTreeMap<String, AzureAssignedIdentity>> {
        Ok(by_key(self.source.list_assigned_identities().await?))
    }

    pub async fn create(&self, record: &AzureAssignedIdentity) -> Result<()> {
        self.source.create_assigned_identity(record).await?;
        debug!("created assigned identity {}", record.key());
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.source.delete_assigned_identity(key).await?;
        debug!("deleted assigned identity {}", key);
        Ok(())
    }
}
