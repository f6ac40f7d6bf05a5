use std::collections::BTreeMap;

use pod_identity_crds::v1::assigned::AzureAssignedIdentity;

/// Work computed for one pass.
#[derive(Debug, Default, PartialEq)]
pub struct AssignmentDiff {
    pub to_create: Vec<AzureAssignedIdentity>,
    pub to_delete: Vec<AzureAssignedIdentity>,
}

impl AssignmentDiff {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_delete.is_empty()
    }
}

/// `to_create` holds desired records missing from `current`, `to_delete`
/// holds current records no longer desired. A key present on both sides is
/// left alone unless the record now points at another node or another cloud
/// identity, in which case the current record is deleted and the desired one
/// created.
pub fn diff_assignments(
    desired: &BTreeMap<String, AzureAssignedIdentity>,
    current: &BTreeMap<String, AzureAssignedIdentity>,
) -> AssignmentDiff {
    let mut diff = AssignmentDiff::default();

    for (key, wanted) in desired {
        match current.get(key) {
            None => diff.to_create.push(wanted.clone()),
            Some(existing) if !same_placement(existing, wanted) => {
                diff.to_delete.push(existing.clone());
                diff.to_create.push(wanted.clone());
            }
            Some(_) => {}
        }
    }

    for (key, existing) in current {
        if !desired.contains_key(key) {
            diff.to_delete.push(existing.clone());
        }
    }

    diff
}

pub(crate) fn same_placement(a: &AzureAssignedIdentity, b: &AzureAssignedIdentity) -> bool {
    a.spec.node_name == b.spec.node_name
        && a.spec.identity_ref.resource_id == b.spec.identity_ref.resource_id
}

pub fn by_key(records: Vec<AzureAssignedIdentity>) -> BTreeMap<String, AzureAssignedIdentity> {
    records.into_iter().map(|r| (r.key(), r)).collect()
}
