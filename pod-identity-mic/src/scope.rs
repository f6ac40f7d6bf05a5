//! Namespace scoping and label selection between pods, bindings and
//! identities. Objects in the `default` namespace act cluster-wide.

use k8s_openapi::api::core::v1::Pod;
use kube::{ResourceExt, core::SelectorExt};
use pod_identity_crds::v1::{binding::AzureIdentityBinding, identity::AzureIdentity};

pub const DEFAULT_NAMESPACE: &str = "default";

/// A binding is visible to pods of its own namespace, or to every pod when it
/// lives in `default`.
pub fn binding_visible_to_pod(binding_namespace: &str, pod_namespace: &str) -> bool {
    binding_namespace == pod_namespace || binding_namespace == DEFAULT_NAMESPACE
}

/// A binding may reference identities of its own namespace or of `default`.
pub fn identity_usable_by_binding(identity_namespace: &str, binding_namespace: &str) -> bool {
    identity_namespace == binding_namespace || identity_namespace == DEFAULT_NAMESPACE
}

pub fn namespaces_in_scope(
    pod_namespace: &str,
    binding_namespace: &str,
    identity_namespace: &str,
) -> bool {
    binding_visible_to_pod(binding_namespace, pod_namespace)
        && identity_usable_by_binding(identity_namespace, binding_namespace)
}

/// Namespace visibility plus the binding's label selector against the pod.
pub fn binding_selects_pod(binding: &AzureIdentityBinding, pod: &Pod) -> bool {
    let Some(pod_namespace) = pod.namespace() else {
        return false;
    };
    let Some(binding_namespace) = binding.namespace() else {
        return false;
    };
    if !binding_visible_to_pod(&binding_namespace, &pod_namespace) {
        return false;
    }

    let Some(selector) = binding.pod_selector() else {
        return false;
    };
    selector.matches(pod.labels())
}

pub fn binding_resolves_identity(binding: &AzureIdentityBinding, identity: &AzureIdentity) -> bool {
    let Some(binding_namespace) = binding.namespace() else {
        return false;
    };
    let Some(identity_namespace) = identity.namespace() else {
        return false;
    };
    identity_usable_by_binding(&identity_namespace, &binding_namespace)
}
