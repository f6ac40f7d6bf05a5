use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{
    CustomResource, KubeSchema,
    core::{Expression, Selector},
};
use serde::{Deserialize, Serialize};

/// Pod label whose value is compared against `spec.selector`.
pub const BINDING_LABEL: &str = "aadpodidbinding";

/// Grants pods matching a selector the use of a named `AzureIdentity`.
#[derive(CustomResource, KubeSchema, Serialize, Deserialize, Default, PartialEq, Clone, Debug)]
#[kube(
    group = "aadpodidentity.k8s.io",
    version = "v1",
    kind = "AzureIdentityBinding",
    derive = "Default",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AzureIdentityBindingSpec {
    pub azure_identity: String,
    #[serde(default)]
    pub selector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<LabelSelector>,
}

impl AzureIdentityBinding {
    /// Selector applied to pod labels. `podSelector` wins over the
    /// `aadpodidbinding` shorthand. `None` means the binding selects nothing.
    pub fn pod_selector(&self) -> Option<Selector> {
        if let Some(selector) = &self.spec.pod_selector {
            return Selector::try_from(selector.clone()).ok();
        }
        if self.spec.selector.is_empty() {
            return None;
        }
        Some(Expression::Equal(BINDING_LABEL.into(), self.spec.selector.clone()).into())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
    use kube::core::SelectorExt;

    use super::{AzureIdentityBinding, AzureIdentityBindingSpec, BINDING_LABEL};

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn shorthand_selector_matches_binding_label() {
        let binding = AzureIdentityBinding::new(
            "binding-a",
            AzureIdentityBindingSpec {
                azure_identity: "id-a".into(),
                selector: "frontend".into(),
                pod_selector: None,
            },
        );
        let selector = binding.pod_selector().expect("selector");

        assert!(selector.matches(&labels(&[(BINDING_LABEL, "frontend"), ("app", "web")])));
        assert!(!selector.matches(&labels(&[(BINDING_LABEL, "backend")])));
        assert!(!selector.matches(&labels(&[("app", "web")])));
    }

    #[test]
    fn empty_shorthand_selects_nothing() {
        let binding = AzureIdentityBinding::new(
            "binding-a",
            AzureIdentityBindingSpec {
                azure_identity: "id-a".into(),
                ..Default::default()
            },
        );
        assert!(binding.pod_selector().is_none());
    }

    #[test]
    fn pod_selector_takes_precedence() {
        let binding = AzureIdentityBinding::new(
            "binding-a",
            AzureIdentityBindingSpec {
                azure_identity: "id-a".into(),
                selector: "ignored".into(),
                pod_selector: Some(LabelSelector {
                    match_labels: None,
                    match_expressions: Some(vec![LabelSelectorRequirement {
                        key: "tier".into(),
                        operator: "In".into(),
                        values: Some(vec!["backend".into(), "worker".into()]),
                    }]),
                }),
            },
        );
        let selector = binding.pod_selector().expect("selector");

        assert!(selector.matches(&labels(&[("tier", "worker")])));
        assert!(!selector.matches(&labels(&[(BINDING_LABEL, "ignored")])));
    }
}
