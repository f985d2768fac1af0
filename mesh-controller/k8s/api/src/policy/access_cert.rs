use crate::{NamespacedRef, PolicyStatus};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Requests a mesh-issued certificate for an external client, written into
/// the referenced Secret.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "policy.flomesh.io",
    version = "v1alpha1",
    kind = "AccessCert",
    status = "PolicyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AccessCertSpec {
    pub subject_alt_names: Vec<String>,
    pub secret: NamespacedRef,
}
