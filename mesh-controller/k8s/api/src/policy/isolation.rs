use crate::PolicyStatus;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Address ranges whose workloads are cut off from the mesh.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "policy.flomesh.io",
    version = "v1alpha1",
    kind = "Isolation",
    status = "PolicyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct IsolationSpec {
    #[serde(default)]
    pub cidrs: Vec<String>,
}
