use super::{MatchRef, PortSpec};
use crate::{NamespacedRef, PolicyStatus};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Allows workloads to reach destinations outside the mesh.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "policy.flomesh.io",
    version = "v1alpha1",
    kind = "Egress",
    status = "PolicyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EgressSpec {
    pub sources: Vec<EgressSourceSpec>,

    /// Hostnames matched by HTTP and HTTPS egress.
    #[serde(default)]
    pub hosts: Vec<String>,

    /// CIDRs matched by TCP egress.
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    pub ports: Vec<PortSpec>,
    #[serde(default)]
    pub matches: Vec<MatchRef>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EgressSourceSpec {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtls: Option<SourceMtlsSpec>,
}

/// The client certificate presented to the egress destination.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceMtlsSpec {
    /// `fsm` selects the proxy's own mesh certificate.
    pub issuer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<SourceCertSpec>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceCertSpec {
    #[serde(default)]
    pub sn: u64,
    #[serde(default)]
    pub subject_alt_names: Vec<String>,
    #[serde(default)]
    pub expiration: String,
    pub secret: NamespacedRef,
}

// === impl SourceMtlsSpec ===

impl SourceMtlsSpec {
    pub fn is_mesh_issued(&self) -> bool {
        self.issuer.eq_ignore_ascii_case("fsm")
    }
}
