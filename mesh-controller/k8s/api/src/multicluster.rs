//! Resources describing services shared between clusters.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A service from peer clusters, with the endpoints each cluster exposes.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "flomesh.io",
    version = "v1alpha1",
    kind = "ServiceImport",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceImportSpec {
    pub ports: Vec<ImportedPort>,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default, rename = "type")]
    pub import_type: String,
    #[serde(default)]
    pub service_account_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImportedPort {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_protocol: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub endpoints: Vec<ImportedEndpoint>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImportedEndpoint {
    pub target: Target,
    pub cluster_key: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Target {
    #[serde(default)]
    pub host: String,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub path: String,
}

/// Exposes a local service to peer clusters through the mesh gateway.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "flomesh.io",
    version = "v1alpha1",
    kind = "ServiceExport",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceExportSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_rewrite: Option<PathRewrite>,
    #[serde(default)]
    pub session_sticky: bool,
    #[serde(default)]
    pub load_balancer: String,
    #[serde(default)]
    pub rules: Vec<ServiceExportRule>,
    #[serde(default)]
    pub target_clusters: Vec<String>,
    #[serde(default)]
    pub service_account_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct PathRewrite {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceExportRule {
    pub port_number: u16,
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_type: Option<String>,
}

/// How traffic to a service is spread over local and imported endpoints.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "flomesh.io",
    version = "v1alpha1",
    kind = "GlobalTrafficPolicy",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct GlobalTrafficPolicySpec {
    /// `Locality`, `ActiveActive` or `FailOver`.
    #[serde(default = "locality")]
    pub lb_type: String,
    #[serde(default)]
    pub targets: Vec<TrafficTarget>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrafficTarget {
    pub cluster_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

fn locality() -> String {
    "Locality".to_string()
}
