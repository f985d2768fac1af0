use crate::{labels::Selector, PolicyStatus};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A script loaded into every proxy's plugin codebase.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "plugin.flomesh.io",
    version = "v1alpha1",
    kind = "Plugin",
    status = "PolicyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct PluginSpec {
    /// Higher priorities run earlier within a mount point.
    #[serde(default)]
    pub priority: f32,
    pub pipyscript: String,
}

/// Mounts plugins onto the proxies of selected workloads.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "plugin.flomesh.io",
    version = "v1alpha1",
    kind = "PluginChain",
    status = "PolicyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PluginChainSpec {
    pub chains: Vec<ChainSpec>,
    #[serde(default)]
    pub selectors: ChainSelectorSpec,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChainSpec {
    /// The mount point, e.g. `inbound-http`.
    pub name: String,
    pub plugins: Vec<String>,
}

/// Absent selectors match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChainSelectorSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<Selector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<Selector>,
}

/// Configuration handed to a plugin for traffic to the referenced services.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "plugin.flomesh.io",
    version = "v1alpha1",
    kind = "PluginConfig",
    status = "PolicyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfigSpec {
    pub plugin: String,
    #[serde(default)]
    pub destination_refs: Vec<DestinationRef>,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DestinationRef {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}
