use super::Catalog;
use fsm_mesh_controller_core::MeshService;
use fsm_mesh_controller_k8s_api::{
    plugin::{ChainSelectorSpec, ChainSpec},
    Labels, ResourceExt,
};

const SERVICE_KIND: &str = "Service";

/// A plugin script distributed to every proxy.
#[derive(Clone, Debug, PartialEq)]
pub struct PluginScript {
    pub name: String,

    /// Higher priorities run earlier within a mount point.
    pub priority: f32,
    pub script: String,
}

/// Plugins mounted on the proxies of the workloads a PluginChain selects.
#[derive(Clone, Debug, PartialEq)]
pub struct PluginChainEntry {
    pub name: String,
    pub namespace: String,
    pub chains: Vec<ChainSpec>,
    pub selectors: ChainSelectorSpec,
}

/// Configuration of a plugin for traffic to the referenced services.
#[derive(Clone, Debug, PartialEq)]
pub struct PluginConfigEntry {
    pub name: String,
    pub namespace: String,
    pub plugin: String,
    pub destinations: Vec<MeshService>,
    pub config: serde_json::Value,
}

impl Catalog<'_> {
    pub fn get_plugins(&self) -> Vec<PluginScript> {
        if !self.config.feature_flags().enable_plugin_policy {
            return Vec::new();
        }
        self.index
            .plugins
            .iter()
            .map(|plugin| PluginScript {
                name: plugin.name_unchecked(),
                priority: plugin.spec.priority,
                script: plugin.spec.pipyscript.clone(),
            })
            .collect()
    }

    pub fn get_plugin_chains(&self) -> Vec<PluginChainEntry> {
        if !self.config.feature_flags().enable_plugin_policy {
            return Vec::new();
        }
        self.index
            .plugin_chains
            .iter()
            .map(|chain| PluginChainEntry {
                name: chain.name_unchecked(),
                namespace: chain.namespace().unwrap_or_default(),
                chains: chain.spec.chains.clone(),
                selectors: chain.spec.selectors.clone(),
            })
            .collect()
    }

    /// PluginConfigs with their `Service` destination references. Other reference kinds are
    /// ignored; a reference without a namespace names a service in the config's namespace.
    pub fn get_plugin_configs(&self) -> Vec<PluginConfigEntry> {
        if !self.config.feature_flags().enable_plugin_policy {
            return Vec::new();
        }
        self.index
            .plugin_configs
            .iter()
            .map(|pc| {
                let namespace = pc.namespace().unwrap_or_default();
                let destinations = pc
                    .spec
                    .destination_refs
                    .iter()
                    .filter(|dst| dst.kind == SERVICE_KIND)
                    .map(|dst| MeshService {
                        namespace: if dst.namespace.is_empty() {
                            namespace.clone()
                        } else {
                            dst.namespace.clone()
                        },
                        name: dst.name.clone(),
                        ..Default::default()
                    })
                    .collect();
                PluginConfigEntry {
                    name: pc.name_unchecked(),
                    namespace,
                    plugin: pc.spec.plugin.clone(),
                    destinations,
                    config: pc.spec.config.clone(),
                }
            })
            .collect()
    }
}

// === impl PluginChainEntry ===

impl PluginChainEntry {
    /// Whether the chain applies to a workload. Absent selectors match everything.
    pub fn matches(&self, namespace_labels: &Labels, workload_labels: &Labels) -> bool {
        let ns = self
            .selectors
            .namespace_selector
            .as_ref()
            .is_none_or(|s| s.matches(namespace_labels));
        let pod = self
            .selectors
            .pod_selector
            .as_ref()
            .is_none_or(|s| s.matches(workload_labels));
        ns && pod
    }
}
