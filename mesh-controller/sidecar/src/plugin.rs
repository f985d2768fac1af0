//! Plugin scripts and the chains that mount them.
//!
//! Plugin scripts are uploaded to the base codebase as `plugins/<name>.js` and versioned as a
//! set: the set version is a hash over every script's URI, priority and content. A proxy's
//! document names the set version it was resolved against so that a script change rebuilds
//! every proxy running it.

use crate::{document::Plugins, hash::hash};
use ahash::AHashMap as HashMap;
use fsm_mesh_controller_core::{constants::PLUGIN_CODEBASE_PREFIX, trafficpolicy::wire_protocol};
use fsm_mesh_controller_k8s_api::Labels;
use fsm_mesh_controller_k8s_index::{catalog::PluginScript, Catalog};
use fsm_mesh_controller_repo::{Batch, BatchItem, Repository, BASE_CODEBASE};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// The plugin scripts last uploaded to the repository.
#[derive(Debug, Default)]
pub struct PluginSet {
    state: RwLock<Uploaded>,
    update: tokio::sync::Mutex<()>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct Uploaded {
    /// Empty until a set was uploaded.
    pub(crate) version: String,
    pub(crate) priorities: HashMap<String, f32>,
}

/// The plugins mounted on one proxy, and their configuration per destination service.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct PluginPolicies {
    /// Mount point to plugin URIs, in the order they run.
    pub(crate) chains: BTreeMap<String, Vec<String>>,

    /// `namespace/name` of a service to plugin to mount point to configuration.
    configs: BTreeMap<String, BTreeMap<String, BTreeMap<String, Value>>>,
}

// === impl PluginSet ===

impl PluginSet {
    pub(crate) fn snapshot(&self) -> Uploaded {
        self.state.read().clone()
    }

    pub fn version(&self) -> String {
        self.state.read().version.clone()
    }

    /// Uploads the scripts to the base codebase, removing scripts that are no longer
    /// defined. Returns whether a new set version was published. The set is unchanged when
    /// the upload fails.
    pub async fn update(
        &self,
        repo: &dyn Repository,
        scripts: Vec<PluginScript>,
    ) -> Result<bool, crate::BuildError> {
        let _serialized = self.update.lock().await;

        let mut items = Vec::with_capacity(scripts.len());
        let mut versions = Vec::with_capacity(scripts.len());
        let mut priorities = HashMap::with_capacity(scripts.len());
        for script in &scripts {
            let uri = plugin_uri(&script.name);
            versions.push(format!(
                "{uri}:{:.6}:{}",
                script.priority,
                hash(&script.script)?
            ));
            items.push(BatchItem::text(uri, script.script.clone()));
            priorities.insert(script.name.clone(), script.priority);
        }

        let current = self.snapshot();
        let removed = current
            .priorities
            .keys()
            .filter(|name| !priorities.contains_key(*name))
            .collect::<BTreeSet<_>>();
        for name in removed {
            items.push(BatchItem::obsolete(plugin_uri(name)));
        }
        if items.is_empty() {
            return Ok(false);
        }

        versions.sort();
        let version = hash(&versions.concat())?;
        if current.version == version.to_string() {
            return Ok(false);
        }

        repo.batch(
            version,
            vec![Batch {
                basepath: BASE_CODEBASE.to_string(),
                items,
            }],
        )
        .await?;
        tracing::info!(version, plugins = scripts.len(), "Published plugin set");

        *self.state.write() = Uploaded {
            version: version.to_string(),
            priorities,
        };
        Ok(true)
    }
}

fn plugin_uri(name: &str) -> String {
    format!("{PLUGIN_CODEBASE_PREFIX}/{name}.js")
}

// === impl PluginPolicies ===

impl PluginPolicies {
    /// Resolves the chains mounted on a workload. Chains naming a plugin that is not in the
    /// uploaded set skip it and leave the result not ready.
    pub(crate) fn resolve(
        catalog: &Catalog<'_>,
        uploaded: &Uploaded,
        namespace_labels: &Labels,
        workload_labels: &Labels,
    ) -> (Self, bool) {
        let mut ready = true;
        let mut mounts_by_plugin = BTreeMap::<String, BTreeSet<String>>::new();
        let mut plugins_by_mount = BTreeMap::<String, BTreeSet<String>>::new();

        for entry in catalog.get_plugin_chains() {
            if !entry.matches(namespace_labels, workload_labels) {
                continue;
            }
            for chain in &entry.chains {
                for plugin in &chain.plugins {
                    if !uploaded.priorities.contains_key(plugin) {
                        if !uploaded.version.is_empty() {
                            tracing::warn!(%plugin, chain = %entry.name, namespace = %entry.namespace, "Plugin not found");
                        }
                        ready = false;
                        continue;
                    }
                    mounts_by_plugin
                        .entry(plugin.clone())
                        .or_default()
                        .insert(chain.name.clone());
                    plugins_by_mount
                        .entry(chain.name.clone())
                        .or_default()
                        .insert(plugin.clone());
                }
            }
        }

        let mut configs = BTreeMap::<String, BTreeMap<String, BTreeMap<String, Value>>>::new();
        for pc in catalog.get_plugin_configs() {
            let Some(mounts) = mounts_by_plugin.get(&pc.plugin) else {
                continue;
            };
            for dst in &pc.destinations {
                let by_mount = mounts
                    .iter()
                    .map(|mount| (mount.clone(), pc.config.clone()))
                    .collect();
                configs
                    .entry(dst.namespaced_name())
                    .or_default()
                    .insert(pc.plugin.clone(), by_mount);
            }
        }

        let mut policies = Self {
            chains: BTreeMap::new(),
            configs,
        };
        policies.set_chains(catalog, uploaded, plugins_by_mount);
        (policies, ready)
    }

    /// Only the built-in plugins the mesh config enables.
    pub(crate) fn global(catalog: &Catalog<'_>) -> Self {
        let mut policies = Self::default();
        policies.set_chains(catalog, &Uploaded::default(), BTreeMap::new());
        policies
    }

    fn set_chains(
        &mut self,
        catalog: &Catalog<'_>,
        uploaded: &Uploaded,
        plugins_by_mount: BTreeMap<String, BTreeSet<String>>,
    ) {
        let mut by_mount = BTreeMap::<String, Vec<(String, f32)>>::new();
        for (mount, global) in catalog.configurator().global_plugin_chains().enabled() {
            by_mount
                .entry(mount.to_string())
                .or_default()
                .push((format!("{}.js", global.plugin), global.priority));
        }
        for (mount, plugins) in plugins_by_mount {
            let entries = by_mount.entry(mount).or_default();
            for plugin in plugins {
                if let Some(&priority) = uploaded.priorities.get(&plugin) {
                    entries.push((plugin_uri(&plugin), priority));
                }
            }
        }

        for (mount, mut plugins) in by_mount {
            if plugins.is_empty() {
                continue;
            }
            plugins.sort_by(|(_, a), (_, b)| b.total_cmp(a));
            self.chains
                .insert(mount, plugins.into_iter().map(|(uri, _)| uri).collect());
        }
    }

    /// The plugin configuration for a traffic match, named
    /// `<direction>_<namespace/name>_<port>_<protocol>_...`. Ingress, access control and export
    /// matches use the inbound mount points.
    pub(crate) fn lookup(&self, traffic_match: &str) -> Plugins {
        let segs = traffic_match.split('_').collect::<Vec<_>>();
        if segs.len() < 4 {
            return Plugins::new();
        }
        let direction = match segs[0] {
            "ingress" | "acl" | "exp" => "inbound",
            dir => dir,
        };
        let mount = format!("{direction}-{}", wire_protocol(segs[3]));
        let Some(plugins) = self.configs.get(segs[1]) else {
            return Plugins::new();
        };
        plugins
            .iter()
            .filter_map(|(plugin, mounts)| Some((plugin.clone(), mounts.get(&mount)?.clone())))
            .collect()
    }
}
