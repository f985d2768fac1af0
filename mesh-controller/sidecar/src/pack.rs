//! Structural dedup of a document.
//!
//! Cluster configs and HTTP route rule groups are replaced by entries keyed by a flowcode,
//! the `%05X` form of a counter that is assigned per distinct content hash. Identical
//! sub-trees share one entry and every reference is rewritten to the flowcode.

use crate::{
    document::{
        InboundHttpRouteRules, OutboundHttpRouteRules, PolicyDocument, RouteRuleRef,
        WeightedClusters,
    },
    hash::hash,
};
use ahash::AHashMap as HashMap;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Default)]
struct Flowcodes(HashMap<u64, usize>);

/// Route rule groups whose target clusters are rewritten on pack.
trait RouteGroup: Serialize {
    fn for_each_target(&mut self, f: &mut dyn FnMut(&mut WeightedClusters));
}

pub(crate) fn pack(doc: &mut PolicyDocument) -> Result<(), serde_json::Error> {
    let mut codes = Flowcodes::default();

    if let Some(inbound) = doc.inbound.as_mut() {
        if !inbound.traffic_matches.is_empty() && !inbound.clusters_configs.is_empty() {
            let clusters = pack_clusters(&mut codes, &mut inbound.clusters_configs)?;
            for tm in inbound.traffic_matches.values_mut() {
                pack_groups(
                    &mut codes,
                    &clusters,
                    &mut tm.http_service_route_rules,
                    &mut tm.http_host_port_to_service,
                )?;
                if let Some(tcp) = tm.tcp_service_route_rules.as_mut() {
                    remap(&mut codes, &clusters, &mut tcp.target_clusters);
                }
            }
        }
    }

    if let Some(outbound) = doc.outbound.as_mut() {
        if !outbound.traffic_matches.is_empty() && !outbound.clusters_configs.is_empty() {
            let clusters = pack_clusters(&mut codes, &mut outbound.clusters_configs)?;
            for tm in outbound.traffic_matches.values_mut().flatten() {
                pack_groups(
                    &mut codes,
                    &clusters,
                    &mut tm.http_service_route_rules,
                    &mut tm.http_host_port_to_service,
                )?;
                if let Some(tcp) = tm.tcp_service_route_rules.as_mut() {
                    remap(&mut codes, &clusters, &mut tcp.target_clusters);
                }
            }
        }
    }

    Ok(())
}

/// Replaces the cluster table with one keyed by flowcodes and returns each original
/// cluster name's content hash.
fn pack_clusters<C: Serialize>(
    codes: &mut Flowcodes,
    configs: &mut BTreeMap<String, C>,
) -> Result<HashMap<String, u64>, serde_json::Error> {
    let mut hashes = HashMap::with_capacity(configs.len());
    let mut packed = BTreeMap::new();
    for (name, config) in std::mem::take(configs) {
        let h = hash(&config)?;
        packed.entry(codes.name(h)).or_insert(config);
        hashes.insert(name, h);
    }
    *configs = packed;
    Ok(hashes)
}

fn pack_groups<G: RouteGroup>(
    codes: &mut Flowcodes,
    clusters: &HashMap<String, u64>,
    groups: &mut BTreeMap<String, G>,
    hosts: &mut BTreeMap<String, RouteRuleRef>,
) -> Result<(), serde_json::Error> {
    if groups.is_empty() {
        return Ok(());
    }

    let mut hashes = HashMap::with_capacity(groups.len());
    let mut packed = BTreeMap::new();
    for (name, mut group) in std::mem::take(groups) {
        group.for_each_target(&mut |targets| remap(codes, clusters, targets));
        let h = hash(&group)?;
        packed.entry(codes.name(h)).or_insert(group);
        hashes.insert(name, h);
    }
    *groups = packed;

    for rule_ref in hosts.values_mut() {
        if let Some(&h) = hashes.get(&rule_ref.rule_name) {
            *rule_ref = RouteRuleRef {
                rule_name: codes.name(h),
                service: std::mem::take(&mut rule_ref.rule_name),
            };
        }
    }
    Ok(())
}

/// Rewrites cluster names to flowcodes, dropping clusters with no config.
fn remap(codes: &mut Flowcodes, clusters: &HashMap<String, u64>, targets: &mut WeightedClusters) {
    *targets = std::mem::take(targets)
        .into_iter()
        .filter_map(|(name, weight)| Some((codes.name(*clusters.get(&name)?), weight)))
        .collect();
}

// === impl Flowcodes ===

impl Flowcodes {
    fn name(&mut self, hash: u64) -> String {
        let next = self.0.len() + 1;
        let code = *self.0.entry(hash).or_insert(next);
        format!("{code:05X}")
    }
}

impl RouteGroup for InboundHttpRouteRules {
    fn for_each_target(&mut self, f: &mut dyn FnMut(&mut WeightedClusters)) {
        for rule in &mut self.route_rules {
            f(&mut rule.rule.target_clusters);
        }
    }
}

impl RouteGroup for OutboundHttpRouteRules {
    fn for_each_target(&mut self, f: &mut dyn FnMut(&mut WeightedClusters)) {
        for rule in &mut self.route_rules {
            f(&mut rule.target_clusters);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ClusterConfig, HttpMatchRule, OutboundTrafficPolicy, ZoneEndpoint};
    use fsm_mesh_controller_core::trafficpolicy::HttpRouteMatch;
    use pretty_assertions::assert_eq;

    fn endpoint(weight: u32) -> ZoneEndpoint {
        ZoneEndpoint {
            weight,
            ..Default::default()
        }
    }

    fn doc() -> PolicyDocument {
        let mut outbound = OutboundTrafficPolicy::default();
        for (name, addr) in [("ns/a|80", "10.0.0.1"), ("ns/b|80", "10.0.0.1"), ("ns/c|80", "10.0.0.3")] {
            outbound
                .cluster_config(name)
                .add_endpoint(addr, 80, endpoint(100));
        }
        let (tm, _) = outbound.traffic_match(80, "http");
        tm.port = 80;
        tm.protocol = "http".to_string();
        for (group, cluster) in [("a.ns", "ns/a|80"), ("b.ns", "ns/b|80"), ("c.ns", "ns/c|80")] {
            let (rule, _) = tm
                .route_rules(group)
                .route_rule(HttpMatchRule::from_route(&HttpRouteMatch::wildcard()));
            rule.add_weighted_cluster(cluster, 100);
            tm.add_host_port(group, group, "");
        }
        PolicyDocument {
            outbound: Some(outbound),
            ..Default::default()
        }
    }

    #[test]
    fn identical_subtrees_share_flowcodes() {
        let mut doc = doc();
        pack(&mut doc).unwrap();
        let outbound = doc.outbound.unwrap();

        assert_eq!(
            outbound.clusters_configs.keys().collect::<Vec<_>>(),
            vec!["00001", "00002"]
        );
        let tm = &outbound.traffic_matches[&80][0];
        assert_eq!(tm.http_service_route_rules.len(), 2);
        assert_eq!(tm.http_host_port_to_service["a.ns"].rule_name, tm.http_host_port_to_service["b.ns"].rule_name);
        assert_eq!(tm.http_host_port_to_service["a.ns"].service, "a.ns");
        assert_ne!(tm.http_host_port_to_service["a.ns"].rule_name, tm.http_host_port_to_service["c.ns"].rule_name);
    }

    #[test]
    fn every_reference_resolves() {
        let mut doc = doc();
        pack(&mut doc).unwrap();
        let outbound = doc.outbound.unwrap();
        for tm in outbound.traffic_matches.values().flatten() {
            for rule_ref in tm.http_host_port_to_service.values() {
                assert!(tm.http_service_route_rules.contains_key(&rule_ref.rule_name));
            }
            for group in tm.http_service_route_rules.values() {
                for rule in &group.route_rules {
                    for cluster in rule.target_clusters.keys() {
                        assert!(outbound.clusters_configs.contains_key(cluster));
                    }
                }
            }
        }
    }

    #[test]
    fn unknown_clusters_are_dropped() {
        let mut doc = doc();
        let outbound = doc.outbound.as_mut().unwrap();
        outbound.traffic_matches.get_mut(&80).unwrap()[0]
            .route_rules("a.ns")
            .route_rules[0]
            .add_weighted_cluster("ns/missing|80", 100);
        outbound
            .clusters_configs
            .insert("ns/empty|80".to_string(), ClusterConfig::default());
        pack(&mut doc).unwrap();
        let outbound = doc.outbound.unwrap();
        let tm = &outbound.traffic_matches[&80][0];
        let group = &tm.http_service_route_rules[&tm.http_host_port_to_service["a.ns"].rule_name];
        assert_eq!(group.route_rules[0].target_clusters.len(), 1);
    }
}
