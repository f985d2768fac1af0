use super::{depend_on, DependClusters, Generator};
use crate::document::{ConnectionSettings, HttpMatchRule, Warmup, ZoneEndpoint};
use fsm_mesh_controller_core::{
    constants::{PROTOCOL_GRPC, PROTOCOL_HTTP, PROTOCOL_HTTPS, PROTOCOL_TCP, PROTOCOL_TCP_SERVER_FIRST},
    trafficpolicy::{
        MeshClusterConfig, OutboundMeshTrafficPolicy, OutboundTrafficPolicy, TrafficMatch,
    },
    MeshService,
};
use std::collections::{BTreeMap, BTreeSet};

impl Generator<'_> {
    /// Builds the routes to the upstream services the proxy may reach, then the clusters
    /// those routes depend on.
    pub(super) fn outbound(&mut self) {
        let Some(policy) = self
            .catalog
            .get_outbound_mesh_traffic_policy(self.proxy.identity())
        else {
            return;
        };

        let config = self.catalog.configurator();
        if config.is_local_dns_proxy_enabled() {
            let generate_ipv6 = config.local_dns_proxy().generate_ipv6_based_on_ipv4;
            for (name, ips) in &policy.services_resolvable_set {
                let addrs = ips
                    .iter()
                    .flat_map(|ip| super::dns::with_mapped_ipv6(*ip, generate_ipv6))
                    .collect();
                self.doc.dns_resolve_db.insert(name.clone(), addrs);
            }
        }

        let depend = self.outbound_routes(&policy);
        if !depend.is_empty() {
            self.outbound_clusters(&policy, &depend);
        }
    }

    fn outbound_routes(&mut self, policy: &OutboundMeshTrafficPolicy) -> DependClusters {
        let mut depend = DependClusters::new();
        if policy.traffic_matches.is_empty() {
            return depend;
        }

        let wildcard_ranges = self.wildcard_ip_ranges();
        let plugins = self.plugins;
        let suffix = self.desired_suffix.clone();
        let outbound = self.doc.outbound();

        for traffic_match in &policy.traffic_matches {
            let protocol = traffic_match.destination_protocol.to_lowercase();
            let is_http = protocol == PROTOCOL_HTTP || protocol == PROTOCOL_GRPC;
            let name = if is_http {
                PROTOCOL_HTTP
            } else {
                traffic_match.name.as_str()
            };
            let (tm, existed) = outbound.traffic_match(traffic_match.destination_port, name);
            if !existed {
                tm.protocol = protocol.clone();
                tm.port = traffic_match.destination_port;
            }
            for range in &traffic_match.destination_ip_ranges {
                tm.add_destination_ip_range(range.to_string(), None);
            }
            for range in &wildcard_ranges {
                tm.add_destination_ip_range(range.clone(), None);
            }

            match protocol.as_str() {
                PROTOCOL_HTTP | PROTOCOL_GRPC => {
                    let configs = route_configs(policy, traffic_match);
                    for config in configs {
                        let rules = tm.route_rules(&config.name);
                        rules.plugins = plugins.lookup(&traffic_match.name);
                        for route in &config.routes {
                            let (rule, _) =
                                rules.route_rule(HttpMatchRule::from_route(&route.route_match));
                            for wc in &route.weighted_clusters {
                                depend_on(&mut depend, wc, route.retry_policy.as_ref());
                                rule.add_weighted_cluster(wc.cluster_name.as_str(), wc.weight);
                            }
                        }
                        for hostname in &config.hostnames {
                            tm.add_host_port(hostname, &config.name, &suffix);
                        }
                    }
                }
                PROTOCOL_TCP | PROTOCOL_TCP_SERVER_FIRST => {
                    let tcp = tm.tcp_route_rules();
                    tcp.plugins = plugins.lookup(&traffic_match.name);
                    for wc in &traffic_match.weighted_clusters {
                        depend_on(&mut depend, wc, None);
                        tcp.target_clusters
                            .insert(wc.cluster_name.to_string(), wc.weight);
                    }
                }
                PROTOCOL_HTTPS => {
                    let configs = route_configs(policy, traffic_match);
                    if configs.is_empty() {
                        continue;
                    }
                    let tcp = tm.tcp_route_rules();
                    tcp.plugins = plugins.lookup(&traffic_match.name);
                    for route in configs.iter().flat_map(|c| &c.routes) {
                        for wc in &route.weighted_clusters {
                            depend_on(&mut depend, wc, route.retry_policy.as_ref());
                            tcp.target_clusters
                                .insert(wc.cluster_name.to_string(), wc.weight);
                        }
                    }
                }
                _ => {}
            }
        }
        depend
    }

    /// Fills in the endpoints of every cluster a route depends on. Clusters without a
    /// configuration or without allowed endpoints leave the build not ready.
    fn outbound_clusters(&mut self, policy: &OutboundMeshTrafficPolicy, depend: &DependClusters) {
        let mut configs = BTreeMap::<String, Vec<&MeshClusterConfig>>::new();
        for cluster in &policy.clusters_configs {
            configs
                .entry(cluster.service.sidecar_cluster_name())
                .or_default()
                .push(cluster);
            configs
                .entry(cluster.service.sidecar_local_cluster_name())
                .or_default()
                .push(cluster);
        }

        let catalog = self.catalog;
        let identity = self.proxy.identity();
        let mut missing = Vec::new();
        let outbound = self.doc.outbound();
        for (name, retry) in depend {
            let Some(clusters) = configs.get(name) else {
                missing.push(name.clone());
                continue;
            };
            for cluster in clusters {
                let config = outbound.cluster_config(name);
                let endpoints =
                    catalog.list_allowed_upstream_endpoints_for_service(identity, &cluster.service);
                if endpoints.is_empty() {
                    missing.push(name.clone());
                    continue;
                }
                for ep in endpoints {
                    let port = upstream_port(&cluster.service, !ep.is_local());
                    config.add_endpoint(
                        &ep.ip.to_string(),
                        port,
                        ZoneEndpoint {
                            weight: ep.weight,
                            cluster_key: ep.cluster_key.clone(),
                            lb_type: ep.lb_type,
                            path: ep.path.clone(),
                        },
                    );
                }
                if let Some(settings) = cluster
                    .upstream_traffic_setting
                    .as_ref()
                    .and_then(|ust| ust.connection_settings.as_ref())
                {
                    config.connection_settings = Some(ConnectionSettings::from(settings));
                }
                if let Some(retry) = retry {
                    config.retry_policy = Some(retry.clone());
                }
                if let Some(warmup) = &cluster.warmup {
                    config.warmup = Some(Warmup::from(warmup));
                }
            }
        }
        for name in missing {
            self.not_ready(&format!("no endpoints for cluster {name}"));
        }
    }

    /// `<ipv4>/32` of every wildcard DNS address, when the wildcard DNS proxy is enabled.
    fn wildcard_ip_ranges(&self) -> Vec<String> {
        let config = self.catalog.configurator();
        if !config.is_local_dns_proxy_enabled() || !config.is_wildcard_dns_proxy_enabled() {
            return Vec::new();
        }
        config
            .local_dns_proxy()
            .wildcard
            .ips
            .iter()
            .filter(|addr| !addr.ipv4.is_empty())
            .map(|addr| format!("{}/32", addr.ipv4))
            .collect()
    }
}

/// The HTTP route configurations of the match's upstream service having a route to exactly
/// the match's weighted clusters.
fn route_configs<'p>(
    policy: &'p OutboundMeshTrafficPolicy,
    traffic_match: &TrafficMatch,
) -> Vec<&'p OutboundTrafficPolicy> {
    let upstream = match MeshService::from_traffic_match_name(
        &traffic_match.name,
        &traffic_match.destination_protocol,
    ) {
        Ok(svc) => svc,
        Err(error) => {
            tracing::warn!(%error, "Skipping outbound traffic match");
            return Vec::new();
        }
    };
    let policy_name = upstream.policy_name(true);
    let clusters = traffic_match
        .weighted_clusters
        .iter()
        .collect::<BTreeSet<_>>();
    policy
        .http_route_configs_per_port
        .get(&traffic_match.destination_port)
        .into_iter()
        .flatten()
        .filter(|config| config.name == policy_name)
        .filter(|config| {
            config
                .routes
                .iter()
                .any(|route| route.weighted_clusters.iter().collect::<BTreeSet<_>>() == clusters)
        })
        .collect()
}

/// Imported endpoints are reached on the service's target port, local ones on the service
/// port.
fn upstream_port(svc: &MeshService, imported: bool) -> u16 {
    if imported && svc.target_port > 0 {
        return svc.target_port;
    }
    svc.port
}

