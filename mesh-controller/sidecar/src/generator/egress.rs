use super::{depend_on, DependClusters, Generator};
use crate::document::{
    Certificate, ClusterConfig, ConnectionSettings, DestinationSecuritySpec, HttpMatchRule,
    RetryPolicy, ZoneEndpoint,
};
use fsm_mesh_controller_core::{
    constants::{
        CLUSTER_WEIGHT_ACCEPT_ALL, PROTOCOL_GRPC, PROTOCOL_HTTP, PROTOCOL_HTTPS, PROTOCOL_TCP,
        PROTOCOL_TCP_SERVER_FIRST,
    },
    trafficpolicy::{EgressClusterConfig, EgressTrafficPolicy, TrafficMatch},
    MeshService,
};

impl Generator<'_> {
    /// Builds the traffic the proxy may send outside the mesh. Egress matches share the
    /// outbound block with mesh traffic.
    pub(super) fn egress(&mut self) {
        let policy = match self
            .catalog
            .get_egress_traffic_policy(self.proxy.identity())
        {
            Ok(Some(policy)) => policy,
            Ok(None) => return,
            Err(error) => {
                tracing::error!(%error, proxy = %self.proxy, "Failed to build egress policy");
                self.not_ready("egress policy unavailable");
                return;
            }
        };

        let depend = self.egress_routes(&policy);
        if !depend.is_empty() {
            self.egress_clusters(&policy, &depend);
        }
    }

    fn egress_routes(&mut self, policy: &EgressTrafficPolicy) -> DependClusters {
        let mut depend = DependClusters::new();
        let plugins = self.plugins;
        let suffix = self.desired_suffix.clone();
        let outbound = self.doc.outbound();

        for traffic_match in &policy.traffic_matches {
            let protocol = traffic_match.destination_protocol.to_lowercase();
            let security = destination_security(policy, traffic_match);
            let (tm, existed) =
                outbound.traffic_match(traffic_match.destination_port, &traffic_match.name);
            if !existed {
                tm.protocol = protocol.clone();
                tm.port = traffic_match.destination_port;
            }
            for range in &traffic_match.destination_ip_ranges {
                tm.add_destination_ip_range(range.to_string(), security.clone());
            }

            match protocol.as_str() {
                PROTOCOL_HTTP | PROTOCOL_GRPC => {
                    let Some(configs) = policy
                        .http_route_configs_per_port
                        .get(&traffic_match.destination_port)
                    else {
                        continue;
                    };
                    for config in configs {
                        let rules = tm.route_rules(&config.name);
                        rules.egress_forward_gateway = traffic_match.egress_gateway.clone();
                        rules.plugins = plugins.lookup(&traffic_match.name);
                        let mut allowed_ranges: Vec<&fsm_mesh_controller_core::IpNet> = Vec::new();
                        for routing in &config.routing_rules {
                            let (rule, _) = rules
                                .route_rule(HttpMatchRule::from_route(&routing.route.route_match));
                            for wc in &routing.route.weighted_clusters {
                                depend_on(&mut depend, wc, routing.route.retry_policy.as_ref());
                                rule.add_weighted_cluster(wc.cluster_name.as_str(), wc.weight);
                            }
                            allowed_ranges.extend(&routing.allowed_destination_ip_ranges);
                        }
                        for hostname in &config.hostnames {
                            tm.add_host_port(hostname, &config.name, &suffix);
                        }
                        for range in allowed_ranges {
                            tm.add_destination_ip_range(range.to_string(), security.clone());
                        }
                    }
                }

                PROTOCOL_HTTPS => {
                    let tcp = tm.tcp_route_rules();
                    tcp.egress_forward_gateway = traffic_match.egress_gateway.clone();
                    tcp.plugins = plugins.lookup(&traffic_match.name);
                    let Some(cluster) = &traffic_match.cluster else {
                        continue;
                    };
                    tcp.target_clusters
                        .insert(cluster.to_string(), CLUSTER_WEIGHT_ACCEPT_ALL);

                    // Passthrough TLS is sent on to the server named in the SNI.
                    let egress = find_cluster(policy, cluster.as_str());
                    let config = outbound.cluster_config(cluster.as_str());
                    for server_name in &traffic_match.server_names {
                        config.add_endpoint(
                            server_name,
                            traffic_match.destination_port,
                            accept_all(),
                        );
                    }
                    if let Some(egress) = egress {
                        apply_cluster_settings(config, egress);
                    }
                }

                PROTOCOL_TCP | PROTOCOL_TCP_SERVER_FIRST => {
                    let tcp = tm.tcp_route_rules();
                    tcp.allowed_egress_traffic = true;
                    tcp.egress_forward_gateway = traffic_match.egress_gateway.clone();
                    tcp.plugins = plugins.lookup(&traffic_match.name);
                    for wc in &traffic_match.weighted_clusters {
                        tcp.target_clusters
                            .insert(wc.cluster_name.to_string(), wc.weight);
                    }
                    let Some(cluster) = &traffic_match.cluster else {
                        continue;
                    };
                    tcp.target_clusters
                        .insert(cluster.to_string(), CLUSTER_WEIGHT_ACCEPT_ALL);

                    // The proxy dials the original destination; the cluster only carries
                    // connection settings and the client certificate.
                    let egress = find_cluster(policy, cluster.as_str());
                    let config = outbound.cluster_config(cluster.as_str());
                    if let Some(egress) = egress {
                        apply_cluster_settings(config, egress);
                    }
                }

                _ => {}
            }
        }
        depend
    }

    /// Points every cluster an egress HTTP route depends on at its external host.
    fn egress_clusters(&mut self, policy: &EgressTrafficPolicy, depend: &DependClusters) {
        let catalog = self.catalog;
        let identity = self.proxy.identity();
        let mut missing = Vec::new();
        let outbound = self.doc.outbound();

        for (name, retry) in depend {
            let Some(egress) = find_cluster(policy, name) else {
                missing.push(name.clone());
                continue;
            };
            let config = outbound.cluster_config(name);
            config.add_endpoint(&egress.host, egress.port, accept_all());
            apply_cluster_settings(config, egress);
            config.retry_policy = retry.clone().or_else(|| {
                let svc = MeshService::from_host(name).ok()?;
                catalog
                    .get_retry_policy(identity, &svc)
                    .as_ref()
                    .map(RetryPolicy::from)
            });
        }
        for name in missing {
            self.not_ready(&format!("no egress cluster {name}"));
        }
    }
}

fn find_cluster<'p>(policy: &'p EgressTrafficPolicy, name: &str) -> Option<&'p EgressClusterConfig> {
    policy
        .clusters_configs
        .iter()
        .find(|c| c.name.as_str() == name)
}

/// Destinations reached through a cluster with a client certificate are marked with it.
fn destination_security(
    policy: &EgressTrafficPolicy,
    traffic_match: &TrafficMatch,
) -> Option<DestinationSecuritySpec> {
    let cluster = traffic_match.cluster.as_ref()?;
    let source_cert = find_cluster(policy, cluster.as_str())?.source_cert.as_ref()?;
    Some(DestinationSecuritySpec {
        source_cert: Some(Certificate::from_source_cert(source_cert)),
    })
}

fn apply_cluster_settings(config: &mut ClusterConfig, egress: &EgressClusterConfig) {
    if let Some(settings) = &egress.connection_settings {
        config.connection_settings = Some(ConnectionSettings::from(settings));
    }
    if let Some(cert) = &egress.source_cert {
        config.source_cert = Some(Certificate::from_source_cert(cert));
    }
}

fn accept_all() -> ZoneEndpoint {
    ZoneEndpoint {
        weight: CLUSTER_WEIGHT_ACCEPT_ALL,
        ..Default::default()
    }
}
