use super::Generator;
use crate::document::{host_port, HttpMatchRule};
use fsm_mesh_controller_core::{
    constants::{CLUSTER_WEIGHT_ACCEPT_ALL, PROTOCOL_GRPC, PROTOCOL_HTTP, PROTOCOL_TCP},
    identity::WILDCARD_PRINCIPAL,
    trafficpolicy::{wire_protocol, InboundMeshTrafficPolicy},
    MeshService, ServiceIdentity,
};
use fsm_mesh_controller_k8s_index::catalog::WorkloadKind;

impl Generator<'_> {
    /// Builds the traffic the proxy accepts for its services, then admits ingress, access
    /// control and export sources into the same block.
    pub(super) fn inbound(&mut self) {
        if let Some(policy) = self
            .catalog
            .get_inbound_mesh_traffic_policy(self.proxy.identity(), self.services)
        {
            self.inbound_mesh(&policy);
        }
        for svc in self.services {
            self.ingress(svc);
        }
    }

    fn inbound_mesh(&mut self, policy: &InboundMeshTrafficPolicy) {
        let catalog = self.catalog;
        let plugins = self.plugins;
        let trust_domain = catalog.trust_domain();
        let permissive = catalog.configurator().is_permissive_traffic_policy_mode();
        let inbound = self.doc.inbound();

        for traffic_match in &policy.traffic_matches {
            let protocol = wire_protocol(&traffic_match.destination_protocol);
            let upstream = match MeshService::from_traffic_match_name(
                &traffic_match.name,
                &traffic_match.destination_protocol,
            ) {
                Ok(svc) => svc,
                Err(error) => {
                    tracing::warn!(%error, "Skipping inbound traffic match");
                    continue;
                }
            };
            let local_cluster = upstream.sidecar_local_cluster_name();

            for cluster in policy
                .clusters_configs
                .iter()
                .filter(|c| c.service.sidecar_local_cluster_name() == local_cluster)
            {
                let tm = inbound.traffic_match(cluster.service.port);
                tm.protocol = protocol.clone();
                tm.port = traffic_match.destination_port;
                tm.rate_limit = traffic_match.tcp_rate_limit.as_ref().map(Into::into);

                match protocol.as_str() {
                    PROTOCOL_HTTP | PROTOCOL_GRPC => {
                        let policy_name = upstream.policy_name(false);
                        let Some(config) = policy
                            .http_route_configs_per_port
                            .get(&upstream.target_port)
                            .and_then(|configs| configs.iter().find(|c| c.name == policy_name))
                        else {
                            continue;
                        };

                        for hostname in &config.hostnames {
                            tm.add_host_port(hostname, &config.name);
                        }
                        let rules = tm.route_rules(&config.name);
                        rules.rate_limit = config.rate_limit.as_ref().map(Into::into);
                        rules.plugins = plugins.lookup(&traffic_match.name);

                        for rule in &config.rules {
                            if rule.route.route_match.path.is_empty() {
                                continue;
                            }
                            let (route, existed) =
                                rules.route_rule(HttpMatchRule::from_route(&rule.route.route_match));
                            if !existed {
                                route.rate_limit = rule.route.rate_limit.as_ref().map(Into::into);
                                for wc in &rule.route.weighted_clusters {
                                    route
                                        .rule
                                        .add_weighted_cluster(wc.cluster_name.as_str(), wc.weight);
                                }
                            }

                            let mut allowed_endpoints = Vec::new();
                            for principal in &rule.allowed_principals {
                                let identity = ServiceIdentity::from_principal(principal, trust_domain);
                                route.rule.add_allowed_service(identity.as_str());
                                if principal == WILDCARD_PRINCIPAL || permissive {
                                    continue;
                                }
                                for ep in catalog.list_endpoints_for_identity(&identity) {
                                    allowed_endpoints.push((ep.ip.to_string(), identity.to_string()));
                                }
                            }
                            for (addr, identity) in allowed_endpoints {
                                rules.add_allowed_endpoint(addr, identity);
                            }
                        }
                    }
                    PROTOCOL_TCP => {
                        let tcp = tm.tcp_route_rules();
                        tcp.target_clusters
                            .insert(cluster.name.to_string(), CLUSTER_WEIGHT_ACCEPT_ALL);
                        tcp.plugins = plugins.lookup(&traffic_match.name);
                    }
                    _ => {}
                }
            }
        }

        // Virtual machines are reached on the machine address rather than the pod address
        // the catalog knows.
        let vm_addr = match self.proxy.workload_kind() {
            WorkloadKind::VirtualMachine => self.proxy.addr().map(|ip| ip.to_string()),
            WorkloadKind::Pod => None,
        };
        let inbound = self.doc.inbound();
        for cluster in &policy.clusters_configs {
            let addr = vm_addr
                .clone()
                .or_else(|| cluster.address.clone())
                .unwrap_or_default();
            inbound
                .cluster_config(cluster.name.as_str())
                .insert(host_port(&addr, cluster.port), CLUSTER_WEIGHT_ACCEPT_ALL);
        }
    }
}

