use super::{binding_identity, route_match, Catalog};
use fsm_mesh_controller_core::{
    constants::{CLUSTER_WEIGHT_ACCEPT_ALL, PROTOCOL_TCP, PROTOCOL_TCP_SERVER_FIRST},
    identity::WILDCARD_PRINCIPAL,
    service::Direction,
    trafficpolicy::{
        HttpRouteMatch, InboundMeshTrafficPolicy, InboundTrafficPolicy, MeshClusterConfig,
        RouteWeightedClusters, TrafficMatch,
    },
    MeshService, ServiceIdentity, WeightedCluster,
};
use fsm_mesh_controller_k8s_api::{
    smi::{TrafficTarget, HTTP_ROUTE_GROUP_KIND},
    ResourceExt,
};

/// Local clusters are reached on the loopback address of the workload.
const LOCALHOST: &str = "127.0.0.1";

impl Catalog<'_> {
    /// Builds the traffic a proxy accepts for its local services.
    ///
    /// In permissive mode every authenticated client is allowed on every path. Otherwise each
    /// SMI TrafficTarget naming the upstream identity contributes its HTTPRouteGroup matches,
    /// allowed for the target's source principals.
    pub fn get_inbound_mesh_traffic_policy(
        &self,
        upstream: &ServiceIdentity,
        services: &[MeshService],
    ) -> Option<InboundMeshTrafficPolicy> {
        let permissive = self.config.is_permissive_traffic_policy_mode();
        let trust_domain = self.trust_domain();
        let traffic_targets = if permissive {
            Vec::new()
        } else {
            self.inbound_traffic_targets(upstream).collect::<Vec<_>>()
        };

        let mut policy = InboundMeshTrafficPolicy::default();
        for svc in services {
            let local = MeshClusterConfig::local(svc.clone(), LOCALHOST);
            let local_cluster = WeightedCluster::new(local.name.clone(), CLUSTER_WEIGHT_ACCEPT_ALL);
            policy.clusters_configs.push(local);

            let ust = self.get_upstream_traffic_setting(svc);
            policy.traffic_matches.push(TrafficMatch {
                name: svc.traffic_match_name(Direction::Inbound),
                destination_port: svc.target_port,
                destination_protocol: svc.protocol.clone(),
                server_names: vec![svc.fqdn(trust_domain)],
                tcp_rate_limit: ust.as_ref().and_then(|u| u.tcp_rate_limit().cloned()),
                ..Default::default()
            });

            if svc.protocol == PROTOCOL_TCP || svc.protocol == PROTOCOL_TCP_SERVER_FIRST {
                continue;
            }

            let mut http = InboundTrafficPolicy::new(
                svc.fqdn(trust_domain),
                self.get_hostnames_for_service(svc, true),
            );
            http.rate_limit = ust.as_ref().and_then(|u| u.http_rate_limit().cloned());

            if permissive {
                http.add_rule(
                    RouteWeightedClusters::new(HttpRouteMatch::wildcard(), Some(local_cluster)),
                    WILDCARD_PRINCIPAL,
                );
            } else {
                for tt in &traffic_targets {
                    let principals = tt
                        .spec
                        .sources
                        .iter()
                        .map(|src| binding_identity(src).to_principal(trust_domain))
                        .collect::<Vec<_>>();
                    for route_match in self.traffic_target_route_matches(tt) {
                        let mut route =
                            RouteWeightedClusters::new(route_match, Some(local_cluster.clone()));
                        route.rate_limit = ust
                            .as_ref()
                            .and_then(|u| u.route_rate_limit(&route.route_match.path).cloned());
                        for principal in &principals {
                            http.add_rule(route.clone(), principal.clone());
                        }
                    }
                }
            }

            policy
                .http_route_configs_per_port
                .entry(svc.target_port)
                .or_default()
                .push(http);
        }

        if policy.is_empty() {
            return None;
        }
        Some(policy)
    }

    /// HTTP route matches a TrafficTarget grants, resolved from the HTTPRouteGroups in its
    /// namespace. TCPRoute rules select traffic by port only and yield no HTTP routes.
    fn traffic_target_route_matches(&self, tt: &TrafficTarget) -> Vec<HttpRouteMatch> {
        let namespace = tt.namespace().unwrap_or_default();
        let mut matches = Vec::new();
        for rule in &tt.spec.rules {
            if rule.kind != HTTP_ROUTE_GROUP_KIND {
                continue;
            }
            let Some(group) = self.index.http_route_groups.get(&namespace, &rule.name) else {
                tracing::debug!(ns = %namespace, name = %rule.name, "HTTPRouteGroup not found");
                continue;
            };
            matches.extend(
                group
                    .spec
                    .matches
                    .iter()
                    .filter(|m| rule.matches.is_empty() || rule.matches.contains(&m.name))
                    .map(route_match),
            );
        }
        matches
    }
}
