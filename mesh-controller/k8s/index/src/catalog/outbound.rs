use super::{route_match, Catalog};
use fsm_mesh_controller_core::{
    constants::{
        CLUSTER_WEIGHT_ACCEPT_ALL, CLUSTER_WEIGHT_FAIL_OVER, PROTOCOL_TCP,
        PROTOCOL_TCP_SERVER_FIRST,
    },
    endpoint::LbType,
    service::Direction,
    trafficpolicy::{
        HttpRouteMatch, MeshClusterConfig, OutboundMeshTrafficPolicy, OutboundTrafficPolicy,
        TrafficMatch,
    },
    ClusterName, IpNet, MeshService, ServiceIdentity, WeightedCluster,
};
use fsm_mesh_controller_k8s_api::{
    smi::{TrafficSplit, TrafficSplitBackend, HTTP_ROUTE_GROUP_KIND},
    ResourceExt,
};
use std::collections::BTreeSet;

/// The clusters one TrafficSplit (or the default route) sends traffic to.
struct SplitRoute {
    /// Empty for splits that apply to all requests.
    matches: Vec<HttpRouteMatch>,
    clusters: Vec<WeightedCluster>,
}

impl Catalog<'_> {
    /// Builds the traffic a downstream identity may send to upstream mesh services.
    ///
    /// HTTP routes are grouped by service port so that one hostname reached on different ports
    /// can be routed independently. Returns `None` when the identity may not reach any service.
    pub fn get_outbound_mesh_traffic_policy(
        &self,
        downstream: &ServiceIdentity,
    ) -> Option<OutboundMeshTrafficPolicy> {
        let mut policy = OutboundMeshTrafficPolicy::default();
        let flags = self.config.feature_flags();
        let local_dns = self.config.is_local_dns_proxy_enabled()
            && !self.config.is_wildcard_dns_proxy_enabled();
        let egress_hosts = self.egress_hostnames(downstream);

        for svc in self.list_outbound_services_for_identity(downstream) {
            let _span = tracing::trace_span!("outbound", service = %svc, port = svc.port).entered();

            let egress_enabled = self.config.is_egress_enabled()
                || self
                    .domain_hostnames(&svc, true)
                    .iter()
                    .any(|h| egress_hosts.contains(h));
            let monitored = self.is_monitored_namespace(&svc.namespace);

            let endpoints = self.get_resolvable_endpoints_for_service(&svc);
            let mut destination_ip_ranges = Vec::<IpNet>::new();
            for ep in &endpoints {
                let net = IpNet::from(ep.ip);
                if !destination_ip_ranges.contains(&net) {
                    destination_ip_ranges.push(net);
                }
            }
            let has_local_endpoints = endpoints
                .iter()
                .any(|ep| ep.is_local() && (monitored || egress_enabled));
            if local_dns && !has_local_endpoints {
                let ips = endpoints
                    .iter()
                    .map(|ep| ep.ip)
                    .collect::<BTreeSet<_>>();
                if !ips.is_empty() {
                    policy
                        .services_resolvable_set
                        .insert(svc.policy_name(true), ips.into_iter().collect());
                }
            }

            let mut cluster = MeshClusterConfig::upstream(svc.clone());
            cluster.enable_active_health_checks = flags.enable_sidecar_active_health_checks;
            cluster.upstream_traffic_setting = self.get_upstream_traffic_setting(&svc);
            cluster.warmup = self.get_traffic_warmup_policy(&svc);
            policy.clusters_configs.push(cluster);

            let splits = self.apex_traffic_splits(&svc);
            let has_split_wildcard =
                splits.is_empty() || splits.iter().any(|s| s.spec.matches.is_empty());
            let routes = if splits.is_empty() {
                vec![SplitRoute {
                    matches: Vec::new(),
                    clusters: vec![self.default_weighted_cluster(&svc)],
                }]
            } else {
                splits
                    .into_iter()
                    .map(|split| SplitRoute {
                        matches: self.split_route_matches(split),
                        clusters: split.spec.backends.iter().fold(Vec::new(), |clusters, backend| {
                            self.merge_split_upstream_clusters(&svc, backend, clusters)
                        }),
                    })
                    .collect::<Vec<_>>()
            };

            for route in &routes {
                policy.traffic_matches.push(TrafficMatch {
                    name: svc.traffic_match_name(Direction::Outbound),
                    destination_port: svc.port,
                    destination_protocol: svc.protocol.clone(),
                    destination_ip_ranges: destination_ip_ranges.clone(),
                    weighted_clusters: route.clusters.clone(),
                    ..Default::default()
                });
            }

            if svc.protocol == PROTOCOL_TCP || svc.protocol == PROTOCOL_TCP_SERVER_FIRST {
                continue;
            }

            let local_namespace =
                downstream.namespace() == svc.namespace || !svc.cloud_attached_to.is_empty();
            let mut http = OutboundTrafficPolicy::new(
                svc.policy_name(true),
                self.get_hostnames_for_service(&svc, local_namespace),
            );
            let retry = self.get_retry_policy(downstream, &svc);

            let mut has_wildcard_route = false;
            for route in &routes {
                for route_match in &route.matches {
                    has_wildcard_route |= route_match.is_wildcard_path();
                    if let Err(error) =
                        http.add_route(route_match.clone(), retry.clone(), route.clusters.clone())
                    {
                        tracing::error!(%error, service = %svc, "Failed to add outbound route");
                    }
                }
            }
            if !has_wildcard_route {
                let clusters = wildcard_route_clusters(has_split_wildcard, &routes);
                if let Err(error) = http.add_route(HttpRouteMatch::wildcard(), retry, clusters) {
                    tracing::error!(%error, service = %svc, "Failed to add outbound route");
                    continue;
                }
            }
            policy
                .http_route_configs_per_port
                .entry(svc.port)
                .or_default()
                .push(http);
        }

        if policy.clusters_configs.is_empty() {
            return None;
        }
        Some(policy)
    }

    fn apex_traffic_splits(&self, svc: &MeshService) -> Vec<&TrafficSplit> {
        self.index
            .traffic_splits
            .iter()
            .filter(|split| {
                let split_ns = split.namespace().unwrap_or_default();
                split.spec.is_apex(&svc.namespace, &split_ns, &svc.name)
            })
            .collect()
    }

    /// HTTP route matches of the HTTPRouteGroups a split refers to.
    fn split_route_matches(&self, split: &TrafficSplit) -> Vec<HttpRouteMatch> {
        let mut matches = Vec::new();
        for group in self.index.http_route_groups.iter() {
            let name = group.name_unchecked();
            let referenced = split
                .spec
                .matches
                .iter()
                .any(|m| (m.kind.is_empty() || m.kind == HTTP_ROUTE_GROUP_KIND) && m.name == name);
            if !referenced {
                continue;
            }
            matches.extend(group.spec.matches.iter().map(route_match));
        }
        matches
    }

    /// The single cluster of a service without TrafficSplits.
    fn default_weighted_cluster(&self, svc: &MeshService) -> WeightedCluster {
        let mut weight = CLUSTER_WEIGHT_ACCEPT_ALL;
        if self.multicluster.is_multicluster_service(svc) {
            match self.multicluster.lb_type(&svc.namespace, svc.provider_name()) {
                LbType::ActiveActive => {
                    let lb_weight = self.multicluster.lb_weight(svc);
                    if lb_weight > 0 {
                        weight = lb_weight;
                    }
                }
                LbType::FailOver => weight = CLUSTER_WEIGHT_FAIL_OVER,
                LbType::Locality => {}
            }
        }
        WeightedCluster::new(svc.cluster_name(), weight)
    }

    /// Appends the clusters of one split backend. The local backend and active-active peer
    /// clusters share the backend weight; failover peers are added at the failover weight.
    fn merge_split_upstream_clusters(
        &self,
        svc: &MeshService,
        backend: &TrafficSplitBackend,
        mut clusters: Vec<WeightedCluster>,
    ) -> Vec<WeightedCluster> {
        let (namespace, name) = match backend.service.split_once('/') {
            Some((ns, name)) => (ns, name),
            None => (svc.namespace.as_str(), backend.service.as_str()),
        };
        let backend_cluster = |target_port: u16| {
            MeshService {
                namespace: namespace.to_string(),
                name: name.to_string(),
                port: svc.port,
                target_port,
                ..Default::default()
            }
            .cluster_name()
        };

        let mut active = Vec::<ClusterName>::new();
        let mut failover = Vec::<ClusterName>::new();
        let local = self
            .kube
            .target_port_for_service_port(namespace, name, svc.port)
            .map(backend_cluster);
        if let Some(cluster) = local.clone() {
            active.push(cluster);
        }
        for (target_port, active_active) in self
            .multicluster
            .target_ports_for_service_port(namespace, name, svc.port)
        {
            let cluster = backend_cluster(target_port);
            // A peer cluster with the same name as the local one is served by it.
            if local.as_ref() == Some(&cluster) {
                continue;
            }
            if active_active {
                active.push(cluster);
            } else {
                failover.push(cluster);
            }
        }

        let mut total = backend.weight;
        let n = active.len();
        for (i, cluster) in active.into_iter().enumerate() {
            let weight = total / (n - i) as u32;
            total -= weight;
            clusters.push(WeightedCluster::new(cluster, weight));
        }
        clusters.extend(
            failover
                .into_iter()
                .map(|cluster| WeightedCluster::new(cluster, CLUSTER_WEIGHT_FAIL_OVER)),
        );
        clusters
    }
}

/// Clusters of the wildcard route added when no split routes every path: the clusters of
/// unmatched splits with their weights, or every cluster accepting all traffic.
fn wildcard_route_clusters(has_split_wildcard: bool, routes: &[SplitRoute]) -> Vec<WeightedCluster> {
    let mut seen = BTreeSet::new();
    let mut clusters = Vec::new();
    for route in routes {
        if has_split_wildcard && !route.matches.is_empty() {
            continue;
        }
        for wc in &route.clusters {
            if !seen.insert(wc.cluster_name.clone()) {
                continue;
            }
            let weight = if has_split_wildcard {
                wc.weight
            } else {
                CLUSTER_WEIGHT_ACCEPT_ALL
            };
            clusters.push(WeightedCluster::new(wc.cluster_name.clone(), weight));
        }
    }
    clusters
}
