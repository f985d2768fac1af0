use super::{InboundTrafficPolicy, OutboundTrafficPolicy, TrafficMatch, TrafficWarmup, UpstreamTrafficSetting};
use crate::{ClusterName, MeshService};
use std::{collections::BTreeMap, net::IpAddr};

/// An upstream or local cluster referenced by mesh traffic.
#[derive(Clone, Debug, PartialEq)]
pub struct MeshClusterConfig {
    pub name: ClusterName,
    pub service: MeshService,

    /// Set for local clusters; upstream clusters resolve through endpoints.
    pub address: Option<String>,
    pub port: u16,
    pub enable_active_health_checks: bool,
    pub upstream_traffic_setting: Option<UpstreamTrafficSetting>,
    pub warmup: Option<TrafficWarmup>,
}

/// Traffic a proxy accepts on behalf of its local services.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InboundMeshTrafficPolicy {
    pub traffic_matches: Vec<TrafficMatch>,
    pub clusters_configs: Vec<MeshClusterConfig>,
    pub http_route_configs_per_port: BTreeMap<u16, Vec<InboundTrafficPolicy>>,
}

/// Traffic a proxy may initiate toward upstream services.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OutboundMeshTrafficPolicy {
    pub traffic_matches: Vec<TrafficMatch>,
    pub clusters_configs: Vec<MeshClusterConfig>,
    pub http_route_configs_per_port: BTreeMap<u16, Vec<OutboundTrafficPolicy>>,

    /// Services without local endpoints keyed by `name.namespace`, with the
    /// addresses a local DNS proxy should answer with.
    pub services_resolvable_set: BTreeMap<String, Vec<IpAddr>>,
}

// === impl MeshClusterConfig ===

impl MeshClusterConfig {
    pub fn upstream(service: MeshService) -> Self {
        Self {
            name: service.cluster_name(),
            service,
            address: None,
            port: 0,
            enable_active_health_checks: false,
            upstream_traffic_setting: None,
            warmup: None,
        }
    }

    pub fn local(service: MeshService, address: impl Into<String>) -> Self {
        Self {
            name: service.local_cluster_name(),
            port: service.target_port,
            address: Some(address.into()),
            service,
            enable_active_health_checks: false,
            upstream_traffic_setting: None,
            warmup: None,
        }
    }
}

// === impl InboundMeshTrafficPolicy ===

impl InboundMeshTrafficPolicy {
    pub fn is_empty(&self) -> bool {
        self.traffic_matches.is_empty() && self.clusters_configs.is_empty()
    }
}
