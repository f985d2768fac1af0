use super::{ConnectionSettings, RouteWeightedClusters, TrafficMatch};
use crate::{ClusterName, Endpoint, IpNet};
use std::collections::BTreeMap;

/// Traffic a proxy may send to destinations outside the mesh.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EgressTrafficPolicy {
    pub traffic_matches: Vec<TrafficMatch>,
    pub http_route_configs_per_port: BTreeMap<u16, Vec<EgressHttpRouteConfig>>,
    pub clusters_configs: Vec<EgressClusterConfig>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EgressHttpRouteConfig {
    pub name: String,
    pub hostnames: Vec<String>,
    pub routing_rules: Vec<EgressHttpRoutingRule>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EgressHttpRoutingRule {
    pub route: RouteWeightedClusters,
    pub allowed_destination_ip_ranges: Vec<IpNet>,
}

/// An external destination reachable through egress.
#[derive(Clone, Debug, PartialEq)]
pub struct EgressClusterConfig {
    pub name: ClusterName,
    pub host: String,
    pub port: u16,
    pub connection_settings: Option<ConnectionSettings>,
    pub source_cert: Option<SourceCert>,
}

/// The client certificate a proxy presents to an egress destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceCert {
    /// The proxy's own mesh certificate.
    FsmIssued,

    /// Material read from a Kubernetes Secret.
    Secret {
        sans: Vec<String>,
        expiration: String,
        issuing_ca: Option<String>,
        cert_chain: Option<String>,
        private_key: Option<String>,
    },
}

/// Egress gateways and the policies routed through them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EgressGatewayPolicy {
    pub global: Vec<EgressGatewayConfig>,
    pub rules: Vec<EgressGatewayRule>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EgressGatewayConfig {
    pub service: String,
    pub namespace: String,
    pub weight: Option<u32>,

    /// `http2-tunnel` or `sock5`.
    pub mode: String,
    pub endpoints: Vec<Endpoint>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EgressGatewayRule {
    pub name: String,
    pub namespace: String,

    /// Index of the owning EgressGateway resource; part of the rule name.
    pub index: usize,
    pub egress_policies: Vec<(String, String)>,
    pub egress_gateways: Vec<EgressGatewayConfig>,
}

// === impl EgressTrafficPolicy ===

impl EgressTrafficPolicy {
    pub fn is_empty(&self) -> bool {
        self.traffic_matches.is_empty()
            && self.http_route_configs_per_port.is_empty()
            && self.clusters_configs.is_empty()
    }
}

// === impl EgressGatewayConfig ===

impl EgressGatewayConfig {
    /// The forward cluster name, `<service>.<namespace>`.
    pub fn cluster_name(&self) -> String {
        format!("{}.{}", self.service, self.namespace)
    }
}

// === impl EgressGatewayRule ===

impl EgressGatewayRule {
    /// `<namespace>.<name>.<index>`, as referenced by egress matches.
    pub fn rule_name(&self) -> String {
        format!("{}.{}.{}", self.namespace, self.name, self.index)
    }
}
