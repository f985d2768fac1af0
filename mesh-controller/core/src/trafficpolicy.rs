//! Intermediate representation produced by the catalog and consumed by the
//! sidecar configuration generator.

mod egress;
mod ingress;
mod mesh;
mod route;
mod settings;

pub use self::{
    egress::{
        EgressClusterConfig, EgressGatewayConfig, EgressGatewayPolicy, EgressGatewayRule,
        EgressHttpRouteConfig, EgressHttpRoutingRule, EgressTrafficPolicy, SourceCert,
    },
    ingress::{
        AccessControlTrafficPolicy, IngressTls, IngressTrafficMatch, IngressTrafficPolicy,
        ServiceExportTrafficPolicy,
    },
    mesh::{InboundMeshTrafficPolicy, MeshClusterConfig, OutboundMeshTrafficPolicy},
    route::{
        HttpRouteMatch, InboundTrafficPolicy, OutboundTrafficPolicy, PathMatchType,
        RouteConflict, RouteWeightedClusters, Rule,
    },
    settings::{
        CircuitBreaking, ConnectionSettings, HeaderValue, HttpConnectionSettings, HttpRateLimit,
        HttpRouteRateLimit, InvalidRateLimitUnit, LocalRateLimit, RateLimitUnit, RetryPolicy,
        TcpConnectionSettings, TcpRateLimit, TrafficWarmup, UpstreamTrafficSetting,
    },
};

use crate::{ClusterName, IpNet, WeightedCluster};

/// Selects the flows handled by a set of rules on one port.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrafficMatch {
    pub name: String,
    pub destination_port: u16,
    pub destination_protocol: String,
    pub destination_ip_ranges: Vec<IpNet>,
    pub source_ip_ranges: Vec<IpNet>,
    pub server_names: Vec<String>,

    /// Set for egress TLS passthrough matches.
    pub cluster: Option<ClusterName>,
    pub weighted_clusters: Vec<WeightedCluster>,
    pub tcp_rate_limit: Option<TcpRateLimit>,
    pub egress_gateway: Option<String>,
}

/// Normalizes a protocol for the wire: lowercase, and `tcp-server-first`
/// collapses to `tcp`.
pub fn wire_protocol(protocol: &str) -> String {
    let protocol = protocol.to_ascii_lowercase();
    if protocol == crate::constants::PROTOCOL_TCP_SERVER_FIRST {
        return crate::constants::PROTOCOL_TCP.to_string();
    }
    protocol
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_first_is_tcp_on_the_wire() {
        assert_eq!(wire_protocol("TCP-Server-First"), "tcp");
        assert_eq!(wire_protocol("HTTP"), "http");
        assert_eq!(wire_protocol("grpc"), "grpc");
    }
}
