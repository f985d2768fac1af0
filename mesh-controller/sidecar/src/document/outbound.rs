use super::{
    route::{self, HttpMatchRule, HttpRouteRule, Plugins, RouteRuleRef, WeightedClusters},
    settings::{
        is_false, Certificate, ConnectionSettings, DestinationSecuritySpec, RetryPolicy, Warmup,
    },
};
use fsm_mesh_controller_core::endpoint::LbType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Traffic a proxy may initiate. Several matches may share a port; they are told apart by
/// destination ranges.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct OutboundTrafficPolicy {
    pub traffic_matches: BTreeMap<u16, Vec<OutboundTrafficMatch>>,
    pub clusters_configs: BTreeMap<String, ClusterConfig>,

    /// `port=name` to the position of the match in `traffic_matches`.
    #[serde(skip)]
    named: BTreeMap<String, (u16, usize)>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct OutboundTrafficMatch {
    #[serde(
        rename = "DestinationIPRanges",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub destination_ip_ranges: BTreeMap<String, Option<DestinationSecuritySpec>>,
    pub port: u16,
    pub protocol: String,
    #[serde(
        rename = "HttpHostPort2Service",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub http_host_port_to_service: BTreeMap<String, RouteRuleRef>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub http_service_route_rules: BTreeMap<String, OutboundHttpRouteRules>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_service_route_rules: Option<OutboundTcpRouteRules>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct OutboundHttpRouteRules {
    pub route_rules: Vec<HttpRouteRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress_forward_gateway: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugins: Plugins,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct OutboundTcpRouteRules {
    pub target_clusters: WeightedClusters,
    #[serde(default, skip_serializing_if = "is_false")]
    pub allowed_egress_traffic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress_forward_gateway: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugins: Plugins,
}

/// An upstream cluster and how to reach it.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterConfig {
    pub endpoints: BTreeMap<String, ZoneEndpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_settings: Option<ConnectionSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_cert: Option<Certificate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warmup: Option<Warmup>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ZoneEndpoint {
    pub weight: u32,

    /// The cluster an imported endpoint belongs to; empty for local endpoints.
    #[serde(rename = "Key", default, skip_serializing_if = "String::is_empty")]
    pub cluster_key: String,
    #[serde(skip)]
    pub lb_type: Option<LbType>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
}

// === impl OutboundTrafficPolicy ===

impl OutboundTrafficPolicy {
    /// Returns the match named `name` on `port`, appending it when absent, and whether it
    /// already existed.
    pub fn traffic_match(&mut self, port: u16, name: &str) -> (&mut OutboundTrafficMatch, bool) {
        let key = format!("{port}={name}");
        let matches = self.traffic_matches.entry(port).or_default();
        match self.named.get(&key) {
            Some(&(_, idx)) => (&mut matches[idx], true),
            None => {
                matches.push(OutboundTrafficMatch::default());
                let idx = matches.len() - 1;
                self.named.insert(key, (port, idx));
                (&mut matches[idx], false)
            }
        }
    }

    pub fn cluster_config(&mut self, name: &str) -> &mut ClusterConfig {
        self.clusters_configs.entry(name.to_string()).or_default()
    }

    /// Orders the matches sharing a port. Called once building is done; matches can no
    /// longer be looked up by name afterwards.
    pub(crate) fn sort_traffic_matches(&mut self) {
        self.named.clear();
        for matches in self.traffic_matches.values_mut() {
            matches.sort_by(super::reorder::cmp_destinations);
        }
    }
}

// === impl OutboundTrafficMatch ===

impl OutboundTrafficMatch {
    pub fn route_rules(&mut self, rule_name: &str) -> &mut OutboundHttpRouteRules {
        self.http_service_route_rules
            .entry(rule_name.to_string())
            .or_default()
    }

    pub fn add_host_port(&mut self, host: &str, rule_name: &str, desired_suffix: &str) {
        route::add_host_port(
            &mut self.http_host_port_to_service,
            host,
            rule_name,
            Some(desired_suffix),
        );
    }

    pub fn add_destination_ip_range(
        &mut self,
        range: String,
        spec: Option<DestinationSecuritySpec>,
    ) {
        self.destination_ip_ranges.entry(range).or_insert(spec);
    }

    pub fn tcp_route_rules(&mut self) -> &mut OutboundTcpRouteRules {
        self.tcp_service_route_rules.get_or_insert_with(Default::default)
    }
}

// === impl OutboundHttpRouteRules ===

impl OutboundHttpRouteRules {
    pub fn route_rule(&mut self, matches: HttpMatchRule) -> (&mut HttpRouteRule, bool) {
        route::route_rule(&mut self.route_rules, matches, HttpRouteRule::new)
    }
}

// === impl ClusterConfig ===

impl ClusterConfig {
    /// Adds `addr:port`, or `addr` as is when it already carries a port.
    pub fn add_endpoint(&mut self, addr: &str, port: u16, endpoint: ZoneEndpoint) {
        self.endpoints.insert(host_port(addr, port), endpoint);
    }
}

/// Joins an address and port, bracketing IPv6 addresses. Addresses that already carry a
/// port are returned unchanged.
pub(crate) fn host_port(addr: &str, port: u16) -> String {
    if addr.parse::<std::net::SocketAddr>().is_ok() {
        return addr.to_string();
    }
    if addr.parse::<std::net::Ipv6Addr>().is_ok() {
        return format!("[{addr}]:{port}");
    }
    if addr
        .rsplit_once(':')
        .is_some_and(|(host, p)| !host.contains(':') && p.parse::<u16>().is_ok())
    {
        return addr.to_string();
    }
    format!("{addr}:{port}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_ports() {
        assert_eq!(host_port("10.0.0.2", 80), "10.0.0.2:80");
        assert_eq!(host_port("10.0.0.2:8080", 80), "10.0.0.2:8080");
        assert_eq!(host_port("fd00::2", 80), "[fd00::2]:80");
        assert_eq!(host_port("[fd00::2]:81", 80), "[fd00::2]:81");
        assert_eq!(host_port("api.example.com", 443), "api.example.com:443");
    }

    #[test]
    fn named_matches_are_reused() {
        let mut policy = OutboundTrafficPolicy::default();
        let (_, existed) = policy.traffic_match(80, "http");
        assert!(!existed);
        let (tm, existed) = policy.traffic_match(80, "http");
        assert!(existed);
        tm.protocol = "http".to_string();
        let (_, existed) = policy.traffic_match(80, "outbound_ns/db|80|tcp");
        assert!(!existed);
        assert_eq!(policy.traffic_matches[&80].len(), 2);
        assert_eq!(policy.traffic_matches[&80][0].protocol, "http");
    }
}
