use super::{
    route::{self, HttpMatchRule, HttpRouteRule, Plugins, RouteRuleRef, WeightedClusters},
    settings::{HttpRateLimit, SourceSecuritySpec, TcpRateLimit},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Traffic a proxy accepts, keyed by local port.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InboundTrafficPolicy {
    pub traffic_matches: BTreeMap<u16, InboundTrafficMatch>,

    /// Local clusters, as `host:port` to weight.
    pub clusters_configs: BTreeMap<String, BTreeMap<String, u32>>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InboundTrafficMatch {
    pub port: u16,
    pub protocol: String,
    #[serde(
        rename = "SourceIPRanges",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub source_ip_ranges: BTreeMap<String, Option<SourceSecuritySpec>>,
    #[serde(
        rename = "HttpHostPort2Service",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub http_host_port_to_service: BTreeMap<String, RouteRuleRef>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub http_service_route_rules: BTreeMap<String, InboundHttpRouteRules>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_service_route_rules: Option<InboundTcpRouteRules>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<TcpRateLimit>,
}

/// The routes of one group of hostnames.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InboundHttpRouteRules {
    pub route_rules: Vec<InboundHttpRouteRule>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugins: Plugins,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<HttpRateLimit>,

    /// Addresses of the workloads allowed to call, to their identity.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub allowed_endpoints: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InboundHttpRouteRule {
    #[serde(flatten)]
    pub rule: HttpRouteRule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<HttpRateLimit>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InboundTcpRouteRules {
    pub target_clusters: WeightedClusters,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugins: Plugins,
}

// === impl InboundTrafficPolicy ===

impl InboundTrafficPolicy {
    pub fn traffic_match(&mut self, port: u16) -> &mut InboundTrafficMatch {
        self.traffic_matches.entry(port).or_default()
    }

    pub fn cluster_config(&mut self, name: &str) -> &mut BTreeMap<String, u32> {
        self.clusters_configs.entry(name.to_string()).or_default()
    }
}

// === impl InboundTrafficMatch ===

impl InboundTrafficMatch {
    /// Returns the group named `rule_name`, creating it when absent.
    pub fn route_rules(&mut self, rule_name: &str) -> &mut InboundHttpRouteRules {
        self.http_service_route_rules
            .entry(rule_name.to_string())
            .or_default()
    }

    pub fn add_host_port(&mut self, host: &str, rule_name: &str) {
        route::add_host_port(&mut self.http_host_port_to_service, host, rule_name, None);
    }

    /// Keeps the security of the first source registered for a range.
    pub fn add_source_ip_range(&mut self, range: String, spec: Option<SourceSecuritySpec>) {
        self.source_ip_ranges.entry(range).or_insert(spec);
    }

    pub fn tcp_route_rules(&mut self) -> &mut InboundTcpRouteRules {
        self.tcp_service_route_rules.get_or_insert_with(Default::default)
    }
}

// === impl InboundHttpRouteRules ===

impl InboundHttpRouteRules {
    /// Returns the route with an equal match and whether it already existed.
    pub fn route_rule(&mut self, matches: HttpMatchRule) -> (&mut InboundHttpRouteRule, bool) {
        route::route_rule(&mut self.route_rules, matches, |matches| InboundHttpRouteRule {
            rule: HttpRouteRule::new(matches),
            rate_limit: None,
        })
    }

    pub fn add_allowed_endpoint(&mut self, addr: String, identity: String) {
        self.allowed_endpoints.entry(addr).or_insert(identity);
    }
}

impl AsRef<HttpMatchRule> for InboundHttpRouteRule {
    fn as_ref(&self) -> &HttpMatchRule {
        &self.rule.matches
    }
}
