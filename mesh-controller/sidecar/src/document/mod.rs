//! The configuration document a proxy pulls from the repository.
//!
//! Keys follow the data plane's scripts: PascalCase, with empty optional sections omitted.
//! Maps are ordered so that serializing the same document always yields the same bytes.

mod forward;
mod inbound;
mod outbound;
mod reorder;
mod route;
mod settings;

pub use self::{
    forward::{EgressGatewayClusterConfig, ForwardTrafficPolicy},
    inbound::{
        InboundHttpRouteRule, InboundHttpRouteRules, InboundTcpRouteRules, InboundTrafficMatch,
        InboundTrafficPolicy,
    },
    outbound::{
        ClusterConfig, OutboundHttpRouteRules, OutboundTcpRouteRules, OutboundTrafficMatch,
        OutboundTrafficPolicy, ZoneEndpoint,
    },
    route::{HttpMatchRule, HttpRouteRule, MatchType, Plugins, RouteRuleRef, WeightedClusters},
    settings::{
        Certificate, CircuitBreaking, ConnectionSettings, DestinationSecuritySpec, Features,
        HttpConnectionSettings, HttpRateLimit, MeshSpec, Observability, Probes,
        RemoteLoggingSpec, RetryPolicy, SourceSecuritySpec, TcpConnectionSettings, TcpRateLimit,
        TracingSpec, Traffic, Warmup,
    },
};
pub(crate) use self::outbound::host_port;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    /// Set when the document is published.
    pub ts: Option<DateTime<Utc>>,

    /// The document hash, set when the document is published.
    pub version: Option<String>,
    pub metrics: bool,
    pub spec: MeshSpec,
    pub certificate: Option<Certificate>,
    pub inbound: Option<InboundTrafficPolicy>,
    pub outbound: Option<OutboundTrafficPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward: Option<ForwardTrafficPolicy>,
    #[serde(default)]
    pub allowed_endpoints: BTreeMap<String, String>,

    /// Mount point to the URIs of the plugins it runs, in order.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub chains: BTreeMap<String, Vec<String>>,

    /// Names the proxy's DNS answers locally, to their addresses.
    #[serde(
        rename = "DNSResolveDB",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub dns_resolve_db: BTreeMap<String, Vec<String>>,

    /// Version of the plugin set the chains were resolved against.
    #[serde(skip)]
    pub plugin_set_version: String,
}

impl PolicyDocument {
    pub fn inbound(&mut self) -> &mut InboundTrafficPolicy {
        self.inbound.get_or_insert_with(Default::default)
    }

    pub fn outbound(&mut self) -> &mut OutboundTrafficPolicy {
        self.outbound.get_or_insert_with(Default::default)
    }

    pub fn forward(&mut self) -> &mut ForwardTrafficPolicy {
        self.forward.get_or_insert_with(Default::default)
    }

    /// Adds addresses for a name, keeping the list free of duplicates.
    pub fn add_dns_entry(&mut self, name: &str, addrs: impl IntoIterator<Item = String>) {
        let entry = self.dns_resolve_db.entry(name.to_string()).or_default();
        for addr in addrs {
            if !entry.contains(&addr) {
                entry.push(addr);
            }
        }
    }
}
