use super::{InboundTrafficPolicy, TcpRateLimit};
use crate::IpNet;

/// TLS termination settings for traffic entering through a gateway.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngressTls {
    pub skip_client_cert_validation: bool,
    pub sni_hosts: Vec<String>,
}

/// Selects traffic arriving from outside the mesh on one backend port.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IngressTrafficMatch {
    pub name: String,
    pub port: u16,
    pub protocol: String,
    pub source_ip_ranges: Vec<IpNet>,
    pub server_names: Vec<String>,
    pub tls: Option<IngressTls>,
    pub tcp_rate_limit: Option<TcpRateLimit>,
}

/// Traffic admitted into a service from non-mesh sources.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IngressTrafficPolicy {
    pub traffic_matches: Vec<IngressTrafficMatch>,
    pub http_route_policies: Vec<InboundTrafficPolicy>,
}

/// Produced from AccessControl resources.
pub type AccessControlTrafficPolicy = IngressTrafficPolicy;

/// Produced from ServiceExport resources for cross-cluster callers.
pub type ServiceExportTrafficPolicy = IngressTrafficPolicy;

// === impl IngressTrafficMatch ===

impl IngressTrafficMatch {
    pub fn skip_client_cert_validation(&self) -> bool {
        self.tls
            .as_ref()
            .is_some_and(|tls| tls.skip_client_cert_validation)
    }
}
