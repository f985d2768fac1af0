use crate::duration::GoDuration;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Mesh-wide settings. Every section defaults so that a partially populated
/// resource still yields a usable configuration.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "config.flomesh.io",
    version = "v1alpha3",
    kind = "MeshConfig",
    namespaced
)]
#[serde(rename_all = "camelCase", default)]
pub struct MeshConfigSpec {
    pub cluster_set: ClusterSetSpec,
    pub sidecar: SidecarSpec,
    pub repo_server: RepoServerSpec,
    pub traffic: TrafficSpec,
    pub observability: ObservabilitySpec,
    pub certificate: CertificateSpec,
    pub feature_flags: FeatureFlags,
    pub plugin_chains: PluginChainsSpec,
    pub connector: ConnectorSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSetSpec {
    pub is_managed: bool,
    pub uid: String,
    pub region: String,
    pub zone: String,
    pub group: String,
    pub name: String,
    #[serde(rename = "controlPlaneUID")]
    pub control_plane_uid: String,
    pub properties: Vec<ClusterPropertySpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ClusterPropertySpec {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct SidecarSpec {
    pub compress_config: bool,
    pub log_level: Option<String>,
    #[serde(rename = "sidecarDisabledMTLS")]
    pub sidecar_disabled_mtls: bool,

    /// Seconds.
    pub sidecar_timeout: u32,
    pub local_proxy_mode: LocalProxyMode,
    #[serde(rename = "localDNSProxy")]
    pub local_dns_proxy: LocalDnsProxySpec,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum LocalProxyMode {
    #[default]
    Localhost,
    #[serde(rename = "PodIP")]
    PodIp,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalDnsProxySpec {
    pub enable: bool,
    #[serde(rename = "generateIPv6BasedOnIPv4")]
    pub generate_ipv6_based_on_ipv4: bool,
    pub wildcard: WildcardDnsSpec,
    pub db: Vec<ResolveDnSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct WildcardDnsSpec {
    pub enable: bool,
    pub los: Vec<ResolveAddrSpec>,
    pub ips: Vec<ResolveAddrSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ResolveDnSpec {
    pub dn: String,
    #[serde(default)]
    pub ips: Vec<ResolveAddrSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ResolveAddrSpec {
    pub ipv4: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct RepoServerSpec {
    pub ipaddr: String,
    pub port: u16,
    pub codebase: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct TrafficSpec {
    pub enable_egress: bool,
    pub enable_permissive_traffic_policy_mode: bool,
    #[serde(rename = "http1PerRequestLoadBalancing")]
    pub http1_per_request_load_balancing: bool,
    #[serde(rename = "http2PerRequestLoadBalancing")]
    pub http2_per_request_load_balancing: bool,
    pub service_access_mode: ServiceAccessMode,
    pub service_access_names: Option<ServiceAccessNames>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ServiceAccessMode {
    Ip,
    #[default]
    Domain,
    Mixed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceAccessNames {
    pub must_with_service_port: bool,
    pub with_trust_domain: bool,
    pub must_with_namespace: bool,
    pub cloud: Option<CloudServiceAccessNames>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudServiceAccessNames {
    pub with_namespace: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ObservabilitySpec {
    pub tracing: TracingSpec,
    pub remote_logging: RemoteLoggingSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct TracingSpec {
    pub enable: bool,
    pub port: u16,
    pub address: String,
    pub endpoint: String,
    pub sampled_fraction: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteLoggingSpec {
    pub enable: bool,
    pub level: u16,
    pub port: u16,
    pub address: String,
    pub endpoint: String,
    pub authorization: String,
    pub sampled_fraction: Option<String>,
    pub secret_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct CertificateSpec {
    pub service_cert_validity_duration: Option<GoDuration>,
    pub cert_key_bit_size: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct FeatureFlags {
    pub enable_egress_policy: bool,
    pub enable_ingress_backend_policy: bool,
    pub enable_access_control_policy: bool,
    pub enable_access_cert_policy: bool,
    pub enable_sidecar_pretty_config: bool,
    pub enable_sidecar_active_health_checks: bool,
    pub enable_retry_policy: bool,
    pub enable_plugin_policy: bool,
    pub enable_auto_default_route: bool,
}

/// Built-in plugins mounted on every proxy, per mount point.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct PluginChainsSpec {
    #[serde(rename = "inbound-tcp")]
    pub inbound_tcp: Vec<GlobalPluginSpec>,
    #[serde(rename = "inbound-http")]
    pub inbound_http: Vec<GlobalPluginSpec>,
    #[serde(rename = "outbound-tcp")]
    pub outbound_tcp: Vec<GlobalPluginSpec>,
    #[serde(rename = "outbound-http")]
    pub outbound_http: Vec<GlobalPluginSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct GlobalPluginSpec {
    pub plugin: String,
    #[serde(default)]
    pub priority: f32,
    #[serde(default)]
    pub disable: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectorSpec {
    pub lb: ConnectorLbSpec,
    pub via_gateway: ConnectorGatewaySpec,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectorLbSpec {
    #[serde(rename = "type")]
    pub lb_type: Option<String>,
    pub master_namespace: String,
    pub slave_namespaces: Vec<String>,
}

/// Addresses of the gateway bridging mesh and cloud clusters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectorGatewaySpec {
    #[serde(rename = "clusterIP")]
    pub cluster_ip: String,
    #[serde(rename = "externalIP")]
    pub external_ip: String,
    pub ingress_addr: String,
    #[serde(rename = "ingressHTTPPort")]
    pub ingress_http_port: u16,
    #[serde(rename = "ingressGRPCPort")]
    pub ingress_grpc_port: u16,
    pub egress_addr: String,
    #[serde(rename = "egressHTTPPort")]
    pub egress_http_port: u16,
    #[serde(rename = "egressGRPCPort")]
    pub egress_grpc_port: u16,
}

// === impl PluginChainsSpec ===

impl PluginChainsSpec {
    /// Enabled plugins keyed by mount point.
    pub fn enabled(&self) -> impl Iterator<Item = (&'static str, &GlobalPluginSpec)> + '_ {
        let chains: [(&'static str, &Vec<GlobalPluginSpec>); 4] = [
            ("inbound-tcp", &self.inbound_tcp),
            ("inbound-http", &self.inbound_http),
            ("outbound-tcp", &self.outbound_tcp),
            ("outbound-http", &self.outbound_http),
        ];
        chains.into_iter().flat_map(|(mount_point, plugins)| {
            plugins
                .iter()
                .filter(|p| !p.disable)
                .map(move |p| (mount_point, p))
        })
    }
}

// === impl ConnectorLbSpec ===

impl ConnectorLbSpec {
    fn is_fail_over(&self) -> bool {
        self.lb_type.as_deref() == Some("FailOver") && !self.slave_namespaces.is_empty()
    }

    pub fn is_master_namespace(&self, namespace: &str) -> bool {
        self.is_fail_over() && self.master_namespace.eq_ignore_ascii_case(namespace)
    }

    pub fn is_slave_namespace(&self, namespace: &str) -> bool {
        self.is_fail_over()
            && self
                .slave_namespaces
                .iter()
                .any(|ns| ns.eq_ignore_ascii_case(namespace))
    }
}
