use crate::ClusterInfo;
use fsm_mesh_controller_core::constants::{DEFAULT_CERT_VALIDITY, DEFAULT_SIDECAR_LOG_LEVEL};
use fsm_mesh_controller_k8s_api::config::{
    ClusterSetSpec, ConnectorSpec, FeatureFlags, LocalDnsProxySpec, LocalProxyMode,
    MeshConfigSpec, PluginChainsSpec, RemoteLoggingSpec, ServiceAccessMode, ServiceAccessNames,
};
use std::{sync::Arc, time::Duration};

const DEFAULT_TRACING_PORT: u16 = 9411;
const DEFAULT_TRACING_ENDPOINT: &str = "/api/v2/spans";

/// A read-only view of the mesh-wide configuration.
///
/// Cloning is cheap; a configurator captures the MeshConfig that was current
/// when it was obtained from the index.
#[derive(Clone, Debug)]
pub struct Configurator {
    mesh_config: Arc<MeshConfigSpec>,
    cluster_info: Arc<ClusterInfo>,
}

// === impl Configurator ===

impl Configurator {
    pub fn new(mesh_config: Arc<MeshConfigSpec>, cluster_info: Arc<ClusterInfo>) -> Self {
        Self {
            mesh_config,
            cluster_info,
        }
    }

    pub fn mesh_config(&self) -> &MeshConfigSpec {
        &self.mesh_config
    }

    pub fn trust_domain(&self) -> &str {
        &self.cluster_info.trust_domain
    }

    pub fn fsm_namespace(&self) -> &str {
        &self.cluster_info.fsm_namespace
    }

    pub fn mesh_name(&self) -> &str {
        &self.cluster_info.mesh_name
    }

    pub fn feature_flags(&self) -> &FeatureFlags {
        &self.mesh_config.feature_flags
    }

    pub fn is_permissive_traffic_policy_mode(&self) -> bool {
        self.mesh_config.traffic.enable_permissive_traffic_policy_mode
    }

    pub fn is_egress_enabled(&self) -> bool {
        self.mesh_config.traffic.enable_egress
    }

    pub fn is_sidecar_disabled_mtls(&self) -> bool {
        self.mesh_config.sidecar.sidecar_disabled_mtls
    }

    pub fn is_http1_per_request_load_balancing(&self) -> bool {
        self.mesh_config.traffic.http1_per_request_load_balancing
    }

    pub fn is_http2_per_request_load_balancing(&self) -> bool {
        self.mesh_config.traffic.http2_per_request_load_balancing
    }

    pub fn sidecar_log_level(&self) -> &str {
        self.mesh_config
            .sidecar
            .log_level
            .as_deref()
            .filter(|l| !l.is_empty())
            .unwrap_or(DEFAULT_SIDECAR_LOG_LEVEL)
    }

    /// Seconds.
    pub fn sidecar_timeout(&self) -> u32 {
        self.mesh_config.sidecar.sidecar_timeout
    }

    pub fn is_sidecar_compress_config(&self) -> bool {
        self.mesh_config.sidecar.compress_config
    }

    pub fn is_sidecar_pretty_config(&self) -> bool {
        self.mesh_config.feature_flags.enable_sidecar_pretty_config
    }

    pub fn local_proxy_mode(&self) -> LocalProxyMode {
        self.mesh_config.sidecar.local_proxy_mode
    }

    pub fn local_dns_proxy(&self) -> &LocalDnsProxySpec {
        &self.mesh_config.sidecar.local_dns_proxy
    }

    pub fn is_local_dns_proxy_enabled(&self) -> bool {
        self.mesh_config.sidecar.local_dns_proxy.enable
    }

    pub fn is_wildcard_dns_proxy_enabled(&self) -> bool {
        self.mesh_config.sidecar.local_dns_proxy.wildcard.enable
    }

    pub fn service_access_mode(&self) -> ServiceAccessMode {
        self.mesh_config.traffic.service_access_mode
    }

    /// Unset access names qualify hostnames with the trust domain.
    pub fn service_access_names(&self) -> ServiceAccessNames {
        self.mesh_config
            .traffic
            .service_access_names
            .clone()
            .unwrap_or(ServiceAccessNames {
                with_trust_domain: true,
                ..Default::default()
            })
    }

    pub fn is_tracing_enabled(&self) -> bool {
        self.mesh_config.observability.tracing.enable
    }

    pub fn tracing_host(&self) -> String {
        let tracing = &self.mesh_config.observability.tracing;
        if !tracing.address.is_empty() {
            return tracing.address.clone();
        }
        format!("jaeger.{}.svc.cluster.local", self.fsm_namespace())
    }

    pub fn tracing_port(&self) -> u16 {
        match self.mesh_config.observability.tracing.port {
            0 => DEFAULT_TRACING_PORT,
            port => port,
        }
    }

    pub fn tracing_endpoint(&self) -> &str {
        let endpoint = &self.mesh_config.observability.tracing.endpoint;
        if endpoint.is_empty() {
            return DEFAULT_TRACING_ENDPOINT;
        }
        endpoint
    }

    /// Passed through to proxies unparsed.
    pub fn tracing_sampled_fraction(&self) -> Option<&str> {
        self.mesh_config
            .observability
            .tracing
            .sampled_fraction
            .as_deref()
    }

    pub fn remote_logging(&self) -> &RemoteLoggingSpec {
        &self.mesh_config.observability.remote_logging
    }

    pub fn is_remote_logging_enabled(&self) -> bool {
        self.mesh_config.observability.remote_logging.enable
    }

    pub fn service_cert_validity(&self) -> Duration {
        self.mesh_config
            .certificate
            .service_cert_validity_duration
            .filter(|d| !d.is_zero())
            .map(|d| d.as_duration())
            .unwrap_or(DEFAULT_CERT_VALIDITY)
    }

    pub fn global_plugin_chains(&self) -> &PluginChainsSpec {
        &self.mesh_config.plugin_chains
    }

    pub fn cluster_set(&self) -> &ClusterSetSpec {
        &self.mesh_config.cluster_set
    }

    pub fn connector(&self) -> &ConnectorSpec {
        &self.mesh_config.connector
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsm_mesh_controller_k8s_api::duration::GoDuration;

    fn configurator(spec: MeshConfigSpec) -> Configurator {
        Configurator::new(Arc::new(spec), Arc::new(ClusterInfo::default()))
    }

    #[test]
    fn defaults() {
        let cfg = configurator(MeshConfigSpec::default());
        assert_eq!(cfg.sidecar_log_level(), "error");
        assert_eq!(cfg.tracing_host(), "jaeger.fsm-system.svc.cluster.local");
        assert_eq!(cfg.tracing_port(), 9411);
        assert_eq!(cfg.tracing_endpoint(), "/api/v2/spans");
        assert_eq!(cfg.service_cert_validity(), Duration::from_secs(24 * 60 * 60));
        assert!(cfg.service_access_names().with_trust_domain);
        assert_eq!(cfg.service_access_mode(), ServiceAccessMode::Domain);
    }

    #[test]
    fn configured_values_win() {
        let mut spec = MeshConfigSpec::default();
        spec.sidecar.log_level = Some("debug".to_string());
        spec.observability.tracing.address = "zipkin.tracing".to_string();
        spec.observability.tracing.port = 9412;
        spec.observability.tracing.sampled_fraction = Some("0.25".to_string());
        spec.certificate.service_cert_validity_duration = Some(GoDuration::from_secs(3600));
        spec.traffic.service_access_names = Some(ServiceAccessNames {
            must_with_service_port: true,
            ..Default::default()
        });

        let cfg = configurator(spec);
        assert_eq!(cfg.sidecar_log_level(), "debug");
        assert_eq!(cfg.tracing_host(), "zipkin.tracing");
        assert_eq!(cfg.tracing_port(), 9412);
        assert_eq!(cfg.tracing_sampled_fraction(), Some("0.25"));
        assert_eq!(cfg.service_cert_validity(), Duration::from_secs(3600));
        let names = cfg.service_access_names();
        assert!(names.must_with_service_port);
        assert!(!names.with_trust_domain);
    }
}
