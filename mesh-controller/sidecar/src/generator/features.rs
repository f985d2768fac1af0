use super::Generator;
use crate::document::{RemoteLoggingSpec, TracingSpec};

impl Generator<'_> {
    /// Copies the mesh-wide settings the proxy reads at startup.
    pub(super) fn features(&mut self) {
        let config = self.catalog.configurator();
        let flags = config.feature_flags();
        let spec = &mut self.doc.spec;

        spec.service_identity = self.proxy.identity().to_string();
        spec.compress_config = config.is_sidecar_compress_config();
        spec.sidecar_log_level = config.sidecar_log_level().to_string();
        spec.sidecar_timeout = config.sidecar_timeout();
        spec.sidecar_disabled_mtls = config.is_sidecar_disabled_mtls();
        spec.feature_flags.enable_sidecar_active_health_checks =
            flags.enable_sidecar_active_health_checks;
        spec.feature_flags.enable_auto_default_route = flags.enable_auto_default_route;
        spec.traffic.enable_egress = config.is_egress_enabled();
        spec.traffic.enable_permissive_traffic_policy_mode =
            config.is_permissive_traffic_policy_mode();
        spec.traffic.http1_per_request_load_balancing = config.is_http1_per_request_load_balancing();
        spec.traffic.http2_per_request_load_balancing = config.is_http2_per_request_load_balancing();

        spec.observability.tracing = config.is_tracing_enabled().then(|| TracingSpec {
            address: format!("{}:{}", config.tracing_host(), config.tracing_port()),
            endpoint: config.tracing_endpoint().to_string(),
            sampled_fraction: config.tracing_sampled_fraction().unwrap_or_default().to_string(),
        });
        spec.observability.remote_logging = config.is_remote_logging_enabled().then(|| {
            let logging = config.remote_logging();
            RemoteLoggingSpec {
                level: logging.level,
                address: format!("{}:{}", logging.address, logging.port),
                endpoint: logging.endpoint.clone(),
                authorization: logging.authorization.clone(),
                sampled_fraction: logging.sampled_fraction.clone().unwrap_or_default(),
            }
        });

        spec.cluster_set = config
            .cluster_set()
            .properties
            .iter()
            .map(|prop| (prop.name.clone(), prop.value.clone()))
            .collect();
    }
}
