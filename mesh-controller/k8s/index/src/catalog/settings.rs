use super::Catalog;
use fsm_mesh_controller_core::{
    constants::{
        WARMUP_AGGRESSION_ANNOTATION, WARMUP_DURATION_ANNOTATION, WARMUP_ENABLE_ANNOTATION,
        WARMUP_MAX_WEIGHT_ANNOTATION, WARMUP_MIN_WEIGHT_ANNOTATION,
    },
    trafficpolicy::{
        CircuitBreaking, ConnectionSettings, HeaderValue, HttpConnectionSettings, HttpRateLimit,
        HttpRouteRateLimit, LocalRateLimit, RetryPolicy, TcpConnectionSettings, TcpRateLimit,
        TrafficWarmup, UpstreamTrafficSetting,
    },
    MeshService, ServiceIdentity,
};
use fsm_mesh_controller_k8s_api::{
    duration::GoDuration,
    policy::{
        upstream_traffic_setting::{
            ConnectionSettingsSpec, HttpLocalRateLimitSpec, LocalRateLimitSpec,
            TcpLocalRateLimitSpec,
        },
        RetryPolicySpec, UpstreamTrafficSetting as UpstreamTrafficSettingResource,
    },
    ResourceExt,
};
use std::str::FromStr;

const SERVICE_KIND: &str = "Service";

impl Catalog<'_> {
    /// The retry policy of the first Retry whose source is the downstream service account and
    /// which lists the upstream service, or a sibling of it, as a destination.
    pub fn get_retry_policy(
        &self,
        downstream: &ServiceIdentity,
        svc: &MeshService,
    ) -> Option<RetryPolicy> {
        if !self.config.feature_flags().enable_retry_policy {
            return None;
        }
        self.index
            .retries
            .iter()
            .filter(|retry| {
                let src = &retry.spec.source;
                src.name == downstream.name() && src.namespace == downstream.namespace()
            })
            .find(|retry| {
                retry.spec.destinations.iter().any(|dst| {
                    dst.kind == SERVICE_KIND
                        && dst.namespace == svc.namespace
                        && (dst.name == svc.name || dst.name == svc.provider_name())
                })
            })
            .map(|retry| retry_policy(&retry.spec.retry_policy))
    }

    /// The UpstreamTrafficSetting of a mesh service: one in the service's namespace whose host
    /// names the service.
    pub fn get_upstream_traffic_setting(&self, svc: &MeshService) -> Option<UpstreamTrafficSetting> {
        let name = svc.provider_name();
        let hosts = [
            name.to_string(),
            format!("{name}.{}", svc.namespace),
            format!("{name}.{}.svc", svc.namespace),
            format!("{name}.{}.svc.{}", svc.namespace, self.trust_domain()),
        ];
        self.index
            .upstream_traffic_settings
            .in_namespace(&svc.namespace)
            .find(|ust| hosts.contains(&ust.spec.host))
            .map(upstream_traffic_setting)
    }

    /// The UpstreamTrafficSetting for an external host.
    pub fn get_upstream_traffic_setting_by_host(&self, host: &str) -> Option<UpstreamTrafficSetting> {
        self.index
            .upstream_traffic_settings
            .iter()
            .find(|ust| ust.spec.host == host)
            .map(upstream_traffic_setting)
    }

    pub(crate) fn get_upstream_traffic_setting_by_name(
        &self,
        namespace: &str,
        name: &str,
    ) -> Option<UpstreamTrafficSetting> {
        self.index
            .upstream_traffic_settings
            .get(namespace, name)
            .map(upstream_traffic_setting)
    }

    /// Slow-start settings for new endpoints of a service: its TrafficWarmup resource, or the
    /// warmup annotations of its namespace.
    pub fn get_traffic_warmup_policy(&self, svc: &MeshService) -> Option<TrafficWarmup> {
        if let Some(warmup) = self
            .index
            .traffic_warmups
            .get(&svc.namespace, svc.provider_name())
        {
            let spec = &warmup.spec;
            let defaults = TrafficWarmup::default();
            return Some(TrafficWarmup {
                enable: spec.enable,
                duration: spec
                    .duration
                    .map(|d| d.as_duration())
                    .unwrap_or(defaults.duration),
                min_weight: spec.min_weight.unwrap_or(defaults.min_weight),
                max_weight: spec.max_weight.unwrap_or(defaults.max_weight),
                aggression: spec.aggression.unwrap_or(defaults.aggression),
            })
            .filter(|w| w.enable);
        }

        let ns = self.index.namespaces.get("", &svc.namespace)?;
        let annotations = ns.annotations();
        if annotations.get(WARMUP_ENABLE_ANNOTATION).map(String::as_str) != Some("true") {
            return None;
        }
        let defaults = TrafficWarmup::default();
        Some(TrafficWarmup {
            enable: true,
            duration: annotation::<GoDuration>(annotations.get(WARMUP_DURATION_ANNOTATION))
                .map(|d| d.as_duration())
                .unwrap_or(defaults.duration),
            min_weight: annotation(annotations.get(WARMUP_MIN_WEIGHT_ANNOTATION))
                .unwrap_or(defaults.min_weight),
            max_weight: annotation(annotations.get(WARMUP_MAX_WEIGHT_ANNOTATION))
                .unwrap_or(defaults.max_weight),
            aggression: annotation(annotations.get(WARMUP_AGGRESSION_ANNOTATION))
                .unwrap_or(defaults.aggression),
        })
    }
}

fn annotation<T: FromStr>(value: Option<&String>) -> Option<T> {
    let value = value?;
    match value.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(%value, "Ignoring invalid warmup annotation");
            None
        }
    }
}

pub(crate) fn retry_policy(spec: &RetryPolicySpec) -> RetryPolicy {
    RetryPolicy {
        retry_on: spec.retry_on.clone(),
        per_try_timeout: spec.per_try_timeout.map(|d| d.as_duration()),
        num_retries: spec.num_retries,
        retry_backoff_base_interval: spec.retry_backoff_base_interval.map(|d| d.as_duration()),
    }
}

fn upstream_traffic_setting(ust: &UpstreamTrafficSettingResource) -> UpstreamTrafficSetting {
    let spec = &ust.spec;
    UpstreamTrafficSetting {
        namespace: ust.namespace().unwrap_or_default(),
        name: ust.name_unchecked(),
        host: spec.host.clone(),
        connection_settings: spec.connection_settings.as_ref().map(connection_settings),
        rate_limit: spec
            .rate_limit
            .as_ref()
            .and_then(|rl| rl.local.as_ref())
            .map(local_rate_limit),
        http_routes: spec
            .http_routes
            .iter()
            .map(|route| HttpRouteRateLimit {
                path: route.path.clone(),
                rate_limit: route
                    .rate_limit
                    .as_ref()
                    .and_then(|rl| rl.local.as_ref())
                    .and_then(http_rate_limit),
            })
            .collect(),
    }
}

fn connection_settings(spec: &ConnectionSettingsSpec) -> ConnectionSettings {
    ConnectionSettings {
        tcp: spec.tcp.as_ref().map(|tcp| TcpConnectionSettings {
            max_connections: tcp.max_connections,
            connect_timeout: tcp.connect_timeout.map(|d| d.as_duration()),
        }),
        http: spec.http.as_ref().map(|http| HttpConnectionSettings {
            max_requests: http.max_requests,
            max_requests_per_connection: http.max_requests_per_connection,
            max_pending_requests: http.max_pending_requests,
            max_retries: http.max_retries,
            circuit_breaking: http.circuit_breaking.as_ref().map(|cb| CircuitBreaking {
                stat_time_window: cb.stat_time_window.as_duration(),
                min_request_amount: cb.min_request_amount,
                degraded_time_window: cb.degraded_time_window.as_duration(),
                slow_time_threshold: cb.slow_time_threshold.map(|d| d.as_duration()),
                slow_amount_threshold: cb.slow_amount_threshold,
                slow_ratio_threshold: cb.slow_ratio_threshold,
                error_amount_threshold: cb.error_amount_threshold,
                error_ratio_threshold: cb.error_ratio_threshold,
                degraded_status_code: cb.degraded_status_code,
                degraded_response_content: cb.degraded_response_content.clone(),
            }),
        }),
    }
}

fn local_rate_limit(spec: &LocalRateLimitSpec) -> LocalRateLimit {
    LocalRateLimit {
        tcp: spec.tcp.as_ref().and_then(tcp_rate_limit),
        http: spec.http.as_ref().and_then(http_rate_limit),
    }
}

fn tcp_rate_limit(spec: &TcpLocalRateLimitSpec) -> Option<TcpRateLimit> {
    let unit = match spec.unit.parse() {
        Ok(unit) => unit,
        Err(error) => {
            tracing::warn!(%error, "Ignoring TCP rate limit");
            return None;
        }
    };
    Some(TcpRateLimit {
        connections: spec.connections,
        unit,
        burst: spec.burst,
    })
}

fn http_rate_limit(spec: &HttpLocalRateLimitSpec) -> Option<HttpRateLimit> {
    let unit = match spec.unit.parse() {
        Ok(unit) => unit,
        Err(error) => {
            tracing::warn!(%error, "Ignoring HTTP rate limit");
            return None;
        }
    };
    Some(HttpRateLimit {
        requests: spec.requests,
        unit,
        burst: spec.burst,
        response_status_code: spec.response_status_code,
        response_headers_to_add: spec
            .response_headers_to_add
            .iter()
            .map(|h| HeaderValue {
                name: h.name.clone(),
                value: h.value.clone(),
            })
            .collect(),
    })
}
