use fsm_mesh_controller_core::{
    certificate::Certificate as MeshCertificate,
    trafficpolicy::{self as ir, SourceCert},
};
use fsm_mesh_controller_k8s_api::Probe;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};

/// Mesh-wide settings a proxy reads at startup.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MeshSpec {
    pub service_identity: String,
    pub sidecar_log_level: String,
    pub sidecar_timeout: u32,
    #[serde(default, skip_serializing_if = "is_false")]
    pub sidecar_disabled_mtls: bool,
    pub traffic: Traffic,
    pub feature_flags: Features,
    #[serde(default)]
    pub probes: Probes,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cluster_set: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Observability::is_empty")]
    pub observability: Observability,

    /// Whether the document is published gzipped.
    #[serde(skip)]
    pub compress_config: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Traffic {
    pub enable_egress: bool,
    pub enable_permissive_traffic_policy_mode: bool,
    #[serde(rename = "HTTP1PerRequestLoadBalancing")]
    pub http1_per_request_load_balancing: bool,
    #[serde(rename = "HTTP2PerRequestLoadBalancing")]
    pub http2_per_request_load_balancing: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Features {
    pub enable_sidecar_active_health_checks: bool,
    pub enable_auto_default_route: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Probes {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readiness_probes: Vec<Probe>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub liveness_probes: Vec<Probe>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub startup_probes: Vec<Probe>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Observability {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracing: Option<TracingSpec>,
    #[serde(
        rename = "remoteLogging",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub remote_logging: Option<RemoteLoggingSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TracingSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sampled_fraction: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteLoggingSpec {
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub level: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub authorization: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sampled_fraction: String,
}

/// Certificate material, either the proxy's own or a client certificate for an egress
/// destination.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Certificate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fsm_issued: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subject_alt_names: Vec<String>,
    pub expiration: String,
    pub cert_chain: String,
    pub private_key: String,
    #[serde(rename = "IssuingCA")]
    pub issuing_ca: String,
}

/// Durations are expressed in seconds.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RetryPolicy {
    pub retry_on: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_try_timeout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_backoff_base_interval: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ConnectionSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpConnectionSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpConnectionSettings>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TcpConnectionSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HttpConnectionSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests_per_connection: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pending_requests: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaking: Option<CircuitBreaking>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CircuitBreaking {
    pub stat_time_window: f64,
    pub min_request_amount: u32,
    pub degraded_time_window: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slow_time_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slow_amount_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slow_ratio_threshold: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_amount_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_ratio_threshold: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_status_code: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_response_content: Option<String>,
}

/// Gradual ramp-up of traffic to newly started endpoints.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Warmup {
    pub enable: bool,
    pub duration: f64,
    pub min_weight: u32,
    pub max_weight: u32,
    pub aggression: f32,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TcpRateLimit {
    #[serde(rename = "Local")]
    pub local: TcpLocalRateLimit,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TcpLocalRateLimit {
    pub connections: u32,
    pub stat_time_window: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub burst: u32,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct HttpRateLimit {
    #[serde(rename = "Local")]
    pub local: HttpLocalRateLimit,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HttpLocalRateLimit {
    pub requests: u32,
    pub stat_time_window: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub burst: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub response_status_code: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_headers_to_add: Vec<HeaderValue>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HeaderValue {
    pub name: String,
    pub value: String,
}

/// How traffic from a source range is authenticated.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SourceSecuritySpec {
    #[serde(rename = "mTLS")]
    pub mtls: bool,
    pub skip_client_cert_validation: bool,
    #[serde(default)]
    pub authenticated_principals: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DestinationSecuritySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_cert: Option<Certificate>,
}

pub(crate) fn is_false(b: &bool) -> bool {
    !*b
}

pub(crate) fn is_zero(n: &u32) -> bool {
    *n == 0
}

fn is_zero_u16(n: &u16) -> bool {
    *n == 0
}

fn secs(d: Duration) -> f64 {
    d.as_secs_f64()
}

// === impl Observability ===

impl Observability {
    pub fn is_empty(&self) -> bool {
        self.tracing.is_none() && self.remote_logging.is_none()
    }
}

// === impl Certificate ===

impl Certificate {
    /// The proxy's own certificate as written at the top of its document.
    pub fn from_mesh(cert: &MeshCertificate) -> Self {
        Self {
            fsm_issued: None,
            common_name: Some(cert.common_name.clone()),
            subject_alt_names: Vec::new(),
            expiration: cert.expiration_string(),
            cert_chain: cert.cert_chain.clone(),
            private_key: cert.private_key.clone(),
            issuing_ca: cert.issuing_ca.clone(),
        }
    }

    /// A client certificate for an egress destination. `FsmIssued` certificates are
    /// substituted by the proxy with its own.
    pub fn from_source_cert(source: &SourceCert) -> Self {
        match source {
            SourceCert::FsmIssued => Self {
                fsm_issued: Some(true),
                ..Default::default()
            },
            SourceCert::Secret {
                sans,
                expiration,
                issuing_ca,
                cert_chain,
                private_key,
            } => Self {
                fsm_issued: Some(false),
                common_name: None,
                subject_alt_names: sans.clone(),
                expiration: expiration.clone(),
                cert_chain: cert_chain.clone().unwrap_or_default(),
                private_key: private_key.clone().unwrap_or_default(),
                issuing_ca: issuing_ca.clone().unwrap_or_default(),
            },
        }
    }
}

// === conversions from the traffic policy model ===

impl From<&ir::RetryPolicy> for RetryPolicy {
    fn from(retry: &ir::RetryPolicy) -> Self {
        Self {
            retry_on: retry.retry_on.clone(),
            per_try_timeout: retry.per_try_timeout.map(secs),
            num_retries: retry.num_retries,
            retry_backoff_base_interval: retry.retry_backoff_base_interval.map(secs),
        }
    }
}

impl From<&ir::ConnectionSettings> for ConnectionSettings {
    fn from(settings: &ir::ConnectionSettings) -> Self {
        Self {
            tcp: settings.tcp.as_ref().map(|tcp| TcpConnectionSettings {
                max_connections: tcp.max_connections,
                connect_timeout: tcp.connect_timeout.map(secs),
            }),
            http: settings.http.as_ref().map(|http| HttpConnectionSettings {
                max_requests: http.max_requests,
                max_requests_per_connection: http.max_requests_per_connection,
                max_pending_requests: http.max_pending_requests,
                max_retries: http.max_retries,
                circuit_breaking: http.circuit_breaking.as_ref().map(Into::into),
            }),
        }
    }
}

impl From<&ir::CircuitBreaking> for CircuitBreaking {
    fn from(cb: &ir::CircuitBreaking) -> Self {
        Self {
            stat_time_window: secs(cb.stat_time_window),
            min_request_amount: cb.min_request_amount,
            degraded_time_window: secs(cb.degraded_time_window),
            slow_time_threshold: cb.slow_time_threshold.map(secs),
            slow_amount_threshold: cb.slow_amount_threshold,
            slow_ratio_threshold: cb.slow_ratio_threshold,
            error_amount_threshold: cb.error_amount_threshold,
            error_ratio_threshold: cb.error_ratio_threshold,
            degraded_status_code: cb.degraded_status_code,
            degraded_response_content: cb.degraded_response_content.clone(),
        }
    }
}

impl From<&ir::TrafficWarmup> for Warmup {
    fn from(warmup: &ir::TrafficWarmup) -> Self {
        Self {
            enable: warmup.enable,
            duration: secs(warmup.duration),
            min_weight: warmup.min_weight,
            max_weight: warmup.max_weight,
            aggression: warmup.aggression,
        }
    }
}

impl From<&ir::TcpRateLimit> for TcpRateLimit {
    fn from(rl: &ir::TcpRateLimit) -> Self {
        Self {
            local: TcpLocalRateLimit {
                connections: rl.connections,
                stat_time_window: rl.unit.stat_time_window(),
                burst: rl.burst,
            },
        }
    }
}

impl From<&ir::HttpRateLimit> for HttpRateLimit {
    fn from(rl: &ir::HttpRateLimit) -> Self {
        Self {
            local: HttpLocalRateLimit {
                requests: rl.requests,
                stat_time_window: rl.unit.stat_time_window(),
                burst: rl.burst,
                response_status_code: rl.response_status_code,
                response_headers_to_add: rl
                    .response_headers_to_add
                    .iter()
                    .map(|h| HeaderValue {
                        name: h.name.clone(),
                        value: h.value.clone(),
                    })
                    .collect(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsm_mesh_controller_core::trafficpolicy::RateLimitUnit;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn rate_limits_nest_under_local() {
        let tcp = TcpRateLimit::from(&ir::TcpRateLimit {
            connections: 10,
            unit: RateLimitUnit::Minute,
            burst: 0,
        });
        assert_eq!(
            serde_json::to_value(&tcp).unwrap(),
            json!({ "Local": { "Connections": 10, "StatTimeWindow": 60.0 } })
        );

        let http = HttpRateLimit::from(&ir::HttpRateLimit {
            requests: 5,
            unit: RateLimitUnit::Hour,
            burst: 2,
            response_status_code: 429,
            response_headers_to_add: vec![ir::HeaderValue {
                name: "x-limited".to_string(),
                value: "1".to_string(),
            }],
        });
        assert_eq!(
            serde_json::to_value(&http).unwrap(),
            json!({ "Local": {
                "Requests": 5,
                "StatTimeWindow": 3600.0,
                "Burst": 2,
                "ResponseStatusCode": 429,
                "ResponseHeadersToAdd": [{ "Name": "x-limited", "Value": "1" }],
            }})
        );
    }

    #[test]
    fn absent_retry_fields_are_omitted() {
        let retry = RetryPolicy::from(&ir::RetryPolicy {
            retry_on: "5xx".to_string(),
            per_try_timeout: Some(Duration::from_millis(1500)),
            num_retries: None,
            retry_backoff_base_interval: None,
        });
        assert_eq!(
            serde_json::to_value(&retry).unwrap(),
            json!({ "RetryOn": "5xx", "PerTryTimeout": 1.5 })
        );
    }

    #[test]
    fn secret_source_certs_are_not_fsm_issued() {
        let cert = Certificate::from_source_cert(&SourceCert::Secret {
            sans: vec!["api.example.com".to_string()],
            expiration: "2030-01-01 00:00:00".to_string(),
            issuing_ca: Some("ca".to_string()),
            cert_chain: Some("chain".to_string()),
            private_key: None,
        });
        assert_eq!(cert.fsm_issued, Some(false));
        assert_eq!(cert.issuing_ca, "ca");
        assert_eq!(cert.private_key, "");

        let fsm = serde_json::to_value(Certificate::from_source_cert(&SourceCert::FsmIssued)).unwrap();
        assert_eq!(fsm["FsmIssued"], json!(true));
        assert!(fsm.get("CommonName").is_none());
    }
}
