pub mod access_cert;
pub mod access_control;
pub mod egress;
pub mod egress_gateway;
pub mod ingress_backend;
pub mod isolation;
pub mod retry;
pub mod traffic_warmup;
pub mod upstream_traffic_setting;

pub use self::{
    access_cert::{AccessCert, AccessCertSpec},
    access_control::{AccessControl, AccessControlSpec},
    egress::{Egress, EgressSpec},
    egress_gateway::{EgressGateway, EgressGatewaySpec},
    ingress_backend::{IngressBackend, IngressBackendSpec},
    isolation::{Isolation, IsolationSpec},
    retry::{Retry, RetryPolicySpec, RetrySpec},
    traffic_warmup::{TrafficWarmup, TrafficWarmupSpec},
    upstream_traffic_setting::{UpstreamTrafficSetting, UpstreamTrafficSettingSpec},
};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const GROUP_VERSION: &str = "policy.flomesh.io/v1alpha1";

/// A service port that an AccessControl or IngressBackend admits traffic to.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendSpec {
    pub name: String,
    pub port: PortSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSpec>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PortSpec {
    pub number: u16,
    pub protocol: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    #[serde(default)]
    pub skip_client_cert_validation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni_hosts: Option<Vec<String>>,
}

/// A traffic source admitted by an AccessControl or IngressBackend.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    pub kind: SourceKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum SourceKind {
    Service,
    AuthenticatedPrincipal,
    #[serde(rename = "IPRange")]
    IpRange,
}

/// A typed reference to a route or setting resource.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    pub kind: String,
    pub name: String,
}

/// A namespaced subject, such as a ServiceAccount or a Service.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRef {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

// === impl SourceKind ===

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Service => "Service".fmt(f),
            Self::AuthenticatedPrincipal => "AuthenticatedPrincipal".fmt(f),
            Self::IpRange => "IPRange".fmt(f),
        }
    }
}

// === impl BackendSpec ===

impl BackendSpec {
    pub fn skips_client_cert_validation(&self) -> bool {
        self.tls
            .as_ref()
            .is_some_and(|tls| tls.skip_client_cert_validation)
    }
}
