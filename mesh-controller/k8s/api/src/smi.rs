//! Service Mesh Interface resources.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const HTTP_ROUTE_GROUP_KIND: &str = "HTTPRouteGroup";
pub const TCP_ROUTE_KIND: &str = "TCPRoute";
pub const SPECS_GROUP_VERSION: &str = "specs.smi-spec.io/v1alpha4";

/// Splits traffic addressed to a root (apex) service among backends.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "split.smi-spec.io",
    version = "v1alpha4",
    kind = "TrafficSplit",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSplitSpec {
    /// The apex service, by name or `namespace/name`.
    pub service: String,
    pub backends: Vec<TrafficSplitBackend>,
    #[serde(default)]
    pub matches: Vec<TrafficSplitMatch>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct TrafficSplitBackend {
    pub service: String,
    pub weight: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSplitMatch {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "specs.smi-spec.io",
    version = "v1alpha4",
    kind = "HTTPRouteGroup",
    root = "HttpRouteGroup",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteGroupSpec {
    #[serde(default)]
    pub matches: Vec<HttpMatch>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpMatch {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_regex: Option<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "specs.smi-spec.io",
    version = "v1alpha4",
    kind = "TCPRoute",
    root = "TcpRoute",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct TcpRouteSpec {
    #[serde(default)]
    pub matches: TcpMatch,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct TcpMatch {
    #[serde(default)]
    pub ports: Vec<u16>,
}

/// Allows traffic from source identities to a destination identity.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "access.smi-spec.io",
    version = "v1alpha3",
    kind = "TrafficTarget",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct TrafficTargetSpec {
    pub destination: IdentityBinding,
    #[serde(default)]
    pub sources: Vec<IdentityBinding>,
    #[serde(default)]
    pub rules: Vec<TrafficTargetRule>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct IdentityBinding {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct TrafficTargetRule {
    pub kind: String,
    pub name: String,

    /// Names of matches within the referenced route; empty selects all.
    #[serde(default)]
    pub matches: Vec<String>,
}

// === impl TrafficSplitSpec ===

impl TrafficSplitSpec {
    /// Whether this split applies to the named service in `namespace`.
    pub fn is_apex(&self, namespace: &str, split_namespace: &str, name: &str) -> bool {
        match self.service.split_once('/') {
            Some((ns, svc)) => ns == namespace && svc == name,
            None => split_namespace == namespace && self.service == name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apex_accepts_short_and_qualified_names() {
        let split = TrafficSplitSpec {
            service: "bookstore".to_string(),
            backends: vec![],
            matches: vec![],
        };
        assert!(split.is_apex("ns", "ns", "bookstore"));
        assert!(!split.is_apex("other", "ns", "bookstore"));

        let split = TrafficSplitSpec {
            service: "other/bookstore".to_string(),
            ..split
        };
        assert!(split.is_apex("other", "ns", "bookstore"));
        assert!(!split.is_apex("ns", "ns", "bookstore"));
    }

    #[test]
    fn route_group_defaults() {
        let spec: HttpRouteGroupSpec = serde_json::from_value(serde_json::json!({
            "matches": [{"name": "books", "pathRegex": "/books/*", "methods": ["GET"]}]
        }))
        .unwrap();
        assert_eq!(spec.matches.len(), 1);
        assert_eq!(spec.matches[0].path_regex.as_deref(), Some("/books/*"));
        assert!(spec.matches[0].headers.is_empty());
    }
}
