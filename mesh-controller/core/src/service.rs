use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A service as seen by the mesh: one Kubernetes service port.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MeshService {
    pub namespace: String,
    pub name: String,
    pub port: u16,
    pub target_port: u16,
    pub protocol: String,

    /// Set when the service was synced from a cloud registry into another
    /// namespace and is attached to workloads of this namespace.
    pub cloud_attached_to: String,
}

/// The name of an upstream cluster in a proxy configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterName(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WeightedCluster {
    pub cluster_name: ClusterName,
    pub weight: u32,
}

/// The direction component of a traffic match name.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
    Ingress,
    AccessControl,
    Export,
    Egress,
}

// === impl MeshService ===

impl MeshService {
    pub fn namespaced_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// The cluster name used by sidecars for this service's upstream.
    pub fn sidecar_cluster_name(&self) -> String {
        format!("{}/{}|{}", self.namespace, self.name, self.target_port)
    }

    /// The cluster name used by a sidecar for its own local workload.
    pub fn sidecar_local_cluster_name(&self) -> String {
        format!("{}/{}|{}|local", self.namespace, self.name, self.target_port)
    }

    pub fn cluster_name(&self) -> ClusterName {
        ClusterName(self.sidecar_cluster_name())
    }

    pub fn local_cluster_name(&self) -> ClusterName {
        ClusterName(self.sidecar_local_cluster_name())
    }

    /// `name.namespace` when qualified, otherwise `name`.
    pub fn policy_name(&self, with_namespace: bool) -> String {
        if with_namespace {
            format!("{}.{}", self.name, self.namespace)
        } else {
            self.name.clone()
        }
    }

    pub fn fqdn(&self, trust_domain: &str) -> String {
        format!("{}.{}.svc.{}", self.name, self.namespace, trust_domain)
    }

    /// StatefulSet services name a single replica as `<host>.<service>`.
    pub fn subdomain(&self) -> Option<&str> {
        let (host, _) = self.name.split_once('.')?;
        Some(host)
    }

    /// The service name with any subdomain removed.
    pub fn provider_name(&self) -> &str {
        match self.name.split_once('.') {
            Some((_, name)) => name,
            None => &self.name,
        }
    }

    /// Whether `other` is a replica-specific view of the same service.
    pub fn sibling_to(&self, other: &MeshService) -> bool {
        self.namespace == other.namespace && self.provider_name() == other.provider_name()
    }

    /// Parses `<namespace>/<name>|<port>` into a service keyed by target port.
    pub fn from_cluster_name(cluster: &str) -> Result<Self, ParseError> {
        let chunks = cluster
            .split(|c: char| c == '/' || c == '|')
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>();
        if chunks.len() != 3 {
            return Err(ParseError::ClusterName(cluster.to_string()));
        }
        Ok(Self {
            namespace: chunks[0].to_string(),
            name: chunks[1].to_string(),
            target_port: chunks[2].parse()?,
            ..Default::default()
        })
    }

    /// Parses `<name>.<namespace>[.svc.<trust>]:<port>`.
    pub fn from_host(host: &str) -> Result<Self, ParseError> {
        let chunks = host
            .split(|c: char| c == '.' || c == ':')
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>();
        if chunks.len() < 3 || (chunks.len() > 4 && !chunks[2].eq_ignore_ascii_case("svc")) {
            return Err(ParseError::Host(host.to_string()));
        }
        let port = chunks[chunks.len() - 1].parse()?;
        Ok(Self {
            namespace: chunks[1].to_string(),
            name: chunks[0].to_string(),
            target_port: port,
            ..Default::default()
        })
    }

    pub fn traffic_match_name(&self, direction: Direction) -> String {
        format!(
            "{}_{}_{}_{}_{}",
            direction,
            self.namespaced_name(),
            self.target_port,
            self.protocol,
            self.cloud_attached_to
        )
    }

    /// Recovers the service encoded in a traffic match name.
    pub fn from_traffic_match_name(name: &str, protocol: &str) -> Result<Self, ParseError> {
        let chunks = name.split('_').collect::<Vec<_>>();
        if chunks.len() != 5 {
            return Err(ParseError::TrafficMatchName(name.to_string()));
        }
        let (namespace, svc) = chunks[1]
            .split_once('/')
            .ok_or_else(|| ParseError::NamespacedName(chunks[1].to_string()))?;
        Ok(Self {
            namespace: namespace.to_string(),
            name: svc.to_string(),
            target_port: chunks[2].parse()?,
            protocol: protocol.to_lowercase(),
            cloud_attached_to: chunks[4].to_string(),
            ..Default::default()
        })
    }
}

impl fmt::Display for MeshService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl ClusterName ===

impl ClusterName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ClusterName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl From<&str> for ClusterName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

// === impl WeightedCluster ===

impl WeightedCluster {
    pub fn new(cluster_name: impl Into<ClusterName>, weight: u32) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            weight,
        }
    }
}

// === impl Direction ===

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
            Self::Ingress => "ingress",
            Self::AccessControl => "acl",
            Self::Export => "exp",
            Self::Egress => "egress",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bookstore() -> MeshService {
        MeshService {
            namespace: "bookstore".to_string(),
            name: "bookstore-v1".to_string(),
            port: 14001,
            target_port: 14001,
            protocol: "http".to_string(),
            cloud_attached_to: String::new(),
        }
    }

    #[test]
    fn derived_names() {
        let svc = bookstore();
        assert_eq!(svc.to_string(), "bookstore/bookstore-v1");
        assert_eq!(svc.sidecar_cluster_name(), "bookstore/bookstore-v1|14001");
        assert_eq!(
            svc.sidecar_local_cluster_name(),
            "bookstore/bookstore-v1|14001|local"
        );
        assert_eq!(svc.policy_name(true), "bookstore-v1.bookstore");
        assert_eq!(svc.policy_name(false), "bookstore-v1");
        assert_eq!(
            svc.fqdn("cluster.local"),
            "bookstore-v1.bookstore.svc.cluster.local"
        );
    }

    #[test]
    fn parses_cluster_names() {
        let svc = MeshService::from_cluster_name("ns2/b|80").unwrap();
        assert_eq!(svc.namespace, "ns2");
        assert_eq!(svc.name, "b");
        assert_eq!(svc.target_port, 80);

        assert_eq!(
            MeshService::from_cluster_name("ns2/b|80|local"),
            Err(ParseError::ClusterName("ns2/b|80|local".to_string()))
        );
        assert!(MeshService::from_cluster_name("ns2/b|http").is_err());
    }

    #[test]
    fn parses_hosts() {
        let svc = MeshService::from_host("httpbin.egress.svc.cluster.local:8080").unwrap();
        assert_eq!((svc.name.as_str(), svc.namespace.as_str()), ("httpbin", "egress"));
        assert_eq!(svc.target_port, 8080);

        let svc = MeshService::from_host("httpbin.egress:80").unwrap();
        assert_eq!(svc.target_port, 80);

        assert!(MeshService::from_host("httpbin:80").is_err());
        assert!(MeshService::from_host("a.b.c.d.e:80").is_err());
    }

    #[test]
    fn traffic_match_names_round_trip() {
        let svc = bookstore();
        let name = svc.traffic_match_name(Direction::Inbound);
        assert_eq!(name, "inbound_bookstore/bookstore-v1_14001_http_");
        let parsed = MeshService::from_traffic_match_name(&name, "HTTP").unwrap();
        assert_eq!(parsed.namespace, svc.namespace);
        assert_eq!(parsed.name, svc.name);
        assert_eq!(parsed.target_port, svc.target_port);
        assert_eq!(parsed.protocol, "http");
    }

    #[test]
    fn subdomains() {
        let mut svc = bookstore();
        assert_eq!(svc.subdomain(), None);
        svc.name = "mysql-0.mysql".to_string();
        assert_eq!(svc.subdomain(), Some("mysql-0"));
        assert_eq!(svc.provider_name(), "mysql");
        let mut other = svc.clone();
        other.name = "mysql".to_string();
        assert!(svc.sibling_to(&other));
    }
}
