#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod broker;
pub mod certificate;
pub mod constants;
pub mod endpoint;
pub mod identity;
pub mod service;
pub mod status;
pub mod trafficpolicy;

pub use self::{
    endpoint::Endpoint,
    identity::ServiceIdentity,
    service::{ClusterName, MeshService, WeightedCluster},
};
pub use ipnet::{IpNet, Ipv4Net, Ipv6Net};

/// Errors raised when parsing names derived from mesh resources.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid cluster name {0:?}; expected <namespace>/<name>|<port>")]
    ClusterName(String),

    #[error("invalid host {0:?}; expected <name>.<namespace>[.svc.<trust-domain>]:<port>")]
    Host(String),

    #[error("invalid traffic match name {0:?}")]
    TrafficMatchName(String),

    #[error("invalid namespaced name {0:?}; expected <namespace>/<name>")]
    NamespacedName(String),

    #[error("invalid port: {0}")]
    Port(#[from] std::num::ParseIntError),
}
