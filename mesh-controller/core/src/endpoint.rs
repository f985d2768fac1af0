use std::{fmt, net::IpAddr, str::FromStr};

/// A reachable address backing a mesh service.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,

    /// Application protocol advertised for the port (`http`, `grpc`, ...).
    pub app_protocol: String,

    /// Set for endpoints imported from another cluster.
    pub cluster_key: String,
    pub lb_type: Option<LbType>,

    /// Zero means accept-all once normalized.
    pub weight: u32,

    /// Context path of the route a peer cluster's gateway exposes the service on.
    pub path: String,
}

/// How imported endpoints share traffic with local ones.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LbType {
    Locality,
    ActiveActive,
    FailOver,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown load balancer type {0:?}")]
pub struct InvalidLbType(String);

// === impl Endpoint ===

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            app_protocol: String::new(),
            cluster_key: String::new(),
            lb_type: None,
            weight: 0,
            path: String::new(),
        }
    }

    /// Local endpoints carry no cluster key.
    pub fn is_local(&self) -> bool {
        self.cluster_key.is_empty()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

// === impl LbType ===

impl LbType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Locality => "Locality",
            Self::ActiveActive => "ActiveActive",
            Self::FailOver => "FailOver",
        }
    }
}

impl FromStr for LbType {
    type Err = InvalidLbType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Locality" => Ok(Self::Locality),
            "ActiveActive" => Ok(Self::ActiveActive),
            "FailOver" => Ok(Self::FailOver),
            s => Err(InvalidLbType(s.to_string())),
        }
    }
}

impl fmt::Display for LbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
