use std::{fmt, str::FromStr, time::Duration};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RetryPolicy {
    pub retry_on: String,
    pub per_try_timeout: Option<Duration>,
    pub num_retries: Option<u32>,
    pub retry_backoff_base_interval: Option<Duration>,
}

/// Upstream connection limits.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectionSettings {
    pub tcp: Option<TcpConnectionSettings>,
    pub http: Option<HttpConnectionSettings>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TcpConnectionSettings {
    pub max_connections: Option<u32>,
    pub connect_timeout: Option<Duration>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HttpConnectionSettings {
    pub max_requests: Option<u32>,
    pub max_requests_per_connection: Option<u32>,
    pub max_pending_requests: Option<u32>,
    pub max_retries: Option<u32>,
    pub circuit_breaking: Option<CircuitBreaking>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CircuitBreaking {
    pub stat_time_window: Duration,
    pub min_request_amount: u32,
    pub degraded_time_window: Duration,
    pub slow_time_threshold: Option<Duration>,
    pub slow_amount_threshold: Option<u32>,
    pub slow_ratio_threshold: Option<f32>,
    pub error_amount_threshold: Option<u32>,
    pub error_ratio_threshold: Option<f32>,
    pub degraded_status_code: Option<u32>,
    pub degraded_response_content: Option<String>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum RateLimitUnit {
    #[default]
    Second,
    Minute,
    Hour,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid rate limit unit {0:?}; expected second, minute or hour")]
pub struct InvalidRateLimitUnit(String);

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocalRateLimit {
    pub tcp: Option<TcpRateLimit>,
    pub http: Option<HttpRateLimit>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TcpRateLimit {
    pub connections: u32,
    pub unit: RateLimitUnit,
    pub burst: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpRateLimit {
    pub requests: u32,
    pub unit: RateLimitUnit,
    pub burst: u32,
    pub response_status_code: u32,
    pub response_headers_to_add: Vec<HeaderValue>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderValue {
    pub name: String,
    pub value: String,
}

/// A rate limit applied to requests whose path matches.
#[derive(Clone, Debug, PartialEq)]
pub struct HttpRouteRateLimit {
    pub path: String,
    pub rate_limit: Option<HttpRateLimit>,
}

/// Connection and rate-limit settings for traffic to one upstream host.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpstreamTrafficSetting {
    pub namespace: String,
    pub name: String,
    pub host: String,
    pub connection_settings: Option<ConnectionSettings>,
    pub rate_limit: Option<LocalRateLimit>,
    pub http_routes: Vec<HttpRouteRateLimit>,
}

/// Slow-start settings for newly added endpoints.
#[derive(Clone, Debug, PartialEq)]
pub struct TrafficWarmup {
    pub enable: bool,
    pub duration: Duration,
    pub min_weight: u32,
    pub max_weight: u32,
    pub aggression: f32,
}

// === impl RateLimitUnit ===

impl RateLimitUnit {
    /// The statistics window, in seconds.
    pub fn stat_time_window(&self) -> f64 {
        match self {
            Self::Second => 1.0,
            Self::Minute => 60.0,
            Self::Hour => 3600.0,
        }
    }
}

impl FromStr for RateLimitUnit {
    type Err = InvalidRateLimitUnit;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "second" => Ok(Self::Second),
            "minute" => Ok(Self::Minute),
            "hour" => Ok(Self::Hour),
            s => Err(InvalidRateLimitUnit(s.to_string())),
        }
    }
}

impl fmt::Display for RateLimitUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
        })
    }
}

// === impl UpstreamTrafficSetting ===

impl UpstreamTrafficSetting {
    pub fn tcp_rate_limit(&self) -> Option<&TcpRateLimit> {
        self.rate_limit.as_ref()?.tcp.as_ref()
    }

    pub fn http_rate_limit(&self) -> Option<&HttpRateLimit> {
        self.rate_limit.as_ref()?.http.as_ref()
    }

    /// The per-route limit configured for exactly this path.
    pub fn route_rate_limit(&self, path: &str) -> Option<&HttpRateLimit> {
        self.http_routes
            .iter()
            .find(|r| r.path == path)
            .and_then(|r| r.rate_limit.as_ref())
    }
}

// === impl TrafficWarmup ===

impl Default for TrafficWarmup {
    fn default() -> Self {
        Self {
            enable: true,
            duration: Duration::from_secs(90),
            min_weight: 10,
            max_weight: 100,
            aggression: 1.0,
        }
    }
}
