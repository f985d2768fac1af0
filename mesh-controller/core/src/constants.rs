//! Names and numeric constants shared by the controller and the proxies it
//! configures.

use std::time::Duration;

/// Weight assigned to a cluster that should receive all traffic not claimed
/// by a more specific peer.
pub const CLUSTER_WEIGHT_ACCEPT_ALL: u32 = 100;

/// Weight reserved for failover clusters; they only see traffic once every
/// active cluster is gone.
pub const CLUSTER_WEIGHT_FAIL_OVER: u32 = 0;

pub const REGEX_MATCH_ALL: &str = ".*";
pub const WILDCARD_HTTP_METHOD: &str = "*";
pub const WILDCARD_IP_ADDR: &str = "0.0.0.0/0";

pub const PROTOCOL_HTTP: &str = "http";
pub const PROTOCOL_HTTPS: &str = "https";
pub const PROTOCOL_TCP: &str = "tcp";
pub const PROTOCOL_GRPC: &str = "grpc";
pub const PROTOCOL_TCP_SERVER_FIRST: &str = "tcp-server-first";

/// Label carried by every injected workload, holding the proxy UUID.
pub const SIDECAR_UNIQUE_ID_LABEL: &str = "fsm-proxy-uuid";

/// Label attached to namespaces that are part of a mesh.
pub const MONITOR_LABEL: &str = "flomesh.io/monitored-by";

pub const METRICS_ANNOTATION: &str = "flomesh.io/metrics";
pub const EGRESS_GATEWAY_MODE_ANNOTATION: &str = "flomesh.io/egress-gateway-mode";
pub const EGRESS_GATEWAY_MODE_HTTP2_TUNNEL: &str = "http2-tunnel";
pub const EGRESS_GATEWAY_MODE_SOCK5: &str = "sock5";

pub const CLOUD_SYNC_ANNOTATION: &str = "flomesh.io/cloud-sync";
pub const CLOUD_ATTACHED_TO_ANNOTATION: &str = "flomesh.io/cloud-attached-to";
pub const CLOUD_MESH_ENDPOINT_ADDR_ANNOTATION: &str = "flomesh.io/cloud-mesh-endpoint-addr";

pub const WARMUP_ENABLE_ANNOTATION: &str = "flomesh.io/warmup-enable";
pub const WARMUP_DURATION_ANNOTATION: &str = "flomesh.io/warmup-duration";
pub const WARMUP_MIN_WEIGHT_ANNOTATION: &str = "flomesh.io/warmup-min-weight";
pub const WARMUP_MAX_WEIGHT_ANNOTATION: &str = "flomesh.io/warmup-max-weight";
pub const WARMUP_AGGRESSION_ANNOTATION: &str = "flomesh.io/warmup-aggression";

/// Default log level for injected sidecars.
pub const DEFAULT_SIDECAR_LOG_LEVEL: &str = "error";

pub const DEFAULT_TRUST_DOMAIN: &str = "cluster.local";

pub const PLUGIN_CODEBASE_PREFIX: &str = "plugins";

pub const STATS_POD_HEADER: &str = "fsm-stats-pod";
pub const STATS_NAMESPACE_HEADER: &str = "fsm-stats-namespace";
pub const STATS_KIND_HEADER: &str = "fsm-stats-kind";
pub const STATS_NAME_HEADER: &str = "fsm-stats-name";

/// Number of concurrent per-proxy rebuild jobs.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 64;

/// First reconcile window after start.
pub const PROXY_RECONCILE_WINDOW: Duration = Duration::from_secs(20 * 2);

/// Window used while updates are flowing or a proxy is not ready.
pub const PROXY_RETRY_WINDOW: Duration = Duration::from_secs(10);

pub const DEFAULT_CERT_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);
