use super::{outbound::ClusterConfig, route::WeightedClusters};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Egress gateways and the rules choosing between them. The `*` rule applies to egress
/// traffic no rule names.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ForwardTrafficPolicy {
    pub forward_matches: BTreeMap<String, WeightedClusters>,
    pub egress_gateways: BTreeMap<String, EgressGatewayClusterConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EgressGatewayClusterConfig {
    #[serde(flatten)]
    pub cluster: ClusterConfig,

    /// `http2-tunnel` or `sock5`.
    pub mode: String,
}

impl ForwardTrafficPolicy {
    pub fn is_empty(&self) -> bool {
        self.forward_matches.is_empty() && self.egress_gateways.is_empty()
    }

    pub fn forward_match(&mut self, rule: &str) -> &mut WeightedClusters {
        self.forward_matches.entry(rule.to_string()).or_default()
    }

    pub fn egress_gateway(&mut self, cluster: &str, mode: &str) -> &mut EgressGatewayClusterConfig {
        self.egress_gateways
            .entry(cluster.to_string())
            .or_insert_with(|| EgressGatewayClusterConfig {
                cluster: ClusterConfig::default(),
                mode: mode.to_string(),
            })
    }
}
