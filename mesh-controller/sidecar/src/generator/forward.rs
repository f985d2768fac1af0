use super::Generator;
use crate::document::{ForwardTrafficPolicy, ZoneEndpoint};
use fsm_mesh_controller_core::{
    constants::{CLUSTER_WEIGHT_ACCEPT_ALL, CLUSTER_WEIGHT_FAIL_OVER},
    trafficpolicy::EgressGatewayConfig,
};

/// The forward rule applied to egress traffic no gateway rule names.
const ANY_RULE: &str = "*";

impl Generator<'_> {
    /// Lists the egress gateways and which of them each egress rule forwards through.
    pub(super) fn forward(&mut self) {
        let Some(policy) = self.catalog.get_egress_gateway_policy() else {
            return;
        };
        if policy.global.is_empty() && policy.rules.is_empty() {
            return;
        }

        let mut missing = Vec::new();
        let forward = self.doc.forward();
        for gateway in &policy.global {
            forward.forward_match(ANY_RULE).insert(
                gateway.cluster_name(),
                gateway.weight.unwrap_or(CLUSTER_WEIGHT_FAIL_OVER),
            );
            add_gateway(forward, gateway);
        }

        for rule in &policy.rules {
            let rule_name = rule.rule_name();
            for gateway in &rule.egress_gateways {
                if gateway.endpoints.is_empty() {
                    missing.push(gateway.cluster_name());
                    continue;
                }
                forward.forward_match(&rule_name).insert(
                    gateway.cluster_name(),
                    gateway.weight.unwrap_or(CLUSTER_WEIGHT_ACCEPT_ALL),
                );
                add_gateway(forward, gateway);
            }
        }

        if self.doc.forward.as_ref().is_some_and(ForwardTrafficPolicy::is_empty) {
            self.doc.forward = None;
        }
        for cluster in missing {
            self.not_ready(&format!("egress gateway {cluster} has no endpoints"));
        }
    }
}

fn add_gateway(forward: &mut ForwardTrafficPolicy, gateway: &EgressGatewayConfig) {
    let config = forward.egress_gateway(&gateway.cluster_name(), &gateway.mode);
    for ep in &gateway.endpoints {
        config.cluster.add_endpoint(
            &ep.ip.to_string(),
            ep.port,
            ZoneEndpoint {
                weight: CLUSTER_WEIGHT_FAIL_OVER,
                ..Default::default()
            },
        );
    }
}
