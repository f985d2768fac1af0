use crate::{NamespacedRef, PolicyStatus};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Routes egress traffic through gateway services. Global gateways apply to
/// every egress policy that no rule claims.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "policy.flomesh.io",
    version = "v1alpha1",
    kind = "EgressGateway",
    status = "PolicyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EgressGatewaySpec {
    #[serde(default)]
    pub global_egress_gateways: Vec<GatewayBindingSpec>,
    #[serde(default)]
    pub egress_policy_gateway_rules: Vec<EgressPolicyGatewayRuleSpec>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GatewayBindingSpec {
    pub service: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EgressPolicyGatewayRuleSpec {
    pub egress_policies: Vec<NamespacedRef>,
    pub egress_gateways: Vec<GatewayBindingSpec>,
}
