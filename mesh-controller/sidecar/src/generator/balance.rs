use super::Generator;
use crate::document::{ClusterConfig, PolicyDocument, WeightedClusters};
use fsm_mesh_controller_core::{
    constants::{CLUSTER_WEIGHT_ACCEPT_ALL, CLUSTER_WEIGHT_FAIL_OVER},
    endpoint::LbType,
};

impl Generator<'_> {
    pub(super) fn balance(&mut self) {
        balance(&mut self.doc);
    }
}

/// Replaces unset weights so that the proxy never sees a target it cannot pick.
///
/// Targets of a route whose weights are all unset share traffic evenly. Imported endpoints
/// of a fail-over cluster stand by while any local endpoint exists; active-active endpoints
/// share traffic with local ones.
fn balance(doc: &mut PolicyDocument) {
    if let Some(inbound) = doc.inbound.as_mut() {
        for tm in inbound.traffic_matches.values_mut() {
            for rules in tm.http_service_route_rules.values_mut() {
                for route in &mut rules.route_rules {
                    accept_all_if_unset(&mut route.rule.target_clusters);
                }
            }
            if let Some(tcp) = tm.tcp_service_route_rules.as_mut() {
                accept_all_if_unset(&mut tcp.target_clusters);
            }
        }
    }

    if let Some(outbound) = doc.outbound.as_mut() {
        for tm in outbound.traffic_matches.values_mut().flatten() {
            for rules in tm.http_service_route_rules.values_mut() {
                for route in &mut rules.route_rules {
                    accept_all_if_unset(&mut route.target_clusters);
                }
            }
            if let Some(tcp) = tm.tcp_service_route_rules.as_mut() {
                accept_all_if_unset(&mut tcp.target_clusters);
            }
        }
        for config in outbound.clusters_configs.values_mut() {
            balance_endpoints(config);
        }
    }

    if let Some(forward) = doc.forward.as_mut() {
        for targets in forward.forward_matches.values_mut() {
            for weight in targets.values_mut() {
                if *weight == 0 {
                    *weight = CLUSTER_WEIGHT_ACCEPT_ALL;
                }
            }
        }
        for gateway in forward.egress_gateways.values_mut() {
            for ep in gateway.cluster.endpoints.values_mut() {
                if ep.weight == 0 {
                    ep.weight = CLUSTER_WEIGHT_ACCEPT_ALL;
                }
            }
        }
    }
}

fn accept_all_if_unset(targets: &mut WeightedClusters) {
    if targets.values().all(|w| *w == 0) {
        for weight in targets.values_mut() {
            *weight = CLUSTER_WEIGHT_ACCEPT_ALL;
        }
    }
}

fn balance_endpoints(config: &mut ClusterConfig) {
    let has_local = config.endpoints.values().any(|ep| ep.cluster_key.is_empty());
    for ep in config.endpoints.values_mut() {
        if ep.cluster_key.is_empty() {
            if ep.weight == 0 {
                ep.weight = CLUSTER_WEIGHT_ACCEPT_ALL;
            }
            continue;
        }
        match ep.lb_type {
            Some(LbType::FailOver) => {
                ep.weight = if has_local {
                    CLUSTER_WEIGHT_FAIL_OVER
                } else {
                    CLUSTER_WEIGHT_ACCEPT_ALL
                };
            }
            Some(LbType::ActiveActive) if ep.weight == 0 => {
                ep.weight = CLUSTER_WEIGHT_ACCEPT_ALL;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{HttpMatchRule, HttpRouteRule, ZoneEndpoint};
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    fn imported(key: &str, lb_type: LbType, weight: u32) -> ZoneEndpoint {
        ZoneEndpoint {
            weight,
            cluster_key: key.to_string(),
            lb_type: Some(lb_type),
            path: String::new(),
        }
    }

    fn local(weight: u32) -> ZoneEndpoint {
        ZoneEndpoint {
            weight,
            ..Default::default()
        }
    }

    fn weights(config: &ClusterConfig) -> Vec<(&str, u32)> {
        config
            .endpoints
            .iter()
            .map(|(addr, ep)| (addr.as_str(), ep.weight))
            .collect()
    }

    #[test]
    fn unset_route_weights_accept_all() {
        let mut doc = PolicyDocument::default();
        let (tm, _) = doc.outbound().traffic_match(80, "http");
        let (rule, _) = tm
            .route_rules("bookstore.ns")
            .route_rule(HttpMatchRule::default());
        rule.add_weighted_cluster("ns/bookstore-v1|80", 0);
        rule.add_weighted_cluster("ns/bookstore-v2|80", 0);
        let (tm, _) = doc.outbound().traffic_match(5432, "outbound_ns/db|5432|tcp|");
        tm.tcp_route_rules().target_clusters = btreemap! {
            "ns/db|5432".to_string() => 0,
            "ns/db-replica|5432".to_string() => 20,
        };

        balance(&mut doc);

        let outbound = doc.outbound.expect("outbound");
        let http = &outbound.traffic_matches[&80][0].http_service_route_rules["bookstore.ns"];
        assert_eq!(
            http.route_rules[0].target_clusters,
            btreemap! {
                "ns/bookstore-v1|80".to_string() => 100,
                "ns/bookstore-v2|80".to_string() => 100,
            }
        );
        let tcp = outbound.traffic_matches[&5432][0]
            .tcp_service_route_rules
            .as_ref()
            .expect("tcp rules");
        assert_eq!(tcp.target_clusters["ns/db|5432"], 0);
        assert_eq!(tcp.target_clusters["ns/db-replica|5432"], 20);
    }

    #[test]
    fn fail_over_endpoints_stand_by_for_local_ones() {
        let mut with_local = ClusterConfig::default();
        with_local.add_endpoint("10.0.0.1", 80, local(0));
        with_local.add_endpoint("10.1.0.1", 80, imported("c2", LbType::FailOver, 100));
        with_local.add_endpoint("10.2.0.1", 80, imported("c3", LbType::ActiveActive, 0));
        with_local.add_endpoint("10.3.0.1", 80, imported("c4", LbType::Locality, 0));
        balance_endpoints(&mut with_local);
        assert_eq!(
            weights(&with_local),
            vec![
                ("10.0.0.1:80", 100),
                ("10.1.0.1:80", 0),
                ("10.2.0.1:80", 100),
                ("10.3.0.1:80", 0),
            ]
        );

        let mut imported_only = ClusterConfig::default();
        imported_only.add_endpoint("10.1.0.1", 80, imported("c2", LbType::FailOver, 0));
        balance_endpoints(&mut imported_only);
        assert_eq!(weights(&imported_only), vec![("10.1.0.1:80", 100)]);
    }

    #[test]
    fn route_targets_are_left_alone_when_any_weight_is_set() {
        let mut rule = HttpRouteRule::default();
        rule.add_weighted_cluster("a", 0);
        rule.add_weighted_cluster("b", 50);
        accept_all_if_unset(&mut rule.target_clusters);
        assert_eq!(rule.target_clusters, btreemap! { "a".to_string() => 0, "b".to_string() => 50 });
    }
}
