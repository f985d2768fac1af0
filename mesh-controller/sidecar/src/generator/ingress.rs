use super::Generator;
use crate::document::{HttpMatchRule, InboundTrafficMatch, SourceSecuritySpec};
use fsm_mesh_controller_core::{
    constants::{PROTOCOL_GRPC, PROTOCOL_HTTP, PROTOCOL_HTTPS},
    trafficpolicy::IngressTrafficPolicy,
    MeshService,
};
use std::collections::BTreeSet;

/// Where sources admitted into a local service come from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Admission {
    Ingress,
    AccessControl,

    /// Peer clusters reaching an exported service. Exported routes are not rate limited.
    Export,
}

impl Generator<'_> {
    pub(super) fn ingress(&mut self, svc: &MeshService) {
        match self.catalog.get_ingress_traffic_policy(svc) {
            Ok(Some(policy)) => self.admit(&policy, Admission::Ingress),
            Ok(None) => {}
            Err(error) => tracing::error!(%error, %svc, "Failed to build ingress policy"),
        }
        match self.catalog.get_access_control_traffic_policy(svc) {
            Ok(Some(policy)) => self.admit(&policy, Admission::AccessControl),
            Ok(None) => {}
            Err(error) => tracing::error!(%error, %svc, "Failed to build access control policy"),
        }
        if let Some(policy) = self.catalog.get_export_traffic_policy(svc) {
            self.admit(&policy, Admission::Export);
        }
    }

    /// Admits the policy's sources on ports the proxy already serves. Each HTTP hostname
    /// gets a route group of its own.
    fn admit(&mut self, policy: &IngressTrafficPolicy, admission: Admission) {
        if policy.traffic_matches.is_empty() {
            return;
        }
        let Some(inbound) = self.doc.inbound.as_mut() else {
            return;
        };
        if inbound.clusters_configs.is_empty() {
            return;
        }
        let rate_limited = admission != Admission::Export;

        for traffic_match in &policy.traffic_matches {
            let protocol = traffic_match.protocol.to_lowercase();
            let tm = inbound
                .traffic_matches
                .entry(traffic_match.port)
                .or_insert_with(|| InboundTrafficMatch {
                    port: traffic_match.port,
                    protocol: protocol.clone(),
                    rate_limit: traffic_match
                        .tcp_rate_limit
                        .as_ref()
                        .filter(|_| rate_limited)
                        .map(Into::into),
                    ..Default::default()
                });

            let is_http = matches!(
                protocol.as_str(),
                PROTOCOL_HTTP | PROTOCOL_HTTPS | PROTOCOL_GRPC
            );
            let mut principals = BTreeSet::new();
            if is_http {
                for route_policy in &policy.http_route_policies {
                    if route_policy.hostnames.is_empty() {
                        continue;
                    }
                    for rule in &route_policy.rules {
                        if !rule.route.route_match.path.is_empty() {
                            principals.extend(rule.allowed_principals.iter().cloned());
                        }
                    }
                }
            }

            let security = traffic_match.tls.as_ref().map(|tls| SourceSecuritySpec {
                mtls: true,
                skip_client_cert_validation: tls.skip_client_cert_validation,
                authenticated_principals: principals.into_iter().collect(),
            });
            for range in &traffic_match.source_ip_ranges {
                tm.add_source_ip_range(range.to_string(), security.clone());
            }
            if !is_http {
                continue;
            }

            for route_policy in &policy.http_route_policies {
                if route_policy.rules.is_empty() {
                    continue;
                }
                for hostname in &route_policy.hostnames {
                    tm.add_host_port(hostname, hostname);
                    let rules = tm.route_rules(hostname);
                    if rate_limited {
                        rules.rate_limit = route_policy.rate_limit.as_ref().map(Into::into);
                    }
                    rules.plugins = self.plugins.lookup(&traffic_match.name);

                    for rule in &route_policy.rules {
                        if rule.route.route_match.path.is_empty() {
                            continue;
                        }
                        let (route, existed) =
                            rules.route_rule(HttpMatchRule::from_route(&rule.route.route_match));
                        if existed {
                            continue;
                        }
                        if rate_limited {
                            route.rate_limit = rule.route.rate_limit.as_ref().map(Into::into);
                        }
                        for wc in &rule.route.weighted_clusters {
                            route
                                .rule
                                .add_weighted_cluster(wc.cluster_name.as_str(), wc.weight);
                        }
                    }
                }
            }
        }
    }
}
