use super::{route_match, Catalog, Error, Result, SERVICE_ACCOUNT_KIND};
use fsm_mesh_controller_core::{
    constants::{
        CLUSTER_WEIGHT_ACCEPT_ALL, EGRESS_GATEWAY_MODE_ANNOTATION,
        EGRESS_GATEWAY_MODE_HTTP2_TUNNEL, EGRESS_GATEWAY_MODE_SOCK5, PROTOCOL_HTTP,
        PROTOCOL_HTTPS, PROTOCOL_TCP, PROTOCOL_TCP_SERVER_FIRST, WILDCARD_IP_ADDR,
    },
    trafficpolicy::{
        EgressClusterConfig, EgressGatewayConfig, EgressGatewayPolicy, EgressGatewayRule,
        EgressHttpRouteConfig, EgressHttpRoutingRule, EgressTrafficPolicy, HttpRouteMatch,
        RouteWeightedClusters, SourceCert, TrafficMatch, UpstreamTrafficSetting,
    },
    ClusterName, IpNet, MeshService, ServiceIdentity, WeightedCluster,
};
use fsm_mesh_controller_k8s_api::{
    policy::{
        egress::{EgressSourceSpec, SourceMtlsSpec},
        egress_gateway::GatewayBindingSpec,
        Egress,
    },
    smi::HTTP_ROUTE_GROUP_KIND,
    ResourceExt,
};
use std::collections::BTreeSet;

const UPSTREAM_TRAFFIC_SETTING_KIND: &str = "UpstreamTrafficSetting";

/// Matches any destination when egress is enabled mesh-wide.
const ALLOW_ALL_MATCH: &str = "egress-allow-all";

/// Egress through any gateway listed as global.
const ANY_GATEWAY_RULE: &str = "*";

impl Catalog<'_> {
    /// Builds the traffic an identity may send outside the mesh.
    ///
    /// With egress enabled mesh-wide every destination is allowed through a single TCP match.
    /// Egress resources whose sources name the identity add matches per port and protocol:
    /// HTTP hosts get a route configuration each, HTTPS hosts are matched by SNI and TCP
    /// destinations by address.
    pub fn get_egress_traffic_policy(
        &self,
        id: &ServiceIdentity,
    ) -> Result<Option<EgressTrafficPolicy>> {
        let mut policy = EgressTrafficPolicy::default();
        if self.config.is_egress_enabled() {
            policy.traffic_matches.push(TrafficMatch {
                name: ALLOW_ALL_MATCH.to_string(),
                destination_protocol: PROTOCOL_TCP.to_string(),
                destination_ip_ranges: WILDCARD_IP_ADDR.parse::<IpNet>().into_iter().collect(),
                ..Default::default()
            });
        }

        for (egress, source) in self.egresses_for_identity(id) {
            let _span = tracing::trace_span!(
                "egress",
                ns = %egress.namespace().unwrap_or_default(),
                name = %egress.name_any(),
            )
            .entered();
            self.add_egress(&mut policy, egress, source)?;
        }

        if policy.is_empty() {
            return Ok(None);
        }
        Ok(Some(policy))
    }

    /// Hostnames routed by HTTP egress for an identity, with and without the port.
    pub(super) fn egress_hostnames(&self, id: &ServiceIdentity) -> BTreeSet<String> {
        let mut hostnames = BTreeSet::new();
        for (egress, _) in self.egresses_for_identity(id) {
            for port in &egress.spec.ports {
                if !port.protocol.eq_ignore_ascii_case(PROTOCOL_HTTP) {
                    continue;
                }
                for host in &egress.spec.hosts {
                    hostnames.insert(host.clone());
                    hostnames.insert(format!("{host}:{}", port.number));
                }
            }
        }
        hostnames
    }

    /// Egress gateways and the egress policies routed through them. `None` when no
    /// EgressGateway resource exists.
    pub fn get_egress_gateway_policy(&self) -> Option<EgressGatewayPolicy> {
        if self.index.egress_gateways.len() == 0 {
            return None;
        }

        let mut policy = EgressGatewayPolicy::default();
        for (index, gateway) in self.index.egress_gateways.iter().enumerate() {
            policy.global.extend(
                gateway
                    .spec
                    .global_egress_gateways
                    .iter()
                    .filter_map(|binding| self.egress_gateway_config(binding)),
            );
            for rule in &gateway.spec.egress_policy_gateway_rules {
                policy.rules.push(EgressGatewayRule {
                    name: gateway.name_unchecked(),
                    namespace: gateway.namespace().unwrap_or_default(),
                    index,
                    egress_policies: rule
                        .egress_policies
                        .iter()
                        .map(|p| (p.namespace.clone(), p.name.clone()))
                        .collect(),
                    egress_gateways: rule
                        .egress_gateways
                        .iter()
                        .filter_map(|binding| self.egress_gateway_config(binding))
                        .collect(),
                });
            }
        }
        Some(policy)
    }

    /// Egress resources with a source naming the identity, paired with that source.
    fn egresses_for_identity<'a>(
        &'a self,
        id: &'a ServiceIdentity,
    ) -> impl Iterator<Item = (&'a Egress, &'a EgressSourceSpec)> + 'a {
        let enabled = self.config.feature_flags().enable_egress_policy;
        self.index
            .egresses
            .iter()
            .filter(move |_| enabled)
            .filter_map(move |egress| {
                egress
                    .spec
                    .sources
                    .iter()
                    .find(|src| {
                        src.kind == SERVICE_ACCOUNT_KIND
                            && src.name == id.name()
                            && src.namespace == id.namespace()
                    })
                    .map(|src| (egress, src))
            })
    }

    fn add_egress(
        &self,
        policy: &mut EgressTrafficPolicy,
        egress: &Egress,
        source: &EgressSourceSpec,
    ) -> Result<()> {
        let namespace = egress.namespace().unwrap_or_default();
        let source_cert = match &source.mtls {
            Some(mtls) => self.source_cert(mtls, &namespace)?,
            None => None,
        };
        let egress_gateway = self.egress_gateway_rule(&namespace, &egress.name_unchecked());

        let mut ust = None;
        let mut route_matches = Vec::new();
        for m in &egress.spec.matches {
            match m.kind.as_str() {
                HTTP_ROUTE_GROUP_KIND => match self.index.http_route_groups.get(&namespace, &m.name) {
                    Some(group) => route_matches.extend(group.spec.matches.iter().map(route_match)),
                    None => tracing::debug!(name = %m.name, "HTTPRouteGroup not found"),
                },
                UPSTREAM_TRAFFIC_SETTING_KIND => {
                    ust = self.get_upstream_traffic_setting_by_name(&namespace, &m.name);
                }
                kind => tracing::debug!(%kind, name = %m.name, "Ignoring egress match"),
            }
        }
        if route_matches.is_empty() {
            route_matches.push(HttpRouteMatch::wildcard());
        }

        let ip_ranges = egress
            .spec
            .ip_addresses
            .iter()
            .filter_map(|addr| match addr.parse::<IpNet>() {
                Ok(net) => Some(net),
                Err(error) => {
                    tracing::warn!(%error, %addr, "Ignoring invalid egress IP range");
                    None
                }
            })
            .collect::<Vec<_>>();

        for port in &egress.spec.ports {
            let protocol = port.protocol.to_ascii_lowercase();
            match protocol.as_str() {
                PROTOCOL_HTTP => {
                    for host in &egress.spec.hosts {
                        let ust = ust
                            .clone()
                            .or_else(|| self.get_upstream_traffic_setting_by_host(host));
                        let cluster = ClusterName::from(format!("{host}:{}", port.number));
                        add_cluster(
                            policy,
                            EgressClusterConfig {
                                name: cluster.clone(),
                                host: host.clone(),
                                port: port.number,
                                connection_settings: ust
                                    .as_ref()
                                    .and_then(|u| u.connection_settings.clone()),
                                source_cert: source_cert.clone(),
                            },
                        );
                        let routing_rules = route_matches
                            .iter()
                            .map(|m| EgressHttpRoutingRule {
                                route: egress_route(m.clone(), cluster.clone(), ust.as_ref()),
                                allowed_destination_ip_ranges: ip_ranges.clone(),
                            })
                            .collect();
                        policy
                            .http_route_configs_per_port
                            .entry(port.number)
                            .or_default()
                            .push(EgressHttpRouteConfig {
                                name: host.clone(),
                                hostnames: vec![host.clone(), format!("{host}:{}", port.number)],
                                routing_rules,
                            });
                    }
                    merge_match(
                        policy,
                        TrafficMatch {
                            name: format!("egress-http.{}", port.number),
                            destination_port: port.number,
                            destination_protocol: protocol.clone(),
                            egress_gateway: egress_gateway.clone(),
                            ..Default::default()
                        },
                    );
                }

                PROTOCOL_HTTPS | PROTOCOL_TCP | PROTOCOL_TCP_SERVER_FIRST => {
                    let cluster = ClusterName::from(port.number.to_string());
                    add_cluster(
                        policy,
                        EgressClusterConfig {
                            name: cluster.clone(),
                            host: String::new(),
                            port: port.number,
                            connection_settings: ust
                                .as_ref()
                                .and_then(|u| u.connection_settings.clone()),
                            source_cert: source_cert.clone(),
                        },
                    );
                    let https = protocol == PROTOCOL_HTTPS;
                    merge_match(
                        policy,
                        TrafficMatch {
                            name: format!(
                                "egress-{}.{}",
                                if https { PROTOCOL_HTTPS } else { PROTOCOL_TCP },
                                port.number
                            ),
                            destination_port: port.number,
                            destination_protocol: protocol.clone(),
                            destination_ip_ranges: ip_ranges.clone(),
                            server_names: if https {
                                egress.spec.hosts.clone()
                            } else {
                                Vec::new()
                            },
                            cluster: Some(cluster),
                            tcp_rate_limit: ust.as_ref().and_then(|u| u.tcp_rate_limit().cloned()),
                            egress_gateway: egress_gateway.clone(),
                            ..Default::default()
                        },
                    );
                }

                _ => tracing::warn!(%protocol, port = port.number, "Unsupported egress protocol"),
            }
        }
        Ok(())
    }

    /// The client certificate configured for an egress source.
    fn source_cert(&self, mtls: &SourceMtlsSpec, namespace: &str) -> Result<Option<SourceCert>> {
        if mtls.is_mesh_issued() {
            return Ok(Some(SourceCert::FsmIssued));
        }
        let Some(cert) = &mtls.cert else {
            return Ok(None);
        };

        let secret_ns = if cert.secret.namespace.is_empty() {
            namespace
        } else {
            cert.secret.namespace.as_str()
        };
        let secret = self
            .index
            .secrets
            .get(secret_ns, &cert.secret.name)
            .ok_or_else(|| Error::SecretNotFound {
                namespace: secret_ns.to_string(),
                name: cert.secret.name.clone(),
            })?;
        let value = |key: &'static str| -> Result<String> {
            secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned())
                .ok_or_else(|| Error::SecretKeyMissing {
                    namespace: secret_ns.to_string(),
                    name: cert.secret.name.clone(),
                    key,
                })
        };

        Ok(Some(SourceCert::Secret {
            sans: cert.subject_alt_names.clone(),
            expiration: cert.expiration.clone(),
            issuing_ca: Some(value("ca.crt")?),
            cert_chain: Some(value("tls.crt")?),
            private_key: Some(value("tls.key")?),
        }))
    }

    /// The name of the EgressGateway rule routing an Egress, or the global rule when any
    /// gateway declares global gateways.
    fn egress_gateway_rule(&self, namespace: &str, name: &str) -> Option<String> {
        for (index, gateway) in self.index.egress_gateways.iter().enumerate() {
            let referenced = gateway.spec.egress_policy_gateway_rules.iter().any(|rule| {
                rule.egress_policies
                    .iter()
                    .any(|p| p.namespace == namespace && p.name == name)
            });
            if referenced {
                let rule = EgressGatewayRule {
                    name: gateway.name_unchecked(),
                    namespace: gateway.namespace().unwrap_or_default(),
                    index,
                    ..Default::default()
                };
                return Some(rule.rule_name());
            }
        }
        self.index
            .egress_gateways
            .iter()
            .any(|gateway| !gateway.spec.global_egress_gateways.is_empty())
            .then(|| ANY_GATEWAY_RULE.to_string())
    }

    /// A gateway binding resolved to its service. Bindings to unknown services are skipped.
    fn egress_gateway_config(&self, binding: &GatewayBindingSpec) -> Option<EgressGatewayConfig> {
        let Some(svc) = self.index.services.get(&binding.namespace, &binding.service) else {
            tracing::debug!(ns = %binding.namespace, name = %binding.service, "Egress gateway service not found");
            return None;
        };
        let mode = match svc
            .annotations()
            .get(EGRESS_GATEWAY_MODE_ANNOTATION)
            .map(String::as_str)
        {
            Some(EGRESS_GATEWAY_MODE_SOCK5) => EGRESS_GATEWAY_MODE_SOCK5,
            _ => EGRESS_GATEWAY_MODE_HTTP2_TUNNEL,
        };
        let mesh_svc = MeshService {
            namespace: binding.namespace.clone(),
            name: binding.service.clone(),
            ..Default::default()
        };
        Some(EgressGatewayConfig {
            service: binding.service.clone(),
            namespace: binding.namespace.clone(),
            weight: binding.weight,
            mode: mode.to_string(),
            endpoints: self.list_endpoints_for_service(&mesh_svc),
        })
    }
}

fn egress_route(
    route_match: HttpRouteMatch,
    cluster: ClusterName,
    ust: Option<&UpstreamTrafficSetting>,
) -> RouteWeightedClusters {
    let mut route = RouteWeightedClusters::new(
        route_match,
        Some(WeightedCluster::new(cluster, CLUSTER_WEIGHT_ACCEPT_ALL)),
    );
    route.rate_limit = ust.and_then(|u| u.route_rate_limit(&route.route_match.path).cloned());
    route
}

fn add_cluster(policy: &mut EgressTrafficPolicy, cluster: EgressClusterConfig) {
    if !policy.clusters_configs.iter().any(|c| c.name == cluster.name) {
        policy.clusters_configs.push(cluster);
    }
}

/// Adds a traffic match, or merges its server names and address ranges into an existing match
/// of the same name.
fn merge_match(policy: &mut EgressTrafficPolicy, tm: TrafficMatch) {
    let Some(existing) = policy.traffic_matches.iter_mut().find(|m| m.name == tm.name) else {
        policy.traffic_matches.push(tm);
        return;
    };
    for name in tm.server_names {
        if !existing.server_names.contains(&name) {
            existing.server_names.push(name);
        }
    }
    for net in tm.destination_ip_ranges {
        if !existing.destination_ip_ranges.contains(&net) {
            existing.destination_ip_ranges.push(net);
        }
    }
    if existing.egress_gateway.is_none() {
        existing.egress_gateway = tm.egress_gateway;
    }
}
