use super::{Catalog, Error, Result};
use fsm_mesh_controller_core::{
    constants::{
        CLUSTER_WEIGHT_ACCEPT_ALL, PROTOCOL_GRPC, PROTOCOL_HTTP, PROTOCOL_HTTPS, REGEX_MATCH_ALL,
    },
    identity::WILDCARD_PRINCIPAL,
    service::Direction,
    status::{PolicyKind, PolicyRef, StatusUpdate},
    trafficpolicy::{
        AccessControlTrafficPolicy, HttpRouteMatch, IngressTls, IngressTrafficMatch,
        IngressTrafficPolicy, InboundTrafficPolicy, PathMatchType, RouteWeightedClusters, Rule,
        ServiceExportTrafficPolicy,
    },
    IpNet, MeshService, WeightedCluster,
};
use fsm_mesh_controller_k8s_api::{
    multicluster::ServiceExportRule,
    policy::{BackendSpec, SourceKind, SourceSpec, TlsSpec},
    ResourceExt,
};
use std::{collections::BTreeSet, net::IpAddr};

/// Source IP ranges and principals admitted by a policy's sources.
#[derive(Debug, Default)]
struct Sources {
    ip_ranges: Vec<IpNet>,
    principals: BTreeSet<String>,
}

impl Catalog<'_> {
    /// Traffic admitted into `svc` from ingress controllers through IngressBackend policies.
    pub fn get_ingress_traffic_policy(
        &self,
        svc: &MeshService,
    ) -> Result<Option<IngressTrafficPolicy>> {
        if !self.config.feature_flags().enable_ingress_backend_policy {
            return Ok(None);
        }
        let Some(ib) = self
            .index
            .ingress_backends
            .in_namespace(&svc.namespace)
            .find(|ib| ib.spec.backends.iter().any(|b| selects(b, svc)))
        else {
            return Ok(None);
        };
        let ib_name = ib.name_unchecked();
        let target = PolicyRef::namespaced(PolicyKind::IngressBackend, &svc.namespace, &ib_name);
        let ust = self.get_upstream_traffic_setting(svc);

        let mut policy = IngressTrafficPolicy::default();
        let mut http =
            InboundTrafficPolicy::new(format!("{svc}_from_{ib_name}"), vec!["*".to_string()]);
        for backend in ib.spec.backends.iter().filter(|b| selects(b, svc)) {
            let protocol = backend.port.protocol.to_ascii_lowercase();
            if ![PROTOCOL_HTTP, PROTOCOL_HTTPS, PROTOCOL_GRPC].contains(&protocol.as_str()) {
                tracing::warn!(%svc, ingress_backend = %ib_name, %protocol, "Ignoring ingress backend with unsupported protocol");
                continue;
            }
            let sources = self.resolve_sources(
                &ib.spec.sources,
                &svc.namespace,
                &protocol,
                backend.skips_client_cert_validation(),
                &target,
            )?;
            let tls = backend.tls.as_ref().map(ingress_tls);
            policy.traffic_matches.push(IngressTrafficMatch {
                name: backend_service(svc, backend).traffic_match_name(Direction::Ingress),
                port: backend.port.number,
                protocol: protocol.clone(),
                source_ip_ranges: sources.ip_ranges,
                server_names: tls.as_ref().map(|t| t.sni_hosts.clone()).unwrap_or_default(),
                tls,
                tcp_rate_limit: ust.as_ref().and_then(|u| u.tcp_rate_limit().cloned()),
            });
            http.rules.push(local_rule(svc, sources.principals));
        }

        if policy.traffic_matches.is_empty() {
            return Ok(None);
        }
        self.index.status().send(StatusUpdate::committed(target));
        http.rate_limit = ust.as_ref().and_then(|u| u.http_rate_limit().cloned());
        policy.http_route_policies.push(http);
        Ok(Some(policy))
    }

    /// Traffic admitted into `svc` from outside the mesh through AccessControl policies.
    ///
    /// An AccessControl listing `svc` as a backend restricts each listed port. Otherwise the
    /// first AccessControl in the namespace without backends admits its sources on the service
    /// port.
    pub fn get_access_control_traffic_policy(
        &self,
        svc: &MeshService,
    ) -> Result<Option<AccessControlTrafficPolicy>> {
        if !self.config.feature_flags().enable_access_control_policy {
            return Ok(None);
        }
        let acls = &self.index.access_controls;
        let Some(acl) = acls
            .in_namespace(&svc.namespace)
            .find(|acl| acl.spec.backends.iter().any(|b| selects(b, svc)))
            .or_else(|| {
                acls.in_namespace(&svc.namespace)
                    .find(|acl| acl.spec.backends.is_empty())
            })
        else {
            tracing::trace!(%svc, "No AccessControl");
            return Ok(None);
        };
        let acl_name = acl.name_unchecked();
        let target = PolicyRef::namespaced(PolicyKind::AccessControl, &svc.namespace, &acl_name);
        let ust = self.get_upstream_traffic_setting(svc);
        let tcp_rate_limit = ust.as_ref().and_then(|u| u.tcp_rate_limit().cloned());

        let mut policy = AccessControlTrafficPolicy::default();
        let mut rules = Vec::new();
        if acl.spec.backends.is_empty() {
            let sources = self.resolve_sources(
                &acl.spec.sources,
                &svc.namespace,
                &svc.protocol,
                false,
                &target,
            )?;
            policy.traffic_matches.push(IngressTrafficMatch {
                name: svc.traffic_match_name(Direction::AccessControl),
                port: svc.target_port,
                protocol: svc.protocol.clone(),
                source_ip_ranges: sources.ip_ranges,
                tcp_rate_limit,
                ..Default::default()
            });
            if has_wildcard_route(&svc.protocol) {
                rules.push(local_rule(svc, sources.principals));
            }
        } else {
            for backend in acl.spec.backends.iter().filter(|b| selects(b, svc)) {
                let protocol = backend.port.protocol.to_ascii_lowercase();
                let sources = self.resolve_sources(
                    &acl.spec.sources,
                    &svc.namespace,
                    &protocol,
                    backend.skips_client_cert_validation(),
                    &target,
                )?;
                policy.traffic_matches.push(IngressTrafficMatch {
                    name: backend_service(svc, backend).traffic_match_name(Direction::AccessControl),
                    port: backend.port.number,
                    protocol: protocol.clone(),
                    source_ip_ranges: sources.ip_ranges,
                    tls: backend.tls.as_ref().map(ingress_tls),
                    tcp_rate_limit: tcp_rate_limit.clone(),
                    ..Default::default()
                });
                if has_wildcard_route(&protocol) {
                    rules.push(local_rule(svc, sources.principals));
                }
            }
        }

        if policy.traffic_matches.is_empty() {
            tracing::debug!(%svc, acl = %acl_name, "AccessControl does not apply");
            return Ok(None);
        }
        self.index.status().send(StatusUpdate::committed(target));

        if !rules.is_empty() {
            let mut http = InboundTrafficPolicy::new(
                format!("{svc}_from_{acl_name}"),
                vec!["*".to_string()],
            );
            http.rules = rules;
            http.rate_limit = ust.as_ref().and_then(|u| u.http_rate_limit().cloned());
            policy.http_route_policies.push(http);
        }
        Ok(Some(policy))
    }

    /// Traffic admitted into `svc` from peer clusters through its ServiceExport.
    ///
    /// Callers arrive through the multicluster gateway, so the gateway addresses are the only
    /// admitted sources. Without configured gateway addresses any source is admitted.
    pub fn get_export_traffic_policy(&self, svc: &MeshService) -> Option<ServiceExportTrafficPolicy> {
        let export = self
            .index
            .service_exports
            .get(&svc.namespace, svc.provider_name())?;
        let rules = export
            .spec
            .rules
            .iter()
            .filter(|rule| rule.port_number == svc.port)
            .collect::<Vec<_>>();
        if rules.is_empty() {
            return None;
        }

        let gateway = &self.config.connector().via_gateway;
        let source_ip_ranges = [&gateway.cluster_ip, &gateway.external_ip]
            .into_iter()
            .filter(|addr| !addr.is_empty())
            .filter_map(|addr| match addr.parse::<IpAddr>() {
                Ok(ip) => Some(IpNet::from(ip)),
                Err(error) => {
                    tracing::warn!(%error, %addr, "Ignoring invalid gateway address");
                    None
                }
            })
            .collect::<Vec<_>>();

        let mut policy = ServiceExportTrafficPolicy::default();
        policy.traffic_matches.push(IngressTrafficMatch {
            name: svc.traffic_match_name(Direction::Export),
            port: svc.target_port,
            protocol: svc.protocol.clone(),
            source_ip_ranges,
            ..Default::default()
        });

        if is_http(&svc.protocol) {
            let mut http = InboundTrafficPolicy::new(
                format!("{svc}_from_{}", export.name_unchecked()),
                vec!["*".to_string()],
            );
            let local = WeightedCluster::new(svc.local_cluster_name(), CLUSTER_WEIGHT_ACCEPT_ALL);
            for rule in rules {
                http.add_rule(
                    RouteWeightedClusters::new(export_route_match(rule), Some(local.clone())),
                    WILDCARD_PRINCIPAL,
                );
            }
            policy.http_route_policies.push(http);
        }
        Some(policy)
    }

    /// Resolves the sources of an AccessControl or IngressBackend. A `Service` source without
    /// endpoints fails the policy and marks it with an error status.
    fn resolve_sources(
        &self,
        sources: &[SourceSpec],
        namespace: &str,
        protocol: &str,
        skip_client_cert_validation: bool,
        target: &PolicyRef,
    ) -> Result<Sources> {
        let mut resolved = Sources::default();
        for source in sources {
            match source.kind {
                SourceKind::Service => {
                    let svc = MeshService {
                        namespace: source
                            .namespace
                            .clone()
                            .unwrap_or_else(|| namespace.to_string()),
                        name: source.name.clone(),
                        ..Default::default()
                    };
                    let endpoints = self.list_endpoints_for_service(&svc);
                    if endpoints.is_empty() {
                        let error = Error::EndpointsNotFound(svc.to_string());
                        self.index
                            .status()
                            .send(StatusUpdate::error(target.clone(), error.to_string()));
                        return Err(error);
                    }
                    for ep in endpoints {
                        let net = IpNet::from(ep.ip);
                        if !resolved.ip_ranges.contains(&net) {
                            resolved.ip_ranges.push(net);
                        }
                    }
                }
                SourceKind::IpRange => match source.name.parse::<IpNet>() {
                    Ok(net) => resolved.ip_ranges.push(net),
                    Err(error) => {
                        tracing::error!(%error, policy = %target, range = %source.name, "Ignoring invalid IP range");
                    }
                },
                SourceKind::AuthenticatedPrincipal => {
                    if skip_client_cert_validation {
                        resolved.principals.insert(WILDCARD_PRINCIPAL.to_string());
                    } else {
                        resolved.principals.insert(source.name.clone());
                    }
                }
            }
        }

        // Client identities cannot be verified at the HTTP layer.
        if has_wildcard_route(protocol) {
            resolved.principals.insert(WILDCARD_PRINCIPAL.to_string());
        }
        Ok(resolved)
    }
}

fn selects(backend: &BackendSpec, svc: &MeshService) -> bool {
    backend.name == svc.name && backend.port.number == svc.target_port
}

/// The service as addressed by a backend: its port and protocol name the traffic match.
fn backend_service(svc: &MeshService, backend: &BackendSpec) -> MeshService {
    MeshService {
        target_port: backend.port.number,
        protocol: backend.port.protocol.to_ascii_lowercase(),
        ..svc.clone()
    }
}

fn ingress_tls(tls: &TlsSpec) -> IngressTls {
    IngressTls {
        skip_client_cert_validation: tls.skip_client_cert_validation,
        sni_hosts: tls.sni_hosts.clone().unwrap_or_default(),
    }
}

fn is_http(protocol: &str) -> bool {
    let protocol = protocol.to_ascii_lowercase();
    protocol == PROTOCOL_HTTP || protocol == PROTOCOL_HTTPS || protocol == PROTOCOL_GRPC
}

/// Protocols served through an HTTP route policy with a wildcard route. HTTPS backends are
/// matched as TLS.
fn has_wildcard_route(protocol: &str) -> bool {
    protocol.eq_ignore_ascii_case(PROTOCOL_HTTP) || protocol.eq_ignore_ascii_case(PROTOCOL_GRPC)
}

/// A wildcard route to the service's local cluster.
fn local_rule(svc: &MeshService, allowed_principals: BTreeSet<String>) -> Rule {
    Rule {
        route: RouteWeightedClusters::new(
            HttpRouteMatch::wildcard(),
            Some(WeightedCluster::new(svc.local_cluster_name(), CLUSTER_WEIGHT_ACCEPT_ALL)),
        ),
        allowed_principals,
    }
}

fn export_route_match(rule: &ServiceExportRule) -> HttpRouteMatch {
    if rule.path.is_empty() || rule.path == REGEX_MATCH_ALL {
        return HttpRouteMatch::wildcard();
    }
    let path_match_type = match rule.path_type.as_deref() {
        Some("Exact") => PathMatchType::Exact,
        Some("Regex") | Some("RegularExpression") => PathMatchType::Regex,
        _ => PathMatchType::Prefix,
    };
    HttpRouteMatch {
        path: rule.path.clone(),
        path_match_type,
        ..HttpRouteMatch::wildcard()
    }
}
