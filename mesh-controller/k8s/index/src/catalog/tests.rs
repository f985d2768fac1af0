use super::Error;
use crate::{
    tests::{
        backend, mk_access_control, mk_endpoints, mk_global_traffic_policy, mk_index,
        mk_ingress_backend, mk_namespace, mk_pod, mk_service, mk_service_import, source,
    },
    Index,
};
use fsm_mesh_controller_core::{
    constants::SIDECAR_UNIQUE_ID_LABEL, trafficpolicy::IngressTls, ClusterName, IpNet,
    MeshService, ServiceIdentity, WeightedCluster,
};
use fsm_mesh_controller_k8s_api::{
    config::{FeatureFlags, MeshConfigSpec, TrafficSpec},
    plugin::{Plugin, PluginSpec},
    policy::{
        egress::EgressSourceSpec, BackendSpec, Egress, EgressSpec, PortSpec, SourceKind, TlsSpec,
    },
    smi::{
        HttpMatch, HttpRouteGroup, HttpRouteGroupSpec, IdentityBinding, TrafficSplit,
        TrafficSplitBackend, TrafficSplitSpec, TrafficTarget, TrafficTargetRule,
        TrafficTargetSpec,
    },
};
use maplit::btreeset;
use pretty_assertions::assert_eq;
use rstest::rstest;

fn permissive() -> MeshConfigSpec {
    MeshConfigSpec {
        traffic: TrafficSpec {
            enable_permissive_traffic_policy_mode: true,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn with_flags(flags: FeatureFlags) -> MeshConfigSpec {
    MeshConfigSpec {
        feature_flags: flags,
        ..Default::default()
    }
}

/// A monitored namespace `ns` with services `a` and `b`, each backed by one pod running as
/// `sa-a` and `sa-b`.
fn bookstore() -> Index {
    let mut index = mk_index();
    index.apply(mk_namespace("ns", true));
    for (name, ip) in [("a", "10.0.0.1"), ("b", "10.0.0.2")] {
        index.apply(mk_service("ns", name, &[("http", 80, 8080)]));
        index.apply(mk_endpoints("ns", name, &[ip], &[("http", 8080)]));
        let sa = format!("sa-{name}");
        index.apply(mk_pod(
            "ns",
            &format!("{name}-0"),
            &sa,
            ip,
            &[("app", name), (SIDECAR_UNIQUE_ID_LABEL, &format!("uuid-{name}"))],
        ));
    }
    index
}

fn mesh_service(index: &Index, name: &str) -> MeshService {
    index
        .catalog()
        .list_services()
        .into_iter()
        .find(|svc| svc.name == name)
        .expect("service must exist")
}

fn identity(name: &str) -> ServiceIdentity {
    ServiceIdentity::new(name, "ns")
}

fn service_account(name: &str) -> IdentityBinding {
    IdentityBinding {
        kind: "ServiceAccount".to_string(),
        name: name.to_string(),
        namespace: "ns".to_string(),
    }
}

/// Allows `sa-a` to call `GET /books` on `sa-b`.
fn books_traffic_target(index: &mut Index) {
    let mut group = HttpRouteGroup::new(
        "routes",
        HttpRouteGroupSpec {
            matches: vec![HttpMatch {
                name: "books".to_string(),
                path_regex: Some("/books".to_string()),
                methods: vec!["GET".to_string()],
                ..Default::default()
            }],
        },
    );
    group.metadata.namespace = Some("ns".to_string());
    index.apply(group);

    let mut tt = TrafficTarget::new(
        "a-to-b",
        TrafficTargetSpec {
            destination: service_account("sa-b"),
            sources: vec![service_account("sa-a")],
            rules: vec![TrafficTargetRule {
                kind: "HTTPRouteGroup".to_string(),
                name: "routes".to_string(),
                matches: vec![],
            }],
        },
    );
    tt.metadata.namespace = Some("ns".to_string());
    index.apply(tt);
}

#[test]
fn permissive_outbound_reaches_every_service() {
    let mut index = bookstore();
    index.set_mesh_config(permissive());

    let policy = index
        .catalog()
        .get_outbound_mesh_traffic_policy(&identity("sa-a"))
        .expect("outbound policy");
    let clusters = policy
        .clusters_configs
        .iter()
        .map(|c| c.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(clusters, vec!["ns/a|8080", "ns/b|8080"]);

    let http = &policy.http_route_configs_per_port[&80];
    let b = http.iter().find(|p| p.name == "b.ns").expect("route config for b");
    for host in ["b", "b:80", "b.ns", "b.ns.svc.cluster.local:80"] {
        assert!(b.hostnames.contains(&host.to_string()), "missing {host}");
    }
    assert_eq!(b.routes.len(), 1);
    assert!(b.routes[0].route_match.is_wildcard_path());
    assert_eq!(
        b.routes[0].weighted_clusters,
        btreeset! { WeightedCluster::new("ns/b|8080", 100) }
    );
}

#[test]
fn traffic_targets_restrict_outbound_services() {
    let mut index = bookstore();
    books_traffic_target(&mut index);
    let catalog = index.catalog();

    let policy = catalog
        .get_outbound_mesh_traffic_policy(&identity("sa-a"))
        .expect("outbound policy");
    assert_eq!(policy.clusters_configs.len(), 1);
    assert_eq!(policy.clusters_configs[0].name, ClusterName::from("ns/b|8080"));

    assert!(catalog
        .get_outbound_mesh_traffic_policy(&identity("sa-b"))
        .is_none());
}

#[test]
fn traffic_targets_grant_inbound_routes() {
    let mut index = bookstore();
    books_traffic_target(&mut index);
    let catalog = index.catalog();

    let upstream = identity("sa-b");
    let services = catalog.list_services_for_identity(&upstream);
    let policy = catalog
        .get_inbound_mesh_traffic_policy(&upstream, &services)
        .expect("inbound policy");

    assert_eq!(policy.clusters_configs[0].name.as_str(), "ns/b|8080|local");
    assert_eq!(policy.traffic_matches[0].destination_port, 8080);
    assert_eq!(
        policy.traffic_matches[0].server_names,
        vec!["b.ns.svc.cluster.local"]
    );

    let http = &policy.http_route_configs_per_port[&8080][0];
    assert_eq!(http.rules.len(), 1);
    assert_eq!(http.rules[0].route.route_match.path, "/books");
    assert_eq!(http.rules[0].route.route_match.methods, vec!["GET"]);
    assert_eq!(
        http.rules[0].allowed_principals,
        btreeset! { "sa-a.ns.cluster.local".to_string() }
    );
}

#[test]
fn permissive_inbound_admits_any_principal() {
    let mut index = bookstore();
    index.set_mesh_config(permissive());
    let catalog = index.catalog();

    let svc = mesh_service(&index, "b");
    let policy = catalog
        .get_inbound_mesh_traffic_policy(&identity("sa-b"), &[svc])
        .expect("inbound policy");
    let rule = &policy.http_route_configs_per_port[&8080][0].rules[0];
    assert!(rule.route.route_match.is_wildcard_path());
    assert_eq!(rule.allowed_principals, btreeset! { "*".to_string() });
}

#[test]
fn traffic_splits_divide_the_apex_route() {
    let mut index = bookstore();
    index.set_mesh_config(permissive());
    for name in ["b-v1", "b-v2"] {
        index.apply(mk_service("ns", name, &[("http", 80, 8080)]));
    }
    let mut split = TrafficSplit::new(
        "b-split",
        TrafficSplitSpec {
            service: "b".to_string(),
            backends: ["b-v1", "b-v2"]
                .into_iter()
                .map(|service| TrafficSplitBackend {
                    service: service.to_string(),
                    weight: 50,
                })
                .collect(),
            matches: vec![],
        },
    );
    split.metadata.namespace = Some("ns".to_string());
    index.apply(split);

    let policy = index
        .catalog()
        .get_outbound_mesh_traffic_policy(&identity("sa-a"))
        .expect("outbound policy");
    let b = policy.http_route_configs_per_port[&80]
        .iter()
        .find(|p| p.name == "b.ns")
        .expect("route config for b");
    assert_eq!(b.routes.len(), 1);
    assert_eq!(
        b.routes[0].weighted_clusters,
        btreeset! {
            WeightedCluster::new("ns/b-v1|8080", 50),
            WeightedCluster::new("ns/b-v2|8080", 50),
        }
    );
}

#[test]
fn split_backends_share_their_weight_with_active_peers() {
    let mut index = bookstore();
    index.set_mesh_config(permissive());
    for name in ["b-v1", "b-v2"] {
        index.apply(mk_service("ns", name, &[("http", 80, 8080)]));
    }
    // The peer on 8080 has the local cluster's name and is served by it.
    index.apply(mk_service_import(
        "ns",
        "b-v2",
        80,
        &[("c1", "10.1.0.2", 8080), ("c2", "10.2.0.2", 8081)],
    ));
    index.apply(mk_global_traffic_policy("ns", "b-v2", "ActiveActive", &[]));
    let mut split = TrafficSplit::new(
        "b-split",
        TrafficSplitSpec {
            service: "b".to_string(),
            backends: ["b-v1", "b-v2"]
                .into_iter()
                .map(|service| TrafficSplitBackend {
                    service: service.to_string(),
                    weight: 50,
                })
                .collect(),
            matches: vec![],
        },
    );
    split.metadata.namespace = Some("ns".to_string());
    index.apply(split);

    let policy = index
        .catalog()
        .get_outbound_mesh_traffic_policy(&identity("sa-a"))
        .expect("outbound policy");
    let b = policy.http_route_configs_per_port[&80]
        .iter()
        .find(|p| p.name == "b.ns")
        .expect("route config for b");
    assert_eq!(
        b.routes[0].weighted_clusters,
        btreeset! {
            WeightedCluster::new("ns/b-v1|8080", 50),
            WeightedCluster::new("ns/b-v2|8080", 25),
            WeightedCluster::new("ns/b-v2|8081", 25),
        }
    );
}

#[test]
fn access_control_without_backends_admits_sources_on_the_service_port() {
    let mut index = bookstore();
    index.set_mesh_config(with_flags(FeatureFlags {
        enable_access_control_policy: true,
        ..Default::default()
    }));
    index.apply(mk_access_control(
        "ns",
        "acl",
        vec![],
        vec![source(SourceKind::IpRange, "10.0.0.0/8", None)],
    ));

    let svc = mesh_service(&index, "b");
    let policy = index
        .catalog()
        .get_access_control_traffic_policy(&svc)
        .expect("access control must resolve")
        .expect("access control policy");
    assert_eq!(policy.traffic_matches.len(), 1);
    assert_eq!(policy.traffic_matches[0].port, 8080);
    assert_eq!(
        policy.traffic_matches[0].source_ip_ranges,
        vec!["10.0.0.0/8".parse::<IpNet>().unwrap()]
    );
    assert_eq!(
        policy.http_route_policies[0].rules[0].allowed_principals,
        btreeset! { "*".to_string() }
    );
}

fn with_access_control(index: &mut Index) {
    index.set_mesh_config(with_flags(FeatureFlags {
        enable_access_control_policy: true,
        ..Default::default()
    }));
}

fn tls_backend(
    name: &str,
    port: u16,
    protocol: &str,
    skip_client_cert_validation: bool,
) -> BackendSpec {
    BackendSpec {
        tls: Some(TlsSpec {
            skip_client_cert_validation,
            sni_hosts: None,
        }),
        ..backend(name, port, protocol)
    }
}

#[rstest]
#[case::http("http", true)]
#[case::grpc("grpc", true)]
#[case::tcp("tcp", false)]
fn access_control_backends_admit_any_principal_at_the_http_layer(
    #[case] protocol: &str,
    #[case] routed: bool,
) {
    let mut index = bookstore();
    with_access_control(&mut index);
    index.apply(mk_access_control(
        "ns",
        "acl",
        vec![backend("b", 8080, protocol)],
        vec![
            source(SourceKind::IpRange, "10.0.0.0/8", None),
            source(SourceKind::AuthenticatedPrincipal, "client.ns.cluster.local", None),
        ],
    ));

    let svc = mesh_service(&index, "b");
    let policy = index
        .catalog()
        .get_access_control_traffic_policy(&svc)
        .expect("access control must resolve")
        .expect("access control policy");
    let tm = &policy.traffic_matches[0];
    assert_eq!(tm.name, format!("acl_ns/b_8080_{protocol}_"));
    assert_eq!(tm.protocol, protocol);
    assert_eq!(tm.source_ip_ranges, vec!["10.0.0.0/8".parse::<IpNet>().unwrap()]);
    if routed {
        assert_eq!(
            policy.http_route_policies[0].rules[0].allowed_principals,
            btreeset! { "*".to_string(), "client.ns.cluster.local".to_string() }
        );
    } else {
        assert!(policy.http_route_policies.is_empty());
    }
}

#[test]
fn access_control_backends_match_the_target_port() {
    let mut index = bookstore();
    with_access_control(&mut index);
    index.apply(mk_access_control(
        "ns",
        "acl",
        vec![backend("b", 9090, "http"), backend("a", 8080, "http")],
        vec![source(SourceKind::IpRange, "10.0.0.0/8", None)],
    ));

    let svc = mesh_service(&index, "b");
    assert_eq!(index.catalog().get_access_control_traffic_policy(&svc), Ok(None));

    let svc = mesh_service(&index, "a");
    let policy = index
        .catalog()
        .get_access_control_traffic_policy(&svc)
        .expect("access control must resolve")
        .expect("access control policy");
    assert_eq!(policy.traffic_matches.len(), 1);
    assert_eq!(policy.traffic_matches[0].port, 8080);
}

#[test]
fn https_access_control_backends_are_matched_as_tls() {
    let mut index = bookstore();
    with_access_control(&mut index);
    index.apply(mk_access_control(
        "ns",
        "acl",
        vec![tls_backend("b", 8080, "https", true)],
        vec![source(SourceKind::AuthenticatedPrincipal, "client.ns.cluster.local", None)],
    ));

    let svc = mesh_service(&index, "b");
    let policy = index
        .catalog()
        .get_access_control_traffic_policy(&svc)
        .expect("access control must resolve")
        .expect("access control policy");
    let tm = &policy.traffic_matches[0];
    assert_eq!(tm.protocol, "https");
    assert_eq!(
        tm.tls,
        Some(IngressTls {
            skip_client_cert_validation: true,
            sni_hosts: vec![],
        })
    );
    // HTTPS is matched as TLS, not routed.
    assert!(policy.http_route_policies.is_empty());
}

#[test]
fn client_cert_validation_decides_grpc_backend_principals() {
    let mut index = bookstore();
    with_access_control(&mut index);
    index.apply(mk_access_control(
        "ns",
        "acl",
        vec![tls_backend("b", 8080, "grpc", false)],
        vec![source(SourceKind::AuthenticatedPrincipal, "client.ns.cluster.local", None)],
    ));
    let svc = mesh_service(&index, "b");
    let policy = index
        .catalog()
        .get_access_control_traffic_policy(&svc)
        .expect("access control must resolve")
        .expect("access control policy");
    assert_eq!(
        policy.http_route_policies[0].rules[0].allowed_principals,
        btreeset! { "*".to_string(), "client.ns.cluster.local".to_string() }
    );

    index.apply(mk_access_control(
        "ns",
        "acl",
        vec![tls_backend("b", 8080, "grpc", true)],
        vec![source(SourceKind::AuthenticatedPrincipal, "client.ns.cluster.local", None)],
    ));
    let policy = index
        .catalog()
        .get_access_control_traffic_policy(&svc)
        .expect("access control must resolve")
        .expect("access control policy");
    assert_eq!(
        policy.http_route_policies[0].rules[0].allowed_principals,
        btreeset! { "*".to_string() }
    );
}

#[test]
fn access_control_service_sources_resolve_to_endpoint_addresses() {
    let mut index = bookstore();
    with_access_control(&mut index);
    index.apply(mk_access_control(
        "ns",
        "acl",
        vec![backend("b", 8080, "tcp")],
        vec![
            source(SourceKind::Service, "a", Some("ns")),
            source(SourceKind::Service, "client", Some("other")),
        ],
    ));
    let svc = mesh_service(&index, "b");
    assert_eq!(
        index.catalog().get_access_control_traffic_policy(&svc),
        Err(Error::EndpointsNotFound("other/client".to_string()))
    );

    index.apply(mk_service("other", "client", &[("http", 80, 80)]));
    index.apply(mk_endpoints("other", "client", &["10.2.0.7", "10.2.0.8"], &[("http", 80)]));
    let policy = index
        .catalog()
        .get_access_control_traffic_policy(&svc)
        .expect("access control must resolve")
        .expect("access control policy");
    assert_eq!(
        policy.traffic_matches[0].source_ip_ranges,
        vec![
            "10.0.0.1/32".parse::<IpNet>().unwrap(),
            "10.2.0.7/32".parse::<IpNet>().unwrap(),
            "10.2.0.8/32".parse::<IpNet>().unwrap(),
        ]
    );
}

#[test]
fn access_control_is_disabled_by_feature_flag() {
    let mut index = bookstore();
    index.apply(mk_access_control(
        "ns",
        "acl",
        vec![],
        vec![source(SourceKind::IpRange, "10.0.0.0/8", None)],
    ));
    let svc = mesh_service(&index, "b");
    assert_eq!(index.catalog().get_access_control_traffic_policy(&svc), Ok(None));
}

#[test]
fn ingress_backends_resolve_service_sources() {
    let mut index = bookstore();
    index.set_mesh_config(with_flags(FeatureFlags {
        enable_ingress_backend_policy: true,
        ..Default::default()
    }));
    index.apply(mk_ingress_backend(
        "ns",
        "ib",
        vec![backend("b", 8080, "http")],
        vec![source(SourceKind::Service, "ingress-nginx", Some("ingress"))],
    ));
    let svc = mesh_service(&index, "b");

    assert_eq!(
        index.catalog().get_ingress_traffic_policy(&svc),
        Err(Error::EndpointsNotFound("ingress/ingress-nginx".to_string()))
    );

    index.apply(mk_service("ingress", "ingress-nginx", &[("http", 80, 80)]));
    index.apply(mk_endpoints("ingress", "ingress-nginx", &["10.1.0.5"], &[("http", 80)]));
    let policy = index
        .catalog()
        .get_ingress_traffic_policy(&svc)
        .expect("ingress sources must resolve")
        .expect("ingress policy");
    let tm = &policy.traffic_matches[0];
    assert_eq!(tm.name, "ingress_ns/b_8080_http_");
    assert_eq!(tm.port, 8080);
    assert_eq!(tm.source_ip_ranges, vec!["10.1.0.5/32".parse::<IpNet>().unwrap()]);
    assert_eq!(
        policy.http_route_policies[0].rules[0].allowed_principals,
        btreeset! { "*".to_string() }
    );
}

#[test]
fn grpc_ingress_backends_admit_any_principal() {
    let mut index = bookstore();
    index.set_mesh_config(with_flags(FeatureFlags {
        enable_ingress_backend_policy: true,
        ..Default::default()
    }));
    index.apply(mk_ingress_backend(
        "ns",
        "ib",
        vec![backend("b", 8080, "GRPC")],
        vec![source(SourceKind::AuthenticatedPrincipal, "gw.ingress.cluster.local", None)],
    ));
    let svc = mesh_service(&index, "b");
    let policy = index
        .catalog()
        .get_ingress_traffic_policy(&svc)
        .expect("ingress sources must resolve")
        .expect("ingress policy");
    assert_eq!(policy.traffic_matches[0].protocol, "grpc");
    assert_eq!(
        policy.http_route_policies[0].rules[0].allowed_principals,
        btreeset! { "*".to_string(), "gw.ingress.cluster.local".to_string() }
    );
}

#[test]
fn mesh_wide_egress_allows_all_destinations() {
    let mut index = bookstore();
    index.set_mesh_config(MeshConfigSpec {
        traffic: TrafficSpec {
            enable_egress: true,
            ..Default::default()
        },
        ..Default::default()
    });

    let policy = index
        .catalog()
        .get_egress_traffic_policy(&identity("sa-a"))
        .expect("egress must resolve")
        .expect("egress policy");
    assert_eq!(policy.traffic_matches.len(), 1);
    assert_eq!(policy.traffic_matches[0].name, "egress-allow-all");
    assert_eq!(
        policy.traffic_matches[0].destination_ip_ranges,
        vec!["0.0.0.0/0".parse::<IpNet>().unwrap()]
    );
}

#[test]
fn egress_policies_route_http_hosts() {
    let mut index = bookstore();
    index.set_mesh_config(with_flags(FeatureFlags {
        enable_egress_policy: true,
        ..Default::default()
    }));
    let mut egress = Egress::new(
        "httpbin",
        EgressSpec {
            sources: vec![EgressSourceSpec {
                kind: "ServiceAccount".to_string(),
                name: "sa-a".to_string(),
                namespace: "ns".to_string(),
                mtls: None,
            }],
            hosts: vec!["httpbin.org".to_string()],
            ports: vec![PortSpec {
                number: 80,
                protocol: "http".to_string(),
            }],
            ..Default::default()
        },
    );
    egress.metadata.namespace = Some("ns".to_string());
    index.apply(egress);
    let catalog = index.catalog();

    let policy = catalog
        .get_egress_traffic_policy(&identity("sa-a"))
        .expect("egress must resolve")
        .expect("egress policy");
    assert_eq!(policy.traffic_matches[0].name, "egress-http.80");
    assert_eq!(policy.clusters_configs[0].name.as_str(), "httpbin.org:80");
    let route = &policy.http_route_configs_per_port[&80][0];
    assert_eq!(route.name, "httpbin.org");
    assert_eq!(route.hostnames, vec!["httpbin.org", "httpbin.org:80"]);

    assert_eq!(catalog.get_egress_traffic_policy(&identity("sa-b")), Ok(None));
    assert_eq!(catalog.get_egress_gateway_policy(), None);
}

#[test]
fn proxy_workloads_serve_selecting_services() {
    let index = bookstore();
    let catalog = index.catalog();

    let workloads = catalog.list_proxy_workloads();
    assert_eq!(workloads.len(), 2);
    let b = workloads
        .iter()
        .find(|w| w.proxy_uuid == "uuid-b")
        .expect("workload b");
    assert_eq!(b.to_string(), "ns/b-0");
    assert_eq!(b.identity(), identity("sa-b"));
    assert_eq!(b.ip, Some("10.0.0.2".parse().unwrap()));

    let services = catalog.list_services_for_workload(b);
    assert_eq!(services, vec![mesh_service(&index, "b")]);
}

#[test]
fn plugins_require_the_plugin_policy_flag() {
    let mut index = bookstore();
    index.apply(Plugin::new(
        "token-verifier",
        PluginSpec {
            priority: 10.0,
            pipyscript: "pipy()".to_string(),
        },
    ));
    assert!(index.catalog().get_plugins().is_empty());

    index.set_mesh_config(with_flags(FeatureFlags {
        enable_plugin_policy: true,
        ..Default::default()
    }));
    let plugins = index.catalog().get_plugins();
    assert_eq!(plugins.len(), 1);
    assert_eq!(plugins[0].name, "token-verifier");
    assert_eq!(plugins[0].script, "pipy()");
}
