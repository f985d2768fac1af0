//! Rebuilds driven from indexed resources through to the repository.

use crate::{
    document::PolicyDocument,
    generator::{Generator, Output},
    plugin::PluginPolicies,
    JobContext, JobPool, KubeProxyServiceMapper, PluginSet, Proxy, ProxyKind, ProxyMetrics,
    ProxyRegistry, ProxyServiceMapper,
};
use fsm_mesh_controller_certificate::Manager;
use fsm_mesh_controller_core::{
    broker::Broker,
    constants::{DEFAULT_TRUST_DOMAIN, MONITOR_LABEL, SIDECAR_UNIQUE_ID_LABEL},
    status::{PolicyKind, PolicyRef, StatusSink, StatusUpdate},
};
use fsm_mesh_controller_k8s_api::{
    self as k8s,
    api::core::v1::{EndpointAddress, EndpointPort, EndpointSubset, PodIP},
    config::{FeatureFlags, MeshConfig, MeshConfigSpec, TrafficSpec},
    policy::{
        egress_gateway::GatewayBindingSpec, BackendSpec, EgressGateway, EgressGatewaySpec,
        IngressBackend, IngressBackendSpec, Isolation, IsolationSpec, PortSpec, SourceKind,
        SourceSpec, TlsSpec,
    },
    smi::{
        HttpMatch, HttpRouteGroup, HttpRouteGroupSpec, IdentityBinding, TrafficSplit,
        TrafficSplitBackend, TrafficSplitSpec, TrafficTarget, TrafficTargetRule,
        TrafficTargetSpec,
    },
    IntOrString, ObjectMeta,
};
use fsm_mesh_controller_k8s_index::{ClusterInfo, Index, SharedIndex, ValidationError};
use fsm_mesh_controller_repo::{restore, InMemoryRepository, CONFIG_FILE};
use kubert::index::{IndexClusterResource, IndexNamespacedResource};
use maplit::btreemap;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tokio::sync::mpsc;

/// An index, a repository and a worker pool wired as the controller wires them.
pub(crate) struct Mesh {
    pub(crate) index: SharedIndex,
    pub(crate) broker: Arc<Broker>,
    pub(crate) repo: Arc<InMemoryRepository>,
    pub(crate) pool: JobPool,
}

// === impl Mesh ===

impl Mesh {
    pub(crate) async fn new() -> Self {
        Self::with_status(StatusSink::disabled()).await
    }

    pub(crate) async fn with_status(status: StatusSink) -> Self {
        let broker = Arc::new(Broker::new());
        let index = Index::shared(Arc::new(ClusterInfo::default()), broker.clone(), Arc::new(status));
        let repo = Arc::new(InMemoryRepository::default());
        restore(&*repo).await.expect("restore base codebase");
        let certs = Manager::new(DEFAULT_TRUST_DOMAIN, broker.clone()).expect("certificate manager");
        let pool = JobPool::with_workers(
            JobContext {
                index: index.clone(),
                certs: Arc::new(certs),
                repo: repo.clone(),
                registry: Arc::new(ProxyRegistry::default()),
                mapper: Arc::new(KubeProxyServiceMapper::default()),
                plugins: Arc::new(PluginSet::default()),
                metrics: ProxyMetrics::default(),
            },
            4,
        );
        Self {
            index,
            broker,
            repo,
            pool,
        }
    }

    pub(crate) fn apply<T>(&self, resource: T)
    where
        Index: IndexNamespacedResource<T>,
    {
        IndexNamespacedResource::apply(&mut *self.index.write(), resource);
    }

    pub(crate) fn delete<T>(&self, namespace: &str, name: &str)
    where
        Index: IndexNamespacedResource<T>,
    {
        IndexNamespacedResource::<T>::delete(
            &mut *self.index.write(),
            namespace.to_string(),
            name.to_string(),
        );
    }

    pub(crate) fn apply_cluster<T>(&self, resource: T)
    where
        Index: IndexClusterResource<T>,
    {
        IndexClusterResource::apply(&mut *self.index.write(), resource);
    }

    pub(crate) fn configure(&self, spec: MeshConfigSpec) {
        let info = ClusterInfo::default();
        let mut config = MeshConfig::new(&info.mesh_config_name, spec);
        config.metadata.namespace = Some(info.fsm_namespace);
        self.apply(config);
    }

    pub(crate) fn permissive(&self) {
        self.configure(MeshConfigSpec {
            traffic: TrafficSpec {
                enable_permissive_traffic_policy_mode: true,
                ..Default::default()
            },
            ..Default::default()
        });
    }

    /// Registers the proxy of the indexed workload labeled with `uuid`.
    pub(crate) fn register(&self, uuid: &str) -> Arc<Proxy> {
        let workload = self
            .index
            .read()
            .catalog()
            .list_proxy_workloads()
            .into_iter()
            .find(|w| w.proxy_uuid == uuid)
            .expect("workload must be indexed");
        let (proxy, _) = self
            .pool
            .context()
            .registry
            .register(Proxy::new(ProxyKind::Sidecar, workload));
        proxy
    }

    /// Compiles the proxy's document without publishing it.
    pub(crate) fn generate(&self, proxy: &Proxy) -> Output {
        let index = self.index.read();
        let catalog = index.catalog();
        let services = KubeProxyServiceMapper::default()
            .list_services_for_proxy(&catalog, proxy)
            .expect("proxy services");
        let plugins = PluginPolicies::global(&catalog);
        Generator::new(
            &catalog,
            proxy,
            &self.pool.context().registry,
            &plugins,
            &services,
        )
        .build(None, "")
    }

    pub(crate) async fn rebuild(&self, proxy: &Arc<Proxy>) -> bool {
        self.pool
            .submit(proxy.clone())
            .expect("no rebuild pending")
            .await
            .expect("rebuild must not panic")
    }

    pub(crate) fn published(&self, proxy: &Proxy) -> Option<serde_json::Value> {
        let json = self.repo.file(&proxy.codebase(), CONFIG_FILE)?;
        Some(serde_json::from_slice(&json).expect("published document must be JSON"))
    }
}

fn meta(ns: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        namespace: Some(ns.to_string()),
        name: Some(name.to_string()),
        ..Default::default()
    }
}

pub(crate) fn namespace(name: &str) -> k8s::Namespace {
    k8s::Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(btreemap! {
                MONITOR_LABEL.to_string() => ClusterInfo::default().mesh_name,
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// A service selecting pods labeled `app=<name>` on one port.
pub(crate) fn service(ns: &str, name: &str, port_name: &str, port: u16) -> k8s::Service {
    k8s::Service {
        metadata: meta(ns, name),
        spec: Some(k8s::ServiceSpec {
            selector: Some(btreemap! { "app".to_string() => name.to_string() }),
            ports: Some(vec![k8s::ServicePort {
                name: Some(port_name.to_string()),
                port: port.into(),
                target_port: Some(IntOrString::Int(port.into())),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn endpoints(ns: &str, name: &str, ips: &[&str], port_name: &str, port: u16) -> k8s::Endpoints {
    k8s::Endpoints {
        metadata: meta(ns, name),
        subsets: Some(vec![EndpointSubset {
            addresses: Some(
                ips.iter()
                    .map(|ip| EndpointAddress {
                        ip: ip.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: Some(vec![EndpointPort {
                name: Some(port_name.to_string()),
                port: port.into(),
                ..Default::default()
            }]),
            ..Default::default()
        }]),
    }
}

/// A pod labeled `app=<app>` running a proxy with the given UUID.
pub(crate) fn pod(ns: &str, name: &str, app: &str, sa: &str, ip: &str, uuid: &str) -> k8s::Pod {
    k8s::Pod {
        metadata: ObjectMeta {
            labels: Some(btreemap! {
                "app".to_string() => app.to_string(),
                SIDECAR_UNIQUE_ID_LABEL.to_string() => uuid.to_string(),
            }),
            ..meta(ns, name)
        },
        spec: Some(k8s::PodSpec {
            service_account_name: Some(sa.to_string()),
            ..Default::default()
        }),
        status: Some(k8s::PodStatus {
            pod_ip: Some(ip.to_string()),
            pod_ips: Some(vec![PodIP { ip: ip.to_string() }]),
            ..Default::default()
        }),
    }
}

fn service_account(ns: &str, name: &str) -> IdentityBinding {
    IdentityBinding {
        kind: "ServiceAccount".to_string(),
        name: name.to_string(),
        namespace: ns.to_string(),
    }
}

/// A client `a` in `ns1` and an upstream service `b.ns2:80` with one endpoint.
async fn client_and_upstream(upstream_ip: &str) -> (Mesh, Arc<Proxy>) {
    let mesh = Mesh::new().await;
    mesh.permissive();
    mesh.apply_cluster(namespace("ns1"));
    mesh.apply_cluster(namespace("ns2"));
    mesh.apply(service("ns2", "b", "http", 80));
    mesh.apply(endpoints("ns2", "b", &[upstream_ip], "http", 80));
    mesh.apply(pod("ns1", "a-0", "a", "a", "192.168.0.1", "uuid-a"));
    let proxy = mesh.register("uuid-a");
    (mesh, proxy)
}

fn outbound_http(doc: &PolicyDocument, port: u16, service: &str) -> crate::document::OutboundHttpRouteRules {
    let outbound = doc.outbound.as_ref().expect("outbound policy");
    outbound.traffic_matches[&port]
        .iter()
        .find(|tm| tm.protocol == "http")
        .and_then(|tm| tm.http_service_route_rules.get(service))
        .cloned()
        .expect("http route rules")
}

#[tokio::test]
async fn permissive_outbound_http_routes_to_the_upstream_endpoint() {
    let (mesh, proxy) = client_and_upstream("10.0.0.2").await;

    let Output { doc, ready } = mesh.generate(&proxy);
    assert!(ready);
    assert_eq!(doc.spec.service_identity, "a.ns1");

    let rules = outbound_http(&doc, 80, "b.ns2");
    assert_eq!(rules.route_rules.len(), 1);
    assert_eq!(
        rules.route_rules[0].target_clusters,
        btreemap! { "ns2/b|80".to_string() => 100 }
    );

    let cluster = &doc.outbound.as_ref().expect("outbound policy").clusters_configs["ns2/b|80"];
    let weights = cluster
        .endpoints
        .iter()
        .map(|(addr, ep)| (addr.clone(), ep.weight))
        .collect::<Vec<_>>();
    assert_eq!(weights, vec![("10.0.0.2:80".to_string(), 100)]);
}

#[tokio::test]
async fn traffic_targets_admit_the_route_group_on_the_upstream() {
    let mesh = Mesh::new().await;
    mesh.apply_cluster(namespace("ns"));
    mesh.apply(service("ns", "bookstore", "http", 80));
    mesh.apply(endpoints("ns", "bookstore", &["10.0.0.2"], "http", 80));
    mesh.apply(pod("ns", "bookstore-0", "bookstore", "bookstore", "10.0.0.2", "uuid-store"));
    mesh.apply(pod("ns", "bookbuyer-0", "bookbuyer", "bookbuyer", "10.0.0.1", "uuid-buyer"));

    let mut group = HttpRouteGroup::new(
        "books",
        HttpRouteGroupSpec {
            matches: vec![HttpMatch {
                name: "get-books".to_string(),
                path_regex: Some("/books/*".to_string()),
                methods: vec!["GET".to_string()],
                ..Default::default()
            }],
        },
    );
    group.metadata.namespace = Some("ns".to_string());
    mesh.apply(group);
    let mut tt = TrafficTarget::new(
        "buyer-to-store",
        TrafficTargetSpec {
            destination: service_account("ns", "bookstore"),
            sources: vec![service_account("ns", "bookbuyer")],
            rules: vec![TrafficTargetRule {
                kind: "HTTPRouteGroup".to_string(),
                name: "books".to_string(),
                matches: vec![],
            }],
        },
    );
    tt.metadata.namespace = Some("ns".to_string());
    mesh.apply(tt);

    let store = mesh.register("uuid-store");
    mesh.register("uuid-buyer");
    let Output { doc, .. } = mesh.generate(&store);

    let inbound = doc.inbound.as_ref().expect("inbound policy");
    let rules = inbound
        .traffic_matches
        .values()
        .flat_map(|tm| tm.http_service_route_rules.values())
        .flat_map(|rules| &rules.route_rules)
        .collect::<Vec<_>>();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].rule.matches.methods, vec!["GET"]);
    assert_eq!(rules[0].rule.matches.path, "/books/*");
    assert_eq!(rules[0].rule.allowed_services, vec!["bookbuyer.ns"]);
}

#[tokio::test]
async fn traffic_splits_weigh_the_apex_route() {
    let mesh = Mesh::new().await;
    mesh.permissive();
    mesh.apply_cluster(namespace("ns"));
    for (name, ip) in [("apex", "10.0.0.10"), ("b1", "10.0.0.11"), ("b2", "10.0.0.12")] {
        mesh.apply(service("ns", name, "http", 80));
        mesh.apply(endpoints("ns", name, &[ip], "http", 80));
    }
    let mut split = TrafficSplit::new(
        "apex-split",
        TrafficSplitSpec {
            service: "apex".to_string(),
            backends: vec![
                TrafficSplitBackend {
                    service: "b1".to_string(),
                    weight: 80,
                },
                TrafficSplitBackend {
                    service: "b2".to_string(),
                    weight: 20,
                },
            ],
            matches: vec![],
        },
    );
    split.metadata.namespace = Some("ns".to_string());
    mesh.apply(split);
    mesh.apply(pod("ns", "client-0", "client", "client", "10.0.0.1", "uuid-client"));
    let proxy = mesh.register("uuid-client");

    let Output { doc, .. } = mesh.generate(&proxy);
    let rules = outbound_http(&doc, 80, "apex.ns");
    assert_eq!(rules.route_rules.len(), 1);
    assert_eq!(
        rules.route_rules[0].target_clusters,
        btreemap! {
            "ns/b1|80".to_string() => 80,
            "ns/b2|80".to_string() => 20,
        }
    );
}

#[tokio::test]
async fn global_egress_gateways_forward_everything() {
    let mesh = Mesh::new().await;
    mesh.apply_cluster(namespace("ns"));
    mesh.apply(pod("ns", "a-0", "a", "a", "10.0.0.1", "uuid-a"));
    let mut gw = service("svc", "gw", "http", 9443);
    gw.metadata.annotations = Some(btreemap! {
        fsm_mesh_controller_core::constants::EGRESS_GATEWAY_MODE_ANNOTATION.to_string() =>
            "http2-tunnel".to_string(),
    });
    mesh.apply(gw);
    mesh.apply(endpoints("svc", "gw", &["1.2.3.4"], "http", 9443));
    let mut gateway = EgressGateway::new(
        "global",
        EgressGatewaySpec {
            global_egress_gateways: vec![GatewayBindingSpec {
                service: "gw".to_string(),
                namespace: "svc".to_string(),
                weight: None,
            }],
            egress_policy_gateway_rules: vec![],
        },
    );
    gateway.metadata.namespace = Some("svc".to_string());
    mesh.apply(gateway);
    let proxy = mesh.register("uuid-a");

    let Output { doc, .. } = mesh.generate(&proxy);
    let forward = doc.forward.expect("forward policy");
    assert_eq!(
        forward.forward_matches,
        btreemap! { "*".to_string() => btreemap! { "gw.svc".to_string() => 100 } }
    );
    let gw = &forward.egress_gateways["gw.svc"];
    assert_eq!(gw.mode, "http2-tunnel");
    let weights = gw
        .cluster
        .endpoints
        .iter()
        .map(|(addr, ep)| (addr.as_str(), ep.weight))
        .collect::<Vec<_>>();
    assert_eq!(weights, vec![("1.2.3.4:9443", 100)]);
}

#[tokio::test]
async fn isolated_endpoints_and_proxies_are_left_out() {
    let (mesh, client) = client_and_upstream("10.1.2.3").await;
    mesh.apply_cluster(Isolation::new(
        "isolated",
        IsolationSpec {
            cidrs: vec!["10.0.0.0/8".to_string()],
        },
    ));

    let Output { doc, .. } = mesh.generate(&client);
    assert!(doc
        .outbound
        .iter()
        .flat_map(|outbound| outbound.clusters_configs.values())
        .flat_map(|c| c.endpoints.keys())
        .all(|addr| !addr.starts_with("10.1.2.3:")));

    mesh.apply(pod("ns1", "c-0", "c", "c", "10.5.0.1", "uuid-c"));
    let isolated = mesh.register("uuid-c");
    assert!(mesh.rebuild(&isolated).await);
    assert!(mesh.repo.codebase(&isolated.codebase()).is_none());
}

#[tokio::test]
async fn documents_are_deterministic() {
    let (mesh, proxy) = client_and_upstream("10.0.0.2").await;
    let a = serde_json::to_vec(&mesh.generate(&proxy).doc).unwrap();
    let b = serde_json::to_vec(&mesh.generate(&proxy).doc).unwrap();
    assert_eq!(a, b);
}

#[tokio::test]
async fn unchanged_inputs_do_not_reach_the_repository() {
    let (mesh, proxy) = client_and_upstream("10.0.0.2").await;

    assert!(mesh.rebuild(&proxy).await);
    let first = mesh.published(&proxy).expect("published document");
    let etag = proxy.etag().await;
    assert_eq!(first["Version"], etag.to_string());
    assert_eq!(first["Spec"]["ServiceIdentity"], "a.ns1");

    let requests = mesh.repo.request_count();
    assert!(mesh.rebuild(&proxy).await);
    assert_eq!(mesh.repo.request_count(), requests);
    assert_eq!(proxy.etag().await, etag);

    mesh.apply(endpoints("ns2", "b", &["10.0.0.2", "10.0.0.3"], "http", 80));
    assert!(mesh.rebuild(&proxy).await);
    assert_ne!(proxy.etag().await, etag);
}

#[tokio::test]
async fn server_first_services_are_plain_tcp_inbound() {
    let mesh = Mesh::new().await;
    mesh.permissive();
    mesh.apply_cluster(namespace("ns"));
    mesh.apply(service("ns", "db", "tcp-server-first-mysql", 3306));
    mesh.apply(pod("ns", "db-0", "db", "db", "10.0.0.5", "uuid-db"));
    let proxy = mesh.register("uuid-db");

    let Output { doc, .. } = mesh.generate(&proxy);
    let inbound = doc.inbound.expect("inbound policy");
    for tm in inbound.traffic_matches.values() {
        assert!(
            ["http", "https", "grpc", "tcp"].contains(&tm.protocol.as_str()),
            "unexpected inbound protocol {}",
            tm.protocol
        );
    }
    assert_eq!(inbound.traffic_matches[&3306].protocol, "tcp");
}

#[tokio::test]
async fn https_ingress_skipping_client_validation_without_principals_is_rejected() {
    let (tx, mut rx) = mpsc::channel(16);
    let mesh = Mesh::with_status(StatusSink::new(tx)).await;
    mesh.configure(MeshConfigSpec {
        traffic: TrafficSpec {
            enable_permissive_traffic_policy_mode: true,
            ..Default::default()
        },
        feature_flags: FeatureFlags {
            enable_ingress_backend_policy: true,
            ..Default::default()
        },
        ..Default::default()
    });
    mesh.apply_cluster(namespace("ns"));
    mesh.apply(service("ns", "b", "https", 443));
    mesh.apply(endpoints("ns", "b", &["10.0.0.2"], "https", 443));
    mesh.apply(pod("ns", "b-0", "b", "b", "10.0.0.2", "uuid-b"));
    mesh.apply(service("ingress", "nginx", "http", 80));
    mesh.apply(endpoints("ingress", "nginx", &["10.1.0.5"], "http", 80));

    let mut ib = IngressBackend::new(
        "ib",
        IngressBackendSpec {
            backends: vec![BackendSpec {
                name: "b".to_string(),
                port: PortSpec {
                    number: 443,
                    protocol: "https".to_string(),
                },
                tls: Some(TlsSpec {
                    skip_client_cert_validation: true,
                    sni_hosts: None,
                }),
            }],
            sources: vec![SourceSpec {
                kind: SourceKind::Service,
                name: "nginx".to_string(),
                namespace: Some("ingress".to_string()),
            }],
            matches: None,
        },
    );
    ib.metadata.namespace = Some("ns".to_string());
    mesh.apply(ib);

    let updates = std::iter::from_fn(|| rx.try_recv().ok()).collect::<Vec<_>>();
    assert!(
        updates.contains(&StatusUpdate::error(
            PolicyRef::namespaced(PolicyKind::IngressBackend, "ns", "ib"),
            ValidationError::MissingAuthenticatedPrincipal.to_string(),
        )),
        "missing error status in {updates:?}"
    );

    let proxy = mesh.register("uuid-b");
    let Output { doc, .. } = mesh.generate(&proxy);
    let admitted = doc
        .inbound
        .iter()
        .flat_map(|inbound| inbound.traffic_matches.values())
        .any(|tm| tm.source_ip_ranges.contains_key("10.1.0.5/32"));
    assert!(!admitted);
}
