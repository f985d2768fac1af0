//! Index size and churn metrics, recorded by wrapping the shared index handed to kubert.

use crate::{Index, SharedIndex};
use fsm_mesh_controller_k8s_api::{
    self as k8s,
    machine::VirtualMachine,
    multicluster::{GlobalTrafficPolicy, ServiceExport, ServiceImport},
    plugin::{Plugin, PluginChain, PluginConfig},
    policy::{
        AccessCert, AccessControl, Egress, EgressGateway, IngressBackend, Isolation, Retry,
        TrafficWarmup, UpstreamTrafficSetting,
    },
    smi::{HttpRouteGroup, TcpRoute, TrafficSplit, TrafficTarget},
    ResourceExt,
};
use kubert::index::{IndexClusterResource, IndexNamespacedResource, NamespacedRemoved};
use parking_lot::RwLock;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::sync::Arc;

pub struct IndexMetrics {
    inner: SharedIndex,

    index_size: Family<IndexLabels, Gauge>,
    index_applies: Family<IndexLabels, Counter>,
    index_deletes: Family<IndexLabels, Counter>,
    index_resets: Family<KindLabels, Counter>,
}

/// Cluster-scoped resources are recorded with an empty namespace.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct IndexLabels {
    namespace: String,
    kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: String,
}

/// The number of indexed resources of kind `R` in a namespace.
pub trait SizedIndex<R> {
    fn size(&self, namespace: &str) -> usize;
}

// === impl IndexMetrics ===

impl IndexMetrics {
    pub fn register(inner: SharedIndex, prom: &mut Registry) -> Self {
        let index_size = Family::default();
        prom.register(
            "index_size",
            "Gauge of the number of resources in the index",
            index_size.clone(),
        );

        let index_applies = Family::default();
        prom.register(
            "index_applies",
            "Count of applies to the index",
            index_applies.clone(),
        );

        let index_deletes = Family::default();
        prom.register(
            "index_deletes",
            "Count of deletes from the index",
            index_deletes.clone(),
        );

        let index_resets = Family::default();
        prom.register(
            "index_resets",
            "Count of resets of the index",
            index_resets.clone(),
        );

        Self {
            inner,
            index_size,
            index_applies,
            index_deletes,
            index_resets,
        }
    }

    pub fn shared(self) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(self))
    }

    fn labels<R: ResourceExt<DynamicType = ()>>(namespace: &str) -> IndexLabels {
        IndexLabels {
            namespace: namespace.to_string(),
            kind: R::kind(&()).to_string(),
        }
    }

    fn record_size<R>(&self, namespace: &str)
    where
        R: ResourceExt<DynamicType = ()>,
        Index: SizedIndex<R>,
    {
        let size = SizedIndex::<R>::size(&*self.inner.read(), namespace);
        self.index_size
            .get_or_create(&Self::labels::<R>(namespace))
            .set(size as i64);
    }
}

impl<R> IndexNamespacedResource<R> for IndexMetrics
where
    R: ResourceExt<DynamicType = ()>,
    Index: IndexNamespacedResource<R> + SizedIndex<R>,
{
    fn apply(&mut self, resource: R) {
        let namespace = resource.namespace().unwrap_or_default();
        self.index_applies
            .get_or_create(&Self::labels::<R>(&namespace))
            .inc();
        IndexNamespacedResource::<R>::apply(&mut *self.inner.write(), resource);
        self.record_size::<R>(&namespace);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.index_deletes
            .get_or_create(&Self::labels::<R>(&namespace))
            .inc();
        IndexNamespacedResource::<R>::delete(&mut *self.inner.write(), namespace.clone(), name);
        self.record_size::<R>(&namespace);
    }

    fn reset(&mut self, resources: Vec<R>, removed: NamespacedRemoved) {
        let mut namespaces = resources
            .iter()
            .flat_map(|r| r.namespace())
            .chain(removed.keys().cloned())
            .collect::<Vec<_>>();
        namespaces.sort();
        namespaces.dedup();

        self.index_resets
            .get_or_create(&KindLabels {
                kind: R::kind(&()).to_string(),
            })
            .inc();
        IndexNamespacedResource::<R>::reset(&mut *self.inner.write(), resources, removed);
        for ns in namespaces {
            self.record_size::<R>(&ns);
        }
    }
}

impl<R> IndexClusterResource<R> for IndexMetrics
where
    R: ResourceExt<DynamicType = ()>,
    Index: IndexClusterResource<R> + SizedIndex<R>,
{
    fn apply(&mut self, resource: R) {
        self.index_applies.get_or_create(&Self::labels::<R>("")).inc();
        IndexClusterResource::<R>::apply(&mut *self.inner.write(), resource);
        self.record_size::<R>("");
    }

    fn delete(&mut self, name: String) {
        self.index_deletes.get_or_create(&Self::labels::<R>("")).inc();
        IndexClusterResource::<R>::delete(&mut *self.inner.write(), name);
        self.record_size::<R>("");
    }
}

// === impl SizedIndex ===

macro_rules! sized_index {
    ($($ty:ty => $store:ident),+ $(,)?) => {$(
        impl SizedIndex<$ty> for Index {
            fn size(&self, namespace: &str) -> usize {
                self.$store.len_in(namespace)
            }
        }
    )+};
}

sized_index!(
    k8s::Namespace => namespaces,
    k8s::Pod => pods,
    k8s::Service => services,
    k8s::Endpoints => endpoints,
    k8s::Secret => secrets,
    VirtualMachine => virtual_machines,
    TrafficSplit => traffic_splits,
    HttpRouteGroup => http_route_groups,
    TcpRoute => tcp_routes,
    TrafficTarget => traffic_targets,
    AccessControl => access_controls,
    AccessCert => access_certs,
    IngressBackend => ingress_backends,
    Egress => egresses,
    EgressGateway => egress_gateways,
    Retry => retries,
    UpstreamTrafficSetting => upstream_traffic_settings,
    Isolation => isolations,
    TrafficWarmup => traffic_warmups,
    Plugin => plugins,
    PluginChain => plugin_chains,
    PluginConfig => plugin_configs,
    ServiceImport => service_imports,
    ServiceExport => service_exports,
    GlobalTrafficPolicy => global_traffic_policies,
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        tests::{mk_isolation, mk_service},
        ClusterInfo,
    };
    use fsm_mesh_controller_core::{broker::Broker, status::StatusSink};
    use prometheus_client::encoding::text::encode;

    fn mk_metrics(prom: &mut Registry) -> IndexMetrics {
        let index = Index::shared(
            Arc::new(ClusterInfo::default()),
            Arc::new(Broker::new()),
            Arc::new(StatusSink::disabled()),
        );
        IndexMetrics::register(index, prom)
    }

    fn render(prom: &Registry) -> String {
        let mut out = String::new();
        encode(&mut out, prom).expect("metrics must encode");
        out
    }

    #[test]
    fn records_namespaced_sizes() {
        let mut prom = Registry::default();
        let mut metrics = mk_metrics(&mut prom);

        IndexNamespacedResource::apply(&mut metrics, mk_service("ns", "a", &[("http", 80, 8080)]));
        IndexNamespacedResource::apply(&mut metrics, mk_service("ns", "b", &[("http", 80, 8080)]));
        let text = render(&prom);
        assert!(text.contains(r#"index_size{namespace="ns",kind="Service"} 2"#), "{text}");
        assert!(text.contains(r#"index_applies_total{namespace="ns",kind="Service"} 2"#), "{text}");

        IndexNamespacedResource::<k8s::Service>::delete(&mut metrics, "ns".to_string(), "a".to_string());
        let text = render(&prom);
        assert!(text.contains(r#"index_size{namespace="ns",kind="Service"} 1"#), "{text}");
        assert!(text.contains(r#"index_deletes_total{namespace="ns",kind="Service"} 1"#), "{text}");
    }

    #[test]
    fn records_cluster_sizes() {
        let mut prom = Registry::default();
        let mut metrics = mk_metrics(&mut prom);

        IndexClusterResource::apply(&mut metrics, mk_isolation("lab", &["10.9.0.0/16"]));
        let text = render(&prom);
        assert!(text.contains(r#"index_size{namespace="",kind="Isolation"} 1"#), "{text}");
    }
}
