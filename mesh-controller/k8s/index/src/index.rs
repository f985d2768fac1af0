use crate::{catalog::Catalog, store::Store, validation, ClusterInfo, Configurator};
use fsm_mesh_controller_core::{
    broker::{Broker, EventKind, Message, PodRef, ResourceChange, ResourceKind},
    constants::SIDECAR_UNIQUE_ID_LABEL,
    status::{PolicyKind, PolicyRef, StatusSink, StatusUpdate},
};
use fsm_mesh_controller_k8s_api::{
    self as k8s,
    config::{MeshConfig, MeshConfigSpec},
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
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info_span;

pub type SharedIndex = Arc<RwLock<Index>>;

/// Secret keys that make a secret usable as certificate material.
const CERT_SECRET_KEYS: [&str; 3] = ["ca.crt", "tls.crt", "tls.key"];

/// A snapshot of all resources watched by the controller.
#[derive(Debug)]
pub struct Index {
    cluster_info: Arc<ClusterInfo>,
    broker: Arc<Broker>,
    status: Arc<StatusSink>,
    mesh_config: Arc<MeshConfigSpec>,

    pub(crate) namespaces: Store<k8s::Namespace>,
    pub(crate) pods: Store<k8s::Pod>,
    pub(crate) services: Store<k8s::Service>,
    pub(crate) endpoints: Store<k8s::Endpoints>,
    pub(crate) secrets: Store<k8s::Secret>,
    pub(crate) virtual_machines: Store<VirtualMachine>,

    pub(crate) traffic_splits: Store<TrafficSplit>,
    pub(crate) http_route_groups: Store<HttpRouteGroup>,
    pub(crate) tcp_routes: Store<TcpRoute>,
    pub(crate) traffic_targets: Store<TrafficTarget>,

    pub(crate) access_controls: Store<AccessControl>,
    pub(crate) access_certs: Store<AccessCert>,
    pub(crate) ingress_backends: Store<IngressBackend>,
    pub(crate) egresses: Store<Egress>,
    pub(crate) egress_gateways: Store<EgressGateway>,
    pub(crate) retries: Store<Retry>,
    pub(crate) upstream_traffic_settings: Store<UpstreamTrafficSetting>,
    pub(crate) isolations: Store<Isolation>,
    pub(crate) traffic_warmups: Store<TrafficWarmup>,

    pub(crate) plugins: Store<Plugin>,
    pub(crate) plugin_chains: Store<PluginChain>,
    pub(crate) plugin_configs: Store<PluginConfig>,

    pub(crate) service_imports: Store<ServiceImport>,
    pub(crate) service_exports: Store<ServiceExport>,
    pub(crate) global_traffic_policies: Store<GlobalTrafficPolicy>,
}

/// A resource kind held in one of the index's stores.
pub trait Indexed: kube::Resource<DynamicType = ()> + Sized {
    const KIND: ResourceKind;

    /// Set for policies that carry a `{currentStatus, reason}` status.
    const POLICY: Option<PolicyKind> = None;

    /// Whether an accepted policy is marked committed as soon as it is indexed. Policies that
    /// are only known to be valid once compiled against a service are committed by the catalog.
    const COMMIT_ON_APPLY: bool = true;

    fn store_mut(index: &mut Index) -> &mut Store<Self>;

    fn validate(&self, _index: &Index) -> Result<(), validation::Error> {
        Ok(())
    }
}

// === impl Index ===

impl Index {
    pub fn new(cluster_info: Arc<ClusterInfo>, broker: Arc<Broker>, status: Arc<StatusSink>) -> Self {
        Self {
            cluster_info,
            broker,
            status,
            mesh_config: Default::default(),
            namespaces: Store::default(),
            pods: Store::default(),
            services: Store::default(),
            endpoints: Store::default(),
            secrets: Store::default(),
            virtual_machines: Store::default(),
            traffic_splits: Store::default(),
            http_route_groups: Store::default(),
            tcp_routes: Store::default(),
            traffic_targets: Store::default(),
            access_controls: Store::default(),
            access_certs: Store::default(),
            ingress_backends: Store::default(),
            egresses: Store::default(),
            egress_gateways: Store::default(),
            retries: Store::default(),
            upstream_traffic_settings: Store::default(),
            isolations: Store::default(),
            traffic_warmups: Store::default(),
            plugins: Store::default(),
            plugin_chains: Store::default(),
            plugin_configs: Store::default(),
            service_imports: Store::default(),
            service_exports: Store::default(),
            global_traffic_policies: Store::default(),
        }
    }

    pub fn shared(
        cluster_info: Arc<ClusterInfo>,
        broker: Arc<Broker>,
        status: Arc<StatusSink>,
    ) -> SharedIndex {
        Arc::new(RwLock::new(Self::new(cluster_info, broker, status)))
    }

    pub fn cluster_info(&self) -> &Arc<ClusterInfo> {
        &self.cluster_info
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn status(&self) -> &StatusSink {
        &self.status
    }

    pub fn configurator(&self) -> Configurator {
        Configurator::new(self.mesh_config.clone(), self.cluster_info.clone())
    }

    /// Borrows the index to answer policy queries.
    pub fn catalog(&self) -> Catalog<'_> {
        Catalog::new(self)
    }

    fn is_mesh_config(&self, namespace: &str, name: &str) -> bool {
        namespace == self.cluster_info.fsm_namespace && name == self.cluster_info.mesh_config_name
    }

    fn apply_resource<T: Indexed>(&mut self, resource: T) {
        let namespace = resource.namespace().unwrap_or_default();
        let name = resource.name_unchecked();
        let _span = info_span!("apply", kind = %T::KIND, ns = %namespace, %name).entered();

        if let Err(error) = resource.validate(self) {
            tracing::warn!(%error, "Ignoring invalid resource");
            if let Some(kind) = T::POLICY {
                self.status.send(StatusUpdate::error(
                    policy_ref(kind, &namespace, &name),
                    error.to_string(),
                ));
            }
            if T::store_mut(self).remove(&namespace, &name).is_some() {
                self.announce(T::KIND, EventKind::Deleted, &namespace, &name);
            }
            return;
        }

        let Some(event) = T::store_mut(self).insert(resource) else {
            tracing::trace!("Resource unchanged");
            return;
        };
        tracing::debug!(?event, "Indexed");

        if let Some(kind) = T::POLICY.filter(|_| T::COMMIT_ON_APPLY) {
            self.status
                .send(StatusUpdate::committed(policy_ref(kind, &namespace, &name)));
        }
        self.announce(T::KIND, event, &namespace, &name);
    }

    fn delete_resource<T: Indexed>(&mut self, namespace: &str, name: &str) {
        let _span = info_span!("delete", kind = %T::KIND, ns = %namespace, %name).entered();

        if T::store_mut(self).remove(namespace, name).is_none() {
            tracing::debug!("Resource already deleted");
            return;
        }
        if let Some(kind) = T::POLICY {
            self.status.forget(&policy_ref(kind, namespace, name));
        }
        self.announce(T::KIND, EventKind::Deleted, namespace, name);
    }

    /// Pods and virtual machines notify their own proxy of updates. Additions and deletions
    /// also change the addresses other proxies admit, so they are broadcast as well.
    fn apply_workload<T: Indexed>(&mut self, workload: T) {
        let namespace = workload.namespace().unwrap_or_default();
        let name = workload.name_unchecked();
        let uuid = workload.labels().get(SIDECAR_UNIQUE_ID_LABEL).cloned();
        let _span = info_span!("apply", kind = %T::KIND, ns = %namespace, %name).entered();

        let Some(event) = T::store_mut(self).insert(workload) else {
            return;
        };
        let change = ResourceChange::new(T::KIND, event, Some(&namespace), &name);
        match (event, uuid) {
            (EventKind::Updated, Some(uuid)) => {
                self.broker.publish(Message::Proxy { uuid, change });
            }
            (EventKind::Updated, None) => {}
            (_, uuid) => {
                if let Some(uuid) = uuid {
                    self.broker.publish(Message::PodAdded(PodRef {
                        namespace: namespace.clone(),
                        name: name.clone(),
                        uuid,
                    }));
                }
                self.broker.publish(Message::ProxyUpdate(change));
            }
        }
    }

    fn delete_workload<T: Indexed>(&mut self, namespace: &str, name: &str) {
        let _span = info_span!("delete", kind = %T::KIND, ns = %namespace, %name).entered();

        let Some(workload) = T::store_mut(self).remove(namespace, name) else {
            return;
        };
        if let Some(uuid) = workload.labels().get(SIDECAR_UNIQUE_ID_LABEL) {
            self.broker.publish(Message::PodDeleted(PodRef {
                namespace: namespace.to_string(),
                name: name.to_string(),
                uuid: uuid.clone(),
            }));
        }
        self.broker.publish(Message::ProxyUpdate(ResourceChange::new(
            T::KIND,
            EventKind::Deleted,
            Some(namespace),
            name,
        )));
    }

    fn announce(&self, kind: ResourceKind, event: EventKind, namespace: &str, name: &str) {
        let namespace = Some(namespace).filter(|ns| !ns.is_empty());
        let change = ResourceChange::new(kind, event, namespace, name);
        if kind.is_plugin() {
            self.broker
                .publish(Message::PolicyKindChanged(change.clone()));
        }
        self.broker.publish(Message::ProxyUpdate(change));
    }
}

#[cfg(test)]
impl Index {
    /// Indexes a resource without the workload notifications of its watch.
    pub(crate) fn apply<T: Indexed>(&mut self, resource: T) {
        self.apply_resource(resource)
    }

    pub(crate) fn set_mesh_config(&mut self, spec: MeshConfigSpec) {
        self.mesh_config = Arc::new(spec);
    }
}

fn policy_ref(kind: PolicyKind, namespace: &str, name: &str) -> PolicyRef {
    if namespace.is_empty() {
        PolicyRef::cluster(kind, name)
    } else {
        PolicyRef::namespaced(kind, namespace, name)
    }
}

fn is_cert_secret(secret: &k8s::Secret) -> bool {
    secret
        .data
        .as_ref()
        .is_some_and(|data| CERT_SECRET_KEYS.iter().any(|k| data.contains_key(*k)))
}

macro_rules! index_namespaced {
    ($($ty:ty),+ $(,)?) => {$(
        impl kubert::index::IndexNamespacedResource<$ty> for Index {
            fn apply(&mut self, resource: $ty) {
                self.apply_resource(resource)
            }

            fn delete(&mut self, namespace: String, name: String) {
                self.delete_resource::<$ty>(&namespace, &name)
            }
        }
    )+};
}

index_namespaced!(
    k8s::Service,
    k8s::Endpoints,
    TrafficSplit,
    HttpRouteGroup,
    TcpRoute,
    TrafficTarget,
    AccessControl,
    AccessCert,
    IngressBackend,
    Egress,
    EgressGateway,
    Retry,
    UpstreamTrafficSetting,
    TrafficWarmup,
    PluginChain,
    PluginConfig,
    ServiceImport,
    ServiceExport,
    GlobalTrafficPolicy,
);

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Index {
    fn apply(&mut self, pod: k8s::Pod) {
        self.apply_workload(pod)
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_workload::<k8s::Pod>(&namespace, &name)
    }
}

impl kubert::index::IndexNamespacedResource<VirtualMachine> for Index {
    fn apply(&mut self, vm: VirtualMachine) {
        self.apply_workload(vm)
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_workload::<VirtualMachine>(&namespace, &name)
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Secret> for Index {
    fn apply(&mut self, secret: k8s::Secret) {
        if is_cert_secret(&secret) {
            return self.apply_resource(secret);
        }
        // A secret that no longer holds certificate material is forgotten.
        let namespace = secret.namespace().unwrap_or_default();
        self.delete_resource::<k8s::Secret>(&namespace, &secret.name_unchecked());
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_resource::<k8s::Secret>(&namespace, &name)
    }
}

impl kubert::index::IndexNamespacedResource<MeshConfig> for Index {
    fn apply(&mut self, mesh_config: MeshConfig) {
        let namespace = mesh_config.namespace().unwrap_or_default();
        let name = mesh_config.name_unchecked();
        if !self.is_mesh_config(&namespace, &name) {
            tracing::debug!(ns = %namespace, %name, "Ignoring unrelated MeshConfig");
            return;
        }
        if *self.mesh_config == mesh_config.spec {
            return;
        }

        tracing::info!(ns = %namespace, %name, "MeshConfig updated");
        self.mesh_config = Arc::new(mesh_config.spec);
        self.announce(ResourceKind::MeshConfig, EventKind::Updated, &namespace, &name);
    }

    fn delete(&mut self, namespace: String, name: String) {
        if !self.is_mesh_config(&namespace, &name) {
            return;
        }
        tracing::warn!(ns = %namespace, %name, "MeshConfig deleted; using defaults");
        self.mesh_config = Default::default();
        self.announce(ResourceKind::MeshConfig, EventKind::Deleted, &namespace, &name);
    }
}

impl kubert::index::IndexClusterResource<k8s::Namespace> for Index {
    fn apply(&mut self, ns: k8s::Namespace) {
        self.apply_resource(ns)
    }

    fn delete(&mut self, name: String) {
        self.delete_resource::<k8s::Namespace>("", &name)
    }
}

impl kubert::index::IndexClusterResource<Isolation> for Index {
    fn apply(&mut self, isolation: Isolation) {
        self.apply_resource(isolation)
    }

    fn delete(&mut self, name: String) {
        self.delete_resource::<Isolation>("", &name)
    }
}

impl kubert::index::IndexClusterResource<Plugin> for Index {
    fn apply(&mut self, plugin: Plugin) {
        self.apply_resource(plugin)
    }

    fn delete(&mut self, name: String) {
        self.delete_resource::<Plugin>("", &name)
    }
}

// === impl Indexed ===

impl Indexed for k8s::Namespace {
    const KIND: ResourceKind = ResourceKind::Namespace;

    fn store_mut(index: &mut Index) -> &mut Store<Self> {
        &mut index.namespaces
    }
}

impl Indexed for k8s::Pod {
    const KIND: ResourceKind = ResourceKind::Pod;

    fn store_mut(index: &mut Index) -> &mut Store<Self> {
        &mut index.pods
    }
}

impl Indexed for VirtualMachine {
    const KIND: ResourceKind = ResourceKind::VirtualMachine;

    fn store_mut(index: &mut Index) -> &mut Store<Self> {
        &mut index.virtual_machines
    }
}

impl Indexed for k8s::Service {
    const KIND: ResourceKind = ResourceKind::Service;

    fn store_mut(index: &mut Index) -> &mut Store<Self> {
        &mut index.services
    }
}

impl Indexed for k8s::Endpoints {
    const KIND: ResourceKind = ResourceKind::Endpoints;

    fn store_mut(index: &mut Index) -> &mut Store<Self> {
        &mut index.endpoints
    }
}

impl Indexed for k8s::Secret {
    const KIND: ResourceKind = ResourceKind::Secret;

    fn store_mut(index: &mut Index) -> &mut Store<Self> {
        &mut index.secrets
    }
}

impl Indexed for TrafficSplit {
    const KIND: ResourceKind = ResourceKind::TrafficSplit;

    fn store_mut(index: &mut Index) -> &mut Store<Self> {
        &mut index.traffic_splits
    }
}

impl Indexed for HttpRouteGroup {
    const KIND: ResourceKind = ResourceKind::HttpRouteGroup;

    fn store_mut(index: &mut Index) -> &mut Store<Self> {
        &mut index.http_route_groups
    }
}

impl Indexed for TcpRoute {
    const KIND: ResourceKind = ResourceKind::TcpRoute;

    fn store_mut(index: &mut Index) -> &mut Store<Self> {
        &mut index.tcp_routes
    }
}

impl Indexed for TrafficTarget {
    const KIND: ResourceKind = ResourceKind::TrafficTarget;

    fn store_mut(index: &mut Index) -> &mut Store<Self> {
        &mut index.traffic_targets
    }

    fn validate(&self, _: &Index) -> Result<(), validation::Error> {
        validation::traffic_target(self)
    }
}

impl Indexed for AccessControl {
    const KIND: ResourceKind = ResourceKind::AccessControl;
    const POLICY: Option<PolicyKind> = Some(PolicyKind::AccessControl);
    const COMMIT_ON_APPLY: bool = false;

    fn store_mut(index: &mut Index) -> &mut Store<Self> {
        &mut index.access_controls
    }

    fn validate(&self, index: &Index) -> Result<(), validation::Error> {
        validation::access_control(index, self)
    }
}

impl Indexed for AccessCert {
    const KIND: ResourceKind = ResourceKind::AccessCert;
    const POLICY: Option<PolicyKind> = Some(PolicyKind::AccessCert);

    fn store_mut(index: &mut Index) -> &mut Store<Self> {
        &mut index.access_certs
    }
}

impl Indexed for IngressBackend {
    const KIND: ResourceKind = ResourceKind::IngressBackend;
    const POLICY: Option<PolicyKind> = Some(PolicyKind::IngressBackend);
    const COMMIT_ON_APPLY: bool = false;

    fn store_mut(index: &mut Index) -> &mut Store<Self> {
        &mut index.ingress_backends
    }

    fn validate(&self, index: &Index) -> Result<(), validation::Error> {
        validation::ingress_backend(index, self)
    }
}

impl Indexed for Egress {
    const KIND: ResourceKind = ResourceKind::Egress;
    const POLICY: Option<PolicyKind> = Some(PolicyKind::Egress);

    fn store_mut(index: &mut Index) -> &mut Store<Self> {
        &mut index.egresses
    }

    fn validate(&self, _: &Index) -> Result<(), validation::Error> {
        validation::egress(self)
    }
}

impl Indexed for EgressGateway {
    const KIND: ResourceKind = ResourceKind::EgressGateway;
    const POLICY: Option<PolicyKind> = Some(PolicyKind::EgressGateway);

    fn store_mut(index: &mut Index) -> &mut Store<Self> {
        &mut index.egress_gateways
    }

    fn validate(&self, index: &Index) -> Result<(), validation::Error> {
        validation::egress_gateway(index, self)
    }
}

impl Indexed for Retry {
    const KIND: ResourceKind = ResourceKind::Retry;
    const POLICY: Option<PolicyKind> = Some(PolicyKind::Retry);

    fn store_mut(index: &mut Index) -> &mut Store<Self> {
        &mut index.retries
    }
}

impl Indexed for UpstreamTrafficSetting {
    const KIND: ResourceKind = ResourceKind::UpstreamTrafficSetting;
    const POLICY: Option<PolicyKind> = Some(PolicyKind::UpstreamTrafficSetting);

    fn store_mut(index: &mut Index) -> &mut Store<Self> {
        &mut index.upstream_traffic_settings
    }

    fn validate(&self, index: &Index) -> Result<(), validation::Error> {
        validation::upstream_traffic_setting(index, self)
    }
}

impl Indexed for Isolation {
    const KIND: ResourceKind = ResourceKind::Isolation;
    const POLICY: Option<PolicyKind> = Some(PolicyKind::Isolation);

    fn store_mut(index: &mut Index) -> &mut Store<Self> {
        &mut index.isolations
    }
}

impl Indexed for TrafficWarmup {
    const KIND: ResourceKind = ResourceKind::TrafficWarmup;
    const POLICY: Option<PolicyKind> = Some(PolicyKind::TrafficWarmup);

    fn store_mut(index: &mut Index) -> &mut Store<Self> {
        &mut index.traffic_warmups
    }
}

impl Indexed for Plugin {
    const KIND: ResourceKind = ResourceKind::Plugin;
    const POLICY: Option<PolicyKind> = Some(PolicyKind::Plugin);

    fn store_mut(index: &mut Index) -> &mut Store<Self> {
        &mut index.plugins
    }

    fn validate(&self, _: &Index) -> Result<(), validation::Error> {
        validation::plugin(self)
    }
}

impl Indexed for PluginChain {
    const KIND: ResourceKind = ResourceKind::PluginChain;
    const POLICY: Option<PolicyKind> = Some(PolicyKind::PluginChain);

    fn store_mut(index: &mut Index) -> &mut Store<Self> {
        &mut index.plugin_chains
    }
}

impl Indexed for PluginConfig {
    const KIND: ResourceKind = ResourceKind::PluginConfig;
    const POLICY: Option<PolicyKind> = Some(PolicyKind::PluginConfig);

    fn store_mut(index: &mut Index) -> &mut Store<Self> {
        &mut index.plugin_configs
    }
}

impl Indexed for ServiceImport {
    const KIND: ResourceKind = ResourceKind::ServiceImport;

    fn store_mut(index: &mut Index) -> &mut Store<Self> {
        &mut index.service_imports
    }
}

impl Indexed for ServiceExport {
    const KIND: ResourceKind = ResourceKind::ServiceExport;

    fn store_mut(index: &mut Index) -> &mut Store<Self> {
        &mut index.service_exports
    }
}

impl Indexed for GlobalTrafficPolicy {
    const KIND: ResourceKind = ResourceKind::GlobalTrafficPolicy;

    fn store_mut(index: &mut Index) -> &mut Store<Self> {
        &mut index.global_traffic_policies
    }
}
