//! Policy queries over an index snapshot.
//!
//! A [`Catalog`] borrows the [`Index`] for the duration of one proxy build and compiles the
//! resources it holds into the traffic policy types of
//! [`fsm_mesh_controller_core::trafficpolicy`]. The catalog holds no state of its own; every
//! query reads the snapshot it was created from.

mod egress;
mod inbound;
mod ingress;
mod outbound;
mod plugin;
mod settings;
mod workload;

#[cfg(test)]
mod tests;

pub use self::{
    plugin::{PluginChainEntry, PluginConfigEntry, PluginScript},
    workload::{Workload, WorkloadKind},
};

use crate::{
    provider::{KubeProvider, MulticlusterProvider, Provider},
    ClusterInfo, Configurator, Index, IsolationFilter,
};
use fsm_mesh_controller_core::{
    identity::ServiceAccount,
    trafficpolicy::{HttpRouteMatch, PathMatchType},
    Endpoint, IpNet, MeshService, ServiceIdentity,
};
use fsm_mesh_controller_k8s_api::{
    config::ServiceAccessMode,
    smi::{HttpMatch, IdentityBinding, TrafficTarget},
};
use std::collections::{BTreeMap, BTreeSet};

const SERVICE_ACCOUNT_KIND: &str = "ServiceAccount";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("endpoints not found for service {0}")]
    EndpointsNotFound(String),

    #[error("secret {namespace}/{name} not found")]
    SecretNotFound { namespace: String, name: String },

    #[error("secret {namespace}/{name} is missing key {key}")]
    SecretKeyMissing {
        namespace: String,
        name: String,
        key: &'static str,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Read-only policy queries over a borrowed index.
pub struct Catalog<'i> {
    index: &'i Index,
    config: Configurator,
    isolation: IsolationFilter,
    kube: KubeProvider<'i>,
    multicluster: MulticlusterProvider<'i>,
}

// === impl Catalog ===

impl<'i> Catalog<'i> {
    pub(crate) fn new(index: &'i Index) -> Self {
        Self {
            config: index.configurator(),
            isolation: IsolationFilter::from_index(index),
            kube: KubeProvider::new(index),
            multicluster: MulticlusterProvider::new(index),
            index,
        }
    }

    pub fn configurator(&self) -> &Configurator {
        &self.config
    }

    pub fn cluster_info(&self) -> &ClusterInfo {
        self.index.cluster_info()
    }

    pub fn trust_domain(&self) -> &str {
        self.config.trust_domain()
    }

    pub fn isolation(&self) -> &IsolationFilter {
        &self.isolation
    }

    /// All CIDRs of Isolation resources. Invalid CIDRs are logged and skipped.
    pub fn get_isolation_cidrs(&self) -> Vec<IpNet> {
        self.isolation.cidrs().to_vec()
    }

    pub fn is_monitored_namespace(&self, namespace: &str) -> bool {
        self.kube.is_monitored_namespace(namespace)
    }

    fn providers(&self) -> [&dyn Provider; 2] {
        [&self.kube, &self.multicluster]
    }

    /// Collects the results of every provider, without duplicates.
    fn collect<T: Ord>(&self, f: impl Fn(&dyn Provider) -> Vec<T>) -> Vec<T> {
        self.providers()
            .into_iter()
            .flat_map(f)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Concatenates provider endpoints, dropping isolated addresses.
    fn endpoints(&self, f: impl Fn(&dyn Provider) -> Vec<Endpoint>) -> Vec<Endpoint> {
        let mut endpoints = Vec::new();
        for provider in self.providers() {
            let eps = f(provider);
            if eps.is_empty() {
                tracing::trace!(provider = provider.id(), "No endpoints");
                continue;
            }
            endpoints.extend(eps);
        }
        self.isolation.retain(&mut endpoints);
        endpoints
    }

    pub fn list_services(&self) -> Vec<MeshService> {
        self.collect(|p| p.list_services())
    }

    pub fn list_services_for_identity(&self, id: &ServiceIdentity) -> Vec<MeshService> {
        self.collect(|p| p.list_services_for_identity(id))
    }

    pub fn list_service_identities_for_service(&self, svc: &MeshService) -> Vec<ServiceIdentity> {
        self.collect(|p| p.list_service_identities_for_service(svc))
    }

    pub fn list_endpoints_for_service(&self, svc: &MeshService) -> Vec<Endpoint> {
        self.endpoints(|p| p.list_endpoints_for_service(svc))
    }

    pub fn list_endpoints_for_identity(&self, id: &ServiceIdentity) -> Vec<Endpoint> {
        self.endpoints(|p| p.list_endpoints_for_identity(id))
    }

    pub fn get_resolvable_endpoints_for_service(&self, svc: &MeshService) -> Vec<Endpoint> {
        self.endpoints(|p| p.get_resolvable_endpoints_for_service(svc))
    }

    /// The upstream services an identity may initiate connections to.
    pub fn list_outbound_services_for_identity(&self, id: &ServiceIdentity) -> Vec<MeshService> {
        if self.config.is_permissive_traffic_policy_mode() {
            return self.list_services();
        }
        let mut services = BTreeSet::new();
        for dst in self.list_outbound_service_identities(id) {
            services.extend(self.list_services_for_identity(&dst));
        }
        services.into_iter().collect()
    }

    /// Identities an identity is allowed to call through SMI TrafficTargets.
    pub fn list_outbound_service_identities(&self, id: &ServiceIdentity) -> Vec<ServiceIdentity> {
        self.index
            .traffic_targets
            .iter()
            .filter(|tt| tt.spec.sources.iter().any(|src| binds(src, id)))
            .map(|tt| binding_identity(&tt.spec.destination))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Identities allowed to call the given identity through SMI TrafficTargets.
    pub fn list_inbound_service_identities(&self, id: &ServiceIdentity) -> Vec<ServiceIdentity> {
        self.inbound_traffic_targets(id)
            .flat_map(|tt| tt.spec.sources.iter().map(binding_identity))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn inbound_traffic_targets<'a>(
        &'a self,
        id: &'a ServiceIdentity,
    ) -> impl Iterator<Item = &'a TrafficTarget> + 'a {
        self.index
            .traffic_targets
            .in_namespace(id.namespace())
            .filter(move |tt| binds(&tt.spec.destination, id))
    }

    /// Endpoints of `svc` that `downstream` may connect to.
    pub fn list_allowed_upstream_endpoints_for_service(
        &self,
        downstream: &ServiceIdentity,
        svc: &MeshService,
    ) -> Vec<Endpoint> {
        let endpoints = self.list_endpoints_for_service(svc);
        if self.config.is_permissive_traffic_policy_mode() || endpoints.is_empty() {
            return endpoints;
        }

        let mut by_ip = BTreeMap::<_, Vec<&Endpoint>>::new();
        for ep in &endpoints {
            by_ip.entry(ep.ip).or_default().push(ep);
        }
        let mut allowed = Vec::new();
        for dst in self.list_outbound_service_identities(downstream) {
            for ep in self.list_endpoints_for_identity(&dst) {
                if let Some(eps) = by_ip.remove(&ep.ip) {
                    allowed.extend(eps.into_iter().cloned());
                }
            }
        }
        allowed
    }

    /// The HTTP hostnames a service is reachable by from a client. Clients in the service's own
    /// namespace may also use the short name.
    pub fn get_hostnames_for_service(&self, svc: &MeshService, local_namespace: bool) -> Vec<String> {
        let mode = self.config.service_access_mode();
        let mut hostnames = Vec::new();
        if matches!(mode, ServiceAccessMode::Domain | ServiceAccessMode::Mixed) {
            hostnames = self.domain_hostnames(svc, local_namespace);
        }
        if matches!(mode, ServiceAccessMode::Ip | ServiceAccessMode::Mixed) {
            let must_with_port = self.config.service_access_names().must_with_service_port;
            for ep in self.get_resolvable_endpoints_for_service(svc) {
                if !must_with_port {
                    hostnames.push(ep.ip.to_string());
                }
                hostnames.push(format!("{}:{}", ep.ip, svc.port));
            }
        }
        hostnames
    }

    pub(crate) fn domain_hostnames(&self, svc: &MeshService, local_namespace: bool) -> Vec<String> {
        let names = self.config.service_access_names();
        let mut hostnames = Vec::new();
        let mut push = |host: String| {
            if !names.must_with_service_port {
                hostnames.push(host.clone());
            }
            hostnames.push(format!("{host}:{}", svc.port));
        };

        if local_namespace && !names.must_with_namespace {
            push(svc.name.clone());
        }
        if !svc.cloud_attached_to.is_empty()
            && !names.cloud.as_ref().is_some_and(|cloud| cloud.with_namespace)
        {
            push(svc.name.clone());
            return hostnames;
        }

        push(format!("{}.{}", svc.name, svc.namespace));
        if names.with_trust_domain {
            let mut host = format!("{}.{}.svc", svc.name, svc.namespace);
            push(host.clone());
            for label in self.trust_domain().split('.').filter(|l| !l.is_empty()) {
                host = format!("{host}.{label}");
                push(host.clone());
            }
        }
        hostnames
    }
}

/// An HTTPRouteGroup match as a route match, with an empty path or method list matching all.
pub(super) fn route_match(m: &HttpMatch) -> HttpRouteMatch {
    HttpRouteMatch {
        path: m.path_regex.clone().unwrap_or_default(),
        path_match_type: PathMatchType::Regex,
        methods: m.methods.clone(),
        headers: m.headers.clone(),
    }
    .with_defaults()
}

fn binds(binding: &IdentityBinding, id: &ServiceIdentity) -> bool {
    (binding.kind.is_empty() || binding.kind == SERVICE_ACCOUNT_KIND)
        && binding.name == id.name()
        && binding.namespace == id.namespace()
}

fn binding_identity(binding: &IdentityBinding) -> ServiceIdentity {
    ServiceAccount::new(&binding.name, &binding.namespace).to_service_identity()
}
