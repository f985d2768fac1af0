use super::{port_protocol, Provider};
use crate::Index;
use fsm_mesh_controller_core::{endpoint::LbType, Endpoint, MeshService, ServiceIdentity};
use fsm_mesh_controller_k8s_api::{
    multicluster::{GlobalTrafficPolicy, ImportedPort, ServiceImport},
    ResourceExt,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
};

const ANY_SERVICE_ACCOUNT: &str = "*";

/// Projects `ServiceImport`s, the services peer clusters export to this one.
pub(crate) struct MulticlusterProvider<'i> {
    index: &'i Index,
}

// === impl MulticlusterProvider ===

impl<'i> MulticlusterProvider<'i> {
    pub(crate) fn new(index: &'i Index) -> Self {
        Self { index }
    }

    fn import(&self, svc: &MeshService) -> Option<&'i ServiceImport> {
        self.index
            .service_imports
            .get(&svc.namespace, svc.provider_name())
    }

    fn global_traffic_policy(&self, namespace: &str, name: &str) -> Option<&'i GlobalTrafficPolicy> {
        self.index.global_traffic_policies.get(namespace, name)
    }

    /// The load balancing mode peer endpoints of the service participate in. Services without a
    /// global traffic policy are served locally.
    pub(crate) fn lb_type(&self, namespace: &str, name: &str) -> LbType {
        let Some(gtp) = self.global_traffic_policy(namespace, name) else {
            return LbType::Locality;
        };
        match gtp.spec.lb_type.parse() {
            Ok(lb) => lb,
            Err(error) => {
                tracing::warn!(%error, %namespace, %name, "Treating unknown load balancer type as Locality");
                LbType::Locality
            }
        }
    }

    /// Whether peer clusters contribute endpoints to the service.
    pub(crate) fn is_multicluster_service(&self, svc: &MeshService) -> bool {
        self.import(svc).is_some()
            && self.lb_type(&svc.namespace, svc.provider_name()) != LbType::Locality
    }

    /// The weight of the service's peer endpoints: the summed target weights when active-active.
    pub(crate) fn lb_weight(&self, svc: &MeshService) -> u32 {
        let Some(gtp) = self.global_traffic_policy(&svc.namespace, svc.provider_name()) else {
            return 0;
        };
        gtp.spec.targets.iter().filter_map(|t| t.weight).sum()
    }

    /// Peer target ports of a service port, each flagged as active-active (`true`) or failover.
    pub(crate) fn target_ports_for_service_port(
        &self,
        namespace: &str,
        name: &str,
        port: u16,
    ) -> BTreeMap<u16, bool> {
        let active_active = match self.lb_type(namespace, name) {
            LbType::Locality => return BTreeMap::new(),
            LbType::ActiveActive => true,
            LbType::FailOver => false,
        };
        let Some(import) = self.index.service_imports.get(namespace, name) else {
            return BTreeMap::new();
        };
        import
            .spec
            .ports
            .iter()
            .filter(|p| p.port == port)
            .flat_map(|p| p.endpoints.iter().map(|ep| (ep.target.port, active_active)))
            .collect()
    }

    fn import_to_mesh_services(import: &ServiceImport) -> Vec<MeshService> {
        let namespace = import.namespace().unwrap_or_default();
        let name = import.name_unchecked();
        let mut services = Vec::new();
        for port in &import.spec.ports {
            let protocol = imported_protocol(port);
            let target_ports = port
                .endpoints
                .iter()
                .map(|ep| ep.target.port)
                .collect::<BTreeSet<_>>();
            services.extend(target_ports.into_iter().map(|target_port| MeshService {
                namespace: namespace.clone(),
                name: name.clone(),
                port: port.port,
                target_port,
                protocol: protocol.clone(),
                cloud_attached_to: String::new(),
            }));
        }
        services
    }

    fn imports_for_identity<'a>(
        &'a self,
        id: &'a ServiceIdentity,
    ) -> impl Iterator<Item = &'a ServiceImport> + 'a {
        self.index
            .service_imports
            .in_namespace(id.namespace())
            .filter(move |import| {
                let sa = import.spec.service_account_name.as_str();
                sa == ANY_SERVICE_ACCOUNT || sa == id.name()
            })
    }
}

impl Provider for MulticlusterProvider<'_> {
    fn id(&self) -> &'static str {
        "multicluster"
    }

    fn list_services(&self) -> Vec<MeshService> {
        self.index
            .service_imports
            .iter()
            .flat_map(Self::import_to_mesh_services)
            .collect()
    }

    fn list_services_for_identity(&self, id: &ServiceIdentity) -> Vec<MeshService> {
        self.imports_for_identity(id)
            .flat_map(Self::import_to_mesh_services)
            .collect()
    }

    fn list_service_identities_for_service(&self, svc: &MeshService) -> Vec<ServiceIdentity> {
        match self.import(svc) {
            Some(import) if !import.spec.service_account_name.is_empty() => vec![
                ServiceIdentity::new(&import.spec.service_account_name, &svc.namespace),
            ],
            _ => Vec::new(),
        }
    }

    fn list_endpoints_for_service(&self, svc: &MeshService) -> Vec<Endpoint> {
        let Some(import) = self.import(svc) else {
            return Vec::new();
        };
        let lb_type = self.lb_type(&svc.namespace, svc.provider_name());
        if lb_type == LbType::Locality {
            return Vec::new();
        }
        let targets = self
            .global_traffic_policy(&svc.namespace, svc.provider_name())
            .map(|gtp| {
                gtp.spec
                    .targets
                    .iter()
                    .map(|t| (t.cluster_key.as_str(), t.weight.unwrap_or_default()))
                    .collect::<BTreeMap<_, _>>()
            })
            .unwrap_or_default();

        let mut endpoints = Vec::new();
        for port in import.spec.ports.iter().filter(|p| p.port == svc.port) {
            for imported in &port.endpoints {
                if svc.target_port != 0 && imported.target.port != svc.target_port {
                    continue;
                }
                let weight = match targets.get(imported.cluster_key.as_str()) {
                    Some(weight) => *weight,
                    None if targets.is_empty() => 0,
                    None => continue,
                };
                let ip = match imported.target.ip.parse::<IpAddr>() {
                    Ok(ip) => ip,
                    Err(error) => {
                        tracing::warn!(%error, service = %svc, cluster = %imported.cluster_key, "Ignoring invalid imported endpoint");
                        continue;
                    }
                };
                let mut ep = Endpoint::new(ip, imported.target.port);
                ep.app_protocol = imported_protocol(port);
                ep.cluster_key = imported.cluster_key.clone();
                ep.lb_type = Some(lb_type);
                ep.weight = weight;
                ep.path = imported.target.path.clone();
                endpoints.push(ep);
            }
        }
        endpoints
    }

    fn list_endpoints_for_identity(&self, id: &ServiceIdentity) -> Vec<Endpoint> {
        let mut endpoints = Vec::new();
        for import in self.imports_for_identity(id) {
            for port in &import.spec.ports {
                for imported in &port.endpoints {
                    if let Ok(ip) = imported.target.ip.parse::<IpAddr>() {
                        let mut ep = Endpoint::new(ip, imported.target.port);
                        ep.cluster_key = imported.cluster_key.clone();
                        endpoints.push(ep);
                    }
                }
            }
        }
        endpoints
    }

    fn get_resolvable_endpoints_for_service(&self, svc: &MeshService) -> Vec<Endpoint> {
        let Some(import) = self.import(svc) else {
            return Vec::new();
        };
        let Some(ip) = import
            .spec
            .ips
            .first()
            .and_then(|ip| ip.parse::<IpAddr>().ok())
        else {
            return Vec::new();
        };
        import
            .spec
            .ports
            .iter()
            .map(|port| {
                let mut ep = Endpoint::new(ip, port.port);
                ep.cluster_key = self.id().to_string();
                ep
            })
            .collect()
    }
}

fn imported_protocol(port: &ImportedPort) -> String {
    port_protocol(&port.name, port.app_protocol.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{mk_global_traffic_policy, mk_index, mk_service_import};
    use pretty_assertions::assert_eq;

    fn svc(port: u16, target_port: u16) -> MeshService {
        MeshService {
            namespace: "ns".to_string(),
            name: "b".to_string(),
            port,
            target_port,
            protocol: "http".to_string(),
            cloud_attached_to: String::new(),
        }
    }

    #[test]
    fn imports_without_policies_are_local_only() {
        let mut index = mk_index();
        index.apply(mk_service_import(
            "ns",
            "b",
            80,
            &[("c1", "10.1.0.2", 8080), ("c2", "10.2.0.2", 8081)],
        ));

        let provider = MulticlusterProvider::new(&index);
        let svcs = provider.list_services();
        let ports = svcs.iter().map(|s| s.target_port).collect::<Vec<_>>();
        assert_eq!(ports, vec![8080, 8081]);
        assert!(provider.list_endpoints_for_service(&svc(80, 8080)).is_empty());
        assert!(provider.target_ports_for_service_port("ns", "b", 80).is_empty());
        assert!(!provider.is_multicluster_service(&svc(80, 8080)));
    }

    #[test]
    fn active_active_targets() {
        let mut index = mk_index();
        index.apply(mk_service_import(
            "ns",
            "b",
            80,
            &[("c1", "10.1.0.2", 8080), ("c2", "10.2.0.2", 8080)],
        ));
        index.apply(mk_global_traffic_policy(
            "ns",
            "b",
            "ActiveActive",
            &[("c1", Some(30))],
        ));

        let provider = MulticlusterProvider::new(&index);
        assert!(provider.is_multicluster_service(&svc(80, 8080)));
        assert_eq!(provider.lb_weight(&svc(80, 8080)), 30);
        assert_eq!(
            provider.target_ports_for_service_port("ns", "b", 80),
            maplit::btreemap! { 8080 => true }
        );

        let eps = provider.list_endpoints_for_service(&svc(80, 8080));
        assert_eq!(eps.len(), 1);
        assert_eq!(eps[0].cluster_key, "c1");
        assert_eq!(eps[0].weight, 30);
        assert_eq!(eps[0].lb_type, Some(LbType::ActiveActive));
        assert!(!eps[0].is_local());
    }

    #[test]
    fn failover_targets() {
        let mut index = mk_index();
        index.apply(mk_service_import("ns", "b", 80, &[("c1", "10.1.0.2", 8080)]));
        index.apply(mk_global_traffic_policy("ns", "b", "FailOver", &[]));

        let provider = MulticlusterProvider::new(&index);
        assert_eq!(
            provider.target_ports_for_service_port("ns", "b", 80),
            maplit::btreemap! { 8080 => false }
        );
        let eps = provider.list_endpoints_for_service(&svc(80, 8080));
        assert_eq!(eps.len(), 1);
        assert_eq!(eps[0].lb_type, Some(LbType::FailOver));
    }
}
