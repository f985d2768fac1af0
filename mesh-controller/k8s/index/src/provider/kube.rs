use super::{port_protocol, Provider};
use crate::Index;
use fsm_mesh_controller_core::{
    constants::{CLOUD_ATTACHED_TO_ANNOTATION, CLOUD_MESH_ENDPOINT_ADDR_ANNOTATION, MONITOR_LABEL},
    Endpoint, MeshService, ServiceIdentity,
};
use fsm_mesh_controller_k8s_api::{
    self as k8s, config::ServiceAccessMode, machine::VirtualMachine, IntOrString, Labels,
    ResourceExt, Selector,
};
use std::{collections::BTreeSet, net::IpAddr};

const HEADLESS_CLUSTER_IP: &str = "None";
const DEFAULT_SERVICE_ACCOUNT: &str = "default";

/// Projects Kubernetes `Service`s, `Endpoints`, `Pod`s and `VirtualMachine`s.
pub(crate) struct KubeProvider<'i> {
    index: &'i Index,
    access_mode: ServiceAccessMode,
}

// === impl KubeProvider ===

impl<'i> KubeProvider<'i> {
    pub(crate) fn new(index: &'i Index) -> Self {
        Self {
            index,
            access_mode: index.configurator().service_access_mode(),
        }
    }

    /// A namespace is part of the mesh when it is labeled as monitored by this mesh.
    pub(crate) fn is_monitored_namespace(&self, namespace: &str) -> bool {
        let mesh_name = &self.index.cluster_info().mesh_name;
        self.index
            .namespaces
            .get("", namespace)
            .is_some_and(|ns| ns.labels().get(MONITOR_LABEL) == Some(mesh_name))
    }

    pub(crate) fn service(&self, svc: &MeshService) -> Option<&'i k8s::Service> {
        self.index.services.get(&svc.namespace, svc.provider_name())
    }

    /// Expands each port of a Kubernetes service into a mesh service. Headless services with
    /// hostnamed endpoints yield one mesh service per host.
    pub(crate) fn service_to_mesh_services(&self, svc: &k8s::Service) -> Vec<MeshService> {
        let namespace = svc.namespace().unwrap_or_default();
        let name = svc.name_unchecked();
        let cloud_attached_to = svc
            .annotations()
            .get(CLOUD_ATTACHED_TO_ANNOTATION)
            .cloned()
            .unwrap_or_default();
        let endpoints = self.index.endpoints.get(&namespace, &name);
        let Some(spec) = svc.spec.as_ref() else {
            return Vec::new();
        };

        let mut services = Vec::new();
        for port in spec.ports.iter().flatten() {
            let Ok(svc_port) = u16::try_from(port.port) else {
                continue;
            };
            let port_name = port.name.as_deref().unwrap_or_default();
            let target_port = endpoints
                .and_then(|eps| endpoints_target_port(eps, port_name))
                .unwrap_or_else(|| match &port.target_port {
                    None => svc_port,
                    Some(IntOrString::Int(tp)) => u16::try_from(*tp).unwrap_or_default(),
                    Some(IntOrString::String(_)) => 0,
                });
            let mesh_svc = MeshService {
                namespace: namespace.clone(),
                name: name.clone(),
                port: svc_port,
                target_port,
                protocol: port_protocol(port_name, port.app_protocol.as_deref()),
                cloud_attached_to: cloud_attached_to.clone(),
            };

            let hosts = match endpoints {
                Some(eps) if is_headless(svc) => endpoint_hostnames(eps),
                _ => BTreeSet::new(),
            };
            if hosts.is_empty() {
                services.push(mesh_svc);
            } else {
                services.extend(hosts.into_iter().map(|host| MeshService {
                    name: format!("{host}.{name}"),
                    ..mesh_svc.clone()
                }));
            }
        }
        services
    }

    /// The port endpoints of a service listen on for the given service port.
    pub(crate) fn target_port_for_service_port(
        &self,
        namespace: &str,
        name: &str,
        port: u16,
    ) -> Option<u16> {
        let svc = self.index.services.get(namespace, name)?;
        let svc_port = svc
            .spec
            .as_ref()?
            .ports
            .iter()
            .flatten()
            .find(|p| i32::from(port) == p.port)?;
        let port_name = svc_port.name.as_deref().unwrap_or_default();
        if let Some(tp) = self
            .index
            .endpoints
            .get(namespace, name)
            .and_then(|eps| endpoints_target_port(eps, port_name))
        {
            return Some(tp);
        }
        match &svc_port.target_port {
            None => Some(port),
            Some(IntOrString::Int(tp)) => u16::try_from(*tp).ok(),
            Some(IntOrString::String(_)) => None,
        }
    }

    fn pods_for_identity<'a>(
        &'a self,
        id: &'a ServiceIdentity,
    ) -> impl Iterator<Item = &'a k8s::Pod> + 'a {
        self.index
            .pods
            .in_namespace(id.namespace())
            .filter(move |pod| pod_service_account(pod) == id.name())
    }

    fn machines_for_identity<'a>(
        &'a self,
        id: &'a ServiceIdentity,
    ) -> impl Iterator<Item = &'a VirtualMachine> + 'a {
        self.index
            .virtual_machines
            .in_namespace(id.namespace())
            .filter(move |vm| vm_service_account(vm) == id.name())
    }

    pub(crate) fn selects(svc: &k8s::Service, labels: &Labels) -> bool {
        let selector = svc
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.clone())
            .unwrap_or_default();
        // A service without a selector is not backed by pods.
        !selector.is_empty() && Selector::from_map(selector).matches(labels)
    }

    fn cloud_endpoints(&self, svc: &MeshService, k8s_svc: &k8s::Service) -> Vec<Endpoint> {
        let Some(addrs) = k8s_svc.annotations().get(CLOUD_MESH_ENDPOINT_ADDR_ANNOTATION) else {
            return Vec::new();
        };
        let port = match svc.target_port {
            0 => svc.port,
            tp => tp,
        };
        addrs
            .split(',')
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .filter_map(|addr| match addr.parse::<IpAddr>() {
                Ok(ip) => {
                    let mut ep = Endpoint::new(ip, port);
                    ep.app_protocol = svc.protocol.clone();
                    Some(ep)
                }
                Err(error) => {
                    tracing::warn!(%error, service = %svc, %addr, "Ignoring invalid cloud endpoint");
                    None
                }
            })
            .collect()
    }
}

impl Provider for KubeProvider<'_> {
    fn id(&self) -> &'static str {
        "kubernetes"
    }

    fn list_services(&self) -> Vec<MeshService> {
        self.index
            .services
            .iter()
            .filter(|svc| self.is_monitored_namespace(&svc.namespace().unwrap_or_default()))
            .flat_map(|svc| self.service_to_mesh_services(svc))
            .collect()
    }

    fn list_services_for_identity(&self, id: &ServiceIdentity) -> Vec<MeshService> {
        let mut names = BTreeSet::new();
        for pod in self.pods_for_identity(id) {
            let labels = Labels::from(pod.metadata.labels.clone());
            names.extend(
                self.index
                    .services
                    .in_namespace(id.namespace())
                    .filter(|svc| Self::selects(svc, &labels))
                    .map(|svc| svc.name_unchecked()),
            );
        }
        for vm in self.machines_for_identity(id) {
            names.extend(vm.spec.services.iter().map(|s| s.service_name.clone()));
        }

        names
            .iter()
            .filter_map(|name| self.index.services.get(id.namespace(), name))
            .flat_map(|svc| self.service_to_mesh_services(svc))
            .collect()
    }

    fn list_service_identities_for_service(&self, svc: &MeshService) -> Vec<ServiceIdentity> {
        let Some(k8s_svc) = self.service(svc) else {
            return Vec::new();
        };
        let mut ids = BTreeSet::new();
        for pod in self.index.pods.in_namespace(&svc.namespace) {
            if Self::selects(k8s_svc, &Labels::from(pod.metadata.labels.clone())) {
                ids.insert(ServiceIdentity::new(pod_service_account(pod), &svc.namespace));
            }
        }
        for vm in self.index.virtual_machines.in_namespace(&svc.namespace) {
            if vm
                .spec
                .services
                .iter()
                .any(|s| s.service_name == svc.provider_name())
            {
                ids.insert(ServiceIdentity::new(vm_service_account(vm), &svc.namespace));
            }
        }
        ids.into_iter().collect()
    }

    fn list_endpoints_for_service(&self, svc: &MeshService) -> Vec<Endpoint> {
        if let Some(k8s_svc) = self.service(svc) {
            let cloud = self.cloud_endpoints(svc, k8s_svc);
            if !cloud.is_empty() {
                return cloud;
            }
        }

        let Some(eps) = self.index.endpoints.get(&svc.namespace, svc.provider_name()) else {
            return Vec::new();
        };
        let mut endpoints = Vec::new();
        for subset in eps.subsets.iter().flatten() {
            for port in subset.ports.iter().flatten() {
                let Ok(ep_port) = u16::try_from(port.port) else {
                    continue;
                };
                if svc.target_port != 0 && ep_port != svc.target_port {
                    continue;
                }
                for addr in subset.addresses.iter().flatten() {
                    if let Some(host) = svc.subdomain() {
                        if addr.hostname.as_deref() != Some(host) {
                            continue;
                        }
                    }
                    let ip = match addr.ip.parse::<IpAddr>() {
                        Ok(ip) => ip,
                        Err(error) => {
                            tracing::warn!(%error, service = %svc, ip = %addr.ip, "Ignoring invalid endpoint address");
                            continue;
                        }
                    };
                    let mut ep = Endpoint::new(ip, ep_port);
                    ep.app_protocol = port.app_protocol.clone().unwrap_or_default();
                    endpoints.push(ep);
                }
            }
        }
        endpoints
    }

    fn list_endpoints_for_identity(&self, id: &ServiceIdentity) -> Vec<Endpoint> {
        let pod_ips = self.pods_for_identity(id).flat_map(pod_ips);
        let vm_ips = self
            .machines_for_identity(id)
            .filter_map(|vm| vm.spec.machine_ip.parse::<IpAddr>().ok());
        pod_ips
            .chain(vm_ips)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|ip| Endpoint::new(ip, 0))
            .collect()
    }

    fn get_resolvable_endpoints_for_service(&self, svc: &MeshService) -> Vec<Endpoint> {
        let Some(k8s_svc) = self.service(svc) else {
            return Vec::new();
        };
        if is_headless(k8s_svc) || svc.subdomain().is_some() {
            return self.list_endpoints_for_service(svc);
        }

        let Some(spec) = k8s_svc.spec.as_ref() else {
            return Vec::new();
        };
        let mut ips = spec
            .cluster_ip
            .iter()
            .filter_map(|ip| ip.parse::<IpAddr>().ok())
            .collect::<Vec<_>>();
        if matches!(
            self.access_mode,
            ServiceAccessMode::Ip | ServiceAccessMode::Mixed
        ) {
            ips.extend(self.list_endpoints_for_service(svc).into_iter().map(|ep| ep.ip));
        }

        let mut endpoints = Vec::new();
        for ip in ips {
            for port in spec.ports.iter().flatten() {
                if let Ok(port) = u16::try_from(port.port) {
                    endpoints.push(Endpoint::new(ip, port));
                }
            }
        }
        endpoints
    }
}

fn is_headless(svc: &k8s::Service) -> bool {
    svc.spec
        .as_ref()
        .and_then(|spec| spec.cluster_ip.as_deref())
        == Some(HEADLESS_CLUSTER_IP)
}

fn endpoints_target_port(eps: &k8s::Endpoints, port_name: &str) -> Option<u16> {
    eps.subsets
        .iter()
        .flatten()
        .flat_map(|subset| subset.ports.iter().flatten())
        .find(|p| p.name.as_deref().unwrap_or_default() == port_name)
        .and_then(|p| u16::try_from(p.port).ok())
}

fn endpoint_hostnames(eps: &k8s::Endpoints) -> BTreeSet<String> {
    eps.subsets
        .iter()
        .flatten()
        .flat_map(|subset| subset.addresses.iter().flatten())
        .filter_map(|addr| addr.hostname.clone())
        .filter(|host| !host.is_empty())
        .collect()
}

pub(crate) fn pod_service_account(pod: &k8s::Pod) -> &str {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.service_account_name.as_deref())
        .filter(|sa| !sa.is_empty())
        .unwrap_or(DEFAULT_SERVICE_ACCOUNT)
}

pub(crate) fn vm_service_account(vm: &VirtualMachine) -> &str {
    match vm.spec.service_account_name.as_str() {
        "" => DEFAULT_SERVICE_ACCOUNT,
        sa => sa,
    }
}

pub(crate) fn pod_ips(pod: &k8s::Pod) -> Vec<IpAddr> {
    let Some(status) = pod.status.as_ref() else {
        return Vec::new();
    };
    let ips = status
        .pod_ips
        .iter()
        .flatten()
        .filter_map(|ip| ip.ip.parse().ok())
        .collect::<Vec<_>>();
    if !ips.is_empty() {
        return ips;
    }
    status
        .pod_ip
        .iter()
        .filter_map(|ip| ip.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{mk_endpoints, mk_index, mk_namespace, mk_pod, mk_service};
    use pretty_assertions::assert_eq;

    #[test]
    fn unmonitored_namespaces_are_not_listed() {
        let mut index = mk_index();
        index.apply(mk_namespace("ns1", true));
        index.apply(mk_namespace("ns2", false));
        index.apply(mk_service("ns1", "a", &[("http", 80, 8080)]));
        index.apply(mk_service("ns2", "b", &[("http", 80, 8080)]));

        let provider = KubeProvider::new(&index);
        let names = provider
            .list_services()
            .into_iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["ns1/a"]);
    }

    #[test]
    fn target_ports_follow_endpoints() {
        let mut index = mk_index();
        index.apply(mk_namespace("ns", true));
        index.apply(mk_service("ns", "b", &[("http-web", 80, 8080)]));
        index.apply(mk_endpoints("ns", "b", &["10.0.0.2"], &[("http-web", 9090)]));

        let provider = KubeProvider::new(&index);
        let svcs = provider.list_services();
        assert_eq!(svcs.len(), 1);
        assert_eq!(svcs[0].port, 80);
        assert_eq!(svcs[0].target_port, 9090);
        assert_eq!(svcs[0].protocol, "http");
        assert_eq!(provider.target_port_for_service_port("ns", "b", 80), Some(9090));
        assert_eq!(provider.target_port_for_service_port("ns", "b", 81), None);

        let eps = provider.list_endpoints_for_service(&svcs[0]);
        assert_eq!(eps.len(), 1);
        assert_eq!(eps[0].to_string(), "10.0.0.2:9090");
    }

    #[test]
    fn identities_follow_pod_selectors() {
        let mut index = mk_index();
        index.apply(mk_namespace("ns", true));
        index.apply(mk_service("ns", "b", &[("http", 80, 8080)]));
        index.apply(mk_pod("ns", "b-0", "sa-b", "10.0.0.2", &[("app", "b")]));
        index.apply(mk_pod("ns", "c-0", "sa-c", "10.0.0.3", &[("app", "c")]));

        let provider = KubeProvider::new(&index);
        let svc = provider.list_services().remove(0);
        assert_eq!(
            provider.list_service_identities_for_service(&svc),
            vec![ServiceIdentity::new("sa-b", "ns")]
        );

        let id = ServiceIdentity::new("sa-b", "ns");
        let svcs = provider.list_services_for_identity(&id);
        assert_eq!(svcs, vec![svc]);
        let eps = provider.list_endpoints_for_identity(&id);
        assert_eq!(eps, vec![Endpoint::new("10.0.0.2".parse().unwrap(), 0)]);
        assert!(provider
            .list_services_for_identity(&ServiceIdentity::new("sa-c", "ns"))
            .is_empty());
    }

    #[test]
    fn resolvable_endpoints_use_the_cluster_ip() {
        let mut index = mk_index();
        index.apply(mk_namespace("ns", true));
        let mut svc = mk_service("ns", "b", &[("http", 80, 8080), ("grpc-api", 90, 9090)]);
        svc.spec.as_mut().unwrap().cluster_ip = Some("10.96.0.10".to_string());
        index.apply(svc);

        let provider = KubeProvider::new(&index);
        let svc = provider.list_services().remove(0);
        let eps = provider
            .get_resolvable_endpoints_for_service(&svc)
            .into_iter()
            .map(|ep| ep.to_string())
            .collect::<Vec<_>>();
        assert_eq!(eps, vec!["10.96.0.10:80", "10.96.0.10:90"]);
    }

    #[test]
    fn headless_services_expand_per_host() {
        let mut index = mk_index();
        index.apply(mk_namespace("ns", true));
        let mut svc = mk_service("ns", "mysql", &[("tcp-db", 3306, 3306)]);
        svc.spec.as_mut().unwrap().cluster_ip = Some(HEADLESS_CLUSTER_IP.to_string());
        index.apply(svc);
        let mut eps = mk_endpoints("ns", "mysql", &["10.0.0.7", "10.0.0.8"], &[("tcp-db", 3306)]);
        let addrs = eps.subsets.as_mut().unwrap()[0].addresses.as_mut().unwrap();
        addrs[0].hostname = Some("mysql-0".to_string());
        addrs[1].hostname = Some("mysql-1".to_string());
        index.apply(eps);

        let provider = KubeProvider::new(&index);
        let svcs = provider.list_services();
        let names = svcs.iter().map(|s| s.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["mysql-0.mysql", "mysql-1.mysql"]);
        assert_eq!(svcs[0].protocol, "tcp");

        let eps = provider.get_resolvable_endpoints_for_service(&svcs[1]);
        assert_eq!(eps.len(), 1);
        assert_eq!(eps[0].to_string(), "10.0.0.8:3306");
    }
}
