use super::Catalog;
use crate::provider::{pod_ips, pod_service_account, vm_service_account, KubeProvider};
use fsm_mesh_controller_core::{
    constants::{
        CLOUD_ATTACHED_TO_ANNOTATION, CLOUD_MESH_ENDPOINT_ADDR_ANNOTATION, CLOUD_SYNC_ANNOTATION,
        METRICS_ANNOTATION, SIDECAR_UNIQUE_ID_LABEL,
    },
    MeshService, ServiceIdentity,
};
use fsm_mesh_controller_k8s_api::{
    self as k8s, machine::VirtualMachine, Labels, Probe, ResourceExt,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    net::IpAddr,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Pod,
    VirtualMachine,
}

/// A pod or virtual machine running a mesh proxy.
#[derive(Clone, Debug, PartialEq)]
pub struct Workload {
    pub kind: WorkloadKind,

    /// The value of the proxy's unique-id label.
    pub proxy_uuid: String,
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub service_account: String,
    pub labels: Labels,

    /// Kind and name of the controlling owner, if any.
    pub owner: Option<(String, String)>,

    /// The address the proxy is reached on.
    pub ip: Option<IpAddr>,

    /// For virtual machines, the address of the machine the sidecar fronts.
    pub machine_ip: Option<IpAddr>,
    pub readiness_probes: Vec<Probe>,
    pub liveness_probes: Vec<Probe>,
    pub startup_probes: Vec<Probe>,
}

impl Catalog<'_> {
    /// Pods and virtual machines labeled with a proxy unique id, excluding those being deleted.
    pub fn list_proxy_workloads(&self) -> Vec<Workload> {
        let pods = self.index.pods.iter().filter_map(pod_workload);
        let vms = self.index.virtual_machines.iter().filter_map(vm_workload);
        pods.chain(vms).collect()
    }

    pub fn get_workload(&self, kind: WorkloadKind, namespace: &str, name: &str) -> Option<Workload> {
        match kind {
            WorkloadKind::Pod => self.index.pods.get(namespace, name).and_then(pod_workload),
            WorkloadKind::VirtualMachine => self
                .index
                .virtual_machines
                .get(namespace, name)
                .and_then(vm_workload),
        }
    }

    /// The mesh services a workload serves.
    ///
    /// Services in the workload's namespace select it by label. Services attached from a cloud
    /// catalog to the workload's namespace include it when their mesh endpoint annotation lists
    /// the workload address, or when they are synced from the cloud and their endpoints hold
    /// that address. Per-host services of headless services only apply to the matching host.
    pub fn list_services_for_workload(&self, workload: &Workload) -> Vec<MeshService> {
        let addr = match workload.kind {
            WorkloadKind::Pod => workload.ip,
            WorkloadKind::VirtualMachine => workload.machine_ip.or(workload.ip),
        };

        let mut services = BTreeSet::new();
        for svc in self.index.services.iter() {
            let namespace = svc.namespace().unwrap_or_default();
            if !self.is_monitored_namespace(&namespace) {
                continue;
            }
            let selected = if namespace == workload.namespace {
                KubeProvider::selects(svc, &workload.labels)
            } else {
                addr.is_some_and(|ip| self.is_cloud_attached(svc, &namespace, &workload.namespace, ip))
            };
            if !selected {
                continue;
            }
            services.extend(
                self.kube
                    .service_to_mesh_services(svc)
                    .into_iter()
                    .filter(|ms| ms.subdomain().is_none_or(|host| host == workload.name)),
            );
        }
        services.into_iter().collect()
    }

    fn is_cloud_attached(
        &self,
        svc: &k8s::Service,
        namespace: &str,
        workload_namespace: &str,
        addr: IpAddr,
    ) -> bool {
        let annotations = svc.annotations();
        if annotations.get(CLOUD_ATTACHED_TO_ANNOTATION).map(String::as_str) != Some(workload_namespace)
        {
            return false;
        }
        if mesh_endpoint_addrs(svc).contains(&addr) {
            return true;
        }
        self.is_cloud_sync_namespace(namespace)
            && self
                .index
                .endpoints
                .get(namespace, &svc.name_unchecked())
                .is_some_and(|eps| {
                    eps.subsets
                        .iter()
                        .flatten()
                        .flat_map(|subset| subset.addresses.iter().flatten())
                        .any(|a| a.ip.parse::<IpAddr>().ok() == Some(addr))
                })
    }

    pub fn namespace_labels(&self, namespace: &str) -> Labels {
        self.index
            .namespaces
            .get("", namespace)
            .map(|ns| Labels::from(ns.metadata.labels.clone()))
            .unwrap_or_default()
    }

    /// Proxies in namespaces annotated `flomesh.io/metrics: "true"` expose metrics.
    pub fn is_metrics_enabled(&self, namespace: &str) -> bool {
        self.namespace_annotation(namespace, METRICS_ANNOTATION) == Some("true")
    }

    pub fn is_cloud_sync_namespace(&self, namespace: &str) -> bool {
        self.namespace_annotation(namespace, CLOUD_SYNC_ANNOTATION) == Some("true")
    }

    fn namespace_annotation(&self, namespace: &str, key: &str) -> Option<&str> {
        self.index
            .namespaces
            .get("", namespace)?
            .metadata
            .annotations
            .as_ref()?
            .get(key)
            .map(String::as_str)
    }

    /// Names of cloud services reachable from a namespace, resolved by the proxy's DNS to the
    /// addresses of their mesh endpoints.
    pub fn get_cloud_dns_entries(&self, namespace: &str) -> BTreeMap<String, Vec<IpAddr>> {
        let mut entries = BTreeMap::new();
        for svc in self.index.services.iter() {
            let svc_ns = svc.namespace().unwrap_or_default();
            if !self.is_cloud_sync_namespace(&svc_ns) {
                continue;
            }
            let addrs = mesh_endpoint_addrs(svc);
            if addrs.is_empty() {
                continue;
            }
            let name = format!(
                "{}.{namespace}.svc.{}",
                svc.name_unchecked(),
                self.trust_domain()
            );
            entries.insert(name, addrs.into_iter().collect());
        }
        entries
    }
}

// === impl Workload ===

impl Workload {
    pub fn identity(&self) -> ServiceIdentity {
        ServiceIdentity::new(&self.service_account, &self.namespace)
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

fn pod_workload(pod: &k8s::Pod) -> Option<Workload> {
    if pod.metadata.deletion_timestamp.is_some() {
        return None;
    }
    let proxy_uuid = pod.labels().get(SIDECAR_UNIQUE_ID_LABEL)?.clone();
    let containers = pod.spec.iter().flat_map(|spec| spec.containers.iter());
    let mut workload = Workload {
        kind: WorkloadKind::Pod,
        proxy_uuid,
        uid: pod.uid().unwrap_or_default(),
        name: pod.name_unchecked(),
        namespace: pod.namespace().unwrap_or_default(),
        service_account: pod_service_account(pod).to_string(),
        labels: Labels::from(pod.metadata.labels.clone()),
        owner: controller(&pod.metadata),
        ip: pod_ips(pod).into_iter().next(),
        machine_ip: None,
        readiness_probes: Vec::new(),
        liveness_probes: Vec::new(),
        startup_probes: Vec::new(),
    };
    for container in containers {
        workload.readiness_probes.extend(container.readiness_probe.clone());
        workload.liveness_probes.extend(container.liveness_probe.clone());
        workload.startup_probes.extend(container.startup_probe.clone());
    }
    Some(workload)
}

fn vm_workload(vm: &VirtualMachine) -> Option<Workload> {
    if vm.metadata.deletion_timestamp.is_some() {
        return None;
    }
    let proxy_uuid = vm.labels().get(SIDECAR_UNIQUE_ID_LABEL)?.clone();
    Some(Workload {
        kind: WorkloadKind::VirtualMachine,
        proxy_uuid,
        uid: vm.uid().unwrap_or_default(),
        name: vm.name_unchecked(),
        namespace: vm.namespace().unwrap_or_default(),
        service_account: vm_service_account(vm).to_string(),
        labels: Labels::from(vm.metadata.labels.clone()),
        owner: controller(&vm.metadata),
        ip: vm.spec.sidecar_ip.parse().ok(),
        machine_ip: vm.spec.machine_ip.parse().ok(),
        readiness_probes: vm.spec.readiness_probe.iter().cloned().collect(),
        liveness_probes: vm.spec.liveness_probe.iter().cloned().collect(),
        startup_probes: vm.spec.startup_probe.iter().cloned().collect(),
    })
}

fn controller(meta: &k8s::ObjectMeta) -> Option<(String, String)> {
    meta.owner_references
        .iter()
        .flatten()
        .find(|r| r.controller == Some(true))
        .map(|r| (r.kind.clone(), r.name.clone()))
}

/// Addresses listed in a service's comma-separated mesh endpoint annotation.
fn mesh_endpoint_addrs(svc: &k8s::Service) -> BTreeSet<IpAddr> {
    svc.annotations()
        .get(CLOUD_MESH_ENDPOINT_ADDR_ANNOTATION)
        .into_iter()
        .flat_map(|addrs| addrs.split(','))
        .filter_map(|addr| addr.trim().parse().ok())
        .collect()
}
