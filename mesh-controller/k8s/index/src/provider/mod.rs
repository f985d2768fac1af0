//! Service and endpoint discovery over the index.
//!
//! Each provider projects one family of resources into mesh services and endpoints. The catalog
//! concatenates provider results; no provider applies the isolation filter itself.

mod kube;
mod multicluster;

pub(crate) use self::{
    kube::{pod_ips, pod_service_account, vm_service_account, KubeProvider},
    multicluster::MulticlusterProvider,
};

use fsm_mesh_controller_core::{Endpoint, MeshService, ServiceIdentity};

pub(crate) trait Provider {
    fn id(&self) -> &'static str;

    /// All services in monitored namespaces.
    fn list_services(&self) -> Vec<MeshService>;

    /// Services backed by workloads running as the given identity.
    fn list_services_for_identity(&self, id: &ServiceIdentity) -> Vec<MeshService>;

    fn list_service_identities_for_service(&self, svc: &MeshService) -> Vec<ServiceIdentity>;

    fn list_endpoints_for_service(&self, svc: &MeshService) -> Vec<Endpoint>;

    /// Workload addresses for an identity. Ports are not known and are left at zero.
    fn list_endpoints_for_identity(&self, id: &ServiceIdentity) -> Vec<Endpoint>;

    /// The addresses a client resolves the service's hostname to.
    fn get_resolvable_endpoints_for_service(&self, svc: &MeshService) -> Vec<Endpoint>;
}

/// Picks the protocol of a service port: the app protocol when set, else a `<proto>-` port
/// name prefix, else HTTP.
pub(crate) fn port_protocol(name: &str, app_protocol: Option<&str>) -> String {
    use fsm_mesh_controller_core::constants::{
        PROTOCOL_GRPC, PROTOCOL_HTTP, PROTOCOL_TCP, PROTOCOL_TCP_SERVER_FIRST,
    };

    if let Some(proto) = app_protocol.filter(|p| !p.is_empty()) {
        return proto.to_ascii_lowercase();
    }
    // `tcp-server-first` must be tried before its `tcp` prefix.
    [
        PROTOCOL_TCP_SERVER_FIRST,
        PROTOCOL_TCP,
        PROTOCOL_HTTP,
        PROTOCOL_GRPC,
    ]
    .into_iter()
    .find(|p| {
        name.strip_prefix(p)
            .is_some_and(|rest| rest.starts_with('-'))
    })
    .unwrap_or(PROTOCOL_HTTP)
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("tcp-server-first-db", None, "tcp-server-first")]
    #[case("tcp-db", None, "tcp")]
    #[case("grpc-api", None, "grpc")]
    #[case("web", None, "http")]
    #[case("tcpish", None, "http")]
    #[case("tcp-db", Some("GRPC"), "grpc")]
    #[case("tcp-db", Some(""), "tcp")]
    fn protocols_from_ports(
        #[case] name: &str,
        #[case] app_protocol: Option<&str>,
        #[case] expected: &str,
    ) {
        assert_eq!(port_protocol(name, app_protocol), expected);
    }
}
