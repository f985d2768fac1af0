use crate::{BuildError, Proxy};
use fsm_mesh_controller_core::MeshService;
use fsm_mesh_controller_k8s_index::Catalog;

/// Resolves the services a proxy's workload backs.
pub trait ProxyServiceMapper: Send + Sync {
    fn list_services_for_proxy(
        &self,
        catalog: &Catalog<'_>,
        proxy: &Proxy,
    ) -> Result<Vec<MeshService>, BuildError>;
}

/// Looks the proxy's pod or virtual machine up in the index and matches it against service
/// selectors and cloud attachments.
#[derive(Clone, Debug, Default)]
pub struct KubeProxyServiceMapper(());

impl ProxyServiceMapper for KubeProxyServiceMapper {
    fn list_services_for_proxy(
        &self,
        catalog: &Catalog<'_>,
        proxy: &Proxy,
    ) -> Result<Vec<MeshService>, BuildError> {
        let metadata = proxy.metadata();
        let workload = catalog
            .get_workload(metadata.kind, &metadata.namespace, &metadata.name)
            .ok_or_else(|| BuildError::MissingWorkload(proxy.to_string()))?;
        if workload.proxy_uuid != proxy.uuid() {
            return Err(BuildError::MissingWorkload(proxy.to_string()));
        }
        Ok(catalog.list_services_for_workload(&workload))
    }
}
