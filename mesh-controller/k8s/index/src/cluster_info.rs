/// Holds cluster metadata.
#[derive(Clone, Debug)]
pub struct ClusterInfo {
    /// The mesh identity trust domain, e.g. `cluster.local`.
    pub trust_domain: String,

    /// The namespace where the control plane is deployed.
    pub fsm_namespace: String,

    /// Namespaces labeled `flomesh.io/monitored-by=<mesh_name>` are part of
    /// the mesh.
    pub mesh_name: String,

    /// The name of the MeshConfig resource in `fsm_namespace`.
    pub mesh_config_name: String,
}

impl Default for ClusterInfo {
    fn default() -> Self {
        Self {
            trust_domain: fsm_mesh_controller_core::constants::DEFAULT_TRUST_DOMAIN.to_string(),
            fsm_namespace: "fsm-system".to_string(),
            mesh_name: "fsm".to_string(),
            mesh_config_name: "fsm-mesh-config".to_string(),
        }
    }
}
