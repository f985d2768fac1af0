#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
pub mod duration;
pub mod labels;
pub mod machine;
pub mod multicluster;
pub mod plugin;
pub mod policy;
pub mod smi;

pub use self::labels::{Labels, Selector};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{
            Endpoints, Namespace, Pod, PodSpec, PodStatus, Probe, Secret, Service, ServiceAccount,
            ServicePort, ServiceSpec,
        },
    },
    apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString},
};
pub use kube::api::{ObjectMeta, ResourceExt};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The status written back onto policy resources once compiled.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A reference to a namespaced object by name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub struct NamespacedRef {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}
