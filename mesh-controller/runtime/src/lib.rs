#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use fsm_mesh_controller_certificate as certificate;
pub use fsm_mesh_controller_core as core;
pub use fsm_mesh_controller_k8s_api as k8s;
pub use fsm_mesh_controller_k8s_index as index;
pub use fsm_mesh_controller_k8s_status as status;
pub use fsm_mesh_controller_repo as repo;
pub use fsm_mesh_controller_sidecar as sidecar;

mod args;
mod version;

pub use self::args::{Args, Mode};
