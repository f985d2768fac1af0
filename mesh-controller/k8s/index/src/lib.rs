//! FSM mesh controller index
//!
//! The index holds a snapshot of every cluster resource the control plane compiles into proxy
//! configuration. It is fed by kubert watches and announces each change on the message broker:
//!
//! - `Namespace`s are members of the mesh when labeled `flomesh.io/monitored-by=<mesh>`.
//! - `Service`s and `Endpoints` (plus multicluster `ServiceImport`s) are projected into mesh
//!   services and endpoints by the providers.
//! - `Pod`s and `VirtualMachine`s carrying an `fsm-proxy-uuid` label are proxy workloads.
//! - SMI resources (`TrafficSplit`, `HTTPRouteGroup`, `TCPRoute`, `TrafficTarget`) and the
//!   `policy.flomesh.io` and `plugin.flomesh.io` resources shape the compiled policies.
//! - The `MeshConfig` named by [`ClusterInfo`] holds mesh-wide settings.
//!
//! ```text
//! [ kubert watch ] -> [ Index ] -> [ Broker ]
//!                         ^
//!                         |
//!                   [ Catalog ] <- [ proxy configuration generator ]
//! ```
//!
//! Policy resources that fail validation are not indexed; their status is set to `error` through
//! the [`StatusSink`](fsm_mesh_controller_core::status::StatusSink). Queries over the snapshot
//! are served by a [`Catalog`] that borrows the index for the duration of one proxy build.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod catalog;
mod cluster_info;
mod configurator;
mod index;
mod isolation;
pub mod metrics;
mod provider;
mod store;
mod validation;


pub use self::{
    catalog::Catalog,
    cluster_info::ClusterInfo,
    configurator::Configurator,
    index::{Index, SharedIndex},
    isolation::IsolationFilter,
    validation::Error as ValidationError,
};
