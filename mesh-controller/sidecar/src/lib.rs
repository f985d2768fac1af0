//! FSM mesh controller sidecar configuration
//!
//! Every connected proxy is registered in a [`ProxyRegistry`] and rebuilt whenever the index
//! announces a change. A rebuild compiles the catalog's traffic policies for the proxy into a
//! [`PolicyDocument`](document::PolicyDocument), dedups it, hashes it and, when the hash moved,
//! publishes it to the proxy's codebase in the script repository:
//!
//! ```text
//! [ Index ] -> [ Broker ] -> [ Controller ] -> [ JobPool ]
//!     |                                            |
//!     v                                            v
//! [ Catalog ] ------------------------------> [ generator ] -> [ pack/hash ] -> [ Repository ]
//! ```
//!
//! Rebuilds of one proxy are serialized by the proxy's build lock; rebuilds of different proxies
//! run concurrently on the pool. A rebuild that finds the cluster state incomplete reports
//! itself not ready, which shortens the controller's reconcile window.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod document;
mod generator;
mod hash;
mod job;
mod mapper;
pub mod metrics;
mod pack;
mod plugin;
mod proxy;
mod publish;
mod reconcile;
mod registry;

#[cfg(test)]
mod tests;

pub use self::{
    hash::hash,
    job::{JobContext, JobPool},
    mapper::{KubeProxyServiceMapper, ProxyServiceMapper},
    metrics::ProxyMetrics,
    plugin::PluginSet,
    proxy::{Proxy, ProxyKind},
    reconcile::Controller,
    registry::ProxyRegistry,
};

use fsm_mesh_controller_core::ServiceIdentity;
use fsm_mesh_controller_k8s_index::catalog;

/// Failures of a single proxy rebuild.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("proxy {0} has no workload")]
    MissingWorkload(String),

    #[error("proxy {proxy} expects identity {expected} but its workload runs as {found}")]
    IdentityMismatch {
        proxy: String,
        expected: ServiceIdentity,
        found: ServiceIdentity,
    },

    #[error(transparent)]
    Catalog(#[from] catalog::Error),

    #[error(transparent)]
    Certificate(#[from] fsm_mesh_controller_certificate::Error),

    #[error("failed to serialize document: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Repository(#[from] fsm_mesh_controller_repo::Error),

    #[error("failed to compress document: {0}")]
    Compress(#[from] std::io::Error),
}
