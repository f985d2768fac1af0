//! Writes `{currentStatus, reason}` onto policy resources.
//!
//! Policies are compiled from immutable snapshots; the index emits a [`StatusUpdate`] whenever
//! a policy is committed or rejected, and the [`Controller`] owns the Kubernetes client that
//! patches the status subresource.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use fsm_mesh_controller_core::status::{PolicyKind, PolicyRef, StatusUpdate};
use fsm_mesh_controller_k8s_api::{
    plugin::{Plugin, PluginChain, PluginConfig},
    policy::{
        AccessCert, AccessControl, Egress, EgressGateway, IngressBackend, Isolation, Retry,
        TrafficWarmup, UpstreamTrafficSetting,
    },
    PolicyStatus,
};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, Patch, PatchParams},
    Client, Resource,
};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{
        counter::Counter,
        family::Family,
        histogram::{exponential_buckets, Histogram},
    },
    registry::Registry,
};
use serde::de::DeserializeOwned;
use std::{fmt::Debug, time::Duration};
use tokio::{sync::mpsc, time};

pub const STATUS_FIELD_MANAGER: &str = "fsm-controller";

pub struct Controller {
    client: Client,
    updates: mpsc::Receiver<StatusUpdate>,
    patch_timeout: Duration,
    metrics: ControllerMetrics,
}

#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    patch_succeeded: Family<KindLabels, Counter>,
    patch_failed: Family<KindLabels, Counter>,
    patch_timeout: Family<KindLabels, Counter>,
    patch_duration: Histogram,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: String,
}

// === impl Controller ===

impl Controller {
    pub fn new(
        client: Client,
        updates: mpsc::Receiver<StatusUpdate>,
        patch_timeout: Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            client,
            updates,
            patch_timeout,
            metrics,
        }
    }

    /// Patches statuses until every sender is dropped.
    pub async fn run(mut self) {
        let params = PatchParams::apply(STATUS_FIELD_MANAGER);

        // Failed patches are not retried here; the index resends the status the next time the
        // policy is compiled.
        while let Some(update) = self.updates.recv().await {
            let labels = KindLabels {
                kind: format!("{:?}", update.target.kind),
            };
            let start = time::Instant::now();
            let res = time::timeout(self.patch_timeout, self.patch(&update, &params)).await;
            self.metrics
                .patch_duration
                .observe(start.elapsed().as_secs_f64());

            match res {
                Ok(Ok(())) => {
                    self.metrics.patch_succeeded.get_or_create(&labels).inc();
                    tracing::debug!(
                        policy = %update.target,
                        status = %update.current_status,
                        "Patched status"
                    );
                }
                Ok(Err(error)) => {
                    self.metrics.patch_failed.get_or_create(&labels).inc();
                    tracing::error!(policy = %update.target, %error, "Failed to patch status");
                }
                Err(_) => {
                    self.metrics.patch_timeout.get_or_create(&labels).inc();
                    tracing::error!(
                        policy = %update.target,
                        timeout = ?self.patch_timeout,
                        "Timed out patching status"
                    );
                }
            }
        }
        tracing::debug!("Status updates closed");
    }

    async fn patch(&self, update: &StatusUpdate, params: &PatchParams) -> kube::Result<()> {
        let client = self.client.clone();
        match update.target.kind {
            PolicyKind::AccessControl => {
                patch_namespaced::<AccessControl>(client, update, params).await
            }
            PolicyKind::AccessCert => patch_namespaced::<AccessCert>(client, update, params).await,
            PolicyKind::IngressBackend => {
                patch_namespaced::<IngressBackend>(client, update, params).await
            }
            PolicyKind::Egress => patch_namespaced::<Egress>(client, update, params).await,
            PolicyKind::EgressGateway => {
                patch_namespaced::<EgressGateway>(client, update, params).await
            }
            PolicyKind::Retry => patch_namespaced::<Retry>(client, update, params).await,
            PolicyKind::UpstreamTrafficSetting => {
                patch_namespaced::<UpstreamTrafficSetting>(client, update, params).await
            }
            PolicyKind::TrafficWarmup => {
                patch_namespaced::<TrafficWarmup>(client, update, params).await
            }
            PolicyKind::PluginChain => {
                patch_namespaced::<PluginChain>(client, update, params).await
            }
            PolicyKind::PluginConfig => {
                patch_namespaced::<PluginConfig>(client, update, params).await
            }
            PolicyKind::Isolation => patch_cluster::<Isolation>(client, update, params).await,
            PolicyKind::Plugin => patch_cluster::<Plugin>(client, update, params).await,
        }
    }
}

async fn patch_namespaced<T>(
    client: Client,
    update: &StatusUpdate,
    params: &PatchParams,
) -> kube::Result<()>
where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned,
{
    let PolicyRef {
        namespace, name, ..
    } = &update.target;
    let api = Api::<T>::namespaced(client, namespace.as_deref().unwrap_or_default());
    api.patch_status(name, params, &make_patch::<T>(update))
        .await?;
    Ok(())
}

async fn patch_cluster<T>(
    client: Client,
    update: &StatusUpdate,
    params: &PatchParams,
) -> kube::Result<()>
where
    T: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned,
{
    let api = Api::<T>::all(client);
    api.patch_status(&update.target.name, params, &make_patch::<T>(update))
        .await?;
    Ok(())
}

/// A merge patch replacing the status of a `T`.
pub fn make_patch<T>(update: &StatusUpdate) -> Patch<serde_json::Value>
where
    T: Resource<DynamicType = ()>,
{
    let status = PolicyStatus {
        current_status: Some(update.current_status.clone()),
        reason: Some(update.reason.clone()),
    };
    Patch::Merge(serde_json::json!({
        "apiVersion": T::api_version(&()),
        "kind": T::kind(&()),
        "name": update.target.name,
        "status": status,
    }))
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let patch_succeeded = Family::default();
        prom.register(
            "patch_succeeded",
            "Count of status patches that succeeded",
            patch_succeeded.clone(),
        );

        let patch_failed = Family::default();
        prom.register(
            "patch_failed",
            "Count of status patches that failed",
            patch_failed.clone(),
        );

        let patch_timeout = Family::default();
        prom.register(
            "patch_timeout",
            "Count of status patches that timed out",
            patch_timeout.clone(),
        );

        let patch_duration = Histogram::new(exponential_buckets(0.001, 2.0, 12));
        prom.register(
            "patch_duration_seconds",
            "Histogram of status patch latencies",
            patch_duration.clone(),
        );

        Self {
            patch_succeeded,
            patch_failed,
            patch_timeout,
            patch_duration,
        }
    }
}
