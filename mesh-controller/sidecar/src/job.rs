use crate::{
    generator::Generator,
    metrics::UpdateResult,
    plugin::PluginPolicies,
    proxy::Pending,
    publish::{publish, Encoding},
    BuildError, PluginSet, Proxy, ProxyMetrics, ProxyRegistry, ProxyServiceMapper,
};
use fsm_mesh_controller_certificate::Manager;
use fsm_mesh_controller_core::{
    certificate::{CertKind, Certificate},
    constants::DEFAULT_WORKER_POOL_SIZE,
    MeshService,
};
use fsm_mesh_controller_k8s_index::SharedIndex;
use fsm_mesh_controller_repo::Repository;
use std::{collections::BTreeSet, future::Future, sync::Arc, time::Duration};
use tokio::{sync::Semaphore, task::JoinHandle, time};
use tracing::{info_span, Instrument};

const CERT_ISSUE_ATTEMPTS: usize = 3;
const CERT_ISSUE_BACKOFF: Duration = Duration::from_millis(500);

/// Everything a rebuild reads or writes.
pub struct JobContext {
    pub index: SharedIndex,
    pub certs: Arc<Manager>,
    pub repo: Arc<dyn Repository>,
    pub registry: Arc<ProxyRegistry>,
    pub mapper: Arc<dyn ProxyServiceMapper>,
    pub plugins: Arc<PluginSet>,
    pub metrics: ProxyMetrics,
}

/// Runs proxy rebuilds on a bounded number of tasks.
#[derive(Clone)]
pub struct JobPool {
    ctx: Arc<JobContext>,
    permits: Arc<Semaphore>,
}

/// What a rebuild needs to know before the certificate is issued.
struct Prepared {
    services: Vec<MeshService>,
    cn: String,
    sans: Vec<String>,
    validity: Duration,
    mtls: bool,
}

// === impl JobPool ===

impl JobPool {
    pub fn new(ctx: JobContext) -> Self {
        Self::with_workers(ctx, DEFAULT_WORKER_POOL_SIZE)
    }

    pub fn with_workers(ctx: JobContext, workers: usize) -> Self {
        Self {
            ctx: Arc::new(ctx),
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub fn context(&self) -> &Arc<JobContext> {
        &self.ctx
    }

    /// Spawns a rebuild of the proxy. The task resolves to whether the proxy's configuration
    /// is complete; an incomplete configuration should be rebuilt soon. Returns `None` when a
    /// rebuild of the proxy is already pending.
    pub fn submit(&self, proxy: Arc<Proxy>) -> Option<JoinHandle<bool>> {
        self.job(proxy).map(tokio::spawn)
    }

    /// A rebuild of the proxy that waits for a free worker before it starts. The rebuild is
    /// counted in the proxy's backlog from now on.
    pub(crate) fn job(
        &self,
        proxy: Arc<Proxy>,
    ) -> Option<impl Future<Output = bool> + Send + 'static> {
        let Some(pending) = proxy.enqueue() else {
            tracing::trace!(%proxy, "Rebuild already queued");
            return None;
        };
        let ctx = self.ctx.clone();
        let permits = self.permits.clone();
        let span = info_span!("rebuild", proxy = %proxy);
        Some(
            async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return false;
                };
                rebuild(&ctx, &proxy, pending).await
            }
            .instrument(span),
        )
    }

    /// Publishes changed plugin scripts ahead of the rebuilds they affect.
    pub(crate) async fn refresh_plugins(&self) {
        update_plugins(&self.ctx).await;
    }
}

async fn rebuild(ctx: &JobContext, proxy: &Proxy, pending: Pending) -> bool {
    let start = time::Instant::now();
    update_plugins(ctx).await;

    let mut state = proxy.begin_build(pending).await;

    let prepared = match prepare(ctx, proxy) {
        Ok(Some(prepared)) => prepared,
        Ok(None) => return true,
        Err(error) => {
            tracing::warn!(%error, "Failed to resolve proxy services");
            ctx.metrics.config_update(UpdateResult::Failed);
            return false;
        }
    };

    let certificate = if prepared.mtls {
        match certificate(ctx, &prepared, state.certificate.as_deref()).await {
            Ok(cert) => Some(cert),
            Err(error) => {
                tracing::error!(%error, cn = %prepared.cn, "Failed to issue certificate");
                ctx.metrics.config_update(UpdateResult::Failed);
                return false;
            }
        }
    } else {
        None
    };
    state.certificate = certificate.clone();

    let (doc, ready, encoding) = {
        let index = ctx.index.read();
        let catalog = index.catalog();
        let config = catalog.configurator();
        let uploaded = ctx.plugins.snapshot();
        let (plugins, plugins_ready) = if config.feature_flags().enable_plugin_policy {
            let metadata = proxy.metadata();
            PluginPolicies::resolve(
                &catalog,
                &uploaded,
                &catalog.namespace_labels(&metadata.namespace),
                &metadata.labels,
            )
        } else {
            (PluginPolicies::global(&catalog), true)
        };

        let output = Generator::new(
            &catalog,
            proxy,
            &ctx.registry,
            &plugins,
            &prepared.services,
        )
        .build(certificate.as_deref(), &uploaded.version);
        let encoding = Encoding {
            pretty: config.is_sidecar_pretty_config(),
            compress: config.is_sidecar_compress_config(),
        };
        (output.doc, output.ready && plugins_ready, encoding)
    };

    let ready = match publish(&*ctx.repo, proxy, &mut state, doc, encoding).await {
        Ok(result) => {
            ctx.metrics.config_update(result);
            ready
        }
        Err(error) => {
            tracing::warn!(%error, "Failed to publish proxy configuration");
            ctx.metrics.config_update(UpdateResult::Failed);
            false
        }
    };
    ctx.metrics.job_duration(start.elapsed());
    ready
}

/// Reads what the rebuild needs from the index. `None` when the proxy is isolated.
fn prepare(ctx: &JobContext, proxy: &Proxy) -> Result<Option<Prepared>, BuildError> {
    let index = ctx.index.read();
    let catalog = index.catalog();
    if let Some(addr) = proxy.addr() {
        if catalog.isolation().contains(addr) {
            tracing::debug!(%addr, "Proxy is isolated");
            return Ok(None);
        }
    }

    let mut services = ctx.mapper.list_services_for_proxy(&catalog, proxy)?;
    services.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));

    let sans = services
        .iter()
        .flat_map(|svc| catalog.get_hostnames_for_service(svc, true))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let config = catalog.configurator();
    Ok(Some(Prepared {
        services,
        cn: proxy.identity().to_principal(catalog.trust_domain()),
        sans,
        validity: config.service_cert_validity(),
        mtls: !config.is_sidecar_disabled_mtls(),
    }))
}

/// Reuses the certificate issued to the proxy's identity unless it is due for rotation.
/// Proxies sharing an identity share its certificate.
async fn certificate(
    ctx: &JobContext,
    prepared: &Prepared,
    current: Option<&Certificate>,
) -> Result<Arc<Certificate>, BuildError> {
    if let Some(cert) = ctx.certs.get_certificate(&prepared.cn) {
        if !ctx.certs.should_rotate(&cert) {
            if current.is_some_and(|c| c.serial_number != cert.serial_number) {
                tracing::debug!(cn = %prepared.cn, serial = %cert.serial_number, "Certificate rotated");
            }
            return Ok(cert);
        }
    }

    let mut attempt = 1;
    loop {
        match ctx.certs.issue_certificate(
            &prepared.cn,
            CertKind::Service,
            &prepared.sans,
            prepared.validity,
        ) {
            Ok(cert) => return Ok(cert),
            Err(error) if attempt < CERT_ISSUE_ATTEMPTS => {
                tracing::warn!(%error, attempt, "Retrying certificate issuance");
                time::sleep(CERT_ISSUE_BACKOFF * attempt as u32).await;
                attempt += 1;
            }
            Err(error) => return Err(error.into()),
        }
    }
}

/// Publishes changed plugin scripts before proxies resolve their chains against them.
async fn update_plugins(ctx: &JobContext) {
    let scripts = {
        let index = ctx.index.read();
        let catalog = index.catalog();
        if !catalog.configurator().feature_flags().enable_plugin_policy {
            return;
        }
        catalog.get_plugins()
    };
    if let Err(error) = ctx.plugins.update(&*ctx.repo, scripts).await {
        tracing::warn!(%error, "Failed to publish plugin scripts");
    }
}

#[cfg(test)]
mod tests {
    use crate::tests::{endpoints, namespace, pod, service, Mesh};

    #[tokio::test]
    async fn rebuilds_waiting_for_a_worker_are_coalesced() {
        let mesh = Mesh::new().await;
        mesh.permissive();
        mesh.apply_cluster(namespace("ns"));
        mesh.apply(service("ns", "b", "http", 80));
        mesh.apply(endpoints("ns", "b", &["10.0.0.2"], "http", 80));
        mesh.apply(pod("ns", "a-0", "a", "a", "10.0.0.1", "uuid-a"));
        let proxy = mesh.register("uuid-a");

        let workers = mesh.pool.permits.available_permits() as u32;
        let busy = mesh
            .pool
            .permits
            .clone()
            .acquire_many_owned(workers)
            .await
            .expect("pool must be open");

        let queued = mesh
            .pool
            .submit(proxy.clone())
            .expect("first rebuild is queued");
        assert!(proxy.has_backlog());
        assert!(mesh.pool.submit(proxy.clone()).is_none());
        assert!(mesh.pool.submit(proxy.clone()).is_none());

        drop(busy);
        assert!(queued.await.expect("rebuild must not panic"));
        assert!(!proxy.has_backlog());
        assert!(mesh.published(&proxy).is_some());

        // Once the build has started, a new change queues again.
        assert!(mesh.pool.submit(proxy.clone()).is_some());
    }
}
