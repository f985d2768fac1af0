use crate::{JobContext, JobPool, Proxy, ProxyKind};
use ahash::AHashSet as HashSet;
use fsm_mesh_controller_core::{
    broker::{Broker, PodEvent, ProxyEvent},
    constants::{PROXY_RECONCILE_WINDOW, PROXY_RETRY_WINDOW},
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinSet,
    time::{self, Instant},
};
use tracing::{info_span, Instrument};

/// Keeps the registry in step with the proxy workloads in the index and rebuilds proxies as
/// the index changes.
///
/// Changes are coalesced by a sliding timer. The first change after a quiet period shortens
/// the timer to the retry window; changes arriving before it fires schedule one more short
/// window. Otherwise the registry is reconciled every reconcile window.
pub struct Controller {
    pool: JobPool,
    broker: Arc<Broker>,
    kind: ProxyKind,
    reconcile_window: Duration,
    retry_window: Duration,
    jobs: JoinSet<bool>,
    rebuild_tx: mpsc::UnboundedSender<String>,
    rebuild_rx: mpsc::UnboundedReceiver<String>,
}

/// Timer state between two reconcile passes.
#[derive(Debug, Default)]
struct Window {
    /// A change arrived since the last pass.
    reconfirm: bool,

    /// Another change arrived after the timer was shortened.
    pending: bool,

    /// A rebuild reported its configuration incomplete.
    not_ready: bool,
}

// === impl Controller ===

impl Controller {
    pub fn new(pool: JobPool, broker: Arc<Broker>, kind: ProxyKind) -> Self {
        let (rebuild_tx, rebuild_rx) = mpsc::unbounded_channel();
        Self {
            pool,
            broker,
            kind,
            reconcile_window: PROXY_RECONCILE_WINDOW,
            retry_window: PROXY_RETRY_WINDOW,
            jobs: JoinSet::new(),
            rebuild_tx,
            rebuild_rx,
        }
    }

    pub fn with_windows(mut self, reconcile: Duration, retry: Duration) -> Self {
        self.reconcile_window = reconcile;
        self.retry_window = retry;
        self
    }

    /// Reconciles until shutdown is signaled, then waits for in-flight rebuilds.
    pub async fn run(mut self, drain: drain::Watch) {
        let mut updates = self.broker.subscribe_proxy_updates();
        let mut pods = self.broker.subscribe_pods();
        let mut kinds = self.broker.subscribe_policy_kinds();
        let shutdown = drain.signaled();
        tokio::pin!(shutdown);

        let mut window = Window::default();
        let missing = self.reconcile().await;
        let timer = time::sleep(self.next_window(&mut window, missing));
        tokio::pin!(timer);

        loop {
            tokio::select! {
                release = &mut shutdown => {
                    tracing::debug!(jobs = self.jobs.len(), "Waiting for rebuilds to complete");
                    while self.jobs.join_next().await.is_some() {}
                    drop(release);
                    return;
                }

                () = &mut timer => {
                    let missing = self.reconcile().await;
                    let next = self.next_window(&mut window, missing);
                    timer.as_mut().reset(Instant::now() + next);
                }

                res = updates.recv() => match res {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        self.pool.context().metrics.broadcast_event();
                        if self.changed(&mut window) {
                            timer.as_mut().reset(Instant::now() + self.retry_window);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },

                res = pods.recv() => match res {
                    Ok(event) => self.pod_event(event),
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.changed(&mut window) {
                            timer.as_mut().reset(Instant::now() + self.retry_window);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },

                res = kinds.recv() => match res {
                    Ok(change) => {
                        tracing::debug!(%change, "Plugin resources changed");
                        let pool = self.pool.clone();
                        tokio::spawn(
                            async move { pool.refresh_plugins().await }
                                .instrument(info_span!("plugins")),
                        );
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                },

                Some(uuid) = self.rebuild_rx.recv() => {
                    let registry = &self.pool.context().registry;
                    if let Some(proxy) = registry.get_connected(&uuid) {
                        self.spawn_job(proxy);
                    }
                }

                Some(res) = self.jobs.join_next(), if !self.jobs.is_empty() => {
                    let ready = res.unwrap_or_else(|error| {
                        tracing::error!(%error, "Rebuild task failed");
                        false
                    });
                    if !ready {
                        window.not_ready = true;
                        if self.changed(&mut window) {
                            timer.as_mut().reset(Instant::now() + self.retry_window);
                        }
                    }
                }
            }
        }
    }

    /// Records a change. Returns true when the timer should be shortened.
    fn changed(&self, window: &mut Window) -> bool {
        if window.reconfirm {
            window.pending = true;
            return false;
        }
        window.reconfirm = true;
        true
    }

    fn next_window(&self, window: &mut Window, missing: usize) -> Duration {
        let again = window.reconfirm || window.pending || window.not_ready || missing > 0;
        *window = Window {
            reconfirm: window.pending,
            ..Window::default()
        };
        if again {
            self.retry_window
        } else {
            self.reconcile_window
        }
    }

    fn pod_event(&mut self, event: PodEvent) {
        let registry = &self.pool.context().registry;
        match event {
            PodEvent::Added(pod) => {
                if let Some(proxy) = registry.get_connected(&pod.uuid) {
                    self.spawn_job(proxy);
                }
            }
            PodEvent::Deleted(pod) => {
                if let Some(proxy) = registry.get_connected(&pod.uuid) {
                    tracing::debug!(%proxy, "Proxy workload deleted");
                    proxy.mark_deletion();
                }
            }
        }
    }

    /// Registers the proxy of every workload in the index and rebuilds it, then unregisters
    /// proxies whose workload is gone. Returns the number of proxies unregistered.
    pub(crate) async fn reconcile(&mut self) -> usize {
        let ctx = self.pool.context().clone();
        let broker = self.broker.clone();
        let workloads = ctx.index.read().catalog().list_proxy_workloads();

        let mut live = HashSet::with_capacity(workloads.len());
        let mut rejected = Vec::new();
        for workload in workloads {
            live.insert(workload.proxy_uuid.clone());
            let proxy = match ctx.registry.get_connected(&workload.proxy_uuid) {
                Some(proxy) => {
                    if let Err(error) = proxy.record_metadata(workload) {
                        tracing::warn!(%error, "Rejecting proxy");
                        rejected.push(proxy);
                        continue;
                    }
                    proxy
                }
                None => {
                    let (proxy, registered) = ctx.registry.register(Proxy::new(self.kind, workload));
                    if registered {
                        tracing::info!(%proxy, stats = ?proxy.stats_headers(), "Proxy registered");
                        self.watch(proxy.clone());
                    }
                    proxy
                }
            };
            if !proxy.has_backlog() && !proxy.is_marked_for_deletion() {
                self.spawn_job(proxy);
            }
        }

        let mut missing = 0;
        for proxy in ctx.registry.list() {
            if !live.contains(proxy.uuid()) {
                unregister(&ctx, &broker, &proxy).await;
                missing += 1;
            }
        }
        for proxy in rejected {
            unregister(&ctx, &broker, &proxy).await;
        }
        ctx.metrics.set_connected(ctx.registry.count());
        missing
    }

    fn spawn_job(&mut self, proxy: Arc<Proxy>) {
        if let Some(job) = self.pool.job(proxy) {
            self.jobs.spawn(job);
        }
    }

    /// Rebuilds the proxy when a change is addressed to it or its certificate rotates.
    /// Broadcast changes are handled by the controller's timer.
    fn watch(&self, proxy: Arc<Proxy>) {
        let identity = proxy.identity();
        let mut sub = self
            .broker
            .subscribe_proxy(proxy.uuid(), identity.name(), identity.namespace());
        let tx = self.rebuild_tx.clone();
        let span = info_span!("watch", %proxy);
        tokio::spawn(
            async move {
                while let Some(event) = sub.recv().await {
                    match event {
                        ProxyEvent::Addressed(change) => {
                            tracing::trace!(%change, "Proxy changed");
                        }
                        ProxyEvent::CertificateRotated(rotated) => {
                            tracing::debug!(cn = %rotated.cn_prefix, "Certificate rotated");
                        }
                        ProxyEvent::Update(_) | ProxyEvent::Lagged => continue,
                    }
                    if tx.send(proxy.uuid().to_string()).is_err() {
                        return;
                    }
                }
            }
            .instrument(span),
        );
    }
}

/// Forgets a proxy: its subscription, its codebase and, unless another proxy runs as the
/// same identity, its certificate.
async fn unregister(ctx: &JobContext, broker: &Broker, proxy: &Arc<Proxy>) {
    if ctx.registry.unregister(proxy.uuid()).is_none() {
        return;
    }
    broker.unsubscribe_proxy(proxy.uuid());
    if !ctx.registry.shares_identity(proxy.identity(), proxy.uuid()) {
        let cn = proxy.identity().to_principal(ctx.certs.trust_domain());
        ctx.certs.release_certificate(&cn);
    }
    let codebase = proxy.codebase();
    if let Err(error) = ctx.repo.delete(&codebase).await {
        tracing::warn!(%error, %codebase, "Failed to delete codebase");
    }
    tracing::info!(%proxy, "Proxy unregistered");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{endpoints, namespace, pod, service, Mesh};
    use fsm_mesh_controller_core::constants::DEFAULT_TRUST_DOMAIN;
    use fsm_mesh_controller_k8s_api as k8s;

    async fn mesh() -> Mesh {
        let mesh = Mesh::new().await;
        mesh.permissive();
        mesh.apply_cluster(namespace("ns"));
        mesh.apply(service("ns", "b", "http", 80));
        mesh.apply(endpoints("ns", "b", &["10.0.0.2"], "http", 80));
        mesh.apply(pod("ns", "a-0", "a", "a", "10.0.0.1", "uuid-a"));
        mesh.apply(pod("ns", "b-0", "b", "b", "10.0.0.2", "uuid-b"));
        mesh
    }

    fn controller(mesh: &Mesh) -> Controller {
        Controller::new(mesh.pool.clone(), mesh.broker.clone(), ProxyKind::Sidecar)
    }

    async fn settle(ctrl: &mut Controller) {
        while let Some(res) = ctrl.jobs.join_next().await {
            res.expect("rebuild must not panic");
        }
    }

    #[tokio::test]
    async fn workloads_are_registered_and_published() {
        let mesh = mesh().await;
        let mut ctrl = controller(&mesh);

        assert_eq!(ctrl.reconcile().await, 0);
        settle(&mut ctrl).await;

        let registry = &mesh.pool.context().registry;
        assert_eq!(registry.count(), 2);
        for uuid in ["uuid-a", "uuid-b"] {
            let proxy = registry.get_connected(uuid).expect("registered proxy");
            assert!(mesh.published(&proxy).is_some(), "{proxy} was not published");
        }
    }

    #[tokio::test]
    async fn deleted_workloads_are_unregistered() {
        let mesh = mesh().await;
        let mut ctrl = controller(&mesh);
        ctrl.reconcile().await;
        settle(&mut ctrl).await;
        let registry = &mesh.pool.context().registry;
        let a = registry.get_connected("uuid-a").expect("registered proxy");

        mesh.delete::<k8s::Pod>("ns", "a-0");
        assert_eq!(ctrl.reconcile().await, 1);
        settle(&mut ctrl).await;

        assert!(registry.get_connected("uuid-a").is_none());
        assert_eq!(registry.count(), 1);
        assert!(mesh.repo.codebase(&a.codebase()).is_none());
        assert!(mesh
            .pool
            .context()
            .certs
            .get_certificate(&a.identity().to_principal(DEFAULT_TRUST_DOMAIN))
            .is_none());
    }

    #[tokio::test]
    async fn proxies_changing_identity_are_rejected() {
        let mesh = mesh().await;
        let mut ctrl = controller(&mesh);
        ctrl.reconcile().await;
        settle(&mut ctrl).await;

        mesh.apply(pod("ns", "a-0", "a", "other", "10.0.0.1", "uuid-a"));
        assert_eq!(ctrl.reconcile().await, 0);
        settle(&mut ctrl).await;
        assert!(mesh.pool.context().registry.get_connected("uuid-a").is_none());

        // The next pass registers the workload under its new identity.
        ctrl.reconcile().await;
        settle(&mut ctrl).await;
        let proxy = mesh
            .pool
            .context()
            .registry
            .get_connected("uuid-a")
            .expect("registered proxy");
        assert_eq!(proxy.identity().name(), "other");
    }

    #[tokio::test]
    async fn changes_shorten_the_window() {
        let mesh = Mesh::new().await;
        let ctrl = controller(&mesh)
            .with_windows(Duration::from_secs(40), Duration::from_secs(10));
        let mut window = Window::default();

        assert_eq!(ctrl.next_window(&mut window, 0), Duration::from_secs(40));

        assert!(ctrl.changed(&mut window));
        assert!(!ctrl.changed(&mut window));
        assert_eq!(ctrl.next_window(&mut window, 0), Duration::from_secs(10));
        // A change during the short window is confirmed by one more short window.
        assert_eq!(ctrl.next_window(&mut window, 0), Duration::from_secs(10));
        assert_eq!(ctrl.next_window(&mut window, 0), Duration::from_secs(40));

        assert_eq!(ctrl.next_window(&mut window, 1), Duration::from_secs(10));
        window.not_ready = true;
        assert_eq!(ctrl.next_window(&mut window, 0), Duration::from_secs(10));
        assert_eq!(ctrl.next_window(&mut window, 0), Duration::from_secs(40));
    }

    #[tokio::test]
    async fn shutdown_waits_for_rebuilds() {
        let mesh = mesh().await;
        let (signal, watch) = drain::channel();
        let task = tokio::spawn(controller(&mesh).run(watch));

        let registry = mesh.pool.context().registry.clone();
        let repo = mesh.repo.clone();
        time::timeout(Duration::from_secs(10), async move {
            loop {
                let published = registry
                    .get_connected("uuid-a")
                    .is_some_and(|proxy| repo.codebase(&proxy.codebase()).is_some());
                if published {
                    return;
                }
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("proxy must be published");

        signal.drain().await;
        task.await.expect("controller must not panic");
    }
}
