use crate::{
    certificate, core,
    index::{self, metrics::IndexMetrics, ClusterInfo},
    k8s::{
        self, config::MeshConfig, machine::VirtualMachine, multicluster, plugin, policy, smi,
    },
    repo::{self, RepoClient, Repository},
    sidecar::{
        JobContext, JobPool, KubeProxyServiceMapper, PluginSet, ProxyKind, ProxyMetrics,
        ProxyRegistry,
    },
    status, version,
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::{runtime::watcher, Client, Resource};
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, sync::Arc};
use tokio::{sync::mpsc, time::Duration};
use tracing::{info_span, Instrument};

// The maximum number of status patches to buffer before updates are dropped. Dropped updates are
// resent the next time the policy is indexed.
const STATUS_UPDATE_QUEUE_SIZE: usize = 10_000;

#[derive(Debug, Parser)]
#[clap(name = "fsm-controller", about = "A service mesh sidecar configuration controller")]
pub struct Args {
    #[clap(long, default_value = "fsm=info,warn", env = "FSM_CONTROLLER_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Namespaces labeled `flomesh.io/monitored-by=<mesh-name>` join the mesh.
    #[clap(long, default_value = "fsm", env = "FSM_MESH_NAME")]
    mesh_name: String,

    #[clap(long, default_value = "fsm-system", env = "FSM_NAMESPACE")]
    fsm_namespace: String,

    #[clap(long, default_value = "fsm-mesh-config", env = "FSM_MESH_CONFIG_NAME")]
    mesh_config_name: String,

    #[clap(long, default_value = core::constants::DEFAULT_TRUST_DOMAIN, env = "FSM_TRUST_DOMAIN")]
    trust_domain: String,

    /// Host of the script repository.
    #[clap(long, default_value = "127.0.0.1", env = "FSM_REPO_ADDR")]
    repo_addr: String,

    #[clap(long, default_value = "6060", env = "FSM_REPO_PORT")]
    repo_port: u16,

    #[clap(long, value_enum, default_value = "controller", env = "FSM_MODE")]
    mode: Mode,

    #[clap(long, default_value = "0.0.0.0:9091")]
    version_addr: SocketAddr,

    /// The number of proxy rebuilds that may run at once.
    #[clap(long, default_value_t = core::constants::DEFAULT_WORKER_POOL_SIZE)]
    workers: usize,

    #[clap(long, default_value = "5000")]
    patch_timeout_ms: u64,

    #[clap(long, default_value = "60")]
    cert_rotation_interval_secs: u64,
}

/// The role of the process, which decides the kind of proxies it configures.
#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    /// Configures mesh sidecars.
    Controller,
    /// Configures gateway proxies.
    Gateway,
    /// Configures sidecars whose traffic is redirected by an interceptor.
    Interceptor,
}

// === impl Mode ===

impl Mode {
    pub fn proxy_kind(self) -> ProxyKind {
        match self {
            Self::Controller | Self::Interceptor => ProxyKind::Sidecar,
            Self::Gateway => ProxyKind::Gateway,
        }
    }
}

// === impl Args ===

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            mesh_name,
            fsm_namespace,
            mesh_config_name,
            trust_domain,
            repo_addr,
            repo_port,
            mode,
            version_addr,
            workers,
            patch_timeout_ms,
            cert_rotation_interval_secs,
        } = self;

        let cluster_info = Arc::new(ClusterInfo {
            trust_domain: trust_domain.clone(),
            fsm_namespace: fsm_namespace.clone(),
            mesh_name,
            mesh_config_name: mesh_config_name.clone(),
        });

        let broker = Arc::new(core::broker::Broker::new());
        let (updates_tx, updates_rx) = mpsc::channel(STATUS_UPDATE_QUEUE_SIZE);
        let status_sink = Arc::new(core::status::StatusSink::new(updates_tx));
        let index = index::Index::shared(cluster_info, broker.clone(), status_sink);

        let mut prom = <Registry>::with_prefix("fsm");
        let status_metrics =
            status::ControllerMetrics::register(prom.sub_registry_with_prefix("resource_status"));
        let proxy_metrics = ProxyMetrics::register(&mut prom);
        let indexes = IndexMetrics::register(index.clone(), &mut prom).shared();
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Spawn resource watches.

        let namespaces = runtime.watch_all::<k8s::Namespace>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(indexes.clone(), namespaces)
                .instrument(info_span!("namespaces")),
        );

        let mesh_configs = runtime.watch_namespaced::<MeshConfig>(
            fsm_namespace,
            watcher::Config::default().fields(&format!("metadata.name={mesh_config_name}")),
        );
        tokio::spawn(
            kubert::index::namespaced(index.clone(), mesh_configs)
                .instrument(info_span!("meshconfigs")),
        );

        let services = runtime.watch_all::<k8s::Service>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(indexes.clone(), services)
                .instrument(info_span!("services")),
        );

        let endpoints = runtime.watch_all::<k8s::Endpoints>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(indexes.clone(), endpoints)
                .instrument(info_span!("endpoints")),
        );

        let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(indexes.clone(), pods).instrument(info_span!("pods")),
        );

        let secrets = runtime.watch_all::<k8s::Secret>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(indexes.clone(), secrets).instrument(info_span!("secrets")),
        );

        let traffic_splits = runtime.watch_all::<smi::TrafficSplit>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(indexes.clone(), traffic_splits)
                .instrument(info_span!("trafficsplits")),
        );

        let http_route_groups =
            runtime.watch_all::<smi::HttpRouteGroup>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(indexes.clone(), http_route_groups)
                .instrument(info_span!("httproutegroups")),
        );

        let tcp_routes = runtime.watch_all::<smi::TcpRoute>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(indexes.clone(), tcp_routes)
                .instrument(info_span!("tcproutes")),
        );

        let traffic_targets = runtime.watch_all::<smi::TrafficTarget>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(indexes.clone(), traffic_targets)
                .instrument(info_span!("traffictargets")),
        );

        let access_controls =
            runtime.watch_all::<policy::AccessControl>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(indexes.clone(), access_controls)
                .instrument(info_span!("accesscontrols")),
        );

        let access_certs = runtime.watch_all::<policy::AccessCert>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(indexes.clone(), access_certs)
                .instrument(info_span!("accesscerts")),
        );

        let ingress_backends =
            runtime.watch_all::<policy::IngressBackend>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(indexes.clone(), ingress_backends)
                .instrument(info_span!("ingressbackends")),
        );

        let egresses = runtime.watch_all::<policy::Egress>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(indexes.clone(), egresses)
                .instrument(info_span!("egresses")),
        );

        let egress_gateways =
            runtime.watch_all::<policy::EgressGateway>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(indexes.clone(), egress_gateways)
                .instrument(info_span!("egressgateways")),
        );

        let retries = runtime.watch_all::<policy::Retry>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(indexes.clone(), retries).instrument(info_span!("retries")),
        );

        let upstream_traffic_settings =
            runtime.watch_all::<policy::UpstreamTrafficSetting>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(indexes.clone(), upstream_traffic_settings)
                .instrument(info_span!("upstreamtrafficsettings")),
        );

        let isolations = runtime.watch_all::<policy::Isolation>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(indexes.clone(), isolations)
                .instrument(info_span!("isolations")),
        );

        let traffic_warmups =
            runtime.watch_all::<policy::TrafficWarmup>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(indexes.clone(), traffic_warmups)
                .instrument(info_span!("trafficwarmups")),
        );

        // Plugins, virtual machines and multicluster resources are optional installs.

        let client = runtime.client();
        if api_resource_exists::<plugin::Plugin>(&client).await {
            let plugins = runtime.watch_all::<plugin::Plugin>(watcher::Config::default());
            tokio::spawn(
                kubert::index::cluster(indexes.clone(), plugins)
                    .instrument(info_span!("plugins")),
            );

            let plugin_chains =
                runtime.watch_all::<plugin::PluginChain>(watcher::Config::default());
            tokio::spawn(
                kubert::index::namespaced(indexes.clone(), plugin_chains)
                    .instrument(info_span!("pluginchains")),
            );

            let plugin_configs =
                runtime.watch_all::<plugin::PluginConfig>(watcher::Config::default());
            tokio::spawn(
                kubert::index::namespaced(indexes.clone(), plugin_configs)
                    .instrument(info_span!("pluginconfigs")),
            );
        } else {
            tracing::warn!("plugins.plugin.flomesh.io resource kind not found, skipping watches");
        }

        if api_resource_exists::<VirtualMachine>(&client).await {
            let vms = runtime.watch_all::<VirtualMachine>(watcher::Config::default());
            tokio::spawn(
                kubert::index::namespaced(indexes.clone(), vms)
                    .instrument(info_span!("virtualmachines")),
            );
        } else {
            tracing::warn!(
                "virtualmachines.machine.flomesh.io resource kind not found, skipping watches"
            );
        }

        if api_resource_exists::<multicluster::ServiceImport>(&client).await {
            let imports =
                runtime.watch_all::<multicluster::ServiceImport>(watcher::Config::default());
            tokio::spawn(
                kubert::index::namespaced(indexes.clone(), imports)
                    .instrument(info_span!("serviceimports")),
            );

            let exports =
                runtime.watch_all::<multicluster::ServiceExport>(watcher::Config::default());
            tokio::spawn(
                kubert::index::namespaced(indexes.clone(), exports)
                    .instrument(info_span!("serviceexports")),
            );

            let global_traffic_policies =
                runtime.watch_all::<multicluster::GlobalTrafficPolicy>(watcher::Config::default());
            tokio::spawn(
                kubert::index::namespaced(indexes, global_traffic_policies)
                    .instrument(info_span!("globaltrafficpolicies")),
            );
        } else {
            tracing::warn!("serviceimports.flomesh.io resource kind not found, skipping watches");
        }

        // Spawn the status writer.
        let status_controller = status::Controller::new(
            client,
            updates_rx,
            Duration::from_millis(patch_timeout_ms),
            status_metrics,
        );
        tokio::spawn(
            status_controller
                .run()
                .instrument(info_span!("status_controller")),
        );

        let certs = Arc::new(certificate::Manager::new(trust_domain, broker.clone())?);
        tokio::spawn(
            certs
                .clone()
                .rotate(
                    Duration::from_secs(cert_rotation_interval_secs),
                    runtime.shutdown_handle(),
                )
                .instrument(info_span!("certificates")),
        );

        let drain = runtime.shutdown_handle();
        tokio::spawn(async move {
            if let Err(error) = version::serve(version_addr, drain).await {
                tracing::error!(%error, "Version server failed");
            }
        });

        // Proxy documents derive from the base codebase, so it must be in place before the
        // first rebuild.
        let repo: Arc<dyn Repository> = Arc::new(RepoClient::new(&repo_addr, repo_port)?);
        repo::wait_until_up(&*repo).await;
        repo::restore(&*repo).await?;

        let pool = JobPool::with_workers(
            JobContext {
                index,
                certs,
                repo,
                registry: Arc::new(ProxyRegistry::default()),
                mapper: Arc::new(KubeProxyServiceMapper::default()),
                plugins: Arc::new(PluginSet::default()),
                metrics: proxy_metrics,
            },
            workers,
        );
        let controller = crate::sidecar::Controller::new(pool, broker, mode.proxy_kind());
        tokio::spawn(
            controller
                .run(runtime.shutdown_handle())
                .instrument(info_span!("proxies", ?mode)),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

async fn api_resource_exists<T>(client: &Client) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    client
        .list_api_group_resources(&T::api_version(&dt))
        .await
        .ok()
        .iter()
        .flat_map(|r| r.resources.iter())
        .any(|r| r.kind == T::kind(&dt))
}
