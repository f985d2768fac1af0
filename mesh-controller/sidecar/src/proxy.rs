use crate::BuildError;
use chrono::{DateTime, Utc};
use fsm_mesh_controller_core::{
    certificate::Certificate,
    constants::{STATS_KIND_HEADER, STATS_NAMESPACE_HEADER, STATS_NAME_HEADER, STATS_POD_HEADER},
    ServiceIdentity,
};
use fsm_mesh_controller_k8s_index::catalog::{Workload, WorkloadKind};
use fsm_mesh_controller_repo::SIDECAR_CODEBASE;
use parking_lot::RwLock;
use std::{
    collections::BTreeMap,
    fmt,
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc,
    },
};
use tokio::sync::{Mutex, MutexGuard};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ProxyKind {
    Sidecar,
    Gateway,
}

/// A connected proxy.
///
/// The identity is fixed when the proxy is registered. The workload metadata is refreshed on
/// every reconcile pass and must keep running as that identity.
#[derive(Debug)]
pub struct Proxy {
    uuid: String,
    kind: ProxyKind,
    identity: ServiceIdentity,
    connected_at: DateTime<Utc>,
    metadata: RwLock<Workload>,

    /// Rebuilds submitted but not yet holding the build lock.
    backlog: AtomicI32,
    deletion: AtomicBool,
    state: Mutex<BuildState>,
}

/// State owned by the proxy's rebuilds.
#[derive(Debug, Default)]
pub(crate) struct BuildState {
    /// Hash of the last published document.
    pub(crate) etag: u64,
    pub(crate) certificate: Option<Arc<Certificate>>,
}

/// A rebuild counted in its proxy's backlog until it takes the build lock or is dropped.
#[derive(Debug)]
pub(crate) struct Pending(Arc<Proxy>);

// === impl Proxy ===

impl Proxy {
    pub fn new(kind: ProxyKind, workload: Workload) -> Self {
        Self {
            uuid: workload.proxy_uuid.clone(),
            kind,
            identity: workload.identity(),
            connected_at: Utc::now(),
            metadata: RwLock::new(workload),
            backlog: AtomicI32::new(0),
            deletion: AtomicBool::new(false),
            state: Mutex::new(BuildState::default()),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn kind(&self) -> ProxyKind {
        self.kind
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn metadata(&self) -> Workload {
        self.metadata.read().clone()
    }

    pub fn workload_kind(&self) -> WorkloadKind {
        self.metadata.read().kind
    }

    /// Replaces the workload metadata, rejecting a workload running as another identity.
    pub fn record_metadata(&self, workload: Workload) -> Result<(), BuildError> {
        let found = workload.identity();
        if found != self.identity {
            return Err(BuildError::IdentityMismatch {
                proxy: self.uuid.clone(),
                expected: self.identity.clone(),
                found,
            });
        }
        *self.metadata.write() = workload;
        Ok(())
    }

    /// The address the proxy's workload is reached on. Virtual machines are reached on the
    /// machine address.
    pub fn addr(&self) -> Option<IpAddr> {
        let md = self.metadata.read();
        match md.kind {
            WorkloadKind::Pod => md.ip,
            WorkloadKind::VirtualMachine => md.machine_ip.or(md.ip),
        }
    }

    /// `<uuid>.<kind>.<name>.<namespace>`, naming the proxy's codebase.
    pub fn cn_prefix(&self) -> String {
        let kind = match self.kind {
            ProxyKind::Sidecar => "sidecar",
            ProxyKind::Gateway => "gateway",
        };
        format!("{}.{}.{}", self.uuid, kind, self.identity)
    }

    pub fn codebase(&self) -> String {
        format!("{SIDECAR_CODEBASE}/{}", self.cn_prefix())
    }

    pub fn has_backlog(&self) -> bool {
        self.backlog.load(Ordering::Acquire) > 0
    }

    pub fn mark_deletion(&self) {
        self.deletion.store(true, Ordering::Release);
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.deletion.load(Ordering::Acquire)
    }

    /// Counts a rebuild in the backlog, or returns `None` when a rebuild is already pending
    /// and will observe the same changes.
    pub(crate) fn enqueue(self: &Arc<Self>) -> Option<Pending> {
        self.backlog
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Pending(self.clone()))
    }

    /// Takes the build lock. The rebuild leaves the backlog once it holds the lock, so later
    /// changes queue another rebuild behind it.
    pub(crate) async fn begin_build(&self, pending: Pending) -> MutexGuard<'_, BuildState> {
        let state = self.state.lock().await;
        drop(pending);
        state
    }

    /// The hash of the last published document.
    pub async fn etag(&self) -> u64 {
        self.state.lock().await.etag
    }

    /// Headers identifying the workload in request metrics. A ReplicaSet owner is reported as
    /// the Deployment that owns it.
    pub fn stats_headers(&self) -> BTreeMap<&'static str, String> {
        const UNKNOWN: &str = "unknown";
        let md = self.metadata.read();
        let or_unknown = |s: &str| {
            if s.is_empty() {
                UNKNOWN.to_string()
            } else {
                s.to_string()
            }
        };

        let (mut kind, mut name) = md
            .owner
            .as_ref()
            .map(|(kind, name)| (or_unknown(kind), or_unknown(name)))
            .unwrap_or_else(|| (UNKNOWN.to_string(), UNKNOWN.to_string()));
        if kind == "ReplicaSet" {
            if let Some((deployment, _)) = name.rsplit_once('-') {
                kind = "Deployment".to_string();
                name = deployment.to_string();
            }
        }

        BTreeMap::from([
            (STATS_POD_HEADER, or_unknown(&md.name)),
            (STATS_NAMESPACE_HEADER, or_unknown(&md.namespace)),
            (STATS_KIND_HEADER, kind),
            (STATS_NAME_HEADER, name),
        ])
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let md = self.metadata.read();
        write!(f, "{}/{} ({})", md.namespace, md.name, self.uuid)
    }
}

// === impl Pending ===

impl Drop for Pending {
    fn drop(&mut self) {
        self.0.backlog.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use fsm_mesh_controller_k8s_api::Labels;

    pub(crate) fn workload(uuid: &str, name: &str, sa: &str, ip: &str) -> Workload {
        Workload {
            kind: WorkloadKind::Pod,
            proxy_uuid: uuid.to_string(),
            uid: format!("uid-{name}"),
            name: name.to_string(),
            namespace: "ns".to_string(),
            service_account: sa.to_string(),
            labels: Labels::default(),
            owner: None,
            ip: ip.parse().ok(),
            machine_ip: None,
            readiness_probes: vec![],
            liveness_probes: vec![],
            startup_probes: vec![],
        }
    }

    #[test]
    fn metadata_must_keep_the_identity() {
        let proxy = Proxy::new(
            ProxyKind::Sidecar,
            workload("uuid-1", "a-0", "sa-a", "10.0.0.1"),
        );
        assert_eq!(proxy.cn_prefix(), "uuid-1.sidecar.sa-a.ns");
        assert_eq!(proxy.codebase(), "/fsm/sidecars/uuid-1.sidecar.sa-a.ns");

        proxy
            .record_metadata(workload("uuid-1", "a-0", "sa-a", "10.0.0.9"))
            .expect("same identity");
        assert_eq!(proxy.addr(), "10.0.0.9".parse().ok());

        let err = proxy
            .record_metadata(workload("uuid-1", "a-0", "sa-b", "10.0.0.9"))
            .expect_err("identity changed");
        assert!(matches!(err, BuildError::IdentityMismatch { .. }));
    }

    #[test]
    fn virtual_machines_use_the_machine_address() {
        let mut vm = workload("uuid-vm", "vm-0", "sa-a", "10.0.0.1");
        vm.kind = WorkloadKind::VirtualMachine;
        vm.machine_ip = "192.168.1.10".parse().ok();
        let proxy = Proxy::new(ProxyKind::Sidecar, vm);
        assert_eq!(proxy.addr(), "192.168.1.10".parse().ok());
    }

    #[test]
    fn replica_sets_report_their_deployment() {
        let mut md = workload("uuid-1", "bookbuyer-5c9f-x2", "sa-a", "10.0.0.1");
        md.owner = Some(("ReplicaSet".to_string(), "bookbuyer-5c9f".to_string()));
        let proxy = Proxy::new(ProxyKind::Sidecar, md);
        let headers = proxy.stats_headers();
        assert_eq!(headers[STATS_POD_HEADER], "bookbuyer-5c9f-x2");
        assert_eq!(headers[STATS_NAMESPACE_HEADER], "ns");
        assert_eq!(headers[STATS_KIND_HEADER], "Deployment");
        assert_eq!(headers[STATS_NAME_HEADER], "bookbuyer");

        let mut md = workload("uuid-2", "db-0", "sa-a", "10.0.0.2");
        md.owner = Some(("StatefulSet".to_string(), "db".to_string()));
        let headers = Proxy::new(ProxyKind::Sidecar, md).stats_headers();
        assert_eq!(headers[STATS_KIND_HEADER], "StatefulSet");
        assert_eq!(headers[STATS_NAME_HEADER], "db");

        let headers = Proxy::new(
            ProxyKind::Sidecar,
            workload("uuid-3", "solo", "sa-a", "10.0.0.3"),
        )
        .stats_headers();
        assert_eq!(headers[STATS_KIND_HEADER], "unknown");
    }

    #[tokio::test]
    async fn queued_rebuilds_coalesce() {
        let proxy = Arc::new(Proxy::new(
            ProxyKind::Sidecar,
            workload("uuid-1", "a-0", "sa-a", "10.0.0.1"),
        ));

        let pending = proxy.enqueue().expect("first rebuild is queued");
        assert!(proxy.has_backlog());
        assert!(proxy.enqueue().is_none());

        let held = proxy.begin_build(pending).await;
        assert!(!proxy.has_backlog());
        // Changes seen while a build runs queue exactly one more.
        let next = proxy.enqueue().expect("rebuild behind the running build");
        assert!(proxy.enqueue().is_none());
        drop(held);

        drop(next);
        assert!(!proxy.has_backlog());
        assert!(proxy.enqueue().is_some());
    }
}
