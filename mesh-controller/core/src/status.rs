use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use std::fmt;
use tokio::sync::mpsc;

pub const STATUS_COMMITTED: &str = "committed";
pub const STATUS_ERROR: &str = "error";
pub const REASON_COMMITTED: &str = "successfully committed by the system";

/// Policy kinds carrying a `{currentStatus, reason}` status.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PolicyKind {
    AccessControl,
    AccessCert,
    IngressBackend,
    Egress,
    EgressGateway,
    Retry,
    UpstreamTrafficSetting,
    Isolation,
    TrafficWarmup,
    Plugin,
    PluginChain,
    PluginConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PolicyRef {
    pub kind: PolicyKind,
    pub namespace: Option<String>,
    pub name: String,
}

/// A status change computed while compiling a policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusUpdate {
    pub target: PolicyRef,
    pub current_status: String,
    pub reason: String,
}

/// Forwards status updates to the status writer, suppressing repeats.
#[derive(Debug, Default)]
pub struct StatusSink {
    tx: Option<mpsc::Sender<StatusUpdate>>,
    last: Mutex<HashMap<PolicyRef, (String, String)>>,
}

// === impl PolicyRef ===

impl PolicyRef {
    pub fn namespaced(kind: PolicyKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster(kind: PolicyKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: None,
            name: name.into(),
        }
    }
}

impl fmt::Display for PolicyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{:?} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{:?} {}", self.kind, self.name),
        }
    }
}

// === impl StatusUpdate ===

impl StatusUpdate {
    pub fn committed(target: PolicyRef) -> Self {
        Self {
            target,
            current_status: STATUS_COMMITTED.to_string(),
            reason: REASON_COMMITTED.to_string(),
        }
    }

    pub fn error(target: PolicyRef, reason: impl Into<String>) -> Self {
        Self {
            target,
            current_status: STATUS_ERROR.to_string(),
            reason: reason.into(),
        }
    }
}

// === impl StatusSink ===

impl StatusSink {
    pub fn new(tx: mpsc::Sender<StatusUpdate>) -> Self {
        Self {
            tx: Some(tx),
            last: Default::default(),
        }
    }

    /// A sink that drops every update.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn send(&self, update: StatusUpdate) {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };

        {
            let mut last = self.last.lock();
            let current = (update.current_status.clone(), update.reason.clone());
            if last.get(&update.target) == Some(&current) {
                return;
            }
            last.insert(update.target.clone(), current);
        }

        if let Err(error) = tx.try_send(update) {
            tracing::warn!(%error, "Failed to queue status update");
            // Forget it so that the next compilation retries.
            let update = error.into_inner();
            self.last.lock().remove(&update.target);
        }
    }

    /// Forgets the last status of a deleted resource.
    pub fn forget(&self, target: &PolicyRef) {
        self.last.lock().remove(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repeated_updates_are_suppressed() {
        let (tx, mut rx) = mpsc::channel(8);
        let sink = StatusSink::new(tx);
        let target = PolicyRef::namespaced(PolicyKind::AccessControl, "ns", "acl");

        sink.send(StatusUpdate::committed(target.clone()));
        sink.send(StatusUpdate::committed(target.clone()));
        sink.send(StatusUpdate::error(target.clone(), "boom"));

        assert_eq!(
            rx.recv().await.unwrap(),
            StatusUpdate::committed(target.clone())
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            StatusUpdate::error(target, "boom")
        );
        assert!(rx.try_recv().is_err());
    }
}
