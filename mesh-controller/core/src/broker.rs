//! An in-process pub/sub bus connecting resource watches to proxy
//! reconciliation.
//!
//! Each [`Topic`] is backed by a bounded `tokio::sync::broadcast` channel.
//! Publishing never blocks: a subscriber that falls behind observes a lag,
//! which callers treat as "something changed".

use crate::certificate::Certificate;
use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use std::{fmt, sync::Arc};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;
const PROXY_CHANNEL_CAPACITY: usize = 16;

/// The closed set of topics.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Broadcast to every proxy.
    ProxyUpdate,

    /// Addressed to a single proxy by UUID.
    Proxy(String),
    CertificateRotated,
    PodAdded,
    PodDeleted,
    PolicyKindChanged,
}

/// A typed message published on one [`Topic`].
#[derive(Clone, Debug)]
pub enum Message {
    ProxyUpdate(ResourceChange),
    Proxy { uuid: String, change: ResourceChange },
    CertificateRotated(CertificateRotated),
    PodAdded(PodRef),
    PodDeleted(PodRef),
    PolicyKindChanged(ResourceChange),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Added,
    Updated,
    Deleted,
}

/// The kinds of watched resources.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Namespace,
    Pod,
    Service,
    Endpoints,
    Secret,
    VirtualMachine,
    MeshConfig,
    TrafficSplit,
    HttpRouteGroup,
    TcpRoute,
    TrafficTarget,
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
    ServiceImport,
    ServiceExport,
    GlobalTrafficPolicy,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceChange {
    pub kind: ResourceKind,
    pub event: EventKind,
    pub namespace: Option<String>,
    pub name: String,
}

/// A pod (or virtual machine) carrying a proxy UUID label.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
    pub uuid: String,
}

/// Emitted when a certificate is issued again or released.
#[derive(Clone, Debug)]
pub struct CertificateRotated {
    pub cn_prefix: String,

    /// `None` when the certificate was released.
    pub certificate: Option<Arc<Certificate>>,
}

/// An event received by a single proxy's subscription.
#[derive(Clone, Debug)]
pub enum ProxyEvent {
    /// A change broadcast to every proxy.
    Update(ResourceChange),

    /// A change addressed to this proxy's UUID.
    Addressed(ResourceChange),
    CertificateRotated(CertificateRotated),

    /// Messages were dropped because the subscriber fell behind.
    Lagged,
}

/// The pub/sub handle shared by publishers and subscribers.
#[derive(Debug)]
pub struct Broker {
    proxy_updates: broadcast::Sender<ResourceChange>,
    proxies: Mutex<HashMap<String, broadcast::Sender<ResourceChange>>>,
    certificates: broadcast::Sender<CertificateRotated>,
    pods: broadcast::Sender<PodEvent>,
    kinds: broadcast::Sender<ResourceChange>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PodEvent {
    Added(PodRef),
    Deleted(PodRef),
}

/// The receiving side of a proxy's subscription.
///
/// Certificate events are filtered to those whose common name belongs to the
/// subscribing service account.
#[derive(Debug)]
pub struct ProxySubscription {
    updates: broadcast::Receiver<ResourceChange>,
    direct: broadcast::Receiver<ResourceChange>,
    certificates: broadcast::Receiver<CertificateRotated>,
    service_account: (String, String),
}

// === impl Topic ===

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProxyUpdate => f.write_str("proxy-update"),
            Self::Proxy(uuid) => write!(f, "proxy:{uuid}"),
            Self::CertificateRotated => f.write_str("certificate-rotated"),
            Self::PodAdded => f.write_str("pod-added"),
            Self::PodDeleted => f.write_str("pod-deleted"),
            Self::PolicyKindChanged => f.write_str("policy-kind-changed"),
        }
    }
}

// === impl Message ===

impl Message {
    pub fn topic(&self) -> Topic {
        match self {
            Self::ProxyUpdate(_) => Topic::ProxyUpdate,
            Self::Proxy { uuid, .. } => Topic::Proxy(uuid.clone()),
            Self::CertificateRotated(_) => Topic::CertificateRotated,
            Self::PodAdded(_) => Topic::PodAdded,
            Self::PodDeleted(_) => Topic::PodDeleted,
            Self::PolicyKindChanged(_) => Topic::PolicyKindChanged,
        }
    }
}

// === impl ResourceKind ===

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Namespace => "namespace",
            Self::Pod => "pod",
            Self::Service => "service",
            Self::Endpoints => "endpoints",
            Self::Secret => "secret",
            Self::VirtualMachine => "virtualmachine",
            Self::MeshConfig => "meshconfig",
            Self::TrafficSplit => "trafficsplit",
            Self::HttpRouteGroup => "httproutegroup",
            Self::TcpRoute => "tcproute",
            Self::TrafficTarget => "traffictarget",
            Self::AccessControl => "accesscontrol",
            Self::AccessCert => "accesscert",
            Self::IngressBackend => "ingressbackend",
            Self::Egress => "egress",
            Self::EgressGateway => "egressgateway",
            Self::Retry => "retry",
            Self::UpstreamTrafficSetting => "upstreamtrafficsetting",
            Self::Isolation => "isolation",
            Self::TrafficWarmup => "trafficwarmup",
            Self::Plugin => "plugin",
            Self::PluginChain => "pluginchain",
            Self::PluginConfig => "pluginconfig",
            Self::ServiceImport => "serviceimport",
            Self::ServiceExport => "serviceexport",
            Self::GlobalTrafficPolicy => "globaltrafficpolicy",
        }
    }

    /// Plugin resources also change the shared plugin set.
    pub fn is_plugin(&self) -> bool {
        matches!(self, Self::Plugin | Self::PluginChain | Self::PluginConfig)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl ResourceChange ===

impl ResourceChange {
    pub fn new(kind: ResourceKind, event: EventKind, namespace: Option<&str>, name: &str) -> Self {
        Self {
            kind,
            event,
            namespace: namespace.map(ToString::to_string),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ResourceChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let event = match self.event {
            EventKind::Added => "added",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
        };
        match &self.namespace {
            Some(ns) => write!(f, "{}-{} {}/{}", self.kind, event, ns, self.name),
            None => write!(f, "{}-{} {}", self.kind, event, self.name),
        }
    }
}

// === impl Broker ===

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            proxy_updates: broadcast::channel(CHANNEL_CAPACITY).0,
            proxies: Default::default(),
            certificates: broadcast::channel(CHANNEL_CAPACITY).0,
            pods: broadcast::channel(CHANNEL_CAPACITY).0,
            kinds: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Publishes a message. Messages without subscribers are dropped.
    pub fn publish(&self, msg: Message) {
        tracing::trace!(topic = %msg.topic(), "Publishing");
        // A send error only means that nobody is subscribed.
        match msg {
            Message::ProxyUpdate(change) => {
                let _ = self.proxy_updates.send(change);
            }
            Message::Proxy { uuid, change } => {
                if let Some(tx) = self.proxies.lock().get(&uuid) {
                    let _ = tx.send(change);
                }
            }
            Message::CertificateRotated(rotated) => {
                let _ = self.certificates.send(rotated);
            }
            Message::PodAdded(pod) => {
                let _ = self.pods.send(PodEvent::Added(pod));
            }
            Message::PodDeleted(pod) => {
                let _ = self.pods.send(PodEvent::Deleted(pod));
            }
            Message::PolicyKindChanged(change) => {
                let _ = self.kinds.send(change);
            }
        }
    }

    pub fn subscribe_proxy_updates(&self) -> broadcast::Receiver<ResourceChange> {
        self.proxy_updates.subscribe()
    }

    pub fn subscribe_pods(&self) -> broadcast::Receiver<PodEvent> {
        self.pods.subscribe()
    }

    pub fn subscribe_policy_kinds(&self) -> broadcast::Receiver<ResourceChange> {
        self.kinds.subscribe()
    }

    pub fn subscribe_certificates(&self) -> broadcast::Receiver<CertificateRotated> {
        self.certificates.subscribe()
    }

    /// Subscribes a proxy to broadcast updates, to messages addressed to its
    /// UUID, and to rotations of its service account's certificates.
    pub fn subscribe_proxy(
        &self,
        uuid: &str,
        service_account: &str,
        namespace: &str,
    ) -> ProxySubscription {
        let direct = self
            .proxies
            .lock()
            .entry(uuid.to_string())
            .or_insert_with(|| broadcast::channel(PROXY_CHANNEL_CAPACITY).0)
            .subscribe();
        ProxySubscription {
            updates: self.proxy_updates.subscribe(),
            direct,
            certificates: self.certificates.subscribe(),
            service_account: (service_account.to_string(), namespace.to_string()),
        }
    }

    /// Tears down the per-proxy topic.
    pub fn unsubscribe_proxy(&self, uuid: &str) {
        self.proxies.lock().remove(uuid);
    }

    pub fn proxy_subscriber_count(&self) -> usize {
        self.proxies.lock().len()
    }
}

// === impl ProxySubscription ===

impl ProxySubscription {
    /// Waits for the next event relevant to this proxy. Returns `None` once
    /// the broker is gone or the proxy was unsubscribed.
    pub async fn recv(&mut self) -> Option<ProxyEvent> {
        loop {
            let res = tokio::select! {
                res = self.updates.recv() => res.map(ProxyEvent::Update),
                res = self.direct.recv() => res.map(ProxyEvent::Addressed),
                res = self.certificates.recv() => res.map(ProxyEvent::CertificateRotated),
            };
            match res {
                Ok(ProxyEvent::CertificateRotated(rotated)) => {
                    let (name, namespace) = &self.service_account;
                    if cn_belongs_to(&rotated.cn_prefix, name, namespace) {
                        return Some(ProxyEvent::CertificateRotated(rotated));
                    }
                }
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => return Some(ProxyEvent::Lagged),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Whether the first two labels of a common name are `<name>.<namespace>`.
fn cn_belongs_to(cn: &str, name: &str, namespace: &str) -> bool {
    let mut labels = cn.split('.');
    labels.next() == Some(name) && labels.next() == Some(namespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(name: &str) -> ResourceChange {
        ResourceChange::new(ResourceKind::Service, EventKind::Updated, Some("ns"), name)
    }

    #[tokio::test]
    async fn proxy_subscription_receives_broadcast_and_direct() {
        let broker = Broker::new();
        let mut sub = broker.subscribe_proxy("uuid-1", "bookbuyer", "bookstore");

        broker.publish(Message::ProxyUpdate(change("a")));
        match sub.recv().await {
            Some(ProxyEvent::Update(c)) => assert_eq!(c.name, "a"),
            other => panic!("unexpected event: {other:?}"),
        }

        broker.publish(Message::Proxy {
            uuid: "uuid-2".to_string(),
            change: change("ignored"),
        });
        broker.publish(Message::Proxy {
            uuid: "uuid-1".to_string(),
            change: change("b"),
        });
        match sub.recv().await {
            Some(ProxyEvent::Addressed(c)) => assert_eq!(c.name, "b"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn certificate_events_are_filtered_by_service_account() {
        let broker = Broker::new();
        let mut sub = broker.subscribe_proxy("uuid-1", "bookbuyer", "bookstore");

        broker.publish(Message::CertificateRotated(CertificateRotated {
            cn_prefix: "bookthief.bookstore.cluster.local".to_string(),
            certificate: None,
        }));
        broker.publish(Message::CertificateRotated(CertificateRotated {
            cn_prefix: "bookbuyer.bookstore.cluster.local".to_string(),
            certificate: None,
        }));

        match sub.recv().await {
            Some(ProxyEvent::CertificateRotated(r)) => {
                assert_eq!(r.cn_prefix, "bookbuyer.bookstore.cluster.local")
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn topics_have_stable_names() {
        assert_eq!(Topic::ProxyUpdate.to_string(), "proxy-update");
        assert_eq!(Topic::Proxy("abc".to_string()).to_string(), "proxy:abc");
        let msg = Message::PodDeleted(PodRef {
            namespace: "ns".to_string(),
            name: "pod".to_string(),
            uuid: "abc".to_string(),
        });
        assert_eq!(msg.topic(), Topic::PodDeleted);
    }

    #[test]
    fn unsubscribing_drops_the_proxy_topic() {
        let broker = Broker::new();
        let _sub = broker.subscribe_proxy("uuid-1", "a", "ns");
        assert_eq!(broker.proxy_subscriber_count(), 1);
        broker.unsubscribe_proxy("uuid-1");
        assert_eq!(broker.proxy_subscriber_count(), 0);
    }
}
