use crate::Proxy;
use ahash::AHashMap as HashMap;
use fsm_mesh_controller_core::ServiceIdentity;
use parking_lot::RwLock;
use std::{net::IpAddr, sync::Arc};

/// Registered proxies, keyed by UUID.
#[derive(Debug, Default)]
pub struct ProxyRegistry {
    proxies: RwLock<HashMap<String, Arc<Proxy>>>,
}

// === impl ProxyRegistry ===

impl ProxyRegistry {
    /// Registers a proxy. A proxy already registered under the same UUID is returned
    /// unchanged and the new one is dropped.
    pub fn register(&self, proxy: Proxy) -> (Arc<Proxy>, bool) {
        let mut proxies = self.proxies.write();
        if let Some(existing) = proxies.get(proxy.uuid()) {
            return (existing.clone(), false);
        }
        let proxy = Arc::new(proxy);
        proxies.insert(proxy.uuid().to_string(), proxy.clone());
        tracing::debug!(%proxy, "Registered proxy");
        (proxy, true)
    }

    pub fn get_connected(&self, uuid: &str) -> Option<Arc<Proxy>> {
        self.proxies.read().get(uuid).cloned()
    }

    /// Visits registered proxies until `f` returns false.
    pub fn range(&self, mut f: impl FnMut(&Arc<Proxy>) -> bool) {
        for proxy in self.proxies.read().values() {
            if !f(proxy) {
                return;
            }
        }
    }

    pub fn list(&self) -> Vec<Arc<Proxy>> {
        self.proxies.read().values().cloned().collect()
    }

    pub fn unregister(&self, uuid: &str) -> Option<Arc<Proxy>> {
        let proxy = self.proxies.write().remove(uuid)?;
        tracing::debug!(%proxy, "Unregistered proxy");
        Some(proxy)
    }

    pub fn count(&self) -> usize {
        self.proxies.read().len()
    }

    /// Whether a proxy other than `uuid` runs as `identity`.
    pub fn shares_identity(&self, identity: &ServiceIdentity, uuid: &str) -> bool {
        self.proxies
            .read()
            .values()
            .any(|p| p.uuid() != uuid && p.identity() == identity)
    }

    /// The proxy reached on `addr`, if one is registered.
    pub fn get_by_addr(&self, addr: IpAddr) -> Option<Arc<Proxy>> {
        self.proxies
            .read()
            .values()
            .find(|p| p.addr() == Some(addr))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{proxy::tests::workload, ProxyKind};

    fn proxy(uuid: &str, sa: &str, ip: &str) -> Proxy {
        Proxy::new(ProxyKind::Sidecar, workload(uuid, &format!("{sa}-0"), sa, ip))
    }

    #[test]
    fn register_is_idempotent() {
        let registry = ProxyRegistry::default();
        let (first, created) = registry.register(proxy("uuid-1", "sa-a", "10.0.0.1"));
        assert!(created);
        let (second, created) = registry.register(proxy("uuid-1", "sa-a", "10.0.0.2"));
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.addr(), "10.0.0.1".parse().ok());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn lookups() {
        let registry = ProxyRegistry::default();
        registry.register(proxy("uuid-1", "sa-a", "10.0.0.1"));
        registry.register(proxy("uuid-2", "sa-a", "10.0.0.2"));
        registry.register(proxy("uuid-3", "sa-b", "10.0.0.3"));

        let found = registry.get_by_addr("10.0.0.2".parse().unwrap()).unwrap();
        assert_eq!(found.uuid(), "uuid-2");
        assert!(registry.get_by_addr("10.0.0.9".parse().unwrap()).is_none());

        let sa_a = ServiceIdentity::new("sa-a", "ns");
        assert!(registry.shares_identity(&sa_a, "uuid-1"));
        registry.unregister("uuid-2");
        assert!(!registry.shares_identity(&sa_a, "uuid-1"));

        let mut visited = 0;
        registry.range(|_| {
            visited += 1;
            false
        });
        assert_eq!(visited, 1);
        assert!(registry.get_connected("uuid-3").is_some());
        assert!(registry.unregister("uuid-2").is_none());
    }
}
