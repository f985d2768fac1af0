use crate::Index;
use fsm_mesh_controller_core::{Endpoint, IpNet};
use fsm_mesh_controller_k8s_api::ResourceExt;
use std::net::IpAddr;

/// Address ranges that are cut off from the mesh. Endpoints in these ranges are never returned
/// by the catalog and proxies in these ranges are not configured.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IsolationFilter {
    cidrs: Vec<IpNet>,
}

// === impl IsolationFilter ===

impl IsolationFilter {
    pub fn new(cidrs: impl IntoIterator<Item = IpNet>) -> Self {
        let mut cidrs = cidrs.into_iter().collect::<Vec<_>>();
        cidrs.sort();
        cidrs.dedup();
        Self { cidrs }
    }

    /// Collects the ranges of all Isolation resources. Invalid ranges are skipped.
    pub(crate) fn from_index(index: &Index) -> Self {
        let cidrs = index.isolations.iter().flat_map(|isolation| {
            let name = isolation.name_unchecked();
            isolation
                .spec
                .cidrs
                .iter()
                .filter_map(move |cidr| match cidr.parse::<IpNet>() {
                    Ok(net) => Some(net),
                    Err(error) => {
                        tracing::warn!(%error, isolation = %name, %cidr, "Ignoring invalid CIDR");
                        None
                    }
                })
        });
        Self::new(cidrs)
    }

    pub fn cidrs(&self) -> &[IpNet] {
        &self.cidrs
    }

    pub fn is_empty(&self) -> bool {
        self.cidrs.is_empty()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.cidrs.iter().any(|net| net.contains(&ip))
    }

    pub fn retain(&self, endpoints: &mut Vec<Endpoint>) {
        if !self.is_empty() {
            endpoints.retain(|ep| !self.contains(ep.ip));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{mk_index, mk_isolation};

    #[test]
    fn invalid_cidrs_are_skipped() {
        let mut index = mk_index();
        index.apply(mk_isolation("lockdown", &["10.0.0.0/8", "not-a-cidr", "192.168.1.0/24"]));

        let filter = IsolationFilter::from_index(&index);
        assert_eq!(filter.cidrs().len(), 2);
        assert!(filter.contains("10.1.2.3".parse().unwrap()));
        assert!(filter.contains("192.168.1.7".parse().unwrap()));
        assert!(!filter.contains("172.16.0.1".parse().unwrap()));
    }

    #[test]
    fn empty_filter_keeps_everything() {
        let filter = IsolationFilter::default();
        let mut endpoints = vec![Endpoint::new("10.0.0.1".parse().unwrap(), 80)];
        filter.retain(&mut endpoints);
        assert_eq!(endpoints.len(), 1);

        let filter = IsolationFilter::new(["10.0.0.0/8".parse().unwrap()]);
        filter.retain(&mut endpoints);
        assert!(endpoints.is_empty());
    }
}
