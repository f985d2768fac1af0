//! Compiles the catalog's traffic policies for one proxy into its document.
//!
//! A [`Generator`] runs under the index read lock. It never fails: state that is not yet
//! complete (a cluster without endpoints, a registered proxy without an address) is left out
//! of the document and reported through [`Output::ready`] so that the proxy is rebuilt soon.

mod balance;
mod dns;
mod egress;
mod endpoints;
mod features;
mod forward;
mod inbound;
mod ingress;
mod outbound;

use crate::{
    document::{Certificate, PolicyDocument, RetryPolicy},
    plugin::PluginPolicies,
    Proxy, ProxyRegistry,
};
use fsm_mesh_controller_core::{
    certificate::Certificate as MeshCertificate, trafficpolicy as ir, MeshService,
    WeightedCluster,
};
use fsm_mesh_controller_k8s_index::{catalog::Workload, Catalog};
use std::collections::BTreeMap;

/// Upstream clusters referenced by outbound routes, with the retry policy of the first route
/// naming them.
type DependClusters = BTreeMap<String, Option<RetryPolicy>>;

pub(crate) struct Generator<'a> {
    catalog: &'a Catalog<'a>,
    proxy: &'a Proxy,
    registry: &'a ProxyRegistry,
    plugins: &'a PluginPolicies,
    services: &'a [MeshService],

    /// `<namespace>.svc.<trust-domain>` of the proxy; hosts ending in it prefer the route
    /// group of the proxy's own namespace.
    desired_suffix: String,
    doc: PolicyDocument,
    ready: bool,
}

#[derive(Debug)]
pub(crate) struct Output {
    pub(crate) doc: PolicyDocument,
    pub(crate) ready: bool,
}

// === impl Generator ===

impl<'a> Generator<'a> {
    pub(crate) fn new(
        catalog: &'a Catalog<'a>,
        proxy: &'a Proxy,
        registry: &'a ProxyRegistry,
        plugins: &'a PluginPolicies,
        services: &'a [MeshService],
    ) -> Self {
        Self {
            catalog,
            proxy,
            registry,
            plugins,
            services,
            desired_suffix: String::new(),
            doc: PolicyDocument::default(),
            ready: true,
        }
    }

    pub(crate) fn build(
        mut self,
        certificate: Option<&MeshCertificate>,
        plugin_set_version: &str,
    ) -> Output {
        let metadata = self.proxy.metadata();
        if !metadata.namespace.is_empty() {
            self.desired_suffix = format!(
                "{}.svc.{}",
                metadata.namespace,
                self.catalog.trust_domain()
            );
            self.doc.metrics = self.catalog.is_metrics_enabled(&metadata.namespace);
        }

        self.probes(&metadata);
        self.features();
        self.doc.certificate = certificate.map(Certificate::from_mesh);
        self.doc.chains = self.plugins.chains.clone();
        self.doc.plugin_set_version = plugin_set_version.to_string();

        self.inbound();
        self.outbound();
        self.egress();
        self.forward();
        self.cloud_connector(&metadata.namespace);
        self.balance();
        self.doc.reorder();
        self.allowed_endpoints();
        self.dns_resolve_db();

        Output {
            doc: self.doc,
            ready: self.ready,
        }
    }

    fn probes(&mut self, metadata: &Workload) {
        let probes = &mut self.doc.spec.probes;
        probes.startup_probes = metadata.startup_probes.clone();
        probes.liveness_probes = metadata.liveness_probes.clone();
        probes.readiness_probes = metadata.readiness_probes.clone();
    }

    fn not_ready(&mut self, reason: &str) {
        tracing::debug!(proxy = %self.proxy, reason, "Proxy configuration incomplete");
        self.ready = false;
    }
}

/// Records that a route sends traffic to `wc`. The first route naming a cluster decides its
/// retry policy.
fn depend_on(depend: &mut DependClusters, wc: &WeightedCluster, retry: Option<&ir::RetryPolicy>) {
    depend
        .entry(wc.cluster_name.to_string())
        .or_insert_with(|| retry.map(RetryPolicy::from));
}
