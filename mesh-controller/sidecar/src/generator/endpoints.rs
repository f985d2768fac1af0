use super::Generator;

/// Label of ingress sources when the document is pretty printed.
const INGRESS_SOURCE: &str = "Ingress/Accessor";

impl Generator<'_> {
    /// Lists the addresses the proxy accepts traffic from: every registered mesh proxy and
    /// every single-host inbound source range.
    pub(super) fn allowed_endpoints(&mut self) {
        let pretty = self.catalog.configurator().is_sidecar_pretty_config();
        let label = |s: String| if pretty { s } else { String::new() };

        let mut pending = Vec::new();
        for workload in self.catalog.list_proxy_workloads() {
            let Some(proxy) = self.registry.get_connected(&workload.proxy_uuid) else {
                pending.push(workload.to_string());
                continue;
            };
            let Some(addr) = proxy.addr() else {
                pending.push(workload.to_string());
                continue;
            };
            self.doc.allowed_endpoints.insert(
                addr.to_string(),
                label(format!("{}.{}", workload.namespace, workload.name)),
            );
        }

        if let Some(inbound) = self.doc.inbound.as_ref() {
            let sources = inbound
                .traffic_matches
                .values()
                .flat_map(|tm| tm.source_ip_ranges.keys())
                .map(|range| range.trim_end_matches("/32").to_string())
                .collect::<Vec<_>>();
            for source in sources {
                self.doc
                    .allowed_endpoints
                    .insert(source, label(INGRESS_SOURCE.to_string()));
            }
        }

        for workload in pending {
            self.not_ready(&format!("proxy of {workload} has no address yet"));
        }
    }
}
