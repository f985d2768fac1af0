use super::Generator;
use std::net::IpAddr;

impl Generator<'_> {
    /// Resolves the cloud services synced into the proxy's namespace locally.
    pub(super) fn cloud_connector(&mut self, namespace: &str) {
        let config = self.catalog.configurator();
        if !config.is_local_dns_proxy_enabled() {
            return;
        }
        let generate_ipv6 = config.local_dns_proxy().generate_ipv6_based_on_ipv4;
        for (name, mut ips) in self.catalog.get_cloud_dns_entries(namespace) {
            ips.sort();
            let addrs = ips
                .into_iter()
                .flat_map(|ip| with_mapped_ipv6(ip, generate_ipv6))
                .collect::<Vec<_>>();
            self.doc.add_dns_entry(&name, addrs);
        }
    }

    /// Adds the statically configured DNS entries. A configured entry replaces any
    /// addresses resolved for the same name.
    pub(super) fn dns_resolve_db(&mut self) {
        let config = self.catalog.configurator();
        if !config.is_local_dns_proxy_enabled() {
            return;
        }
        let dns = config.local_dns_proxy();
        for entry in &dns.db {
            let mut addrs = Vec::with_capacity(entry.ips.len() * 2);
            for ip in &entry.ips {
                if !ip.ipv4.is_empty() {
                    addrs.push(ip.ipv4.clone());
                }
                match ip.ipv6.as_deref().filter(|v6| !v6.is_empty()) {
                    Some(ipv6) => addrs.push(ipv6.to_string()),
                    None if dns.generate_ipv6_based_on_ipv4 => {
                        if let Ok(IpAddr::V4(v4)) = ip.ipv4.parse::<IpAddr>() {
                            addrs.push(v4.to_ipv6_mapped().to_string());
                        }
                    }
                    None => {}
                }
            }
            self.doc.dns_resolve_db.insert(entry.dn.clone(), addrs);
        }
    }
}

/// The address itself, followed by its IPv4-mapped IPv6 form when `generate` is set.
pub(super) fn with_mapped_ipv6(ip: IpAddr, generate: bool) -> Vec<String> {
    match ip {
        IpAddr::V4(v4) if generate => vec![v4.to_string(), v4.to_ipv6_mapped().to_string()],
        ip => vec![ip.to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_addresses_gain_a_mapped_form() {
        let ip = "10.1.2.3".parse().unwrap();
        assert_eq!(with_mapped_ipv6(ip, false), vec!["10.1.2.3"]);
        assert_eq!(
            with_mapped_ipv6(ip, true),
            vec!["10.1.2.3".to_string(), "::ffff:10.1.2.3".to_string()]
        );

        let ip = "fd00::1".parse().unwrap();
        assert_eq!(with_mapped_ipv6(ip, true), vec!["fd00::1"]);
    }
}
